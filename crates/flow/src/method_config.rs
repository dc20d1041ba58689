// File: method_config.rs
// Purpose: the serializable unit a strategy attaches to a flow. Wraps exactly
// one `UiContainer` whose `action` and `method` were validated on the way in.
use crate::errors::{FlowError, Result};
use crate::ui::{UiContainer, UiNode, UiText};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use url::Url;

/// Method configuration of one strategy for one flow.
///
/// Serialized as `{action, method, nodes, messages?}`; `messages` is omitted
/// when empty. Deserialization fails when a required field is missing or
/// `action` is not an absolute URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UiContainer", into = "UiContainer")]
pub struct MethodConfig {
    container: UiContainer,
}

impl MethodConfig {
    /// Builds a config from its required fields.
    pub fn new(action: impl Into<String>, method: impl Into<String>, nodes: Vec<UiNode>) -> Result<Self> {
        let mut container = UiContainer::new(action, method);
        container.nodes = nodes;
        Self::try_from(container)
    }

    /// Builder with every field unset. `build` reports the first missing
    /// required field.
    pub fn builder() -> MethodConfigBuilder {
        MethodConfigBuilder::default()
    }

    pub fn action(&self) -> &str {
        &self.container.action
    }

    pub fn method(&self) -> &str {
        &self.container.method
    }

    pub fn nodes(&self) -> &[UiNode] {
        &self.container.nodes
    }

    pub fn messages(&self) -> &[UiText] {
        &self.container.messages
    }

    pub fn container(&self) -> &UiContainer {
        &self.container
    }

    pub fn into_container(self) -> UiContainer {
        self.container
    }

    pub fn with_message(mut self, message: UiText) -> Self {
        self.container.add_message(message);
        self
    }

    /// Replaces or appends a node, keyed by `(group, name)`.
    pub fn push_node(&mut self, node: UiNode) {
        self.container.push(node);
    }
}

impl TryFrom<UiContainer> for MethodConfig {
    type Error = FlowError;

    fn try_from(container: UiContainer) -> Result<Self> {
        validate_action(&container.action)?;
        if container.method.trim().is_empty() {
            return Err(FlowError::Validation("method config: method is required".into()));
        }
        Ok(Self { container })
    }
}

impl From<MethodConfig> for UiContainer {
    fn from(c: MethodConfig) -> Self {
        c.container
    }
}

fn validate_action(action: &str) -> Result<()> {
    if action.is_empty() {
        return Err(FlowError::Validation("method config: action is required".into()));
    }
    let url = Url::parse(action).map_err(|e| FlowError::Validation(format!("method config: action {:?}: {}", action, e)))?;
    if url.cannot_be_a_base() {
        return Err(FlowError::Validation(format!("method config: action {:?} is not an absolute URL", action)));
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct MethodConfigBuilder {
    action: Option<String>,
    method: Option<String>,
    nodes: Option<Vec<UiNode>>,
    messages: Vec<UiText>,
}

impl MethodConfigBuilder {
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn nodes(mut self, nodes: Vec<UiNode>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn message(mut self, message: UiText) -> Self {
        self.messages.push(message);
        self
    }

    pub fn build(self) -> Result<MethodConfig> {
        let action = self.action.ok_or_else(|| FlowError::Validation("method config: action is required".into()))?;
        let method = self.method.ok_or_else(|| FlowError::Validation("method config: method is required".into()))?;
        let nodes = self.nodes.ok_or_else(|| FlowError::Validation("method config: nodes are required".into()))?;
        let mut config = MethodConfig::new(action, method, nodes)?;
        for m in self.messages {
            config.container.add_message(m);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_reports_missing_nodes() {
        let err = MethodConfig::builder().action("https://example.org/self-service/recovery?flow=1")
                                         .method("POST")
                                         .build()
                                         .unwrap_err();
        match err {
            FlowError::Validation(msg) => assert!(msg.contains("nodes")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn relative_action_is_rejected() {
        assert!(MethodConfig::new("/self-service/recovery", "POST", vec![]).is_err());
    }

    #[test]
    fn messages_are_omitted_when_empty() {
        let c = MethodConfig::new("https://example.org/r", "POST", vec![]).unwrap();
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v, json!({"action": "https://example.org/r", "method": "POST", "nodes": []}));
    }

    #[test]
    fn deserialize_requires_nodes() {
        let raw = json!({"action": "https://example.org/r", "method": "POST"});
        assert!(serde_json::from_value::<MethodConfig>(raw).is_err());
    }

    #[test]
    fn method_case_is_kept() {
        let c = MethodConfig::new("https://example.org/r", "post", vec![]).unwrap();
        assert_eq!(c.method(), "post");
    }
}
