// File: ui.rs
// Purpose: rendering-agnostic form model exposed by every flow. Strategies
// contribute fragments; `UiContainer::merge` is the only way fragments are
// combined.
use crate::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::convert::TryFrom;
use std::fmt;

/// Group owned by the engine itself (csrf token and similar).
pub const DEFAULT_GROUP: &str = "default";

/// Name of the hidden input carrying the flow's csrf token.
pub const CSRF_TOKEN_NODE: &str = "csrf_token";

/// Well-known message ids.
pub mod text_ids {
    pub const INFO_NODE_LABEL_SUBMIT: u64 = 1_070_005;
    pub const INFO_RECOVERY_EMAIL_SENT: u64 = 1_060_002;
    pub const INFO_VERIFICATION_EMAIL_SENT: u64 = 1_080_001;
    pub const INFO_FLOW_COMPLETED: u64 = 1_000_001;
    pub const ERROR_VALIDATION_GENERIC: u64 = 4_000_001;
    pub const ERROR_INVALID_CREDENTIALS: u64 = 4_000_006;
    pub const ERROR_STRATEGY_REJECTED: u64 = 4_000_100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiNodeType {
    Input,
    Text,
    Image,
    Script,
}

impl fmt::Display for UiNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UiNodeType::Input => "input",
            UiNodeType::Text => "text",
            UiNodeType::Image => "image",
            UiNodeType::Script => "script",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Info,
    Error,
    Success,
}

/// A localized message, attached either to a node or to the whole form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiText {
    pub id: u64,
    pub text: String,
    #[serde(rename = "type")]
    pub severity: MessageSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonValue>,
}

impl UiText {
    pub fn new(id: u64, text: impl Into<String>, severity: MessageSeverity) -> Self {
        Self { id,
               text: text.into(),
               severity,
               context: None }
    }

    pub fn info(id: u64, text: impl Into<String>) -> Self {
        Self::new(id, text, MessageSeverity::Info)
    }

    pub fn error(id: u64, text: impl Into<String>) -> Self {
        Self::new(id, text, MessageSeverity::Error)
    }

    pub fn success(id: u64, text: impl Into<String>) -> Self {
        Self::new(id, text, MessageSeverity::Success)
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAttributes {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextAttributes {
    pub id: String,
    pub text: UiText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttributes {
    pub id: String,
    pub src: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptAttributes {
    pub id: String,
    pub src: String,
    pub integrity: String,
    pub nonce: String,
}

/// Attribute payload; the variant determines the node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "lowercase")]
pub enum UiNodeAttributes {
    Input(InputAttributes),
    Text(TextAttributes),
    Image(ImageAttributes),
    Script(ScriptAttributes),
}

impl UiNodeAttributes {
    pub fn node_type(&self) -> UiNodeType {
        match self {
            UiNodeAttributes::Input(_) => UiNodeType::Input,
            UiNodeAttributes::Text(_) => UiNodeType::Text,
            UiNodeAttributes::Image(_) => UiNodeType::Image,
            UiNodeAttributes::Script(_) => UiNodeType::Script,
        }
    }

    /// Input name, or the element id for non-input nodes.
    pub fn key_name(&self) -> &str {
        match self {
            UiNodeAttributes::Input(a) => &a.name,
            UiNodeAttributes::Text(a) => &a.id,
            UiNodeAttributes::Image(a) => &a.id,
            UiNodeAttributes::Script(a) => &a.id,
        }
    }
}

/// Merge key of a node: `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UiNodeKey {
    pub group: String,
    pub name: String,
}

impl fmt::Display for UiNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// One element of a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "UiNodeRepr", try_from = "UiNodeRepr")]
pub struct UiNode {
    pub group: String,
    pub attributes: UiNodeAttributes,
    pub messages: Vec<UiText>,
}

// Wire shape: carries an explicit `type` that must agree with the attributes.
#[derive(Serialize, Deserialize)]
struct UiNodeRepr {
    #[serde(rename = "type")]
    node_type: UiNodeType,
    group: String,
    attributes: UiNodeAttributes,
    #[serde(default)]
    messages: Vec<UiText>,
}

impl From<UiNode> for UiNodeRepr {
    fn from(n: UiNode) -> Self {
        UiNodeRepr { node_type: n.attributes.node_type(),
                     group: n.group,
                     attributes: n.attributes,
                     messages: n.messages }
    }
}

impl TryFrom<UiNodeRepr> for UiNode {
    type Error = String;

    fn try_from(r: UiNodeRepr) -> std::result::Result<Self, Self::Error> {
        if r.node_type != r.attributes.node_type() {
            return Err(format!("node type {} does not match {} attributes",
                               r.node_type,
                               r.attributes.node_type()));
        }
        Ok(UiNode { group: r.group,
                    attributes: r.attributes,
                    messages: r.messages })
    }
}

impl UiNode {
    pub fn new(group: impl Into<String>, attributes: UiNodeAttributes) -> Self {
        Self { group: group.into(),
               attributes,
               messages: Vec::new() }
    }

    pub fn input(group: impl Into<String>, name: impl Into<String>, input_type: impl Into<String>, value: Option<JsonValue>, required: bool) -> Self {
        Self::new(group,
                  UiNodeAttributes::Input(InputAttributes { name: name.into(),
                                                            input_type: input_type.into(),
                                                            value,
                                                            required,
                                                            disabled: false }))
    }

    pub fn text(group: impl Into<String>, id: impl Into<String>, text: UiText) -> Self {
        Self::new(group, UiNodeAttributes::Text(TextAttributes { id: id.into(), text }))
    }

    pub fn image(group: impl Into<String>, id: impl Into<String>, src: impl Into<String>, width: u32, height: u32) -> Self {
        Self::new(group,
                  UiNodeAttributes::Image(ImageAttributes { id: id.into(),
                                                            src: src.into(),
                                                            width,
                                                            height }))
    }

    pub fn script(group: impl Into<String>,
                  id: impl Into<String>,
                  src: impl Into<String>,
                  integrity: impl Into<String>,
                  nonce: impl Into<String>)
                  -> Self {
        Self::new(group,
                  UiNodeAttributes::Script(ScriptAttributes { id: id.into(),
                                                              src: src.into(),
                                                              integrity: integrity.into(),
                                                              nonce: nonce.into() }))
    }

    pub fn with_message(mut self, message: UiText) -> Self {
        self.messages.push(message);
        self
    }

    pub fn node_type(&self) -> UiNodeType {
        self.attributes.node_type()
    }

    pub fn key(&self) -> UiNodeKey {
        UiNodeKey { group: self.group.clone(),
                    name: self.attributes.key_name().to_string() }
    }

    fn matches(&self, group: &str, name: &str) -> bool {
        self.group == group && self.attributes.key_name() == name
    }
}

/// Ordered form: nodes render in the order they were contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiContainer {
    pub action: String,
    pub method: String,
    pub nodes: Vec<UiNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<UiText>,
}

impl UiContainer {
    pub fn new(action: impl Into<String>, method: impl Into<String>) -> Self {
        Self { action: action.into(),
               method: method.into(),
               nodes: Vec::new(),
               messages: Vec::new() }
    }

    /// Adds a node, replacing in place any node with the same `(group, name)`.
    pub fn push(&mut self, node: UiNode) {
        let pos = {
            let name = node.attributes.key_name();
            self.nodes.iter().position(|n| n.matches(&node.group, name))
        };
        match pos {
            Some(i) => self.nodes[i] = node,
            None => self.nodes.push(node),
        }
    }

    /// Merges a fragment: nodes are appended in fragment order, a node sharing
    /// `(group, name)` with an existing one replaces it at its original
    /// position, and flow-level messages accumulate. Action and method of
    /// `self` are kept.
    pub fn merge(&mut self, fragment: &UiContainer) {
        for node in &fragment.nodes {
            self.push(node.clone());
        }
        for message in &fragment.messages {
            self.add_message(message.clone());
        }
    }

    /// Like `merge`, but every node of the fragment must belong to `group`.
    /// A strategy can therefore never touch nodes it does not own.
    pub fn merge_scoped(&mut self, group: &str, fragment: &UiContainer) -> Result<()> {
        if let Some(foreign) = fragment.nodes.iter().find(|n| n.group != group) {
            return Err(FlowError::Validation(format!("node {} is outside group {}", foreign.key(), group)));
        }
        self.merge(fragment);
        Ok(())
    }

    /// Appends a flow-level message unless an identical one is present.
    pub fn add_message(&mut self, message: UiText) {
        if !self.messages.contains(&message) {
            self.messages.push(message);
        }
    }

    pub fn find_input(&self, group: &str, name: &str) -> Option<&InputAttributes> {
        self.nodes.iter().find_map(|n| match &n.attributes {
                              UiNodeAttributes::Input(a) if n.group == group && a.name == name => Some(a),
                              _ => None,
                          })
    }

    /// Replaces the messages of node `(group, name)` with `message`. Returns
    /// false when no such node exists.
    pub fn set_node_message(&mut self, group: &str, name: &str, message: UiText) -> bool {
        match self.nodes.iter_mut().find(|n| n.matches(group, name)) {
            Some(node) => {
                node.messages = vec![message];
                true
            }
            None => false,
        }
    }

    pub fn node_keys(&self) -> Vec<UiNodeKey> {
        self.nodes.iter().map(UiNode::key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn password_fragment(err: Option<&str>) -> UiContainer {
        let mut c = UiContainer::new("https://example.org/login", "POST");
        let mut pw = UiNode::input("password", "password", "password", None, true);
        if let Some(e) = err {
            pw = pw.with_message(UiText::error(text_ids::ERROR_INVALID_CREDENTIALS, e));
        }
        c.push(UiNode::input("password", "identifier", "text", None, true));
        c.push(pw);
        c
    }

    #[test]
    fn merge_replaces_in_place() {
        let mut ui = UiContainer::new("https://example.org/login", "POST");
        ui.push(UiNode::input(DEFAULT_GROUP, CSRF_TOKEN_NODE, "hidden", Some(json!("t")), true));
        ui.merge(&password_fragment(None));
        ui.merge(&password_fragment(Some("wrong")));
        let keys: Vec<String> = ui.node_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["default/csrf_token", "password/identifier", "password/password"]);
        assert_eq!(ui.nodes[2].messages.len(), 1);
    }

    #[test]
    fn merge_scoped_rejects_foreign_group() {
        let mut ui = UiContainer::new("https://example.org/login", "POST");
        let err = ui.merge_scoped("oidc", &password_fragment(None)).unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert!(ui.nodes.is_empty());
    }

    #[test]
    fn node_type_must_match_attributes() {
        let raw = json!({
            "type": "text",
            "group": "default",
            "attributes": {"node_type": "input", "name": "x", "type": "text"},
            "messages": []
        });
        assert!(serde_json::from_value::<UiNode>(raw).is_err());
    }

    #[test]
    fn image_and_script_nodes_keep_their_shape() {
        let image = UiNode::image("totp", "totp_qr", "data:image/png;base64,iVBORw0KGgo", 256, 256);
        let v = serde_json::to_value(&image).unwrap();
        assert_eq!(v["type"], "image");
        assert_eq!(v["attributes"],
                   json!({"node_type": "image", "id": "totp_qr", "src": "data:image/png;base64,iVBORw0KGgo",
                          "width": 256, "height": 256}));
        assert_eq!(serde_json::from_value::<UiNode>(v).unwrap(), image);

        let script = UiNode::script("webauthn",
                                    "webauthn_script",
                                    "https://example.org/.well-known/webauthn.js",
                                    "sha512-kN9xqBcY",
                                    "r4nd0m");
        let v = serde_json::to_value(&script).unwrap();
        assert_eq!(v["type"], "script");
        assert_eq!(v["attributes"]["integrity"], "sha512-kN9xqBcY");
        assert_eq!(v["attributes"]["nonce"], "r4nd0m");
        assert_eq!(serde_json::from_value::<UiNode>(v).unwrap(), script);
        assert_eq!(script.key().to_string(), "webauthn/webauthn_script");
        assert_eq!(script.node_type(), UiNodeType::Script);
    }
}
