// File: strategy.rs
// Purpose: capability interface implemented by authentication, recovery and
// verification methods, and the registry the engine resolves them from.
use crate::domain::{Flow, FlowState, FlowType};
use crate::errors::{FlowError, Result};
use crate::method_config::MethodConfig;
use crate::repository::FlowEffects;
use crate::ui::{UiText, DEFAULT_GROUP};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// What the caller submitted for one strategy.
#[derive(Debug, Clone)]
pub struct Submission {
    pub csrf_token: String,
    pub payload: JsonValue,
}

impl Submission {
    pub fn new(csrf_token: impl Into<String>, payload: JsonValue) -> Self {
        Self { csrf_token: csrf_token.into(),
               payload }
    }

    /// String field of the payload, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(JsonValue::as_str)
    }
}

/// Result of `Strategy::handle`.
#[derive(Debug, Clone)]
pub enum StrategyOutcome {
    /// Keep the flow open and show `method` again. `effects` are committed
    /// together with the flow update.
    Rerender {
        method: MethodConfig,
        state: Option<FlowState>,
        effects: FlowEffects,
    },
    /// Finish the flow; `effects` are applied as one unit.
    Complete {
        state: Option<FlowState>,
        effects: FlowEffects,
    },
    /// Recoverable rejection (wrong password, unknown address, ...). The
    /// engine re-renders with `message`, attached to `node` when given.
    Rejected { node: Option<String>, message: UiText },
}

/// One pluggable method. Implementations only ever see and return their own
/// fragment; the engine owns the merged form.
pub trait Strategy: Send + Sync {
    /// Registry key, e.g. `password` or `link`.
    fn id(&self) -> &str;

    /// UI group this strategy's nodes live in.
    fn group(&self) -> &str {
        self.id()
    }

    fn supports(&self, flow_type: FlowType) -> bool;

    /// Fragment shown when the flow is rendered. `flow.ui.action` already
    /// holds the flow's submission endpoint.
    fn populate(&self, flow: &Flow) -> Result<MethodConfig>;

    /// Handles a submission. `Err` is reserved for infrastructure failures;
    /// user mistakes are `StrategyOutcome::Rejected`.
    fn handle(&self, flow: &Flow, submission: &Submission) -> Result<StrategyOutcome>;
}

/// Strategies keyed by id, iterated in registration order.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: IndexMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strategy. Ids and groups must be unique and the engine's
    /// own group is reserved.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> Result<()> {
        let id = strategy.id().to_string();
        if id.is_empty() {
            return Err(FlowError::Validation("strategy id must not be empty".into()));
        }
        if self.strategies.contains_key(&id) {
            return Err(FlowError::Validation(format!("strategy {} is already registered", id)));
        }
        let group = strategy.group();
        if group == DEFAULT_GROUP {
            return Err(FlowError::Validation(format!("strategy {} cannot use the {} group", id, DEFAULT_GROUP)));
        }
        if let Some(other) = self.strategies.values().find(|s| s.group() == group) {
            return Err(FlowError::Validation(format!("strategies {} and {} share group {}", other.id(), id, group)));
        }
        self.strategies.insert(id, strategy);
        Ok(())
    }

    pub fn with(mut self, strategy: Arc<dyn Strategy>) -> Result<Self> {
        self.register(strategy)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Strategy>> {
        self.strategies.get(id)
    }

    /// Strategies enabled for `flow_type`, in registration order.
    pub fn for_flow_type(&self, flow_type: FlowType) -> impl Iterator<Item = &Arc<dyn Strategy>> {
        self.strategies.values().filter(move |s| s.supports(flow_type))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
