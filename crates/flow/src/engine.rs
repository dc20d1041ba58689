// File: engine.rs
// Purpose: `FlowEngine` drives the flow lifecycle: creation, rendering,
// submission dispatch to strategies and re-issue. Every mutation goes
// through `Flow::apply` and is persisted with an optimistic version check.
use crate::config::FlowEngineConfig;
use crate::domain::{generate_token, Flow, FlowType, Transition};
use crate::errors::{FlowError, Result};
use crate::repository::{FlowEffects, PersistResult, Persister};
use crate::strategy::{Strategy, StrategyOutcome, StrategyRegistry, Submission};
use crate::ui::{UiContainer, UiNode, UiText, CSRF_TOKEN_NODE, DEFAULT_GROUP};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

/// Time source, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What a submission produced.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The flow stays open with an updated form. `effects` holds what was
    /// committed alongside (e.g. a freshly issued recovery token).
    Rerender { flow: Flow, effects: FlowEffects },
    /// The strategy rejected the input. The flow was re-rendered with the
    /// message; `error` is the wrapped strategy error.
    Rejected { flow: Flow, error: FlowError },
    /// The flow is completed and `effects` were applied with it.
    Completed { flow: Flow, effects: FlowEffects },
}

impl SubmitOutcome {
    pub fn flow(&self) -> &Flow {
        match self {
            SubmitOutcome::Rerender { flow, .. } | SubmitOutcome::Rejected { flow, .. } | SubmitOutcome::Completed { flow, .. } => flow,
        }
    }
}

/// Flow lifecycle state machine over a `Persister`.
///
/// The engine keeps no per-flow state in memory: each call loads the flow,
/// applies one transition and writes it back guarded by its version, so
/// concurrent submissions against the same flow resolve to one winner and a
/// `Conflict` for the other.
pub struct FlowEngine<P>
    where P: Persister
{
    repo: Arc<P>,
    strategies: StrategyRegistry,
    config: FlowEngineConfig,
    clock: Clock,
}

impl<P> FlowEngine<P> where P: Persister
{
    pub fn new(repo: Arc<P>, strategies: StrategyRegistry, config: FlowEngineConfig) -> Self {
        Self { repo,
               strategies,
               config,
               clock: Arc::new(Utc::now) }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &FlowEngineConfig {
        &self.config
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn repository(&self) -> &Arc<P> {
        &self.repo
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Creates, renders and persists a new flow.
    ///
    /// Fails with `Validation` when the flow type is disabled, the request
    /// URL is not absolute, or a settings flow has no identity.
    pub fn create_flow(&self, flow_type: FlowType, request_url: &str, identity_id: Option<Uuid>) -> Result<Flow> {
        let cfg = self.config.flow(flow_type);
        if !cfg.enabled {
            return Err(FlowError::Validation(format!("{} flows are not enabled", flow_type)));
        }
        let parsed = Url::parse(request_url).map_err(|e| FlowError::Validation(format!("request url {:?}: {}", request_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(FlowError::Validation(format!("request url {:?} is not absolute", request_url)));
        }
        if flow_type == FlowType::Settings && identity_id.is_none() {
            return Err(FlowError::Validation("settings flows require an identity".into()));
        }

        let now = self.now();
        let mut flow = Flow::new(flow_type,
                                 request_url,
                                 cfg.ttl,
                                 now,
                                 generate_token(self.config.token_length))?;
        flow.identity_id = identity_id;
        self.render(&mut flow)?;
        flow.apply(Transition::Render, now)?;
        self.repo.create_flow(&flow)?;
        debug!("created {} flow {} ({} nodes)", flow_type, flow.id, flow.ui.nodes.len());
        Ok(flow)
    }

    /// Rebuilds the flow's form from scratch: the csrf node first, then each
    /// applicable strategy's fragment in registration order. Deterministic
    /// for a given flow state.
    pub fn render(&self, flow: &mut Flow) -> Result<()> {
        let action = self.config.action_url(flow.flow_type, &flow.id)?;
        flow.ui.action = action.clone();
        let mut ui = UiContainer::new(action, "POST");
        ui.push(csrf_node(&flow.csrf_token));
        let mut methods = std::collections::BTreeMap::new();
        for strategy in self.strategies.for_flow_type(flow.flow_type) {
            let method = strategy.populate(flow)?;
            ui.merge_scoped(strategy.group(), method.container())?;
            methods.insert(strategy.id().to_string(), method);
        }
        // Flow-level messages survive a re-render.
        for message in &flow.ui.messages {
            ui.add_message(message.clone());
        }
        flow.ui = ui;
        flow.methods = methods;
        Ok(())
    }

    /// Loads a flow for further interaction. `Expired` once the TTL elapsed.
    pub fn fetch(&self, id: &Uuid) -> Result<Flow> {
        let flow = self.repo.get_flow(id)?;
        flow.ensure_not_expired(self.now())?;
        Ok(flow)
    }

    /// Loads a flow regardless of expiry, for error pages.
    pub fn fetch_for_diagnostics(&self, id: &Uuid) -> Result<Flow> {
        self.repo.get_flow(id)
    }

    /// Dispatches a submission to `strategy_id`.
    ///
    /// Strategy rejections come back as `SubmitOutcome::Rejected` with the
    /// flow re-rendered; only csrf, expiry, status, storage and conflict
    /// failures are returned as `Err`.
    pub fn submit(&self, id: &Uuid, strategy_id: &str, submission: &Submission) -> Result<SubmitOutcome> {
        let mut flow = self.repo.get_flow(id)?;
        let expected = flow.version;
        let now = self.now();

        // Expiry, status and csrf are checked before the strategy is looked up.
        if let Err(e) = flow.apply(Transition::BeginSubmit { strategy: strategy_id,
                                                             csrf_token: &submission.csrf_token },
                                   now)
        {
            warn!("submission to flow {} refused: {}", id, e);
            return Err(e);
        }
        let strategy = self.resolve(&flow, strategy_id)?;

        match strategy.handle(&flow, submission)? {
            StrategyOutcome::Rerender { method, state, effects } => {
                flow.ui.merge_scoped(strategy.group(), method.container())?;
                flow.methods.insert(strategy_id.to_string(), method);
                self.rotate(&mut flow, state, now)?;
                self.commit(&mut flow, expected, &effects)?;
                debug!("flow {} re-rendered by {}", flow.id, strategy_id);
                Ok(SubmitOutcome::Rerender { flow, effects })
            }
            StrategyOutcome::Complete { state, effects } => {
                flow.apply(Transition::Complete { state }, now)?;
                if flow.identity_id.is_none() {
                    flow.identity_id = effects.identity
                                              .as_ref()
                                              .map(|i| i.id)
                                              .or_else(|| effects.session.as_ref().map(|s| s.identity_id));
                }
                flow.ui.add_message(UiText::success(crate::ui::text_ids::INFO_FLOW_COMPLETED,
                                                    format!("The {} flow was completed.", flow.flow_type)));
                self.commit(&mut flow, expected, &effects)?;
                info!("{} flow {} completed by {}", flow.flow_type, flow.id, strategy_id);
                Ok(SubmitOutcome::Completed { flow, effects })
            }
            StrategyOutcome::Rejected { node, message } => {
                let error = FlowError::Strategy { flow_id: flow.id,
                                                  strategy: strategy_id.to_string(),
                                                  reason: message.text.clone() };
                warn!("{}", error);
                let attached = match &node {
                    Some(name) => flow.ui.set_node_message(strategy.group(), name, message.clone()),
                    None => false,
                };
                if !attached {
                    flow.ui.add_message(message);
                }
                self.rotate(&mut flow, None, now)?;
                self.commit(&mut flow, expected, &FlowEffects::default())?;
                Ok(SubmitOutcome::Rejected { flow, error })
            }
        }
    }

    /// Starts a fresh flow with the same type, request URL and identity as
    /// `id`. The new flow always has a new id.
    pub fn reissue(&self, id: &Uuid) -> Result<Flow> {
        let old = self.repo.get_flow(id)?;
        let flow = self.create_flow(old.flow_type, &old.request_url, old.identity_id)?;
        debug!("re-issued flow {} as {}", old.id, flow.id);
        Ok(flow)
    }

    fn resolve(&self, flow: &Flow, strategy_id: &str) -> Result<Arc<dyn Strategy>> {
        match self.strategies.get(strategy_id) {
            Some(s) if s.supports(flow.flow_type) => Ok(Arc::clone(s)),
            Some(_) => Err(FlowError::Validation(format!("strategy {} does not handle {} flows", strategy_id, flow.flow_type))),
            None => Err(FlowError::Validation(format!("unknown strategy {}", strategy_id))),
        }
    }

    fn rotate(&self, flow: &mut Flow, state: Option<crate::domain::FlowState>, now: DateTime<Utc>) -> Result<()> {
        let token = generate_token(self.config.token_length);
        flow.apply(Transition::Rerender { state,
                                          csrf_token: token },
                   now)?;
        flow.ui.push(csrf_node(&flow.csrf_token));
        Ok(())
    }

    fn commit(&self, flow: &mut Flow, expected: i64, effects: &FlowEffects) -> Result<()> {
        match self.repo.commit_flow(flow, expected, effects)? {
            PersistResult::Ok { new_version } => {
                flow.version = new_version;
                Ok(())
            }
            PersistResult::Conflict => Err(FlowError::Conflict(format!("flow {} was modified concurrently", flow.id))),
        }
    }
}

fn csrf_node(token: &str) -> UiNode {
    UiNode::input(DEFAULT_GROUP,
                  CSRF_TOKEN_NODE,
                  "hidden",
                  Some(JsonValue::String(token.to_string())),
                  true)
}
