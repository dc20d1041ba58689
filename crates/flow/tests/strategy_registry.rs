use flow::stubs::InMemoryPersister;
use flow::{Flow, FlowEngine, FlowEngineConfig, FlowError, FlowType, MethodConfig, Result, Strategy, StrategyOutcome,
           StrategyRegistry, Submission, UiNode, UiText};
use std::sync::Arc;

/// Strategy whose group and node group can be chosen freely.
struct StandIn {
  id: &'static str,
  group: &'static str,
  node_group: &'static str,
}

impl Strategy for StandIn {
  fn id(&self) -> &str {
    self.id
  }

  fn group(&self) -> &str {
    self.group
  }

  fn supports(&self, flow_type: FlowType) -> bool {
    flow_type == FlowType::Login
  }

  fn populate(&self, flow: &Flow) -> Result<MethodConfig> {
    MethodConfig::new(flow.ui.action.clone(),
                      "POST",
                      vec![UiNode::input(self.node_group, "code", "text", None, true)])
  }

  fn handle(&self, _flow: &Flow, _submission: &Submission) -> Result<StrategyOutcome> {
    Ok(StrategyOutcome::Rejected { node: Some("code".into()),
                                   message: UiText::error(4_000_001, "wrong code") })
  }
}

fn stand_in(id: &'static str, group: &'static str, node_group: &'static str) -> Arc<dyn Strategy> {
  Arc::new(StandIn { id, group, node_group })
}

#[test]
fn ids_and_groups_must_be_unique() {
  let mut registry = StrategyRegistry::new();
  registry.register(stand_in("totp", "totp", "totp")).unwrap();
  assert!(matches!(registry.register(stand_in("totp", "other", "other")), Err(FlowError::Validation(_))));
  assert!(matches!(registry.register(stand_in("webauthn", "totp", "totp")), Err(FlowError::Validation(_))));
  assert!(matches!(registry.register(stand_in("sneaky", "default", "default")), Err(FlowError::Validation(_))));
  assert_eq!(registry.ids(), vec!["totp"]);
}

#[test]
fn fragments_merge_in_registration_order() {
  let registry = StrategyRegistry::new().with(stand_in("totp", "totp", "totp"))
                                        .unwrap()
                                        .with(stand_in("lookup", "lookup_secret", "lookup_secret"))
                                        .unwrap();
  let engine = FlowEngine::new(Arc::new(InMemoryPersister::new()), registry, FlowEngineConfig::default());
  let flow = engine.create_flow(FlowType::Login, "https://app.example.org/", None).unwrap();
  let keys: Vec<String> = flow.ui.node_keys().iter().map(|k| k.to_string()).collect();
  assert_eq!(keys, vec!["default/csrf_token", "totp/code", "lookup_secret/code"]);
}

#[test]
fn fragment_outside_own_group_is_refused() {
  let registry = StrategyRegistry::new().with(stand_in("totp", "totp", "password")).unwrap();
  let engine = FlowEngine::new(Arc::new(InMemoryPersister::new()), registry, FlowEngineConfig::default());
  assert!(matches!(engine.create_flow(FlowType::Login, "https://app.example.org/", None),
                   Err(FlowError::Validation(_))));
}

#[test]
fn rejection_message_lands_on_the_node() {
  let registry = StrategyRegistry::new().with(stand_in("totp", "totp", "totp")).unwrap();
  let engine = FlowEngine::new(Arc::new(InMemoryPersister::new()), registry, FlowEngineConfig::default());
  let flow = engine.create_flow(FlowType::Login, "https://app.example.org/", None).unwrap();
  let outcome = engine.submit(&flow.id, "totp", &Submission::new(flow.csrf_token.clone(), serde_json::json!({})))
                      .unwrap();
  let node = outcome.flow().ui.nodes.iter().find(|n| n.group == "totp").unwrap();
  assert_eq!(node.messages, vec![UiText::error(4_000_001, "wrong code")]);
}
