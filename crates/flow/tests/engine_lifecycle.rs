use chrono::{DateTime, Duration, Utc};
use flow::stubs::{InMemoryPersister, LinkStrategy, PasswordStrategy};
use flow::{FlowEngine, FlowEngineConfig, FlowError, FlowPersister, FlowStatus, FlowType, Identity, IdentityPersister,
           PersistResult, SessionPersister, StrategyRegistry, SubmitOutcome, Submission, CSRF_TOKEN_NODE, DEFAULT_GROUP};
use serde_json::json;
use std::sync::{Arc, Mutex};

const SECRET: &str = "correct horse battery staple";
const RETURN_TO: &str = "https://app.example.org/welcome";

struct Fixture {
  repo: Arc<InMemoryPersister>,
  engine: FlowEngine<InMemoryPersister>,
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl Fixture {
  fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap();
    *now = *now + by;
  }
}

fn setup_with(config: FlowEngineConfig) -> Fixture {
  let repo = Arc::new(InMemoryPersister::new());
  let strategies = StrategyRegistry::new().with(Arc::new(PasswordStrategy::new(Arc::clone(&repo),
                                                                              Arc::new(|_: &Identity, pw: &str| pw == SECRET))
                                                .with_session_lifespan(Duration::hours(2))))
                                          .unwrap()
                                          .with(Arc::new(LinkStrategy::new(Arc::clone(&repo))))
                                          .unwrap();
  let now = Arc::new(Mutex::new(Utc::now()));
  let clock = Arc::clone(&now);
  let engine = FlowEngine::new(Arc::clone(&repo), strategies, config).with_clock(Arc::new(move || *clock.lock().unwrap()));
  Fixture { repo, engine, now }
}

fn setup() -> Fixture {
  setup_with(FlowEngineConfig::default())
}

fn alice(repo: &InMemoryPersister) -> Identity {
  let identity = Identity::new("default", json!({"email": "alice@example.org"}), Utc::now()).with_email("alice@example.org");
  repo.create_identity(&identity).unwrap();
  identity
}

#[test]
fn login_flow_renders_csrf_then_password_nodes() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();

  assert_eq!(flow.status, FlowStatus::AwaitingMethod);
  assert_eq!(flow.expires_at - flow.issued_at, Duration::hours(1));
  assert_eq!(flow.ui.action, format!("http://127.0.0.1:4433/self-service/login?flow={}", flow.id));
  assert_eq!(flow.ui.method, "POST");
  let keys: Vec<String> = flow.ui.node_keys().iter().map(|k| k.to_string()).collect();
  assert_eq!(keys, vec!["default/csrf_token", "password/identifier", "password/password", "password/method"]);
  let csrf = flow.ui.find_input(DEFAULT_GROUP, CSRF_TOKEN_NODE).unwrap();
  assert_eq!(csrf.value, Some(json!(flow.csrf_token)));
  assert!(flow.methods.contains_key("password"));
  assert!(!flow.methods.contains_key("link"));

  let stored = fx.engine.fetch(&flow.id).unwrap();
  assert_eq!(stored, flow);
}

#[test]
fn disabled_flow_type_is_a_validation_error() {
  let config = FlowEngineConfig::default().with_flow(FlowType::Registration, false, Duration::hours(1));
  let fx = setup_with(config);
  match fx.engine.create_flow(FlowType::Registration, RETURN_TO, None) {
    Err(FlowError::Validation(_)) => {}
    other => panic!("expected validation error, got {:?}", other),
  }
}

#[test]
fn relative_request_url_is_rejected() {
  let fx = setup();
  assert!(matches!(fx.engine.create_flow(FlowType::Login, "/welcome", None), Err(FlowError::Validation(_))));
}

#[test]
fn settings_flow_requires_identity() {
  let fx = setup();
  assert!(matches!(fx.engine.create_flow(FlowType::Settings, RETURN_TO, None), Err(FlowError::Validation(_))));
  let id = alice(&fx.repo).id;
  let flow = fx.engine.create_flow(FlowType::Settings, RETURN_TO, Some(id)).unwrap();
  assert_eq!(flow.identity_id, Some(id));
}

#[test]
fn expired_flow_is_readable_for_diagnostics_only() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  fx.advance(Duration::hours(2));

  match fx.engine.fetch(&flow.id) {
    Err(FlowError::Expired { flow_id, .. }) => assert_eq!(flow_id, flow.id),
    other => panic!("expected expired, got {:?}", other),
  }
  assert_eq!(fx.engine.fetch_for_diagnostics(&flow.id).unwrap().id, flow.id);

  let submission = Submission::new(flow.csrf_token.clone(), json!({"identifier": "a@b.c", "password": SECRET}));
  assert!(matches!(fx.engine.submit(&flow.id, "password", &submission), Err(FlowError::Expired { .. })));
  // Expiry wins over strategy lookup.
  assert!(matches!(fx.engine.submit(&flow.id, "oidc", &submission), Err(FlowError::Expired { .. })));
  assert!(matches!(fx.engine.submit(&flow.id, "link", &submission), Err(FlowError::Expired { .. })));
}

#[test]
fn unknown_flow_is_not_found() {
  let fx = setup();
  assert!(matches!(fx.engine.fetch(&uuid::Uuid::new_v4()), Err(FlowError::NotFound(_))));
}

#[test]
fn csrf_mismatch_is_fatal_and_leaves_flow_untouched() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  let submission = Submission::new("forged", json!({"identifier": "alice@example.org", "password": SECRET}));
  match fx.engine.submit(&flow.id, "password", &submission) {
    Err(FlowError::CsrfMismatch { flow_id }) => assert_eq!(flow_id, flow.id),
    other => panic!("expected csrf mismatch, got {:?}", other),
  }
  assert_eq!(fx.engine.fetch(&flow.id).unwrap(), flow);
}

#[test]
fn wrong_password_rerenders_with_error_and_rotated_csrf() {
  let fx = setup();
  alice(&fx.repo);
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  let submission = Submission::new(flow.csrf_token.clone(), json!({"identifier": "alice@example.org", "password": "nope"}));

  let rejected = match fx.engine.submit(&flow.id, "password", &submission).unwrap() {
    SubmitOutcome::Rejected { flow, error } => {
      assert!(matches!(error, FlowError::Strategy { .. }));
      flow
    }
    other => panic!("expected rejection, got {:?}", other),
  };
  assert_eq!(rejected.id, flow.id);
  assert_eq!(rejected.status, FlowStatus::AwaitingMethod);
  assert_ne!(rejected.csrf_token, flow.csrf_token);
  assert_eq!(rejected.ui.find_input(DEFAULT_GROUP, CSRF_TOKEN_NODE).unwrap().value,
             Some(json!(rejected.csrf_token)));
  assert_eq!(rejected.ui.messages.len(), 1);
  assert_eq!(rejected.ui.node_keys(), flow.ui.node_keys());
  assert_eq!(rejected.version, flow.version + 1);

  // The old token is spent.
  assert!(matches!(fx.engine.submit(&flow.id, "password", &submission), Err(FlowError::CsrfMismatch { .. })));

  // A second rejection neither duplicates nodes nor the message.
  let again = Submission::new(rejected.csrf_token.clone(), json!({"identifier": "alice@example.org", "password": "nope"}));
  let twice = fx.engine.submit(&flow.id, "password", &again).unwrap();
  assert_eq!(twice.flow().ui.node_keys(), flow.ui.node_keys());
  assert_eq!(twice.flow().ui.messages.len(), 1);
}

#[test]
fn missing_field_error_attaches_to_node() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  let submission = Submission::new(flow.csrf_token.clone(), json!({"password": SECRET}));
  let outcome = fx.engine.submit(&flow.id, "password", &submission).unwrap();
  let flow = outcome.flow();
  let node = flow.ui.nodes.iter().find(|n| n.key().to_string() == "password/identifier").unwrap();
  assert_eq!(node.messages.len(), 1);
  assert_eq!(node.messages[0].context, Some(json!({"property": "identifier"})));
  assert!(flow.ui.messages.is_empty());
}

#[test]
fn login_completes_and_creates_session() {
  let fx = setup();
  let identity = alice(&fx.repo);
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  let submission = Submission::new(flow.csrf_token.clone(), json!({"identifier": "Alice@Example.org", "password": SECRET}));

  match fx.engine.submit(&flow.id, "password", &submission).unwrap() {
    SubmitOutcome::Completed { flow, effects } => {
      assert_eq!(flow.status, FlowStatus::Completed);
      assert_eq!(flow.identity_id, Some(identity.id));
      assert_eq!(flow.active.as_deref(), Some("password"));
      let session = effects.session.unwrap();
      assert_eq!(session.expires_at - session.issued_at, Duration::hours(2));
      assert_eq!(fx.repo.get_session(&session.id).unwrap().identity_id, identity.id);
    }
    other => panic!("expected completion, got {:?}", other),
  }
}

#[test]
fn registration_creates_identity_and_closes_flow() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Registration, RETURN_TO, None).unwrap();
  let submission = Submission::new(flow.csrf_token.clone(), json!({"traits.email": "bob@example.org", "password": SECRET}));

  let completed = match fx.engine.submit(&flow.id, "password", &submission).unwrap() {
    SubmitOutcome::Completed { flow, effects } => {
      let identity = effects.identity.unwrap();
      let stored = fx.repo.get_identity_confidential(&identity.id).unwrap();
      assert_eq!(stored.verifiable_addresses.len(), 1);
      assert_eq!(stored.recovery_addresses.len(), 1);
      assert_eq!(flow.identity_id, Some(identity.id));
      flow
    }
    other => panic!("expected completion, got {:?}", other),
  };

  let resubmit = Submission::new(completed.csrf_token.clone(), json!({"traits.email": "bob@example.org", "password": SECRET}));
  assert!(matches!(fx.engine.submit(&flow.id, "password", &resubmit), Err(FlowError::Validation(_))));

  // The same address cannot register twice.
  let second = fx.engine.create_flow(FlowType::Registration, RETURN_TO, None).unwrap();
  let dup = Submission::new(second.csrf_token.clone(), json!({"traits.email": "bob@example.org", "password": SECRET}));
  assert!(matches!(fx.engine.submit(&second.id, "password", &dup).unwrap(), SubmitOutcome::Rejected { .. }));
}

#[test]
fn unknown_or_unsupported_strategy_is_rejected() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  let submission = Submission::new(flow.csrf_token.clone(), json!({}));
  assert!(matches!(fx.engine.submit(&flow.id, "oidc", &submission), Err(FlowError::Validation(_))));
  assert!(matches!(fx.engine.submit(&flow.id, "link", &submission), Err(FlowError::Validation(_))));
  assert_eq!(fx.engine.fetch(&flow.id).unwrap(), flow);
}

#[test]
fn reissue_creates_a_new_flow_id() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Recovery, RETURN_TO, None).unwrap();
  fx.advance(Duration::hours(2));
  let fresh = fx.engine.reissue(&flow.id).unwrap();
  assert_ne!(fresh.id, flow.id);
  assert_eq!(fresh.flow_type, FlowType::Recovery);
  assert_eq!(fresh.request_url, flow.request_url);
  assert!(fx.engine.fetch(&fresh.id).is_ok());
}

#[test]
fn rendering_is_deterministic() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Registration, RETURN_TO, None).unwrap();
  let mut a = flow.clone();
  let mut b = flow.clone();
  fx.engine.render(&mut a).unwrap();
  fx.engine.render(&mut b).unwrap();
  fx.engine.render(&mut b).unwrap();
  assert_eq!(serde_json::to_string(&a.ui).unwrap(), serde_json::to_string(&b.ui).unwrap());
  assert_eq!(a.ui, flow.ui);
}

#[test]
fn stale_version_is_a_conflict() {
  let fx = setup();
  let flow = fx.engine.create_flow(FlowType::Login, RETURN_TO, None).unwrap();
  match fx.repo.update_flow(&flow, flow.version).unwrap() {
    PersistResult::Ok { new_version } => assert_eq!(new_version, flow.version + 1),
    PersistResult::Conflict => panic!("unexpected conflict"),
  }
  assert_eq!(fx.repo.update_flow(&flow, flow.version).unwrap(), PersistResult::Conflict);
}
