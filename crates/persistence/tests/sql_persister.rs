use chrono::{Duration, SubsecRound, Utc};
use flow::stubs::{LinkStrategy, PasswordStrategy};
use flow::{generate_token, Flow, FlowEffects, FlowEngine, FlowEngineConfig, FlowError, FlowPersister, FlowService, FlowState,
           FlowStatus, FlowType, Identity, IdentityPersister, Page, PersistResult, RecoveryToken, Session, SessionPersister,
           StrategyRegistry, SubmitOutcome, Submission, TokenPersister, Transition, UiContainer, VerificationStatus,
           VerificationToken};
use flow_persistence::{Database, DatabaseConfig, SqlPersister};
use serde_json::json;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tempfile::TempDir;

fn sqlite_persister() -> (TempDir, SqlPersister) {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("flows.sqlite");
  let db = Database::connect(&DatabaseConfig::new(path.to_str().unwrap())).unwrap();
  db.migrate_up().unwrap();
  (dir, SqlPersister::new(Arc::new(db)))
}

fn identity(repo: &SqlPersister, email: &str) -> Identity {
  let identity = Identity::new("default", json!({ "email": email }), Utc::now()).with_email(email);
  repo.create_identity(&identity).unwrap();
  identity
}

fn flow(flow_type: FlowType, identity_id: Option<uuid::Uuid>) -> Flow {
  let mut f = Flow::new(flow_type, "https://app.example.org/", Duration::hours(1), Utc::now(), generate_token(32)).unwrap();
  f.ui = UiContainer::new(format!("http://127.0.0.1:4433/self-service/{}?flow={}", flow_type, f.id), "POST");
  f.identity_id = identity_id;
  f
}

#[test]
fn flow_round_trips_and_versions_are_checked() {
  let (_dir, repo) = sqlite_persister();
  let f = flow(FlowType::Login, None);
  repo.create_flow(&f).unwrap();
  assert_eq!(repo.get_flow(&f.id).unwrap(), f);

  let mut changed = f.clone();
  changed.active = Some("password".into());
  assert_eq!(repo.update_flow(&changed, 0).unwrap(), PersistResult::Ok { new_version: 1 });
  let stored = repo.get_flow(&f.id).unwrap();
  assert_eq!(stored.version, 1);
  assert_eq!(stored.active.as_deref(), Some("password"));

  // Second writer still holds version 0.
  assert_eq!(repo.update_flow(&f, 0).unwrap(), PersistResult::Conflict);
  assert_eq!(repo.get_flow(&f.id).unwrap().active.as_deref(), Some("password"));
}

#[test]
fn duplicate_flow_id_is_a_conflict() {
  let (_dir, repo) = sqlite_persister();
  let f = flow(FlowType::Registration, None);
  repo.create_flow(&f).unwrap();
  match repo.create_flow(&f) {
    Err(FlowError::Conflict(_)) => {}
    other => panic!("expected conflict, got {:?}", other),
  }
}

#[test]
fn flow_for_unknown_identity_violates_foreign_key() {
  let (_dir, repo) = sqlite_persister();
  match repo.create_flow(&flow(FlowType::Settings, Some(uuid::Uuid::new_v4()))) {
    Err(FlowError::Conflict(_)) => {}
    other => panic!("expected foreign key conflict, got {:?}", other),
  }
}

#[test]
fn stale_commit_writes_no_effects() {
  let (_dir, repo) = sqlite_persister();
  let f = flow(FlowType::Registration, None);
  repo.create_flow(&f).unwrap();
  let newcomer = Identity::new("default", json!({"email": "dave@example.org"}), Utc::now()).with_email("dave@example.org");
  let effects = FlowEffects { session: Some(Session::new(newcomer.id, Duration::hours(1), Utc::now())),
                              identity: Some(newcomer.clone()),
                              ..Default::default() };
  assert_eq!(repo.commit_flow(&f, 7, &effects).unwrap(), PersistResult::Conflict);
  assert!(matches!(repo.get_identity(&newcomer.id), Err(FlowError::NotFound(_))));
  assert!(repo.list_sessions(Page::default()).unwrap().is_empty());

  assert_eq!(repo.commit_flow(&f, 0, &effects).unwrap(), PersistResult::Ok { new_version: 1 });
  let stored = repo.get_identity_confidential(&newcomer.id).unwrap();
  assert_eq!(stored.verifiable_addresses.len(), 1);
  assert_eq!(stored.recovery_addresses.len(), 1);
  assert_eq!(repo.list_sessions(Page::default()).unwrap().len(), 1);
}

#[test]
fn lists_are_ordered_by_id_and_paged() {
  let (_dir, repo) = sqlite_persister();
  let mut ids: Vec<_> = (0..5).map(|_| {
                                let f = flow(FlowType::Recovery, None);
                                repo.create_flow(&f).unwrap();
                                f.id
                              })
                              .collect();
  repo.create_flow(&flow(FlowType::Login, None)).unwrap();
  ids.sort();
  let first: Vec<_> = repo.list_flows(Some(FlowType::Recovery), Page::new(0, 3)).unwrap().into_iter().map(|f| f.id).collect();
  let second: Vec<_> = repo.list_flows(Some(FlowType::Recovery), Page::new(1, 3)).unwrap().into_iter().map(|f| f.id).collect();
  assert_eq!(first, ids[..3].to_vec());
  assert_eq!(second, ids[3..].to_vec());
  assert_eq!(repo.list_flows(None, Page::default()).unwrap().len(), 6);
}

#[test]
fn recovery_token_is_consumed_once() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "erin@example.org");
  let f = flow(FlowType::Recovery, None);
  repo.create_flow(&f).unwrap();
  let token = RecoveryToken::new(generate_token(32), f.id, owner.recovery_addresses[0].id, Duration::minutes(15), Utc::now());
  repo.create_recovery_token(&token).unwrap();

  let used = repo.use_recovery_token(&token.token, Utc::now()).unwrap();
  assert!(used.used);
  assert!(used.used_at.is_some());
  match repo.use_recovery_token(&token.token, Utc::now()) {
    Err(FlowError::Conflict(_)) => {}
    other => panic!("expected conflict, got {:?}", other),
  }
  match repo.use_recovery_token("no-such-token", Utc::now()) {
    Err(FlowError::NotFound(_)) => {}
    other => panic!("expected not found, got {:?}", other),
  }
}

#[test]
fn expired_token_is_not_consumed() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "frank@example.org");
  let f = flow(FlowType::Verification, None);
  repo.create_flow(&f).unwrap();
  let issued = Utc::now() - Duration::hours(2);
  let token =
    VerificationToken::new(generate_token(32), f.id, owner.verifiable_addresses[0].id, Duration::minutes(15), issued);
  repo.create_verification_token(&token).unwrap();
  match repo.use_verification_token(&token.token, Utc::now()) {
    Err(FlowError::Conflict(_)) => {}
    other => panic!("expected conflict for expired token, got {:?}", other),
  }
  assert!(!repo.get_verification_token(&token.id).unwrap().used);
}

#[test]
fn verification_token_marks_address_in_same_transaction() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "grace@example.org");
  let f = flow(FlowType::Verification, None);
  repo.create_flow(&f).unwrap();
  let address = &owner.verifiable_addresses[0];
  let token = VerificationToken::new(generate_token(32), f.id, address.id, Duration::minutes(15), Utc::now());
  repo.create_verification_token(&token).unwrap();

  let now = Utc::now().trunc_subsecs(6);
  repo.use_verification_token(&token.token, now).unwrap();
  let stored = repo.get_verifiable_address(&address.id).unwrap();
  assert!(stored.verified);
  assert_eq!(stored.status, VerificationStatus::Completed);
  assert_eq!(stored.verified_at, Some(now));
}

#[test]
fn deleting_an_identity_cascades() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "heidi@example.org");
  let other = identity(&repo, "ivan@example.org");
  let settings = flow(FlowType::Settings, Some(owner.id));
  repo.create_flow(&settings).unwrap();
  let recovery = flow(FlowType::Recovery, None);
  repo.create_flow(&recovery).unwrap();
  let token =
    RecoveryToken::new(generate_token(32), recovery.id, owner.recovery_addresses[0].id, Duration::minutes(15), Utc::now());
  repo.create_recovery_token(&token).unwrap();
  let session = Session::new(owner.id, Duration::hours(1), Utc::now());
  repo.create_session(&session).unwrap();

  repo.delete_identity(&owner.id).unwrap();
  assert!(matches!(repo.get_flow(&settings.id), Err(FlowError::NotFound(_))));
  assert!(matches!(repo.get_session(&session.id), Err(FlowError::NotFound(_))));
  assert!(matches!(repo.get_recovery_token(&token.id), Err(FlowError::NotFound(_))));
  assert!(matches!(repo.find_verifiable_address("email", "heidi@example.org"), Err(FlowError::NotFound(_))));
  // Unrelated rows stay.
  assert!(repo.get_flow(&recovery.id).is_ok());
  assert!(repo.get_identity(&other.id).is_ok());
  assert!(matches!(repo.delete_identity(&owner.id), Err(FlowError::NotFound(_))));
}

#[test]
fn reaper_removes_only_expired_flows() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "judy@example.org");
  let mut old = flow(FlowType::Recovery, None);
  old.issued_at = old.issued_at - Duration::hours(3);
  old.expires_at = old.issued_at + Duration::hours(1);
  repo.create_flow(&old).unwrap();
  let token = RecoveryToken::new(generate_token(32), old.id, owner.recovery_addresses[0].id, Duration::minutes(15), old.issued_at);
  repo.create_recovery_token(&token).unwrap();
  let fresh = flow(FlowType::Login, None);
  repo.create_flow(&fresh).unwrap();

  assert_eq!(repo.delete_expired_flows(Utc::now()).unwrap(), 1);
  assert!(matches!(repo.get_flow(&old.id), Err(FlowError::NotFound(_))));
  assert!(matches!(repo.get_recovery_token(&token.id), Err(FlowError::NotFound(_))));
  assert!(repo.get_flow(&fresh.id).is_ok());
}

#[test]
fn recovery_flow_end_to_end_over_sqlite() {
  let (_dir, repo) = sqlite_persister();
  let repo = Arc::new(repo);
  let owner = identity(&repo, "mallory@example.org");
  let strategies = StrategyRegistry::new().with(Arc::new(PasswordStrategy::new(Arc::clone(&repo),
                                                                              Arc::new(|_: &Identity, _: &str| true))))
                                          .unwrap()
                                          .with(Arc::new(LinkStrategy::new(Arc::clone(&repo))))
                                          .unwrap();
  let service = FlowService::new(Arc::clone(&repo), strategies, FlowEngineConfig::default());

  let created = service.create_flow(FlowType::Recovery, "https://app.example.org/", None).unwrap();
  assert_eq!(service.fetch(&created.id).unwrap(), created);
  let submission = Submission::new(created.csrf_token.clone(), json!({"email": "mallory@example.org"}));
  let token = match service.submit(&created.id, "link", &submission).unwrap() {
    SubmitOutcome::Rerender { flow, effects } => {
      assert_eq!(flow.state, FlowState::SentEmail);
      effects.recovery_token.expect("token for known address").token
    }
    other => panic!("expected re-render, got {:?}", other),
  };
  let stored = repo.get_flow(&created.id).unwrap();
  assert_eq!(stored.version, created.version + 1);
  assert_eq!(stored.state, FlowState::SentEmail);

  let redeemed = service.redeem_recovery_token(&token).unwrap();
  assert_eq!(redeemed.identity_id, owner.id);
  assert_eq!(repo.get_flow(&created.id).unwrap().state, FlowState::PassedChallenge);
  assert_eq!(repo.get_session(&redeemed.session.id).unwrap().identity_id, owner.id);
  assert!(matches!(service.redeem_recovery_token(&token), Err(FlowError::Conflict(_))));
}

#[test]
fn recovery_after_flow_expiry_keeps_token_over_sqlite() {
  let (_dir, repo) = sqlite_persister();
  let repo = Arc::new(repo);
  identity(&repo, "oscar@example.org");
  let strategies = StrategyRegistry::new().with(Arc::new(LinkStrategy::new(Arc::clone(&repo)))).unwrap();
  let now = Arc::new(Mutex::new(Utc::now()));
  let clock = Arc::clone(&now);
  let engine = FlowEngine::new(Arc::clone(&repo), strategies, FlowEngineConfig::default()).with_clock(Arc::new(move || {
                                                                                                    *clock.lock().unwrap()
                                                                                                  }));
  let service = FlowService::from_engine(engine);
  let advance = |by: Duration| {
    let mut now = now.lock().unwrap();
    *now = *now + by;
  };

  let created = service.create_flow(FlowType::Recovery, "https://app.example.org/", None).unwrap();
  advance(Duration::minutes(50));
  let submission = Submission::new(created.csrf_token.clone(), json!({"email": "oscar@example.org"}));
  let token = match service.submit(&created.id, "link", &submission).unwrap() {
    SubmitOutcome::Rerender { effects, .. } => effects.recovery_token.unwrap().token,
    other => panic!("expected re-render, got {:?}", other),
  };
  // The flow expired at +60min, the token is valid until +110min.
  advance(Duration::minutes(15));

  match service.redeem_recovery_token(&token) {
    Err(FlowError::Expired { flow_id, .. }) => assert_eq!(flow_id, created.id),
    other => panic!("expected expired flow, got {:?}", other),
  }
  let stored_token = repo.find_recovery_token(&token).unwrap();
  assert!(!stored_token.used);
  assert!(stored_token.used_at.is_none());
  assert!(repo.list_sessions(Page::default()).unwrap().is_empty());
  let stored = repo.get_flow(&created.id).unwrap();
  assert_eq!(stored.status, FlowStatus::AwaitingMethod);
  assert_eq!(stored.state, FlowState::SentEmail);
}

#[test]
fn stale_flow_rolls_back_token_over_sqlite() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "peggy@example.org");
  let f = flow(FlowType::Verification, None);
  repo.create_flow(&f).unwrap();
  let now = Utc::now();
  let address = &owner.verifiable_addresses[0];
  let token = VerificationToken::new(generate_token(32), f.id, address.id, Duration::minutes(15), now);
  repo.create_verification_token(&token).unwrap();
  let mut closed = f.clone();
  closed.apply(Transition::ChallengePassed { identity_id: owner.id }, now).unwrap();

  match repo.redeem_verification_token(&token.token, now, &closed, 4, &FlowEffects::default()) {
    Err(FlowError::Conflict(_)) => {}
    other => panic!("expected conflict on stale flow, got {:?}", other),
  }
  assert!(!repo.get_verification_token(&token.id).unwrap().used);
  assert!(!repo.get_verifiable_address(&address.id).unwrap().verified);

  repo.redeem_verification_token(&token.token, now, &closed, 0, &FlowEffects::default()).unwrap();
  assert!(repo.get_verifiable_address(&address.id).unwrap().verified);
  assert_eq!(repo.get_flow(&f.id).unwrap().status, FlowStatus::Completed);
}

#[test]
fn concurrent_redemptions_have_one_winner() {
  let (_dir, repo) = sqlite_persister();
  let owner = identity(&repo, "trent@example.org");
  let f = flow(FlowType::Recovery, None);
  repo.create_flow(&f).unwrap();
  let now = Utc::now();
  let token = RecoveryToken::new(generate_token(32), f.id, owner.recovery_addresses[0].id, Duration::minutes(15), now);
  repo.create_recovery_token(&token).unwrap();
  let mut closed = f.clone();
  closed.apply(Transition::ChallengePassed { identity_id: owner.id }, now).unwrap();

  let barrier = Barrier::new(2);
  let results = thread::scope(|s| {
    let redeem = || {
      let effects = FlowEffects { session: Some(Session::new(owner.id, Duration::hours(1), now)),
                                  ..FlowEffects::default() };
      barrier.wait();
      repo.redeem_recovery_token(&token.token, now, &closed, 0, &effects)
    };
    let first = s.spawn(redeem);
    let second = s.spawn(redeem);
    vec![first.join().unwrap(), second.join().unwrap()]
  });

  assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
  assert!(results.iter().any(|r| matches!(r, Err(FlowError::Conflict(_)))));
  assert_eq!(repo.list_sessions(Page::default()).unwrap().len(), 1);
  let stored = repo.get_flow(&f.id).unwrap();
  assert_eq!(stored.version, 1);
  assert_eq!(stored.state, FlowState::PassedChallenge);
  assert!(repo.get_recovery_token(&token.id).unwrap().used);
}
