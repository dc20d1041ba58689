use flow_persistence::{ConsistencyHarness, DatabaseConfig, HarnessError};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const LOGIN_FLOW: &str = "0bc96cc9-dda4-4700-9e42-35731f2af91e";

fn harness(db_dir: &TempDir, fixtures: &Path) -> ConsistencyHarness {
  let path = db_dir.path().join("harness.sqlite");
  ConsistencyHarness::connect(&DatabaseConfig::new(path.to_str().unwrap())).unwrap()
                                                                           .with_fixtures_dir(fixtures)
}

#[test]
fn missing_fixtures_are_written_and_flagged() {
  let db_dir = tempfile::tempdir().unwrap();
  let fixtures = tempfile::tempdir().unwrap();
  let h = harness(&db_dir, fixtures.path());

  match h.run() {
    Err(HarnessError::FixturesCreated(created)) => {
      assert_eq!(created.len(), 16);
      assert!(created.contains(&format!("login_flow/{}", LOGIN_FLOW)));
    }
    other => panic!("expected freshly written fixtures, got {:?}", other),
  }
  let written = fixtures.path().join("login_flow").join(format!("{}.json", LOGIN_FLOW));
  let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&written).unwrap()).unwrap();
  assert_eq!(doc["type"], "login");
  assert_eq!(doc["state"], "show_form");

  // The second run verifies against what the first one wrote.
  let report = h.run().unwrap();
  assert!(report.is_clean());
  assert_eq!(report.compared, 16);
}

#[test]
fn mismatch_keeps_actual_document_next_to_fixture() {
  let db_dir = tempfile::tempdir().unwrap();
  let fixtures = tempfile::tempdir().unwrap();
  let h = harness(&db_dir, fixtures.path());
  assert!(matches!(h.run(), Err(HarnessError::FixturesCreated(_))));

  let path = fixtures.path().join("login_flow").join(format!("{}.json", LOGIN_FLOW));
  let mut doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
  doc["csrf_token"] = serde_json::json!("tampered");
  fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

  match h.run() {
    Err(HarnessError::Mismatches(m)) => assert_eq!(m, vec![format!("login_flow/{}", LOGIN_FLOW)]),
    other => panic!("expected a mismatch, got {:?}", other),
  }
  let actual = fixtures.path().join("login_flow").join(format!("{}.actual.json", LOGIN_FLOW));
  let actual: serde_json::Value = serde_json::from_str(&fs::read_to_string(actual).unwrap()).unwrap();
  assert_eq!(actual["csrf_token"], "csrf-0bc96cc9");
}

#[test]
fn fixture_without_entity_is_reported() {
  let db_dir = tempfile::tempdir().unwrap();
  let fixtures = tempfile::tempdir().unwrap();
  let h = harness(&db_dir, fixtures.path());
  assert!(matches!(h.run(), Err(HarnessError::FixturesCreated(_))));

  let ghost = "00000000-0000-4000-8000-000000000000";
  fs::write(fixtures.path().join("session").join(format!("{}.json", ghost)), "{}").unwrap();
  match h.run() {
    Err(HarnessError::MissingIds(ids)) => assert_eq!(ids, vec![format!("session/{}", ghost)]),
    other => panic!("expected a missing id, got {:?}", other),
  }
}
