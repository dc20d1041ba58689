// File: harness.rs
// Purpose: migration consistency harness. Replays the migrations of one
// backend with the historical dataset loaded between steps, compares every
// stored entity against its golden JSON fixture, checks the identity cascade
// and reverts the schema again.
use crate::config::{BackendKind, DatabaseConfig};
use crate::persister::SqlPersister;
use crate::pool::Database;
use flow::errors::FlowError;
use flow::{FlowPersister, FlowType, IdentityPersister, Page, SessionPersister, TokenPersister};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Settings flow of the dataset whose identity is deleted by the cascade check.
pub const CASCADE_FLOW_ID: &str = "a79bfcf1-68ae-49de-8b23-4f96921b8341";

#[derive(Error, Debug)]
pub enum HarnessError {
  #[error(transparent)]
  Flow(#[from] FlowError),

  #[error("migration: {0}")]
  Migration(String),

  #[error("io error on {path}: {source}")]
  Io { path: PathBuf, source: std::io::Error },

  #[error("invalid json in {path}: {source}")]
  Json { path: PathBuf, source: serde_json::Error },

  #[error("{} fixture mismatches: {}", .0.len(), .0.join(", "))]
  Mismatches(Vec<String>),

  #[error("fixtures written for the first time, re-run to verify: {}", .0.join(", "))]
  FixturesCreated(Vec<String>),

  #[error("fixtures without a stored entity: {}", .0.join(", "))]
  MissingIds(Vec<String>),

  #[error("cascade check failed: {0}")]
  Cascade(String),
}

type HarnessResult<T> = std::result::Result<T, HarnessError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> HarnessError + '_ {
  move |source| HarnessError::Io { path: path.to_path_buf(),
                                   source }
}

/// Outcome of one fixture pass. Entries are `kind/id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureReport {
  pub compared: usize,
  pub created: Vec<String>,
  pub mismatches: Vec<String>,
  pub missing: Vec<String>,
}

impl FixtureReport {
  pub fn is_clean(&self) -> bool {
    self.created.is_empty() && self.mismatches.is_empty() && self.missing.is_empty()
  }

  /// Mismatches win over missing ids, which win over freshly written fixtures.
  pub fn into_result(self) -> HarnessResult<Self> {
    if !self.mismatches.is_empty() {
      return Err(HarnessError::Mismatches(self.mismatches));
    }
    if !self.missing.is_empty() {
      return Err(HarnessError::MissingIds(self.missing));
    }
    if !self.created.is_empty() {
      return Err(HarnessError::FixturesCreated(self.created));
    }
    Ok(self)
  }
}

/// Runs the up, fixtures, cascade, down sequence against one backend.
pub struct ConsistencyHarness {
  db: Arc<Database>,
  persister: SqlPersister,
  testdata_dir: PathBuf,
  fixtures_dir: PathBuf,
}

impl ConsistencyHarness {
  pub fn new(db: Database) -> Self {
    let db = Arc::new(db);
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    Self { persister: SqlPersister::new(Arc::clone(&db)),
           db,
           testdata_dir: root.join("testdata"),
           fixtures_dir: root.join("tests").join("fixtures") }
  }

  pub fn connect(config: &DatabaseConfig) -> HarnessResult<Self> {
    Ok(Self::new(Database::connect(config)?))
  }

  pub fn with_testdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.testdata_dir = dir.into();
    self
  }

  pub fn with_fixtures_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.fixtures_dir = dir.into();
    self
  }

  pub fn kind(&self) -> BackendKind {
    self.db.kind()
  }

  pub fn persister(&self) -> &SqlPersister {
    &self.persister
  }

  /// Reverts whatever a previous run left applied.
  pub fn clean(&self) -> HarnessResult<()> {
    self.db.migrate_down()?;
    Ok(())
  }

  /// Applies every migration in version order, loading
  /// `<version>_testdata.sql` after the migration it belongs to.
  pub fn migrate_up(&self) -> HarnessResult<Vec<String>> {
    let mut testdata = self.load_testdata()?;
    let applied = self.db.migrate_stepwise(|version| Ok(testdata.remove(version)))?;
    if let Some(orphan) = testdata.keys().next() {
      return Err(HarnessError::Migration(format!("testdata for unknown migration {}", orphan)));
    }
    info!("{}: applied {} migrations with test data", self.kind(), applied.len());
    Ok(applied)
  }

  fn load_testdata(&self) -> HarnessResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if !self.testdata_dir.is_dir() {
      return Ok(out);
    }
    for entry in fs::read_dir(&self.testdata_dir).map_err(io_err(&self.testdata_dir))? {
      let path = entry.map_err(io_err(&self.testdata_dir))?.path();
      let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
      if let Some(version) = name.strip_suffix("_testdata.sql") {
        let sql = fs::read_to_string(&path).map_err(io_err(&path))?;
        out.insert(version.to_string(), sql);
      }
    }
    Ok(out)
  }

  /// Compares every entity reachable through the persistence contract with
  /// its fixture. Missing fixtures are written; mismatches leave the actual
  /// document next to the expected one as `<id>.actual.json`.
  pub fn verify_fixtures(&self) -> HarnessResult<FixtureReport> {
    let mut report = FixtureReport::default();
    let page = Page::default();
    let repo = &self.persister;

    let mut identities = BTreeSet::new();
    let mut verifiable = BTreeSet::new();
    let mut recovery = BTreeSet::new();
    for listed in repo.list_identities(page)? {
      let mut identity = repo.get_identity_confidential(&listed.id)?;
      for a in &identity.verifiable_addresses {
        self.compare(&mut report, "identity_verification_address", &a.id, a)?;
        verifiable.insert(a.id);
      }
      for a in &identity.recovery_addresses {
        self.compare(&mut report, "identity_recovery_address", &a.id, a)?;
        recovery.insert(a.id);
      }
      identity.verifiable_addresses.clear();
      identity.recovery_addresses.clear();
      self.compare(&mut report, "identity", &identity.id, &identity)?;
      identities.insert(identity.id);
    }
    self.check_ids(&mut report, "identity", &identities)?;
    self.check_ids(&mut report, "identity_verification_address", &verifiable)?;
    self.check_ids(&mut report, "identity_recovery_address", &recovery)?;

    let mut sessions = BTreeSet::new();
    for s in repo.list_sessions(page)? {
      self.compare(&mut report, "session", &s.id, &s)?;
      sessions.insert(s.id);
    }
    self.check_ids(&mut report, "session", &sessions)?;

    for flow_type in FlowType::ALL {
      let kind = format!("{}_flow", flow_type);
      let mut seen = BTreeSet::new();
      for f in repo.list_flows(Some(flow_type), page)? {
        self.compare(&mut report, &kind, &f.id, &f)?;
        seen.insert(f.id);
      }
      self.check_ids(&mut report, &kind, &seen)?;
    }

    let mut seen = BTreeSet::new();
    for t in repo.list_recovery_tokens(page)? {
      self.compare(&mut report, "recovery_token", &t.id, &t)?;
      seen.insert(t.id);
    }
    self.check_ids(&mut report, "recovery_token", &seen)?;

    let mut seen = BTreeSet::new();
    for t in repo.list_verification_tokens(page)? {
      self.compare(&mut report, "verification_token", &t.id, &t)?;
      seen.insert(t.id);
    }
    self.check_ids(&mut report, "verification_token", &seen)?;

    debug!("{}: compared {} fixtures", self.kind(), report.compared);
    Ok(report)
  }

  fn compare<T>(&self, report: &mut FixtureReport, kind: &str, id: &Uuid, entity: &T) -> HarnessResult<()>
    where T: Serialize
  {
    let dir = self.fixtures_dir.join(kind);
    let path = dir.join(format!("{}.json", id));
    let actual = serde_json::to_value(entity).map_err(|source| HarnessError::Json { path: path.clone(),
                                                                                      source })?;
    report.compared += 1;
    if !path.exists() {
      fs::create_dir_all(&dir).map_err(io_err(&dir))?;
      write_json(&path, &actual)?;
      warn!("{}: wrote missing fixture {}", self.kind(), path.display());
      report.created.push(format!("{}/{}", kind, id));
      return Ok(());
    }
    let raw = fs::read_to_string(&path).map_err(io_err(&path))?;
    let expected: serde_json::Value =
      serde_json::from_str(&raw).map_err(|source| HarnessError::Json { path: path.clone(),
                                                                       source })?;
    if expected != actual {
      let actual_path = dir.join(format!("{}.actual.json", id));
      write_json(&actual_path, &actual)?;
      warn!("{}: {}/{} differs from its fixture, actual written to {}",
            self.kind(),
            kind,
            id,
            actual_path.display());
      report.mismatches.push(format!("{}/{}", kind, id));
    }
    Ok(())
  }

  /// Every fixture of `kind` must name an entity found in the store.
  fn check_ids(&self, report: &mut FixtureReport, kind: &str, seen: &BTreeSet<Uuid>) -> HarnessResult<()> {
    let dir = self.fixtures_dir.join(kind);
    if !dir.is_dir() {
      return Ok(());
    }
    for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
      let path = entry.map_err(io_err(&dir))?.path();
      let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
      if name.ends_with(".actual.json") {
        continue;
      }
      let Some(stem) = name.strip_suffix(".json") else { continue };
      let known = Uuid::parse_str(stem).map(|id| seen.contains(&id)).unwrap_or(false);
      if !known {
        report.missing.push(format!("{}/{}", kind, stem));
      }
    }
    Ok(())
  }

  /// Deletes the identity owning the dataset's settings flow and expects the
  /// flow to be gone with it.
  pub fn check_cascade(&self) -> HarnessResult<()> {
    let flow_id = Uuid::parse_str(CASCADE_FLOW_ID).map_err(|e| HarnessError::Cascade(e.to_string()))?;
    let flow = self.persister.get_flow(&flow_id)?;
    let identity_id =
      flow.identity_id.ok_or_else(|| HarnessError::Cascade(format!("flow {} has no identity", flow_id)))?;
    self.persister.delete_identity(&identity_id)?;
    match self.persister.get_flow(&flow_id) {
      Err(FlowError::NotFound(_)) => {}
      Ok(_) => return Err(HarnessError::Cascade(format!("flow {} survived deletion of identity {}", flow_id, identity_id))),
      Err(e) => return Err(e.into()),
    }
    match self.persister.get_identity(&identity_id) {
      Err(FlowError::NotFound(_)) => Ok(()),
      Ok(_) => Err(HarnessError::Cascade(format!("identity {} still present", identity_id))),
      Err(e) => Err(e.into()),
    }
  }

  /// Reverts every migration and expects none to remain applied.
  pub fn migrate_down(&self) -> HarnessResult<Vec<String>> {
    let reverted = self.db.migrate_down()?;
    let status = self.db.migration_status()?;
    if !status.applied.is_empty() {
      return Err(HarnessError::Migration(format!("still applied after revert: {}", status.applied.join(", "))));
    }
    Ok(reverted)
  }

  /// Full sequence. The schema is reverted even when fixtures differ; the
  /// fixture outcome is reported afterwards.
  pub fn run(&self) -> HarnessResult<FixtureReport> {
    self.clean()?;
    self.migrate_up()?;
    let report = self.verify_fixtures()?;
    self.check_cascade()?;
    self.migrate_down()?;
    info!("{}: consistency run finished, {} fixtures compared", self.kind(), report.compared);
    report.into_result()
  }
}

fn write_json(path: &Path, value: &serde_json::Value) -> HarnessResult<()> {
  let mut body = serde_json::to_string_pretty(value).map_err(|source| HarnessError::Json { path: path.to_path_buf(),
                                                                                             source })?;
  body.push('\n');
  fs::write(path, body).map_err(io_err(path))
}

/// Runs each harness on its own thread; each backend's sequence stays
/// sequential.
pub fn run_parallel(harnesses: Vec<ConsistencyHarness>) -> Vec<(BackendKind, HarnessResult<FixtureReport>)> {
  harnesses.into_par_iter().map(|h| (h.kind(), h.run())).collect()
}
