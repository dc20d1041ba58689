//! Diesel persistence for the self-service flow engine.
//!
//! `SqlPersister` implements the `flow` persistence traits over SQLite,
//! PostgreSQL, MySQL and CockroachDB. Each backend has its own embedded
//! migration set; `harness` replays them against the historical dataset and
//! the golden fixtures under `tests/fixtures`.

pub mod config;
pub mod harness;
pub mod migrate;
mod models;
pub mod persister;
pub mod pool;
pub mod schema;

pub use config::{BackendKind, DatabaseConfig};
pub use harness::{run_parallel, ConsistencyHarness, FixtureReport, HarnessError};
pub use migrate::MigrationStatus;
pub use persister::SqlPersister;
pub use pool::Database;

/// Connects using `DATABASE_URL` and applies pending migrations.
pub fn new_from_env() -> flow::Result<SqlPersister> {
  let config = DatabaseConfig::from_env()?;
  let persister = SqlPersister::connect(&config)?;
  persister.database().migrate_up()?;
  Ok(persister)
}
