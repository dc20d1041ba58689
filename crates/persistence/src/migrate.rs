// File: migrate.rs
// Purpose: schema migrations for the configured backend: apply, revert,
// report status, and step through one migration at a time with seed data.
use crate::pool::{with_migrations, Database};
use diesel::connection::SimpleConnection;
use diesel_migrations::MigrationHarness;
use flow::errors::{FlowError, Result};
use log::{debug, info};

fn migration_error(e: impl std::fmt::Display) -> FlowError {
  FlowError::BackendUnavailable(format!("migration: {}", e))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatus {
  pub applied: Vec<String>,
  pub pending: Vec<String>,
}

impl Database {
  /// Applies every pending migration; returns the applied versions.
  pub fn migrate_up(&self) -> Result<Vec<String>> {
    let applied: Vec<String> = with_migrations!(self, |conn, source| {
      conn.run_pending_migrations(source)
          .map_err(migration_error)?
          .into_iter()
          .map(|v| v.to_string())
          .collect()
    });
    info!("applied {} migrations on {}", applied.len(), self.kind());
    Ok(applied)
  }

  /// Reverts every applied migration, newest first.
  pub fn migrate_down(&self) -> Result<Vec<String>> {
    let reverted: Vec<String> = with_migrations!(self, |conn, source| {
      conn.revert_all_migrations(source)
          .map_err(migration_error)?
          .into_iter()
          .map(|v| v.to_string())
          .collect()
    });
    info!("reverted {} migrations on {}", reverted.len(), self.kind());
    Ok(reverted)
  }

  pub fn migration_status(&self) -> Result<MigrationStatus> {
    let status = with_migrations!(self, |conn, source| {
      let mut applied: Vec<String> =
        conn.applied_migrations().map_err(migration_error)?.into_iter().map(|v| v.to_string()).collect();
      applied.sort();
      let mut pending: Vec<String> = conn.pending_migrations(source)
                                         .map_err(migration_error)?
                                         .iter()
                                         .map(|m| m.name().version().to_string())
                                         .collect();
      pending.sort();
      MigrationStatus { applied, pending }
    });
    Ok(status)
  }

  /// Applies pending migrations one at a time in version order. After each
  /// one, `seed` may return SQL that is executed before the next migration.
  pub fn migrate_stepwise<F>(&self, mut seed: F) -> Result<Vec<String>>
    where F: FnMut(&str) -> Result<Option<String>>
  {
    let applied = with_migrations!(self, |conn, source| {
      let mut pending = conn.pending_migrations(source).map_err(migration_error)?;
      pending.sort_by_key(|m| m.name().version().to_string());
      let mut applied = Vec::with_capacity(pending.len());
      for migration in &pending {
        let version = conn.run_migration(&**migration).map_err(migration_error)?.to_string();
        debug!("applied migration {}", version);
        if let Some(sql) = seed(&version)? {
          conn.batch_execute(&sql)
              .map_err(|e| FlowError::BackendUnavailable(format!("seed data for {}: {}", version, e)))?;
          debug!("loaded seed data for {}", version);
        }
        applied.push(version);
      }
      applied
    });
    Ok(applied)
  }
}
