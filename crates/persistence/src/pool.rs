// File: pool.rs
// Purpose: connection pools per backend and the `with_conn!` macro that runs
// one Diesel body against whichever backend is configured.
use crate::config::{BackendKind, DatabaseConfig};
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use flow::errors::{FlowError, Result};
use log::debug;

#[cfg(not(any(feature = "sqlite", feature = "postgres", feature = "mysql")))]
compile_error!("enable at least one of the `sqlite`, `postgres` or `mysql` features");

#[cfg(feature = "sqlite")]
pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/sqlite");
#[cfg(feature = "postgres")]
pub const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/postgres");
#[cfg(feature = "cockroach")]
pub const COCKROACH_MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/cockroach");
#[cfg(feature = "mysql")]
pub const MYSQL_MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/mysql");

pub enum DbPool {
  #[cfg(feature = "sqlite")]
  Sqlite(Pool<ConnectionManager<diesel::sqlite::SqliteConnection>>),
  #[cfg(feature = "postgres")]
  Postgres(Pool<ConnectionManager<diesel::pg::PgConnection>>),
  #[cfg(feature = "mysql")]
  Mysql(Pool<ConnectionManager<diesel::mysql::MysqlConnection>>),
}

/// Runs `$body` with `$conn` bound to a `&mut` connection of the configured
/// backend. The body is compiled once per enabled backend.
macro_rules! with_conn {
  ($db:expr, |$conn:ident| $body:expr) => {{
    match $db.pool() {
      #[cfg(feature = "sqlite")]
      $crate::pool::DbPool::Sqlite(pool) => {
        let mut pooled = pool.get().map_err($crate::pool::pool_error)?;
        let $conn: &mut ::diesel::sqlite::SqliteConnection = &mut pooled;
        $body
      }
      #[cfg(feature = "postgres")]
      $crate::pool::DbPool::Postgres(pool) => {
        let mut pooled = pool.get().map_err($crate::pool::pool_error)?;
        let $conn: &mut ::diesel::pg::PgConnection = &mut pooled;
        $body
      }
      #[cfg(feature = "mysql")]
      $crate::pool::DbPool::Mysql(pool) => {
        let mut pooled = pool.get().map_err($crate::pool::pool_error)?;
        let $conn: &mut ::diesel::mysql::MysqlConnection = &mut pooled;
        $body
      }
    }
  }};
}
pub(crate) use with_conn;

pub fn pool_error(e: PoolError) -> FlowError {
  FlowError::BackendUnavailable(format!("pool: {}", e))
}

#[cfg(feature = "sqlite")]
#[derive(Debug)]
struct SqlitePragmas;

#[cfg(feature = "sqlite")]
impl r2d2::CustomizeConnection<diesel::sqlite::SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
  fn on_acquire(&self, conn: &mut diesel::sqlite::SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
    use diesel::connection::SimpleConnection;
    conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        .map_err(diesel::r2d2::Error::QueryError)
  }
}

/// A pool plus the backend it talks to.
pub struct Database {
  pool: DbPool,
  kind: BackendKind,
}

impl Database {
  pub fn connect(config: &DatabaseConfig) -> Result<Self> {
    if !config.kind.is_compiled() {
      return Err(FlowError::Validation(format!("backend {} is not compiled in; enable the `{}` feature",
                                               config.kind, config.kind)));
    }
    let url = config.connection_url();
    let size = config.max_connections;
    let pool = match config.kind {
      #[cfg(feature = "sqlite")]
      BackendKind::Sqlite => DbPool::Sqlite(Pool::builder().max_size(size)
                                                           .connection_customizer(Box::new(SqlitePragmas))
                                                           .build(ConnectionManager::new(url))
                                                           .map_err(pool_error)?),
      #[cfg(feature = "postgres")]
      BackendKind::Postgres | BackendKind::Cockroach => {
        DbPool::Postgres(Pool::builder().max_size(size).build(ConnectionManager::new(url)).map_err(pool_error)?)
      }
      #[cfg(feature = "mysql")]
      BackendKind::Mysql => DbPool::Mysql(Pool::builder().max_size(size).build(ConnectionManager::new(url)).map_err(pool_error)?),
      #[allow(unreachable_patterns)]
      other => return Err(FlowError::Validation(format!("backend {} is not compiled in", other))),
    };
    debug!("connected to {} backend", config.kind);
    Ok(Self { pool, kind: config.kind })
  }

  pub fn pool(&self) -> &DbPool {
    &self.pool
  }

  pub fn kind(&self) -> BackendKind {
    self.kind
  }
}

/// Migration set of a backend. CockroachDB has its own set because some
/// schema changes cannot share a transaction with data updates there.
#[cfg(feature = "sqlite")]
pub fn sqlite_migrations() -> EmbeddedMigrations {
  SQLITE_MIGRATIONS
}

#[cfg(feature = "postgres")]
pub fn pg_migrations(kind: BackendKind) -> EmbeddedMigrations {
  match kind {
    #[cfg(feature = "cockroach")]
    BackendKind::Cockroach => COCKROACH_MIGRATIONS,
    _ => POSTGRES_MIGRATIONS,
  }
}

#[cfg(feature = "mysql")]
pub fn mysql_migrations() -> EmbeddedMigrations {
  MYSQL_MIGRATIONS
}

/// Runs `$body` with `$conn` bound to a connection and `$source` to the
/// migration set of the configured backend.
macro_rules! with_migrations {
  ($db:expr, |$conn:ident, $source:ident| $body:expr) => {{
    let kind = $db.kind();
    match $db.pool() {
      #[cfg(feature = "sqlite")]
      $crate::pool::DbPool::Sqlite(pool) => {
        let mut pooled = pool.get().map_err($crate::pool::pool_error)?;
        let $conn: &mut ::diesel::sqlite::SqliteConnection = &mut pooled;
        let $source = $crate::pool::sqlite_migrations();
        let _ = kind;
        $body
      }
      #[cfg(feature = "postgres")]
      $crate::pool::DbPool::Postgres(pool) => {
        let mut pooled = pool.get().map_err($crate::pool::pool_error)?;
        let $conn: &mut ::diesel::pg::PgConnection = &mut pooled;
        let $source = $crate::pool::pg_migrations(kind);
        $body
      }
      #[cfg(feature = "mysql")]
      $crate::pool::DbPool::Mysql(pool) => {
        let mut pooled = pool.get().map_err($crate::pool::pool_error)?;
        let $conn: &mut ::diesel::mysql::MysqlConnection = &mut pooled;
        let $source = $crate::pool::mysql_migrations();
        let _ = kind;
        $body
      }
    }
  }};
}
pub(crate) use with_migrations;
