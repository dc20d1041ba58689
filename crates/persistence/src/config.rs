// File: config.rs
// Purpose: database settings read from the environment: connection URL,
// backend detected from its scheme, and pool size.
use flow::errors::{FlowError, Result};
use std::fmt;
use std::str::FromStr;

/// Storage engines the schema and migrations are maintained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
  Sqlite,
  Postgres,
  Mysql,
  Cockroach,
}

impl BackendKind {
  pub const ALL: [BackendKind; 4] = [BackendKind::Sqlite, BackendKind::Postgres, BackendKind::Mysql, BackendKind::Cockroach];

  pub fn as_str(&self) -> &'static str {
    match self {
      BackendKind::Sqlite => "sqlite",
      BackendKind::Postgres => "postgres",
      BackendKind::Mysql => "mysql",
      BackendKind::Cockroach => "cockroach",
    }
  }

  /// Whether this binary was built with support for the backend.
  pub fn is_compiled(&self) -> bool {
    match self {
      BackendKind::Sqlite => cfg!(feature = "sqlite"),
      BackendKind::Postgres => cfg!(feature = "postgres"),
      BackendKind::Mysql => cfg!(feature = "mysql"),
      BackendKind::Cockroach => cfg!(feature = "cockroach"),
    }
  }

  /// Detects the backend from a connection URL. Anything without a known
  /// scheme is taken as a SQLite file path.
  pub fn detect(url: &str) -> Self {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
      BackendKind::Postgres
    } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
      BackendKind::Mysql
    } else if lower.starts_with("cockroach://") || lower.starts_with("cockroachdb://") {
      BackendKind::Cockroach
    } else {
      BackendKind::Sqlite
    }
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for BackendKind {
  type Err = FlowError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "sqlite" | "sqlite3" => Ok(BackendKind::Sqlite),
      "postgres" | "postgresql" => Ok(BackendKind::Postgres),
      "mysql" => Ok(BackendKind::Mysql),
      "cockroach" | "cockroachdb" => Ok(BackendKind::Cockroach),
      other => Err(FlowError::Validation(format!("unknown backend {:?}", other))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
  pub url: String,
  pub kind: BackendKind,
  pub max_connections: u32,
}

impl DatabaseConfig {
  pub fn new(url: impl Into<String>) -> Self {
    let url = url.into();
    let kind = BackendKind::detect(&url);
    Self { url,
           kind,
           max_connections: 4 }
  }

  pub fn with_max_connections(mut self, n: u32) -> Self {
    self.max_connections = n.max(1);
    self
  }

  /// Reads `DATABASE_URL` (or `DSN`) and `DATABASE_MAX_CONNECTIONS`,
  /// loading `.env` first.
  pub fn from_env() -> Result<Self> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").or_else(|_| std::env::var("DSN"))
                                           .map_err(|_| FlowError::Validation("DATABASE_URL / DSN not set".into()))?;
    let mut config = Self::new(url);
    if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
      let n: u32 =
        raw.trim().parse().map_err(|_| FlowError::Validation(format!("DATABASE_MAX_CONNECTIONS: invalid number {:?}", raw)))?;
      config = config.with_max_connections(n);
    }
    Ok(config)
  }

  /// URL in the form the driver expects: `sqlite://` is stripped to a path
  /// and `cockroach://` becomes `postgres://`.
  pub fn connection_url(&self) -> String {
    match self.kind {
      BackendKind::Sqlite => {
        for prefix in ["sqlite3://", "sqlite://"] {
          if let Some(rest) = self.url.strip_prefix(prefix) {
            return rest.to_string();
          }
        }
        self.url.clone()
      }
      BackendKind::Cockroach => match self.url.split_once("://") {
        Some((_, rest)) => format!("postgres://{}", rest),
        None => self.url.clone(),
      },
      BackendKind::Postgres | BackendKind::Mysql => self.url.clone(),
    }
  }
}
