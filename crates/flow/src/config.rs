// File: config.rs
// Purpose: engine configuration: public base URL, enabled flow types and
// their time-to-live. Loaded from the environment (and `.env`).
use crate::domain::FlowType;
use crate::errors::{FlowError, Result};
use chrono::Duration;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use url::Url;

/// Per flow type settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTypeConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for FlowTypeConfig {
    fn default() -> Self {
        Self { enabled: true,
               ttl: Duration::hours(1) }
    }
}

#[derive(Debug, Clone)]
pub struct FlowEngineConfig {
    /// Public URL the form actions are derived from.
    pub base_url: Url,
    pub flows: BTreeMap<FlowType, FlowTypeConfig>,
    /// Bytes of entropy in csrf and link tokens.
    pub token_length: usize,
    /// Lifetime of recovery and verification tokens.
    pub token_ttl: Duration,
    /// Lifetime of sessions created by completed flows.
    pub session_lifespan: Duration,
}

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4433/";

// DEFAULT_BASE_URL is a literal absolute URL; parsed once.
static DEFAULT_BASE: Lazy<Url> = Lazy::new(|| Url::parse(DEFAULT_BASE_URL).expect("DEFAULT_BASE_URL is absolute"));

impl Default for FlowEngineConfig {
    fn default() -> Self {
        let flows = FlowType::ALL.iter().map(|t| (*t, FlowTypeConfig::default())).collect();
        Self { base_url: DEFAULT_BASE.clone(),
               flows,
               token_length: 32,
               token_ttl: Duration::hours(1),
               session_lifespan: Duration::hours(24) }
    }
}

impl FlowEngineConfig {
    /// Reads `SELFSERVICE_BASE_URL`, `SELFSERVICE_<TYPE>_ENABLED` and
    /// `SELFSERVICE_<TYPE>_TTL_SECS`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
        where F: Fn(&str) -> Option<String>
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("SELFSERVICE_BASE_URL") {
            config = config.with_base_url(&raw)?;
        }
        for flow_type in FlowType::ALL {
            let prefix = format!("SELFSERVICE_{}", flow_type.as_str().to_uppercase());
            let entry = config.flows.entry(flow_type).or_default();
            if let Some(raw) = lookup(&format!("{}_ENABLED", prefix)) {
                entry.enabled = parse_bool(&raw).ok_or_else(|| {
                                                    FlowError::Validation(format!("{}_ENABLED: expected a boolean, got {:?}", prefix, raw))
                                                })?;
            }
            if let Some(raw) = lookup(&format!("{}_TTL_SECS", prefix)) {
                let secs: i64 = raw.trim()
                                   .parse()
                                   .map_err(|_| FlowError::Validation(format!("{}_TTL_SECS: invalid number {:?}", prefix, raw)))?;
                if secs <= 0 {
                    return Err(FlowError::Validation(format!("{}_TTL_SECS must be positive", prefix)));
                }
                entry.ttl = Duration::seconds(secs);
            }
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| FlowError::Validation(format!("base url {:?}: {}", raw, e)))?;
        if url.cannot_be_a_base() {
            return Err(FlowError::Validation(format!("base url {:?} is not absolute", raw)));
        }
        self.base_url = url;
        Ok(self)
    }

    pub fn with_flow(mut self, flow_type: FlowType, enabled: bool, ttl: Duration) -> Self {
        self.flows.insert(flow_type, FlowTypeConfig { enabled, ttl });
        self
    }

    pub fn flow(&self, flow_type: FlowType) -> FlowTypeConfig {
        self.flows.get(&flow_type).copied().unwrap_or(FlowTypeConfig { enabled: false,
                                                                        ttl: Duration::zero() })
    }

    /// Submission endpoint for a flow, e.g.
    /// `https://host/self-service/login?flow=<id>`.
    pub fn action_url(&self, flow_type: FlowType, flow_id: &uuid::Uuid) -> Result<String> {
        let mut url = self.base_url
                          .join(&format!("self-service/{}", flow_type.as_str()))
                          .map_err(|e| FlowError::Validation(format!("action url: {}", e)))?;
        url.query_pairs_mut().append_pair("flow", &flow_id.to_string());
        Ok(url.to_string())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
