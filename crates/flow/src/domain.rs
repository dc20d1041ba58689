// File: domain.rs
// Purpose: the `Flow` entity and its state machine. `Flow::apply` is the
// single gate every mutation goes through, so expiry, csrf and status
// checks cannot be skipped by a new code path.
use crate::errors::{FlowError, Result};
use crate::method_config::MethodConfig;
use crate::ui::UiContainer;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Kinds of self-service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Login,
    Registration,
    Recovery,
    Verification,
    Settings,
}

impl FlowType {
    pub const ALL: [FlowType; 5] = [FlowType::Login,
                                    FlowType::Registration,
                                    FlowType::Recovery,
                                    FlowType::Verification,
                                    FlowType::Settings];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Login => "login",
            FlowType::Registration => "registration",
            FlowType::Recovery => "recovery",
            FlowType::Verification => "verification",
            FlowType::Settings => "settings",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlowType {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "login" => Ok(FlowType::Login),
            "registration" => Ok(FlowType::Registration),
            "recovery" => Ok(FlowType::Recovery),
            "verification" => Ok(FlowType::Verification),
            "settings" => Ok(FlowType::Settings),
            other => Err(FlowError::Validation(format!("unknown flow type {:?}", other))),
        }
    }
}

/// Lifecycle position. `Expired` is never stored: it is derived from
/// `expires_at` when the flow is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Issued,
    AwaitingMethod,
    MethodInProgress,
    Completed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Issued => "issued",
            FlowStatus::AwaitingMethod => "awaiting_method",
            FlowStatus::MethodInProgress => "method_in_progress",
            FlowStatus::Completed => "completed",
        }
    }
}

impl FromStr for FlowStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "issued" => Ok(FlowStatus::Issued),
            "awaiting_method" => Ok(FlowStatus::AwaitingMethod),
            "method_in_progress" => Ok(FlowStatus::MethodInProgress),
            "completed" => Ok(FlowStatus::Completed),
            other => Err(FlowError::Validation(format!("unknown flow status {:?}", other))),
        }
    }
}

/// Flow-type specific state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    ShowForm,
    ChooseMethod,
    SentEmail,
    PassedChallenge,
    Success,
}

impl FlowState {
    pub fn initial(flow_type: FlowType) -> Self {
        match flow_type {
            FlowType::Recovery | FlowType::Verification => FlowState::ChooseMethod,
            FlowType::Login | FlowType::Registration | FlowType::Settings => FlowState::ShowForm,
        }
    }

    pub fn is_valid_for(&self, flow_type: FlowType) -> bool {
        match flow_type {
            FlowType::Recovery | FlowType::Verification => {
                matches!(self, FlowState::ChooseMethod | FlowState::SentEmail | FlowState::PassedChallenge)
            }
            FlowType::Settings => matches!(self, FlowState::ShowForm | FlowState::Success),
            FlowType::Login | FlowType::Registration => matches!(self, FlowState::ShowForm),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::ShowForm => "show_form",
            FlowState::ChooseMethod => "choose_method",
            FlowState::SentEmail => "sent_email",
            FlowState::PassedChallenge => "passed_challenge",
            FlowState::Success => "success",
        }
    }
}

impl FromStr for FlowState {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "show_form" => Ok(FlowState::ShowForm),
            "choose_method" => Ok(FlowState::ChooseMethod),
            "sent_email" => Ok(FlowState::SentEmail),
            "passed_challenge" => Ok(FlowState::PassedChallenge),
            "success" => Ok(FlowState::Success),
            other => Err(FlowError::Validation(format!("unknown flow state {:?}", other))),
        }
    }
}

/// A persisted, time-bounded self-service operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub request_url: String,
    pub active: Option<String>,
    pub csrf_token: String,
    pub status: FlowStatus,
    pub state: FlowState,
    pub ui: UiContainer,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodConfig>,
    pub identity_id: Option<Uuid>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutations accepted by `Flow::apply`.
#[derive(Debug, Clone)]
pub enum Transition<'a> {
    /// UI rendered for the first time: `Issued -> AwaitingMethod`.
    Render,
    /// A submission arrived: checks expiry and csrf, then
    /// `Issued | AwaitingMethod -> MethodInProgress`.
    BeginSubmit { strategy: &'a str, csrf_token: &'a str },
    /// Strategy asked for a re-render; the csrf token is rotated.
    Rerender { state: Option<FlowState>, csrf_token: String },
    /// Strategy completed the flow.
    Complete { state: Option<FlowState> },
    /// An out-of-band proof (recovery or verification link) was redeemed.
    ChallengePassed { identity_id: Uuid },
}

impl Flow {
    /// Creates a flow in `Issued`. `expires_at == issued_at + ttl`; a
    /// non-positive ttl is rejected.
    pub fn new(flow_type: FlowType,
               request_url: impl Into<String>,
               ttl: Duration,
               now: DateTime<Utc>,
               csrf_token: String)
               -> Result<Self> {
        if ttl <= Duration::zero() {
            return Err(FlowError::Validation(format!("ttl for {} flows must be positive", flow_type)));
        }
        // Storage keeps microseconds; truncate so a round trip is exact.
        let issued_at = now.trunc_subsecs(6);
        let id = Uuid::new_v4();
        Ok(Self { id,
                  flow_type,
                  expires_at: issued_at + ttl,
                  issued_at,
                  request_url: request_url.into(),
                  active: None,
                  csrf_token,
                  status: FlowStatus::Issued,
                  state: FlowState::initial(flow_type),
                  ui: UiContainer::new(String::new(), "POST"),
                  methods: BTreeMap::new(),
                  identity_id: None,
                  version: 0,
                  created_at: issued_at,
                  updated_at: issued_at })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Returns `Expired` when the TTL elapsed.
    pub fn ensure_not_expired(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired(now) {
            return Err(FlowError::Expired { flow_id: self.id,
                                            expired_at: self.expires_at });
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, FlowStatus::Issued | FlowStatus::AwaitingMethod)
    }

    /// Applies one transition. Every mutation path of the engine calls this.
    pub fn apply(&mut self, transition: Transition<'_>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_not_expired(now)?;
        match transition {
            Transition::Render => {
                if self.status == FlowStatus::Issued {
                    self.status = FlowStatus::AwaitingMethod;
                }
                if self.status == FlowStatus::Completed {
                    return Err(FlowError::Validation(format!("flow {} is already completed", self.id)));
                }
            }
            Transition::BeginSubmit { strategy, csrf_token } => {
                if !self.is_open() {
                    return Err(FlowError::Validation(format!("flow {} does not accept submissions in status {}",
                                                             self.id,
                                                             self.status.as_str())));
                }
                if !csrf_matches(&self.csrf_token, csrf_token) {
                    return Err(FlowError::CsrfMismatch { flow_id: self.id });
                }
                self.status = FlowStatus::MethodInProgress;
                self.active = Some(strategy.to_string());
            }
            Transition::Rerender { state, csrf_token } => {
                self.require_in_progress()?;
                if let Some(s) = state {
                    self.set_state(s)?;
                }
                self.csrf_token = csrf_token;
                self.status = FlowStatus::AwaitingMethod;
            }
            Transition::Complete { state } => {
                self.require_in_progress()?;
                if let Some(s) = state {
                    self.set_state(s)?;
                }
                self.status = FlowStatus::Completed;
            }
            Transition::ChallengePassed { identity_id } => {
                if !self.is_open() {
                    return Err(FlowError::Validation(format!("flow {} is not waiting for a challenge", self.id)));
                }
                self.set_state(FlowState::PassedChallenge)?;
                self.identity_id = Some(identity_id);
                self.status = FlowStatus::Completed;
            }
        }
        self.updated_at = now.trunc_subsecs(6);
        Ok(())
    }

    fn require_in_progress(&self) -> Result<()> {
        if self.status != FlowStatus::MethodInProgress {
            return Err(FlowError::Validation(format!("flow {} has no submission in progress", self.id)));
        }
        Ok(())
    }

    fn set_state(&mut self, state: FlowState) -> Result<()> {
        if !state.is_valid_for(self.flow_type) {
            return Err(FlowError::Validation(format!("state {} is not valid for {} flows",
                                                     state.as_str(),
                                                     self.flow_type)));
        }
        self.state = state;
        Ok(())
    }
}

fn csrf_matches(expected: &str, given: &str) -> bool {
    expected.len() == given.len() && bool::from(expected.as_bytes().ct_eq(given.as_bytes()))
}

/// Random url-safe token of `len` bytes of entropy.
pub fn generate_token(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
