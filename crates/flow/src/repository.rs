// File: repository.rs
// Purpose: the persistence contract. Every backend (in-memory, SQLite,
// PostgreSQL, MySQL, CockroachDB) implements these traits with identical
// externally observable behavior.
use crate::domain::{Flow, FlowType};
use crate::errors::Result;
use crate::identity::{Identity, RecoveryAddress, RecoveryToken, Session, VerifiableAddress, VerificationToken};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Outcome of an optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistResult {
    Ok { new_version: i64 },
    Conflict,
}

/// Page request. Listing is always ordered by primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub fn first(per_page: u32) -> Self {
        Self::new(0, per_page)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.per_page)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(1000)
    }
}

/// Records written together with a flow update, as one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowEffects {
    pub identity: Option<Identity>,
    pub session: Option<Session>,
    pub recovery_token: Option<RecoveryToken>,
    pub verification_token: Option<VerificationToken>,
}

impl FlowEffects {
    pub fn is_empty(&self) -> bool {
        self.identity.is_none()
        && self.session.is_none()
        && self.recovery_token.is_none()
        && self.verification_token.is_none()
    }
}

/// Flow storage.
pub trait FlowPersister: Send + Sync {
    /// Inserts a new flow. Fails with `Conflict` if the id exists.
    fn create_flow(&self, flow: &Flow) -> Result<()>;

    /// Loads a flow, expired or not. `NotFound` if absent.
    fn get_flow(&self, id: &Uuid) -> Result<Flow>;

    /// Writes `flow` if the stored version equals `expected_version`; the
    /// stored version becomes `expected_version + 1`.
    fn update_flow(&self, flow: &Flow, expected_version: i64) -> Result<PersistResult>;

    /// `update_flow` plus the inserts in `effects`, atomically. Nothing is
    /// written when the version check fails.
    fn commit_flow(&self, flow: &Flow, expected_version: i64, effects: &FlowEffects) -> Result<PersistResult>;

    /// Flows ordered by id, optionally restricted to one type.
    fn list_flows(&self, flow_type: Option<FlowType>, page: Page) -> Result<Vec<Flow>>;

    fn delete_flow(&self, id: &Uuid) -> Result<()>;

    /// Deletes flows with `expires_at < before` and their tokens. Returns the
    /// number of flows removed.
    fn delete_expired_flows(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Identity storage, including owned addresses.
pub trait IdentityPersister: Send + Sync {
    /// Inserts the identity together with its addresses.
    fn create_identity(&self, identity: &Identity) -> Result<()>;

    /// Identity without addresses.
    fn get_identity(&self, id: &Uuid) -> Result<Identity>;

    /// Identity joined with its addresses, each list ordered by id.
    fn get_identity_confidential(&self, id: &Uuid) -> Result<Identity>;

    fn list_identities(&self, page: Page) -> Result<Vec<Identity>>;

    /// Deletes the identity and every address, session, flow and token that
    /// depends on it.
    fn delete_identity(&self, id: &Uuid) -> Result<()>;

    fn find_verifiable_address(&self, via: &str, value: &str) -> Result<VerifiableAddress>;
    fn get_verifiable_address(&self, id: &Uuid) -> Result<VerifiableAddress>;
    fn find_recovery_address(&self, via: &str, value: &str) -> Result<RecoveryAddress>;
    fn get_recovery_address(&self, id: &Uuid) -> Result<RecoveryAddress>;
}

pub trait SessionPersister: Send + Sync {
    fn create_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: &Uuid) -> Result<Session>;
    fn list_sessions(&self, page: Page) -> Result<Vec<Session>>;
    fn delete_session(&self, id: &Uuid) -> Result<()>;
}

/// Recovery and verification tokens.
pub trait TokenPersister: Send + Sync {
    fn create_recovery_token(&self, token: &RecoveryToken) -> Result<()>;
    fn get_recovery_token(&self, id: &Uuid) -> Result<RecoveryToken>;
    fn list_recovery_tokens(&self, page: Page) -> Result<Vec<RecoveryToken>>;
    fn delete_recovery_token(&self, id: &Uuid) -> Result<()>;

    /// Looks a token up by its secret value without consuming it.
    fn find_recovery_token(&self, token: &str) -> Result<RecoveryToken>;

    /// Consumes the token atomically. A second call for the same token
    /// observes it as used and fails with `Conflict`.
    fn use_recovery_token(&self, token: &str, now: DateTime<Utc>) -> Result<RecoveryToken>;

    /// Consumes the token and commits `flow` with `effects` (version checked
    /// against `expected_version`) in one transaction. On any failure nothing
    /// is written and the token stays redeemable. A stale flow is `Conflict`.
    fn redeem_recovery_token(&self,
                             token: &str,
                             now: DateTime<Utc>,
                             flow: &Flow,
                             expected_version: i64,
                             effects: &FlowEffects)
                             -> Result<RecoveryToken>;

    fn create_verification_token(&self, token: &VerificationToken) -> Result<()>;
    fn get_verification_token(&self, id: &Uuid) -> Result<VerificationToken>;
    fn list_verification_tokens(&self, page: Page) -> Result<Vec<VerificationToken>>;
    fn delete_verification_token(&self, id: &Uuid) -> Result<()>;

    fn find_verification_token(&self, token: &str) -> Result<VerificationToken>;

    /// Consumes the token and marks its address verified in the same
    /// transaction.
    fn use_verification_token(&self, token: &str, now: DateTime<Utc>) -> Result<VerificationToken>;

    /// `use_verification_token` plus the versioned commit of `flow`, as one
    /// transaction.
    fn redeem_verification_token(&self,
                                 token: &str,
                                 now: DateTime<Utc>,
                                 flow: &Flow,
                                 expected_version: i64,
                                 effects: &FlowEffects)
                                 -> Result<VerificationToken>;
}

/// Full persistence contract.
pub trait Persister: FlowPersister + IdentityPersister + SessionPersister + TokenPersister {}

impl<T> Persister for T where T: FlowPersister + IdentityPersister + SessionPersister + TokenPersister
{
}
