// File: identity.rs
// Purpose: entities the flows act upon: identities with their addresses,
// sessions, and the single-use tokens backing recovery and verification.
use crate::errors::{FlowError, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressVia {
    Email,
    Sms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Sent,
    Completed,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = FlowError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(FlowError::Validation(format!(concat!("unknown ", stringify!($ty), " {:?}"), other))),
                }
            }
        }
    };
}

str_enum!(IdentityState { Active => "active", Inactive => "inactive" });
str_enum!(AddressVia { Email => "email", Sms => "sms" });
str_enum!(VerificationStatus { Pending => "pending", Sent => "sent", Completed => "completed" });

/// Subject of the self-service flows. Owns its addresses: deleting the
/// identity deletes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub schema_id: String,
    pub traits: JsonValue,
    pub state: IdentityState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verifiable_addresses: Vec<VerifiableAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_addresses: Vec<RecoveryAddress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(schema_id: impl Into<String>, traits: JsonValue, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self { id: Uuid::new_v4(),
               schema_id: schema_id.into(),
               traits,
               state: IdentityState::Active,
               verifiable_addresses: Vec::new(),
               recovery_addresses: Vec::new(),
               created_at: now,
               updated_at: now }
    }

    /// Adds an email address usable for both verification and recovery.
    pub fn with_email(mut self, email: &str) -> Self {
        let email = email.trim().to_lowercase();
        self.verifiable_addresses
            .push(VerifiableAddress::new(self.id, &email, AddressVia::Email, self.created_at));
        self.recovery_addresses
            .push(RecoveryAddress::new(self.id, &email, AddressVia::Email, self.created_at));
        self
    }

    /// Identity with address lists emptied, as compared by snapshot tests.
    pub fn without_addresses(&self) -> Self {
        let mut i = self.clone();
        i.verifiable_addresses.clear();
        i.recovery_addresses.clear();
        i
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiableAddress {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub value: String,
    pub via: AddressVia,
    pub status: VerificationStatus,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerifiableAddress {
    pub fn new(identity_id: Uuid, value: &str, via: AddressVia, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self { id: Uuid::new_v4(),
               identity_id,
               value: value.to_string(),
               via,
               status: VerificationStatus::Pending,
               verified: false,
               verified_at: None,
               created_at: now,
               updated_at: now }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAddress {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub value: String,
    pub via: AddressVia,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryAddress {
    pub fn new(identity_id: Uuid, value: &str, via: AddressVia, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self { id: Uuid::new_v4(),
               identity_id,
               value: value.to_string(),
               via,
               created_at: now,
               updated_at: now }
    }
}

/// Authenticated session. References its identity by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub active: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub authenticated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity_id: Uuid, lifespan: Duration, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self { id: Uuid::new_v4(),
               identity_id,
               active: true,
               issued_at: now,
               expires_at: now + lifespan,
               authenticated_at: now,
               created_at: now,
               updated_at: now }
    }
}

/// Single-use proof sent to a recovery address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryToken {
    pub id: Uuid,
    pub token: String,
    pub flow_id: Uuid,
    pub recovery_address_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryToken {
    pub fn new(token: String, flow_id: Uuid, recovery_address_id: Uuid, ttl: Duration, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self { id: Uuid::new_v4(),
               token,
               flow_id,
               recovery_address_id,
               issued_at: now,
               expires_at: now + ttl,
               used: false,
               used_at: None,
               created_at: now,
               updated_at: now }
    }
}

/// Single-use proof sent to a verifiable address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationToken {
    pub id: Uuid,
    pub token: String,
    pub flow_id: Uuid,
    pub verifiable_address_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationToken {
    pub fn new(token: String, flow_id: Uuid, verifiable_address_id: Uuid, ttl: Duration, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self { id: Uuid::new_v4(),
               token,
               flow_id,
               verifiable_address_id,
               issued_at: now,
               expires_at: now + ttl,
               used: false,
               used_at: None,
               created_at: now,
               updated_at: now }
    }
}

/// Checks shared by every backend before a token is consumed.
pub fn check_redeemable(kind: &str, used: bool, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if used {
        return Err(FlowError::Conflict(format!("{} token was already used", kind)));
    }
    if now > expires_at {
        return Err(FlowError::Conflict(format!("{} token expired at {}", kind, expires_at)));
    }
    Ok(())
}
