// File: models.rs
// Purpose: Diesel row structs and their conversion to and from the domain
// types of the `flow` crate.
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use flow::errors::{FlowError, Result};
use flow::{Flow, Identity, RecoveryAddress, RecoveryToken, Session, VerifiableAddress, VerificationToken};
use std::str::FromStr;
use uuid::Uuid;

/// Maps Diesel errors onto the shared taxonomy.
pub fn map_db_err(e: DieselError) -> FlowError {
  match e {
    DieselError::NotFound => FlowError::NotFound("row not found".into()),
    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
      FlowError::Conflict(format!("unique violation: {}", info.message()))
    }
    DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
      FlowError::Conflict(format!("foreign key violation: {}", info.message()))
    }
    DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
      FlowError::Conflict(format!("serialization failure: {}", info.message()))
    }
    other => FlowError::BackendUnavailable(format!("db: {}", other)),
  }
}

/// Error type used inside Diesel transactions, so a domain failure can
/// roll the transaction back.
#[derive(Debug)]
pub(crate) enum TxError {
  Db(DieselError),
  Flow(FlowError),
  /// The optimistic version check did not match.
  Stale,
}

impl From<DieselError> for TxError {
  fn from(e: DieselError) -> Self {
    TxError::Db(e)
  }
}

impl From<FlowError> for TxError {
  fn from(e: FlowError) -> Self {
    TxError::Flow(e)
  }
}

impl TxError {
  pub(crate) fn into_flow_error(self, what: &str) -> FlowError {
    match self {
      TxError::Db(e) => map_db_err(e),
      TxError::Flow(e) => e,
      TxError::Stale => FlowError::Conflict(format!("{} was modified concurrently", what)),
    }
  }
}

pub(crate) fn micros(t: DateTime<Utc>) -> i64 {
  t.timestamp_micros()
}

pub(crate) fn from_micros(v: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_micros(v).ok_or_else(|| FlowError::Validation(format!("timestamp {} out of range", v)))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
  Uuid::parse_str(s).map_err(|e| FlowError::Validation(format!("invalid uuid {:?}: {}", s, e)))
}

fn parse_enum<T>(s: &str) -> Result<T>
  where T: FromStr<Err = FlowError>
{
  s.parse()
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::identities)]
pub(crate) struct IdentityRow {
  pub id: String,
  pub schema_id: String,
  pub traits: String,
  pub state: String,
  pub created_at: i64,
  pub updated_at: i64,
}

impl IdentityRow {
  pub fn from_domain(i: &Identity) -> Result<Self> {
    Ok(Self { id: i.id.to_string(),
              schema_id: i.schema_id.clone(),
              traits: serde_json::to_string(&i.traits)?,
              state: i.state.as_str().to_string(),
              created_at: micros(i.created_at),
              updated_at: micros(i.updated_at) })
  }

  pub fn into_domain(self) -> Result<Identity> {
    Ok(Identity { id: parse_uuid(&self.id)?,
                  schema_id: self.schema_id,
                  traits: serde_json::from_str(&self.traits)?,
                  state: parse_enum(&self.state)?,
                  verifiable_addresses: Vec::new(),
                  recovery_addresses: Vec::new(),
                  created_at: from_micros(self.created_at)?,
                  updated_at: from_micros(self.updated_at)? })
  }
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::identity_verifiable_addresses)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct VerifiableAddressRow {
  pub id: String,
  pub identity_id: String,
  pub value: String,
  pub via: String,
  pub status: String,
  pub verified: bool,
  pub verified_at: Option<i64>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl VerifiableAddressRow {
  pub fn from_domain(a: &VerifiableAddress) -> Self {
    Self { id: a.id.to_string(),
           identity_id: a.identity_id.to_string(),
           value: a.value.clone(),
           via: a.via.as_str().to_string(),
           status: a.status.as_str().to_string(),
           verified: a.verified,
           verified_at: a.verified_at.map(micros),
           created_at: micros(a.created_at),
           updated_at: micros(a.updated_at) }
  }

  pub fn into_domain(self) -> Result<VerifiableAddress> {
    Ok(VerifiableAddress { id: parse_uuid(&self.id)?,
                           identity_id: parse_uuid(&self.identity_id)?,
                           value: self.value,
                           via: parse_enum(&self.via)?,
                           status: parse_enum(&self.status)?,
                           verified: self.verified,
                           verified_at: self.verified_at.map(from_micros).transpose()?,
                           created_at: from_micros(self.created_at)?,
                           updated_at: from_micros(self.updated_at)? })
  }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::identity_recovery_addresses)]
pub(crate) struct RecoveryAddressRow {
  pub id: String,
  pub identity_id: String,
  pub value: String,
  pub via: String,
  pub created_at: i64,
  pub updated_at: i64,
}

impl RecoveryAddressRow {
  pub fn from_domain(a: &RecoveryAddress) -> Self {
    Self { id: a.id.to_string(),
           identity_id: a.identity_id.to_string(),
           value: a.value.clone(),
           via: a.via.as_str().to_string(),
           created_at: micros(a.created_at),
           updated_at: micros(a.updated_at) }
  }

  pub fn into_domain(self) -> Result<RecoveryAddress> {
    Ok(RecoveryAddress { id: parse_uuid(&self.id)?,
                         identity_id: parse_uuid(&self.identity_id)?,
                         value: self.value,
                         via: parse_enum(&self.via)?,
                         created_at: from_micros(self.created_at)?,
                         updated_at: from_micros(self.updated_at)? })
  }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::sessions)]
pub(crate) struct SessionRow {
  pub id: String,
  pub identity_id: String,
  pub active: bool,
  pub issued_at: i64,
  pub expires_at: i64,
  pub authenticated_at: i64,
  pub created_at: i64,
  pub updated_at: i64,
}

impl SessionRow {
  pub fn from_domain(s: &Session) -> Self {
    Self { id: s.id.to_string(),
           identity_id: s.identity_id.to_string(),
           active: s.active,
           issued_at: micros(s.issued_at),
           expires_at: micros(s.expires_at),
           authenticated_at: micros(s.authenticated_at),
           created_at: micros(s.created_at),
           updated_at: micros(s.updated_at) }
  }

  pub fn into_domain(self) -> Result<Session> {
    Ok(Session { id: parse_uuid(&self.id)?,
                 identity_id: parse_uuid(&self.identity_id)?,
                 active: self.active,
                 issued_at: from_micros(self.issued_at)?,
                 expires_at: from_micros(self.expires_at)?,
                 authenticated_at: from_micros(self.authenticated_at)?,
                 created_at: from_micros(self.created_at)?,
                 updated_at: from_micros(self.updated_at)? })
  }
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::selfservice_flows)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct FlowRow {
  pub id: String,
  pub flow_type: String,
  pub request_url: String,
  pub issued_at: i64,
  pub expires_at: i64,
  pub active_method: Option<String>,
  pub csrf_token: String,
  pub status: String,
  pub ui: String,
  pub methods: String,
  pub identity_id: Option<String>,
  pub version: i64,
  pub created_at: i64,
  pub updated_at: i64,
  pub state: String,
}

impl FlowRow {
  /// Row for `flow`, stored with `version`.
  pub fn from_domain(f: &Flow, version: i64) -> Result<Self> {
    Ok(Self { id: f.id.to_string(),
              flow_type: f.flow_type.as_str().to_string(),
              request_url: f.request_url.clone(),
              issued_at: micros(f.issued_at),
              expires_at: micros(f.expires_at),
              active_method: f.active.clone(),
              csrf_token: f.csrf_token.clone(),
              status: f.status.as_str().to_string(),
              ui: serde_json::to_string(&f.ui)?,
              methods: serde_json::to_string(&f.methods)?,
              identity_id: f.identity_id.map(|u| u.to_string()),
              version,
              created_at: micros(f.created_at),
              updated_at: micros(f.updated_at),
              state: f.state.as_str().to_string() })
  }

  pub fn into_domain(self) -> Result<Flow> {
    Ok(Flow { id: parse_uuid(&self.id)?,
              flow_type: parse_enum(&self.flow_type)?,
              expires_at: from_micros(self.expires_at)?,
              issued_at: from_micros(self.issued_at)?,
              request_url: self.request_url,
              active: self.active_method,
              csrf_token: self.csrf_token,
              status: parse_enum(&self.status)?,
              state: parse_enum(&self.state)?,
              ui: serde_json::from_str(&self.ui)?,
              methods: serde_json::from_str(&self.methods)?,
              identity_id: self.identity_id.as_deref().map(parse_uuid).transpose()?,
              version: self.version,
              created_at: from_micros(self.created_at)?,
              updated_at: from_micros(self.updated_at)? })
  }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::identity_recovery_tokens)]
pub(crate) struct RecoveryTokenRow {
  pub id: String,
  pub token: String,
  pub flow_id: String,
  pub recovery_address_id: String,
  pub issued_at: i64,
  pub expires_at: i64,
  pub used: bool,
  pub used_at: Option<i64>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl RecoveryTokenRow {
  pub fn from_domain(t: &RecoveryToken) -> Self {
    Self { id: t.id.to_string(),
           token: t.token.clone(),
           flow_id: t.flow_id.to_string(),
           recovery_address_id: t.recovery_address_id.to_string(),
           issued_at: micros(t.issued_at),
           expires_at: micros(t.expires_at),
           used: t.used,
           used_at: t.used_at.map(micros),
           created_at: micros(t.created_at),
           updated_at: micros(t.updated_at) }
  }

  pub fn into_domain(self) -> Result<RecoveryToken> {
    Ok(RecoveryToken { id: parse_uuid(&self.id)?,
                       token: self.token,
                       flow_id: parse_uuid(&self.flow_id)?,
                       recovery_address_id: parse_uuid(&self.recovery_address_id)?,
                       issued_at: from_micros(self.issued_at)?,
                       expires_at: from_micros(self.expires_at)?,
                       used: self.used,
                       used_at: self.used_at.map(from_micros).transpose()?,
                       created_at: from_micros(self.created_at)?,
                       updated_at: from_micros(self.updated_at)? })
  }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::identity_verification_tokens)]
pub(crate) struct VerificationTokenRow {
  pub id: String,
  pub token: String,
  pub flow_id: String,
  pub verifiable_address_id: String,
  pub issued_at: i64,
  pub expires_at: i64,
  pub used: bool,
  pub used_at: Option<i64>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl VerificationTokenRow {
  pub fn from_domain(t: &VerificationToken) -> Self {
    Self { id: t.id.to_string(),
           token: t.token.clone(),
           flow_id: t.flow_id.to_string(),
           verifiable_address_id: t.verifiable_address_id.to_string(),
           issued_at: micros(t.issued_at),
           expires_at: micros(t.expires_at),
           used: t.used,
           used_at: t.used_at.map(micros),
           created_at: micros(t.created_at),
           updated_at: micros(t.updated_at) }
  }

  pub fn into_domain(self) -> Result<VerificationToken> {
    Ok(VerificationToken { id: parse_uuid(&self.id)?,
                           token: self.token,
                           flow_id: parse_uuid(&self.flow_id)?,
                           verifiable_address_id: parse_uuid(&self.verifiable_address_id)?,
                           issued_at: from_micros(self.issued_at)?,
                           expires_at: from_micros(self.expires_at)?,
                           used: self.used,
                           used_at: self.used_at.map(from_micros).transpose()?,
                           created_at: from_micros(self.created_at)?,
                           updated_at: from_micros(self.updated_at)? })
  }
}
