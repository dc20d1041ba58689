// File: persister.rs
// Purpose: SQL implementation of the persistence contract. Each method body
// is written once and compiled for every enabled backend by `with_conn!`.
//
// Cascades are explicit deletes inside one transaction, so the behavior is
// the same on engines with and without `ON DELETE CASCADE` support.
use crate::config::DatabaseConfig;
use crate::models::{from_micros, map_db_err, micros, FlowRow, IdentityRow, RecoveryAddressRow, RecoveryTokenRow, SessionRow,
                    TxError, VerifiableAddressRow, VerificationTokenRow};
use crate::pool::{with_conn, Database};
use crate::schema::{identities as ids, identity_recovery_addresses as ra, identity_recovery_tokens as rt,
                    identity_verifiable_addresses as va, identity_verification_tokens as vt, selfservice_flows as fl,
                    sessions as se};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use flow::errors::{FlowError, Result};
use flow::identity::check_redeemable;
use flow::{Flow, FlowEffects, FlowPersister, FlowType, Identity, IdentityPersister, Page, PersistResult, RecoveryAddress,
           RecoveryToken, Session, SessionPersister, TokenPersister, VerifiableAddress, VerificationToken};
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

/// Identity plus address rows, inserted together.
struct IdentityRows {
  identity: IdentityRow,
  verifiable: Vec<VerifiableAddressRow>,
  recovery: Vec<RecoveryAddressRow>,
}

impl IdentityRows {
  fn from_domain(i: &Identity) -> Result<Self> {
    Ok(Self { identity: IdentityRow::from_domain(i)?,
              verifiable: i.verifiable_addresses.iter().map(VerifiableAddressRow::from_domain).collect(),
              recovery: i.recovery_addresses.iter().map(RecoveryAddressRow::from_domain).collect() })
  }
}

// Inside a transaction: `?` lifts Diesel errors into `TxError`.
macro_rules! insert_identity_rows {
  ($conn:expr, $rows:expr) => {{
    let rows: &IdentityRows = $rows;
    diesel::insert_into(ids::table).values(&rows.identity).execute($conn)?;
    for a in &rows.verifiable {
      diesel::insert_into(va::table).values(a).execute($conn)?;
    }
    for a in &rows.recovery {
      diesel::insert_into(ra::table).values(a).execute($conn)?;
    }
  }};
}

/// Rows written by a versioned flow commit.
struct CommitRows {
  flow: FlowRow,
  expected_version: i64,
  identity: Option<IdentityRows>,
  session: Option<SessionRow>,
  recovery_token: Option<RecoveryTokenRow>,
  verification_token: Option<VerificationTokenRow>,
}

impl CommitRows {
  fn from_domain(flow: &Flow, expected_version: i64, effects: &FlowEffects) -> Result<Self> {
    Ok(Self { flow: FlowRow::from_domain(flow, expected_version + 1)?,
              expected_version,
              identity: effects.identity.as_ref().map(IdentityRows::from_domain).transpose()?,
              session: effects.session.as_ref().map(SessionRow::from_domain),
              recovery_token: effects.recovery_token.as_ref().map(RecoveryTokenRow::from_domain),
              verification_token: effects.verification_token.as_ref().map(VerificationTokenRow::from_domain) })
  }
}

// Inside a transaction. A version mismatch returns `TxError::Stale`.
macro_rules! write_commit_rows {
  ($conn:expr, $rows:expr) => {{
    let rows: &CommitRows = $rows;
    if let Some(identity) = &rows.identity {
      insert_identity_rows!($conn, identity);
    }
    let updated = diesel::update(fl::table.filter(fl::id.eq(&rows.flow.id)).filter(fl::version.eq(rows.expected_version)))
                    .set(&rows.flow)
                    .execute($conn)?;
    if updated == 0 {
      return Err(TxError::Stale);
    }
    if let Some(s) = &rows.session {
      diesel::insert_into(se::table).values(s).execute($conn)?;
    }
    if let Some(t) = &rows.recovery_token {
      diesel::insert_into(rt::table).values(t).execute($conn)?;
    }
    if let Some(t) = &rows.verification_token {
      diesel::insert_into(vt::table).values(t).execute($conn)?;
    }
  }};
}

// Inside a transaction, as its first statement: the guarded update takes the
// write lock before anything is read, so a concurrent redemption waits and
// then matches zero rows.
macro_rules! consume_recovery_token {
  ($conn:expr, $token:expr, $now:expr) => {{
    let token: &str = $token;
    let now: DateTime<Utc> = $now;
    let now_us = micros(now);
    let updated = diesel::update(rt::table.filter(rt::token.eq(token))
                                          .filter(rt::used.eq(false))
                                          .filter(rt::expires_at.ge(now_us)))
                    .set((rt::used.eq(true), rt::used_at.eq(Some(now_us)), rt::updated_at.eq(now_us)))
                    .execute($conn)?;
    let row = rt::table.filter(rt::token.eq(token))
                       .first::<RecoveryTokenRow>($conn)
                       .optional()?
                       .ok_or_else(|| FlowError::NotFound("recovery token".into()))?;
    if updated == 0 {
      check_redeemable("recovery", row.used, from_micros(row.expires_at)?, now)?;
      return Err(TxError::Flow(FlowError::Conflict("recovery token was already used".into())));
    }
    row
  }};
}

// Same as `consume_recovery_token!`, and marks the address verified.
macro_rules! consume_verification_token {
  ($conn:expr, $token:expr, $now:expr) => {{
    let token: &str = $token;
    let now: DateTime<Utc> = $now;
    let now_us = micros(now);
    let updated = diesel::update(vt::table.filter(vt::token.eq(token))
                                          .filter(vt::used.eq(false))
                                          .filter(vt::expires_at.ge(now_us)))
                    .set((vt::used.eq(true), vt::used_at.eq(Some(now_us)), vt::updated_at.eq(now_us)))
                    .execute($conn)?;
    let row = vt::table.filter(vt::token.eq(token))
                       .first::<VerificationTokenRow>($conn)
                       .optional()?
                       .ok_or_else(|| FlowError::NotFound("verification token".into()))?;
    if updated == 0 {
      check_redeemable("verification", row.used, from_micros(row.expires_at)?, now)?;
      return Err(TxError::Flow(FlowError::Conflict("verification token was already used".into())));
    }
    diesel::update(va::table.filter(va::id.eq(&row.verifiable_address_id)))
      .set((va::verified.eq(true),
            va::verified_at.eq(Some(now_us)),
            va::status.eq("completed"),
            va::updated_at.eq(now_us)))
      .execute($conn)?;
    row
  }};
}

/// Diesel-backed `Persister` over any configured backend.
#[derive(Clone)]
pub struct SqlPersister {
  db: Arc<Database>,
}

impl SqlPersister {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn connect(config: &DatabaseConfig) -> Result<Self> {
    Ok(Self::new(Arc::new(Database::connect(config)?)))
  }

  pub fn database(&self) -> &Arc<Database> {
    &self.db
  }
}

impl FlowPersister for SqlPersister {
  fn create_flow(&self, flow: &Flow) -> Result<()> {
    let row = FlowRow::from_domain(flow, flow.version)?;
    with_conn!(self.db, |conn| {
      diesel::insert_into(fl::table).values(&row).execute(conn).map_err(map_db_err)?;
    });
    debug!("stored {} flow {}", flow.flow_type, flow.id);
    Ok(())
  }

  fn get_flow(&self, id: &Uuid) -> Result<Flow> {
    let row = with_conn!(self.db, |conn| {
      fl::table.filter(fl::id.eq(id.to_string())).first::<FlowRow>(conn).optional().map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("flow", id))?.into_domain()
  }

  fn update_flow(&self, flow: &Flow, expected_version: i64) -> Result<PersistResult> {
    self.commit_flow(flow, expected_version, &FlowEffects::default())
  }

  fn commit_flow(&self, flow: &Flow, expected_version: i64, effects: &FlowEffects) -> Result<PersistResult> {
    let rows = CommitRows::from_domain(flow, expected_version, effects)?;
    let outcome = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            write_commit_rows!(conn, &rows);
            Ok(())
          })
    });
    match outcome {
      Ok(()) => Ok(PersistResult::Ok { new_version: expected_version + 1 }),
      Err(TxError::Stale) => Ok(PersistResult::Conflict),
      Err(e) => Err(e.into_flow_error("flow")),
    }
  }

  fn list_flows(&self, flow_type: Option<FlowType>, page: Page) -> Result<Vec<Flow>> {
    let rows = with_conn!(self.db, |conn| {
      let mut query = fl::table.into_boxed();
      if let Some(t) = flow_type {
        query = query.filter(fl::flow_type.eq(t.as_str()));
      }
      query.order(fl::id.asc())
           .limit(page.limit())
           .offset(page.offset())
           .load::<FlowRow>(conn)
           .map_err(map_db_err)?
    });
    rows.into_iter().map(FlowRow::into_domain).collect()
  }

  fn delete_flow(&self, id: &Uuid) -> Result<()> {
    let id_s = id.to_string();
    let deleted = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            diesel::delete(rt::table.filter(rt::flow_id.eq(&id_s))).execute(conn)?;
            diesel::delete(vt::table.filter(vt::flow_id.eq(&id_s))).execute(conn)?;
            Ok(diesel::delete(fl::table.filter(fl::id.eq(&id_s))).execute(conn)?)
          })
          .map_err(|e| e.into_flow_error("flow"))?
    });
    if deleted == 0 {
      return Err(FlowError::not_found("flow", id));
    }
    Ok(())
  }

  fn delete_expired_flows(&self, before: DateTime<Utc>) -> Result<u64> {
    let cutoff = micros(before);
    let removed = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            let expired: Vec<String> = fl::table.filter(fl::expires_at.lt(cutoff)).select(fl::id).load(conn)?;
            if expired.is_empty() {
              return Ok(0);
            }
            diesel::delete(rt::table.filter(rt::flow_id.eq_any(&expired))).execute(conn)?;
            diesel::delete(vt::table.filter(vt::flow_id.eq_any(&expired))).execute(conn)?;
            Ok(diesel::delete(fl::table.filter(fl::id.eq_any(&expired))).execute(conn)?)
          })
          .map_err(|e| e.into_flow_error("flow"))?
    });
    Ok(removed as u64)
  }
}

impl IdentityPersister for SqlPersister {
  fn create_identity(&self, identity: &Identity) -> Result<()> {
    let rows = IdentityRows::from_domain(identity)?;
    with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            insert_identity_rows!(conn, &rows);
            Ok(())
          })
          .map_err(|e| e.into_flow_error("identity"))?
    });
    Ok(())
  }

  fn get_identity(&self, id: &Uuid) -> Result<Identity> {
    let row = with_conn!(self.db, |conn| {
      ids::table.filter(ids::id.eq(id.to_string()))
                .first::<IdentityRow>(conn)
                .optional()
                .map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("identity", id))?.into_domain()
  }

  fn get_identity_confidential(&self, id: &Uuid) -> Result<Identity> {
    let id_s = id.to_string();
    let (row, verifiable, recovery) = with_conn!(self.db, |conn| {
      let row = ids::table.filter(ids::id.eq(&id_s))
                          .first::<IdentityRow>(conn)
                          .optional()
                          .map_err(map_db_err)?;
      let verifiable = va::table.filter(va::identity_id.eq(&id_s))
                                .order(va::id.asc())
                                .load::<VerifiableAddressRow>(conn)
                                .map_err(map_db_err)?;
      let recovery = ra::table.filter(ra::identity_id.eq(&id_s))
                              .order(ra::id.asc())
                              .load::<RecoveryAddressRow>(conn)
                              .map_err(map_db_err)?;
      (row, verifiable, recovery)
    });
    let mut identity = row.ok_or_else(|| FlowError::not_found("identity", id))?.into_domain()?;
    identity.verifiable_addresses = verifiable.into_iter()
                                              .map(VerifiableAddressRow::into_domain)
                                              .collect::<Result<_>>()?;
    identity.recovery_addresses = recovery.into_iter()
                                          .map(RecoveryAddressRow::into_domain)
                                          .collect::<Result<_>>()?;
    Ok(identity)
  }

  fn list_identities(&self, page: Page) -> Result<Vec<Identity>> {
    let rows = with_conn!(self.db, |conn| {
      ids::table.order(ids::id.asc())
                .limit(page.limit())
                .offset(page.offset())
                .load::<IdentityRow>(conn)
                .map_err(map_db_err)?
    });
    rows.into_iter().map(IdentityRow::into_domain).collect()
  }

  fn delete_identity(&self, id: &Uuid) -> Result<()> {
    let id_s = id.to_string();
    with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            let exists: i64 = ids::table.filter(ids::id.eq(&id_s)).count().get_result(conn)?;
            if exists == 0 {
              return Err(TxError::Flow(FlowError::not_found("identity", &id_s)));
            }
            let flows: Vec<String> = fl::table.filter(fl::identity_id.eq(&id_s)).select(fl::id).load(conn)?;
            let verifiable: Vec<String> = va::table.filter(va::identity_id.eq(&id_s)).select(va::id).load(conn)?;
            let recovery: Vec<String> = ra::table.filter(ra::identity_id.eq(&id_s)).select(ra::id).load(conn)?;
            diesel::delete(vt::table.filter(vt::flow_id.eq_any(&flows).or(vt::verifiable_address_id.eq_any(&verifiable))))
              .execute(conn)?;
            diesel::delete(rt::table.filter(rt::flow_id.eq_any(&flows).or(rt::recovery_address_id.eq_any(&recovery))))
              .execute(conn)?;
            diesel::delete(fl::table.filter(fl::identity_id.eq(&id_s))).execute(conn)?;
            diesel::delete(se::table.filter(se::identity_id.eq(&id_s))).execute(conn)?;
            diesel::delete(va::table.filter(va::identity_id.eq(&id_s))).execute(conn)?;
            diesel::delete(ra::table.filter(ra::identity_id.eq(&id_s))).execute(conn)?;
            diesel::delete(ids::table.filter(ids::id.eq(&id_s))).execute(conn)?;
            debug!("deleted identity {} with {} flows", id_s, flows.len());
            Ok(())
          })
          .map_err(|e| e.into_flow_error("identity"))?
    });
    Ok(())
  }

  fn find_verifiable_address(&self, via: &str, value: &str) -> Result<VerifiableAddress> {
    let row = with_conn!(self.db, |conn| {
      va::table.filter(va::via.eq(via))
               .filter(va::value.eq(value))
               .first::<VerifiableAddressRow>(conn)
               .optional()
               .map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("verifiable address", value))?.into_domain()
  }

  fn get_verifiable_address(&self, id: &Uuid) -> Result<VerifiableAddress> {
    let row = with_conn!(self.db, |conn| {
      va::table.filter(va::id.eq(id.to_string()))
               .first::<VerifiableAddressRow>(conn)
               .optional()
               .map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("verifiable address", id))?.into_domain()
  }

  fn find_recovery_address(&self, via: &str, value: &str) -> Result<RecoveryAddress> {
    let row = with_conn!(self.db, |conn| {
      ra::table.filter(ra::via.eq(via))
               .filter(ra::value.eq(value))
               .first::<RecoveryAddressRow>(conn)
               .optional()
               .map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("recovery address", value))?.into_domain()
  }

  fn get_recovery_address(&self, id: &Uuid) -> Result<RecoveryAddress> {
    let row = with_conn!(self.db, |conn| {
      ra::table.filter(ra::id.eq(id.to_string()))
               .first::<RecoveryAddressRow>(conn)
               .optional()
               .map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("recovery address", id))?.into_domain()
  }
}

impl SessionPersister for SqlPersister {
  fn create_session(&self, session: &Session) -> Result<()> {
    let row = SessionRow::from_domain(session);
    with_conn!(self.db, |conn| {
      diesel::insert_into(se::table).values(&row).execute(conn).map_err(map_db_err)?;
    });
    Ok(())
  }

  fn get_session(&self, id: &Uuid) -> Result<Session> {
    let row = with_conn!(self.db, |conn| {
      se::table.filter(se::id.eq(id.to_string())).first::<SessionRow>(conn).optional().map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("session", id))?.into_domain()
  }

  fn list_sessions(&self, page: Page) -> Result<Vec<Session>> {
    let rows = with_conn!(self.db, |conn| {
      se::table.order(se::id.asc())
               .limit(page.limit())
               .offset(page.offset())
               .load::<SessionRow>(conn)
               .map_err(map_db_err)?
    });
    rows.into_iter().map(SessionRow::into_domain).collect()
  }

  fn delete_session(&self, id: &Uuid) -> Result<()> {
    let deleted = with_conn!(self.db, |conn| {
      diesel::delete(se::table.filter(se::id.eq(id.to_string()))).execute(conn).map_err(map_db_err)?
    });
    if deleted == 0 {
      return Err(FlowError::not_found("session", id));
    }
    Ok(())
  }
}

impl TokenPersister for SqlPersister {
  fn create_recovery_token(&self, token: &RecoveryToken) -> Result<()> {
    let row = RecoveryTokenRow::from_domain(token);
    with_conn!(self.db, |conn| {
      diesel::insert_into(rt::table).values(&row).execute(conn).map_err(map_db_err)?;
    });
    Ok(())
  }

  fn get_recovery_token(&self, id: &Uuid) -> Result<RecoveryToken> {
    let row = with_conn!(self.db, |conn| {
      rt::table.filter(rt::id.eq(id.to_string())).first::<RecoveryTokenRow>(conn).optional().map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("recovery token", id))?.into_domain()
  }

  fn list_recovery_tokens(&self, page: Page) -> Result<Vec<RecoveryToken>> {
    let rows = with_conn!(self.db, |conn| {
      rt::table.order(rt::id.asc())
               .limit(page.limit())
               .offset(page.offset())
               .load::<RecoveryTokenRow>(conn)
               .map_err(map_db_err)?
    });
    rows.into_iter().map(RecoveryTokenRow::into_domain).collect()
  }

  fn delete_recovery_token(&self, id: &Uuid) -> Result<()> {
    let deleted = with_conn!(self.db, |conn| {
      diesel::delete(rt::table.filter(rt::id.eq(id.to_string()))).execute(conn).map_err(map_db_err)?
    });
    if deleted == 0 {
      return Err(FlowError::not_found("recovery token", id));
    }
    Ok(())
  }

  fn find_recovery_token(&self, token: &str) -> Result<RecoveryToken> {
    let row = with_conn!(self.db, |conn| {
      rt::table.filter(rt::token.eq(token)).first::<RecoveryTokenRow>(conn).optional().map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::NotFound("recovery token".into()))?.into_domain()
  }

  fn use_recovery_token(&self, token: &str, now: DateTime<Utc>) -> Result<RecoveryToken> {
    let row = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| Ok(consume_recovery_token!(conn, token, now)))
          .map_err(|e| e.into_flow_error("recovery token"))?
    });
    row.into_domain()
  }

  fn redeem_recovery_token(&self,
                           token: &str,
                           now: DateTime<Utc>,
                           flow: &Flow,
                           expected_version: i64,
                           effects: &FlowEffects)
                           -> Result<RecoveryToken> {
    let rows = CommitRows::from_domain(flow, expected_version, effects)?;
    let row = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            let consumed = consume_recovery_token!(conn, token, now);
            write_commit_rows!(conn, &rows);
            Ok(consumed)
          })
          .map_err(|e| e.into_flow_error("flow"))?
    });
    debug!("recovery token {} redeemed with flow {}", row.id, flow.id);
    row.into_domain()
  }

  fn create_verification_token(&self, token: &VerificationToken) -> Result<()> {
    let row = VerificationTokenRow::from_domain(token);
    with_conn!(self.db, |conn| {
      diesel::insert_into(vt::table).values(&row).execute(conn).map_err(map_db_err)?;
    });
    Ok(())
  }

  fn get_verification_token(&self, id: &Uuid) -> Result<VerificationToken> {
    let row = with_conn!(self.db, |conn| {
      vt::table.filter(vt::id.eq(id.to_string())).first::<VerificationTokenRow>(conn).optional().map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::not_found("verification token", id))?.into_domain()
  }

  fn list_verification_tokens(&self, page: Page) -> Result<Vec<VerificationToken>> {
    let rows = with_conn!(self.db, |conn| {
      vt::table.order(vt::id.asc())
               .limit(page.limit())
               .offset(page.offset())
               .load::<VerificationTokenRow>(conn)
               .map_err(map_db_err)?
    });
    rows.into_iter().map(VerificationTokenRow::into_domain).collect()
  }

  fn delete_verification_token(&self, id: &Uuid) -> Result<()> {
    let deleted = with_conn!(self.db, |conn| {
      diesel::delete(vt::table.filter(vt::id.eq(id.to_string()))).execute(conn).map_err(map_db_err)?
    });
    if deleted == 0 {
      return Err(FlowError::not_found("verification token", id));
    }
    Ok(())
  }

  fn find_verification_token(&self, token: &str) -> Result<VerificationToken> {
    let row = with_conn!(self.db, |conn| {
      vt::table.filter(vt::token.eq(token)).first::<VerificationTokenRow>(conn).optional().map_err(map_db_err)?
    });
    row.ok_or_else(|| FlowError::NotFound("verification token".into()))?.into_domain()
  }

  fn use_verification_token(&self, token: &str, now: DateTime<Utc>) -> Result<VerificationToken> {
    let row = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| Ok(consume_verification_token!(conn, token, now)))
          .map_err(|e| e.into_flow_error("verification token"))?
    });
    row.into_domain()
  }

  fn redeem_verification_token(&self,
                               token: &str,
                               now: DateTime<Utc>,
                               flow: &Flow,
                               expected_version: i64,
                               effects: &FlowEffects)
                               -> Result<VerificationToken> {
    let rows = CommitRows::from_domain(flow, expected_version, effects)?;
    let row = with_conn!(self.db, |conn| {
      conn.transaction::<_, TxError, _>(|conn| {
            let consumed = consume_verification_token!(conn, token, now);
            write_commit_rows!(conn, &rows);
            Ok(consumed)
          })
          .map_err(|e| e.into_flow_error("flow"))?
    });
    debug!("verification token {} redeemed with flow {}", row.id, flow.id);
    row.into_domain()
  }
}
