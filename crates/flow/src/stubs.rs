// File: stubs.rs
// Purpose: in-memory reference backend and demo strategies, for tests and
// quick wiring. Not durable.
//
// `InMemoryPersister` keeps every table behind one mutex so each trait call
// is a single atomic unit, and enforces the same references and cascades as
// the SQL schema.
use crate::domain::{generate_token, Flow, FlowState, FlowType};
use crate::errors::{FlowError, Result};
use crate::identity::{check_redeemable, AddressVia, Identity, RecoveryAddress, RecoveryToken, Session, VerifiableAddress,
                      VerificationStatus, VerificationToken};
use crate::method_config::MethodConfig;
use crate::repository::{FlowEffects, FlowPersister, IdentityPersister, Page, PersistResult, Persister, SessionPersister,
                        TokenPersister};
use crate::strategy::{Strategy, StrategyOutcome, Submission};
use crate::ui::{text_ids, UiNode, UiText};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Tables {
    flows: BTreeMap<Uuid, Flow>,
    identities: BTreeMap<Uuid, Identity>,
    verifiable_addresses: BTreeMap<Uuid, VerifiableAddress>,
    recovery_addresses: BTreeMap<Uuid, RecoveryAddress>,
    sessions: BTreeMap<Uuid, Session>,
    recovery_tokens: BTreeMap<Uuid, RecoveryToken>,
    verification_tokens: BTreeMap<Uuid, VerificationToken>,
}

impl Tables {
    fn insert_identity(&mut self, identity: &Identity) -> Result<()> {
        if self.identities.contains_key(&identity.id) {
            return Err(FlowError::Conflict(format!("identity {} already exists", identity.id)));
        }
        for a in &identity.verifiable_addresses {
            if self.verifiable_addresses
                   .values()
                   .any(|e| e.id == a.id || (e.via == a.via && e.value == a.value))
            {
                return Err(FlowError::Conflict(format!("verifiable address {} already exists", a.value)));
            }
        }
        for a in &identity.recovery_addresses {
            if self.recovery_addresses
                   .values()
                   .any(|e| e.id == a.id || (e.via == a.via && e.value == a.value))
            {
                return Err(FlowError::Conflict(format!("recovery address {} already exists", a.value)));
            }
        }
        for a in &identity.verifiable_addresses {
            self.verifiable_addresses.insert(a.id, a.clone());
        }
        for a in &identity.recovery_addresses {
            self.recovery_addresses.insert(a.id, a.clone());
        }
        self.identities.insert(identity.id, identity.without_addresses());
        Ok(())
    }

    fn insert_session(&mut self, session: &Session) -> Result<()> {
        if !self.identities.contains_key(&session.identity_id) {
            return Err(FlowError::Conflict(format!("session {} references unknown identity {}", session.id, session.identity_id)));
        }
        if self.sessions.contains_key(&session.id) {
            return Err(FlowError::Conflict(format!("session {} already exists", session.id)));
        }
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn insert_recovery_token(&mut self, token: &RecoveryToken) -> Result<()> {
        if !self.flows.contains_key(&token.flow_id) || !self.recovery_addresses.contains_key(&token.recovery_address_id) {
            return Err(FlowError::Conflict(format!("recovery token {} references a missing flow or address", token.id)));
        }
        if self.recovery_tokens.values().any(|t| t.id == token.id || t.token == token.token) {
            return Err(FlowError::Conflict(format!("recovery token {} already exists", token.id)));
        }
        self.recovery_tokens.insert(token.id, token.clone());
        Ok(())
    }

    fn insert_verification_token(&mut self, token: &VerificationToken) -> Result<()> {
        if !self.flows.contains_key(&token.flow_id)
           || !self.verifiable_addresses.contains_key(&token.verifiable_address_id)
        {
            return Err(FlowError::Conflict(format!("verification token {} references a missing flow or address", token.id)));
        }
        if self.verification_tokens.values().any(|t| t.id == token.id || t.token == token.token) {
            return Err(FlowError::Conflict(format!("verification token {} already exists", token.id)));
        }
        self.verification_tokens.insert(token.id, token.clone());
        Ok(())
    }

    fn check_flow_refs(&self, flow: &Flow) -> Result<()> {
        match flow.identity_id {
            Some(id) if !self.identities.contains_key(&id) => {
                Err(FlowError::Conflict(format!("flow {} references unknown identity {}", flow.id, id)))
            }
            _ => Ok(()),
        }
    }

    fn commit(&mut self, flow: &Flow, expected_version: i64, effects: &FlowEffects) -> Result<PersistResult> {
        match self.flows.get(&flow.id) {
            Some(stored) if stored.version == expected_version => {}
            _ => return Ok(PersistResult::Conflict),
        }
        if let Some(identity) = &effects.identity {
            self.insert_identity(identity)?;
        }
        self.check_flow_refs(flow)?;
        let new_version = expected_version + 1;
        let mut stored = flow.clone();
        stored.version = new_version;
        self.flows.insert(flow.id, stored);
        if let Some(session) = &effects.session {
            self.insert_session(session)?;
        }
        if let Some(token) = &effects.recovery_token {
            self.insert_recovery_token(token)?;
        }
        if let Some(token) = &effects.verification_token {
            self.insert_verification_token(token)?;
        }
        Ok(PersistResult::Ok { new_version })
    }

    /// `commit` where a stale version is an error.
    fn commit_or_conflict(&mut self, flow: &Flow, expected_version: i64, effects: &FlowEffects) -> Result<()> {
        match self.commit(flow, expected_version, effects)? {
            PersistResult::Ok { .. } => Ok(()),
            PersistResult::Conflict => Err(FlowError::Conflict(format!("flow {} was modified concurrently", flow.id))),
        }
    }

    fn consume_recovery_token(&mut self, token: &str, now: DateTime<Utc>) -> Result<RecoveryToken> {
        let stored = self.recovery_tokens
                         .values_mut()
                         .find(|r| r.token == token)
                         .ok_or_else(|| FlowError::NotFound("recovery token".into()))?;
        check_redeemable("recovery", stored.used, stored.expires_at, now)?;
        let now = now.trunc_subsecs(6);
        stored.used = true;
        stored.used_at = Some(now);
        stored.updated_at = now;
        Ok(stored.clone())
    }

    fn consume_verification_token(&mut self, token: &str, now: DateTime<Utc>) -> Result<VerificationToken> {
        let now = now.trunc_subsecs(6);
        let consumed = {
            let stored = self.verification_tokens
                             .values_mut()
                             .find(|v| v.token == token)
                             .ok_or_else(|| FlowError::NotFound("verification token".into()))?;
            check_redeemable("verification", stored.used, stored.expires_at, now)?;
            stored.used = true;
            stored.used_at = Some(now);
            stored.updated_at = now;
            stored.clone()
        };
        let address = self.verifiable_addresses
                          .get_mut(&consumed.verifiable_address_id)
                          .ok_or_else(|| FlowError::not_found("verifiable address", consumed.verifiable_address_id))?;
        address.verified = true;
        address.verified_at = Some(now);
        address.status = VerificationStatus::Completed;
        address.updated_at = now;
        Ok(consumed)
    }

    fn remove_flow(&mut self, id: &Uuid) -> bool {
        self.recovery_tokens.retain(|_, t| t.flow_id != *id);
        self.verification_tokens.retain(|_, t| t.flow_id != *id);
        self.flows.remove(id).is_some()
    }
}

/// In-memory `Persister`.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    tables: Mutex<Tables>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a poisoned mutex to `BackendUnavailable`.
    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| FlowError::BackendUnavailable(format!("mutex poisoned: {:?}", e)))
    }
}

fn page_of<T: Clone>(map: &BTreeMap<Uuid, T>, page: Page) -> Vec<T> {
    map.values()
       .skip(page.offset() as usize)
       .take(page.limit() as usize)
       .cloned()
       .collect()
}

impl FlowPersister for InMemoryPersister {
    fn create_flow(&self, flow: &Flow) -> Result<()> {
        let mut t = self.lock()?;
        if t.flows.contains_key(&flow.id) {
            return Err(FlowError::Conflict(format!("flow {} already exists", flow.id)));
        }
        t.check_flow_refs(flow)?;
        t.flows.insert(flow.id, flow.clone());
        Ok(())
    }

    fn get_flow(&self, id: &Uuid) -> Result<Flow> {
        self.lock()?
            .flows
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("flow", id))
    }

    fn update_flow(&self, flow: &Flow, expected_version: i64) -> Result<PersistResult> {
        self.commit_flow(flow, expected_version, &FlowEffects::default())
    }

    fn commit_flow(&self, flow: &Flow, expected_version: i64, effects: &FlowEffects) -> Result<PersistResult> {
        let mut guard = self.lock()?;
        // Apply on a copy so a failing effect leaves nothing behind.
        let mut t = guard.clone();
        let outcome = t.commit(flow, expected_version, effects)?;
        if outcome != PersistResult::Conflict {
            *guard = t;
        }
        Ok(outcome)
    }

    fn list_flows(&self, flow_type: Option<FlowType>, page: Page) -> Result<Vec<Flow>> {
        let t = self.lock()?;
        Ok(t.flows
            .values()
            .filter(|f| flow_type.map_or(true, |ft| f.flow_type == ft))
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect())
    }

    fn delete_flow(&self, id: &Uuid) -> Result<()> {
        if self.lock()?.remove_flow(id) {
            Ok(())
        } else {
            Err(FlowError::not_found("flow", id))
        }
    }

    fn delete_expired_flows(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut t = self.lock()?;
        let expired: Vec<Uuid> = t.flows.values().filter(|f| f.expires_at < before).map(|f| f.id).collect();
        for id in &expired {
            t.remove_flow(id);
        }
        Ok(expired.len() as u64)
    }
}

impl IdentityPersister for InMemoryPersister {
    fn create_identity(&self, identity: &Identity) -> Result<()> {
        self.lock()?.insert_identity(identity)
    }

    fn get_identity(&self, id: &Uuid) -> Result<Identity> {
        self.lock()?
            .identities
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("identity", id))
    }

    fn get_identity_confidential(&self, id: &Uuid) -> Result<Identity> {
        let t = self.lock()?;
        let mut identity = t.identities
                            .get(id)
                            .cloned()
                            .ok_or_else(|| FlowError::not_found("identity", id))?;
        identity.verifiable_addresses = t.verifiable_addresses
                                         .values()
                                         .filter(|a| a.identity_id == *id)
                                         .cloned()
                                         .collect();
        identity.recovery_addresses = t.recovery_addresses
                                       .values()
                                       .filter(|a| a.identity_id == *id)
                                       .cloned()
                                       .collect();
        Ok(identity)
    }

    fn list_identities(&self, page: Page) -> Result<Vec<Identity>> {
        Ok(page_of(&self.lock()?.identities, page))
    }

    fn delete_identity(&self, id: &Uuid) -> Result<()> {
        let mut t = self.lock()?;
        if t.identities.remove(id).is_none() {
            return Err(FlowError::not_found("identity", id));
        }
        let flows: Vec<Uuid> = t.flows
                                .values()
                                .filter(|f| f.identity_id == Some(*id))
                                .map(|f| f.id)
                                .collect();
        for flow_id in &flows {
            t.remove_flow(flow_id);
        }
        let verifiable: Vec<Uuid> = t.verifiable_addresses
                                     .values()
                                     .filter(|a| a.identity_id == *id)
                                     .map(|a| a.id)
                                     .collect();
        let recovery: Vec<Uuid> = t.recovery_addresses
                                   .values()
                                   .filter(|a| a.identity_id == *id)
                                   .map(|a| a.id)
                                   .collect();
        t.verification_tokens.retain(|_, tok| !verifiable.contains(&tok.verifiable_address_id));
        t.recovery_tokens.retain(|_, tok| !recovery.contains(&tok.recovery_address_id));
        t.verifiable_addresses.retain(|_, a| a.identity_id != *id);
        t.recovery_addresses.retain(|_, a| a.identity_id != *id);
        t.sessions.retain(|_, s| s.identity_id != *id);
        Ok(())
    }

    fn find_verifiable_address(&self, via: &str, value: &str) -> Result<VerifiableAddress> {
        self.lock()?
            .verifiable_addresses
            .values()
            .find(|a| a.via.as_str() == via && a.value == value)
            .cloned()
            .ok_or_else(|| FlowError::not_found("verifiable address", value))
    }

    fn get_verifiable_address(&self, id: &Uuid) -> Result<VerifiableAddress> {
        self.lock()?
            .verifiable_addresses
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("verifiable address", id))
    }

    fn find_recovery_address(&self, via: &str, value: &str) -> Result<RecoveryAddress> {
        self.lock()?
            .recovery_addresses
            .values()
            .find(|a| a.via.as_str() == via && a.value == value)
            .cloned()
            .ok_or_else(|| FlowError::not_found("recovery address", value))
    }

    fn get_recovery_address(&self, id: &Uuid) -> Result<RecoveryAddress> {
        self.lock()?
            .recovery_addresses
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("recovery address", id))
    }
}

impl SessionPersister for InMemoryPersister {
    fn create_session(&self, session: &Session) -> Result<()> {
        self.lock()?.insert_session(session)
    }

    fn get_session(&self, id: &Uuid) -> Result<Session> {
        self.lock()?
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("session", id))
    }

    fn list_sessions(&self, page: Page) -> Result<Vec<Session>> {
        Ok(page_of(&self.lock()?.sessions, page))
    }

    fn delete_session(&self, id: &Uuid) -> Result<()> {
        self.lock()?
            .sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FlowError::not_found("session", id))
    }
}

impl TokenPersister for InMemoryPersister {
    fn create_recovery_token(&self, token: &RecoveryToken) -> Result<()> {
        self.lock()?.insert_recovery_token(token)
    }

    fn get_recovery_token(&self, id: &Uuid) -> Result<RecoveryToken> {
        self.lock()?
            .recovery_tokens
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("recovery token", id))
    }

    fn list_recovery_tokens(&self, page: Page) -> Result<Vec<RecoveryToken>> {
        Ok(page_of(&self.lock()?.recovery_tokens, page))
    }

    fn delete_recovery_token(&self, id: &Uuid) -> Result<()> {
        self.lock()?
            .recovery_tokens
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FlowError::not_found("recovery token", id))
    }

    fn find_recovery_token(&self, token: &str) -> Result<RecoveryToken> {
        self.lock()?
            .recovery_tokens
            .values()
            .find(|r| r.token == token)
            .cloned()
            .ok_or_else(|| FlowError::NotFound("recovery token".into()))
    }

    fn use_recovery_token(&self, token: &str, now: DateTime<Utc>) -> Result<RecoveryToken> {
        self.lock()?.consume_recovery_token(token, now)
    }

    fn redeem_recovery_token(&self,
                             token: &str,
                             now: DateTime<Utc>,
                             flow: &Flow,
                             expected_version: i64,
                             effects: &FlowEffects)
                             -> Result<RecoveryToken> {
        let mut guard = self.lock()?;
        let mut t = guard.clone();
        let consumed = t.consume_recovery_token(token, now)?;
        t.commit_or_conflict(flow, expected_version, effects)?;
        *guard = t;
        Ok(consumed)
    }

    fn create_verification_token(&self, token: &VerificationToken) -> Result<()> {
        self.lock()?.insert_verification_token(token)
    }

    fn get_verification_token(&self, id: &Uuid) -> Result<VerificationToken> {
        self.lock()?
            .verification_tokens
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("verification token", id))
    }

    fn list_verification_tokens(&self, page: Page) -> Result<Vec<VerificationToken>> {
        Ok(page_of(&self.lock()?.verification_tokens, page))
    }

    fn delete_verification_token(&self, id: &Uuid) -> Result<()> {
        self.lock()?
            .verification_tokens
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FlowError::not_found("verification token", id))
    }

    fn find_verification_token(&self, token: &str) -> Result<VerificationToken> {
        self.lock()?
            .verification_tokens
            .values()
            .find(|v| v.token == token)
            .cloned()
            .ok_or_else(|| FlowError::NotFound("verification token".into()))
    }

    fn use_verification_token(&self, token: &str, now: DateTime<Utc>) -> Result<VerificationToken> {
        self.lock()?.consume_verification_token(token, now)
    }

    fn redeem_verification_token(&self,
                                 token: &str,
                                 now: DateTime<Utc>,
                                 flow: &Flow,
                                 expected_version: i64,
                                 effects: &FlowEffects)
                                 -> Result<VerificationToken> {
        let mut guard = self.lock()?;
        let mut t = guard.clone();
        let consumed = t.consume_verification_token(token, now)?;
        t.commit_or_conflict(flow, expected_version, effects)?;
        *guard = t;
        Ok(consumed)
    }
}

/// Decides whether a password is valid for an identity. Hashing and
/// credential storage live outside the engine.
pub type PasswordVerifier = Arc<dyn Fn(&Identity, &str) -> bool + Send + Sync>;

/// Demo password method for login, registration and settings.
pub struct PasswordStrategy<P>
    where P: Persister
{
    repo: Arc<P>,
    verifier: PasswordVerifier,
    session_lifespan: Duration,
}

impl<P> PasswordStrategy<P> where P: Persister
{
    pub fn new(repo: Arc<P>, verifier: PasswordVerifier) -> Self {
        Self { repo,
               verifier,
               session_lifespan: Duration::hours(24) }
    }

    pub fn with_session_lifespan(mut self, lifespan: Duration) -> Self {
        self.session_lifespan = lifespan;
        self
    }

    fn method(&self, flow: &Flow, identifier: Option<&str>) -> Result<MethodConfig> {
        let mut method = MethodConfig::new(flow.ui.action.clone(), "POST", Vec::new())?;
        let value = identifier.map(|v| JsonValue::String(v.to_string()));
        match flow.flow_type {
            FlowType::Login => method.push_node(UiNode::input("password", "identifier", "text", value, true)),
            FlowType::Registration => method.push_node(UiNode::input("password", "traits.email", "email", value, true)),
            _ => {}
        }
        method.push_node(UiNode::input("password", "password", "password", None, true));
        method.push_node(UiNode::input("password", "method", "submit", Some(json!("password")), false)
                         .with_message(UiText::info(text_ids::INFO_NODE_LABEL_SUBMIT, "Submit")));
        Ok(method)
    }

    fn missing(node: &str) -> StrategyOutcome {
        StrategyOutcome::Rejected { node: Some(node.to_string()),
                                    message: UiText::error(text_ids::ERROR_VALIDATION_GENERIC,
                                                           format!("Property {} is missing.", node))
                                    .with_context(json!({ "property": node })) }
    }

    fn invalid_credentials() -> StrategyOutcome {
        StrategyOutcome::Rejected { node: None,
                                    message: UiText::error(text_ids::ERROR_INVALID_CREDENTIALS,
                                                           "The provided credentials are invalid, check for spelling mistakes in your password or username, email address, or phone number.") }
    }
}

impl<P> Strategy for PasswordStrategy<P> where P: Persister
{
    fn id(&self) -> &str {
        "password"
    }

    fn supports(&self, flow_type: FlowType) -> bool {
        matches!(flow_type, FlowType::Login | FlowType::Registration | FlowType::Settings)
    }

    fn populate(&self, flow: &Flow) -> Result<MethodConfig> {
        self.method(flow, None)
    }

    fn handle(&self, flow: &Flow, submission: &Submission) -> Result<StrategyOutcome> {
        let now = flow.updated_at;
        let password = match submission.field("password") {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(Self::missing("password")),
        };
        match flow.flow_type {
            FlowType::Login => {
                let identifier = match submission.field("identifier") {
                    Some(i) if !i.trim().is_empty() => i.trim().to_lowercase(),
                    _ => return Ok(Self::missing("identifier")),
                };
                let address = match self.repo.find_verifiable_address(AddressVia::Email.as_str(), &identifier) {
                    Ok(a) => a,
                    Err(FlowError::NotFound(_)) => return Ok(Self::invalid_credentials()),
                    Err(e) => return Err(e),
                };
                let identity = self.repo.get_identity_confidential(&address.identity_id)?;
                if !(self.verifier)(&identity, password) {
                    return Ok(Self::invalid_credentials());
                }
                Ok(StrategyOutcome::Complete { state: None,
                                               effects: FlowEffects { session: Some(Session::new(identity.id, self.session_lifespan, now)),
                                                                      ..FlowEffects::default() } })
            }
            FlowType::Registration => {
                let email = match submission.field("traits.email") {
                    Some(e) if e.contains('@') => e.trim().to_lowercase(),
                    _ => return Ok(Self::missing("traits.email")),
                };
                match self.repo.find_verifiable_address(AddressVia::Email.as_str(), &email) {
                    Ok(_) => {
                        return Ok(StrategyOutcome::Rejected { node: Some("traits.email".into()),
                                                              message: UiText::error(text_ids::ERROR_VALIDATION_GENERIC,
                                                                                     "An account with the same identifier (email, phone, username, ...) exists already.") })
                    }
                    Err(FlowError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                let identity = Identity::new("default", json!({ "email": email }), now).with_email(&email);
                let session = Session::new(identity.id, self.session_lifespan, now);
                Ok(StrategyOutcome::Complete { state: None,
                                               effects: FlowEffects { identity: Some(identity),
                                                                      session: Some(session),
                                                                      ..FlowEffects::default() } })
            }
            FlowType::Settings => Ok(StrategyOutcome::Complete { state: Some(FlowState::Success),
                                                                 effects: FlowEffects::default() }),
            other => Err(FlowError::Validation(format!("password strategy cannot handle {} flows", other))),
        }
    }
}

/// Demo one-time-link method for recovery and verification. Issues a token
/// as a flow effect; delivering it is left to the caller.
pub struct LinkStrategy<P>
    where P: Persister
{
    repo: Arc<P>,
    token_length: usize,
    token_ttl: Duration,
}

impl<P> LinkStrategy<P> where P: Persister
{
    pub fn new(repo: Arc<P>) -> Self {
        Self { repo,
               token_length: 32,
               token_ttl: Duration::hours(1) }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    fn method(&self, flow: &Flow, email: Option<&str>) -> Result<MethodConfig> {
        let value = email.map(|v| JsonValue::String(v.to_string()));
        MethodConfig::builder().action(flow.ui.action.clone())
                               .method("POST")
                               .nodes(vec![UiNode::input("link", "email", "email", value, true),
                                           UiNode::input("link", "method", "submit", Some(json!("link")), false)
                                           .with_message(UiText::info(text_ids::INFO_NODE_LABEL_SUBMIT, "Submit"))])
                               .build()
    }
}

impl<P> Strategy for LinkStrategy<P> where P: Persister
{
    fn id(&self) -> &str {
        "link"
    }

    fn supports(&self, flow_type: FlowType) -> bool {
        matches!(flow_type, FlowType::Recovery | FlowType::Verification)
    }

    fn populate(&self, flow: &Flow) -> Result<MethodConfig> {
        self.method(flow, None)
    }

    fn handle(&self, flow: &Flow, submission: &Submission) -> Result<StrategyOutcome> {
        let now = flow.updated_at;
        let email = match submission.field("email") {
            Some(e) if e.contains('@') => e.trim().to_lowercase(),
            _ => {
                return Ok(StrategyOutcome::Rejected { node: Some("email".into()),
                                                      message: UiText::error(text_ids::ERROR_VALIDATION_GENERIC,
                                                                             "Property email is missing or invalid.") })
            }
        };
        let mut effects = FlowEffects::default();
        // Unknown addresses get the same answer, so account existence is not revealed.
        let sent = match flow.flow_type {
            FlowType::Recovery => {
                match self.repo.find_recovery_address(AddressVia::Email.as_str(), &email) {
                    Ok(address) => {
                        effects.recovery_token = Some(RecoveryToken::new(generate_token(self.token_length),
                                                                         flow.id,
                                                                         address.id,
                                                                         self.token_ttl,
                                                                         now))
                    }
                    Err(FlowError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                UiText::info(text_ids::INFO_RECOVERY_EMAIL_SENT,
                             "An email containing a recovery link has been sent to the email address you provided.")
            }
            FlowType::Verification => {
                match self.repo.find_verifiable_address(AddressVia::Email.as_str(), &email) {
                    Ok(address) => {
                        effects.verification_token = Some(VerificationToken::new(generate_token(self.token_length),
                                                                                 flow.id,
                                                                                 address.id,
                                                                                 self.token_ttl,
                                                                                 now))
                    }
                    Err(FlowError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                UiText::info(text_ids::INFO_VERIFICATION_EMAIL_SENT,
                             "An email containing a verification link has been sent to the email address you provided.")
            }
            other => return Err(FlowError::Validation(format!("link strategy cannot handle {} flows", other))),
        };
        Ok(StrategyOutcome::Rerender { method: self.method(flow, Some(&email))?.with_message(sent),
                                       state: Some(FlowState::SentEmail),
                                       effects })
    }
}
