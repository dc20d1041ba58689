// File: service.rs
// Purpose: `FlowService` façade over `FlowEngine` plus the operations that
// act on flows from outside a submission: link redemption, identity
// deletion and the expiry reaper.
use crate::config::FlowEngineConfig;
use crate::domain::{Flow, FlowType, Transition};
use crate::engine::{FlowEngine, SubmitOutcome};
use crate::errors::Result;
use crate::identity::{check_redeemable, RecoveryToken, Session, VerificationToken};
use crate::repository::{FlowEffects, Persister};
use crate::strategy::{StrategyRegistry, Submission};
use chrono::Duration;
use log::info;
use std::sync::Arc;
use uuid::Uuid;

/// Result of redeeming a recovery link.
#[derive(Debug, Clone)]
pub struct RecoveryRedemption {
    pub flow: Flow,
    pub token: RecoveryToken,
    pub identity_id: Uuid,
    /// Session issued to the recovered identity.
    pub session: Session,
}

/// Result of redeeming a verification link.
#[derive(Debug, Clone)]
pub struct VerificationRedemption {
    pub flow: Flow,
    pub token: VerificationToken,
}

pub struct FlowService<P>
    where P: Persister
{
    repo: Arc<P>,
    engine: FlowEngine<P>,
    reap_grace: Duration,
}

impl<P> FlowService<P> where P: Persister
{
    pub fn new(repo: Arc<P>, strategies: StrategyRegistry, config: FlowEngineConfig) -> Self {
        let engine = FlowEngine::new(Arc::clone(&repo), strategies, config);
        Self::from_engine(engine)
    }

    pub fn from_engine(engine: FlowEngine<P>) -> Self {
        Self { repo: Arc::clone(engine.repository()),
               engine,
               reap_grace: Duration::zero() }
    }

    /// Flows are only reaped once `expires_at + grace` has passed.
    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    pub fn engine(&self) -> &FlowEngine<P> {
        &self.engine
    }

    pub fn create_flow(&self, flow_type: FlowType, request_url: &str, identity_id: Option<Uuid>) -> Result<Flow> {
        self.engine.create_flow(flow_type, request_url, identity_id)
    }

    pub fn fetch(&self, id: &Uuid) -> Result<Flow> {
        self.engine.fetch(id)
    }

    pub fn submit(&self, id: &Uuid, strategy_id: &str, submission: &Submission) -> Result<SubmitOutcome> {
        self.engine.submit(id, strategy_id, submission)
    }

    /// Consumes a recovery token, closes its flow in `passed_challenge` and
    /// issues a session for the recovered identity, in one transaction. The
    /// token stays unused when the flow cannot make the transition.
    pub fn redeem_recovery_token(&self, token: &str) -> Result<RecoveryRedemption> {
        let now = self.engine.now();
        let pending = self.repo.find_recovery_token(token)?;
        check_redeemable("recovery", pending.used, pending.expires_at, now)?;
        let address = self.repo.get_recovery_address(&pending.recovery_address_id)?;
        let mut flow = self.repo.get_flow(&pending.flow_id)?;
        let expected = flow.version;
        flow.apply(Transition::ChallengePassed { identity_id: address.identity_id }, now)?;
        let session = Session::new(address.identity_id, self.engine.config().session_lifespan, now);
        let effects = FlowEffects { session: Some(session.clone()),
                                    ..FlowEffects::default() };
        let consumed = self.repo.redeem_recovery_token(token, now, &flow, expected, &effects)?;
        flow.version = expected + 1;
        info!("recovery token {} redeemed for identity {}", consumed.id, address.identity_id);
        Ok(RecoveryRedemption { flow,
                                token: consumed,
                                identity_id: address.identity_id,
                                session })
    }

    /// Consumes a verification token, marks its address verified and closes
    /// the flow, in one transaction.
    pub fn redeem_verification_token(&self, token: &str) -> Result<VerificationRedemption> {
        let now = self.engine.now();
        let pending = self.repo.find_verification_token(token)?;
        check_redeemable("verification", pending.used, pending.expires_at, now)?;
        let mut flow = self.repo.get_flow(&pending.flow_id)?;
        let expected = flow.version;
        let identity_id = match flow.identity_id {
            Some(id) => id,
            None => self.repo.get_verifiable_address(&pending.verifiable_address_id)?.identity_id,
        };
        flow.apply(Transition::ChallengePassed { identity_id }, now)?;
        let consumed = self.repo.redeem_verification_token(token, now, &flow, expected, &FlowEffects::default())?;
        flow.version = expected + 1;
        info!("verification token {} redeemed", consumed.id);
        Ok(VerificationRedemption { flow, token: consumed })
    }

    /// Deletes an identity with its addresses, sessions, flows and tokens.
    pub fn delete_identity(&self, id: &Uuid) -> Result<()> {
        self.repo.delete_identity(id)?;
        info!("deleted identity {}", id);
        Ok(())
    }

    /// Removes flows whose expiry (plus the grace period) has passed.
    /// Returns how many were removed.
    pub fn reap_expired(&self) -> Result<u64> {
        let before = self.engine.now() - self.reap_grace;
        let removed = self.repo.delete_expired_flows(before)?;
        if removed > 0 {
            info!("reaped {} expired flows", removed);
        }
        Ok(removed)
    }
}
