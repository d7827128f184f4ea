//! Discount approval workflow.
//!
//! A requester asks for a percentage discount on a deal; the configured
//! approver proves possession of an emailed link token, receives a one-time
//! code and resolves the request with it. Approval reprices the deal in the
//! same unit of work as the status change and its audit entry.
//!
//! Every transition is persisted before any notification goes out, and each
//! write is conditional on the state it was computed from.

pub mod clock;
pub mod memory;
pub mod notify;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEntry};
use crate::config::ApprovalConfig;
use crate::domain::approval::{
    ApprovalId, ApprovalRequest, ApprovalStatus, ApprovalView, Decision,
};
use crate::domain::deal::{DealId, DealPricing};
use crate::errors::{ApprovalError, AuthFailure, ConflictKind};
use crate::pricing::{validate_base_total, validate_percent};
use crate::secrets::SecretIssuer;

use self::clock::Clock;
use self::notify::{ApprovalNotifier, DeliveryChannel, Notification};
use self::store::{ApprovalStore, Precondition, StoreError};

#[derive(Clone, Debug)]
pub struct ApprovalPolicy {
    pub approver_id: String,
    pub token_ttl: Duration,
    pub code_ttl: Duration,
    pub max_code_attempts: u32,
    pub link_base_url: String,
}

impl ApprovalPolicy {
    pub fn from_config(config: &ApprovalConfig) -> Self {
        Self {
            approver_id: config.approver_id.clone(),
            token_ttl: Duration::hours(i64::from(config.token_ttl_hours)),
            code_ttl: Duration::minutes(i64::from(config.code_ttl_minutes)),
            max_code_attempts: config.max_code_attempts,
            link_base_url: config.link_base_url.clone(),
        }
    }

    fn approval_link(&self, request_id: &ApprovalId, token: &SecretString) -> SecretString {
        SecretString::from(format!(
            "{}/approvals/{}?token={}",
            self.link_base_url.trim_end_matches('/'),
            request_id,
            token.expose_secret()
        ))
    }
}

#[derive(Clone, Debug)]
pub struct NewDiscountRequest {
    pub deal_id: DealId,
    pub requester_id: String,
    pub percent: Decimal,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct ResolveCommand {
    pub request_id: ApprovalId,
    pub code: String,
    pub decision: Decision,
    pub approver_id: String,
    pub rejection_reason: Option<String>,
}

/// `notified` is false when delivery failed after the state was saved; the
/// caller can recover with a reissue.
#[derive(Clone, Debug)]
pub struct CreatedRequest {
    pub request: ApprovalView,
    pub notified: bool,
}

#[derive(Clone, Debug)]
pub struct VerificationOutcome {
    pub request: ApprovalView,
    pub channel: DeliveryChannel,
    /// Present only for [`DeliveryChannel::Dashboard`].
    pub code: Option<SecretString>,
    pub notified: bool,
}

#[derive(Clone, Debug)]
pub struct LinkReissued {
    pub request: ApprovalView,
    pub notified: bool,
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub request: ApprovalView,
    /// Repriced deal, for approvals only.
    pub pricing: Option<DealPricing>,
    pub notified: bool,
}

#[derive(Clone)]
pub struct DiscountApprovalService {
    store: Arc<dyn ApprovalStore>,
    notifier: Arc<dyn ApprovalNotifier>,
    clock: Arc<dyn Clock>,
    issuer: SecretIssuer,
    policy: ApprovalPolicy,
}

impl DiscountApprovalService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        notifier: Arc<dyn ApprovalNotifier>,
        clock: Arc<dyn Clock>,
        issuer: SecretIssuer,
        policy: ApprovalPolicy,
    ) -> Self {
        Self { store, notifier, clock, issuer, policy }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub async fn create_request(
        &self,
        input: NewDiscountRequest,
    ) -> Result<CreatedRequest, ApprovalError> {
        let deal_id = DealId(input.deal_id.0.trim().to_owned());
        let requester_id = input.requester_id.trim().to_owned();
        let reason = input.reason.trim().to_owned();
        if deal_id.0.is_empty() {
            return Err(ApprovalError::Validation("deal id must not be empty".to_owned()));
        }
        if requester_id.is_empty() {
            return Err(ApprovalError::Validation("requester id must not be empty".to_owned()));
        }
        if reason.is_empty() {
            return Err(ApprovalError::Validation("reason must not be empty".to_owned()));
        }
        validate_percent(input.percent)?;

        if self.store.find_deal(&deal_id).await?.is_none() {
            return Err(ApprovalError::NotFound(format!("deal `{deal_id}`")));
        }

        let now = self.clock.now();
        let id = ApprovalId::generate();
        let token = self.issuer.issue_token(&id.0, &self.policy.approver_id)?;
        let request = ApprovalRequest {
            id: id.clone(),
            deal_id: deal_id.clone(),
            requester_id: requester_id.clone(),
            approver_id: self.policy.approver_id.clone(),
            requested_percent: input.percent,
            reason: reason.clone(),
            status: ApprovalStatus::Pending,
            token_hash: token.digest,
            token_expires_at: now + self.policy.token_ttl,
            code_hash: None,
            code_expires_at: None,
            code_attempts: 0,
            resolved_at: None,
            resolved_by_approver_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        let audit = AuditEntry::new(AuditAction::RequestCreated, id.0.clone(), Some(requester_id), now)
            .with_metadata("deal_id", deal_id.0.clone())
            .with_metadata("percent", input.percent.to_string())
            .with_metadata("reason", reason);

        self.store.insert_pending(&request, &audit).await?;
        info!(
            event_name = "approval.request.created",
            request_id = %id,
            deal_id = %deal_id,
            percent = %request.requested_percent,
            "discount request created"
        );

        let notified = self
            .deliver(Notification::ApprovalRequested {
                request_id: id.clone(),
                deal_id,
                approver_id: request.approver_id.clone(),
                requester_id: request.requester_id.clone(),
                requested_percent: request.requested_percent,
                reason: request.reason.clone(),
                link: self.policy.approval_link(&id, &token.plaintext),
                link_expires_at: request.token_expires_at,
            })
            .await;

        Ok(CreatedRequest { request: self.view(&request), notified })
    }

    /// Verifies the link token and issues a fresh code, replacing any earlier
    /// one. Safe to repeat; the attempt counter is left as it is.
    pub async fn begin_verification(
        &self,
        request_id: &ApprovalId,
        token: &str,
        channel: DeliveryChannel,
    ) -> Result<VerificationOutcome, ApprovalError> {
        let current = self.load(request_id).await?;
        ensure_not_terminal(&current)?;

        let now = self.clock.now();
        if !self.issuer.verify_token(&current.id.0, &current.approver_id, token, &current.token_hash)? {
            info!(event_name = "approval.token.rejected", request_id = %current.id, "invalid link token");
            return Err(ApprovalError::Auth(AuthFailure::InvalidToken));
        }
        if current.token_expired(now) {
            info!(event_name = "approval.token.expired", request_id = %current.id, "link token expired");
            return Err(ApprovalError::Auth(AuthFailure::TokenExpired));
        }

        let code = self.issuer.issue_code(&current.id.0)?;
        let mut next = current.clone();
        next.status = ApprovalStatus::CodeSent;
        next.code_hash = Some(code.digest);
        next.code_expires_at = Some(now + self.policy.code_ttl);
        next.updated_at = now;

        let audit = AuditEntry::new(
            AuditAction::CodeIssued,
            current.id.0.clone(),
            Some(current.approver_id.clone()),
            now,
        )
        .with_metadata("channel", channel.as_str())
        .with_metadata("reissue", (current.status == ApprovalStatus::CodeSent).to_string());

        self.store
            .apply_transition(&Precondition::of(&current), &next, &[audit])
            .await
            .map_err(stale_as_conflict)?;
        info!(
            event_name = "approval.code.issued",
            request_id = %next.id,
            deal_id = %next.deal_id,
            channel = channel.as_str(),
            "verification code issued"
        );

        let (code, notified) = match channel {
            DeliveryChannel::Dashboard => (Some(code.plaintext), false),
            DeliveryChannel::Email => {
                let notified = self
                    .deliver(Notification::VerificationCode {
                        request_id: next.id.clone(),
                        approver_id: next.approver_id.clone(),
                        code: code.plaintext,
                        code_expires_at: now + self.policy.code_ttl,
                    })
                    .await;
                (None, notified)
            }
        };

        Ok(VerificationOutcome { request: self.view(&next), channel, code, notified })
    }

    /// Rotates the link token of an active request and re-sends the link.
    pub async fn reissue_link(
        &self,
        request_id: &ApprovalId,
        requester_id: &str,
    ) -> Result<LinkReissued, ApprovalError> {
        let current = self.load(request_id).await?;
        ensure_not_terminal(&current)?;
        if current.requester_id != requester_id.trim() {
            return Err(ApprovalError::Auth(AuthFailure::NotRequester));
        }

        let now = self.clock.now();
        let token = self.issuer.issue_token(&current.id.0, &current.approver_id)?;
        let mut next = current.clone();
        next.token_hash = token.digest;
        next.token_expires_at = now + self.policy.token_ttl;
        next.updated_at = now;

        let audit = AuditEntry::new(
            AuditAction::LinkReissued,
            current.id.0.clone(),
            Some(current.requester_id.clone()),
            now,
        );
        self.store
            .apply_transition(&Precondition::of(&current), &next, &[audit])
            .await
            .map_err(stale_as_conflict)?;
        info!(event_name = "approval.link.reissued", request_id = %next.id, deal_id = %next.deal_id, "approval link reissued");

        let notified = self
            .deliver(Notification::ApprovalRequested {
                request_id: next.id.clone(),
                deal_id: next.deal_id.clone(),
                approver_id: next.approver_id.clone(),
                requester_id: next.requester_id.clone(),
                requested_percent: next.requested_percent,
                reason: next.reason.clone(),
                link: self.policy.approval_link(&next.id, &token.plaintext),
                link_expires_at: next.token_expires_at,
            })
            .await;

        Ok(LinkReissued { request: self.view(&next), notified })
    }

    pub async fn resolve(&self, command: ResolveCommand) -> Result<Resolution, ApprovalError> {
        let current = self.load(&command.request_id).await?;
        match current.status {
            ApprovalStatus::Locked => {
                return Err(ApprovalError::RateLimited { request_id: current.id.0.clone() })
            }
            ApprovalStatus::Approved | ApprovalStatus::Rejected => {
                return Err(ApprovalError::Conflict(ConflictKind::AlreadyResolved {
                    status: current.status,
                }))
            }
            ApprovalStatus::Pending => return Err(ApprovalError::Auth(AuthFailure::CodeNotIssued)),
            ApprovalStatus::CodeSent => {}
        }

        let approver_id = command.approver_id.trim();
        if approver_id != current.approver_id {
            return Err(ApprovalError::Auth(AuthFailure::NotApprover));
        }
        let rejection_reason = command
            .rejection_reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_owned);
        if command.decision == Decision::Reject && rejection_reason.is_none() {
            return Err(ApprovalError::Validation("rejection reason must not be empty".to_owned()));
        }

        let now = self.clock.now();
        if current.code_attempts >= self.policy.max_code_attempts {
            return Err(self.lock(&current, now).await);
        }
        if current.code_expired(now) {
            return Err(self.record_failed_attempt(&current, now, "expired").await);
        }
        let matches = match current.code_hash.as_deref() {
            Some(stored) => self.issuer.verify_code(&current.id.0, &command.code, stored)?,
            None => false,
        };
        if !matches {
            return Err(self.record_failed_attempt(&current, now, "mismatch").await);
        }

        let expected = Precondition::of(&current);
        let (resolved, pricing) = match command.decision {
            Decision::Approve => {
                let plan = self
                    .store
                    .commit_approval(&expected, &current, approver_id, now)
                    .await
                    .map_err(stale_as_conflict)?;
                info!(
                    event_name = "approval.resolve.approved",
                    request_id = %plan.request.id,
                    deal_id = %plan.request.deal_id,
                    discount_amount = %plan.pricing.discount_amount,
                    final_total = %plan.pricing.final_total,
                    "discount approved and applied"
                );
                (plan.request, Some(plan.pricing))
            }
            Decision::Reject => {
                let reason = rejection_reason.unwrap_or_default();
                let mut next = current.clone();
                next.status = ApprovalStatus::Rejected;
                next.code_hash = None;
                next.resolved_at = Some(now);
                next.resolved_by_approver_id = Some(approver_id.to_owned());
                next.rejection_reason = Some(reason.clone());
                next.updated_at = now;

                let audit = AuditEntry::new(
                    AuditAction::RequestRejected,
                    current.id.0.clone(),
                    Some(approver_id.to_owned()),
                    now,
                )
                .with_metadata("deal_id", current.deal_id.0.clone())
                .with_metadata("rejection_reason", reason);
                self.store
                    .apply_transition(&expected, &next, &[audit])
                    .await
                    .map_err(stale_as_conflict)?;
                info!(
                    event_name = "approval.resolve.rejected",
                    request_id = %next.id,
                    deal_id = %next.deal_id,
                    "discount rejected"
                );
                (next, None)
            }
        };

        let notified = self
            .deliver(Notification::RequestResolved {
                request_id: resolved.id.clone(),
                deal_id: resolved.deal_id.clone(),
                requester_id: resolved.requester_id.clone(),
                status: resolved.status,
                final_total: pricing.as_ref().map(|pricing| pricing.final_total),
                rejection_reason: resolved.rejection_reason.clone(),
            })
            .await;

        Ok(Resolution { request: self.view(&resolved), pricing, notified })
    }

    pub async fn request_status(&self, request_id: &ApprovalId) -> Result<ApprovalView, ApprovalError> {
        let request = self.load(request_id).await?;
        Ok(self.view(&request))
    }

    pub async fn list_for_deal(&self, deal_id: &DealId) -> Result<Vec<ApprovalView>, ApprovalError> {
        let requests = self.store.list_for_deal(deal_id).await?;
        Ok(requests.iter().map(|request| self.view(request)).collect())
    }

    pub async fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEntry>, ApprovalError> {
        Ok(self.store.entries_for(entity_id).await?)
    }

    pub async fn deal_pricing(&self, deal_id: &DealId) -> Result<DealPricing, ApprovalError> {
        self.store
            .find_deal(deal_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(format!("deal `{deal_id}`")))
    }

    /// Sets a deal's undiscounted total. Refused while an approval is active.
    pub async fn set_base_total(
        &self,
        deal_id: &DealId,
        base_total: Decimal,
        actor_id: &str,
    ) -> Result<DealPricing, ApprovalError> {
        if deal_id.0.trim().is_empty() {
            return Err(ApprovalError::Validation("deal id must not be empty".to_owned()));
        }
        validate_base_total(base_total)?;
        let now = self.clock.now();
        let audit = AuditEntry::new(
            AuditAction::DealBaseTotalSet,
            deal_id.0.clone(),
            Some(actor_id.to_owned()),
            now,
        )
        .with_metadata("base_total", base_total.to_string());
        let pricing = self.store.upsert_base_total(deal_id, base_total, now, &audit).await?;
        info!(event_name = "deal.base_total.set", deal_id = %deal_id, base_total = %base_total, "deal base total set");
        Ok(pricing)
    }

    async fn load(&self, request_id: &ApprovalId) -> Result<ApprovalRequest, ApprovalError> {
        self.store
            .find_request(request_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(format!("discount request `{request_id}`")))
    }

    fn view(&self, request: &ApprovalRequest) -> ApprovalView {
        request.view(self.policy.max_code_attempts)
    }

    /// Persists one failed code attempt and returns the error to report.
    /// Reaching the attempt budget locks the request in the same write.
    async fn record_failed_attempt(
        &self,
        current: &ApprovalRequest,
        now: DateTime<Utc>,
        cause: &str,
    ) -> ApprovalError {
        let attempts = current.code_attempts.saturating_add(1);
        let locked = attempts >= self.policy.max_code_attempts;

        let mut next = current.clone();
        next.code_attempts = attempts;
        next.updated_at = now;
        let mut audit = vec![AuditEntry::new(
            AuditAction::CodeFailed,
            current.id.0.clone(),
            Some(current.approver_id.clone()),
            now,
        )
        .with_metadata("cause", cause)
        .with_metadata("attempt", attempts.to_string())];
        if locked {
            next.status = ApprovalStatus::Locked;
            next.code_hash = None;
            audit.push(
                AuditEntry::new(AuditAction::RequestLocked, current.id.0.clone(), None, now)
                    .with_metadata("attempts", attempts.to_string()),
            );
        }

        if let Err(error) =
            self.store.apply_transition(&Precondition::of(current), &next, &audit).await
        {
            return stale_as_conflict(error);
        }

        let attempts_remaining = self.policy.max_code_attempts.saturating_sub(attempts);
        if locked {
            warn!(
                event_name = "approval.resolve.locked",
                request_id = %current.id,
                deal_id = %current.deal_id,
                attempts,
                "request locked after exhausting code attempts"
            );
            return ApprovalError::RateLimited { request_id: current.id.0.clone() };
        }

        info!(
            event_name = "approval.code.failed",
            request_id = %current.id,
            cause,
            attempts,
            "verification code rejected"
        );
        match cause {
            "expired" => ApprovalError::Auth(AuthFailure::CodeExpired { attempts_remaining }),
            _ => ApprovalError::Auth(AuthFailure::CodeMismatch { attempts_remaining }),
        }
    }

    /// Locks a request whose stored attempt count already reached the budget.
    async fn lock(&self, current: &ApprovalRequest, now: DateTime<Utc>) -> ApprovalError {
        let mut next = current.clone();
        next.status = ApprovalStatus::Locked;
        next.code_hash = None;
        next.updated_at = now;
        let audit = AuditEntry::new(AuditAction::RequestLocked, current.id.0.clone(), None, now)
            .with_metadata("attempts", current.code_attempts.to_string());

        match self.store.apply_transition(&Precondition::of(current), &next, &[audit]).await {
            Ok(()) => ApprovalError::RateLimited { request_id: current.id.0.clone() },
            Err(error) => stale_as_conflict(error),
        }
    }

    async fn deliver(&self, notification: Notification) -> bool {
        match self.notifier.notify(&notification).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    event_name = "approval.notify.failed",
                    request_id = %notification.request_id(),
                    notification = notification.kind(),
                    error = %error,
                    "notification delivery failed after state was persisted"
                );
                false
            }
        }
    }
}

fn ensure_not_terminal(request: &ApprovalRequest) -> Result<(), ApprovalError> {
    if request.status.is_terminal() {
        return Err(ApprovalError::Conflict(ConflictKind::AlreadyResolved {
            status: request.status,
        }));
    }
    Ok(())
}

fn stale_as_conflict(error: StoreError) -> ApprovalError {
    match error {
        StoreError::PreconditionFailed => ApprovalError::Conflict(ConflictKind::StaleState),
        other => ApprovalError::from(other),
    }
}
