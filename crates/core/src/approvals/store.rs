use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::audit::{AuditEntry, AuditLog};
use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::deal::{DealId, DealPricing};
use crate::pricing::ApprovalPlan;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("deal `{deal_id}` already has an active discount request")]
    ActiveRequestExists { deal_id: String },
    #[error("stored state no longer matches the expected precondition")]
    PreconditionFailed,
    #[error("status cannot move from {from} to {to}")]
    IllegalTransition { from: ApprovalStatus, to: ApprovalStatus },
    #[error("{0} not found")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// Snapshot of the columns a conditional write is guarded on. A write only
/// lands when every one of them still matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precondition {
    pub status: ApprovalStatus,
    pub code_attempts: u32,
    pub token_hash: String,
    pub code_hash: Option<String>,
}

impl Precondition {
    pub fn of(request: &ApprovalRequest) -> Self {
        Self {
            status: request.status,
            code_attempts: request.code_attempts,
            token_hash: request.token_hash.clone(),
            code_hash: request.code_hash.clone(),
        }
    }

    /// Refuses a write whose target status is not reachable from the
    /// expected one.
    pub fn permits(&self, next: ApprovalStatus) -> Result<(), StoreError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::IllegalTransition { from: self.status, to: next })
        }
    }

    pub fn matches(&self, stored: &ApprovalRequest) -> bool {
        self.status == stored.status
            && self.code_attempts == stored.code_attempts
            && self.token_hash == stored.token_hash
            && self.code_hash == stored.code_hash
    }
}

/// Persistence seam for discount approvals. Every mutating method is atomic:
/// the request row, any deal pricing change and the audit entries either all
/// persist or none do.
#[async_trait]
pub trait ApprovalStore: AuditLog {
    /// Fails with [`StoreError::ActiveRequestExists`] when the deal already has
    /// a `PENDING` or `CODE_SENT` request.
    async fn insert_pending(
        &self,
        request: &ApprovalRequest,
        audit: &AuditEntry,
    ) -> Result<(), StoreError>;

    async fn find_request(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Oldest first.
    async fn list_for_deal(&self, deal_id: &DealId) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// Replaces the mutable request columns with `next` if the stored row
    /// still matches `expected`, otherwise [`StoreError::PreconditionFailed`].
    /// A status change outside the legal table is
    /// [`StoreError::IllegalTransition`] and writes nothing.
    async fn apply_transition(
        &self,
        expected: &Precondition,
        next: &ApprovalRequest,
        audit: &[AuditEntry],
    ) -> Result<(), StoreError>;

    /// Reads the deal, prices the approval and writes request, deal and audit
    /// entry in one unit. Returns what was written.
    async fn commit_approval(
        &self,
        expected: &Precondition,
        request: &ApprovalRequest,
        approver_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalPlan, StoreError>;

    async fn find_deal(&self, deal_id: &DealId) -> Result<Option<DealPricing>, StoreError>;

    /// Sets the undiscounted total. Refused while the deal has an active
    /// request, since that request holds the pricing lock.
    async fn upsert_base_total(
        &self,
        deal_id: &DealId,
        base_total: Decimal,
        now: DateTime<Utc>,
        audit: &AuditEntry,
    ) -> Result<DealPricing, StoreError>;
}
