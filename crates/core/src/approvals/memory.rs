use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::approvals::store::{ApprovalStore, Precondition, StoreError};
use crate::audit::{AuditEntry, AuditLog};
use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::deal::{DealId, DealPricing};
use crate::pricing::{plan_approval, ApprovalPlan};

/// Where an injected failure fires. Used by tests to show that a failed
/// write leaves no partial state behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePoint {
    RequestWrite,
    DealWrite,
    AuditWrite,
}

#[derive(Default)]
struct MemoryState {
    requests: HashMap<String, ApprovalRequest>,
    insertion_order: Vec<String>,
    deals: HashMap<String, DealPricing>,
    audit: Vec<AuditEntry>,
    fail_at: Option<FailurePoint>,
}

impl MemoryState {
    fn trip(&mut self, point: FailurePoint) -> Result<(), StoreError> {
        if self.fail_at == Some(point) {
            self.fail_at = None;
            return Err(StoreError::Unavailable(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn has_active_request(&self, deal_id: &DealId) -> bool {
        self.requests.values().any(|request| request.deal_id == *deal_id && request.is_active())
    }
}

/// In-process store. All writes for one operation happen under a single
/// write lock and are staged before anything is applied, so a failure at any
/// point leaves the state untouched.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    state: RwLock<MemoryState>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_deal(&self, pricing: DealPricing) {
        let mut state = self.state.write().await;
        state.deals.insert(pricing.deal_id.0.clone(), pricing);
    }

    /// The next write that reaches `point` fails once.
    pub async fn fail_next(&self, point: FailurePoint) {
        self.state.write().await.fail_at = Some(point);
    }
}

#[async_trait]
impl AuditLog for InMemoryApprovalStore {
    async fn entries_for(&self, entity_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state.audit.iter().filter(|entry| entry.entity_id == entity_id).cloned().collect())
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn insert_pending(
        &self,
        request: &ApprovalRequest,
        audit: &AuditEntry,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.has_active_request(&request.deal_id) {
            return Err(StoreError::ActiveRequestExists { deal_id: request.deal_id.0.clone() });
        }
        state.trip(FailurePoint::RequestWrite)?;
        state.trip(FailurePoint::AuditWrite)?;

        state.requests.insert(request.id.0.clone(), request.clone());
        state.insertion_order.push(request.id.0.clone());
        state.audit.push(audit.clone());
        Ok(())
    }

    async fn find_request(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.state.read().await.requests.get(&id.0).cloned())
    }

    async fn list_for_deal(&self, deal_id: &DealId) -> Result<Vec<ApprovalRequest>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.requests.get(id))
            .filter(|request| request.deal_id == *deal_id)
            .cloned()
            .collect())
    }

    async fn apply_transition(
        &self,
        expected: &Precondition,
        next: &ApprovalRequest,
        audit: &[AuditEntry],
    ) -> Result<(), StoreError> {
        expected.permits(next.status)?;
        let mut state = self.state.write().await;
        let stored = state
            .requests
            .get(&next.id.0)
            .ok_or_else(|| StoreError::NotFound(format!("discount request `{}`", next.id)))?;
        if !expected.matches(stored) {
            return Err(StoreError::PreconditionFailed);
        }
        state.trip(FailurePoint::RequestWrite)?;
        if !audit.is_empty() {
            state.trip(FailurePoint::AuditWrite)?;
        }

        state.requests.insert(next.id.0.clone(), next.clone());
        state.audit.extend(audit.iter().cloned());
        Ok(())
    }

    async fn commit_approval(
        &self,
        expected: &Precondition,
        request: &ApprovalRequest,
        approver_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalPlan, StoreError> {
        expected.permits(ApprovalStatus::Approved)?;
        let mut state = self.state.write().await;
        let stored = state
            .requests
            .get(&request.id.0)
            .ok_or_else(|| StoreError::NotFound(format!("discount request `{}`", request.id)))?;
        if !expected.matches(stored) {
            return Err(StoreError::PreconditionFailed);
        }
        let current = state
            .deals
            .get(&request.deal_id.0)
            .ok_or_else(|| StoreError::NotFound(format!("deal `{}`", request.deal_id)))?;
        let plan = plan_approval(stored, current, approver_id, now)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;

        state.trip(FailurePoint::RequestWrite)?;
        state.trip(FailurePoint::DealWrite)?;
        state.trip(FailurePoint::AuditWrite)?;

        state.requests.insert(plan.request.id.0.clone(), plan.request.clone());
        state.deals.insert(plan.pricing.deal_id.0.clone(), plan.pricing.clone());
        state.audit.push(plan.audit.clone());
        Ok(plan)
    }

    async fn find_deal(&self, deal_id: &DealId) -> Result<Option<DealPricing>, StoreError> {
        Ok(self.state.read().await.deals.get(&deal_id.0).cloned())
    }

    async fn upsert_base_total(
        &self,
        deal_id: &DealId,
        base_total: Decimal,
        now: DateTime<Utc>,
        audit: &AuditEntry,
    ) -> Result<DealPricing, StoreError> {
        let mut state = self.state.write().await;
        if state.has_active_request(deal_id) {
            return Err(StoreError::ActiveRequestExists { deal_id: deal_id.0.clone() });
        }
        state.trip(FailurePoint::DealWrite)?;
        state.trip(FailurePoint::AuditWrite)?;

        let pricing = DealPricing::undiscounted(deal_id.clone(), base_total, now);
        state.deals.insert(deal_id.0.clone(), pricing.clone());
        state.audit.push(audit.clone());
        Ok(pricing)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{FailurePoint, InMemoryApprovalStore};
    use crate::approvals::store::{ApprovalStore, Precondition, StoreError};
    use crate::audit::{AuditAction, AuditEntry, AuditLog};
    use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
    use crate::domain::deal::{DealId, DealPricing};

    fn request(id: &str, deal: &str, status: ApprovalStatus) -> ApprovalRequest {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        ApprovalRequest {
            id: ApprovalId(id.to_owned()),
            deal_id: DealId(deal.to_owned()),
            requester_id: "rep-1".to_owned(),
            approver_id: "approver-1".to_owned(),
            requested_percent: Decimal::from(10),
            reason: "competitive pressure".to_owned(),
            status,
            token_hash: "token-digest".to_owned(),
            token_expires_at: now + chrono::Duration::hours(24),
            code_hash: Some("code-digest".to_owned()),
            code_expires_at: Some(now + chrono::Duration::minutes(10)),
            code_attempts: 0,
            resolved_at: None,
            resolved_by_approver_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn audit(id: &str) -> AuditEntry {
        AuditEntry::new(AuditAction::RequestCreated, id, Some("rep-1".to_owned()), Utc::now())
    }

    #[tokio::test]
    async fn second_active_request_for_deal_is_refused() {
        let store = InMemoryApprovalStore::new();
        store
            .insert_pending(&request("DAR-1", "D-1", ApprovalStatus::Pending), &audit("DAR-1"))
            .await
            .expect("first insert");

        let second = store
            .insert_pending(&request("DAR-2", "D-1", ApprovalStatus::Pending), &audit("DAR-2"))
            .await;
        assert_eq!(second, Err(StoreError::ActiveRequestExists { deal_id: "D-1".to_owned() }));
        assert_eq!(store.entries_for("DAR-2").await.expect("audit").len(), 0);
    }

    #[tokio::test]
    async fn stale_precondition_is_rejected() {
        let store = InMemoryApprovalStore::new();
        let original = request("DAR-1", "D-1", ApprovalStatus::CodeSent);
        store.insert_pending(&original, &audit("DAR-1")).await.expect("insert");

        let mut bumped = original.clone();
        bumped.code_attempts = 1;
        store
            .apply_transition(&Precondition::of(&original), &bumped, &[])
            .await
            .expect("first transition");

        let racing = store.apply_transition(&Precondition::of(&original), &bumped, &[]).await;
        assert_eq!(racing, Err(StoreError::PreconditionFailed));
    }

    #[tokio::test]
    async fn resolved_request_cannot_be_moved_back() {
        let store = InMemoryApprovalStore::new();
        let approved = request("DAR-1", "D-1", ApprovalStatus::Approved);
        store.insert_pending(&approved, &audit("DAR-1")).await.expect("insert");

        let mut reopened = approved.clone();
        reopened.status = ApprovalStatus::CodeSent;
        let result =
            store.apply_transition(&Precondition::of(&approved), &reopened, &[audit("DAR-1")]).await;

        assert_eq!(
            result,
            Err(StoreError::IllegalTransition {
                from: ApprovalStatus::Approved,
                to: ApprovalStatus::CodeSent
            })
        );
        let stored = store.find_request(&approved.id).await.expect("find").expect("present");
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(store.entries_for("DAR-1").await.expect("audit").len(), 1);

        let pending = request("DAR-2", "D-2", ApprovalStatus::Pending);
        store.insert_pending(&pending, &audit("DAR-2")).await.expect("insert");
        let skipped = store
            .commit_approval(&Precondition::of(&pending), &pending, "approver-1", Utc::now())
            .await;
        assert!(matches!(skipped, Err(StoreError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn failed_audit_write_leaves_approval_unapplied() {
        let store = InMemoryApprovalStore::new();
        let now = Utc::now();
        store.seed_deal(DealPricing::undiscounted(DealId("D-1".to_owned()), Decimal::from(100_000), now)).await;
        let original = request("DAR-1", "D-1", ApprovalStatus::CodeSent);
        store.insert_pending(&original, &audit("DAR-1")).await.expect("insert");

        store.fail_next(FailurePoint::AuditWrite).await;
        let result = store
            .commit_approval(&Precondition::of(&original), &original, "approver-1", now)
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        let stored = store.find_request(&original.id).await.expect("find").expect("present");
        assert_eq!(stored.status, ApprovalStatus::CodeSent);
        let deal = store.find_deal(&original.deal_id).await.expect("find").expect("present");
        assert_eq!(deal.final_total, Decimal::from(100_000));
        assert_eq!(deal.applied_discount_percent, None);
    }

    #[tokio::test]
    async fn base_total_is_locked_while_request_is_active() {
        let store = InMemoryApprovalStore::new();
        store
            .insert_pending(&request("DAR-1", "D-1", ApprovalStatus::Pending), &audit("DAR-1"))
            .await
            .expect("insert");

        let result = store
            .upsert_base_total(&DealId("D-1".to_owned()), Decimal::from(5), Utc::now(), &audit("D-1"))
            .await;
        assert!(matches!(result, Err(StoreError::ActiveRequestExists { .. })));
    }
}
