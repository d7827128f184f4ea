use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use dealdesk_core::approvals::store::{ApprovalStore, Precondition, StoreError};
use dealdesk_core::audit::{AuditEntry, AuditLog};
use dealdesk_core::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
use dealdesk_core::domain::deal::{DealId, DealPricing};
use dealdesk_core::pricing::{plan_approval, ApprovalPlan};

use super::{audit, deal, decode_decimal, decode_timestamp, encode_timestamp, RepositoryError};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, deal_id, requester_id, approver_id, requested_percent, reason,
     status, token_hash, token_expires_at, code_hash, code_expires_at, code_attempts,
     resolved_at, resolved_by_approver_id, rejection_reason, created_at, updated_at";

/// SQLite implementation of the approval store. Every mutation runs in one
/// transaction and guards its UPDATE on the columns captured in a
/// [`Precondition`], so concurrent resolutions cannot both land.
#[derive(Clone)]
pub struct SqlApprovalStore {
    pool: DbPool,
}

impl SqlApprovalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn request_from_row(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = ApprovalStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status_raw}`")))?;
    let requested_percent: String = row.try_get("requested_percent")?;
    let token_expires_at: String = row.try_get("token_expires_at")?;
    let code_expires_at: Option<String> = row.try_get("code_expires_at")?;
    let code_attempts: i64 = row.try_get("code_attempts")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ApprovalRequest {
        id: ApprovalId(row.try_get("id")?),
        deal_id: DealId(row.try_get("deal_id")?),
        requester_id: row.try_get("requester_id")?,
        approver_id: row.try_get("approver_id")?,
        requested_percent: decode_decimal("requested_percent", &requested_percent)?,
        reason: row.try_get("reason")?,
        status,
        token_hash: row.try_get("token_hash")?,
        token_expires_at: decode_timestamp("token_expires_at", &token_expires_at)?,
        code_hash: row.try_get("code_hash")?,
        code_expires_at: code_expires_at
            .as_deref()
            .map(|raw| decode_timestamp("code_expires_at", raw))
            .transpose()?,
        code_attempts: u32::try_from(code_attempts).map_err(|_| {
            RepositoryError::Decode(format!("code_attempts out of range: {code_attempts}"))
        })?,
        resolved_at: resolved_at
            .as_deref()
            .map(|raw| decode_timestamp("resolved_at", raw))
            .transpose()?,
        resolved_by_approver_id: row.try_get("resolved_by_approver_id")?,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

async fn find_request_in(
    conn: &mut SqliteConnection,
    id: &ApprovalId,
) -> Result<Option<ApprovalRequest>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM discount_approval_request WHERE id = ?"
    ))
    .bind(&id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(request_from_row).transpose()
}

async fn has_active_request(
    conn: &mut SqliteConnection,
    deal_id: &DealId,
) -> Result<bool, RepositoryError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM discount_approval_request
         WHERE deal_id = ? AND status IN ('PENDING', 'CODE_SENT')",
    )
    .bind(&deal_id.0)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

/// Compare-and-set of the mutable request columns. Returns the number of
/// rows written, which is zero when the precondition no longer holds.
async fn conditional_update(
    conn: &mut SqliteConnection,
    expected: &Precondition,
    next: &ApprovalRequest,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query(
        "UPDATE discount_approval_request
         SET status = ?,
             token_hash = ?,
             token_expires_at = ?,
             code_hash = ?,
             code_expires_at = ?,
             code_attempts = ?,
             resolved_at = ?,
             resolved_by_approver_id = ?,
             rejection_reason = ?,
             updated_at = ?
         WHERE id = ?
           AND status = ?
           AND code_attempts = ?
           AND token_hash = ?
           AND code_hash IS ?",
    )
    .bind(next.status.as_str())
    .bind(&next.token_hash)
    .bind(encode_timestamp(&next.token_expires_at))
    .bind(&next.code_hash)
    .bind(next.code_expires_at.as_ref().map(encode_timestamp))
    .bind(i64::from(next.code_attempts))
    .bind(next.resolved_at.as_ref().map(encode_timestamp))
    .bind(&next.resolved_by_approver_id)
    .bind(&next.rejection_reason)
    .bind(encode_timestamp(&next.updated_at))
    .bind(&next.id.0)
    .bind(expected.status.as_str())
    .bind(i64::from(expected.code_attempts))
    .bind(&expected.token_hash)
    .bind(&expected.code_hash)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn missing_or_stale(
    conn: &mut SqliteConnection,
    id: &ApprovalId,
) -> Result<StoreError, RepositoryError> {
    Ok(match find_request_in(conn, id).await? {
        Some(_) => StoreError::PreconditionFailed,
        None => StoreError::NotFound(format!("discount request `{id}`")),
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl AuditLog for SqlApprovalStore {
    async fn entries_for(&self, entity_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(audit::entries_for(&self.pool, entity_id).await?)
    }
}

#[async_trait]
impl ApprovalStore for SqlApprovalStore {
    async fn insert_pending(
        &self,
        request: &ApprovalRequest,
        audit_entry: &AuditEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        if has_active_request(&mut tx, &request.deal_id).await? {
            return Err(StoreError::ActiveRequestExists { deal_id: request.deal_id.0.clone() });
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO discount_approval_request ({REQUEST_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&request.id.0)
        .bind(&request.deal_id.0)
        .bind(&request.requester_id)
        .bind(&request.approver_id)
        .bind(request.requested_percent.to_string())
        .bind(&request.reason)
        .bind(request.status.as_str())
        .bind(&request.token_hash)
        .bind(encode_timestamp(&request.token_expires_at))
        .bind(&request.code_hash)
        .bind(request.code_expires_at.as_ref().map(encode_timestamp))
        .bind(i64::from(request.code_attempts))
        .bind(request.resolved_at.as_ref().map(encode_timestamp))
        .bind(&request.resolved_by_approver_id)
        .bind(&request.rejection_reason)
        .bind(encode_timestamp(&request.created_at))
        .bind(encode_timestamp(&request.updated_at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // Lost a race with another insert for the same deal.
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::ActiveRequestExists {
                    deal_id: request.deal_id.0.clone(),
                })
            }
            Err(error) => return Err(RepositoryError::from(error).into()),
        }

        audit::insert_entry(&mut tx, audit_entry).await?;
        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn find_request(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        Ok(find_request_in(&mut conn, id).await?)
    }

    async fn list_for_deal(&self, deal_id: &DealId) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM discount_approval_request
             WHERE deal_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(request_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn apply_transition(
        &self,
        expected: &Precondition,
        next: &ApprovalRequest,
        audit_entries: &[AuditEntry],
    ) -> Result<(), StoreError> {
        expected.permits(next.status)?;
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        if conditional_update(&mut tx, expected, next).await? == 0 {
            return Err(missing_or_stale(&mut tx, &next.id).await?);
        }
        for entry in audit_entries {
            audit::insert_entry(&mut tx, entry).await?;
        }

        tx.commit().await.map_err(RepositoryError::from)?;
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
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        let stored = find_request_in(&mut tx, &request.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("discount request `{}`", request.id)))?;
        if !expected.matches(&stored) {
            return Err(StoreError::PreconditionFailed);
        }
        let current = deal::find(&mut tx, &stored.deal_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("deal `{}`", stored.deal_id)))?;
        let plan = plan_approval(&stored, &current, approver_id, now)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;

        if conditional_update(&mut tx, expected, &plan.request).await? == 0 {
            return Err(StoreError::PreconditionFailed);
        }
        deal::write_pricing(&mut tx, &plan.pricing).await?;
        audit::insert_entry(&mut tx, &plan.audit).await?;

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(plan)
    }

    async fn find_deal(&self, deal_id: &DealId) -> Result<Option<DealPricing>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        Ok(deal::find(&mut conn, deal_id).await?)
    }

    async fn upsert_base_total(
        &self,
        deal_id: &DealId,
        base_total: Decimal,
        now: DateTime<Utc>,
        audit_entry: &AuditEntry,
    ) -> Result<DealPricing, StoreError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        if has_active_request(&mut tx, deal_id).await? {
            return Err(StoreError::ActiveRequestExists { deal_id: deal_id.0.clone() });
        }
        let pricing = DealPricing::undiscounted(deal_id.clone(), base_total, now);
        deal::write_pricing(&mut tx, &pricing).await?;
        audit::insert_entry(&mut tx, audit_entry).await?;

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(pricing)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use dealdesk_core::approvals::store::{ApprovalStore, Precondition, StoreError};
    use dealdesk_core::audit::{AuditAction, AuditEntry, AuditLog};
    use dealdesk_core::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
    use dealdesk_core::domain::deal::DealId;

    use super::SqlApprovalStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlApprovalStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlApprovalStore::new(pool)
    }

    fn audit(action: AuditAction, entity: &str) -> AuditEntry {
        AuditEntry::new(action, entity, Some("rep-1".to_owned()), Utc::now())
            .with_metadata("note", "unit")
    }

    fn pending(id: &str, deal: &str) -> ApprovalRequest {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 8, 30, 0).single().expect("valid timestamp");
        ApprovalRequest {
            id: ApprovalId(id.to_owned()),
            deal_id: DealId(deal.to_owned()),
            requester_id: "rep-1".to_owned(),
            approver_id: "approver-1".to_owned(),
            requested_percent: Decimal::new(125, 1),
            reason: "multi-year commitment".to_owned(),
            status: ApprovalStatus::Pending,
            token_hash: "token-digest".to_owned(),
            token_expires_at: now + Duration::hours(24),
            code_hash: None,
            code_expires_at: None,
            code_attempts: 0,
            resolved_at: None,
            resolved_by_approver_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed_deal(store: &SqlApprovalStore, deal: &str, total: i64) {
        store
            .upsert_base_total(
                &DealId(deal.to_owned()),
                Decimal::from(total),
                Utc::now(),
                &audit(AuditAction::DealBaseTotalSet, deal),
            )
            .await
            .expect("seed deal");
    }

    #[tokio::test]
    async fn request_round_trips_through_sqlite() {
        let store = store().await;
        seed_deal(&store, "D-1", 100_000).await;
        let request = pending("DAR-1", "D-1");
        store
            .insert_pending(&request, &audit(AuditAction::RequestCreated, "DAR-1"))
            .await
            .expect("insert");

        let loaded = store.find_request(&request.id).await.expect("find").expect("present");
        assert_eq!(loaded, request);
        assert_eq!(loaded.requested_percent, Decimal::new(125, 1));

        let trail = store.entries_for("DAR-1").await.expect("audit");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].metadata.get("note").map(String::as_str), Some("unit"));
    }

    #[tokio::test]
    async fn one_active_request_per_deal() {
        let store = store().await;
        seed_deal(&store, "D-1", 100_000).await;
        store
            .insert_pending(&pending("DAR-1", "D-1"), &audit(AuditAction::RequestCreated, "DAR-1"))
            .await
            .expect("insert");

        let second = store
            .insert_pending(&pending("DAR-2", "D-1"), &audit(AuditAction::RequestCreated, "DAR-2"))
            .await;
        assert_eq!(second, Err(StoreError::ActiveRequestExists { deal_id: "D-1".to_owned() }));
        assert!(store.entries_for("DAR-2").await.expect("audit").is_empty());
        assert!(store.find_request(&ApprovalId("DAR-2".to_owned())).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn conditional_update_refuses_stale_writer() {
        let store = store().await;
        seed_deal(&store, "D-1", 100_000).await;
        let original = pending("DAR-1", "D-1");
        store
            .insert_pending(&original, &audit(AuditAction::RequestCreated, "DAR-1"))
            .await
            .expect("insert");

        let mut issued = original.clone();
        issued.status = ApprovalStatus::CodeSent;
        issued.code_hash = Some("v1$00$11".to_owned());
        issued.code_expires_at = Some(original.created_at + Duration::minutes(10));
        store
            .apply_transition(
                &Precondition::of(&original),
                &issued,
                &[audit(AuditAction::CodeIssued, "DAR-1")],
            )
            .await
            .expect("first writer wins");

        let racing = store
            .apply_transition(
                &Precondition::of(&original),
                &issued,
                &[audit(AuditAction::CodeIssued, "DAR-1")],
            )
            .await;
        assert_eq!(racing, Err(StoreError::PreconditionFailed));
        assert_eq!(store.entries_for("DAR-1").await.expect("audit").len(), 2);

        let missing = store
            .apply_transition(&Precondition::of(&original), &pending("DAR-404", "D-1"), &[])
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn illegal_status_change_is_refused_before_writing() {
        let store = store().await;
        seed_deal(&store, "D-1", 100_000).await;
        let mut rejected = pending("DAR-1", "D-1");
        rejected.status = ApprovalStatus::Rejected;
        rejected.rejection_reason = Some("over budget".to_owned());
        store
            .insert_pending(&rejected, &audit(AuditAction::RequestCreated, "DAR-1"))
            .await
            .expect("insert");

        let mut reopened = rejected.clone();
        reopened.status = ApprovalStatus::CodeSent;
        reopened.code_hash = Some("v1$00$11".to_owned());
        let result = store
            .apply_transition(
                &Precondition::of(&rejected),
                &reopened,
                &[audit(AuditAction::CodeIssued, "DAR-1")],
            )
            .await;

        assert_eq!(
            result,
            Err(StoreError::IllegalTransition {
                from: ApprovalStatus::Rejected,
                to: ApprovalStatus::CodeSent
            })
        );
        let stored = store.find_request(&rejected.id).await.expect("find").expect("present");
        assert_eq!(stored, rejected);
        assert_eq!(store.entries_for("DAR-1").await.expect("audit").len(), 1);

        let approve = store
            .commit_approval(&Precondition::of(&rejected), &rejected, "approver-1", Utc::now())
            .await;
        assert!(matches!(approve, Err(StoreError::IllegalTransition { .. })));
        let deal = store.find_deal(&DealId("D-1".to_owned())).await.expect("deal").expect("present");
        assert_eq!(deal.final_total, Decimal::from(100_000));
    }

    #[tokio::test]
    async fn approval_commit_reprices_deal_and_audits_together() {
        let store = store().await;
        seed_deal(&store, "D-1", 100_000).await;
        let mut request = pending("DAR-1", "D-1");
        request.requested_percent = Decimal::from(10);
        store
            .insert_pending(&request, &audit(AuditAction::RequestCreated, "DAR-1"))
            .await
            .expect("insert");
        let mut issued = request.clone();
        issued.status = ApprovalStatus::CodeSent;
        issued.code_hash = Some("v1$00$11".to_owned());
        store.apply_transition(&Precondition::of(&request), &issued, &[]).await.expect("issue");

        let now = Utc::now();
        let plan = store
            .commit_approval(&Precondition::of(&issued), &issued, "approver-1", now)
            .await
            .expect("commit");
        assert_eq!(plan.pricing.final_total, Decimal::from(90_000));

        let stored = store.find_request(&issued.id).await.expect("find").expect("present");
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.code_hash, None);
        let deal = store.find_deal(&issued.deal_id).await.expect("find").expect("present");
        assert_eq!(deal.discount_amount, Decimal::from(10_000));
        assert_eq!(deal.final_total, Decimal::from(90_000));
        let trail = store.entries_for("DAR-1").await.expect("audit");
        assert_eq!(trail.last().map(|entry| entry.action.clone()), Some(AuditAction::RequestApproved));

        let again = store
            .commit_approval(&Precondition::of(&issued), &issued, "approver-1", now)
            .await;
        assert_eq!(again.err(), Some(StoreError::PreconditionFailed));
    }

    #[tokio::test]
    async fn base_total_update_blocked_by_active_request() {
        let store = store().await;
        seed_deal(&store, "D-1", 100_000).await;
        store
            .insert_pending(&pending("DAR-1", "D-1"), &audit(AuditAction::RequestCreated, "DAR-1"))
            .await
            .expect("insert");

        let result = store
            .upsert_base_total(
                &DealId("D-1".to_owned()),
                Decimal::from(1),
                Utc::now(),
                &audit(AuditAction::DealBaseTotalSet, "D-1"),
            )
            .await;
        assert!(matches!(result, Err(StoreError::ActiveRequestExists { .. })));
        let deal = store.find_deal(&DealId("D-1".to_owned())).await.expect("find").expect("present");
        assert_eq!(deal.base_total, Decimal::from(100_000));
    }
}
