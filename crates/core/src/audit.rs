use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approvals::store::StoreError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RequestCreated,
    LinkReissued,
    CodeIssued,
    CodeFailed,
    RequestLocked,
    RequestApproved,
    RequestRejected,
    DealBaseTotalSet,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestCreated => "discount_request.created",
            Self::LinkReissued => "discount_request.link_reissued",
            Self::CodeIssued => "discount_request.code_issued",
            Self::CodeFailed => "discount_request.code_failed",
            Self::RequestLocked => "discount_request.locked",
            Self::RequestApproved => "discount_request.approved",
            Self::RequestRejected => "discount_request.rejected",
            Self::DealBaseTotalSet => "deal.base_total_set",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "discount_request.created" => Some(Self::RequestCreated),
            "discount_request.link_reissued" => Some(Self::LinkReissued),
            "discount_request.code_issued" => Some(Self::CodeIssued),
            "discount_request.code_failed" => Some(Self::CodeFailed),
            "discount_request.locked" => Some(Self::RequestLocked),
            "discount_request.approved" => Some(Self::RequestApproved),
            "discount_request.rejected" => Some(Self::RequestRejected),
            "deal.base_total_set" => Some(Self::DealBaseTotalSet),
            _ => None,
        }
    }
}

/// Append-only compliance record. Entries are written in the same unit of
/// work as the state change they describe and are never updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub entry_id: String,
    pub action: AuditAction,
    pub entity_id: String,
    pub actor_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        entity_id: impl Into<String>,
        actor_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            action,
            entity_id: entity_id.into(),
            actor_id,
            metadata: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Read side of the audit trail. Entries are only ever written by the store
/// in the same unit as the state change they describe.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append order.
    async fn entries_for(&self, entity_id: &str) -> Result<Vec<AuditEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::audit::{AuditAction, AuditEntry};

    #[test]
    fn entry_carries_actor_and_metadata() {
        let entry = AuditEntry::new(
            AuditAction::RequestApproved,
            "DAR-1",
            Some("approver-1".to_owned()),
            Utc::now(),
        )
        .with_metadata("discount_amount", "10000")
        .with_metadata("final_total", "90000");

        assert_eq!(entry.action.as_str(), "discount_request.approved");
        assert_eq!(entry.actor_id.as_deref(), Some("approver-1"));
        assert_eq!(entry.metadata.get("final_total").map(String::as_str), Some("90000"));
        assert!(!entry.entry_id.is_empty());
    }

    #[test]
    fn action_names_parse_back() {
        for action in [
            AuditAction::RequestCreated,
            AuditAction::LinkReissued,
            AuditAction::CodeIssued,
            AuditAction::CodeFailed,
            AuditAction::RequestLocked,
            AuditAction::RequestApproved,
            AuditAction::RequestRejected,
            AuditAction::DealBaseTotalSet,
        ] {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
        }
    }
}
