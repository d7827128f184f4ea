use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::deal::DealId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl ApprovalId {
    pub fn generate() -> Self {
        Self(format!("DAR-{}", Uuid::new_v4().simple()))
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    CodeSent,
    Approved,
    Rejected,
    Locked,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::CodeSent => "CODE_SENT",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Locked => "LOCKED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "CODE_SENT" => Some(Self::CodeSent),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "LOCKED" => Some(Self::Locked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Locked)
    }

    /// Legal moves. A non-terminal status may stay put for link and code
    /// reissues and for counted failures.
    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending)
                | (Self::Pending, Self::CodeSent)
                | (Self::CodeSent, Self::CodeSent)
                | (Self::CodeSent, Self::Approved)
                | (Self::CodeSent, Self::Rejected)
                | (Self::CodeSent, Self::Locked)
        )
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Persisted discount request. The digest fields never leave the store layer
/// except through [`ApprovalView`], which drops them.
#[derive(Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub deal_id: DealId,
    pub requester_id: String,
    pub approver_id: String,
    pub requested_percent: Decimal,
    pub reason: String,
    pub status: ApprovalStatus,
    pub token_hash: String,
    pub token_expires_at: DateTime<Utc>,
    pub code_hash: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub code_attempts: u32,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by_approver_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for ApprovalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalRequest")
            .field("id", &self.id)
            .field("deal_id", &self.deal_id)
            .field("requester_id", &self.requester_id)
            .field("approver_id", &self.approver_id)
            .field("requested_percent", &self.requested_percent)
            .field("status", &self.status)
            .field("token_expires_at", &self.token_expires_at)
            .field("code_issued", &self.code_hash.is_some())
            .field("code_expires_at", &self.code_expires_at)
            .field("code_attempts", &self.code_attempts)
            .field("resolved_at", &self.resolved_at)
            .finish_non_exhaustive()
    }
}

impl ApprovalRequest {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.token_expires_at
    }

    pub fn code_expired(&self, now: DateTime<Utc>) -> bool {
        self.code_expires_at.map(|expires_at| now >= expires_at).unwrap_or(true)
    }

    pub fn view(&self, max_code_attempts: u32) -> ApprovalView {
        ApprovalView {
            id: self.id.clone(),
            deal_id: self.deal_id.clone(),
            requester_id: self.requester_id.clone(),
            requested_percent: self.requested_percent,
            reason: self.reason.clone(),
            status: self.status,
            token_expires_at: self.token_expires_at,
            code_issued: self.code_hash.is_some(),
            code_expires_at: self.code_expires_at,
            code_attempts: self.code_attempts,
            attempts_remaining: max_code_attempts.saturating_sub(self.code_attempts),
            resolved_at: self.resolved_at,
            resolved_by_approver_id: self.resolved_by_approver_id.clone(),
            rejection_reason: self.rejection_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read model handed to callers: expiry and presence of secrets, never digests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalView {
    pub id: ApprovalId,
    pub deal_id: DealId,
    pub requester_id: String,
    pub requested_percent: Decimal,
    pub reason: String,
    pub status: ApprovalStatus,
    pub token_expires_at: DateTime<Utc>,
    pub code_issued: bool,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub code_attempts: u32,
    pub attempts_remaining: u32,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by_approver_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
