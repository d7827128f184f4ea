use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::approval::{ApprovalId, ApprovalStatus};
use crate::domain::deal::DealId;

/// How a verification code reaches the approver. Both channels share one
/// state machine; only delivery differs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    /// Sent through the notifier, never returned to the caller.
    #[default]
    Email,
    /// Returned once in the operation result for on-screen display.
    Dashboard,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Dashboard => "dashboard",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "dashboard" => Some(Self::Dashboard),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Notification {
    ApprovalRequested {
        request_id: ApprovalId,
        deal_id: DealId,
        approver_id: String,
        requester_id: String,
        requested_percent: Decimal,
        reason: String,
        link: SecretString,
        link_expires_at: DateTime<Utc>,
    },
    VerificationCode {
        request_id: ApprovalId,
        approver_id: String,
        code: SecretString,
        code_expires_at: DateTime<Utc>,
    },
    RequestResolved {
        request_id: ApprovalId,
        deal_id: DealId,
        requester_id: String,
        status: ApprovalStatus,
        final_total: Option<Decimal>,
        rejection_reason: Option<String>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::VerificationCode { .. } => "verification_code",
            Self::RequestResolved { .. } => "request_resolved",
        }
    }

    pub fn request_id(&self) -> &ApprovalId {
        match self {
            Self::ApprovalRequested { request_id, .. }
            | Self::VerificationCode { request_id, .. }
            | Self::RequestResolved { request_id, .. } => request_id,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Self::ApprovalRequested { approver_id, .. }
            | Self::VerificationCode { approver_id, .. } => approver_id,
            Self::RequestResolved { requester_id, .. } => requester_id,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification rejected by relay: status {status}")]
    Rejected { status: u16 },
    #[error("notification could not be rendered: {0}")]
    Render(String),
}

/// Outbound delivery. Callers persist state before notifying, so a failure
/// here never leaves a record claiming a delivery that did not happen.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Records that a notification was due without delivering its secrets.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl ApprovalNotifier for LoggingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            event_name = "approval.notify.logged",
            notification = notification.kind(),
            request_id = %notification.request_id(),
            recipient = notification.recipient(),
            "notification delivery is log-only"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery fails; nothing is recorded.
    pub fn failing() -> Self {
        Self { sent: Arc::default(), failing: true }
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ApprovalNotifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing {
            return Err(NotifyError::Transport("recording notifier configured to fail".to_owned()));
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{ApprovalNotifier, DeliveryChannel, Notification, RecordingNotifier};
    use crate::domain::approval::ApprovalId;

    fn code_notification() -> Notification {
        Notification::VerificationCode {
            request_id: ApprovalId("DAR-1".to_owned()),
            approver_id: "approver-1".to_owned(),
            code: SecretString::from("123456".to_owned()),
            code_expires_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn recording_notifier_keeps_sent_notifications() {
        let notifier = RecordingNotifier::new();
        notifier.notify(&code_notification()).await.expect("delivered");

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "verification_code");
        assert_eq!(sent[0].recipient(), "approver-1");
    }

    #[tokio::test]
    async fn failing_notifier_reports_error() {
        let notifier = RecordingNotifier::failing();
        assert!(notifier.notify(&code_notification()).await.is_err());
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn channel_parse_is_case_insensitive() {
        assert_eq!(DeliveryChannel::parse("Dashboard"), Some(DeliveryChannel::Dashboard));
        assert_eq!(DeliveryChannel::parse("email"), Some(DeliveryChannel::Email));
        assert_eq!(DeliveryChannel::parse("sms"), None);
    }
}
