//! Outbound approval notifications over an HTTP mail relay.
//!
//! Each notification is rendered to a subject and plain-text body with Tera
//! and POSTed as JSON. Links and codes are exposed only while rendering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealdesk_core::approvals::notify::LoggingNotifier;
use dealdesk_core::config::{AppConfig, NotifierKind};
use dealdesk_core::{ApprovalNotifier, Notification, NotifyError};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tera::{Context, Tera};
use tracing::{info, warn};

const APPROVAL_REQUESTED_TEMPLATE: &str = "approval_requested.txt";
const VERIFICATION_CODE_TEMPLATE: &str = "verification_code.txt";
const REQUEST_RESOLVED_TEMPLATE: &str = "request_resolved.txt";

const APPROVAL_REQUESTED_BODY: &str = "\
{{ requester_id }} requested a {{ percent }}% discount on deal {{ deal_id }}.

Reason: {{ reason }}

Review and verify the request here (valid until {{ expires_at }}):
{{ link }}
";

const VERIFICATION_CODE_BODY: &str = "\
Your verification code for discount request {{ request_id }} is {{ code }}.

It expires at {{ expires_at }} and can only be used once.
";

const REQUEST_RESOLVED_BODY: &str = "\
Discount request {{ request_id }} for deal {{ deal_id }} was {{ status }}.
{% if final_total %}
New deal total: {{ final_total }}
{% endif %}{% if rejection_reason %}
Reason: {{ rejection_reason }}
{% endif %}";

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    kind: &'a str,
    request_id: &'a str,
    subject: String,
    body: String,
}

pub struct RelayNotifier {
    client: Client,
    url: String,
    api_key: Option<SecretString>,
    approver_email: Option<String>,
    templates: Arc<Tera>,
}

impl RelayNotifier {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<SecretString>,
        approver_email: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| NotifyError::Transport(error.to_string()))?;
        Ok(Self { client, url: url.into(), api_key, approver_email, templates: templates()? })
    }

    fn render(&self, notification: &Notification) -> Result<(String, String), NotifyError> {
        let mut context = Context::new();
        let (template, subject) = match notification {
            Notification::ApprovalRequested {
                request_id,
                deal_id,
                requester_id,
                requested_percent,
                reason,
                link,
                link_expires_at,
                ..
            } => {
                context.insert("request_id", &request_id.0);
                context.insert("deal_id", &deal_id.0);
                context.insert("requester_id", requester_id);
                context.insert("percent", &requested_percent.to_string());
                context.insert("reason", reason);
                context.insert("link", link.expose_secret());
                context.insert("expires_at", &link_expires_at.to_rfc3339());
                (
                    APPROVAL_REQUESTED_TEMPLATE,
                    format!("Discount approval requested for deal {deal_id}"),
                )
            }
            Notification::VerificationCode { request_id, code, code_expires_at, .. } => {
                context.insert("request_id", &request_id.0);
                context.insert("code", code.expose_secret());
                context.insert("expires_at", &code_expires_at.to_rfc3339());
                (VERIFICATION_CODE_TEMPLATE, "Your discount approval code".to_owned())
            }
            Notification::RequestResolved {
                request_id,
                deal_id,
                status,
                final_total,
                rejection_reason,
                ..
            } => {
                context.insert("request_id", &request_id.0);
                context.insert("deal_id", &deal_id.0);
                context.insert("status", &status.as_str().to_ascii_lowercase());
                context.insert("final_total", &final_total.map(|total| total.to_string()));
                context.insert("rejection_reason", rejection_reason);
                (
                    REQUEST_RESOLVED_TEMPLATE,
                    format!("Discount request {request_id} {}", status.as_str().to_ascii_lowercase()),
                )
            }
        };

        let body = self
            .templates
            .render(template, &context)
            .map_err(|error| NotifyError::Render(error.to_string()))?;
        Ok((subject, body))
    }

    fn recipient<'a>(&'a self, notification: &'a Notification) -> &'a str {
        match notification {
            Notification::ApprovalRequested { .. } | Notification::VerificationCode { .. } => {
                self.approver_email.as_deref().unwrap_or_else(|| notification.recipient())
            }
            Notification::RequestResolved { .. } => notification.recipient(),
        }
    }
}

#[async_trait]
impl ApprovalNotifier for RelayNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (subject, body) = self.render(notification)?;
        let message = RelayMessage {
            to: self.recipient(notification),
            kind: notification.kind(),
            request_id: &notification.request_id().0,
            subject,
            body,
        };

        let mut request = self.client.post(&self.url).json(&message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response =
            request.send().await.map_err(|error| NotifyError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            warn!(
                event_name = "approval.notify.relay_rejected",
                request_id = %notification.request_id(),
                notification = notification.kind(),
                status = %response.status(),
                "mail relay refused notification"
            );
            return Err(NotifyError::Rejected { status: response.status().as_u16() });
        }

        info!(
            event_name = "approval.notify.relayed",
            request_id = %notification.request_id(),
            notification = notification.kind(),
            "notification handed to mail relay"
        );
        Ok(())
    }
}

fn templates() -> Result<Arc<Tera>, NotifyError> {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        (APPROVAL_REQUESTED_TEMPLATE, APPROVAL_REQUESTED_BODY),
        (VERIFICATION_CODE_TEMPLATE, VERIFICATION_CODE_BODY),
        (REQUEST_RESOLVED_TEMPLATE, REQUEST_RESOLVED_BODY),
    ])
    .map_err(|error| NotifyError::Render(error.to_string()))?;
    Ok(Arc::new(tera))
}

/// Picks the notifier named by `notifier.kind`.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn ApprovalNotifier>, NotifyError> {
    match config.notifier.kind {
        NotifierKind::Log => Ok(Arc::new(LoggingNotifier)),
        NotifierKind::Relay => {
            let url = config.notifier.relay_url.clone().ok_or_else(|| {
                NotifyError::Transport("notifier.relay_url is not configured".to_owned())
            })?;
            Ok(Arc::new(RelayNotifier::new(
                url,
                config.notifier.relay_api_key.clone(),
                config.approval.approver_email.clone(),
                Duration::from_secs(config.notifier.timeout_secs),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use chrono::{TimeZone, Utc};
    use dealdesk_core::{ApprovalId, ApprovalNotifier, ApprovalStatus, DealId, Notification, NotifyError};
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use serde_json::Value;

    use super::RelayNotifier;

    #[derive(Clone, Default)]
    struct Captured {
        messages: Arc<Mutex<Vec<(Option<String>, Value)>>>,
        status: Option<StatusCode>,
    }

    async fn capture(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        captured.messages.lock().expect("lock").push((auth, body));
        captured.status.unwrap_or(StatusCode::ACCEPTED)
    }

    async fn relay(status: Option<StatusCode>) -> (String, Captured) {
        let captured = Captured { status, ..Captured::default() };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        let app = Router::new().route("/send", post(capture)).with_state(captured.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{address}/send"), captured)
    }

    fn code_notification() -> Notification {
        Notification::VerificationCode {
            request_id: ApprovalId("DAR-1".to_owned()),
            approver_id: "approver-1".to_owned(),
            code: SecretString::from("042917".to_owned()),
            code_expires_at: Utc.with_ymd_and_hms(2026, 7, 1, 10, 10, 0).single().expect("valid"),
        }
    }

    #[tokio::test]
    async fn relay_receives_rendered_code_with_bearer_key() {
        let (url, captured) = relay(None).await;
        let notifier = RelayNotifier::new(
            url,
            Some(SecretString::from("relay-key".to_owned())),
            Some("vp@example.com".to_owned()),
            Duration::from_secs(5),
        )
        .expect("notifier");

        notifier.notify(&code_notification()).await.expect("delivered");

        let messages = captured.messages.lock().expect("lock").clone();
        assert_eq!(messages.len(), 1);
        let (auth, body) = &messages[0];
        assert_eq!(auth.as_deref(), Some("Bearer relay-key"));
        assert_eq!(body["to"], "vp@example.com");
        assert_eq!(body["kind"], "verification_code");
        assert!(body["body"].as_str().unwrap_or_default().contains("042917"));
    }

    #[tokio::test]
    async fn resolution_goes_to_requester() {
        let (url, captured) = relay(None).await;
        let notifier = RelayNotifier::new(url, None, Some("vp@example.com".to_owned()), Duration::from_secs(5))
            .expect("notifier");

        notifier
            .notify(&Notification::RequestResolved {
                request_id: ApprovalId("DAR-2".to_owned()),
                deal_id: DealId("D-9".to_owned()),
                requester_id: "rep@example.com".to_owned(),
                status: ApprovalStatus::Approved,
                final_total: Some(Decimal::from(90_000)),
                rejection_reason: None,
            })
            .await
            .expect("delivered");

        let messages = captured.messages.lock().expect("lock").clone();
        let (auth, body) = &messages[0];
        assert!(auth.is_none());
        assert_eq!(body["to"], "rep@example.com");
        assert!(body["body"].as_str().unwrap_or_default().contains("New deal total: 90000"));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, _captured) = relay(Some(StatusCode::BAD_GATEWAY)).await;
        let notifier = RelayNotifier::new(url, None, None, Duration::from_secs(5)).expect("notifier");

        let result = notifier.notify(&code_notification()).await;
        assert_eq!(result, Err(NotifyError::Rejected { status: 502 }));
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("address");
        drop(listener);
        let notifier = RelayNotifier::new(
            format!("http://{address}/send"),
            None,
            None,
            Duration::from_secs(2),
        )
        .expect("notifier");

        let result = notifier.notify(&code_notification()).await;
        assert!(matches!(result, Err(NotifyError::Transport(_))));
    }
}
