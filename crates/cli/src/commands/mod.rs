pub mod audit;
pub mod config;
pub mod deal;
pub mod doctor;
pub mod migrate;
pub mod status;

use std::future::Future;
use std::sync::Arc;

use dealdesk_core::approvals::notify::LoggingNotifier;
use dealdesk_core::config::{AppConfig, LoadOptions};
use dealdesk_core::{
    ApprovalError, ApprovalPolicy, DiscountApprovalService, SecretIssuer, SystemClock,
};
use dealdesk_db::{connect_from_config, migrations, SqlApprovalStore};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Exit code for workflow errors surfaced by the approval service.
pub const APPROVAL_ERROR_EXIT: u8 = 7;

/// Loads config, opens and migrates the database, and runs `operation`
/// against a service wired to it. Notifications are logged, never sent.
pub(crate) fn with_service<T, F, Fut>(command: &str, operation: F) -> Result<T, CommandResult>
where
    F: FnOnce(DiscountApprovalService) -> Fut,
    Fut: Future<Output = Result<T, ApprovalError>>,
{
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(
        |error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        },
    )?;

    runtime.block_on(async {
        let pool = connect_from_config(&config.database).await.map_err(|error| {
            CommandResult::failure(command, "db_connectivity", error.to_string(), 4)
        })?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandResult::failure(command, "migration", error.to_string(), 5))?;

        let issuer = SecretIssuer::new(config.approval.token_signing_key.clone())
            .map_err(|error| CommandResult::failure(command, "signing_key", error.to_string(), 6))?;
        let service = DiscountApprovalService::new(
            Arc::new(SqlApprovalStore::new(pool.clone())),
            Arc::new(LoggingNotifier),
            Arc::new(SystemClock),
            issuer,
            ApprovalPolicy::from_config(&config.approval),
        );

        let result = operation(service).await.map_err(|error| {
            CommandResult::failure(command, error.kind(), error.to_string(), APPROVAL_ERROR_EXIT)
        });
        pool.close().await;
        result
    })
}

pub(crate) fn to_data<T: Serialize>(command: &str, value: &T) -> Result<Value, CommandResult> {
    serde_json::to_value(value)
        .map_err(|error| CommandResult::failure(command, "serialization", error.to_string(), 1))
}
