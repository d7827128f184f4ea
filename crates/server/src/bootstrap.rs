use std::sync::Arc;

use dealdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use dealdesk_core::secrets::SecretError;
use dealdesk_core::{ApprovalPolicy, DiscountApprovalService, NotifyError, SecretIssuer, SystemClock};
use dealdesk_db::{connect_from_config, migrations, DbPool, SqlApprovalStore};
use thiserror::Error;
use tracing::info;

use crate::notify;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: DiscountApprovalService,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("token signing key rejected: {0}")]
    Signing(#[source] SecretError),
    #[error("notifier setup failed: {0}")]
    Notifier(#[source] NotifyError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let issuer = SecretIssuer::new(config.approval.token_signing_key.clone())
        .map_err(BootstrapError::Signing)?;
    let notifier = notify::from_config(&config).map_err(BootstrapError::Notifier)?;
    let service = DiscountApprovalService::new(
        Arc::new(SqlApprovalStore::new(db_pool.clone())),
        notifier,
        Arc::new(SystemClock),
        issuer,
        ApprovalPolicy::from_config(&config.approval),
    );
    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        approver_id = %config.approval.approver_id,
        notifier = ?config.notifier.kind,
        max_code_attempts = config.approval.max_code_attempts,
        "approval service wired"
    );

    Ok(Application { config, db_pool, service })
}
