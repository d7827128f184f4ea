use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dealdesk_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_key, value) in effective_values(&config) {
        let source = field_source(
            key_path,
            env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, &'static str, String)> {
    let approver_email = config.approval.approver_email.as_deref().unwrap_or("<unset>");
    let relay_url = config.notifier.relay_url.as_deref().unwrap_or("<unset>");
    let relay_api_key = if config.notifier.relay_api_key.is_some() { "<redacted>" } else { "<unset>" };

    vec![
        ("database.url", "DEALDESK_DATABASE_URL", config.database.url.clone()),
        (
            "database.max_connections",
            "DEALDESK_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        (
            "database.timeout_secs",
            "DEALDESK_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        ("server.bind_address", "DEALDESK_SERVER_BIND_ADDRESS", config.server.bind_address.clone()),
        ("server.port", "DEALDESK_SERVER_PORT", config.server.port.to_string()),
        (
            "server.graceful_shutdown_secs",
            "DEALDESK_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs.to_string(),
        ),
        ("approval.approver_id", "DEALDESK_APPROVAL_APPROVER_ID", config.approval.approver_id.clone()),
        ("approval.approver_email", "DEALDESK_APPROVAL_APPROVER_EMAIL", approver_email.to_string()),
        (
            "approval.token_signing_key",
            "DEALDESK_APPROVAL_TOKEN_SIGNING_KEY",
            "<redacted>".to_string(),
        ),
        (
            "approval.token_ttl_hours",
            "DEALDESK_APPROVAL_TOKEN_TTL_HOURS",
            config.approval.token_ttl_hours.to_string(),
        ),
        (
            "approval.code_ttl_minutes",
            "DEALDESK_APPROVAL_CODE_TTL_MINUTES",
            config.approval.code_ttl_minutes.to_string(),
        ),
        (
            "approval.max_code_attempts",
            "DEALDESK_APPROVAL_MAX_CODE_ATTEMPTS",
            config.approval.max_code_attempts.to_string(),
        ),
        (
            "approval.link_base_url",
            "DEALDESK_APPROVAL_LINK_BASE_URL",
            config.approval.link_base_url.clone(),
        ),
        (
            "approval.delivery_channel",
            "DEALDESK_APPROVAL_DELIVERY_CHANNEL",
            config.approval.delivery_channel.as_str().to_string(),
        ),
        ("notifier.kind", "DEALDESK_NOTIFIER_KIND", format!("{:?}", config.notifier.kind)),
        ("notifier.relay_url", "DEALDESK_NOTIFIER_RELAY_URL", relay_url.to_string()),
        ("notifier.relay_api_key", "DEALDESK_NOTIFIER_RELAY_API_KEY", relay_api_key.to_string()),
        (
            "notifier.timeout_secs",
            "DEALDESK_NOTIFIER_TIMEOUT_SECS",
            config.notifier.timeout_secs.to_string(),
        ),
        ("logging.level", "DEALDESK_LOGGING_LEVEL", config.logging.level.clone()),
        ("logging.format", "DEALDESK_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["dealdesk.toml", "config/dealdesk.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
