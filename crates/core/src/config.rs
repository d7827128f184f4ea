use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::notify::DeliveryChannel;

pub const MIN_SIGNING_KEY_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub approval: ApprovalConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ApprovalConfig {
    pub approver_id: String,
    pub approver_email: Option<String>,
    pub token_signing_key: SecretString,
    pub token_ttl_hours: u32,
    pub code_ttl_minutes: u32,
    pub max_code_attempts: u32,
    pub link_base_url: String,
    pub delivery_channel: DeliveryChannel,
}

#[derive(Clone, Debug)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    pub relay_url: Option<String>,
    pub relay_api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    Log,
    Relay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub approver_id: Option<String>,
    pub token_signing_key: Option<String>,
    pub notifier_kind: Option<NotifierKind>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://dealdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            approval: ApprovalConfig {
                approver_id: String::new(),
                approver_email: None,
                token_signing_key: String::new().into(),
                token_ttl_hours: 24,
                code_ttl_minutes: 10,
                max_code_attempts: 5,
                link_base_url: "http://127.0.0.1:8080".to_string(),
                delivery_channel: DeliveryChannel::Email,
            },
            notifier: NotifierConfig {
                kind: NotifierKind::Log,
                relay_url: None,
                relay_api_key: None,
                timeout_secs: 10,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for NotifierKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "relay" => Ok(Self::Relay),
            other => Err(ConfigError::Validation(format!(
                "unsupported notifier kind `{other}` (expected log|relay)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dealdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(approval) = patch.approval {
            if let Some(approver_id) = approval.approver_id {
                self.approval.approver_id = approver_id;
            }
            if let Some(approver_email) = approval.approver_email {
                self.approval.approver_email = Some(approver_email);
            }
            if let Some(signing_key) = approval.token_signing_key {
                self.approval.token_signing_key = secret_value(signing_key);
            }
            if let Some(token_ttl_hours) = approval.token_ttl_hours {
                self.approval.token_ttl_hours = token_ttl_hours;
            }
            if let Some(code_ttl_minutes) = approval.code_ttl_minutes {
                self.approval.code_ttl_minutes = code_ttl_minutes;
            }
            if let Some(max_code_attempts) = approval.max_code_attempts {
                self.approval.max_code_attempts = max_code_attempts;
            }
            if let Some(link_base_url) = approval.link_base_url {
                self.approval.link_base_url = link_base_url;
            }
            if let Some(delivery_channel) = approval.delivery_channel {
                self.approval.delivery_channel = delivery_channel;
            }
        }

        if let Some(notifier) = patch.notifier {
            if let Some(kind) = notifier.kind {
                self.notifier.kind = kind;
            }
            if let Some(relay_url) = notifier.relay_url {
                self.notifier.relay_url = Some(relay_url);
            }
            if let Some(relay_api_key) = notifier.relay_api_key {
                self.notifier.relay_api_key = Some(secret_value(relay_api_key));
            }
            if let Some(timeout_secs) = notifier.timeout_secs {
                self.notifier.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DEALDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DEALDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DEALDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DEALDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DEALDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DEALDESK_SERVER_PORT") {
            self.server.port = parse_u16("DEALDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DEALDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DEALDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALDESK_APPROVAL_APPROVER_ID") {
            self.approval.approver_id = value;
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_APPROVER_EMAIL") {
            self.approval.approver_email = Some(value);
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_TOKEN_SIGNING_KEY") {
            self.approval.token_signing_key = secret_value(value);
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_TOKEN_TTL_HOURS") {
            self.approval.token_ttl_hours = parse_u32("DEALDESK_APPROVAL_TOKEN_TTL_HOURS", &value)?;
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_CODE_TTL_MINUTES") {
            self.approval.code_ttl_minutes =
                parse_u32("DEALDESK_APPROVAL_CODE_TTL_MINUTES", &value)?;
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_MAX_CODE_ATTEMPTS") {
            self.approval.max_code_attempts =
                parse_u32("DEALDESK_APPROVAL_MAX_CODE_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_LINK_BASE_URL") {
            self.approval.link_base_url = value;
        }
        if let Some(value) = read_env("DEALDESK_APPROVAL_DELIVERY_CHANNEL") {
            self.approval.delivery_channel = DeliveryChannel::parse(&value).ok_or_else(|| {
                ConfigError::InvalidEnvOverride {
                    key: "DEALDESK_APPROVAL_DELIVERY_CHANNEL".to_string(),
                    value: value.clone(),
                }
            })?;
        }

        if let Some(value) = read_env("DEALDESK_NOTIFIER_KIND") {
            self.notifier.kind = value.parse()?;
        }
        if let Some(value) = read_env("DEALDESK_NOTIFIER_RELAY_URL") {
            self.notifier.relay_url = Some(value);
        }
        if let Some(value) = read_env("DEALDESK_NOTIFIER_RELAY_API_KEY") {
            self.notifier.relay_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEALDESK_NOTIFIER_TIMEOUT_SECS") {
            self.notifier.timeout_secs = parse_u64("DEALDESK_NOTIFIER_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("DEALDESK_LOGGING_LEVEL").or_else(|| read_env("DEALDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DEALDESK_LOGGING_FORMAT").or_else(|| read_env("DEALDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(approver_id) = overrides.approver_id {
            self.approval.approver_id = approver_id;
        }
        if let Some(signing_key) = overrides.token_signing_key {
            self.approval.token_signing_key = secret_value(signing_key);
        }
        if let Some(kind) = overrides.notifier_kind {
            self.notifier.kind = kind;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_approval(&self.approval)?;
        validate_notifier(&self.notifier)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dealdesk.toml"), PathBuf::from("config/dealdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_approval(approval: &ApprovalConfig) -> Result<(), ConfigError> {
    if approval.approver_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "approval.approver_id is required (set DEALDESK_APPROVAL_APPROVER_ID)".to_string(),
        ));
    }

    let signing_key = approval.token_signing_key.expose_secret();
    if signing_key.trim().len() < MIN_SIGNING_KEY_LEN {
        return Err(ConfigError::Validation(format!(
            "approval.token_signing_key must be at least {MIN_SIGNING_KEY_LEN} characters (set DEALDESK_APPROVAL_TOKEN_SIGNING_KEY)"
        )));
    }

    if approval.token_ttl_hours == 0 || approval.token_ttl_hours > 24 * 30 {
        return Err(ConfigError::Validation(
            "approval.token_ttl_hours must be in range 1..=720".to_string(),
        ));
    }
    if approval.code_ttl_minutes == 0 || approval.code_ttl_minutes > 60 {
        return Err(ConfigError::Validation(
            "approval.code_ttl_minutes must be in range 1..=60".to_string(),
        ));
    }
    if approval.max_code_attempts == 0 || approval.max_code_attempts > 10 {
        return Err(ConfigError::Validation(
            "approval.max_code_attempts must be in range 1..=10".to_string(),
        ));
    }

    let base_url = approval.link_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "approval.link_base_url must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}

fn validate_notifier(notifier: &NotifierConfig) -> Result<(), ConfigError> {
    if notifier.timeout_secs == 0 || notifier.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "notifier.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if notifier.kind == NotifierKind::Relay {
        let url = notifier.relay_url.as_deref().map(str::trim).unwrap_or_default();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "notifier.relay_url must be an http(s) URL when notifier.kind = relay".to_string(),
            ));
        }
        let missing_key = notifier
            .relay_api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_key {
            return Err(ConfigError::Validation(
                "notifier.relay_api_key is required when notifier.kind = relay".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    approval: Option<ApprovalPatch>,
    notifier: Option<NotifierPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApprovalPatch {
    approver_id: Option<String>,
    approver_email: Option<String>,
    token_signing_key: Option<String>,
    token_ttl_hours: Option<u32>,
    code_ttl_minutes: Option<u32>,
    max_code_attempts: Option<u32>,
    link_base_url: Option<String>,
    delivery_channel: Option<DeliveryChannel>,
}

#[derive(Debug, Default, Deserialize)]
struct NotifierPatch {
    kind: Option<NotifierKind>,
    relay_url: Option<String>,
    relay_api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
