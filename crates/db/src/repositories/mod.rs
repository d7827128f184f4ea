use thiserror::Error;

use dealdesk_core::approvals::store::StoreError;

pub mod approval;
pub mod audit;
pub mod deal;

pub use approval::SqlApprovalStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => StoreError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Corrupt(message),
        }
    }
}

pub(crate) fn encode_timestamp(value: &chrono::DateTime<chrono::Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub(crate) fn decode_timestamp(
    column: &str,
    raw: &str,
) -> Result<chrono::DateTime<chrono::Utc>, RepositoryError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&chrono::Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: invalid timestamp `{raw}`: {error}")))
}

pub(crate) fn decode_decimal(
    column: &str,
    raw: &str,
) -> Result<rust_decimal::Decimal, RepositoryError> {
    raw.parse::<rust_decimal::Decimal>()
        .map_err(|error| RepositoryError::Decode(format!("{column}: invalid decimal `{raw}`: {error}")))
}
