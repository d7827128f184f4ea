use thiserror::Error;

use crate::approvals::store::StoreError;
use crate::domain::approval::ApprovalStatus;
use crate::pricing::PricingError;
use crate::secrets::SecretError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidToken,
    TokenExpired,
    CodeNotIssued,
    CodeExpired { attempts_remaining: u32 },
    CodeMismatch { attempts_remaining: u32 },
    NotRequester,
    NotApprover,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::CodeNotIssued => "code_not_issued",
            Self::CodeExpired { .. } => "code_expired",
            Self::CodeMismatch { .. } => "code_mismatch",
            Self::NotRequester => "not_requester",
            Self::NotApprover => "not_approver",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CodeExpired { attempts_remaining } | Self::CodeMismatch { attempts_remaining } => {
                write!(f, "{} ({attempts_remaining} attempts remaining)", self.as_str())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    ActiveRequestExists { deal_id: String },
    AlreadyResolved { status: ApprovalStatus },
    /// A concurrent writer moved the request first.
    StaleState,
    IllegalTransition { from: ApprovalStatus, to: ApprovalStatus },
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActiveRequestExists { deal_id } => {
                write!(f, "deal `{deal_id}` already has an active discount request")
            }
            Self::AlreadyResolved { status } => write!(f, "request is already {status}"),
            Self::StaleState => f.write_str("request changed concurrently"),
            Self::IllegalTransition { from, to } => {
                write!(f, "request cannot move from {from} to {to}")
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("request `{request_id}` is locked after too many failed attempts")]
    RateLimited { request_id: String },
    #[error("internal failure: {0}")]
    Internal(String),
}

impl ApprovalError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "auth",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal",
        }
    }

    /// Rate limits, lost races and internal failures may succeed on a later
    /// attempt. Validation and terminal conflicts never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Internal(_) | Self::Conflict(ConflictKind::StaleState)
        )
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let kind = self.kind();
        let retryable = self.is_retryable();
        let message = self.to_string();
        let class = match self {
            Self::Validation(_) => InterfaceClass::BadRequest,
            Self::NotFound(_) => InterfaceClass::NotFound,
            Self::Auth(_) => InterfaceClass::Unauthorized,
            Self::Conflict(_) => InterfaceClass::Conflict,
            Self::RateLimited { .. } => InterfaceClass::Locked,
            Self::Internal(_) => InterfaceClass::ServiceUnavailable,
        };
        InterfaceError { class, kind, retryable, message, correlation_id }
    }
}

impl From<StoreError> for ApprovalError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ActiveRequestExists { deal_id } => {
                Self::Conflict(ConflictKind::ActiveRequestExists { deal_id })
            }
            StoreError::PreconditionFailed => Self::Conflict(ConflictKind::StaleState),
            StoreError::IllegalTransition { from, to } => {
                Self::Conflict(ConflictKind::IllegalTransition { from, to })
            }
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Unavailable(message) | StoreError::Corrupt(message) => {
                Self::Internal(message)
            }
        }
    }
}

impl From<PricingError> for ApprovalError {
    fn from(value: PricingError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<SecretError> for ApprovalError {
    fn from(value: SecretError) -> Self {
        Self::Internal(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceClass {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    Locked,
    ServiceUnavailable,
}

impl InterfaceClass {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Locked => 423,
            Self::ServiceUnavailable => 503,
        }
    }
}

/// Transport-facing error. `message` is the detailed cause for logs;
/// `user_message` is what callers see.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct InterfaceError {
    pub class: InterfaceClass,
    pub kind: &'static str,
    pub retryable: bool,
    pub message: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn user_message(&self) -> String {
        match self.class {
            InterfaceClass::BadRequest
            | InterfaceClass::Conflict
            | InterfaceClass::NotFound
            | InterfaceClass::Unauthorized => self.message.clone(),
            InterfaceClass::Locked => {
                "The request is locked after too many failed attempts. Submit a new request."
                    .to_owned()
            }
            InterfaceClass::ServiceUnavailable => {
                "The service is temporarily unavailable. Please retry shortly.".to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::approvals::store::StoreError;
    use crate::domain::approval::ApprovalStatus;
    use crate::errors::{ApprovalError, AuthFailure, ConflictKind, InterfaceClass};

    #[test]
    fn validation_maps_to_bad_request_and_is_not_retryable() {
        let interface = ApprovalError::Validation("reason must not be empty".to_owned())
            .into_interface("req-1");

        assert_eq!(interface.class, InterfaceClass::BadRequest);
        assert_eq!(interface.class.http_status(), 400);
        assert_eq!(interface.correlation_id, "req-1");
        assert!(!interface.retryable);
        assert!(interface.user_message().contains("reason must not be empty"));
    }

    #[test]
    fn auth_maps_to_unauthorized() {
        let interface =
            ApprovalError::Auth(AuthFailure::CodeMismatch { attempts_remaining: 3 })
                .into_interface("req-2");
        assert_eq!(interface.class.http_status(), 401);
        assert_eq!(interface.kind, "auth");
        assert!(interface.message.contains("3 attempts remaining"));
    }

    #[test]
    fn rate_limit_is_locked_and_retryable() {
        let error = ApprovalError::RateLimited { request_id: "DAR-1".to_owned() };
        assert!(error.is_retryable());
        let interface = error.into_interface("req-3");
        assert_eq!(interface.class.http_status(), 423);
        assert!(interface.user_message().contains("locked"));
    }

    #[test]
    fn terminal_conflict_is_not_retryable() {
        let error =
            ApprovalError::Conflict(ConflictKind::AlreadyResolved { status: ApprovalStatus::Approved });
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "conflict: request is already APPROVED");
        assert_eq!(error.into_interface("req-4").class.http_status(), 409);
    }

    #[test]
    fn store_failures_become_retryable_internal_errors() {
        let error = ApprovalError::from(StoreError::Unavailable("database is locked".to_owned()));
        assert!(error.is_retryable());
        let interface = error.into_interface("req-5");
        assert_eq!(interface.class, InterfaceClass::ServiceUnavailable);
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn illegal_transition_is_a_final_conflict() {
        let error = ApprovalError::from(StoreError::IllegalTransition {
            from: ApprovalStatus::Locked,
            to: ApprovalStatus::CodeSent,
        });
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "conflict: request cannot move from LOCKED to CODE_SENT");
        assert_eq!(error.into_interface("req-6").class.http_status(), 409);
    }

    #[test]
    fn stale_precondition_becomes_retryable_conflict() {
        let error = ApprovalError::from(StoreError::PreconditionFailed);
        assert_eq!(error, ApprovalError::Conflict(ConflictKind::StaleState));
        assert!(error.is_retryable());
    }
}
