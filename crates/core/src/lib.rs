pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod pricing;
pub mod secrets;

pub use approvals::clock::{Clock, ManualClock, SystemClock};
pub use approvals::memory::InMemoryApprovalStore;
pub use approvals::notify::{ApprovalNotifier, DeliveryChannel, Notification, NotifyError};
pub use approvals::store::{ApprovalStore, Precondition, StoreError};
pub use approvals::{
    ApprovalPolicy, DiscountApprovalService, NewDiscountRequest, ResolveCommand,
};
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus, ApprovalView, Decision};
pub use domain::deal::{DealId, DealPricing};
pub use errors::{ApprovalError, AuthFailure, ConflictKind, InterfaceClass, InterfaceError};
pub use secrets::SecretIssuer;
