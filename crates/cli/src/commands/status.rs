use dealdesk_core::ApprovalId;

use crate::commands::{to_data, with_service, CommandResult};

pub fn run(request_id: &str) -> CommandResult {
    let request_id = ApprovalId(request_id.trim().to_string());
    let view = match with_service("status", |service| async move {
        service.request_status(&request_id).await
    }) {
        Ok(view) => view,
        Err(failure) => return failure,
    };

    let message = format!(
        "{} is {} ({} code attempt(s) remaining)",
        view.id, view.status, view.attempts_remaining
    );
    match to_data("status", &view) {
        Ok(data) => CommandResult::success_with_data("status", message, Some(data)),
        Err(failure) => failure,
    }
}
