use serde::Serialize;

use crate::commands::{to_data, with_service, CommandResult};

#[derive(Debug, Serialize)]
struct AuditLine {
    action: &'static str,
    actor_id: Option<String>,
    timestamp: String,
    metadata: std::collections::BTreeMap<String, String>,
}

/// Prints the audit trail of a discount request or deal, oldest first.
pub fn run(entity_id: &str) -> CommandResult {
    let entity_id = entity_id.trim().to_string();
    let entries = match with_service("audit", |service| {
        let entity_id = entity_id.clone();
        async move { service.audit_trail(&entity_id).await }
    }) {
        Ok(entries) => entries,
        Err(failure) => return failure,
    };

    let lines: Vec<AuditLine> = entries
        .into_iter()
        .map(|entry| AuditLine {
            action: entry.action.as_str(),
            actor_id: entry.actor_id,
            timestamp: entry.timestamp.to_rfc3339(),
            metadata: entry.metadata,
        })
        .collect();
    let message = format!("{} audit entr(ies) for `{entity_id}`", lines.len());
    match to_data("audit", &lines) {
        Ok(data) => CommandResult::success_with_data("audit", message, Some(data)),
        Err(failure) => failure,
    }
}
