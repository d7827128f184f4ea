use std::str::FromStr;

use dealdesk_core::DealId;
use rust_decimal::Decimal;
use serde_json::json;

use crate::commands::{with_service, CommandResult};

/// Sets a deal's undiscounted base total. Refused while a discount request
/// for the deal is still active.
pub fn set_base(deal_id: &str, amount: &str, actor_id: &str) -> CommandResult {
    let base_total = match Decimal::from_str(amount.trim()) {
        Ok(value) => value,
        Err(error) => {
            return CommandResult::failure(
                "deal.set-base",
                "validation",
                format!("invalid amount `{amount}`: {error}"),
                crate::commands::APPROVAL_ERROR_EXIT,
            );
        }
    };
    let deal_id = DealId(deal_id.trim().to_string());
    let actor_id = actor_id.trim().to_string();

    let pricing = match with_service("deal.set-base", |service| {
        let deal_id = deal_id.clone();
        async move { service.set_base_total(&deal_id, base_total, &actor_id).await }
    }) {
        Ok(pricing) => pricing,
        Err(failure) => return failure,
    };

    CommandResult::success_with_data(
        "deal.set-base",
        format!("deal `{deal_id}` base total set to {}", pricing.base_total),
        Some(json!({
            "deal_id": pricing.deal_id.0,
            "base_total": pricing.base_total.to_string(),
            "final_total": pricing.final_total.to_string(),
            "updated_at": pricing.updated_at.to_rfc3339(),
        })),
    )
}
