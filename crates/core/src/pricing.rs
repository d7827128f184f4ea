use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditAction, AuditEntry};
use crate::domain::approval::{ApprovalRequest, ApprovalStatus};
use crate::domain::deal::DealPricing;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("discount percent {0} is outside 0..=100")]
    PercentOutOfRange(Decimal),
    #[error("deal base total {0} is negative")]
    NegativeBaseTotal(Decimal),
    #[error("deal base total {0} is too large to discount")]
    Overflow(Decimal),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountComputation {
    pub base_total: Decimal,
    pub percent: Decimal,
    pub discount_amount: Decimal,
    pub final_total: Decimal,
}

pub fn validate_percent(percent: Decimal) -> Result<(), PricingError> {
    if percent < Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
        return Err(PricingError::PercentOutOfRange(percent));
    }
    Ok(())
}

/// A base total is accepted only if a 100% discount on it is computable,
/// which bounds every later approval on the deal.
pub fn validate_base_total(base_total: Decimal) -> Result<(), PricingError> {
    if base_total < Decimal::ZERO {
        return Err(PricingError::NegativeBaseTotal(base_total));
    }
    base_total
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|_| ())
        .ok_or(PricingError::Overflow(base_total))
}

/// `discount = floor(base * percent / 100)`, `final = base - discount`.
pub fn compute_discount(
    base_total: Decimal,
    percent: Decimal,
) -> Result<DiscountComputation, PricingError> {
    validate_percent(percent)?;
    validate_base_total(base_total)?;

    let discount_amount = base_total
        .checked_mul(percent)
        .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED))
        .ok_or(PricingError::Overflow(base_total))?
        .floor();
    let final_total = base_total
        .checked_sub(discount_amount)
        .ok_or(PricingError::Overflow(base_total))?
        .max(Decimal::ZERO);

    Ok(DiscountComputation { base_total, percent, discount_amount, final_total })
}

/// Everything an approval commit writes, computed up front so a store can
/// persist it as one unit: the resolved request, the repriced deal and the
/// audit entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalPlan {
    pub request: ApprovalRequest,
    pub pricing: DealPricing,
    pub audit: AuditEntry,
}

pub fn plan_approval(
    request: &ApprovalRequest,
    current: &DealPricing,
    approver_id: &str,
    now: DateTime<Utc>,
) -> Result<ApprovalPlan, PricingError> {
    let computation = compute_discount(current.base_total, request.requested_percent)?;

    let mut resolved = request.clone();
    resolved.status = ApprovalStatus::Approved;
    resolved.code_hash = None;
    resolved.resolved_at = Some(now);
    resolved.resolved_by_approver_id = Some(approver_id.to_string());
    resolved.updated_at = now;

    let pricing = DealPricing {
        deal_id: current.deal_id.clone(),
        base_total: computation.base_total,
        applied_discount_percent: Some(computation.percent),
        discount_amount: computation.discount_amount,
        final_total: computation.final_total,
        updated_at: now,
    };

    let audit = AuditEntry::new(
        AuditAction::RequestApproved,
        request.id.0.clone(),
        Some(approver_id.to_string()),
        now,
    )
    .with_metadata("deal_id", request.deal_id.0.clone())
    .with_metadata("percent", computation.percent.to_string())
    .with_metadata("base_total", computation.base_total.to_string())
    .with_metadata("discount_amount", computation.discount_amount.to_string())
    .with_metadata("final_total", computation.final_total.to_string())
    .with_metadata("previous_final_total", current.final_total.to_string());

    Ok(ApprovalPlan { request: resolved, pricing, audit })
}
