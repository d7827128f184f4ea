use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DealId(pub String);

impl std::fmt::Display for DealId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pricing snapshot of a lead/deal. Owned by the surrounding CRM; the
/// discount fields are only written by an approval commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealPricing {
    pub deal_id: DealId,
    pub base_total: Decimal,
    pub applied_discount_percent: Option<Decimal>,
    pub discount_amount: Decimal,
    pub final_total: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl DealPricing {
    pub fn undiscounted(deal_id: DealId, base_total: Decimal, updated_at: DateTime<Utc>) -> Self {
        Self {
            deal_id,
            base_total,
            applied_discount_percent: None,
            discount_amount: Decimal::ZERO,
            final_total: base_total,
            updated_at,
        }
    }
}
