use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use dealdesk_core::domain::deal::{DealId, DealPricing};

use super::{decode_decimal, decode_timestamp, encode_timestamp, RepositoryError};

pub(crate) async fn find(
    conn: &mut SqliteConnection,
    deal_id: &DealId,
) -> Result<Option<DealPricing>, RepositoryError> {
    let row = sqlx::query(
        "SELECT id, base_total, applied_discount_percent, discount_amount, final_total, updated_at
         FROM deal WHERE id = ?",
    )
    .bind(&deal_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(pricing_from_row).transpose()
}

/// Writes every pricing column. Only the approval commit and the base-total
/// upsert call this.
pub(crate) async fn write_pricing(
    conn: &mut SqliteConnection,
    pricing: &DealPricing,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO deal (id, base_total, applied_discount_percent, discount_amount, final_total, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             base_total = excluded.base_total,
             applied_discount_percent = excluded.applied_discount_percent,
             discount_amount = excluded.discount_amount,
             final_total = excluded.final_total,
             updated_at = excluded.updated_at",
    )
    .bind(&pricing.deal_id.0)
    .bind(pricing.base_total.to_string())
    .bind(pricing.applied_discount_percent.map(|percent| percent.to_string()))
    .bind(pricing.discount_amount.to_string())
    .bind(pricing.final_total.to_string())
    .bind(encode_timestamp(&pricing.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn pricing_from_row(row: &SqliteRow) -> Result<DealPricing, RepositoryError> {
    let base_total: String = row.try_get("base_total")?;
    let applied: Option<String> = row.try_get("applied_discount_percent")?;
    let discount_amount: String = row.try_get("discount_amount")?;
    let final_total: String = row.try_get("final_total")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DealPricing {
        deal_id: DealId(row.try_get("id")?),
        base_total: decode_decimal("base_total", &base_total)?,
        applied_discount_percent: applied
            .as_deref()
            .map(|raw| decode_decimal("applied_discount_percent", raw))
            .transpose()?,
        discount_amount: decode_decimal("discount_amount", &discount_amount)?,
        final_total: decode_decimal("final_total", &final_total)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}
