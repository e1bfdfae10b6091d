//! Pool setup: liquidity-parameter derivation and exclusive-event pool
//! construction.
//! The pure math (`compute_b_from_funding`, `select_exclusive_event_option`)
//! has no database dependency; `ensure_pool_initialized` does the idempotent
//! creation against Postgres.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::error::EngineError;
use crate::money::STORAGE_SCALE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRule {
    Standalone,
    Exclusive,
    Independent,
}

/// `b = funding / ln(outcome_count)`, quantized to storage precision. Caps
/// the operator's maximum LMSR loss at exactly `funding`.
pub fn compute_b_from_funding(funding: Decimal, outcome_count: u32) -> Result<Decimal, EngineError> {
    if funding <= Decimal::ZERO {
        return Err(crate::error::invalid_param("initial funding must be > 0"));
    }
    if outcome_count < 2 {
        return Err(crate::error::invalid_param("pool must have at least 2 outcomes"));
    }
    let funding_f = funding.to_f64().ok_or_else(|| crate::error::invalid_param("funding out of range"))?;
    let ln_n = (outcome_count as f64).ln();
    let b = funding_f / ln_n;
    if !b.is_finite() || b <= 0.0 {
        return Err(crate::error::quote_math_error("derived b is not finite/positive"));
    }
    Ok(Decimal::from_f64(b)
        .unwrap_or_default()
        .round_dp(STORAGE_SCALE))
}

pub struct MarketOptionCandidate {
    pub market_id: i64,
    pub option_id: i64,
    pub option_index: i32,
    pub is_yes: bool,
}

/// Select the canonical option for one child market of an exclusive event:
/// prefer the YES option; fall back to the lowest `option_index` with a
/// warning if no YES exists.
pub fn select_exclusive_event_option(candidates: &[MarketOptionCandidate]) -> Option<&MarketOptionCandidate> {
    if let Some(yes) = candidates.iter().find(|c| c.is_yes) {
        return Some(yes);
    }
    let fallback = candidates.iter().min_by_key(|c| c.option_index);
    if let Some(f) = fallback {
        warn!(
            market_id = f.market_id,
            option_id = f.option_id,
            option_index = f.option_index,
            "no YES option found for exclusive-event market, falling back to lowest option_index"
        );
    }
    fallback
}

pub fn normalize_fee_bps(fee_bps: i32) -> Result<i32, EngineError> {
    if !(0..=10000).contains(&fee_bps) {
        return Err(crate::error::invalid_param("fee_bps must be in [0, 10000]"));
    }
    Ok(fee_bps)
}

pub fn normalize_collateral_token(token: &str) -> Result<String, EngineError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(crate::error::invalid_param("collateral_token must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Idempotently create a market-scoped pool and its per-option state rows.
/// The unique constraint on `(market_id)` is the source of truth: on
/// conflict, the existing row is re-fetched rather than overwritten.
pub async fn ensure_pool_initialized(
    pool: &PgPool,
    market_id: i64,
    option_ids: &[i64],
    option_indexes: &[i32],
    initial_funding: Option<Decimal>,
    fee_bps: i32,
    collateral_token: &str,
) -> anyhow::Result<i64> {
    let fee_bps = normalize_fee_bps(fee_bps).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let collateral_token =
        normalize_collateral_token(collateral_token).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let b = match initial_funding {
        Some(f) => compute_b_from_funding(f, option_ids.len() as u32).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        None => Decimal::ONE,
    };
    let collateral_amount = initial_funding.unwrap_or(Decimal::ZERO);

    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM amm_pools WHERE market_id = $1")
            .bind(market_id)
            .fetch_optional(&mut *tx)
            .await?;

    let pool_id = if let Some((id,)) = existing {
        tx.commit().await?;
        return Ok(id);
    } else {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO amm_pools (market_id, b, fee_bps, collateral_token, pool_cash, collateral_amount, status)
             VALUES ($1, $2, $3, $4, 0, $5, 'active')
             ON CONFLICT (market_id) DO UPDATE SET market_id = EXCLUDED.market_id
             RETURNING id",
        )
        .bind(market_id)
        .bind(b)
        .bind(fee_bps)
        .bind(&collateral_token)
        .bind(collateral_amount)
        .fetch_one(&mut *tx)
        .await?;
        row.0
    };

    for (option_id, option_index) in option_ids.iter().zip(option_indexes.iter()) {
        sqlx::query(
            "INSERT INTO amm_pool_option_state (pool_id, option_id, option_index, q)
             VALUES ($1, $2, $3, 0)
             ON CONFLICT (pool_id, option_id) DO NOTHING",
        )
        .bind(pool_id)
        .bind(option_id)
        .bind(option_index)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(pool_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b_caps_loss_at_funding() {
        let b = compute_b_from_funding(Decimal::new(100000, 2), 2).unwrap(); // 1000.00, N=2
        let b_f = b.to_f64().unwrap();
        let max_loss = b_f * (2.0f64).ln();
        assert!((max_loss - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_positive_funding() {
        assert!(compute_b_from_funding(Decimal::ZERO, 2).is_err());
    }

    #[test]
    fn selects_yes_option_first() {
        let candidates = vec![
            MarketOptionCandidate { market_id: 1, option_id: 10, option_index: 1, is_yes: false },
            MarketOptionCandidate { market_id: 1, option_id: 11, option_index: 0, is_yes: true },
        ];
        let chosen = select_exclusive_event_option(&candidates).unwrap();
        assert_eq!(chosen.option_id, 11);
    }

    #[test]
    fn falls_back_to_lowest_index_without_yes() {
        let candidates = vec![
            MarketOptionCandidate { market_id: 1, option_id: 10, option_index: 2, is_yes: false },
            MarketOptionCandidate { market_id: 1, option_id: 11, option_index: 1, is_yes: false },
        ];
        let chosen = select_exclusive_event_option(&candidates).unwrap();
        assert_eq!(chosen.option_id, 11);
    }

    #[test]
    fn rejects_bad_fee_bps() {
        assert!(normalize_fee_bps(10001).is_err());
        assert!(normalize_fee_bps(-1).is_err());
        assert!(normalize_fee_bps(10000).is_ok());
    }
}
