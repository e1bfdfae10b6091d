//! Settlement Engine.
//!
//! Resolution marks a market's winning option; settlement pays out every
//! position against that resolution and closes the pool out. `resolve` and
//! `settle` share internal helpers that take no transaction of their own, so
//! the composed path (`resolve_and_settle_market`, and its partial variant)
//! can run both steps inside a single transaction: the market's status never
//! advances to its resolved/settled state until the payout itself commits.
//! Both steps are idempotent (`settlement_tx_id`) and honor the lock order:
//! Market -> Pool -> BalanceSnapshots (sorted by user_id) -> Positions.

use anyhow::{anyhow, Result};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::CacheHooks;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct SettlementReceipt {
    pub market_id: i64,
    pub settlement_tx_id: Uuid,
    pub winning_option_id: i64,
    pub positions_settled: u64,
    pub total_paid_out: Decimal,
    pub pool_cash_consumed: Decimal,
    pub collateral_consumed: Decimal,
    pub already_settled: bool,
}

struct LockedMarketForResolution {
    status: String,
}

async fn lock_market_for_resolution(tx: &mut Transaction<'_, Postgres>, market_id: i64) -> Result<LockedMarketForResolution> {
    let market = sqlx::query("SELECT id, status FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| anyhow!(crate::error::market_not_found(format!("market {market_id}"))))?;
    Ok(LockedMarketForResolution { status: market.try_get("status")? })
}

/// Record the winning option on a locked market row. When `skip_status_update`
/// is set (the composed resolve-then-settle path), only `winning_option_id`
/// and `resolved_at` move; `status` is left alone so the market never becomes
/// visible as resolved before the payout that follows in the same
/// transaction actually commits.
async fn resolve_market_internal(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
    winning_option_id: i64,
    skip_status_update: bool,
) -> Result<()> {
    let locked = lock_market_for_resolution(tx, market_id).await?;
    if locked.status == "settled" {
        return Err(anyhow!(crate::error::market_not_settleable(format!(
            "market {market_id} already settled"
        ))));
    }

    let option_exists = sqlx::query("SELECT id FROM market_options WHERE id = $1 AND market_id = $2")
        .bind(winning_option_id)
        .bind(market_id)
        .fetch_optional(&mut **tx)
        .await?;
    if option_exists.is_none() {
        return Err(anyhow!(crate::error::option_not_found(format!(
            "option {winning_option_id} does not belong to market {market_id}"
        ))));
    }

    if skip_status_update {
        sqlx::query("UPDATE markets SET winning_option_id = $1, resolved_at = NOW() WHERE id = $2")
            .bind(winning_option_id)
            .bind(market_id)
            .execute(&mut **tx)
            .await?;
    } else {
        sqlx::query("UPDATE markets SET status = 'resolved', winning_option_id = $1, resolved_at = NOW() WHERE id = $2")
            .bind(winning_option_id)
            .bind(market_id)
            .execute(&mut **tx)
            .await?;
    }
    info!(market_id, winning_option_id, skip_status_update, "market resolution recorded");
    Ok(())
}

/// Mark the market resolved with its winning option. Pure status transition;
/// does not move money. `settle_market` is the step that pays out.
#[instrument(skip(pool))]
pub async fn resolve_market(pool: &PgPool, market_id: i64, winning_option_id: i64) -> Result<()> {
    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;
    resolve_market_internal(&mut tx, market_id, winning_option_id, false).await?;
    tx.commit().await?;
    Ok(())
}

struct LockedPoolForSettlement {
    pool_id: i64,
    pool_cash: Decimal,
    collateral_amount: Decimal,
    status: String,
}

/// Locks the pool backing `market_id`. Exclusive-event pools are keyed by
/// `event_id` and shared across every constituent market, so `event_id` is
/// tried first, matching how `execution::lock_pool` resolves the same pool.
async fn lock_pool_for_settlement(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
    event_id: Option<i64>,
) -> Result<LockedPoolForSettlement> {
    let row = if let Some(event_id) = event_id {
        sqlx::query("SELECT id, pool_cash, collateral_amount, status FROM amm_pools WHERE event_id = $1 FOR UPDATE")
            .bind(event_id)
            .fetch_optional(&mut **tx)
            .await?
    } else {
        None
    };
    let row = match row {
        Some(r) => Some(r),
        None => sqlx::query("SELECT id, pool_cash, collateral_amount, status FROM amm_pools WHERE market_id = $1 FOR UPDATE")
            .bind(market_id)
            .fetch_optional(&mut **tx)
            .await?,
    };
    let row = row.ok_or_else(|| anyhow!(crate::error::pool_not_found(format!("no pool for market {market_id}"))))?;
    Ok(LockedPoolForSettlement {
        pool_id: row.try_get("id")?,
        pool_cash: row.try_get("pool_cash")?,
        collateral_amount: row.try_get("collateral_amount")?,
        status: row.try_get("status")?,
    })
}

struct PositionRow {
    user_id: i64,
    shares: Decimal,
}

/// Pays out every position holding `winning_option_id` at 1.0 collateral per
/// share, draining `pool_cash` before `collateral_amount` (the funding
/// waterfall). `update_status_to_resolved` flips this market's own status to
/// `settled` once the payout has been written; `close_pool` additionally
/// marks the pool `settled` and should only be set for a standalone market
/// whose pool is not shared with any sibling market still trading.
///
/// Idempotent on `settlement_tx_id`: a second call with a `settlement_tx_id`
/// already recorded against this market returns the prior receipt instead
/// of paying out twice.
async fn settle_market_internal(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
    settlement_tx_id: Uuid,
    token: &str,
    update_status_to_resolved: bool,
    close_pool: bool,
) -> Result<SettlementReceipt> {
    let market = sqlx::query("SELECT id, event_id, status, winning_option_id FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| anyhow!(crate::error::market_not_found(format!("market {market_id}"))))?;

    let prior = sqlx::query("SELECT positions_settled, total_paid_out, pool_cash_consumed, collateral_consumed, winning_option_id FROM market_settlements WHERE settlement_tx_id = $1")
        .bind(settlement_tx_id)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = prior {
        let winning_option_id: i64 = row.try_get("winning_option_id")?;
        return Ok(SettlementReceipt {
            market_id,
            settlement_tx_id,
            winning_option_id,
            positions_settled: row.try_get::<i64, _>("positions_settled")? as u64,
            total_paid_out: row.try_get("total_paid_out")?,
            pool_cash_consumed: row.try_get("pool_cash_consumed")?,
            collateral_consumed: row.try_get("collateral_consumed")?,
            already_settled: true,
        });
    }

    let winning_option_id: i64 = market
        .try_get::<Option<i64>, _>("winning_option_id")?
        .ok_or_else(|| anyhow!(crate::error::market_not_resolved(format!("market {market_id} has no winning_option_id"))))?;

    // In the standalone call, the caller has not already run resolve_market_internal
    // in this same transaction, so the status transition must be checked explicitly.
    // In the composed call, winning_option_id being set is proof resolution already
    // happened earlier in this same transaction; status is deliberately not yet
    // `resolved` there, so it must not be checked.
    if !update_status_to_resolved {
        let status: String = market.try_get("status")?;
        if status != "resolved" {
            return Err(anyhow!(crate::error::market_not_resolved(format!(
                "market {market_id} is {status}, expected resolved"
            ))));
        }
    }

    let event_id: Option<i64> = market.try_get("event_id")?;
    let locked_pool = lock_pool_for_settlement(tx, market_id, event_id).await?;
    if locked_pool.status == "settled" {
        return Err(anyhow!(crate::error::market_not_settleable(format!(
            "pool for market {market_id} already settled"
        ))));
    }

    // Peek the position holders (no lock yet) purely to know which users'
    // balance_snapshot rows need locking before positions, matching the
    // declared lock order.
    let peeked = sqlx::query(
        "SELECT DISTINCT user_id FROM positions WHERE market_id = $1 AND option_id = $2 AND shares > 0 ORDER BY user_id",
    )
    .bind(market_id)
    .bind(winning_option_id)
    .fetch_all(&mut **tx)
    .await?;

    for row in &peeked {
        let user_id: i64 = row.try_get("user_id")?;
        sqlx::query("SELECT user_id FROM balance_snapshot WHERE user_id = $1 AND token = $2 FOR UPDATE")
            .bind(user_id)
            .bind(token)
            .fetch_optional(&mut **tx)
            .await?;
    }

    let positions = sqlx::query(
        "SELECT user_id, shares FROM positions WHERE market_id = $1 AND option_id = $2 AND shares > 0 ORDER BY user_id FOR UPDATE",
    )
    .bind(market_id)
    .bind(winning_option_id)
    .fetch_all(&mut **tx)
    .await?;
    let positions = positions
        .iter()
        .map(|r| -> Result<PositionRow> {
            Ok(PositionRow { user_id: r.try_get("user_id")?, shares: r.try_get("shares")? })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut total_owed = Decimal::ZERO;
    for p in &positions {
        total_owed += p.shares;
    }

    let available_funds = locked_pool.pool_cash + locked_pool.collateral_amount;
    if total_owed > available_funds {
        warn!(
            market_id,
            total_owed = %total_owed,
            available_funds = %available_funds,
            "settlement underfunded, refusing to pay out partial shares silently"
        );
        return Err(anyhow!(crate::error::insufficient_funds(format!(
            "market {market_id} owes {total_owed} but pool has {available_funds}"
        ))));
    }

    let mut pool_cash_remaining = locked_pool.pool_cash;
    let mut collateral_remaining = locked_pool.collateral_amount;
    let mut pool_cash_consumed = Decimal::ZERO;
    let mut collateral_consumed = Decimal::ZERO;
    let mut total_paid_out = Decimal::ZERO;

    for p in &positions {
        if p.shares <= Decimal::ZERO {
            continue;
        }
        let payout = p.shares; // 1.0 collateral per winning share.
        let from_pool_cash = payout.min(pool_cash_remaining);
        let from_collateral = payout - from_pool_cash;
        pool_cash_remaining -= from_pool_cash;
        collateral_remaining -= from_collateral;
        pool_cash_consumed += from_pool_cash;
        collateral_consumed += from_collateral;
        total_paid_out += payout;

        let existing_balance = sqlx::query("SELECT available_amount FROM balance_snapshot WHERE user_id = $1 AND token = $2")
            .bind(p.user_id)
            .bind(token)
            .fetch_optional(&mut **tx)
            .await?;
        if existing_balance.is_some() {
            sqlx::query("UPDATE balance_snapshot SET available_amount = available_amount + $1 WHERE user_id = $2 AND token = $3")
                .bind(payout)
                .bind(p.user_id)
                .bind(token)
                .execute(&mut **tx)
                .await?;
        } else {
            sqlx::query("INSERT INTO balance_snapshot (user_id, token, available_amount, locked_amount) VALUES ($1, $2, $3, 0)")
                .bind(p.user_id)
                .bind(token)
                .bind(payout)
                .execute(&mut **tx)
                .await?;
        }

        sqlx::query("UPDATE positions SET shares = 0, cost_basis = 0 WHERE user_id = $1 AND market_id = $2 AND option_id = $3")
            .bind(p.user_id)
            .bind(market_id)
            .bind(winning_option_id)
            .execute(&mut **tx)
            .await?;
    }

    // Losing positions across every other option in this market are
    // worthless; zero them so portfolio views don't show stale shares.
    sqlx::query("UPDATE positions SET shares = 0, cost_basis = 0 WHERE market_id = $1 AND option_id != $2 AND shares > 0")
        .bind(market_id)
        .bind(winning_option_id)
        .execute(&mut **tx)
        .await?;

    if close_pool {
        sqlx::query("UPDATE amm_pools SET pool_cash = $1, collateral_amount = $2, status = 'settled' WHERE id = $3")
            .bind(pool_cash_remaining)
            .bind(collateral_remaining)
            .bind(locked_pool.pool_id)
            .execute(&mut **tx)
            .await?;
    } else {
        sqlx::query("UPDATE amm_pools SET pool_cash = $1, collateral_amount = $2 WHERE id = $3")
            .bind(pool_cash_remaining)
            .bind(collateral_remaining)
            .bind(locked_pool.pool_id)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query("UPDATE markets SET status = 'settled', settled_at = NOW() WHERE id = $1")
        .bind(market_id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "INSERT INTO market_settlements (market_id, settlement_tx_id, winning_option_id, positions_settled, total_paid_out, pool_cash_consumed, collateral_consumed)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(market_id)
    .bind(settlement_tx_id)
    .bind(winning_option_id)
    .bind(positions.len() as i64)
    .bind(total_paid_out)
    .bind(pool_cash_consumed)
    .bind(collateral_consumed)
    .execute(&mut **tx)
    .await?;

    info!(
        market_id,
        positions_settled = positions.len(),
        total_paid_out = %total_paid_out,
        "market settled"
    );

    Ok(SettlementReceipt {
        market_id,
        settlement_tx_id,
        winning_option_id,
        positions_settled: positions.len() as u64,
        total_paid_out,
        pool_cash_consumed,
        collateral_consumed,
        already_settled: false,
    })
}

#[instrument(skip(pool, cache))]
pub async fn settle_market(
    pool: &PgPool,
    cache: &CacheHooks,
    market_id: i64,
    settlement_tx_id: Uuid,
    token: &str,
) -> Result<SettlementReceipt> {
    let result: Result<SettlementReceipt> = crate::with_serializable_tx!(pool, tx, {
        settle_market_internal(&mut tx, market_id, settlement_tx_id, token, false, true).await
    });

    let receipt = result?;
    cache.invalidate_on_market_change(market_id, None).await;
    Ok(receipt)
}

/// A single atomic composition of resolve and settle: resolve records the
/// winning option but leaves `status` untouched, settle runs the payout, and
/// only once the payout has been written does the market's status flip. A
/// settlement failure (e.g. `INSUFFICIENT_FUNDS`) rolls back the resolution
/// too, so no market is ever visible as resolved without a completed payout.
pub async fn resolve_and_settle_market(
    pool: &PgPool,
    cache: &CacheHooks,
    market_id: i64,
    winning_option_id: i64,
    token: &str,
) -> Result<SettlementReceipt> {
    let settlement_tx_id = Uuid::new_v4();
    resolve_and_settle_market_with_tx_id(pool, cache, market_id, winning_option_id, settlement_tx_id, token).await
}

/// Same as [`resolve_and_settle_market`] but the caller supplies the
/// idempotency token, for retries from an at-least-once settlement queue.
pub async fn resolve_and_settle_market_with_tx_id(
    pool: &PgPool,
    cache: &CacheHooks,
    market_id: i64,
    winning_option_id: i64,
    settlement_tx_id: Uuid,
    token: &str,
) -> Result<SettlementReceipt> {
    let result: Result<SettlementReceipt> = crate::with_serializable_tx!(pool, tx, {
        resolve_market_internal(&mut tx, market_id, winning_option_id, true).await?;
        settle_market_internal(&mut tx, market_id, settlement_tx_id, token, true, true).await
    });

    let receipt = result?;
    cache.invalidate_on_market_change(market_id, None).await;
    Ok(receipt)
}

/// Settles one constituent market of an exclusive or independent multi-market
/// event without resolving the parent event. Only a NO-side option may be
/// the winning option here: a YES resolution determines the whole event and
/// must go through [`resolve_and_settle_market`] instead, which closes every
/// sibling market's pool together.
///
/// The shared pool is left open (siblings may still trade); subsequent
/// quotes/trades against the pool automatically exclude this market's option
/// once its status is no longer `active`, which is how probabilities over
/// the remaining outcomes are renormalized. Once every constituent market of
/// the event has reached a terminal state (`settled` or `canceled`), the
/// event itself is flipped to `resolved`.
pub async fn resolve_and_settle_market_partial(
    pool: &PgPool,
    cache: &CacheHooks,
    market_id: i64,
    winning_no_option_id: i64,
    settlement_tx_id: Uuid,
    token: &str,
) -> Result<SettlementReceipt> {
    let result: Result<SettlementReceipt> = crate::with_serializable_tx!(pool, tx, {
        let market = sqlx::query("SELECT event_id FROM markets WHERE id = $1 FOR UPDATE")
            .bind(market_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!(crate::error::market_not_found(format!("market {market_id}"))))?;
        let event_id: Option<i64> = market.try_get("event_id")?;
        let event_id = event_id.ok_or_else(|| {
            anyhow!(crate::error::partial_settlement_invalid(format!(
                "market {market_id} does not belong to a multi-market event"
            )))
        })?;

        let option_side: Option<String> = sqlx::query("SELECT side FROM market_options WHERE id = $1 AND market_id = $2")
            .bind(winning_no_option_id)
            .bind(market_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.try_get("side"))
            .transpose()?;
        match option_side.as_deref() {
            Some("no") => {}
            Some(_) => {
                return Err(anyhow!(crate::error::partial_settlement_invalid(
                    "only a NO-side option may be partially settled; a YES resolution closes the whole event"
                )))
            }
            None => {
                return Err(anyhow!(crate::error::option_not_found(format!(
                    "option {winning_no_option_id} does not belong to market {market_id}"
                ))))
            }
        }

        resolve_market_internal(&mut tx, market_id, winning_no_option_id, true).await?;
        let receipt = settle_market_internal(&mut tx, market_id, settlement_tx_id, token, true, false).await?;

        let remaining: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM markets WHERE event_id = $1 AND status NOT IN ('settled', 'canceled')",
        )
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;
        if remaining == 0 {
            sqlx::query("UPDATE events SET status = 'resolved' WHERE id = $1")
                .bind(event_id)
                .execute(&mut *tx)
                .await?;
            info!(event_id, "every constituent market terminal, event resolved");
        }

        Ok(receipt)
    });

    let receipt = result?;
    cache.invalidate_on_market_change(market_id, None).await;
    Ok(receipt)
}

/// Degenerate-pool-state check: if the pool's prices can no longer be
/// renormalized to sum to 1 within tolerance, refuse further trading rather
/// than widening `b`, which would retroactively change every existing
/// position's cost basis.
pub fn check_not_degenerate(prices: &[f64]) -> Result<(), EngineError> {
    let sum: f64 = prices.iter().sum();
    if !sum.is_finite() || (sum - 1.0).abs() > 1e-6 {
        return Err(crate::error::degenerate_pool_state(format!(
            "pool probabilities sum to {sum}, refusing further trading"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_check_rejects_bad_sum() {
        assert!(check_not_degenerate(&[0.5, 0.4]).is_err());
        assert!(check_not_degenerate(&[0.6, 0.4]).is_ok());
    }

    #[test]
    fn degenerate_check_rejects_nan() {
        assert!(check_not_degenerate(&[f64::NAN, 0.5]).is_err());
    }
}
