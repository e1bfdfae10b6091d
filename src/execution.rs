//! Execution Engine.
//!
//! `execute_buy` and `execute_sell` run inside one SERIALIZABLE transaction
//! each, honoring a fixed lock order so that any interleaving with
//! settlement is deadlock-free:
//!
//! 1. Market (+ event) row
//! 2. Pool option-state rows, ordered by `option_index, option_id`
//! 3. The target `MarketOption` row
//! 4. The user's `BalanceSnapshot` row (create-if-missing)
//! 5. The user's `Position` row (create-if-missing)

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use crate::cache::CacheHooks;
use crate::db_adapter::{build_pool_state, OptionStateRow};
use crate::error::EngineError;
use crate::money::{self, DUST_SELL_TOLERANCE};
use crate::quote::{self, QuoteRequest, SizeSpec};
use crate::series;
use crate::state::{NoToYesEntry, OptionSelector, PoolState};
use crate::with_serializable_tx;

#[derive(Debug, Clone)]
pub struct TradeReceipt {
    pub market_id: i64,
    pub option_id: i64,
    pub option_index: i32,
    pub side: quote::Side,
    pub amount: Decimal,
    pub shares: Decimal,
    pub fee_amount: Decimal,
    pub avg_price_bps: i32,
    pub pre_prob_bps: Vec<i32>,
    pub post_prob_bps: Vec<i32>,
    pub balance_available: Decimal,
    pub position_shares: Decimal,
    pub position_cost_basis: Decimal,
    pub order_intent_id: i64,
    pub dust_cleanup: bool,
}

pub struct BuyRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub selector: OptionSelector,
    pub amount_in: Decimal,
    pub token: Option<String>,
    pub wallet_id: Option<i64>,
    pub client_nonce: Option<String>,
    pub min_shares_out: Option<Decimal>,
    pub max_slippage_bps: Option<i32>,
}

pub struct SellRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub selector: OptionSelector,
    pub size: SellSize,
    pub token: Option<String>,
    pub wallet_id: Option<i64>,
    pub client_nonce: Option<String>,
    pub min_amount_out: Option<Decimal>,
}

pub enum SellSize {
    Shares(Decimal),
    DesiredAmountOut(Decimal),
    SellAll,
}

struct LockedMarket {
    market_id: i64,
    event_id: Option<i64>,
    status: String,
    trading_deadline: Option<chrono::DateTime<Utc>>,
    event_status: Option<String>,
    event_trading_deadline: Option<chrono::DateTime<Utc>>,
}

async fn lock_market(tx: &mut Transaction<'_, Postgres>, market_id: i64) -> Result<LockedMarket> {
    let row = sqlx::query(
        "SELECT m.id, m.event_id, m.status, m.trading_deadline, e.status as event_status, e.trading_deadline as event_trading_deadline
         FROM markets m LEFT JOIN events e ON e.id = m.event_id
         WHERE m.id = $1 FOR UPDATE OF m",
    )
    .bind(market_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| anyhow!(crate::error::market_not_found(format!("market {market_id}"))))?;

    let event_id: Option<i64> = row.try_get("event_id")?;
    if event_id.is_some() {
        sqlx::query("SELECT id FROM events WHERE id = $1 FOR UPDATE")
            .bind(event_id)
            .fetch_one(&mut **tx)
            .await?;
    }

    Ok(LockedMarket {
        market_id,
        event_id,
        status: row.try_get("status")?,
        trading_deadline: row.try_get("trading_deadline")?,
        event_status: row.try_get("event_status")?,
        event_trading_deadline: row.try_get("event_trading_deadline")?,
    })
}

fn validate_tradable(market: &LockedMarket) -> Result<(), EngineError> {
    if market.status != "active" {
        return Err(crate::error::market_not_active(format!(
            "market {} is {}",
            market.market_id, market.status
        )));
    }
    if let Some(event_status) = &market.event_status {
        if event_status != "active" {
            return Err(crate::error::event_not_active(format!(
                "event for market {} is {}",
                market.market_id, event_status
            )));
        }
    }
    let deadline = market.trading_deadline.or(market.event_trading_deadline);
    if let Some(deadline) = deadline {
        if Utc::now() >= deadline {
            return Err(crate::error::market_closed(format!(
                "market {} trading deadline has passed",
                market.market_id
            )));
        }
    }
    Ok(())
}

struct LockedPool {
    pool_id: i64,
    b: Decimal,
    fee_bps: i32,
    pool_cash: Decimal,
    collateral_amount: Decimal,
    is_exclusive: bool,
    option_rows: Vec<OptionStateRow>,
}

/// Locks all pool option-state rows for this market's pool, ordered by
/// `option_index, option_id` as required by the declared lock order. For
/// exclusive events, the pool is discovered via the event.
async fn lock_pool(tx: &mut Transaction<'_, Postgres>, market: &LockedMarket) -> Result<LockedPool> {
    let pool_row = if let Some(event_id) = market.event_id {
        sqlx::query(
            "SELECT id, b, fee_bps, pool_cash, collateral_amount, true as is_exclusive
             FROM amm_pools WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await?
    } else {
        None
    };
    let pool_row = match pool_row {
        Some(r) => Some(r),
        None => sqlx::query(
            "SELECT id, b, fee_bps, pool_cash, collateral_amount, false as is_exclusive
             FROM amm_pools WHERE market_id = $1",
        )
        .bind(market.market_id)
        .fetch_optional(&mut **tx)
        .await?,
    };
    let pool_row = pool_row.ok_or_else(|| anyhow!(crate::error::pool_not_found(format!(
        "no pool for market {}",
        market.market_id
    ))))?;

    let pool_id: i64 = pool_row.try_get("id")?;
    let b: Decimal = pool_row.try_get("b")?;
    if b <= Decimal::ZERO {
        return Err(anyhow!(crate::error::pool_invalid("pool liquidity parameter b must be > 0")));
    }
    let is_exclusive: bool = pool_row.try_get("is_exclusive")?;

    // A shared event pool's option rows belong to several sibling markets.
    // Once one sibling has been (partially) settled its option is excluded
    // here, which is what renormalizes LMSR prices over the outcomes that
    // are still active.
    let rows = if is_exclusive {
        sqlx::query(
            "SELECT s.option_id, s.option_index, s.q
             FROM amm_pool_option_state s
             JOIN market_options mo ON mo.id = s.option_id
             JOIN markets m2 ON m2.id = mo.market_id
             WHERE s.pool_id = $1 AND m2.status = 'active'
             ORDER BY s.option_index, s.option_id FOR UPDATE OF s",
        )
        .bind(pool_id)
        .fetch_all(&mut **tx)
        .await?
    } else {
        sqlx::query(
            "SELECT option_id, option_index, q FROM amm_pool_option_state
             WHERE pool_id = $1 ORDER BY option_index, option_id FOR UPDATE",
        )
        .bind(pool_id)
        .fetch_all(&mut **tx)
        .await?
    };
    if rows.is_empty() {
        return Err(anyhow!(crate::error::pool_invalid("pool has no option states")));
    }
    let option_rows = rows.iter().map(OptionStateRow::from_row).collect::<Result<Vec<_>>>()?;

    Ok(LockedPool {
        pool_id,
        b,
        fee_bps: pool_row.try_get("fee_bps")?,
        pool_cash: pool_row.try_get("pool_cash")?,
        collateral_amount: pool_row.try_get("collateral_amount")?,
        is_exclusive,
        option_rows,
    })
}

/// Build the NO->YES mapping for an exclusive pool: every other market's
/// YES option is addressable as a synthetic NO identity pointing back at
/// this market's own YES option's pool index.
async fn load_no_to_yes_mapping(
    tx: &mut Transaction<'_, Postgres>,
    event_id: i64,
    option_rows: &[OptionStateRow],
) -> Result<HashMap<i64, NoToYesEntry>> {
    let rows = sqlx::query(
        "SELECT mo.id as no_option_id, mo.market_id
         FROM market_options mo
         JOIN markets m ON m.id = mo.market_id
         WHERE m.event_id = $1 AND mo.side = 'no'",
    )
    .bind(event_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut mapping = HashMap::new();
    for row in rows {
        let no_option_id: i64 = row.try_get("no_option_id")?;
        let market_id: i64 = row.try_get("market_id")?;
        // Every OTHER market's yes option absorbs this market's No flow.
        for other in option_rows {
            if let Some(yes_market_id) = yes_option_market_id(tx, other.option_id).await? {
                if yes_market_id != market_id {
                    mapping.insert(
                        no_option_id,
                        NoToYesEntry { yes_option_id: other.option_id, pool_idx: other_index(option_rows, other.option_id) },
                    );
                    break;
                }
            }
        }
    }
    Ok(mapping)
}

fn other_index(rows: &[OptionStateRow], option_id: i64) -> usize {
    rows.iter().position(|r| r.option_id == option_id).unwrap_or(0)
}

async fn yes_option_market_id(tx: &mut Transaction<'_, Postgres>, option_id: i64) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT market_id FROM market_options WHERE id = $1 AND side = 'yes'")
        .bind(option_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| r.try_get("market_id")).transpose()?)
}

async fn assemble_pool_state(
    tx: &mut Transaction<'_, Postgres>,
    market: &LockedMarket,
    locked_pool: &LockedPool,
) -> Result<PoolState> {
    let mapping = if locked_pool.is_exclusive {
        load_no_to_yes_mapping(tx, market.event_id.unwrap(), &locked_pool.option_rows).await?
    } else {
        HashMap::new()
    };
    Ok(build_pool_state(
        market.market_id,
        locked_pool.pool_id,
        locked_pool.b,
        locked_pool.fee_bps,
        &locked_pool.option_rows,
        locked_pool.is_exclusive,
        mapping,
    )?)
}

struct LockedBalance {
    available_amount: Decimal,
}

/// Locks the user's balance row for `token`, creating it under a savepoint
/// if it does not exist yet (handles the unique-violation race the same way
/// the position lock below does).
async fn lock_or_create_balance(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    token: &str,
) -> Result<LockedBalance> {
    let existing = sqlx::query("SELECT available_amount FROM balance_snapshot WHERE user_id = $1 AND token = $2 FOR UPDATE")
        .bind(user_id)
        .bind(token)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = existing {
        return Ok(LockedBalance { available_amount: row.try_get("available_amount")? });
    }

    let mut sp = tx.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO balance_snapshot (user_id, token, available_amount, locked_amount)
         VALUES ($1, $2, 0, 0)
         ON CONFLICT (user_id, token) DO NOTHING",
    )
    .bind(user_id)
    .bind(token)
    .execute(&mut *sp)
    .await;
    match inserted {
        Ok(_) => sp.commit().await?,
        Err(e) => {
            sp.rollback().await.ok();
            return Err(e.into());
        }
    }

    let row = sqlx::query("SELECT available_amount FROM balance_snapshot WHERE user_id = $1 AND token = $2 FOR UPDATE")
        .bind(user_id)
        .bind(token)
        .fetch_one(&mut **tx)
        .await?;
    Ok(LockedBalance { available_amount: row.try_get("available_amount")? })
}

struct LockedPosition {
    shares: Decimal,
    cost_basis: Decimal,
}

async fn lock_or_create_position(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    market_id: i64,
    option_id: i64,
) -> Result<LockedPosition> {
    let existing = sqlx::query(
        "SELECT shares, cost_basis FROM positions WHERE user_id = $1 AND market_id = $2 AND option_id = $3 FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(option_id)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = existing {
        return Ok(LockedPosition { shares: row.try_get("shares")?, cost_basis: row.try_get("cost_basis")? });
    }

    let mut sp = tx.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO positions (user_id, market_id, option_id, shares, cost_basis)
         VALUES ($1, $2, $3, 0, 0)
         ON CONFLICT (user_id, market_id, option_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(option_id)
    .execute(&mut *sp)
    .await;
    match inserted {
        Ok(_) => sp.commit().await?,
        Err(e) => {
            sp.rollback().await.ok();
            return Err(e.into());
        }
    }

    let row = sqlx::query(
        "SELECT shares, cost_basis FROM positions WHERE user_id = $1 AND market_id = $2 AND option_id = $3 FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(option_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(LockedPosition { shares: row.try_get("shares")?, cost_basis: row.try_get("cost_basis")? })
}

async fn resolve_wallet(tx: &mut Transaction<'_, Postgres>, user_id: i64, wallet_id: Option<i64>) -> Result<i64> {
    if let Some(wallet_id) = wallet_id {
        let row = sqlx::query("SELECT id FROM wallets WHERE id = $1 AND user_id = $2")
            .bind(wallet_id)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
        return row
            .map(|r| r.try_get::<i64, _>("id"))
            .transpose()?
            .ok_or_else(|| anyhow!(crate::error::wallet_not_found(format!("wallet {wallet_id} not owned by user {user_id}"))));
    }
    let primary = sqlx::query("SELECT id FROM wallets WHERE user_id = $1 AND is_primary = true LIMIT 1")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = primary {
        return Ok(row.try_get("id")?);
    }
    let any = sqlx::query("SELECT id FROM wallets WHERE user_id = $1 LIMIT 1")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = any {
        return Ok(row.try_get("id")?);
    }
    let created: (i64,) = sqlx::query_as(
        "INSERT INTO wallets (user_id, is_primary) VALUES ($1, true) RETURNING id",
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(created.0)
}

async fn refresh_option_stats(
    tx: &mut Transaction<'_, Postgres>,
    option_ids: &[i64],
    post_probs: &[f64],
    is_exclusive: bool,
) -> Result<()> {
    for (option_id, &p) in option_ids.iter().zip(post_probs.iter()) {
        let yes_bps = money::bps_from_probability(p);
        sqlx::query(
            "UPDATE market_option_stats SET yes_prob_bps = $1, updated_at = NOW() WHERE option_id = $2",
        )
        .bind(yes_bps)
        .bind(option_id)
        .execute(&mut **tx)
        .await?;
        if is_exclusive {
            sqlx::query(
                "UPDATE market_option_stats SET no_prob_bps = $1, updated_at = NOW() WHERE option_id = $2",
            )
            .bind(10_000 - yes_bps)
            .bind(option_id)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn emit_price_series(
    tx: &mut Transaction<'_, Postgres>,
    option_ids: &[i64],
    post_probs: &[f64],
    bucket_seconds: i64,
    interval_tag: &str,
) {
    let bucket = series::bucket_start(Utc::now(), bucket_seconds);
    for (option_id, &p) in option_ids.iter().zip(post_probs.iter()) {
        series::record_price_point(tx, *option_id, interval_tag, bucket, money::bps_from_probability(p)).await;
    }
}

async fn write_audit_rows(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    market_id: i64,
    option_id: i64,
    side: quote::Side,
    amount: Decimal,
    shares: Decimal,
    wallet_id: i64,
    client_nonce: Option<&str>,
) -> Result<i64> {
    let side_str = match side {
        quote::Side::Buy => "buy",
        quote::Side::Sell => "sell",
    };
    let order_intent_id: i64 = sqlx::query_as::<_, (i64,)>(
        "INSERT INTO order_intents (user_id, market_id, option_id, side, amount, shares, wallet_id, client_nonce)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(option_id)
    .bind(side_str)
    .bind(amount)
    .bind(shares)
    .bind(wallet_id)
    .bind(client_nonce)
    .fetch_one(&mut **tx)
    .await?
    .0;

    let tx_hash = format!("synthetic:{order_intent_id}");
    sqlx::query(
        "INSERT INTO trades (order_intent_id, market_id, option_id, side, amount, shares, status, tx_hash)
         VALUES ($1, $2, $3, $4, $5, $6, 'confirmed', $7)",
    )
    .bind(order_intent_id)
    .bind(market_id)
    .bind(option_id)
    .bind(side_str)
    .bind(amount)
    .bind(shares)
    .bind(&tx_hash)
    .execute(&mut **tx)
    .await?;

    Ok(order_intent_id)
}

#[instrument(skip(pool, cache), fields(market_id = req.market_id, user_id = req.user_id))]
pub async fn execute_buy(
    pool: &PgPool,
    cache: &CacheHooks,
    config: &crate::config::EngineConfig,
    req: BuyRequest,
) -> Result<TradeReceipt> {
    let token = req.token.clone().unwrap_or_else(|| config.default_token.clone());
    let result: Result<TradeReceipt> = with_serializable_tx!(pool, tx, {
        let market = lock_market(&mut tx, req.market_id).await?;
        validate_tradable(&market)?;
        let locked_pool = lock_pool(&mut tx, &market).await?;
        let state = assemble_pool_state(&mut tx, &market, &locked_pool).await?;

        let (target_idx, is_no_side) = state.resolve_with_side(req.selector)?;
        let option_id = state.option_ids[target_idx];
        let option_index = state.option_indexes[target_idx];

        sqlx::query("SELECT id FROM market_options WHERE id = $1 AND status = 'active' FOR UPDATE")
            .bind(option_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!(crate::error::option_not_active(format!("option {option_id} not active"))))?;

        let balance = lock_or_create_balance(&mut tx, req.user_id, &token).await?;
        let position = lock_or_create_position(&mut tx, req.user_id, req.market_id, option_id).await?;

        let quote_req = QuoteRequest {
            selector: OptionSelector::Index(option_index),
            side: quote::Side::Buy,
            size: SizeSpec::Amount(req.amount_in),
            money_quant: config.money_quant,
            is_no_side,
        };
        let q = quote::quote_from_state(&state, &quote_req)?;

        if balance.available_amount < q.amount {
            return Err(anyhow!(crate::error::insufficient_balance(format!(
                "balance {} insufficient for amount_in {}",
                balance.available_amount, q.amount
            ))));
        }

        if let Some(min_shares_out) = req.min_shares_out {
            if q.shares < min_shares_out {
                return Err(anyhow!(crate::error::slippage_protection(format!(
                    "shares_out {} below min_shares_out {}",
                    q.shares, min_shares_out
                ))));
            }
        }
        if let Some(max_slippage_bps) = req.max_slippage_bps {
            let expected_bps = if is_no_side {
                10_000 - q.pre_prob_bps[target_idx]
            } else {
                q.pre_prob_bps[target_idx]
            };
            let limit = (expected_bps as i64) * (10_000 + max_slippage_bps as i64) / 10_000;
            if (q.avg_price_bps as i64) > limit {
                return Err(anyhow!(crate::error::slippage_protection(format!(
                    "avg_price_bps {} exceeds slippage limit {}",
                    q.avg_price_bps, limit
                ))));
            }
        }

        sqlx::query(
            "UPDATE balance_snapshot SET available_amount = available_amount - $1 WHERE user_id = $2 AND token = $3 AND available_amount >= $1",
        )
        .bind(q.amount)
        .bind(req.user_id)
        .bind(&token)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE positions SET shares = shares + $1, cost_basis = cost_basis + $2
             WHERE user_id = $3 AND market_id = $4 AND option_id = $5",
        )
        .bind(q.shares)
        .bind(q.amount)
        .bind(req.user_id)
        .bind(req.market_id)
        .bind(option_id)
        .execute(&mut *tx)
        .await?;

        if let Some(deltas) = &q.no_buy_deltas {
            for (j, delta) in deltas.iter().enumerate() {
                if *delta == 0.0 {
                    continue;
                }
                sqlx::query("UPDATE amm_pool_option_state SET q = q + $1 WHERE pool_id = $2 AND option_id = $3")
                    .bind(money::quantize_shares_down(*delta))
                    .bind(locked_pool.pool_id)
                    .bind(state.option_ids[j])
                    .execute(&mut *tx)
                    .await?;
            }
        } else {
            sqlx::query("UPDATE amm_pool_option_state SET q = q + $1 WHERE pool_id = $2 AND option_id = $3")
                .bind(q.shares)
                .bind(locked_pool.pool_id)
                .bind(option_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE amm_pools SET pool_cash = pool_cash + $1 WHERE id = $2")
            .bind(q.amount)
            .bind(locked_pool.pool_id)
            .execute(&mut *tx)
            .await?;

        let post_probs = crate::lmsr::prices(&apply_deltas(&state, &q), locked_pool.b.to_f64().unwrap_or(1.0))
            .map_err(EngineError::from)?;
        refresh_option_stats(&mut tx, &state.option_ids, &post_probs, locked_pool.is_exclusive).await?;
        emit_price_series(&mut tx, &state.option_ids, &post_probs, config.price_bucket_seconds, &config.series_interval_tag).await;

        let wallet_id = resolve_wallet(&mut tx, req.user_id, req.wallet_id).await?;
        let order_intent_id = write_audit_rows(
            &mut tx,
            req.user_id,
            req.market_id,
            option_id,
            quote::Side::Buy,
            q.amount,
            q.shares,
            wallet_id,
            req.client_nonce.as_deref(),
        )
        .await?;

        info!(option_id, shares = %q.shares, amount = %q.amount, "buy executed");

        Ok(TradeReceipt {
            market_id: req.market_id,
            option_id,
            option_index,
            side: quote::Side::Buy,
            amount: q.amount,
            shares: q.shares,
            fee_amount: q.fee_amount,
            avg_price_bps: q.avg_price_bps,
            pre_prob_bps: q.pre_prob_bps,
            post_prob_bps: q.post_prob_bps,
            balance_available: balance.available_amount - q.amount,
            position_shares: position.shares + q.shares,
            position_cost_basis: position.cost_basis + q.amount,
            order_intent_id,
            dust_cleanup: false,
        })
    });

    let receipt = result?;
    cache.invalidate_on_trade(req.market_id, req.user_id, None).await;
    Ok(receipt)
}

#[cfg(test)]
mod execute_buy_tests {
    use super::*;

    fn active_market() -> LockedMarket {
        LockedMarket {
            market_id: 1,
            event_id: None,
            status: "active".to_string(),
            trading_deadline: None,
            event_status: None,
            event_trading_deadline: None,
        }
    }

    #[test]
    fn validate_tradable_accepts_active_market_with_no_deadline() {
        assert!(validate_tradable(&active_market()).is_ok());
    }

    #[test]
    fn validate_tradable_rejects_closed_market() {
        let mut m = active_market();
        m.status = "closed".to_string();
        let err = validate_tradable(&m).unwrap_err();
        assert_eq!(err.code, "MARKET_NOT_ACTIVE");
    }

    #[test]
    fn validate_tradable_rejects_inactive_event() {
        let mut m = active_market();
        m.event_id = Some(5);
        m.event_status = Some("closed".to_string());
        let err = validate_tradable(&m).unwrap_err();
        assert_eq!(err.code, "EVENT_NOT_ACTIVE");
    }

    #[test]
    fn validate_tradable_rejects_past_deadline() {
        let mut m = active_market();
        m.trading_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        let err = validate_tradable(&m).unwrap_err();
        assert_eq!(err.code, "MARKET_CLOSED");
    }

    #[test]
    fn validate_tradable_falls_back_to_event_deadline() {
        let mut m = active_market();
        m.event_id = Some(5);
        m.event_status = Some("active".to_string());
        m.event_trading_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        let err = validate_tradable(&m).unwrap_err();
        assert_eq!(err.code, "MARKET_CLOSED");
    }

    #[test]
    fn other_index_finds_matching_row() {
        let rows = vec![
            OptionStateRow { option_id: 10, option_index: 0, q: Decimal::ZERO },
            OptionStateRow { option_id: 20, option_index: 1, q: Decimal::ZERO },
        ];
        assert_eq!(other_index(&rows, 20), 1);
    }

    #[test]
    fn other_index_defaults_to_zero_when_missing() {
        let rows = vec![OptionStateRow { option_id: 10, option_index: 0, q: Decimal::ZERO }];
        assert_eq!(other_index(&rows, 999), 0);
    }

    fn sample_state() -> PoolState {
        PoolState {
            market_id: 1,
            pool_id: 10,
            b: 100.0,
            fee_bps: 200,
            option_ids: vec![1, 2],
            option_indexes: vec![0, 1],
            q: vec![5.0, 3.0],
            is_exclusive: false,
            no_to_yes_mapping: HashMap::new(),
        }
    }

    #[test]
    fn apply_deltas_buy_increases_target_index() {
        let state = sample_state();
        let q = quote::Quote {
            market_id: 1,
            pool_id: 10,
            option_id: 1,
            option_index: 0,
            side: quote::Side::Buy,
            amount: Decimal::ZERO,
            shares: Decimal::from(2),
            fee_amount: Decimal::ZERO,
            avg_price_bps: 0,
            pre_prob_bps: vec![0, 0],
            post_prob_bps: vec![0, 0],
            option_ids: state.option_ids.clone(),
            option_indexes: state.option_indexes.clone(),
            is_no_side: false,
            no_buy_deltas: None,
            no_sell_deltas: None,
        };
        let post = apply_deltas(&state, &q);
        assert_eq!(post, vec![7.0, 3.0]);
    }

    #[test]
    fn apply_deltas_sell_decreases_target_index() {
        let state = sample_state();
        let q = quote::Quote {
            market_id: 1,
            pool_id: 10,
            option_id: 2,
            option_index: 1,
            side: quote::Side::Sell,
            amount: Decimal::ZERO,
            shares: Decimal::from(1),
            fee_amount: Decimal::ZERO,
            avg_price_bps: 0,
            pre_prob_bps: vec![0, 0],
            post_prob_bps: vec![0, 0],
            option_ids: state.option_ids.clone(),
            option_indexes: state.option_indexes.clone(),
            is_no_side: false,
            no_buy_deltas: None,
            no_sell_deltas: None,
        };
        let post = apply_deltas(&state, &q);
        assert_eq!(post, vec![5.0, 2.0]);
    }

    #[test]
    fn apply_deltas_uses_no_side_deltas_when_present() {
        let state = sample_state();
        let q = quote::Quote {
            market_id: 1,
            pool_id: 10,
            option_id: 1,
            option_index: 0,
            side: quote::Side::Buy,
            amount: Decimal::ZERO,
            shares: Decimal::from(2),
            fee_amount: Decimal::ZERO,
            avg_price_bps: 0,
            pre_prob_bps: vec![0, 0],
            post_prob_bps: vec![0, 0],
            option_ids: state.option_ids.clone(),
            option_indexes: state.option_indexes.clone(),
            is_no_side: true,
            no_buy_deltas: Some(vec![0.0, 4.0]),
            no_sell_deltas: None,
        };
        let post = apply_deltas(&state, &q);
        assert_eq!(post, vec![5.0, 7.0]);
    }
}

fn apply_deltas(state: &PoolState, q: &quote::Quote) -> Vec<f64> {
    let mut post = state.q.clone();
    if let Some(deltas) = &q.no_buy_deltas {
        for (j, d) in deltas.iter().enumerate() {
            post[j] += d;
        }
    } else if let Some(deltas) = &q.no_sell_deltas {
        for (j, d) in deltas.iter().enumerate() {
            post[j] += d;
        }
    } else {
        let shares_f = q.shares.to_f64().unwrap_or(0.0);
        match q.side {
            quote::Side::Buy => post[q.option_index] += shares_f,
            quote::Side::Sell => post[q.option_index] -= shares_f,
        }
    }
    post
}

#[instrument(skip(pool, cache), fields(market_id = req.market_id, user_id = req.user_id))]
pub async fn execute_sell(
    pool: &PgPool,
    cache: &CacheHooks,
    config: &crate::config::EngineConfig,
    req: SellRequest,
) -> Result<TradeReceipt> {
    let token = req.token.clone().unwrap_or_else(|| config.default_token.clone());
    let dust_threshold = config.dust_threshold;
    let result: Result<TradeReceipt> = with_serializable_tx!(pool, tx, {
        let market = lock_market(&mut tx, req.market_id).await?;
        validate_tradable(&market)?;
        let locked_pool = lock_pool(&mut tx, &market).await?;
        let state = assemble_pool_state(&mut tx, &market, &locked_pool).await?;

        let (target_idx, is_no_side) = state.resolve_with_side(req.selector)?;
        let option_id = state.option_ids[target_idx];
        let option_index = state.option_indexes[target_idx];

        sqlx::query("SELECT id FROM market_options WHERE id = $1 AND status = 'active' FOR UPDATE")
            .bind(option_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!(crate::error::option_not_active(format!("option {option_id} not active"))))?;

        let balance = lock_or_create_balance(&mut tx, req.user_id, &token).await?;
        let position = lock_or_create_position(&mut tx, req.user_id, req.market_id, option_id).await?;
        if position.shares <= Decimal::ZERO {
            return Err(anyhow!(crate::error::no_position(format!(
                "user {} has no position in option {option_id}",
                req.user_id
            ))));
        }

        let (sell_all, size) = match req.size {
            SellSize::Shares(s) => (false, SizeSpec::Shares(s)),
            SellSize::DesiredAmountOut(a) => (false, SizeSpec::Amount(a)),
            SellSize::SellAll => (true, SizeSpec::Shares(position.shares)),
        };

        if sell_all && position.shares.to_f64().unwrap_or(0.0) <= dust_threshold {
            let wallet_id = resolve_wallet(&mut tx, req.user_id, req.wallet_id).await?;
            sqlx::query("UPDATE positions SET shares = 0, cost_basis = 0 WHERE user_id = $1 AND market_id = $2 AND option_id = $3")
                .bind(req.user_id)
                .bind(req.market_id)
                .bind(option_id)
                .execute(&mut *tx)
                .await?;
            let order_intent_id = write_audit_rows(
                &mut tx,
                req.user_id,
                req.market_id,
                option_id,
                quote::Side::Sell,
                Decimal::ZERO,
                position.shares,
                wallet_id,
                req.client_nonce.as_deref(),
            )
            .await?;
            return Ok(TradeReceipt {
                market_id: req.market_id,
                option_id,
                option_index,
                side: quote::Side::Sell,
                amount: Decimal::ZERO,
                shares: position.shares,
                fee_amount: Decimal::ZERO,
                avg_price_bps: 0,
                pre_prob_bps: crate::lmsr::prices(&state.q, locked_pool.b.to_f64().unwrap_or(1.0))
                    .map(|p| p.iter().map(|&v| money::bps_from_probability(v)).collect())
                    .unwrap_or_default(),
                post_prob_bps: vec![],
                balance_available: balance.available_amount,
                position_shares: Decimal::ZERO,
                position_cost_basis: Decimal::ZERO,
                order_intent_id,
                dust_cleanup: true,
            });
        }

        // Allow selling "all" shares even if the requested amount differs
        // from the recorded position by rounding noise.
        if let SizeSpec::Shares(requested) = size {
            let diff = (requested - position.shares).abs().to_f64().unwrap_or(0.0);
            if requested > position.shares && diff > DUST_SELL_TOLERANCE {
                return Err(anyhow!(crate::error::insufficient_shares(format!(
                    "requested {requested} shares, position has {}",
                    position.shares
                ))));
            }
        }

        let quote_req = QuoteRequest {
            selector: OptionSelector::Index(option_index),
            side: quote::Side::Sell,
            size,
            money_quant: config.money_quant,
            is_no_side,
        };
        let q = quote::quote_from_state(&state, &quote_req)?;

        if let Some(min_amount_out) = req.min_amount_out {
            if q.amount < min_amount_out {
                return Err(anyhow!(crate::error::slippage_protection(format!(
                    "amount_out {} below min_amount_out {}",
                    q.amount, min_amount_out
                ))));
            }
        }

        let sold_shares = q.shares.min(position.shares);
        let cost_basis_reduction = if position.shares > Decimal::ZERO {
            (position.cost_basis * sold_shares / position.shares).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        sqlx::query(
            "UPDATE positions SET shares = GREATEST(shares - $1, 0), cost_basis = GREATEST(cost_basis - $2, 0)
             WHERE user_id = $3 AND market_id = $4 AND option_id = $5",
        )
        .bind(sold_shares)
        .bind(cost_basis_reduction)
        .bind(req.user_id)
        .bind(req.market_id)
        .bind(option_id)
        .execute(&mut *tx)
        .await?;

        if let Some(deltas) = &q.no_sell_deltas {
            for (j, delta) in deltas.iter().enumerate() {
                if *delta == 0.0 {
                    continue;
                }
                sqlx::query("UPDATE amm_pool_option_state SET q = q + $1 WHERE pool_id = $2 AND option_id = $3")
                    .bind(money::quantize_shares_down(*delta))
                    .bind(locked_pool.pool_id)
                    .bind(state.option_ids[j])
                    .execute(&mut *tx)
                    .await?;
            }
        } else {
            sqlx::query("UPDATE amm_pool_option_state SET q = q - $1 WHERE pool_id = $2 AND option_id = $3")
                .bind(sold_shares)
                .bind(locked_pool.pool_id)
                .bind(option_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE balance_snapshot SET available_amount = available_amount + $1 WHERE user_id = $2 AND token = $3",
        )
        .bind(q.amount)
        .bind(req.user_id)
        .bind(&token)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE amm_pools SET pool_cash = pool_cash - $1 WHERE id = $2")
            .bind(q.amount)
            .bind(locked_pool.pool_id)
            .execute(&mut *tx)
            .await?;

        let post_probs = crate::lmsr::prices(&apply_deltas(&state, &q), locked_pool.b.to_f64().unwrap_or(1.0))
            .map_err(EngineError::from)?;
        refresh_option_stats(&mut tx, &state.option_ids, &post_probs, locked_pool.is_exclusive).await?;
        emit_price_series(&mut tx, &state.option_ids, &post_probs, config.price_bucket_seconds, &config.series_interval_tag).await;

        let wallet_id = resolve_wallet(&mut tx, req.user_id, req.wallet_id).await?;
        let order_intent_id = write_audit_rows(
            &mut tx,
            req.user_id,
            req.market_id,
            option_id,
            quote::Side::Sell,
            q.amount,
            q.shares,
            wallet_id,
            req.client_nonce.as_deref(),
        )
        .await?;

        info!(option_id, shares = %sold_shares, amount = %q.amount, "sell executed");

        Ok(TradeReceipt {
            market_id: req.market_id,
            option_id,
            option_index,
            side: quote::Side::Sell,
            amount: q.amount,
            shares: q.shares,
            fee_amount: q.fee_amount,
            avg_price_bps: q.avg_price_bps,
            pre_prob_bps: q.pre_prob_bps,
            post_prob_bps: q.post_prob_bps,
            balance_available: balance.available_amount + q.amount,
            position_shares: position.shares - sold_shares,
            position_cost_basis: position.cost_basis - cost_basis_reduction,
            order_intent_id,
            dust_cleanup: false,
        })
    });

    let receipt = result?;
    cache.invalidate_on_trade(req.market_id, req.user_id, None).await;
    Ok(receipt)
}
