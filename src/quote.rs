//! Pure Quote Engine.
//!
//! `quote_from_state` takes an immutable [`PoolState`] and a request and
//! returns a [`Quote`] with no side effects. Execution is the only caller
//! that turns a `Quote` into writes.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::lmsr;
use crate::money;
use crate::state::{OptionSelector, PoolState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// Exactly one of these is provided per request. For buy, `Shares` means
/// "I want this many shares, tell me the cost"; for sell, `AmountOut` means
/// "I want this much money out, tell me how many shares that costs".
#[derive(Debug, Clone, Copy)]
pub enum SizeSpec {
    Amount(Decimal),
    Shares(Decimal),
}

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub selector: OptionSelector,
    pub side: Side,
    pub size: SizeSpec,
    /// Quantization granularity for every money value in the returned
    /// [`Quote`] (fee, net, gross, `amount`). A caller wanting cent
    /// precision passes `0.01`; a stablecoin wanting micro precision passes
    /// `0.000001`.
    pub money_quant: Decimal,
    pub is_no_side: bool,
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub market_id: i64,
    pub pool_id: i64,
    pub option_id: i64,
    pub option_index: usize,
    pub side: Side,
    /// `amount_in` for buys, `amount_out` for sells.
    pub amount: Decimal,
    /// `shares_out` for buys, `shares_in` for sells.
    pub shares: Decimal,
    pub fee_amount: Decimal,
    pub avg_price_bps: i32,
    pub pre_prob_bps: Vec<i32>,
    pub post_prob_bps: Vec<i32>,
    pub option_ids: Vec<i64>,
    pub option_indexes: Vec<i32>,
    pub is_no_side: bool,
    pub no_buy_deltas: Option<Vec<f64>>,
    pub no_sell_deltas: Option<Vec<f64>>,
}

fn to_f64_pos(d: Decimal, field: &'static str) -> Result<f64, EngineError> {
    let v = d.to_f64().ok_or_else(|| crate::error::invalid_param(format!("{field} out of range")))?;
    if !(v > 0.0) || !v.is_finite() {
        return Err(crate::error::invalid_param(format!("{field} must be > 0")));
    }
    Ok(v)
}

fn bps_vec(probs: &[f64]) -> Vec<i32> {
    probs.iter().map(|&p| money::bps_from_probability(p)).collect()
}

/// Distribute a buy/sell across every outcome other than `target_idx`,
/// proportional to their current probability, for a NO-side trade in an
/// exclusive-event pool.
fn proportional_other_deltas(
    q: &[f64],
    b: f64,
    target_idx: usize,
    amount_or_shares: f64,
    is_buy: bool,
) -> Result<Vec<f64>, EngineError> {
    let n = q.len();
    let probs = lmsr::prices(q, b)?;
    let other_sum: f64 = probs.iter().enumerate().filter(|(j, _)| *j != target_idx).map(|(_, p)| p).sum();
    if !(other_sum > 0.0) {
        return Err(crate::error::quote_math_error("no other options available to distribute trade"));
    }
    let mut deltas = vec![0.0; n];
    for j in 0..n {
        if j == target_idx {
            continue;
        }
        let share = amount_or_shares * (probs[j] / other_sum);
        if share <= 0.0 {
            continue;
        }
        if is_buy {
            deltas[j] = lmsr::buy_amount_to_delta_q(q, b, j, share)?;
        } else {
            deltas[j] = -share;
        }
    }
    Ok(deltas)
}

pub fn quote_from_state(state: &PoolState, req: &QuoteRequest) -> Result<Quote, EngineError> {
    if state.b <= 0.0 {
        return Err(crate::error::pool_invalid("liquidity parameter b must be positive"));
    }
    if req.money_quant <= Decimal::ZERO {
        return Err(crate::error::invalid_param("money_quant must be > 0"));
    }
    let scale = money::scale_of(req.money_quant);
    let (target_idx, resolved_no_side) = state.resolve_with_side(req.selector)?;
    let is_no_side = req.is_no_side || resolved_no_side;
    let fee_rate = money::fee_rate_from_bps(state.fee_bps)?;
    let one_minus_fee = 1.0 - fee_rate;

    let pre_probs = lmsr::prices(&state.q, state.b)?;
    let pre_prob_bps = bps_vec(&pre_probs);
    let option_id = state.option_ids[target_idx];

    match (req.side, req.size, is_no_side) {
        (Side::Buy, SizeSpec::Amount(gross_in), true) => {
            if gross_in <= Decimal::ZERO {
                return Err(crate::error::invalid_param("amount_in must be > 0"));
            }
            let fee_dec =
                money::quantize_money_up((gross_in * Decimal::from_f64(fee_rate).unwrap()).to_f64().unwrap_or(0.0), scale);
            let net_dec = gross_in - fee_dec;
            if net_dec <= Decimal::ZERO {
                return Err(crate::error::amount_too_low("amount too low to cover fees"));
            }
            let net_float = to_f64_pos(net_dec, "amount_net")?;
            let deltas = proportional_other_deltas(&state.q, state.b, target_idx, net_float, true)?;
            let total_shares: f64 = deltas.iter().sum();
            if !(total_shares > 0.0) {
                return Err(crate::error::amount_too_low(
                    "amount too low to produce any shares after fees/rounding",
                ));
            }
            let mut q_post = state.q.clone();
            for (j, d) in deltas.iter().enumerate() {
                q_post[j] += d;
            }
            let post_prob_bps = bps_vec(&lmsr::prices(&q_post, state.b)?);
            let shares_out = money::quantize_shares_down(total_shares);
            let amount_in = money::quantize_money_up(gross_in.to_f64().unwrap_or(0.0), scale);
            let avg_price_bps = avg_price_bps(amount_in, shares_out)?;
            Ok(Quote {
                market_id: state.market_id,
                pool_id: state.pool_id,
                option_id,
                option_index: target_idx,
                side: Side::Buy,
                amount: amount_in,
                shares: shares_out,
                fee_amount: fee_dec,
                avg_price_bps,
                pre_prob_bps,
                post_prob_bps,
                option_ids: state.option_ids.clone(),
                option_indexes: state.option_indexes.clone(),
                is_no_side: true,
                no_buy_deltas: Some(deltas),
                no_sell_deltas: None,
            })
        }
        (Side::Buy, SizeSpec::Amount(gross_in), false) => {
            if gross_in <= Decimal::ZERO {
                return Err(crate::error::invalid_param("amount_in must be > 0"));
            }
            let fee_dec =
                money::quantize_money_up((gross_in * Decimal::from_f64(fee_rate).unwrap()).to_f64().unwrap_or(0.0), scale);
            let net_dec = gross_in - fee_dec;
            if net_dec <= Decimal::ZERO {
                return Err(crate::error::amount_too_low("amount too low to cover fees"));
            }
            let net_float = to_f64_pos(net_dec, "amount_net")?;
            let delta = lmsr::buy_amount_to_delta_q(&state.q, state.b, target_idx, net_float)?;
            if !(delta > 0.0) {
                return Err(crate::error::amount_too_low(
                    "amount too low to produce any shares after fees/rounding",
                ));
            }
            let mut q_post = state.q.clone();
            q_post[target_idx] += delta;
            let post_prob_bps = bps_vec(&lmsr::prices(&q_post, state.b)?);
            let shares_out = money::quantize_shares_down(delta);
            let amount_in = money::quantize_money_up(gross_in.to_f64().unwrap_or(0.0), scale);
            let avg_price_bps = avg_price_bps(amount_in, shares_out)?;
            Ok(Quote {
                market_id: state.market_id,
                pool_id: state.pool_id,
                option_id,
                option_index: target_idx,
                side: Side::Buy,
                amount: amount_in,
                shares: shares_out,
                fee_amount: fee_dec,
                avg_price_bps,
                pre_prob_bps,
                post_prob_bps,
                option_ids: state.option_ids.clone(),
                option_indexes: state.option_indexes.clone(),
                is_no_side: false,
                no_buy_deltas: None,
                no_sell_deltas: None,
            })
        }
        (Side::Buy, SizeSpec::Shares(shares_dec), _) => {
            if shares_dec <= Decimal::ZERO {
                return Err(crate::error::invalid_param("shares must be > 0"));
            }
            let shares_float = to_f64_pos(shares_dec, "shares")?;
            let mut q_post = state.q.clone();
            q_post[target_idx] += shares_float;
            let net_cost = lmsr::cost(&q_post, state.b)? - lmsr::cost(&state.q, state.b)?;
            if !(net_cost > 0.0) {
                return Err(crate::error::quote_math_error("invalid net cost for buy(shares)"));
            }
            let net_cost_dec = money::quantize_money_up(net_cost, scale);
            if one_minus_fee <= 0.0 {
                return Err(crate::error::invalid_param("fee too high"));
            }
            let gross_in_dec = money::quantize_money_up(
                (net_cost_dec / Decimal::from_f64(one_minus_fee).unwrap()).to_f64().unwrap_or(0.0),
                scale,
            );
            let fee_dec = gross_in_dec - net_cost_dec;
            let post_prob_bps = bps_vec(&lmsr::prices(&q_post, state.b)?);
            let avg_price_bps = avg_price_bps(gross_in_dec, shares_dec)?;
            Ok(Quote {
                market_id: state.market_id,
                pool_id: state.pool_id,
                option_id,
                option_index: target_idx,
                side: Side::Buy,
                amount: gross_in_dec,
                shares: shares_dec,
                fee_amount: fee_dec,
                avg_price_bps,
                pre_prob_bps,
                post_prob_bps,
                option_ids: state.option_ids.clone(),
                option_indexes: state.option_indexes.clone(),
                is_no_side: false,
                no_buy_deltas: None,
                no_sell_deltas: None,
            })
        }
        (Side::Sell, SizeSpec::Shares(shares_dec), true) => {
            if shares_dec <= Decimal::ZERO {
                return Err(crate::error::invalid_param("shares must be > 0"));
            }
            let shares_float = to_f64_pos(shares_dec, "shares")?;
            let deltas = proportional_other_deltas(&state.q, state.b, target_idx, shares_float, false)?;
            let mut q_post = state.q.clone();
            for (j, d) in deltas.iter().enumerate() {
                q_post[j] += d;
            }
            let gross = lmsr::cost(&state.q, state.b)? - lmsr::cost(&q_post, state.b)?;
            if !(gross > 0.0) {
                return Err(crate::error::quote_math_error("invalid gross proceeds for sell No(shares)"));
            }
            let (fee_dec, net_out_dec, gross_dec) = sell_fee_split(gross, fee_rate, scale)?;
            let post_prob_bps = bps_vec(&lmsr::prices(&q_post, state.b)?);
            let avg_price_bps = avg_price_bps(net_out_dec, shares_dec)?;
            let _ = gross_dec;
            Ok(Quote {
                market_id: state.market_id,
                pool_id: state.pool_id,
                option_id,
                option_index: target_idx,
                side: Side::Sell,
                amount: net_out_dec,
                shares: shares_dec,
                fee_amount: fee_dec,
                avg_price_bps,
                pre_prob_bps,
                post_prob_bps,
                option_ids: state.option_ids.clone(),
                option_indexes: state.option_indexes.clone(),
                is_no_side: true,
                no_buy_deltas: None,
                no_sell_deltas: Some(deltas),
            })
        }
        (Side::Sell, SizeSpec::Shares(shares_dec), false) => {
            if shares_dec <= Decimal::ZERO {
                return Err(crate::error::invalid_param("shares must be > 0"));
            }
            let shares_float = to_f64_pos(shares_dec, "shares")?;
            let mut q_post = state.q.clone();
            q_post[target_idx] -= shares_float;
            let gross = lmsr::cost(&state.q, state.b)? - lmsr::cost(&q_post, state.b)?;
            if !(gross > 0.0) {
                return Err(crate::error::quote_math_error("invalid gross proceeds for sell(shares)"));
            }
            let (fee_dec, net_out_dec, _) = sell_fee_split(gross, fee_rate, scale)?;
            let post_prob_bps = bps_vec(&lmsr::prices(&q_post, state.b)?);
            let avg_price_bps = avg_price_bps(net_out_dec, shares_dec)?;
            Ok(Quote {
                market_id: state.market_id,
                pool_id: state.pool_id,
                option_id,
                option_index: target_idx,
                side: Side::Sell,
                amount: net_out_dec,
                shares: shares_dec,
                fee_amount: fee_dec,
                avg_price_bps,
                pre_prob_bps,
                post_prob_bps,
                option_ids: state.option_ids.clone(),
                option_indexes: state.option_indexes.clone(),
                is_no_side: false,
                no_buy_deltas: None,
                no_sell_deltas: None,
            })
        }
        (Side::Sell, SizeSpec::Amount(desired_net_out), _) => {
            if desired_net_out <= Decimal::ZERO {
                return Err(crate::error::invalid_param(
                    "amount_in (desired amount_out) must be > 0",
                ));
            }
            let desired_net_out = money::quantize_money_down(desired_net_out.to_f64().unwrap_or(0.0), scale);
            if one_minus_fee <= 0.0 {
                return Err(crate::error::invalid_param("fee too high"));
            }
            let gross_needed_dec = money::quantize_money_up(
                (desired_net_out / Decimal::from_f64(one_minus_fee).unwrap()).to_f64().unwrap_or(0.0),
                scale,
            );
            let gross_needed_float = to_f64_pos(gross_needed_dec, "gross_needed")?;

            let max_gross = lmsr::max_gross_payout(&state.q, state.b, target_idx)?;
            if gross_needed_float >= max_gross {
                return Err(crate::error::quote_math_error(format!(
                    "desired amount_out too large (max net approx {})",
                    max_gross * one_minus_fee
                )));
            }

            let shares_needed = lmsr::delta_q_for_sell_amount(&state.q, state.b, target_idx, gross_needed_float)?;
            if !(shares_needed > 0.0) {
                return Err(crate::error::quote_math_error("invalid shares_in solved for sell(amount_out)"));
            }
            let shares_needed_dec = money::quantize_shares_down(shares_needed);
            let shares_needed_float = shares_needed_dec.to_f64().unwrap_or(shares_needed);

            let mut q_post = state.q.clone();
            q_post[target_idx] -= shares_needed_float;
            let gross = lmsr::cost(&state.q, state.b)? - lmsr::cost(&q_post, state.b)?;
            let (fee_dec, net_out_dec, _) = sell_fee_split(gross.max(0.0), fee_rate, scale)?;
            let post_prob_bps = bps_vec(&lmsr::prices(&q_post, state.b)?);
            let avg_price_bps = avg_price_bps(net_out_dec, shares_needed_dec)?;
            Ok(Quote {
                market_id: state.market_id,
                pool_id: state.pool_id,
                option_id,
                option_index: target_idx,
                side: Side::Sell,
                amount: net_out_dec,
                shares: shares_needed_dec,
                fee_amount: fee_dec,
                avg_price_bps,
                pre_prob_bps,
                post_prob_bps,
                option_ids: state.option_ids.clone(),
                option_indexes: state.option_indexes.clone(),
                is_no_side: false,
                no_buy_deltas: None,
                no_sell_deltas: None,
            })
        }
    }
}

fn sell_fee_split(gross: f64, fee_rate: f64, scale: u32) -> Result<(Decimal, Decimal, Decimal), EngineError> {
    let gross_dec = money::quantize_money_down(gross, scale);
    let fee_dec =
        money::quantize_money_up((gross_dec * Decimal::from_f64(fee_rate).unwrap_or_default()).to_f64().unwrap_or(0.0), scale);
    let net_out_dec = money::quantize_money_down((gross_dec - fee_dec).to_f64().unwrap_or(0.0), scale);
    if net_out_dec <= Decimal::ZERO {
        return Err(crate::error::amount_too_low("proceeds too low after fees/rounding"));
    }
    Ok((fee_dec, net_out_dec, gross_dec))
}

fn avg_price_bps(amount: Decimal, shares: Decimal) -> Result<i32, EngineError> {
    if shares <= Decimal::ZERO {
        return Err(crate::error::quote_math_error("cannot compute avg price with zero shares"));
    }
    let ratio = (amount / shares * Decimal::from(10_000)).round();
    ratio.to_i32().ok_or_else(|| crate::error::quote_math_error("avg_price_bps overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(q: Vec<f64>, fee_bps: i32) -> PoolState {
        PoolState {
            market_id: 1,
            pool_id: 1,
            b: 10000.0,
            fee_bps,
            option_ids: (0..q.len() as i64).map(|i| i + 1).collect(),
            option_indexes: (0..q.len() as i32).collect(),
            q,
            is_exclusive: false,
            no_to_yes_mapping: HashMap::new(),
        }
    }

    fn cent_quant() -> Decimal {
        Decimal::new(1, 2)
    }

    #[test]
    fn scenario_1_binary_buy() {
        let state = pool(vec![0.0, 0.0], 0);
        let req = QuoteRequest {
            selector: OptionSelector::Index(0),
            side: Side::Buy,
            size: SizeSpec::Amount(Decimal::new(1000, 0)),
            money_quant: cent_quant(),
            is_no_side: false,
        };
        let q = quote_from_state(&state, &req).unwrap();
        assert!(q.post_prob_bps[0] > 5000);
        assert_eq!(q.post_prob_bps[0] + q.post_prob_bps[1], 10000);
    }

    #[test]
    fn scenario_3_sell_round_trip_costs_fee() {
        let state = pool(vec![0.0, 0.0], 200);
        let buy_req = QuoteRequest {
            selector: OptionSelector::Index(0),
            side: Side::Buy,
            size: SizeSpec::Amount(Decimal::new(500, 0)),
            money_quant: cent_quant(),
            is_no_side: false,
        };
        let buy = quote_from_state(&state, &buy_req).unwrap();

        let mut state2 = state.clone();
        state2.q[0] += buy.shares.to_f64().unwrap();

        let sell_req = QuoteRequest {
            selector: OptionSelector::Index(0),
            side: Side::Sell,
            size: SizeSpec::Shares(buy.shares),
            money_quant: cent_quant(),
            is_no_side: false,
        };
        let sell = quote_from_state(&state2, &sell_req).unwrap();
        assert!(sell.amount < buy.amount);
    }

    #[test]
    fn buy_with_max_fee_bps_rejected() {
        let state = pool(vec![0.0, 0.0], 10000);
        let req = QuoteRequest {
            selector: OptionSelector::Index(0),
            side: Side::Buy,
            size: SizeSpec::Amount(Decimal::new(1000, 0)),
            money_quant: cent_quant(),
            is_no_side: false,
        };
        assert!(quote_from_state(&state, &req).is_err());
    }

    #[test]
    fn rejects_non_positive_money_quant() {
        let state = pool(vec![0.0, 0.0], 0);
        let req = QuoteRequest {
            selector: OptionSelector::Index(0),
            side: Side::Buy,
            size: SizeSpec::Amount(Decimal::new(1000, 0)),
            money_quant: Decimal::ZERO,
            is_no_side: false,
        };
        assert!(quote_from_state(&state, &req).is_err());
    }

    #[test]
    fn coarser_money_quant_widens_rounding() {
        let state = pool(vec![0.0, 0.0], 200);
        let fine_req = QuoteRequest {
            selector: OptionSelector::Index(0),
            side: Side::Buy,
            size: SizeSpec::Amount(Decimal::new(100001, 2)),
            money_quant: cent_quant(),
            is_no_side: false,
        };
        let coarse_req = QuoteRequest { money_quant: Decimal::ONE, ..fine_req.clone() };
        let fine = quote_from_state(&state, &fine_req).unwrap();
        let coarse = quote_from_state(&state, &coarse_req).unwrap();
        assert_eq!(coarse.fee_amount.scale(), 0);
        assert!(fine.fee_amount.scale() <= 2);
    }
}
