//! Pure LMSR (Logarithmic Market Scoring Rule) math.
//!
//! Everything here operates on plain `f64` outcome vectors and never touches
//! the database, `Decimal`, or async. Money and shares are converted to/from
//! `f64` exactly once, at the boundary in [`crate::money`] and
//! [`crate::quote`].

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LmsrError {
    #[error("liquidity parameter b must be positive, got {0}")]
    NonPositiveB(f64),
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(f64),
    #[error("outcome index {index} out of range for {len} outcomes")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("outcome vector must have at least 2 entries, got {0}")]
    TooFewOutcomes(usize),
    #[error("non-finite value encountered in LMSR computation")]
    NonFinite,
    #[error("requested payout {requested} exceeds maximum payout {max} for this outcome")]
    PayoutExceedsMax { requested: f64, max: f64 },
}

fn check_q_b(q: &[f64], b: f64) -> Result<(), LmsrError> {
    if q.len() < 2 {
        return Err(LmsrError::TooFewOutcomes(q.len()));
    }
    if !(b > 0.0) || !b.is_finite() {
        return Err(LmsrError::NonPositiveB(b));
    }
    if q.iter().any(|v| !v.is_finite()) {
        return Err(LmsrError::NonFinite);
    }
    Ok(())
}

/// Numerically stable `log(sum(exp(x_i)))`, subtracting the max before
/// exponentiating so large `q/b` never overflows.
fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = xs.iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Stable `log(1 + exp(x))`, branch-cut for large/small `x` so it never
/// overflows or loses precision near zero.
fn log1p_exp(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else if x < -30.0 {
        0.0
    } else {
        x.exp().ln_1p()
    }
}

/// Softmax prices for outcome vector `q` at liquidity `b`. Sums to 1.
pub fn prices(q: &[f64], b: f64) -> Result<Vec<f64>, LmsrError> {
    check_q_b(q, b)?;
    let scaled: Vec<f64> = q.iter().map(|v| v / b).collect();
    let max = scaled.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Err(LmsrError::NonFinite);
    }
    Ok(exps.into_iter().map(|v| v / sum).collect())
}

/// LMSR cost function `C(q) = b * logsumexp(q / b)`.
pub fn cost(q: &[f64], b: f64) -> Result<f64, LmsrError> {
    check_q_b(q, b)?;
    let scaled: Vec<f64> = q.iter().map(|v| v / b).collect();
    let c = b * log_sum_exp(&scaled);
    if !c.is_finite() {
        return Err(LmsrError::NonFinite);
    }
    Ok(c)
}

/// Solve for the `delta` such that `cost(q + delta*e_k, b) - cost(q, b) == a_net`.
///
/// Closed form: `delta = b * log(1 + (exp(a_net/b) - 1) * (S / a))` where
/// `S = sum(exp(q_j/b))` and `a = exp(q_k/b)`, computed in log-domain via
/// `ln_expm1_pos`/`log1p_exp` to avoid overflow for large `a_net/b`.
pub fn buy_amount_to_delta_q(q: &[f64], b: f64, k: usize, a_net: f64) -> Result<f64, LmsrError> {
    check_q_b(q, b)?;
    if k >= q.len() {
        return Err(LmsrError::IndexOutOfRange { index: k, len: q.len() });
    }
    if !(a_net > 0.0) || !a_net.is_finite() {
        return Err(LmsrError::NonPositiveAmount(a_net));
    }

    let scaled: Vec<f64> = q.iter().map(|v| v / b).collect();
    let log_s = log_sum_exp(&scaled);
    let log_a = scaled[k];
    let log_s_over_a = log_s - log_a;
    let t = a_net / b;
    let log_expm1_t = ln_expm1_pos(t)?;
    let inner_log = log_expm1_t + log_s_over_a;
    let delta_over_b = log1p_exp(inner_log);
    let delta = b * delta_over_b;
    if !delta.is_finite() {
        return Err(LmsrError::NonFinite);
    }
    Ok(delta)
}

/// `log(expm1(t))` for `t > 0`, stable for both small and large `t`.
fn ln_expm1_pos(t: f64) -> Result<f64, LmsrError> {
    if !(t > 0.0) || !t.is_finite() {
        return Err(LmsrError::NonPositiveAmount(t));
    }
    if t > 30.0 {
        Ok(t)
    } else {
        Ok(t.exp_m1().ln())
    }
}

/// Maximum gross payout obtainable by fully unwinding outcome `k`:
/// `-b * log(1 - p_k)`.
pub fn max_gross_payout(q: &[f64], b: f64, k: usize) -> Result<f64, LmsrError> {
    let p = prices(q, b)?;
    let p_k = *p.get(k).ok_or(LmsrError::IndexOutOfRange { index: k, len: p.len() })?;
    if !(p_k < 1.0) {
        return Err(LmsrError::NonFinite);
    }
    let max = -b * (1.0 - p_k).ln();
    if !max.is_finite() {
        return Err(LmsrError::NonFinite);
    }
    Ok(max)
}

/// Solve for the share quantity `x` to sell from outcome `k` that yields a
/// gross payout of exactly `gross_needed`.
///
/// Derived from `cost(q, b) - cost(q', b) = gross_needed` with
/// `q'_k = q_k - x`: letting `a = exp(q_k/b)`, `s = sum(exp(q_j/b))`, the
/// post-trade sum is `s' = s * exp(-gross_needed/b)`, giving
/// `x = -b * log((s' - s + a) / a)`.
pub fn delta_q_for_sell_amount(
    q: &[f64],
    b: f64,
    k: usize,
    gross_needed: f64,
) -> Result<f64, LmsrError> {
    check_q_b(q, b)?;
    if k >= q.len() {
        return Err(LmsrError::IndexOutOfRange { index: k, len: q.len() });
    }
    if !(gross_needed > 0.0) || !gross_needed.is_finite() {
        return Err(LmsrError::NonPositiveAmount(gross_needed));
    }

    let max = max_gross_payout(q, b, k)?;
    if gross_needed > max {
        return Err(LmsrError::PayoutExceedsMax { requested: gross_needed, max });
    }

    let scaled: Vec<f64> = q.iter().map(|v| v / b).collect();
    let log_s = log_sum_exp(&scaled);
    let log_a = scaled[k];
    let log_s_over_a = log_s - log_a;
    let t = -gross_needed / b;
    let ratio = t.exp_m1() * log_s_over_a.exp() + 1.0;
    if !(ratio > 0.0) || !ratio.is_finite() {
        return Err(LmsrError::NonFinite);
    }
    let x = -b * ratio.ln();
    if !x.is_finite() || x < 0.0 {
        return Err(LmsrError::NonFinite);
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prices_sum_to_one_binary() {
        let p = prices(&[0.0, 0.0], 100.0).unwrap();
        assert!((p[0] - 0.5).abs() < 1e-12);
        assert!((p[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn prices_sum_to_one_n_ary() {
        let p = prices(&[10.0, -5.0, 3.0, 0.0], 50.0).unwrap();
        let sum: f64 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(p.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn scenario_1_binary_equilibrium() {
        let delta = buy_amount_to_delta_q(&[0.0, 0.0], 10000.0, 0, 1000.0).unwrap();
        assert!((delta - 1086.27).abs() < 0.1, "delta = {delta}");
    }

    #[test]
    fn buy_then_cost_matches_amount() {
        let q = vec![0.0, 0.0];
        let b = 10000.0;
        let delta = buy_amount_to_delta_q(&q, b, 0, 1000.0).unwrap();
        let mut q2 = q.clone();
        q2[0] += delta;
        let diff = cost(&q2, b).unwrap() - cost(&q, b).unwrap();
        assert!((diff - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(matches!(cost(&[0.0, 0.0], 0.0), Err(LmsrError::NonPositiveB(_))));
        assert!(matches!(
            buy_amount_to_delta_q(&[0.0, 0.0], 10.0, 0, -1.0),
            Err(LmsrError::NonPositiveAmount(_))
        ));
        assert!(matches!(
            buy_amount_to_delta_q(&[0.0, 0.0], 10.0, 5, 1.0),
            Err(LmsrError::IndexOutOfRange { .. })
        ));
    }

    proptest! {
        #[test]
        fn p1_probability_closure(
            qs in proptest::collection::vec(-1000.0f64..1000.0, 2..6),
            b in 1.0f64..10000.0,
        ) {
            let p = prices(&qs, b).unwrap();
            let sum: f64 = p.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            for v in p {
                prop_assert!((0.0..=1.0).contains(&v));
            }
        }

        #[test]
        fn p2_lmsr_inverse(
            qs in proptest::collection::vec(-500.0f64..500.0, 2..6),
            b in 10.0f64..5000.0,
            a in 0.01f64..10000.0,
        ) {
            let k = 0usize;
            let delta = buy_amount_to_delta_q(&qs, b, k, a).unwrap();
            let mut q2 = qs.clone();
            q2[k] += delta;
            let diff = cost(&q2, b).unwrap() - cost(&qs, b).unwrap();
            prop_assert!((diff - a).abs() < 1e-9 * a.max(1.0));
        }

        #[test]
        fn buy_sell_round_trip(
            qs in proptest::collection::vec(-200.0f64..200.0, 2..4),
            b in 50.0f64..2000.0,
            a in 1.0f64..500.0,
        ) {
            let k = 0usize;
            let delta = buy_amount_to_delta_q(&qs, b, k, a).unwrap();
            let mut q2 = qs.clone();
            q2[k] += delta;
            let gross = cost(&q2, b).unwrap() - cost(&qs, b).unwrap();
            let recovered = delta_q_for_sell_amount(&q2, b, k, gross).unwrap();
            prop_assert!((recovered - delta).abs() < 1e-6 * delta.max(1.0));
        }
    }
}
