//! Fixed-point boundary helpers.
//!
//! LMSR math runs in `f64`; money and shares at the public boundary are
//! `rust_decimal::Decimal`. Conversion happens once in, once out. Rounding is
//! always against the user: buy amounts round up, sell proceeds round down,
//! shares always round down.

use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};

/// Shares are quantized to 8 fractional digits.
pub const SHARES_SCALE: u32 = 8;

/// Money and `b` are stored with 18 fractional digits at the persistence
/// boundary.
pub const STORAGE_SCALE: u32 = 18;

/// Quantity below which a sell-all position is treated as dust and the AMM
/// is skipped entirely.
pub const DUST_THRESHOLD: f64 = 0.1;

/// Tolerance for "close enough to sell everything" when a position's
/// recorded shares differ from the requested sell-all amount by rounding
/// noise.
pub const DUST_SELL_TOLERANCE: f64 = 0.01;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MoneyError {
    #[error("fee_bps must be in [0, 9999], got {0}")]
    InvalidFeeBps(i32),
}

/// Convert a basis-points fee configuration to a fractional rate.
/// `fee_bps == 10000` is rejected because it makes the buy-side gross-up
/// divide by zero.
pub fn fee_rate_from_bps(fee_bps: i32) -> Result<f64, MoneyError> {
    if !(0..10000).contains(&fee_bps) {
        return Err(MoneyError::InvalidFeeBps(fee_bps));
    }
    Ok(fee_bps as f64 / 10_000.0)
}

pub fn bps_from_probability(p: f64) -> i32 {
    (p.clamp(0.0, 1.0) * 10_000.0).round() as i32
}

/// Round a money amount up to `scale` fractional digits. Used for anything
/// the user pays (buy gross, buy fee). Quote-facing callers pass the
/// caller-supplied `money_quant`'s scale; `STORAGE_SCALE` is for values that
/// never reach a quote response.
pub fn quantize_money_up(amount: f64, scale: u32) -> Decimal {
    quantize(amount, scale, RoundingStrategy::AwayFromZero)
}

/// Round a money amount down to `scale` fractional digits. Used for anything
/// the user receives (sell proceeds).
pub fn quantize_money_down(amount: f64, scale: u32) -> Decimal {
    quantize(amount, scale, RoundingStrategy::ToZero)
}

/// Fractional-digit count implied by a quantization granularity such as
/// `0.01` (2) or `0.000001` (6), matching how a caller would read it.
pub fn scale_of(money_quant: Decimal) -> u32 {
    money_quant.normalize().scale()
}

/// Shares always round down, regardless of buy or sell.
pub fn quantize_shares_down(shares: f64) -> Decimal {
    quantize(shares, SHARES_SCALE, RoundingStrategy::ToZero)
}

fn quantize(value: f64, scale: u32, strategy: RoundingStrategy) -> Decimal {
    let d = Decimal::from_f64(value).unwrap_or(Decimal::ZERO);
    d.round_dp_with_strategy(scale, strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_fee_bps() {
        assert_eq!(fee_rate_from_bps(10000), Err(MoneyError::InvalidFeeBps(10000)));
        assert_eq!(fee_rate_from_bps(-1), Err(MoneyError::InvalidFeeBps(-1)));
    }

    #[test]
    fn fee_rate_ok() {
        assert!((fee_rate_from_bps(200).unwrap() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn quantize_rounds_against_user() {
        assert_eq!(quantize_shares_down(1.999999999), Decimal::new(19999999, 8));
        // buy rounds up
        let up = quantize_money_up(1.0000000000000001, STORAGE_SCALE);
        assert!(up >= Decimal::ONE);
    }

    #[test]
    fn scale_of_reads_fractional_digits() {
        assert_eq!(scale_of(Decimal::new(1, 2)), 2); // 0.01
        assert_eq!(scale_of(Decimal::new(1, 6)), 6); // 0.000001
        assert_eq!(scale_of(Decimal::ONE), 0);
    }
}
