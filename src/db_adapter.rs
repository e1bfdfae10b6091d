//! Database adapter layer for clean numeric conversions.
//!
//! Isolates the `Decimal` <-> `f64` boundary crossing and row shape from the
//! business logic in [`crate::execution`] and [`crate::settlement`], the way
//! the original adapter layer isolated ledger-unit conversions.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::state::{NoToYesEntry, PoolState};

pub fn decimal_to_f64(d: Decimal, field: &'static str) -> Result<f64> {
    d.to_f64().ok_or_else(|| anyhow!("{field} does not fit in f64"))
}

/// One locked `amm_pool_option_state` row.
pub struct OptionStateRow {
    pub option_id: i64,
    pub option_index: i32,
    pub q: Decimal,
}

impl OptionStateRow {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            option_id: row.try_get("option_id")?,
            option_index: row.try_get("option_index")?,
            q: row.try_get("q")?,
        })
    }
}

/// Assemble an immutable [`PoolState`] from the rows locked under
/// `FOR UPDATE` by [`crate::execution`]/[`crate::settlement`]. `is_exclusive`
/// and the NO->YES table are supplied by the caller, which already knows
/// whether this pool is event-scoped.
pub fn build_pool_state(
    market_id: i64,
    pool_id: i64,
    b: Decimal,
    fee_bps: i32,
    option_rows: &[OptionStateRow],
    is_exclusive: bool,
    no_to_yes_mapping: HashMap<i64, NoToYesEntry>,
) -> Result<PoolState> {
    let b_f64 = decimal_to_f64(b, "b")?;
    let mut option_ids = Vec::with_capacity(option_rows.len());
    let mut option_indexes = Vec::with_capacity(option_rows.len());
    let mut q = Vec::with_capacity(option_rows.len());
    for row in option_rows {
        option_ids.push(row.option_id);
        option_indexes.push(row.option_index);
        q.push(decimal_to_f64(row.q, "q")?);
    }
    Ok(PoolState {
        market_id,
        pool_id,
        b: b_f64,
        fee_bps,
        option_ids,
        option_indexes,
        q,
        is_exclusive,
        no_to_yes_mapping,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_to_f64_ok() {
        assert_eq!(decimal_to_f64(Decimal::new(1050, 2), "x").unwrap(), 10.5);
    }
}
