//! Immutable pool-state snapshot and option-selector resolution.
//!
//! `PoolState` is assembled once from locked rows (see
//! [`crate::db_adapter`]) and never mutated; Quote and LMSR consume it by
//! reference.

use std::collections::HashMap;

use thiserror::Error;

/// Either branch a caller may use to name an outcome: a single selector
/// value carrying either an id or an index.
#[derive(Debug, Clone, Copy)]
pub enum OptionSelector {
    Id(i64),
    Index(i32),
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("option selector did not resolve to any outcome in this pool")]
    OptionNotFound,
    #[error("pool has no outcome states loaded")]
    EmptyPool,
    #[error("NO->YES mapping for option {no_option_id} points at pool index {claimed_index}, but that index does not match the pool's option {yes_option_id}")]
    CorruptMapping {
        no_option_id: i64,
        claimed_index: i32,
        yes_option_id: i64,
    },
}

/// A single entry in the NO->YES mapping table populated once when
/// `PoolState` is loaded for an exclusive event.
#[derive(Debug, Clone, Copy)]
pub struct NoToYesEntry {
    pub yes_option_id: i64,
    pub pool_idx: usize,
}

/// Immutable snapshot of one AMM pool's pricing state, assembled under lock.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub market_id: i64,
    pub pool_id: i64,
    pub b: f64,
    pub fee_bps: i32,
    /// Outcome ids, parallel to `option_indexes` and `q`.
    pub option_ids: Vec<i64>,
    pub option_indexes: Vec<i32>,
    pub q: Vec<f64>,
    pub is_exclusive: bool,
    /// Populated only for exclusive-event pools: no_option_id -> (yes_option_id, pool_idx).
    pub no_to_yes_mapping: HashMap<i64, NoToYesEntry>,
}

impl PoolState {
    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    fn index_of_id(&self, id: i64) -> Option<usize> {
        self.option_ids.iter().position(|&x| x == id)
    }

    fn index_of_option_index(&self, idx: i32) -> Option<usize> {
        self.option_indexes.iter().position(|&x| x == idx)
    }

    /// Resolve a selector to a pool-local index plus whether it is a
    /// NO-side synthetic identity (only possible for exclusive events).
    ///
    /// `option_id` resolves directly if present; otherwise, for exclusive
    /// pools, it is looked up in the NO->YES mapping and the mapping is
    /// re-validated against the pool's current index for that YES option
    /// (detects NO->YES mapping corruption).
    pub fn resolve_with_side(&self, selector: OptionSelector) -> Result<(usize, bool), StateError> {
        if self.is_empty() {
            return Err(StateError::EmptyPool);
        }
        match selector {
            OptionSelector::Index(idx) => {
                let pool_idx = self
                    .index_of_option_index(idx)
                    .ok_or(StateError::OptionNotFound)?;
                Ok((pool_idx, false))
            }
            OptionSelector::Id(id) => {
                if let Some(pool_idx) = self.index_of_id(id) {
                    return Ok((pool_idx, false));
                }
                if self.is_exclusive {
                    if let Some(entry) = self.no_to_yes_mapping.get(&id) {
                        let actual_idx = self
                            .index_of_id(entry.yes_option_id)
                            .ok_or(StateError::CorruptMapping {
                                no_option_id: id,
                                claimed_index: entry.pool_idx as i32,
                                yes_option_id: entry.yes_option_id,
                            })?;
                        if actual_idx != entry.pool_idx {
                            return Err(StateError::CorruptMapping {
                                no_option_id: id,
                                claimed_index: entry.pool_idx as i32,
                                yes_option_id: entry.yes_option_id,
                            });
                        }
                        return Ok((actual_idx, true));
                    }
                }
                Err(StateError::OptionNotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PoolState {
        PoolState {
            market_id: 1,
            pool_id: 10,
            b: 100.0,
            fee_bps: 200,
            option_ids: vec![1, 2],
            option_indexes: vec![0, 1],
            q: vec![0.0, 0.0],
            is_exclusive: false,
            no_to_yes_mapping: HashMap::new(),
        }
    }

    #[test]
    fn resolves_by_index() {
        let s = sample_state();
        assert_eq!(s.resolve_with_side(OptionSelector::Index(1)).unwrap(), (1, false));
    }

    #[test]
    fn resolves_by_id() {
        let s = sample_state();
        assert_eq!(s.resolve_with_side(OptionSelector::Id(2)).unwrap(), (1, false));
    }

    #[test]
    fn exclusive_no_side_resolves_through_mapping() {
        let mut s = sample_state();
        s.is_exclusive = true;
        s.no_to_yes_mapping.insert(99, NoToYesEntry { yes_option_id: 2, pool_idx: 1 });
        assert_eq!(s.resolve_with_side(OptionSelector::Id(99)).unwrap(), (1, true));
    }

    #[test]
    fn corrupt_mapping_detected() {
        let mut s = sample_state();
        s.is_exclusive = true;
        s.no_to_yes_mapping.insert(99, NoToYesEntry { yes_option_id: 2, pool_idx: 0 });
        assert!(matches!(
            s.resolve_with_side(OptionSelector::Id(99)),
            Err(StateError::CorruptMapping { .. })
        ));
    }

    #[test]
    fn unknown_selector_not_found() {
        let s = sample_state();
        assert_eq!(s.resolve_with_side(OptionSelector::Id(999)), Err(StateError::OptionNotFound));
    }
}
