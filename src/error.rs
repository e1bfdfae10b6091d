//! Shared error taxonomy.
//!
//! Five kinds, each with a stable machine code and an HTTP-status hint.
//! Quote and LMSR errors are pure (no side effects survive them); Execution
//! and Settlement wrap a transaction, so any `EngineError` triggers a
//! rollback of every write made so far.

use std::fmt;

use crate::lmsr::LmsrError;
use crate::money::MoneyError;
use crate::state::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    State,
    NotFound,
    Math,
    Funding,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Input => 400,
            ErrorKind::State => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Math => 422,
            ErrorKind::Funding => 400,
        }
    }
}

/// A typed engine error: a stable machine `code`, the `kind` that derives
/// its HTTP status, and a human `message`.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(code: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { code, kind, message: message.into() }
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind.http_status(), self.message)
    }
}

impl std::error::Error for EngineError {}

macro_rules! engine_error_ctor {
    ($fn_name:ident, $code:literal, $kind:expr) => {
        pub fn $fn_name(message: impl Into<String>) -> EngineError {
            EngineError::new($code, $kind, message)
        }
    };
}

// Execution Engine codes.
engine_error_ctor!(market_not_found, "MARKET_NOT_FOUND", ErrorKind::NotFound);
engine_error_ctor!(market_not_active, "MARKET_NOT_ACTIVE", ErrorKind::State);
engine_error_ctor!(market_closed, "MARKET_CLOSED", ErrorKind::State);
engine_error_ctor!(event_not_active, "EVENT_NOT_ACTIVE", ErrorKind::State);
engine_error_ctor!(option_not_found, "OPTION_NOT_FOUND", ErrorKind::NotFound);
engine_error_ctor!(option_not_active, "OPTION_NOT_ACTIVE", ErrorKind::State);
engine_error_ctor!(pool_not_found, "POOL_NOT_FOUND", ErrorKind::NotFound);
engine_error_ctor!(pool_invalid, "POOL_INVALID", ErrorKind::State);
engine_error_ctor!(pool_mapping_error, "POOL_MAPPING_ERROR", ErrorKind::Math);
engine_error_ctor!(pool_mismatch, "POOL_MISMATCH", ErrorKind::State);
engine_error_ctor!(insufficient_balance, "INSUFFICIENT_BALANCE", ErrorKind::State);
engine_error_ctor!(no_position, "NO_POSITION", ErrorKind::State);
engine_error_ctor!(insufficient_shares, "INSUFFICIENT_SHARES", ErrorKind::State);
engine_error_ctor!(amount_too_low, "AMOUNT_TOO_LOW", ErrorKind::Math);
engine_error_ctor!(slippage_protection, "SLIPPAGE_PROTECTION", ErrorKind::State);
engine_error_ctor!(quote_math_error, "QUOTE_MATH_ERROR", ErrorKind::Math);
engine_error_ctor!(invalid_param, "INVALID_PARAM", ErrorKind::Input);
engine_error_ctor!(wallet_not_found, "WALLET_NOT_FOUND", ErrorKind::NotFound);

// Settlement Engine codes.
engine_error_ctor!(insufficient_funds, "INSUFFICIENT_FUNDS", ErrorKind::Funding);
engine_error_ctor!(degenerate_pool_state, "DEGENERATE_POOL_STATE", ErrorKind::Math);
engine_error_ctor!(market_not_resolved, "MARKET_NOT_RESOLVED", ErrorKind::State);
engine_error_ctor!(market_not_settleable, "MARKET_NOT_SETTLEABLE", ErrorKind::State);
engine_error_ctor!(partial_settlement_invalid, "PARTIAL_SETTLEMENT_INVALID", ErrorKind::State);

impl From<LmsrError> for EngineError {
    fn from(e: LmsrError) -> Self {
        match e {
            LmsrError::PayoutExceedsMax { .. } => quote_math_error(e.to_string()),
            LmsrError::NonFinite => quote_math_error(e.to_string()),
            LmsrError::IndexOutOfRange { .. } => invalid_param(e.to_string()),
            LmsrError::TooFewOutcomes(_) => pool_invalid(e.to_string()),
            LmsrError::NonPositiveB(_) | LmsrError::NonPositiveAmount(_) => {
                invalid_param(e.to_string())
            }
        }
    }
}

impl From<MoneyError> for EngineError {
    fn from(e: MoneyError) -> Self {
        invalid_param(e.to_string())
    }
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::OptionNotFound => option_not_found(e.to_string()),
            StateError::EmptyPool => pool_invalid(e.to_string()),
            StateError::CorruptMapping { .. } => pool_mapping_error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(market_not_found("x").http_status(), 404);
        assert_eq!(insufficient_funds("x").http_status(), 400);
        assert_eq!(quote_math_error("x").http_status(), 422);
    }
}
