//! Connection pool construction and transactional retry helpers.
//!
//! Every write path in [`crate::execution`] and [`crate::settlement`] runs
//! inside `with_serializable_tx!` so the declared lock order is the only
//! thing standing between concurrent trades and a serialization failure,
//! and a serialization failure here is retried, not surfaced to the caller.

use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Error as SqlxError, Executor, PgPool};
use tokio::time::sleep;
use tracing::{debug, info};

const MAX_RETRY_ATTEMPTS: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 10;

/// PostgreSQL SQLSTATE codes worth retrying.
/// Reference: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
mod pg_error_codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const ACTIVE_SQL_TRANSACTION: &str = "25001";
    pub const UNIQUE_VIOLATION: &str = "23505";
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("connecting to postgres");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| anyhow!("failed to connect to database: {e}"))?;
    info!("connected to database");
    Ok(pool)
}

/// Walks the error's source chain looking for the root `sqlx::Error` and
/// checks its SQLSTATE against the set of errors that are safe to retry
/// (serialization failure, deadlock, stale transaction state, or a unique
/// violation caused by two concurrent create-if-missing races).
pub fn is_retryable_error(error: &anyhow::Error) -> bool {
    let mut current: &dyn std::error::Error = error.as_ref();
    loop {
        if let Some(sqlx_error) = current.downcast_ref::<SqlxError>() {
            return match sqlx_error {
                SqlxError::Database(db_error) => {
                    if let Some(sqlstate) = db_error.code() {
                        let code = sqlstate.as_ref();
                        let retryable = matches!(
                            code,
                            pg_error_codes::SERIALIZATION_FAILURE
                                | pg_error_codes::DEADLOCK_DETECTED
                                | pg_error_codes::ACTIVE_SQL_TRANSACTION
                                | pg_error_codes::UNIQUE_VIOLATION
                        );
                        if retryable {
                            debug!(sqlstate = code, message = db_error.message(), "retryable database error");
                        }
                        retryable
                    } else {
                        false
                    }
                }
                _ => false,
            };
        }
        match current.source() {
            Some(source) => current = source,
            None => return false,
        }
    }
}

pub async fn sleep_backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..10);
    let delay_ms = BASE_RETRY_DELAY_MS * (1u64 << (attempt - 1).min(10)) + jitter;
    sleep(StdDuration::from_millis(delay_ms)).await;
}

pub const MAX_ATTEMPTS: u32 = MAX_RETRY_ATTEMPTS;

/// Run `$body` inside a SERIALIZABLE transaction, retrying on a retryable
/// SQLSTATE with exponential backoff + jitter. Used by every path that must
/// honor the strict lock order: buys, sells, and settlement.
#[macro_export]
macro_rules! with_serializable_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        let mut attempt = 1u32;
        loop {
            let mut $tx_var = $pool.begin().await?;
            $tx_var
                .execute(sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"))
                .await?;

            let result: anyhow::Result<_> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();
                    if $crate::db::is_retryable_error(&e) && attempt < $crate::db::MAX_ATTEMPTS {
                        $crate::db::sleep_backoff(attempt).await;
                        attempt += 1;
                        continue;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}
