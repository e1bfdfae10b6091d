//! Price-series bucket emission.
//!
//! Best-effort: failures here are logged and swallowed by the caller, never
//! propagated into the trade transaction's error path.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::warn;

/// Round `now` down to a `bucket_seconds`-wide bucket boundary.
pub fn bucket_start(now: DateTime<Utc>, bucket_seconds: i64) -> DateTime<Utc> {
    let epoch = now.timestamp();
    let bucketed = epoch - epoch.rem_euclid(bucket_seconds);
    DateTime::from_timestamp(bucketed, 0).unwrap_or(now)
}

/// Upsert one `(option, interval, bucket_start)` point with the current
/// YES-side probability in bps. `option_id` must be the YES option whose
/// probability is being recorded.
pub async fn record_price_point(
    tx: &mut Transaction<'_, Postgres>,
    option_id: i64,
    interval_tag: &str,
    bucket_start: DateTime<Utc>,
    prob_bps: i32,
) {
    let result = sqlx::query(
        "INSERT INTO market_option_series (option_id, interval_tag, bucket_start, prob_bps)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (option_id, interval_tag, bucket_start)
         DO UPDATE SET prob_bps = EXCLUDED.prob_bps",
    )
    .bind(option_id)
    .bind(interval_tag)
    .bind(bucket_start)
    .bind(prob_bps)
    .execute(&mut **tx)
    .await;

    if let Err(e) = result {
        warn!(option_id, interval_tag, error = %e, "price series upsert failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn buckets_round_down_to_five_seconds() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 37).unwrap();
        let b = bucket_start(t, 5);
        assert_eq!(b.timestamp() % 5, 0);
        assert!(b <= t);
    }
}
