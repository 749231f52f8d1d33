//! Usage queries over raw request logs and the compacted aggregate tables.
//!
//! Buckets are UTC. Rows older than the retention window only exist in
//! `hourly_stats`/`daily_stats`, so series that reach that far back read both.

pub mod compaction;

use crate::db::models::StatBucket;
use crate::error::AppError;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

pub const DAY_FORMAT: &str = "%Y-%m-%d";
pub const HOUR_FORMAT: &str = "%Y-%m-%d %H:00";
pub const SECOND_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const AGGREGATE_COLUMNS: &str = "COUNT(*) AS request_count, \
     COALESCE(SUM(success), 0) AS success_count, \
     COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS fail_count, \
     COALESCE(SUM(request_tokens), 0) AS request_tokens, \
     COALESCE(SUM(response_tokens), 0) AS response_tokens, \
     COALESCE(SUM(total_tokens), 0) AS total_tokens";

const SUM_COLUMNS: &str = "COALESCE(SUM(request_count), 0) AS request_count, \
     COALESCE(SUM(success_count), 0) AS success_count, \
     COALESCE(SUM(fail_count), 0) AS fail_count, \
     COALESCE(SUM(request_tokens), 0) AS request_tokens, \
     COALESCE(SUM(response_tokens), 0) AS response_tokens, \
     COALESCE(SUM(total_tokens), 0) AS total_tokens";

#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub all_time: StatBucket,
    pub today: StatBucket,
    pub last_hour: StatBucket,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::days(1)).unwrap_or(now)
}

fn merge(into: &mut StatBucket, other: &StatBucket) {
    into.request_count += other.request_count;
    into.success_count += other.success_count;
    into.fail_count += other.fail_count;
    into.request_tokens += other.request_tokens;
    into.response_tokens += other.response_tokens;
    into.total_tokens += other.total_tokens;
}

async fn raw_since(db: &SqlitePool, label: &str, since_ms: i64) -> Result<StatBucket, AppError> {
    let sql = format!(
        "SELECT ? AS bucket, {} FROM request_logs WHERE created_at >= ?",
        AGGREGATE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StatBucket>(&sql)
        .bind(label)
        .bind(since_ms)
        .fetch_one(db)
        .await?)
}

/// Request and token totals for all time, today and the last hour.
pub async fn totals(db: &SqlitePool, now: DateTime<Utc>) -> Result<Totals, AppError> {
    let mut all_time = raw_since(db, "all", 0).await?;
    let compacted = sqlx::query_as::<_, StatBucket>(&format!(
        "SELECT 'all' AS bucket, {} FROM daily_stats",
        SUM_COLUMNS
    ))
    .fetch_one(db)
    .await?;
    merge(&mut all_time, &compacted);

    let midnight = start_of_day(now);
    let mut today = raw_since(db, "today", midnight.timestamp_millis()).await?;
    let compacted_today = sqlx::query_as::<_, StatBucket>(&format!(
        "SELECT 'today' AS bucket, {} FROM daily_stats WHERE day = ?",
        SUM_COLUMNS
    ))
    .bind(midnight.format(DAY_FORMAT).to_string())
    .fetch_one(db)
    .await?;
    merge(&mut today, &compacted_today);

    let last_hour = raw_since(
        db,
        "last_hour",
        (now - Duration::hours(1)).timestamp_millis(),
    )
    .await?;

    Ok(Totals {
        all_time,
        today,
        last_hour,
    })
}

/// One bucket per day for the last `days` days (today included), zero-filled.
pub async fn daily_series(
    db: &SqlitePool,
    days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<StatBucket>, AppError> {
    let days = days.clamp(1, 366) as i64;
    let first_day = start_of_day(now) - Duration::days(days - 1);

    let sql = format!(
        "SELECT bucket, {sums} FROM ( \
            SELECT strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') AS bucket, {agg} \
            FROM request_logs WHERE created_at >= ? GROUP BY bucket \
            UNION ALL \
            SELECT day AS bucket, request_count, success_count, fail_count, request_tokens, response_tokens, total_tokens \
            FROM daily_stats WHERE day >= ? \
         ) GROUP BY bucket ORDER BY bucket ASC",
        sums = SUM_COLUMNS,
        agg = AGGREGATE_COLUMNS
    );
    let rows = sqlx::query_as::<_, StatBucket>(&sql)
        .bind(first_day.timestamp_millis())
        .bind(first_day.format(DAY_FORMAT).to_string())
        .fetch_all(db)
        .await?;

    let labels = (0..days).map(|i| (first_day + Duration::days(i)).format(DAY_FORMAT).to_string());
    Ok(zero_fill(labels, rows))
}

/// One bucket per hour of the current UTC day up to now, zero-filled.
pub async fn hourly_series(db: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<StatBucket>, AppError> {
    let hours = (now - start_of_day(now)).num_hours() + 1;
    hourly_window(db, hours as u32, now).await
}

/// One bucket per hour for the last `hours` hours (the current hour
/// included), zero-filled. Compacted hours come from `hourly_stats`.
pub async fn hourly_window(
    db: &SqlitePool,
    hours: u32,
    now: DateTime<Utc>,
) -> Result<Vec<StatBucket>, AppError> {
    let hours = hours.clamp(1, 24 * 31) as i64;
    let first_hour = now.duration_trunc(Duration::hours(1)).unwrap_or(now) - Duration::hours(hours - 1);

    let sql = format!(
        "SELECT bucket, {sums} FROM ( \
            SELECT strftime('%Y-%m-%d %H:00', created_at / 1000, 'unixepoch') AS bucket, {agg} \
            FROM request_logs WHERE created_at >= ? GROUP BY bucket \
            UNION ALL \
            SELECT hour AS bucket, request_count, success_count, fail_count, request_tokens, response_tokens, total_tokens \
            FROM hourly_stats WHERE hour >= ? \
         ) GROUP BY bucket ORDER BY bucket ASC",
        sums = SUM_COLUMNS,
        agg = AGGREGATE_COLUMNS
    );
    let rows = sqlx::query_as::<_, StatBucket>(&sql)
        .bind(first_hour.timestamp_millis())
        .bind(first_hour.format(HOUR_FORMAT).to_string())
        .fetch_all(db)
        .await?;

    let labels = (0..hours).map(|h| (first_hour + Duration::hours(h)).format(HOUR_FORMAT).to_string());
    Ok(zero_fill(labels, rows))
}

/// Per-second buckets over the last `minutes` minutes. Sparse: seconds
/// without traffic are absent.
pub async fn second_series(
    db: &SqlitePool,
    minutes: u32,
    now: DateTime<Utc>,
) -> Result<Vec<StatBucket>, AppError> {
    let since = now - Duration::minutes(minutes.clamp(1, 60) as i64);
    let sql = format!(
        "SELECT strftime('%Y-%m-%d %H:%M:%S', created_at / 1000, 'unixepoch') AS bucket, {} \
         FROM request_logs WHERE created_at >= ? GROUP BY bucket ORDER BY bucket ASC",
        AGGREGATE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StatBucket>(&sql)
        .bind(since.timestamp_millis())
        .fetch_all(db)
        .await?)
}

/// Models ranked by request count over all time; `bucket` holds the model.
pub async fn top_models(db: &SqlitePool, limit: u32) -> Result<Vec<StatBucket>, AppError> {
    let sql = format!(
        "SELECT bucket, {sums} FROM ( \
            SELECT requested_model AS bucket, {agg} FROM request_logs GROUP BY requested_model \
            UNION ALL \
            SELECT model AS bucket, request_count, success_count, fail_count, request_tokens, response_tokens, total_tokens \
            FROM daily_stats \
         ) GROUP BY bucket ORDER BY request_count DESC, bucket ASC LIMIT ?",
        sums = SUM_COLUMNS,
        agg = AGGREGATE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StatBucket>(&sql)
        .bind(limit.clamp(1, 100) as i64)
        .fetch_all(db)
        .await?)
}

fn zero_fill(labels: impl Iterator<Item = String>, rows: Vec<StatBucket>) -> Vec<StatBucket> {
    let mut rows = rows.into_iter().peekable();
    labels
        .map(|label| {
            // skip rows before the window (e.g. clock skew on created_at)
            while rows.peek().is_some_and(|r| r.bucket < label) {
                rows.next();
            }
            match rows.peek() {
                Some(r) if r.bucket == label => rows.next().unwrap_or_default(),
                _ => StatBucket {
                    bucket: label,
                    ..Default::default()
                },
            }
        })
        .collect()
}
