use crate::config::SharedConfig;
use crate::error::AppError;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UPSERT_COUNTERS: &str = "request_count = request_count + excluded.request_count, \
     success_count = success_count + excluded.success_count, \
     fail_count = fail_count + excluded.fail_count, \
     request_tokens = request_tokens + excluded.request_tokens, \
     response_tokens = response_tokens + excluded.response_tokens, \
     total_tokens = total_tokens + excluded.total_tokens";

const SELECT_COUNTERS: &str = "COUNT(*), \
     COALESCE(SUM(success), 0), \
     COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0), \
     COALESCE(SUM(request_tokens), 0), \
     COALESCE(SUM(response_tokens), 0), \
     COALESCE(SUM(total_tokens), 0)";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionReport {
    /// Raw request log rows folded into the aggregates and deleted.
    pub compacted_rows: u64,
    /// Unix milliseconds; rows created before this were compacted.
    pub cutoff: i64,
}

/// Fold request logs older than `retention_days` into `hourly_stats` and
/// `daily_stats`, then delete them, in one transaction. Retention is at
/// least one day so today's totals always come from raw rows.
pub async fn compact(
    db: &SqlitePool,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<CompactionReport, AppError> {
    let cutoff = (now - Duration::days(retention_days.max(1) as i64)).timestamp_millis();
    let mut tx = db.begin().await?;

    let hourly = format!(
        "INSERT INTO hourly_stats (hour, model, request_count, success_count, fail_count, request_tokens, response_tokens, total_tokens) \
         SELECT strftime('%Y-%m-%d %H:00', created_at / 1000, 'unixepoch') AS bucket, requested_model, {} \
         FROM request_logs WHERE created_at < ? GROUP BY bucket, requested_model \
         ON CONFLICT(hour, model) DO UPDATE SET {}",
        SELECT_COUNTERS, UPSERT_COUNTERS
    );
    sqlx::query(&hourly).bind(cutoff).execute(&mut *tx).await?;

    let daily = format!(
        "INSERT INTO daily_stats (day, model, request_count, success_count, fail_count, request_tokens, response_tokens, total_tokens) \
         SELECT strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') AS bucket, requested_model, {} \
         FROM request_logs WHERE created_at < ? GROUP BY bucket, requested_model \
         ON CONFLICT(day, model) DO UPDATE SET {}",
        SELECT_COUNTERS, UPSERT_COUNTERS
    );
    sqlx::query(&daily).bind(cutoff).execute(&mut *tx).await?;

    let deleted = sqlx::query("DELETE FROM request_logs WHERE created_at < ?")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    if deleted > 0 {
        log::info!("Compacted {} request logs older than {} days", deleted, retention_days.max(1));
    }
    Ok(CompactionReport {
        compacted_rows: deleted,
        cutoff,
    })
}

/// Run [`compact`] every `compaction_interval_secs` until `token` is cancelled.
pub fn spawn(db: SqlitePool, config: SharedConfig, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let secs = config.read().await.compaction_interval_secs.max(60);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let retention = config.read().await.traces_retention_days;
                    if let Err(e) = compact(&db, retention, Utc::now()).await {
                        log::error!("Request log compaction failed: {}", e);
                    }
                }
            }
        }
        log::debug!("Compaction task stopped");
    })
}
