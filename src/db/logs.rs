use super::models::{PaginatedResult, RequestLog};
use crate::error::AppError;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const BATCH_SIZE: usize = 64;

enum LogCommand {
    Append(Box<RequestLog>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the single request-log writer task.
///
/// Appends never block the proxy path: when the queue is full the record is
/// dropped and counted.
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<LogCommand>,
    dropped: Arc<AtomicU64>,
}

impl LogWriter {
    pub fn spawn(db: SqlitePool, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(db, rx));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    pub fn append(&self, entry: RequestLog) {
        if let Err(e) = self.tx.try_send(LogCommand::Append(Box::new(entry))) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!("Request log queue full, dropped record ({} total)", dropped)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::warn!("Request log writer stopped, dropped record ({} total)", dropped)
                }
            }
        }
    }

    /// Wait until everything queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<LogCommand>) {
    let mut commands = Vec::with_capacity(BATCH_SIZE);
    loop {
        if rx.recv_many(&mut commands, BATCH_SIZE).await == 0 {
            break;
        }

        let mut batch = Vec::with_capacity(commands.len());
        let mut waiters = Vec::new();
        for command in commands.drain(..) {
            match command {
                LogCommand::Append(entry) => batch.push(*entry),
                LogCommand::Flush(done) => waiters.push(done),
            }
        }

        if !batch.is_empty() {
            if let Err(e) = insert_batch(&db, &batch).await {
                log::error!("Failed to write {} request logs: {}", batch.len(), e);
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
    log::debug!("Request log writer stopped");
}

async fn insert_batch(db: &SqlitePool, batch: &[RequestLog]) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    for entry in batch {
        sqlx::query(
            "INSERT INTO request_logs (created_at, remote_ip, source_dialect, requested_model, resolved_route_id, provider_model, is_stream, request_tokens, response_tokens, total_tokens, proxy_time_ms, success, http_status, error_message, request_body_snippet, response_body_snippet) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.created_at)
        .bind(&entry.remote_ip)
        .bind(&entry.source_dialect)
        .bind(&entry.requested_model)
        .bind(entry.resolved_route_id)
        .bind(&entry.provider_model)
        .bind(entry.is_stream)
        .bind(entry.request_tokens)
        .bind(entry.response_tokens)
        .bind(entry.total_tokens)
        .bind(entry.proxy_time_ms)
        .bind(entry.success)
        .bind(entry.http_status)
        .bind(&entry.error_message)
        .bind(&entry.request_body_snippet)
        .bind(&entry.response_body_snippet)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LogQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub model: Option<String>,
    /// Source dialect of the request.
    pub style: Option<String>,
    pub success: Option<bool>,
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a LogQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(model) = query.model.as_deref().filter(|m| !m.is_empty()) {
        builder
            .push(" AND (requested_model = ")
            .push_bind(model)
            .push(" OR provider_model = ")
            .push_bind(model)
            .push(")");
    }
    if let Some(style) = query.style.as_deref().filter(|s| !s.is_empty()) {
        builder.push(" AND source_dialect = ").push_bind(style);
    }
    if let Some(success) = query.success {
        builder.push(" AND success = ").push_bind(success);
    }
}

pub async fn list_logs(
    db: &SqlitePool,
    query: &LogQuery,
) -> Result<PaginatedResult<RequestLog>, AppError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 500);

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM request_logs");
    push_filters(&mut count, query);
    let total = count.build_query_scalar::<i64>().fetch_one(db).await?;

    let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM request_logs");
    push_filters(&mut select, query);
    select
        .push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind((page - 1) * page_size);
    let items = select.build_query_as::<RequestLog>().fetch_all(db).await?;

    Ok(PaginatedResult {
        items,
        total,
        page,
        page_size,
    })
}
