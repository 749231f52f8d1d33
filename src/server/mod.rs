pub mod manage;
pub mod middleware;
pub mod passthrough;
pub mod proxy;
pub mod router;
pub mod upstream;

use crate::config::SharedConfig;
use crate::db::logs::LogWriter;
use crate::db::routes::RouteStore;
use crate::error::AppError;
use crate::routing::{HealthTracker, ModelRouter};
use middleware::Counters;
use sqlx::SqlitePool;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub db: SqlitePool,
    pub router: ModelRouter,
    pub logs: LogWriter,
    pub http: reqwest::Client,
    pub counters: Arc<Counters>,
}

impl AppState {
    pub async fn new(
        config: SharedConfig,
        db: SqlitePool,
        logs: LogWriter,
    ) -> Result<Self, AppError> {
        let (health_window, connect_timeout) = {
            let cfg = config.read().await;
            (cfg.health_window, cfg.connect_timeout_secs)
        };
        let health = Arc::new(HealthTracker::new(health_window));
        let router = ModelRouter::new(RouteStore::new(db.clone()), config.clone(), health);
        let http = upstream::build_client(Duration::from_secs(connect_timeout))?;

        Ok(Self {
            config,
            db,
            router,
            logs,
            http,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn store(&self) -> &RouteStore {
        self.router.store()
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        self.router.health()
    }
}

/// Bind the listening socket. Fails when the port is taken.
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    if let Ok(local) = listener.local_addr() {
        log::info!("Proxy listening on http://{}/api", local);
    }
    Ok(listener)
}

/// Serve until `shutdown` resolves, then drain in-flight connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router::create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
