use clap::Parser;
use modelbridge::config::AppConfig;
use modelbridge::db::{self, logs::LogWriter};
use modelbridge::server::{self, AppState};
use modelbridge::telemetry::compaction;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "modelbridge", version, about = "Local multi-dialect LLM API proxy")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,
}

fn init_logging(file_log: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if file_log {
        let dir = AppConfig::data_dir();
        let path = dir.join("modelbridge.log");
        let file = std::fs::create_dir_all(&dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match file {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open {}: {}, logging to stderr", path.display(), e),
        }
    }
    builder.init();
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        return;
    }
    log::info!("Shutting down");
    token.cancel();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(AppConfig::default_config_path);

    let mut config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    init_logging(config.enable_file_log);

    let listener = match server::bind(&config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Cannot listen on {}: {}", config.listen_addr(), e);
            return ExitCode::from(1);
        }
    };

    let pool = match db::init_pool(&config.database_path()).await {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Cannot open database {}: {}", config.database_path().display(), e);
            return ExitCode::from(2);
        }
    };

    let (logs, writer) = LogWriter::spawn(pool.clone(), config.log_queue_capacity);
    let config = config.into_shared();
    let state = match AppState::new(config.clone(), pool.clone(), logs.clone()).await {
        Ok(state) => state,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let token = CancellationToken::new();
    let compactor = compaction::spawn(pool.clone(), config, token.clone());

    let shutdown = shutdown_signal(token.clone());
    if let Err(e) = server::serve(listener, state, shutdown).await {
        log::error!("Server error: {}", e);
    }

    token.cancel();
    logs.flush().await;
    drop(logs);
    let _ = compactor.await;
    // the writer exits once every handle is gone
    if tokio::time::timeout(std::time::Duration::from_secs(5), writer)
        .await
        .is_err()
    {
        log::warn!("Request log writer did not stop in time");
    }
    pool.close().await;
    ExitCode::SUCCESS
}
