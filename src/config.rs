use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedConfig = Arc<RwLock<AppConfig>>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_path: Option<PathBuf>,
    pub local_api_key: String,

    pub redirect_enabled: bool,
    pub redirect_keyword: String,
    pub redirect_target_model: String,
    pub redirect_target_route_id: Option<i64>,

    // Desktop shell settings, carried for the UI.
    pub minimize_to_tray: bool,
    pub auto_start: bool,
    pub language: String,

    pub enable_file_log: bool,
    pub fallback_enabled: bool,
    pub traces_enabled: bool,
    pub traces_retention_days: u32,

    pub health_window: usize,
    pub health_skip_threshold: f64,
    pub fallback_depth: usize,
    pub log_fallback_attempts: bool,
    pub stream_idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub log_queue_capacity: usize,
    pub snippet_limit: usize,
    pub compaction_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5642,
            database_path: None,
            local_api_key: String::new(),
            redirect_enabled: false,
            redirect_keyword: "proxy_auto".to_string(),
            redirect_target_model: String::new(),
            redirect_target_route_id: None,
            minimize_to_tray: false,
            auto_start: false,
            language: "en".to_string(),
            enable_file_log: false,
            fallback_enabled: true,
            traces_enabled: false,
            traces_retention_days: 7,
            health_window: 50,
            health_skip_threshold: 0.2,
            fallback_depth: 2,
            log_fallback_attempts: false,
            stream_idle_timeout_secs: 120,
            request_timeout_secs: 600,
            connect_timeout_secs: 30,
            log_queue_capacity: 1024,
            snippet_limit: 4096,
            compaction_interval_secs: 3600,
        }
    }
}

/// Model-name redirection applied before route resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedirectConfig {
    pub enabled: bool,
    pub keyword: String,
    pub target_model: String,
    pub target_route_id: Option<i64>,
}

impl RedirectConfig {
    /// True when `model` is the redirect keyword and redirection is on.
    pub fn applies_to(&self, model: &str) -> bool {
        self.enabled && !self.keyword.is_empty() && model == self.keyword
    }
}

impl AppConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("modelbridge")
            .join("config.json")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("modelbridge")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("modelbridge.db"))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn redirect(&self) -> RedirectConfig {
        RedirectConfig {
            enabled: self.redirect_enabled,
            keyword: self.redirect_keyword.clone(),
            target_model: self.redirect_target_model.clone(),
            target_route_id: self.redirect_target_route_id,
        }
    }

    pub fn set_redirect(&mut self, redirect: RedirectConfig) {
        self.redirect_enabled = redirect.enabled;
        self.redirect_keyword = redirect.keyword;
        self.redirect_target_model = redirect.target_model;
        self.redirect_target_route_id = redirect.target_route_id;
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}
