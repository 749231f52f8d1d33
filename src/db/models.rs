use crate::modality::chat::Dialect;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub model: String,
    pub api_url: String,
    pub api_key: String,
    #[serde(rename = "group")]
    pub group_name: String,
    pub dialect: Dialect,
    pub enabled: bool,
    pub pass_client_model: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Route {
    /// Copy with the api key reduced to a recognisable prefix, for display.
    pub fn masked(&self) -> Self {
        let mut route = self.clone();
        route.api_key = mask_key(&self.api_key);
        route
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_name.is_empty()
    }
}

pub(crate) fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let prefix: String = key.chars().take(4).collect();
    format!("{}****", prefix)
}

/// Operator input for creating (`id: None`) or replacing a route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteInput {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub model: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub group: Option<String>,
    pub dialect: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pass_client_model: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequestLog {
    pub id: i64,
    /// Unix milliseconds.
    pub created_at: i64,
    pub remote_ip: Option<String>,
    pub source_dialect: String,
    pub requested_model: String,
    pub resolved_route_id: Option<i64>,
    pub provider_model: Option<String>,
    pub is_stream: bool,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
    pub proxy_time_ms: i64,
    pub success: bool,
    pub http_status: i64,
    pub error_message: Option<String>,
    pub request_body_snippet: Option<String>,
    pub response_body_snippet: Option<String>,
}

/// One aggregate bucket (an hour, a day, a second or a model).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatBucket {
    pub bucket: String,
    pub request_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize)]
pub struct PaginatedResult<T: Serialize> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}
