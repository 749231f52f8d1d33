use crate::modality::chat::Dialect;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid API key provided: {0}")]
    Unauthorized(String),

    #[error("No enabled route for model: {0}")]
    ModelNotRouted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Upstream error: {status} {body}")]
    Upstream { status: u16, body: String },

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::UpstreamTransport(e.to_string())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Validation(_) | AppError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ModelNotRouted(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            // 499 is the conventional "client closed request" code.
            AppError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::Translation(_)
            | AppError::Stream(_)
            | AppError::Database(_)
            | AppError::Migrate(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transport failures and upstream 5xx may be re-dispatched to a sibling route.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::UpstreamTransport(_) => true,
            AppError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// OpenAI-style `error.type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) | AppError::Validation(_) | AppError::Json(_) => {
                "invalid_request_error"
            }
            AppError::Unauthorized(_) => "invalid_api_key",
            AppError::ModelNotRouted(_) => "model_not_found",
            AppError::NotFound(_) => "not_found_error",
            AppError::UpstreamTransport(_) => "upstream_transport_error",
            AppError::Upstream { .. } => "upstream_error",
            AppError::Translation(_) => "translation_error",
            AppError::Stream(_) => "stream_error",
            AppError::Cancelled => "cancelled",
            AppError::Database(_) | AppError::Migrate(_) | AppError::Internal(_) => {
                "internal_error"
            }
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Migrate(_) => "Database error".into(),
            AppError::Unauthorized(_) => "Invalid API key provided".into(),
            _ => self.to_string(),
        }
    }

    pub fn for_dialect(self, dialect: Dialect) -> DialectError {
        DialectError {
            dialect,
            error: self,
        }
    }
}

/// Error body in the shape a client of `dialect` expects.
pub fn error_body(dialect: Dialect, status: StatusCode, kind: &str, message: &str) -> Value {
    match dialect {
        Dialect::Openai | Dialect::Cursor => json!({
            "error": {
                "message": message,
                "type": kind,
                "code": status.as_u16(),
            }
        }),
        Dialect::Claude => json!({
            "type": "error",
            "error": {
                "type": claude_error_type(status),
                "message": message,
            }
        }),
        Dialect::Gemini => json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": gemini_status(status),
            }
        }),
    }
}

fn claude_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn gemini_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

/// An [`AppError`] bound to the dialect of the endpoint that produced it.
#[derive(Debug)]
pub struct DialectError {
    pub dialect: Dialect,
    pub error: AppError,
}

impl From<DialectError> for AppError {
    fn from(e: DialectError) -> Self {
        e.error
    }
}

impl IntoResponse for DialectError {
    fn into_response(self) -> Response {
        let status = self.error.status();

        // Upstream client errors go back untouched.
        if let AppError::Upstream { body, .. } = &self.error {
            if serde_json::from_str::<Value>(body).is_ok() {
                return (
                    status,
                    [(header::CONTENT_TYPE, "application/json")],
                    body.clone(),
                )
                    .into_response();
            }
        }

        let body = error_body(
            self.dialect,
            status,
            self.error.kind(),
            &self.error.public_message(),
        );
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.for_dialect(Dialect::Openai).into_response()
    }
}
