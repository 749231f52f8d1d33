use crate::error::AppError;
use serde::{de::DeserializeOwned, Serialize};

/// Parse a client request body; failures are the client's fault.
pub fn parse_request<T: DeserializeOwned>(data: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(data).map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Deserialize upstream JSON bytes, wrapping errors as AppError::Translation.
pub fn from_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(data).map_err(|e| AppError::Translation(e.to_string()))
}

/// Deserialize upstream JSON string, wrapping errors as AppError::Translation.
pub fn from_json_str<T: DeserializeOwned>(data: &str) -> Result<T, AppError> {
    serde_json::from_str(data).map_err(|e| AppError::Translation(e.to_string()))
}

/// Serialize value to JSON bytes, wrapping errors as AppError::Translation.
pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec(value).map_err(|e| AppError::Translation(e.to_string()))
}

/// Serialize value to JSON string, wrapping errors as AppError::Translation.
pub fn to_json_str<T: Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string(value).map_err(|e| AppError::Translation(e.to_string()))
}

/// Fresh id with a dialect-flavoured prefix (`chatcmpl-`, `msg_`, `call_`).
pub fn new_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Short random tool-call id for dialects that do not carry one.
pub fn new_call_id() -> String {
    use rand::distr::{Alphanumeric, SampleString};
    format!("call_{}", Alphanumeric.sample_string(&mut rand::rng(), 24))
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
