pub mod config;
pub mod db;
pub mod error;
pub mod modality;
pub mod redact;
pub mod routing;
pub mod server;
pub mod telemetry;
