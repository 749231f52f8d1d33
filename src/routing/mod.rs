pub mod health;
pub mod router;

pub use health::{HealthReport, HealthSample, HealthTracker};
pub use router::{next_fallback, ModelRouter, RouteDecision};
