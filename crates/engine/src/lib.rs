pub mod config;
pub mod engine;
pub mod metrics;
pub mod request;
pub mod runtime;

pub use config::{AuthConfig, BoxConfig, IngressLimits, KeyConfig, ServerConfig};
pub use engine::Sandbox;
pub use metrics::ExecutionMetrics;
pub use request::ExecuteRequest;
pub use runtime::ExecutionRuntime;
