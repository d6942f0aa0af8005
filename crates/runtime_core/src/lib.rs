//! Shared vocabulary for the box sandbox service.
//!
//! Everything that crosses a crate boundary lives here: the error taxonomy,
//! the params bag, the report a runtime hands back after a run, the limits a
//! runtime enforces, and the outbound network policy.

pub mod env;
pub mod error;
pub mod job;
pub mod limits;
pub mod net_policy;
pub mod params;

pub use error::{BoxError, ErrorKind};
pub use job::{ExecutionMeta, ExecutionResult, JobCounters, RunError, RunOutput};
pub use limits::SandboxLimits;
pub use params::Params;
