pub mod isolate_pool;
pub mod metrics;

pub use isolate_pool::*;
pub use metrics::*;
