/// Submit, status, cancel and resume
pub mod coordinator;
/// Single-operation execution with retries
pub mod executor;
/// Admission control
pub mod gate;
/// Prometheus metrics
pub mod metrics;
/// Job records and lifecycle
pub mod registry;
/// Retry decisions
pub mod retry;
/// Shared data types
pub mod types;

pub use coordinator::*;
pub use executor::*;
pub use gate::*;
pub use metrics::gather_metrics;
pub use registry::*;
pub use retry::*;
pub use types::*;
