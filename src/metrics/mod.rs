//! Prometheus metrics.
//!
//! # Example
//!
//! ```ignore
//! use opportunity_forge::metrics::{init_metrics, export_metrics, record_transition};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! record_transition("advanced");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    record_backpressure, record_proof_append, record_task_outcome, record_transition,
    set_busy_agents,
};
pub use self::prometheus::{export_metrics, init_metrics, metrics, metrics_handler, Metrics};
