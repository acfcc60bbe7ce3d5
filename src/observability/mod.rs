//! Logging setup and process metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{Counter, Gauge, HaMetrics, RpcMetrics};
