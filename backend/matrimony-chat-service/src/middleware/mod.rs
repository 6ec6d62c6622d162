pub mod error_handling;
pub mod guards;
pub mod metrics;

pub use metrics::MetricsMiddleware;
