//! Retry helpers for calls that cross a process boundary.
//!
//! Store writes and outbound notification calls both go through
//! [`with_retry_if`], which retries only the failures the caller classifies as
//! transient and bounds each attempt with an optional timeout.
//!
//! ```rust,no_run
//! use resilience::{with_retry_if, RetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = with_retry_if(
//!         RetryConfig::store(),
//!         |e: &String| e.starts_with("transient"),
//!         || async { Ok::<_, String>(()) },
//!     )
//!     .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod retry;

pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
