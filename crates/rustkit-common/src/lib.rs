//! # RustKit Common
//!
//! Logging setup and retry utilities shared by the service worker cache
//! crates and their tools.

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, RetryConfig};
