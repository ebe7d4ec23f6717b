//! Reliability patterns for durable execution
//!
//! - [`RetryPolicy`] - invocation-level retry with exponential backoff

mod retry;

pub use retry::RetryPolicy;
