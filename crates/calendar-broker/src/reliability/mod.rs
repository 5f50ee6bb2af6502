//! Reliability patterns for the broker client
//!
//! - [`RetryPolicy`] - Exponential backoff with jitter for reconnects

mod retry;

pub use retry::RetryPolicy;
