//! # Calendar Broker
//!
//! Publish/subscribe hand-off between the reminder scheduler and the
//! notification storer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ publish  ┌───────────────────────────────┐
//! │ BrokerClient │────────▶ │        LogConnection          │
//! │              │          │  topic ─ partition 0: [0,1,2] │
//! │  consumers   │◀──────── │        ─ partition 1: [0,1]   │
//! └──────────────┘  fetch / │  offsets per consumer group   │
//!                   commit  └───────────────────────────────┘
//!                                 MemoryLog | PostgresLog
//! ```
//!
//! A message is delivered at least once to every consumer group subscribed
//! to its topic. Handlers decide the fate of a message they cannot process
//! by returning [`HandlerError::Retry`] or [`HandlerError::Discard`].

pub mod client;
pub mod error;
pub mod log;
pub mod message;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{BrokerClient, BrokerConfig, MessageHandler};
    pub use crate::error::{BrokerError, HandlerError};
    pub use crate::log::{LogConnection, LogConnector, MemoryLog, PostgresLog};
    pub use crate::message::{Message, Record};
    pub use crate::reliability::RetryPolicy;
}

pub use client::{BrokerClient, BrokerConfig, MessageHandler};
pub use error::{BrokerError, HandlerError};
pub use log::{LogConnection, LogConnector, MemoryLog, PostgresLog, DEFAULT_RETAINED_RECORDS};
pub use message::{Message, Record};
pub use reliability::RetryPolicy;
