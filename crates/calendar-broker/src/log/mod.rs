//! Partitioned log backends
//!
//! A topic is split into a fixed number of partitions. Each consumer group
//! keeps one committed offset per partition; fetching returns the first
//! uncommitted record of every partition, so a record that is never
//! committed keeps being returned until it is.
//!
//! Partitions are capped: once a partition holds more than its retention
//! limit, the oldest records are dropped. Offsets are never reused.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::message::{Message, Record};

pub use memory::MemoryLog;
pub use postgres::PostgresLog;

/// Records kept per partition unless configured otherwise
pub const DEFAULT_RETAINED_RECORDS: usize = 10_000;

/// Establishes connections to a log
#[async_trait]
pub trait LogConnector: Send + Sync + 'static {
    /// Open a connection, failing with [`BrokerError::Unavailable`] if the log is down
    async fn connect(&self) -> Result<Arc<dyn LogConnection>, BrokerError>;
}

/// An open connection to a log
#[async_trait]
pub trait LogConnection: Send + Sync + 'static {
    /// Append a message and return its position
    async fn append(&self, topic: &str, message: Message) -> Result<Record, BrokerError>;

    /// Next uncommitted record per partition for `group`, at most `max` records
    async fn fetch(&self, topic: &str, group: &str, max: usize) -> Result<Vec<Record>, BrokerError>;

    /// Move `group`'s position in `partition` to `next_offset`
    ///
    /// Offsets only move forward; committing an older offset is a no-op.
    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError>;
}
