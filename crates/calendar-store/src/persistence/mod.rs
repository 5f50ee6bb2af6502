//! Persistence layer for calendar events
//!
//! This module provides:
//! - [`EventStore`] and [`NotificationStore`] traits
//! - [`InMemoryEventStore`] for single-process use and tests
//! - [`PostgresEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{EventStore, NotificationStore, StoreError};
