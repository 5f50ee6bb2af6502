//! # Calendar Worker
//!
//! Reminder delivery pipeline:
//!
//! ```text
//! EventStore ──list due──▶ Scheduler ──publish──▶ BrokerClient
//!     ▲                        │                      │
//!     └─────clear reminder─────┘                      ▼
//!                                         NotificationStorer ──▶ NotificationStore
//! ```
//!
//! The scheduler also sweeps events older than the retention horizon.
//! Delivery is at least once; the storer's insert-or-ignore keeps exactly one
//! notification per reminder.

pub mod config;
pub mod pipeline;
pub mod scheduler;
pub mod storer;

pub use config::{BrokerBackend, PipelineConfig, StorageBackend, WorkerRole};
pub use pipeline::Pipeline;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, TickReport};
pub use storer::NotificationStorer;
