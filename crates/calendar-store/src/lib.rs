//! # Calendar Event Store
//!
//! Event repository with time-range queries and reminder discovery, plus the
//! notification table written by the reminder pipeline.
//!
//! ## Invariants
//!
//! - `stop_time >= start_time` on create and update
//! - At most one event per `(user_id, start_time)`
//! - `user_id` never changes after creation
//!
//! ## Backends
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │     InMemoryEventStore       │   │     PostgresEventStore       │
//! │  RwLock { events, slots }    │   │  UNIQUE (start_time, user_id)│
//! │  reminder derived per scan   │   │  stored reminder_time column │
//! └──────────────────────────────┘   └──────────────────────────────┘
//!                 ▲                                 ▲
//!                 └────────── EventStore ───────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use calendar_store::{Event, EventStore, InMemoryEventStore};
//! use chrono::{Duration, Utc};
//!
//! async fn demo() -> Result<(), calendar_store::StoreError> {
//!     let store = InMemoryEventStore::new();
//!     let start = Utc::now() + Duration::hours(1);
//!     let id = store
//!         .create_event(Event::new("Dentist", 7, start, start + Duration::minutes(30)))
//!         .await?;
//!     assert_eq!(store.get_event(id).await?.title, "Dentist");
//!     Ok(())
//! }
//! ```

pub mod event;
pub mod persistence;

/// Prelude for common imports
pub mod prelude {
    pub use crate::event::{Event, ListWindow, Notification, UserId};
    pub use crate::persistence::{
        EventStore, InMemoryEventStore, NotificationStore, PostgresEventStore, StoreError,
    };
}

// Re-export key types at crate root
pub use event::{Event, ListWindow, Notification, UserId};
pub use persistence::{
    EventStore, InMemoryEventStore, NotificationStore, PostgresEventStore, StoreError,
};
