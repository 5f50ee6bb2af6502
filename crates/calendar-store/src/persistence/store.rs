//! EventStore and NotificationStore trait definitions

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event::{Event, ListWindow, Notification, UserId};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stop time precedes start time
    #[error("stop time must not be earlier than start time")]
    InvalidStopTime,

    /// The (user, start time) slot is taken by another event
    #[error("time {start_time} is reserved by another event of user {user_id}")]
    DateBusy {
        user_id: UserId,
        start_time: DateTime<Utc>,
    },

    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Path id and payload id disagree
    #[error("invalid arguments: id {id} does not match event id {event_id}")]
    InvalidArguments { id: Uuid, event_id: Uuid },

    /// Reminder offset too large to store as milliseconds
    #[error("reminder offset {0:?} is out of range")]
    InvalidReminder(Duration),

    /// Attempt to move an event to another owner
    #[error("cannot change user id of event {0}")]
    UpdateUserId(Uuid),

    /// Notification not found
    #[error("notification not found: {0}")]
    NotificationNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// HTTP status code the request layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidStopTime
            | Self::InvalidArguments { .. }
            | Self::UpdateUserId(_)
            | Self::InvalidReminder(_)
            | Self::DateBusy { .. } => 400,
            Self::EventNotFound(_) | Self::NotificationNotFound(_) => 404,
            Self::Database(_) => 500,
        }
    }

    /// Whether the error is a rejected request rather than an infrastructure failure
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

/// Reject events whose stop time precedes their start time
pub(crate) fn check_span(event: &Event) -> Result<(), StoreError> {
    if event.has_valid_span() {
        Ok(())
    } else {
        Err(StoreError::InvalidStopTime)
    }
}

/// Reminder offset in milliseconds, rejecting offsets that overflow `i64`
pub(crate) fn check_reminder(event: &Event) -> Result<Option<i64>, StoreError> {
    event
        .reminder
        .map(|d| i64::try_from(d.as_millis()).map_err(|_| StoreError::InvalidReminder(d)))
        .transpose()
}

/// Reject updates whose path id and payload id disagree
pub(crate) fn check_ids(id: Uuid, event: &Event) -> Result<(), StoreError> {
    if id == event.id {
        Ok(())
    } else {
        Err(StoreError::InvalidArguments {
            id,
            event_id: event.id,
        })
    }
}

/// Store for calendar events
///
/// Implementations must be thread-safe and support concurrent access. A
/// successful mutation is visible to every subsequent read on the same
/// instance. Operations are cancelled by dropping the returned future.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Create an event and return its freshly assigned id
    async fn create_event(&self, event: Event) -> Result<Uuid, StoreError>;

    /// Replace title, description, times and reminder of an existing event
    ///
    /// `user_id` must match the stored owner.
    async fn update_event(&self, id: Uuid, event: Event) -> Result<(), StoreError>;

    /// Delete an event
    async fn delete_event(&self, id: Uuid) -> Result<(), StoreError>;

    /// Get an event by id
    async fn get_event(&self, id: Uuid) -> Result<Event, StoreError>;

    /// List events starting inside `window` from `start`, ordered by start time
    async fn list_events(
        &self,
        window: ListWindow,
        start: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Events starting in `[start, start + 1 day)`
    async fn list_events_day(&self, start: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        self.list_events(ListWindow::Day, start).await
    }

    /// Events starting in `[start, start + 1 week)`
    async fn list_events_week(&self, start: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        self.list_events(ListWindow::Week, start).await
    }

    /// Events starting in `[start, start + 1 calendar month)`
    async fn list_events_month(&self, start: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        self.list_events(ListWindow::Month, start).await
    }

    /// Events whose reminder time has elapsed and has not been cleared
    async fn list_events_reminder(&self) -> Result<Vec<Event>, StoreError>;

    /// Mark an event's reminder as delivered
    ///
    /// Backends that keep no delivery flag treat this as a no-op.
    async fn clear_reminder_time(&self, id: Uuid) -> Result<(), StoreError>;

    /// Delete every event starting before `cutoff`, returning how many were removed
    async fn delete_events_before_date(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Store for delivered notifications
#[async_trait]
pub trait NotificationStore: Send + Sync + 'static {
    /// Insert a notification unless one with the same id exists
    ///
    /// Returns `true` if a new record was written.
    async fn save_notification(&self, notification: Notification) -> Result<bool, StoreError>;

    /// Get a notification by id
    async fn get_notification(&self, id: Uuid) -> Result<Notification, StoreError>;

    /// List stored notifications ordered by start time
    async fn list_notifications(&self) -> Result<Vec<Notification>, StoreError>;
}
