//! In-memory implementation of EventStore and NotificationStore
//!
//! Decision: one reader/writer lock over both maps. An update replaces the
//! slot entry and the event inside a single write section.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::event::{Event, ListWindow, Notification, UserId};

/// Primary map plus the `(user_id, start_time)` slot index
///
/// Both maps are only ever mutated together under the write lock.
#[derive(Default)]
struct Index {
    events: HashMap<Uuid, Event>,
    slots: HashMap<(UserId, DateTime<Utc>), Uuid>,
}

/// In-memory implementation of EventStore
///
/// Reminder delivery is not tracked: an event is due whenever
/// `start_time - reminder` has elapsed, and `clear_reminder_time` is a no-op.
///
/// # Example
///
/// ```
/// use calendar_store::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryEventStore {
    index: RwLock<Index>,
    notifications: RwLock<HashMap<Uuid, Notification>>,
}

impl InMemoryEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            notifications: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of events
    pub fn len(&self) -> usize {
        self.index.read().events.len()
    }

    /// Whether the store holds no events
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of occupied (user, start time) slots
    pub fn slot_count(&self) -> usize {
        self.index.read().slots.len()
    }

    /// Get the number of stored notifications
    pub fn notification_count(&self) -> usize {
        self.notifications.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut index = self.index.write();
        index.events.clear();
        index.slots.clear();
        self.notifications.write().clear();
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create_event(&self, mut event: Event) -> Result<Uuid, StoreError> {
        check_span(&event)?;
        check_reminder(&event)?;

        let mut index = self.index.write();
        let slot = (event.user_id, event.start_time);
        if index.slots.contains_key(&slot) {
            return Err(StoreError::DateBusy {
                user_id: event.user_id,
                start_time: event.start_time,
            });
        }

        let id = Uuid::now_v7();
        event.id = id;
        index.slots.insert(slot, id);
        index.events.insert(id, event);

        debug!(%id, user_id = slot.0, "created event");
        Ok(id)
    }

    async fn update_event(&self, id: Uuid, event: Event) -> Result<(), StoreError> {
        check_ids(id, &event)?;

        let mut guard = self.index.write();
        let index = &mut *guard;

        let current = index
            .events
            .get(&id)
            .ok_or(StoreError::EventNotFound(id))?;
        if current.user_id != event.user_id {
            return Err(StoreError::UpdateUserId(id));
        }
        check_span(&event)?;
        check_reminder(&event)?;

        let new_slot = (event.user_id, event.start_time);
        if let Some(owner) = index.slots.get(&new_slot) {
            if *owner != id {
                return Err(StoreError::DateBusy {
                    user_id: event.user_id,
                    start_time: event.start_time,
                });
            }
        }
        let old_slot = (current.user_id, current.start_time);

        // All checks passed; swap the slot and the event in one critical section
        index.slots.remove(&old_slot);
        index.slots.insert(new_slot, id);
        index.events.insert(id, event);

        debug!(%id, "updated event");
        Ok(())
    }

    async fn delete_event(&self, id: Uuid) -> Result<(), StoreError> {
        let mut index = self.index.write();
        let event = index
            .events
            .remove(&id)
            .ok_or(StoreError::EventNotFound(id))?;
        index.slots.remove(&(event.user_id, event.start_time));

        debug!(%id, "deleted event");
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Event, StoreError> {
        self.index
            .read()
            .events
            .get(&id)
            .cloned()
            .ok_or(StoreError::EventNotFound(id))
    }

    async fn list_events(
        &self,
        window: ListWindow,
        start: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let end = window.end(start);
        let mut events: Vec<Event> = self
            .index
            .read()
            .events
            .values()
            .filter(|e| e.start_time >= start && e.start_time < end)
            .cloned()
            .collect();

        events.sort_by_key(|e| (e.start_time, e.id));
        Ok(events)
    }

    async fn list_events_reminder(&self) -> Result<Vec<Event>, StoreError> {
        let now = Utc::now();
        let mut events: Vec<Event> = self
            .index
            .read()
            .events
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();

        events.sort_by_key(|e| (e.start_time, e.id));
        Ok(events)
    }

    async fn clear_reminder_time(&self, _id: Uuid) -> Result<(), StoreError> {
        // Due-ness is derived from start_time and reminder on every scan
        Ok(())
    }

    async fn delete_events_before_date(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.index.write();
        let index = &mut *guard;

        let before = index.events.len();
        index.events.retain(|_, e| e.start_time >= cutoff);
        index.slots.retain(|(_, start), _| *start >= cutoff);
        let removed = (before - index.events.len()) as u64;

        if removed > 0 {
            debug!(removed, %cutoff, "deleted old events");
        }
        Ok(removed)
    }
}

#[async_trait]
impl NotificationStore for InMemoryEventStore {
    async fn save_notification(&self, notification: Notification) -> Result<bool, StoreError> {
        match self.notifications.write().entry(notification.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(notification);
                Ok(true)
            }
        }
    }

    async fn get_notification(&self, id: Uuid) -> Result<Notification, StoreError> {
        self.notifications
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotificationNotFound(id))
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, StoreError> {
        let mut notifications: Vec<Notification> =
            self.notifications.read().values().cloned().collect();
        notifications.sort_by_key(|n| (n.start_time, n.id));
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, h, m, 0).unwrap()
    }

    fn event1() -> Event {
        Event::new("title 1", 1, at(1, 11, 0), at(1, 11, 30)).with_description("description 1")
    }

    fn event2() -> Event {
        Event::new("title 2", 1, at(2, 11, 10), at(2, 12, 0)).with_description("description 2")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryEventStore::new();

        let id = store.create_event(event1()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.slot_count(), 1);

        let stored = store.get_event(id).await.unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.title, "title 1");
        assert_eq!(stored.description, "description 1");
    }

    #[tokio::test]
    async fn test_create_date_busy() {
        let store = InMemoryEventStore::new();
        store.create_event(event1()).await.unwrap();

        let result = store.create_event(event1()).await;
        assert!(matches!(result, Err(StoreError::DateBusy { user_id: 1, .. })));
        assert_eq!(store.len(), 1);

        // Same instant for another user is fine
        let mut other = event1();
        other.user_id = 2;
        store.create_event(other).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_create_invalid_stop_time() {
        let store = InMemoryEventStore::new();
        let mut event = event1();
        event.stop_time = at(1, 10, 0);

        let result = store.create_event(event).await;
        assert!(matches!(result, Err(StoreError::InvalidStopTime)));
        assert!(store.is_empty());
        assert_eq!(store.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_update_errors() {
        let store = InMemoryEventStore::new();
        let mut e1 = event1();
        e1.id = store.create_event(e1.clone()).await.unwrap();
        let mut e2 = event2();
        e2.id = store.create_event(e2.clone()).await.unwrap();

        // Unknown id
        let mut missing = e1.clone();
        missing.id = Uuid::now_v7();
        let result = store.update_event(missing.id, missing).await;
        assert!(matches!(result, Err(StoreError::EventNotFound(_))));

        // Path id differs from payload id
        let result = store.update_event(e2.id, e1.clone()).await;
        assert!(matches!(result, Err(StoreError::InvalidArguments { .. })));

        // Owner change
        let mut moved = e1.clone();
        moved.user_id = 777;
        let result = store.update_event(e1.id, moved).await;
        assert!(matches!(result, Err(StoreError::UpdateUserId(_))));

        // Stop before start
        let mut reversed = e1.clone();
        reversed.stop_time = at(1, 10, 0);
        let result = store.update_event(e1.id, reversed).await;
        assert!(matches!(result, Err(StoreError::InvalidStopTime)));

        // Moving onto e2's slot
        let mut clash = e1.clone();
        clash.start_time = e2.start_time;
        clash.stop_time = e2.stop_time;
        let result = store.update_event(e1.id, clash).await;
        assert!(matches!(result, Err(StoreError::DateBusy { .. })));

        // Nothing changed
        assert_eq!(store.get_event(e1.id).await.unwrap(), e1);
        assert_eq!(store.get_event(e2.id).await.unwrap(), e2);
        assert_eq!(store.slot_count(), 2);
    }

    #[tokio::test]
    async fn test_update_moves_slot() {
        let store = InMemoryEventStore::new();
        let mut e1 = event1();
        e1.id = store.create_event(e1.clone()).await.unwrap();
        let old_start = e1.start_time;

        // Keeping its own slot is not a conflict
        e1.title = "renamed".into();
        store.update_event(e1.id, e1.clone()).await.unwrap();

        e1.start_time = at(3, 9, 0);
        e1.stop_time = at(3, 10, 0);
        e1.reminder = Some(Duration::from_secs(600));
        store.update_event(e1.id, e1.clone()).await.unwrap();

        assert_eq!(store.get_event(e1.id).await.unwrap(), e1);
        assert_eq!(store.slot_count(), 1);

        // The old slot is free again
        store
            .create_event(Event::new("reuse", 1, old_start, old_start))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_windows() {
        let store = InMemoryEventStore::new();
        let id1 = store.create_event(event1()).await.unwrap();
        store.create_event(event2()).await.unwrap();

        let day = store.list_events_day(at(1, 11, 0)).await.unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].id, id1);

        let week = store.list_events_week(at(1, 11, 0)).await.unwrap();
        assert_eq!(week.len(), 2);
        assert!(week[0].start_time < week[1].start_time);

        let month = store.list_events_month(at(1, 11, 0)).await.unwrap();
        assert_eq!(month.len(), 2);

        // Window start is inclusive, events before it are excluded
        let later = store.list_events_week(at(1, 11, 1)).await.unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn test_list_reminder() {
        let store = InMemoryEventStore::new();
        store.create_event(event1()).await.unwrap();
        assert!(store.list_events_reminder().await.unwrap().is_empty());

        let now = Utc::now();
        let hours = chrono::Duration::hours;
        let due = Event::new("due", 5, now + hours(1), now + hours(2))
            .with_reminder(Duration::from_secs(2 * 3600));
        let not_yet = Event::new("later", 5, now + hours(3), now + hours(4))
            .with_reminder(Duration::from_secs(600));
        let due_id = store.create_event(due).await.unwrap();
        store.create_event(not_yet).await.unwrap();

        let listed = store.list_events_reminder().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due_id);

        // Clearing is a no-op for this backend
        store.clear_reminder_time(due_id).await.unwrap();
        assert_eq!(store.list_events_reminder().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryEventStore::new();
        let id1 = store.create_event(event1()).await.unwrap();
        let id2 = store.create_event(event2()).await.unwrap();

        let result = store.delete_event(Uuid::now_v7()).await;
        assert!(matches!(result, Err(StoreError::EventNotFound(_))));

        store.delete_event(id1).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.slot_count(), 1);
        assert!(matches!(
            store.get_event(id1).await,
            Err(StoreError::EventNotFound(_))
        ));
        assert!(store.get_event(id2).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_events_before_date() {
        let store = InMemoryEventStore::new();
        store.create_event(event1()).await.unwrap();
        let id2 = store.create_event(event2()).await.unwrap();

        let removed = store.delete_events_before_date(at(2, 0, 0)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.slot_count(), 1);
        assert!(store.get_event(id2).await.is_ok());

        // Cutoff is exclusive
        let removed = store.delete_events_before_date(at(2, 11, 10)).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_save_notification_is_idempotent() {
        let store = InMemoryEventStore::new();
        let notification = Notification {
            id: Uuid::now_v7(),
            title: "title 1".into(),
            start_time: at(1, 11, 0),
            user_id: 1,
        };

        assert!(store.save_notification(notification.clone()).await.unwrap());
        assert!(!store.save_notification(notification.clone()).await.unwrap());
        assert_eq!(store.notification_count(), 1);
        assert_eq!(
            store.get_notification(notification.id).await.unwrap(),
            notification
        );
        assert!(matches!(
            store.get_notification(Uuid::now_v7()).await,
            Err(StoreError::NotificationNotFound(_))
        ));
    }
}
