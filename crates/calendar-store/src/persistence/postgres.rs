//! PostgreSQL implementation of EventStore and NotificationStore
//!
//! Production persistence with:
//! - Slot uniqueness enforced by the `(start_time, user_id)` constraint
//! - A stored, indexed `reminder_time` column so delivery survives restarts
//! - Insert-or-ignore notification writes for redelivered messages

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::event::{Event, ListWindow, Notification};

const EVENT_COLUMNS: &str =
    "id, title, description, start_time, stop_time, user_id, reminder_ms";

/// PostgreSQL implementation of EventStore
///
/// There is no process-local lock: concurrent writers are serialized by the
/// database (unique constraint for creates, row lock for updates).
///
/// # Example
///
/// ```ignore
/// use calendar_store::PostgresEventStore;
///
/// let store = PostgresEventStore::connect("postgres://localhost/calendar").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database and verify the connection
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;

        info!("connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut migrator = sqlx::migrate!("./migrations");
        // The broker keeps its own migrations in the same database
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every connection in the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, event), fields(user_id = event.user_id))]
    async fn create_event(&self, event: Event) -> Result<Uuid, StoreError> {
        check_span(&event)?;
        let reminder_ms = check_reminder(&event)?;

        let id = Uuid::now_v7();

        // No prior existence check: the constraint decides under concurrent writers
        let row = sqlx::query(
            r#"
            INSERT INTO events (
                id, title, description, start_time, stop_time, user_id,
                reminder_ms, reminder_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (start_time, user_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_time)
        .bind(event.stop_time)
        .bind(event.user_id)
        .bind(reminder_ms)
        .bind(event.reminder_time())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(_) => {
                debug!(%id, "created event");
                Ok(id)
            }
            None => Err(StoreError::DateBusy {
                user_id: event.user_id,
                start_time: event.start_time,
            }),
        }
    }

    #[instrument(skip(self, event))]
    async fn update_event(&self, id: Uuid, event: Event) -> Result<(), StoreError> {
        check_ids(id, &event)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT user_id FROM events WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::EventNotFound(id))?;

        let owner: i64 = row.get("user_id");
        if owner != event.user_id {
            return Err(StoreError::UpdateUserId(id));
        }
        check_span(&event)?;
        let reminder_ms = check_reminder(&event)?;

        // reminder_time is only recomputed when the start or the offset changes,
        // so a title edit does not re-arm an already delivered reminder
        let result = sqlx::query(
            r#"
            UPDATE events
            SET title = $2,
                description = $3,
                start_time = $4,
                stop_time = $5,
                reminder_ms = $6,
                reminder_time = CASE
                    WHEN start_time IS DISTINCT FROM $4 OR reminder_ms IS DISTINCT FROM $6
                    THEN $7
                    ELSE reminder_time
                END
            WHERE id = $1 AND user_id = $8
            "#,
        )
        .bind(id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_time)
        .bind(event.stop_time)
        .bind(reminder_ms)
        .bind(event.reminder_time())
        .bind(event.user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DateBusy {
                    user_id: event.user_id,
                    start_time: event.start_time,
                }
            } else {
                error!("Failed to update event: {}", e);
                StoreError::Database(e.to_string())
            }
        })?;

        if result.rows_affected() != 1 {
            return Err(StoreError::EventNotFound(id));
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%id, "updated event");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_event(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM events WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() != 1 {
            return Err(StoreError::EventNotFound(id));
        }

        debug!(%id, "deleted event");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(&self, id: Uuid) -> Result<Event, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get event: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::EventNotFound(id))?;

        Ok(event_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn list_events(
        &self,
        window: ListWindow,
        start: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE start_time >= $1 AND start_time < $2
            ORDER BY start_time, id
            "#
        ))
        .bind(start)
        .bind(window.end(start))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn list_events_reminder(&self) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE reminder_time IS NOT NULL AND reminder_time <= NOW()
            ORDER BY reminder_time, id
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list due reminders: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn clear_reminder_time(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET reminder_time = NULL WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to clear reminder time: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() != 1 {
            return Err(StoreError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_events_before_date(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM events WHERE start_time < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete old events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "deleted old events");
        }
        Ok(removed)
    }
}

#[async_trait]
impl NotificationStore for PostgresEventStore {
    #[instrument(skip(self, notification), fields(id = %notification.id))]
    async fn save_notification(&self, notification: Notification) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, title, start_time, user_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(&notification.title)
        .bind(notification.start_time)
        .bind(notification.user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save notification: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_notification(&self, id: Uuid) -> Result<Notification, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, start_time, user_id FROM notifications WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::NotificationNotFound(id))?;

        Ok(notification_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn list_notifications(&self) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, start_time, user_id
            FROM notifications
            ORDER BY start_time, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(notification_from_row).collect())
    }
}

// Helper functions

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn event_from_row(row: &PgRow) -> Event {
    let reminder_ms: Option<i64> = row.get("reminder_ms");
    Event {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        start_time: row.get("start_time"),
        stop_time: row.get("stop_time"),
        user_id: row.get("user_id"),
        reminder: reminder_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
    }
}

fn notification_from_row(row: &PgRow) -> Notification {
    Notification {
        id: row.get("id"),
        title: row.get("title"),
        start_time: row.get("start_time"),
        user_id: row.get("user_id"),
    }
}
