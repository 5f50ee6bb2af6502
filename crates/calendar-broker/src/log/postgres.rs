//! PostgreSQL-backed partitioned log
//!
//! Lets the scheduler and the storer run as separate processes that share
//! nothing but the database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};

use super::{LogConnection, LogConnector, DEFAULT_RETAINED_RECORDS};
use crate::error::BrokerError;
use crate::message::{Message, Record};

/// Log stored in the `broker_records` and `broker_offsets` tables
///
/// Every append trims its partition to the newest `retained_records` rows.
///
/// # Example
///
/// ```ignore
/// use calendar_broker::PostgresLog;
///
/// let log = PostgresLog::connect_lazy("postgres://localhost/calendar", 4)?;
/// let connection = log.connect().await?;
/// ```
#[derive(Clone)]
pub struct PostgresLog {
    pool: PgPool,
    partitions: u32,
    retained_records: i64,
}

impl PostgresLog {
    pub fn new(pool: PgPool, partitions: u32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
            retained_records: DEFAULT_RETAINED_RECORDS as i64,
        }
    }

    /// Keep at most `records` rows per partition, at least one
    pub fn with_retained_records(mut self, records: usize) -> Self {
        self.retained_records = i64::try_from(records).unwrap_or(i64::MAX).max(1);
        self
    }

    /// Build a pool without opening a connection
    ///
    /// Reachability is checked by [`LogConnector::connect`], which the broker
    /// client retries with backoff. Connecting also applies the migrations.
    pub fn connect_lazy(database_url: &str, partitions: u32) -> Result<Self, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .map_err(|e| BrokerError::Database(e.to_string()))?;
        Ok(Self::new(pool, partitions))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), BrokerError> {
        let mut migrator = sqlx::migrate!("./migrations");
        // The event store keeps its own migrations in the same database
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LogConnector for PostgresLog {
    async fn connect(&self) -> Result<Arc<dyn LogConnection>, BrokerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        self.migrate().await?;

        info!(partitions = self.partitions, "connected to PostgreSQL log");
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl LogConnection for PostgresLog {
    #[instrument(skip(self, message), fields(id = %message.id))]
    async fn append(&self, topic: &str, message: Message) -> Result<Record, BrokerError> {
        let partition = message.partition(self.partitions);

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Serializes appenders per partition so offsets stay dense
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
            .bind(topic)
            .bind(partition)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let row = sqlx::query(
            r#"
            INSERT INTO broker_records (topic, partition, "offset", message_id, payload, published_at)
            SELECT $1, $2, COALESCE(MAX("offset") + 1, 0), $3, $4, $5
            FROM broker_records
            WHERE topic = $1 AND partition = $2
            RETURNING "offset"
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(message.id)
        .bind(&message.payload)
        .bind(message.published_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to append message: {}", e);
            db_error(e)
        })?;

        let offset: i64 = row.get("offset");

        // The newest row is always kept, so MAX("offset") never goes backwards
        let trimmed = sqlx::query(
            r#"
            DELETE FROM broker_records
            WHERE topic = $1 AND partition = $2 AND "offset" <= $3 - $4
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(offset)
        .bind(self.retained_records)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to trim partition: {}", e);
            db_error(e)
        })?
        .rows_affected();

        tx.commit().await.map_err(db_error)?;

        debug!(topic, partition, offset, trimmed, "appended message");
        Ok(Record {
            topic: topic.to_string(),
            partition,
            offset,
            message,
        })
    }

    #[instrument(skip(self))]
    async fn fetch(&self, topic: &str, group: &str, max: usize) -> Result<Vec<Record>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (r.partition)
                r.topic, r.partition, r."offset", r.message_id, r.payload, r.published_at
            FROM broker_records r
            LEFT JOIN broker_offsets o
                ON o.topic = r.topic
                AND o.partition = r.partition
                AND o.consumer_group = $2
            WHERE r.topic = $1 AND r."offset" >= COALESCE(o.next_offset, 0)
            ORDER BY r.partition, r."offset"
            LIMIT $3
            "#,
        )
        .bind(topic)
        .bind(group)
        .bind(max.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch records: {}", e);
            db_error(e)
        })?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        if partition < 0 || partition as u32 >= self.partitions {
            return Err(BrokerError::InvalidPartition {
                topic: topic.to_string(),
                partition,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO broker_offsets (topic, consumer_group, partition, next_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (topic, consumer_group, partition) DO UPDATE
            SET next_offset = GREATEST(broker_offsets.next_offset, EXCLUDED.next_offset),
                updated_at = NOW()
            "#,
        )
        .bind(topic)
        .bind(group)
        .bind(partition)
        .bind(next_offset)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to commit offset: {}", e);
            db_error(e)
        })?;

        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> BrokerError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            BrokerError::Unavailable(e.to_string())
        }
        other => BrokerError::Database(other.to_string()),
    }
}

fn record_from_row(row: &PgRow) -> Record {
    Record {
        topic: row.get("topic"),
        partition: row.get("partition"),
        offset: row.get("offset"),
        message: Message {
            id: row.get("message_id"),
            payload: row.get("payload"),
            published_at: row.get("published_at"),
        },
    }
}
