//! Reminder scheduler
//!
//! One loop, two timers: a short one that publishes due reminders and a long
//! one that deletes events past the retention horizon.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use calendar_broker::{BrokerClient, BrokerError};
use calendar_store::{EventStore, Notification, StoreError};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Topic reminders are published to
    pub topic: String,

    /// Period of the due-reminder scan
    pub reminder_interval: Duration,

    /// Period of the retention sweep
    pub retention_interval: Duration,

    /// Events starting longer ago than this are deleted
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            topic: "calendar.reminders".to_string(),
            reminder_interval: Duration::from_secs(5),
            retention_interval: Duration::from_secs(60 * 60),
            retention: DAY * 365,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the reminder scan period, at least one millisecond
    pub fn with_reminder_interval(mut self, interval: Duration) -> Self {
        self.reminder_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the retention sweep period, at least one millisecond
    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_retention_days(self, days: u32) -> Self {
        self.with_retention(DAY * days)
    }
}

/// Outcome of one reminder scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Events whose reminder had elapsed
    pub due: usize,

    /// Notifications handed to the broker
    pub published: usize,

    /// Publishes that failed; those events stay due
    pub failed: usize,

    /// Published events whose reminder could not be cleared
    pub uncleared: usize,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Publishes due reminders and sweeps old events
pub struct Scheduler {
    store: Arc<dyn EventStore>,
    broker: Arc<BrokerClient>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn EventStore>, broker: Arc<BrokerClient>, config: SchedulerConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run both timers until `token` is cancelled
    ///
    /// Both timers fire once immediately. A failed tick is logged and the next
    /// one proceeds as usual. A tick in progress is abandoned on cancellation;
    /// reminders it had not cleared stay due.
    pub async fn run(&self, token: &CancellationToken) {
        let mut reminders = tokio::time::interval(self.config.reminder_interval);
        reminders.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention = tokio::time::interval(self.config.retention_interval);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            topic = %self.config.topic,
            reminder_interval_ms = self.config.reminder_interval.as_millis() as u64,
            retention_interval_ms = self.config.retention_interval.as_millis() as u64,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = reminders.tick() => {
                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        result = self.tick_reminders() => result,
                    };
                    match result {
                        Ok(report) if report.due > 0 => info!(
                            due = report.due,
                            published = report.published,
                            failed = report.failed,
                            "reminder tick"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Failed to scan reminders: {}", e),
                    }
                }
                _ = retention.tick() => {
                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        result = self.sweep_retention() => result,
                    };
                    match result {
                        Ok(removed) if removed > 0 => info!(removed, "retention sweep"),
                        Ok(_) => {}
                        Err(e) => error!("Failed to sweep old events: {}", e),
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Publish every due reminder and clear the ones that were published
    #[instrument(skip(self))]
    pub async fn tick_reminders(&self) -> Result<TickReport, SchedulerError> {
        let due = self.store.list_events_reminder().await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for event in due {
            let notification = Notification::from(&event);
            if let Err(e) = self.broker.publish_json(&self.config.topic, &notification).await {
                warn!(id = %event.id, error = %e, "publish failed, reminder stays due");
                report.failed += 1;
                continue;
            }
            report.published += 1;

            match self.store.clear_reminder_time(event.id).await {
                Ok(()) => debug!(id = %event.id, "reminder delivered"),
                // Deleted between the scan and now
                Err(StoreError::EventNotFound(_)) => {}
                Err(e) => {
                    warn!(id = %event.id, error = %e, "reminder published but not cleared");
                    report.uncleared += 1;
                }
            }
        }

        Ok(report)
    }

    /// Delete events older than the retention horizon
    #[instrument(skip(self))]
    pub async fn sweep_retention(&self) -> Result<u64, SchedulerError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        Ok(self.store.delete_events_before_date(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use calendar_broker::{BrokerConfig, LogConnection, MemoryLog};
    use calendar_store::{Event, InMemoryEventStore, ListWindow};
    use chrono::DateTime;
    use uuid::Uuid;

    /// Store whose scans never finish
    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        async fn create_event(&self, _: Event) -> Result<Uuid, StoreError> {
            Err(StoreError::Database("read only".into()))
        }

        async fn update_event(&self, id: Uuid, _: Event) -> Result<(), StoreError> {
            Err(StoreError::EventNotFound(id))
        }

        async fn delete_event(&self, id: Uuid) -> Result<(), StoreError> {
            Err(StoreError::EventNotFound(id))
        }

        async fn get_event(&self, id: Uuid) -> Result<Event, StoreError> {
            Err(StoreError::EventNotFound(id))
        }

        async fn list_events(
            &self,
            _: ListWindow,
            _: DateTime<Utc>,
        ) -> Result<Vec<Event>, StoreError> {
            Ok(Vec::new())
        }

        async fn list_events_reminder(&self) -> Result<Vec<Event>, StoreError> {
            std::future::pending().await
        }

        async fn clear_reminder_time(&self, _: Uuid) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_events_before_date(&self, _: DateTime<Utc>) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    fn scheduler(store: Arc<InMemoryEventStore>, log: MemoryLog) -> Scheduler {
        let broker = Arc::new(BrokerClient::new(Arc::new(log), BrokerConfig::default()));
        Scheduler::new(store, broker, SchedulerConfig::default().with_topic("t"))
    }

    #[test]
    fn test_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.reminder_interval, Duration::from_secs(5));
        assert_eq!(config.retention_interval, Duration::from_secs(3600));
        assert_eq!(config.retention, Duration::from_secs(365 * 86400));
        assert_eq!(
            SchedulerConfig::new().with_reminder_interval(Duration::ZERO).reminder_interval,
            Duration::from_millis(1)
        );
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_reminder_due() {
        let store = Arc::new(InMemoryEventStore::new());
        let log = MemoryLog::new(1);
        let start = Utc::now();
        store
            .create_event(
                Event::new("due", 1, start, start + chrono::Duration::hours(1))
                    .with_reminder(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        // Broker never connected
        let scheduler = scheduler(store.clone(), log.clone());
        let report = scheduler.tick_reminders().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 0);
        assert_eq!(log.len("t"), 0);

        assert_eq!(store.list_events_reminder().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_publishes_notification_payload() {
        let store = Arc::new(InMemoryEventStore::new());
        let log = MemoryLog::new(1);
        let start = Utc::now();
        let id = store
            .create_event(
                Event::new("standup", 9, start, start + chrono::Duration::minutes(15))
                    .with_reminder(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let scheduler = scheduler(store, log.clone());
        scheduler.broker.connect(&CancellationToken::new()).await.unwrap();
        let report = scheduler.tick_reminders().await.unwrap();
        assert_eq!(report.published, 1);

        let records = log.fetch("t", "check", 10).await.unwrap();
        let notification: Notification = records[0].message.decode().unwrap();
        assert_eq!(notification.id, id);
        assert_eq!(notification.title, "standup");
        assert_eq!(notification.user_id, 9);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let now = Utc::now();
        let old = now - chrono::Duration::days(400);
        let recent = now - chrono::Duration::days(300);
        store.create_event(Event::new("old", 1, old, old)).await.unwrap();
        let kept = store
            .create_event(Event::new("recent", 1, recent, recent))
            .await
            .unwrap();

        let scheduler = scheduler(store.clone(), MemoryLog::new(1));
        assert_eq!(scheduler.sweep_retention().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get_event(kept).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_tick() {
        let broker = Arc::new(BrokerClient::new(
            Arc::new(MemoryLog::new(1)),
            BrokerConfig::default(),
        ));
        let scheduler = Scheduler::new(Arc::new(StalledStore), broker, SchedulerConfig::default());
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), scheduler.run(&token))
            .await
            .expect("scheduler kept waiting on the store after cancellation");
    }

    #[tokio::test]
    async fn test_repeated_ticks_keep_log_bounded() {
        let store = Arc::new(InMemoryEventStore::new());
        let log = MemoryLog::new(1).with_retained_records(8);
        let start = Utc::now();
        store
            .create_event(
                Event::new("due", 1, start, start).with_reminder(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let scheduler = scheduler(store, log.clone());
        scheduler.broker.connect(&CancellationToken::new()).await.unwrap();
        for _ in 0..100 {
            assert_eq!(scheduler.tick_reminders().await.unwrap().published, 1);
        }

        assert_eq!(log.appended("t"), 100);
        assert_eq!(log.len("t"), 8);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(InMemoryEventStore::new());
        let scheduler = scheduler(store, MemoryLog::new(1));
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), scheduler.run(&token))
            .await
            .unwrap();
    }
}
