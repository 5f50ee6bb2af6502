//! Wires stores, broker, scheduler and storer together for one process

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use calendar_broker::{BrokerClient, BrokerConfig, LogConnector, MemoryLog, PostgresLog};
use calendar_store::{EventStore, InMemoryEventStore, NotificationStore, PostgresEventStore};

use crate::config::{BrokerBackend, PipelineConfig, StorageBackend};
use crate::scheduler::Scheduler;
use crate::storer::NotificationStorer;

/// Fully constructed reminder pipeline
pub struct Pipeline {
    config: PipelineConfig,
    events: Arc<dyn EventStore>,
    notifications: Arc<dyn NotificationStore>,
    broker: Arc<BrokerClient>,
}

impl Pipeline {
    /// Open the configured backends and apply migrations
    pub async fn build(config: PipelineConfig) -> Result<Self> {
        let (events, notifications): (Arc<dyn EventStore>, Arc<dyn NotificationStore>) =
            match config.storage_backend {
                StorageBackend::Memory => {
                    info!("Using in-memory event store");
                    let store = Arc::new(InMemoryEventStore::new());
                    let events: Arc<dyn EventStore> = store.clone();
                    let notifications: Arc<dyn NotificationStore> = store;
                    (events, notifications)
                }
                StorageBackend::Postgres => {
                    info!("Using PostgreSQL event store");
                    let store = PostgresEventStore::connect(config.database_url()?)
                        .await
                        .context("Failed to connect event store")?;
                    store
                        .migrate()
                        .await
                        .context("Failed to migrate event store")?;
                    let store = Arc::new(store);
                    let events: Arc<dyn EventStore> = store.clone();
                    let notifications: Arc<dyn NotificationStore> = store;
                    (events, notifications)
                }
            };

        let connector: Arc<dyn LogConnector> = match config.broker_backend {
            BrokerBackend::Memory => {
                info!(partitions = config.broker_partitions, "Using in-memory broker log");
                Arc::new(
                    MemoryLog::new(config.broker_partitions)
                        .with_retained_records(config.broker_retained_records as usize),
                )
            }
            BrokerBackend::Postgres => {
                info!(partitions = config.broker_partitions, "Using PostgreSQL broker log");
                // Lazy so an unreachable database is retried by the client
                let log = PostgresLog::connect_lazy(config.database_url()?, config.broker_partitions)
                    .context("Invalid broker database URL")?
                    .with_retained_records(config.broker_retained_records as usize);
                Arc::new(log)
            }
        };

        Ok(Self::from_parts(
            config,
            events,
            notifications,
            Arc::new(BrokerClient::new(connector, BrokerConfig::default())),
        ))
    }

    /// Assemble a pipeline from already constructed parts
    pub fn from_parts(
        config: PipelineConfig,
        events: Arc<dyn EventStore>,
        notifications: Arc<dyn NotificationStore>,
        broker: Arc<BrokerClient>,
    ) -> Self {
        Self {
            config,
            events,
            notifications,
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationStore> {
        &self.notifications
    }

    /// Run the configured roles until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let role = self.config.role;
        let topic = self.config.scheduler.topic.clone();

        if role.runs_storer() {
            Arc::new(NotificationStorer::new(self.notifications.clone()))
                .register(&self.broker, &topic, &self.config.consumer_group)
                .context("Failed to register notification storer")?;
        }

        // The scheduler may only start publishing once the broker is reachable
        match self.broker.connect(&token).await {
            Ok(()) => {}
            Err(calendar_broker::BrokerError::Cancelled) => return Ok(()),
            Err(e) => return Err(e).context("Failed to connect to broker"),
        }

        let scheduler = role.runs_scheduler().then(|| {
            let scheduler = Scheduler::new(
                self.events.clone(),
                self.broker.clone(),
                self.config.scheduler.clone(),
            );
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(&token).await })
        });

        let consumed = self.broker.run(&token).await;

        if let Some(handle) = scheduler {
            handle.await.context("Scheduler task panicked")?;
        }
        consumed.context("Broker client failed")?;

        info!("pipeline stopped");
        Ok(())
    }
}
