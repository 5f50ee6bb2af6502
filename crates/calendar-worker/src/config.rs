// Pipeline configuration
// Decision: Everything comes from environment variables (optionally via .env).
// Backend names are parsed strictly so a typo fails at startup instead of
// silently falling back to the in-memory implementation.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::scheduler::SchedulerConfig;

/// Where events and notifications are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local maps (default)
    #[default]
    Memory,
    /// PostgreSQL tables `events` and `notifications`
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" | "" => Ok(Self::Memory),
            "postgres" | "postgresql" | "sql" => Ok(Self::Postgres),
            _ => bail!("Unknown storage backend: {}. Use 'memory' or 'postgres'", s),
        }
    }
}

/// Which log carries reminder messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrokerBackend {
    /// Process-local log (default), scheduler and storer must share the process
    #[default]
    Memory,
    /// PostgreSQL tables `broker_records` and `broker_offsets`
    Postgres,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" | "" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => bail!("Unknown broker backend: {}. Use 'memory' or 'postgres'", s),
        }
    }
}

/// Which halves of the pipeline this process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerRole {
    Scheduler,
    Storer,
    #[default]
    All,
}

impl WorkerRole {
    pub fn runs_scheduler(self) -> bool {
        matches!(self, Self::Scheduler | Self::All)
    }

    pub fn runs_storer(self) -> bool {
        matches!(self, Self::Storer | Self::All)
    }
}

impl FromStr for WorkerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduler" => Ok(Self::Scheduler),
            "storer" | "sender" => Ok(Self::Storer),
            "all" | "" => Ok(Self::All),
            _ => bail!("Unknown worker role: {}. Use 'scheduler', 'storer' or 'all'", s),
        }
    }
}

/// Configuration for the worker binary
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub role: WorkerRole,
    pub storage_backend: StorageBackend,
    pub broker_backend: BrokerBackend,
    /// Required when either backend is PostgreSQL
    pub database_url: Option<String>,
    pub consumer_group: String,
    pub broker_partitions: u32,
    /// Newest records kept per broker partition
    pub broker_retained_records: u32,
    pub scheduler: SchedulerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            role: WorkerRole::default(),
            storage_backend: StorageBackend::default(),
            broker_backend: BrokerBackend::default(),
            database_url: None,
            consumer_group: "notification-storer".to_string(),
            broker_partitions: 4,
            broker_retained_records: calendar_broker::DEFAULT_RETAINED_RECORDS as u32,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let role = lookup("WORKER_ROLE").unwrap_or_default().parse()?;
        let storage_backend = lookup("STORAGE_BACKEND").unwrap_or_default().parse()?;
        let broker_backend = lookup("BROKER_BACKEND").unwrap_or_default().parse()?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());

        let consumer_group = lookup("CONSUMER_GROUP").unwrap_or(defaults.consumer_group);
        let broker_partitions =
            parse_positive(&lookup, "BROKER_PARTITIONS")?.unwrap_or(defaults.broker_partitions);
        let broker_retained_records = parse_positive(&lookup, "BROKER_RETAINED_RECORDS")?
            .unwrap_or(defaults.broker_retained_records);

        let mut scheduler = defaults.scheduler;
        if let Some(topic) = lookup("REMINDER_TOPIC") {
            scheduler = scheduler.with_topic(topic);
        }
        if let Some(secs) = parse_positive(&lookup, "REMINDER_INTERVAL_SECS")? {
            scheduler = scheduler.with_reminder_interval(Duration::from_secs(secs.into()));
        }
        if let Some(secs) = parse_positive(&lookup, "RETENTION_INTERVAL_SECS")? {
            scheduler = scheduler.with_retention_interval(Duration::from_secs(secs.into()));
        }
        if let Some(days) = parse_positive(&lookup, "RETENTION_DAYS")? {
            scheduler = scheduler.with_retention_days(days);
        }

        let config = Self {
            role,
            storage_backend,
            broker_backend,
            database_url,
            consumer_group,
            broker_partitions,
            broker_retained_records,
            scheduler,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        let needs_database = self.storage_backend == StorageBackend::Postgres
            || self.broker_backend == BrokerBackend::Postgres;
        if needs_database && self.database_url.is_none() {
            bail!("DATABASE_URL is required when a PostgreSQL backend is selected");
        }
        if self.broker_backend == BrokerBackend::Memory && self.role != WorkerRole::All {
            bail!(
                "WORKER_ROLE={:?} needs BROKER_BACKEND=postgres; the memory broker only connects a scheduler and storer in the same process",
                self.role
            );
        }
        Ok(())
    }

    /// Database URL, if a PostgreSQL backend needs one
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set")
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u32>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a positive integer, got '{raw}'"))?;
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Some(value))
}
