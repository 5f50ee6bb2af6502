//! Publish/subscribe client over a partitioned log

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{BrokerError, HandlerError};
use crate::log::{LogConnection, LogConnector};
use crate::message::{Message, Record};
use crate::reliability::RetryPolicy;

/// Message handler function type
pub type MessageHandler = Arc<
    dyn Fn(Message) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Broker client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Backoff between connection attempts
    pub connect_retry: RetryPolicy,

    /// Wait between fetches when a topic has nothing new
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Wait before redelivering a message whose handler asked for a retry
    #[serde(with = "duration_millis")]
    pub redelivery_delay: Duration,

    /// Maximum records handed to one consumer per fetch
    pub fetch_batch: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::exponential(),
            poll_interval: Duration::from_millis(200),
            redelivery_delay: Duration::from_secs(1),
            fetch_batch: 16,
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn with_fetch_batch(mut self, batch: usize) -> Self {
        self.fetch_batch = batch.max(1);
        self
    }
}

struct Subscription {
    topic: String,
    group: String,
    handler: MessageHandler,
}

/// Client for publishing to and consuming from a log
///
/// Nothing works until [`BrokerClient::connect`] succeeds. Each subscription
/// is its own consumer group: every group sees every message of its topic,
/// and a message is committed for a group only after its handler returns
/// `Ok` or [`HandlerError::Discard`]. Delivery is at least once.
///
/// Handlers run on their own task. A handler that panics is treated as a
/// discard, so one poisoned message cannot stall its partition or take the
/// consumer down.
///
/// # Example
///
/// ```ignore
/// use calendar_broker::{BrokerClient, BrokerConfig, MemoryLog};
///
/// let client = BrokerClient::new(Arc::new(MemoryLog::new(4)), BrokerConfig::default());
/// client.subscribe("reminders", "storer", |message| async move {
///     println!("{:?}", message.id);
///     Ok(())
/// })?;
///
/// let token = CancellationToken::new();
/// client.connect(&token).await?;
/// client.publish("reminders", b"hello".to_vec()).await?;
/// client.run(&token).await?;
/// ```
pub struct BrokerClient {
    connector: Arc<dyn LogConnector>,
    config: BrokerConfig,
    connection: RwLock<Option<Arc<dyn LogConnection>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    registered: Mutex<HashSet<(String, String)>>,
}

impl BrokerClient {
    pub fn new(connector: Arc<dyn LogConnector>, config: BrokerConfig) -> Self {
        Self {
            connector,
            config,
            connection: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            registered: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Connect to the log, retrying with backoff
    ///
    /// Returns immediately if already connected. Gives up with
    /// [`BrokerError::Cancelled`] once `token` fires, or with the last
    /// connection error when the retry policy runs out of attempts.
    #[instrument(skip_all)]
    pub async fn connect(&self, token: &CancellationToken) -> Result<(), BrokerError> {
        let policy = &self.config.connect_retry;
        let mut attempt = 0u32;

        loop {
            if self.is_connected() {
                return Ok(());
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(BrokerError::Cancelled),
                result = self.connector.connect() => result,
            };

            let err = match result {
                Ok(connection) => {
                    *self.connection.write() = Some(connection);
                    info!(attempt, "connected to broker");
                    return Ok(());
                }
                Err(err) => err,
            };

            if !policy.has_attempts_remaining(attempt) {
                error!(attempt, error = %err, "giving up connecting to broker");
                return Err(err);
            }

            let delay = policy.delay_after_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "broker not ready, retrying"
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(BrokerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Append a payload to `topic` under a fresh message id
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Record, BrokerError> {
        let connection = self
            .connection
            .read()
            .clone()
            .ok_or(BrokerError::PublisherNotReady)?;

        let record = connection.append(topic, Message::new(payload)).await?;
        debug!(
            topic,
            id = %record.message.id,
            partition = record.partition,
            offset = record.offset,
            "published message"
        );
        Ok(record)
    }

    /// Serialize `value` as JSON and publish it
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<Record, BrokerError> {
        self.publish(topic, serde_json::to_vec(value)?).await
    }

    /// Register a handler for `topic` in consumer group `group`
    ///
    /// Takes effect on the next call to [`BrokerClient::run`]. A group has
    /// exactly one handler per topic; registering a second one fails with
    /// [`BrokerError::DuplicateSubscription`].
    pub fn subscribe<F, Fut>(&self, topic: &str, group: &str, handler: F) -> Result<(), BrokerError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if !self
            .registered
            .lock()
            .insert((topic.to_string(), group.to_string()))
        {
            warn!(topic, group, "rejected duplicate subscription");
            return Err(BrokerError::DuplicateSubscription {
                topic: topic.to_string(),
                group: group.to_string(),
            });
        }

        let handler: MessageHandler = Arc::new(move |message| Box::pin(handler(message)));
        self.subscriptions.lock().push(Subscription {
            topic: topic.to_string(),
            group: group.to_string(),
            handler,
        });
        info!(topic, group, "registered handler");
        Ok(())
    }

    /// Connect, then consume every registered subscription until `token` fires
    ///
    /// Cancellation is a normal return. Only a connect failure that is not a
    /// cancellation is reported as an error.
    pub async fn run(&self, token: &CancellationToken) -> Result<(), BrokerError> {
        match self.connect(token).await {
            Ok(()) => {}
            Err(BrokerError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        }

        let connection = match self.connection.read().clone() {
            Some(connection) => connection,
            None => return Err(BrokerError::PublisherNotReady),
        };

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        if subscriptions.is_empty() {
            debug!("no subscriptions, waiting for shutdown");
        }

        let mut consumers = JoinSet::new();
        for subscription in subscriptions {
            consumers.spawn(consume(
                connection.clone(),
                subscription,
                self.config.clone(),
                token.clone(),
            ));
        }

        token.cancelled().await;
        while let Some(result) = consumers.join_next().await {
            if let Err(e) = result {
                error!("consumer task failed: {}", e);
            }
        }

        info!("broker client stopped");
        Ok(())
    }
}

/// Dispatch loop for one subscription
///
/// Every await on the log or the handler is raced against `token`, so a hung
/// backend or handler never delays shutdown. A record interrupted that way is
/// left uncommitted and delivered again later.
async fn consume(
    connection: Arc<dyn LogConnection>,
    subscription: Subscription,
    config: BrokerConfig,
    token: CancellationToken,
) {
    let Subscription {
        topic,
        group,
        handler,
    } = subscription;
    info!(topic = %topic, group = %group, "consumer started");

    'consume: loop {
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            fetched = connection.fetch(&topic, &group, config.fetch_batch) => fetched,
        };

        let wait = match fetched {
            Ok(records) if records.is_empty() => config.poll_interval,
            Ok(records) => {
                let mut redeliver = false;
                for record in records {
                    let committed = tokio::select! {
                        biased;
                        _ = token.cancelled() => break 'consume,
                        committed = deliver(connection.as_ref(), &group, &handler, record) => committed,
                    };
                    if !committed {
                        redeliver = true;
                    }
                }
                if redeliver {
                    config.redelivery_delay
                } else {
                    Duration::ZERO
                }
            }
            Err(e) => {
                warn!(topic = %topic, group = %group, error = %e, "fetch failed");
                config.poll_interval
            }
        };

        if wait.is_zero() {
            continue;
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!(topic = %topic, group = %group, "consumer stopped");
}

/// Hand one record to the handler and commit it unless a retry was requested
///
/// Returns `false` when the record stays uncommitted.
async fn deliver(
    connection: &dyn LogConnection,
    group: &str,
    handler: &MessageHandler,
    record: Record,
) -> bool {
    let id = record.message.id;
    match invoke(handler, record.message.clone()).await {
        Ok(()) => {}
        Err(HandlerError::Discard(reason)) => {
            warn!(%id, group, reason = %reason, "discarding message");
        }
        Err(HandlerError::Retry(reason)) => {
            warn!(%id, group, reason = %reason, "handler failed, message will be redelivered");
            return false;
        }
    }

    match connection
        .commit(&record.topic, group, record.partition, record.next_offset())
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(%id, group, error = %e, "commit failed, message will be redelivered");
            false
        }
    }
}

/// Run a handler on its own task
///
/// A panic becomes [`HandlerError::Discard`]. Dropping the returned future
/// aborts the handler task.
async fn invoke(handler: &MessageHandler, message: Message) -> Result<(), HandlerError> {
    let id = message.id;
    let mut task = JoinSet::new();
    task.spawn(handler(message));

    match task.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) if e.is_panic() => {
            error!(%id, "message handler panicked");
            Err(HandlerError::discard("handler panicked"))
        }
        Some(Err(e)) => Err(HandlerError::retry(e.to_string())),
        None => Err(HandlerError::retry("handler task missing")),
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .map_err(|_| S::Error::custom(format!("duration {duration:?} overflows u64 milliseconds")))?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
