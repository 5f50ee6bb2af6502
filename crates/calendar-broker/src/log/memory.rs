//! In-process partitioned log

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{LogConnection, LogConnector, DEFAULT_RETAINED_RECORDS};
use crate::error::BrokerError;
use crate::message::{Message, Record};

type OffsetKey = (String, String, i32);

/// Retained tail of one partition
#[derive(Default, Clone)]
struct Partition {
    /// Offset of `messages[0]`
    base: i64,
    messages: VecDeque<Message>,
}

impl Partition {
    fn next_offset(&self) -> i64 {
        self.base + self.messages.len() as i64
    }

    /// First retained message at or after `offset`
    fn read_from(&self, offset: i64) -> Option<(i64, &Message)> {
        let offset = offset.max(self.base);
        let index = usize::try_from(offset - self.base).ok()?;
        self.messages.get(index).map(|message| (offset, message))
    }

    fn push(&mut self, message: Message, retained: usize) -> i64 {
        let offset = self.next_offset();
        self.messages.push_back(message);
        while self.messages.len() > retained {
            self.messages.pop_front();
            self.base += 1;
        }
        offset
    }
}

#[derive(Default)]
struct Inner {
    available: AtomicBool,
    topics: RwLock<HashMap<String, Vec<Partition>>>,
    offsets: RwLock<HashMap<OffsetKey, i64>>,
}

/// Process-local log for tests and single-process deployments
///
/// Clones share the same topics and offsets. [`MemoryLog::set_available`]
/// simulates an outage: while unavailable every call fails with
/// [`BrokerError::Unavailable`].
///
/// Each partition keeps its newest `retained_records` messages. Offsets stay
/// absolute after older messages are dropped, and a group whose committed
/// offset fell behind the retained tail resumes at the oldest kept message.
#[derive(Clone)]
pub struct MemoryLog {
    partitions: u32,
    retained_records: usize,
    inner: Arc<Inner>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        let inner = Inner::default();
        inner.available.store(true, Ordering::SeqCst);
        Self {
            partitions: partitions.max(1),
            retained_records: DEFAULT_RETAINED_RECORDS,
            inner: Arc::new(inner),
        }
    }

    /// Keep at most `records` messages per partition, at least one
    pub fn with_retained_records(mut self, records: usize) -> Self {
        self.retained_records = records.max(1);
        self
    }

    /// Number of partitions per topic
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Switch the log on or off
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        info!(available, "memory log availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Records of `topic` currently retained across all partitions
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|parts| parts.iter().map(|p| p.messages.len()).sum())
            .unwrap_or(0)
    }

    /// Records ever appended to `topic`, including dropped ones
    pub fn appended(&self, topic: &str) -> u64 {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|parts| parts.iter().map(|p| p.next_offset() as u64).sum())
            .unwrap_or(0)
    }

    /// Committed offset of `group` in one partition, 0 if nothing was committed
    pub fn committed(&self, topic: &str, group: &str, partition: i32) -> i64 {
        self.inner
            .offsets
            .read()
            .get(&(topic.to_string(), group.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory log is switched off".into()))
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl LogConnector for MemoryLog {
    async fn connect(&self) -> Result<Arc<dyn LogConnection>, BrokerError> {
        self.ensure_available()?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl LogConnection for MemoryLog {
    async fn append(&self, topic: &str, message: Message) -> Result<Record, BrokerError> {
        self.ensure_available()?;

        let partition = message.partition(self.partitions);
        let mut topics = self.inner.topics.write();
        let parts = topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Partition::default(); self.partitions as usize]);
        let offset = parts[partition as usize].push(message.clone(), self.retained_records);

        debug!(topic, partition, offset, id = %message.id, "appended message");
        Ok(Record {
            topic: topic.to_string(),
            partition,
            offset,
            message,
        })
    }

    async fn fetch(&self, topic: &str, group: &str, max: usize) -> Result<Vec<Record>, BrokerError> {
        self.ensure_available()?;

        let topics = self.inner.topics.read();
        let Some(parts) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let offsets = self.inner.offsets.read();

        let mut records = Vec::new();
        for (partition, log) in parts.iter().enumerate() {
            if records.len() >= max {
                break;
            }
            let partition = partition as i32;
            let committed = offsets
                .get(&(topic.to_string(), group.to_string(), partition))
                .copied()
                .unwrap_or(0);
            if let Some((offset, message)) = log.read_from(committed) {
                records.push(Record {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    message: message.clone(),
                });
            }
        }
        Ok(records)
    }

    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        self.ensure_available()?;
        if partition < 0 || partition as u32 >= self.partitions {
            return Err(BrokerError::InvalidPartition {
                topic: topic.to_string(),
                partition,
            });
        }

        let mut offsets = self.inner.offsets.write();
        let committed = offsets
            .entry((topic.to_string(), group.to_string(), partition))
            .or_insert(0);
        *committed = (*committed).max(next_offset);
        Ok(())
    }
}
