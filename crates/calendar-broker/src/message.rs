//! Messages and the records they become once appended to a log

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque payload with a unique id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// Wrap a payload under a fresh id
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            payload: payload.into(),
            published_at: Utc::now(),
        }
    }

    /// Encode `value` as a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Decode a JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Partition the message lands in for a topic with `partitions` partitions
    pub fn partition(&self, partitions: u32) -> i32 {
        (self.id.as_u128() % u128::from(partitions.max(1))) as i32
    }
}

/// A message at its position in a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message: Message,
}

impl Record {
    /// Offset a consumer group commits once this record is handled
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}
