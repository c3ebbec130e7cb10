//! The boundary to the underlying broker client library
//!
//! The messaging layer never speaks the broker wire protocol itself. It
//! consumes the transport through three narrow capabilities: a
//! [`BrokerClient`] that dials, creates topics, and hands out readers and
//! writers; a [`RecordWriter`] for batched writes; and a [`RecordReader`]
//! for the two fetch primitives (auto-ack and manual) plus per-record
//! commit. [`crate::memory::MemoryBroker`] implements the boundary
//! in-process for tests and local development.

use crate::config::{BrokerConfig, RequiredAcks, StartOffset, TopicConfig};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// One record as fetched from or written to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    /// A record to be written; partition and offset are assigned broker-side
    pub fn outbound<T: Into<String>>(topic: T, key: Bytes, value: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key,
            value,
        }
    }
}

/// Partition selection applied by the write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Balancer {
    /// Deterministic FNV-1a hash over the record key: equal keys always
    /// land on equal partitions
    #[default]
    Fnv1aHash,
}

/// Configuration for one writer bound to one topic
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub topic: String,
    pub balancer: Balancer,
    pub required_acks: RequiredAcks,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_attempts: usize,
}

/// Configuration for one reader bound to one topic (and optionally a group)
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub topic: String,
    /// Consumer group; `None` reads the whole topic without load balancing
    pub group_id: Option<String>,
    pub start_offset: StartOffset,
    pub batch_timeout: Duration,
    /// Broker-side periodic commit interval; `None` disables auto-commit
    pub commit_interval: Option<Duration>,
    pub join_group_backoff: Duration,
    pub max_attempts: usize,
}

/// Entry point into the underlying broker client library
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the control connection described by the broker config
    async fn dial(&self, config: &BrokerConfig) -> Result<()>;

    /// Create every topic in the given set; existing topics are untouched
    async fn create_topics(&self, topics: &[TopicConfig]) -> Result<()>;

    /// Open a batched writer for one topic
    async fn open_writer(&self, config: WriterConfig) -> Result<Arc<dyn RecordWriter>>;

    /// Open a reader for one topic and optional consumer group
    async fn open_reader(&self, config: ReaderConfig) -> Result<Arc<dyn RecordReader>>;

    /// Close the control connection
    async fn close(&self) -> Result<()>;
}

/// Batched record writer; safe for concurrent callers
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Write the batch, blocking until the configured ack level is met
    async fn write(&self, records: Vec<Record>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Record reader with both fetch primitives
///
/// `read` participates in broker-side auto-commit; `fetch` leaves the
/// record unacknowledged until an explicit `commit`. Both block until a
/// record arrives, the reader is closed (`EndOfStream`), or the stream
/// ends (`EndOfStream`).
#[async_trait]
pub trait RecordReader: Send + Sync {
    /// Next record, acknowledged by the broker-side periodic commit
    async fn read(&self) -> Result<Record>;

    /// Next record without acknowledgment
    async fn fetch(&self) -> Result<Record>;

    /// Commit the offset of one fetched record
    async fn commit(&self, record: &Record) -> Result<()>;

    /// Close the reader, unblocking any pending read or fetch
    async fn close(&self) -> Result<()>;
}
