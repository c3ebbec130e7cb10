//! In-memory implementation of the broker-client boundary
//!
//! Backs the integration tests and local development: partitioned
//! append-only logs per topic, group-scoped committed offsets, and
//! blocking readers woken through a shared [`Notify`]. Delivery semantics
//! mirror the real transport closely enough to exercise the subscription
//! engine end to end — group readers resume from committed offsets,
//! group-less readers fan out with private cursors, and closing the
//! broker surfaces `EndOfStream` to every blocked reader.

use crate::client::{BrokerClient, ReaderConfig, Record, RecordReader, RecordWriter, WriterConfig};
use crate::config::{BrokerConfig, StartOffset, TopicConfig};
use crate::error::BusError;
use crate::routing::lane_for_key;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// (group, topic, partition) key into the committed-offset table
type GroupKey = (String, String, u32);

struct TopicLog {
    partitions: Vec<RwLock<Vec<Record>>>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }
}

struct MemoryState {
    topics: DashMap<String, Arc<TopicLog>>,
    committed: DashMap<GroupKey, u64>,
    data: Notify,
    closed: AtomicBool,
    write_faults: Mutex<VecDeque<BusError>>,
}

/// In-memory broker client; `Clone` shares the underlying state
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<MemoryState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState {
                topics: DashMap::new(),
                committed: DashMap::new(),
                data: Notify::new(),
                closed: AtomicBool::new(false),
                write_faults: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Create a topic directly, bypassing `create_topics`
    pub fn create_topic<S: Into<String>>(&self, name: S, partitions: u32) {
        self.state
            .topics
            .entry(name.into())
            .or_insert_with(|| Arc::new(TopicLog::new(partitions)));
    }

    /// All records currently stored for a topic, partition-major
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let Some(log) = self.state.topics.get(topic).map(|t| Arc::clone(&t)) else {
            return Vec::new();
        };
        log.partitions
            .iter()
            .flat_map(|p| p.read().clone())
            .collect()
    }

    /// Next offset a group would resume from for one partition
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| *entry)
    }

    /// Queue a one-shot failure for the next write call
    pub fn fail_next_write(&self, error: BusError) {
        self.state.write_faults.lock().push_back(error);
    }

    /// Stop the broker; every blocked reader observes `EndOfStream`
    pub fn shutdown(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.data.notify_waiters();
    }

    fn topic_or_create(&self, name: &str, partitions: u32) -> Arc<TopicLog> {
        Arc::clone(
            &self
                .state
                .topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TopicLog::new(partitions))),
        )
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn dial(&self, config: &BrokerConfig) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BusError::connection("memory broker is shut down"));
        }
        debug!(client_id = %config.client_id, "memory broker dialed");
        Ok(())
    }

    async fn create_topics(&self, topics: &[TopicConfig]) -> Result<()> {
        for topic in topics {
            topic.validate()?;
            self.create_topic(&topic.name, topic.partitions.unwrap_or(1));
        }
        Ok(())
    }

    async fn open_writer(&self, config: WriterConfig) -> Result<Arc<dyn RecordWriter>> {
        Ok(Arc::new(MemoryWriter {
            state: Arc::clone(&self.state),
            config,
        }))
    }

    async fn open_reader(&self, config: ReaderConfig) -> Result<Arc<dyn RecordReader>> {
        let log = self.topic_or_create(&config.topic, 1);

        let mut positions = HashMap::new();
        for (partition, records) in log.partitions.iter().enumerate() {
            let partition = partition as u32;
            let committed = config.group_id.as_ref().and_then(|group| {
                self.committed_offset(group, &config.topic, partition)
            });
            let position = committed.unwrap_or(match config.start_offset {
                StartOffset::Earliest => 0,
                StartOffset::Latest => records.read().len() as u64,
            });
            positions.insert(partition, position);
        }

        Ok(Arc::new(MemoryReader {
            state: Arc::clone(&self.state),
            config,
            log,
            positions: Mutex::new(positions),
            scan: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        // releases the control connection only; the shared logs survive so
        // another session can resume from committed offsets
        debug!("memory broker connection closed");
        Ok(())
    }
}

struct MemoryWriter {
    state: Arc<MemoryState>,
    config: WriterConfig,
}

#[async_trait]
impl RecordWriter for MemoryWriter {
    async fn write(&self, records: Vec<Record>) -> Result<()> {
        if let Some(error) = self.state.write_faults.lock().pop_front() {
            return Err(error);
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BusError::connection("memory broker is shut down"));
        }

        let log = Arc::clone(
            &self
                .state
                .topics
                .entry(self.config.topic.clone())
                .or_insert_with(|| Arc::new(TopicLog::new(1))),
        );
        let partition_count = log.partitions.len();

        for mut record in records {
            let partition = if record.key.is_empty() {
                0
            } else {
                lane_for_key(&record.key, partition_count) as u32
            };
            let mut slot = log.partitions[partition as usize].write();
            record.topic = self.config.topic.clone();
            record.partition = partition;
            record.offset = slot.len() as u64;
            slot.push(record);
        }

        self.state.data.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryReader {
    state: Arc<MemoryState>,
    config: ReaderConfig,
    log: Arc<TopicLog>,
    /// partition -> next fetch offset (private cursor)
    positions: Mutex<HashMap<u32, u64>>,
    scan: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryReader {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.state.closed.load(Ordering::SeqCst)
    }

    /// Pop the next available record, rotating the scan start so no
    /// partition starves
    fn poll_next(&self, auto_commit: bool) -> Option<Record> {
        let mut positions = self.positions.lock();
        let partition_count = self.log.partitions.len();
        let start = self.scan.fetch_add(1, Ordering::Relaxed) % partition_count;

        for step in 0..partition_count {
            let partition = ((start + step) % partition_count) as u32;
            let position = positions.entry(partition).or_insert(0);
            let records = self.log.partitions[partition as usize].read();
            if (*position as usize) < records.len() {
                let record = records[*position as usize].clone();
                *position += 1;
                if auto_commit {
                    self.commit_position(partition, *position);
                }
                return Some(record);
            }
        }
        None
    }

    fn commit_position(&self, partition: u32, next: u64) {
        if let Some(group) = &self.config.group_id {
            let key = (group.clone(), self.config.topic.clone(), partition);
            let mut entry = self.state.committed.entry(key).or_insert(0);
            if *entry < next {
                *entry = next;
            }
        }
    }

    async fn next(&self, auto_commit: bool) -> Result<Record> {
        loop {
            if self.is_closed() {
                return Err(BusError::EndOfStream);
            }
            if let Some(record) = self.poll_next(auto_commit) {
                return Ok(record);
            }

            let notified = self.state.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // re-check after registering interest so a write racing the
            // registration cannot be missed
            if let Some(record) = self.poll_next(auto_commit) {
                return Ok(record);
            }
            if self.is_closed() {
                return Err(BusError::EndOfStream);
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RecordReader for MemoryReader {
    async fn read(&self) -> Result<Record> {
        self.next(true).await
    }

    async fn fetch(&self) -> Result<Record> {
        self.next(false).await
    }

    async fn commit(&self, record: &Record) -> Result<()> {
        self.commit_position(record.partition, record.offset + 1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.data.notify_waiters();
        Ok(())
    }
}
