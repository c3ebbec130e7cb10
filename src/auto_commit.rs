//! Auto-commit delivery strategy
//!
//! Broker-side periodic commit; the client never acknowledges individual
//! messages. One fetch loop feeds a fixed pool of workers through bounded
//! lanes; the lane is chosen by hashing the record key, so messages that
//! share a key are processed strictly in fetch order relative to each
//! other. Handler errors are logged and dropped — delivery is best-effort
//! by contract, and a poison message never blocks its lane.

use crate::client::{BrokerClient, ReaderConfig, Record, RecordReader};
use crate::config::SubscriberConfig;
use crate::metrics::{global_metrics, BusMetrics};
use crate::routing::lane_for_key;
use crate::subscriber::{group_of, HandlerFn, SubscriberStrategy, LANE_CAPACITY, RECONNECT_WAIT};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

pub(crate) struct AutoCommitStrategy {
    topic: String,
    config: SubscriberConfig,
    handlers: Vec<HandlerFn>,
    tracker: TaskTracker,
    shutdown: Mutex<Option<CancellationToken>>,
    metrics: Arc<BusMetrics>,
}

impl AutoCommitStrategy {
    pub(crate) fn new(topic: String, config: SubscriberConfig, handlers: Vec<HandlerFn>) -> Self {
        Self {
            topic,
            config,
            handlers,
            tracker: TaskTracker::new(),
            shutdown: Mutex::new(None),
            metrics: global_metrics(),
        }
    }

    /// The strategy's own lifetime token: a child of the broker token,
    /// created once and reused across self-restarts
    fn shutdown_token(&self, parent: &CancellationToken) -> CancellationToken {
        let mut guard = self.shutdown.lock();
        match &*guard {
            Some(token) => token.clone(),
            None => {
                let token = parent.child_token();
                *guard = Some(token.clone());
                token
            }
        }
    }

    async fn spin_up(
        self: Arc<Self>,
        parent: CancellationToken,
        client: Arc<dyn BrokerClient>,
    ) -> Result<()> {
        let shutdown = self.shutdown_token(&parent);
        let reader = client
            .open_reader(ReaderConfig {
                topic: self.topic.clone(),
                group_id: group_of(&self.config.group_id),
                start_offset: self.config.start_offset,
                batch_timeout: self.config.batch_timeout,
                commit_interval: Some(self.config.commit_interval),
                join_group_backoff: self.config.join_group_backoff,
                max_attempts: self.config.max_attempts,
            })
            .await?;

        let mut senders = Vec::with_capacity(self.config.worker_count);
        for lane in 0..self.config.worker_count {
            let (tx, rx) = mpsc::channel(LANE_CAPACITY);
            senders.push(tx);
            self.tracker.spawn(run_worker(
                self.topic.clone(),
                lane,
                self.handlers.clone(),
                rx,
                Arc::clone(&self.metrics),
            ));
        }

        let this = Arc::clone(&self);
        self.tracker.spawn(async move {
            this.run_fetch_loop(shutdown, client, reader, senders).await;
        });
        Ok(())
    }

    async fn run_fetch_loop(
        self: Arc<Self>,
        shutdown: CancellationToken,
        client: Arc<dyn BrokerClient>,
        reader: Arc<dyn RecordReader>,
        senders: Vec<mpsc::Sender<Record>>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = reader.close().await;
                    break;
                }
                fetched = reader.read() => match fetched {
                    Ok(record) => {
                        if record.key.is_empty() || record.value.is_empty() {
                            debug!(
                                topic = %self.topic,
                                partition = record.partition,
                                offset = record.offset,
                                "skipping record without key or value"
                            );
                            continue;
                        }
                        if self.config.log_payload {
                            debug!(
                                topic = %self.topic,
                                offset = record.offset,
                                payload = %String::from_utf8_lossy(&record.value),
                                "fetched record"
                            );
                        }
                        let lane = lane_for_key(&record.key, senders.len());
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                let _ = reader.close().await;
                                break;
                            }
                            sent = senders[lane].send(record) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) if e.is_end_of_stream() => {
                        warn!(
                            topic = %self.topic,
                            wait_secs = RECONNECT_WAIT.as_secs(),
                            "stream ended, scheduling fetch loop restart"
                        );
                        let _ = reader.close().await;
                        self.metrics.record_reconnect();
                        self.schedule_restart(shutdown, client);
                        break;
                    }
                    Err(e) => {
                        warn!(topic = %self.topic, error = %e, "fetch failed");
                    }
                }
            }
        }
        // senders drop here: lanes close, workers drain and exit
    }

    fn schedule_restart(self: &Arc<Self>, shutdown: CancellationToken, client: Arc<dyn BrokerClient>) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(RECONNECT_WAIT) => {
                    if let Err(e) = Arc::clone(&this).spin_up(shutdown.clone(), client).await {
                        error!(topic = %this.topic, error = %e, "fetch loop restart failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl SubscriberStrategy for AutoCommitStrategy {
    async fn start(
        self: Arc<Self>,
        token: CancellationToken,
        client: Arc<dyn BrokerClient>,
    ) -> Result<()> {
        self.spin_up(token, client).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(token) = self.shutdown.lock().clone() {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

async fn run_worker(
    topic: String,
    lane: usize,
    handlers: Vec<HandlerFn>,
    mut lane_rx: mpsc::Receiver<Record>,
    metrics: Arc<BusMetrics>,
) {
    while let Some(record) = lane_rx.recv().await {
        for handler in &handlers {
            if let Err(e) = handler(record.value.clone()).await {
                metrics.record_handler_failure();
                error!(
                    topic = %topic,
                    lane,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "handler failed"
                );
            }
        }
        metrics.record_dispatch();
    }
    debug!(topic = %topic, lane, "worker drained and stopped");
}
