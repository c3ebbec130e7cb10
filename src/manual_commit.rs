//! Manual-commit delivery strategy
//!
//! Client-driven, retried handling with explicit per-message commit and a
//! dead-letter escape path for poison messages. Lanes are keyed by
//! partition number — commit order must stay coherent with fetch order,
//! so every record of one partition is handled by the same lane.
//!
//! Per message: handle with retry, then either commit, forward to the
//! dead-letter topic and commit, or skip without committing so the broker
//! redelivers it later. A message is never silently dropped.

use crate::client::{BrokerClient, ReaderConfig, Record, RecordReader};
use crate::config::{ManualCommitConfig, SubscriberConfig};
use crate::context::{Context, RequestContext};
use crate::envelope::{DlqMessage, Message};
use crate::error::BusError;
use crate::metrics::{global_metrics, BusMetrics};
use crate::producer::Producer;
use crate::routing::lane_for_partition;
use crate::subscriber::{group_of, HandlerFn, SubscriberStrategy, LANE_CAPACITY, RECONNECT_WAIT};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

pub(crate) struct ManualCommitStrategy {
    topic: String,
    config: SubscriberConfig,
    manual: ManualCommitConfig,
    handlers: Vec<HandlerFn>,
    tracker: TaskTracker,
    shutdown: Mutex<Option<CancellationToken>>,
    metrics: Arc<BusMetrics>,
}

/// Everything one worker lane needs to process records
struct LaneContext {
    topic: String,
    manual: ManualCommitConfig,
    handlers: Vec<HandlerFn>,
    reader: Arc<dyn RecordReader>,
    dlq_producer: Option<Arc<Producer>>,
    metrics: Arc<BusMetrics>,
}

impl ManualCommitStrategy {
    pub(crate) fn new(topic: String, config: SubscriberConfig, handlers: Vec<HandlerFn>) -> Self {
        let manual = config.manual_commit.unwrap_or_default();
        Self {
            topic,
            config,
            manual,
            handlers,
            tracker: TaskTracker::new(),
            shutdown: Mutex::new(None),
            metrics: global_metrics(),
        }
    }

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
                commit_interval: None,
                join_group_backoff: self.config.join_group_backoff,
                max_attempts: self.config.max_attempts,
            })
            .await?;

        let mut senders = Vec::with_capacity(self.config.worker_count);
        for lane in 0..self.config.worker_count {
            let (tx, rx) = mpsc::channel(LANE_CAPACITY);
            senders.push(tx);
            let lane_ctx = Arc::new(LaneContext {
                topic: self.topic.clone(),
                manual: self.manual,
                handlers: self.handlers.clone(),
                reader: Arc::clone(&reader),
                dlq_producer: self.config.dlq_producer.clone(),
                metrics: Arc::clone(&self.metrics),
            });
            self.tracker.spawn(run_worker(lane_ctx, lane, rx));
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
                fetched = reader.fetch() => match fetched {
                    Ok(record) => {
                        if self.config.log_payload {
                            debug!(
                                topic = %self.topic,
                                offset = record.offset,
                                payload = %String::from_utf8_lossy(&record.value),
                                "fetched record"
                            );
                        }
                        let lane = lane_for_partition(record.partition, senders.len());
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
impl SubscriberStrategy for ManualCommitStrategy {
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

async fn run_worker(ctx: Arc<LaneContext>, lane: usize, mut lane_rx: mpsc::Receiver<Record>) {
    while let Some(record) = lane_rx.recv().await {
        process_record(&ctx, lane, record).await;
    }
    debug!(topic = %ctx.topic, lane, "worker drained and stopped");
}

/// One message through its full lifecycle: handle, maybe dead-letter,
/// commit — or skip without committing so the broker redelivers
async fn process_record(ctx: &LaneContext, lane: usize, record: Record) {
    if let Err(e) = handle_with_retry(&ctx.handlers, &record, &ctx.manual).await {
        ctx.metrics.record_handler_failure();
        error!(
            topic = %ctx.topic,
            lane,
            partition = record.partition,
            offset = record.offset,
            error = %e,
            code = e.code(),
            "handling failed terminally"
        );

        let Some(dlq) = &ctx.dlq_producer else {
            warn!(
                topic = %ctx.topic,
                partition = record.partition,
                offset = record.offset,
                "no dead-letter producer configured, leaving message uncommitted"
            );
            return;
        };
        match forward_to_dlq(dlq, &ctx.topic, &record).await {
            Ok(()) => {
                ctx.metrics.record_dlq_message();
                debug!(
                    topic = %ctx.topic,
                    dlq_topic = dlq.topic(),
                    offset = record.offset,
                    "message forwarded to dead-letter topic"
                );
            }
            Err(e) => {
                let e = BusError::DlqFailed {
                    source: Box::new(e),
                };
                error!(
                    topic = %ctx.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    code = e.code(),
                    "dead-letter send failed, leaving message uncommitted"
                );
                return;
            }
        }
    }

    commit_with_retry(ctx.reader.as_ref(), &ctx.topic, &record, &ctx.manual, &ctx.metrics).await;
    ctx.metrics.record_dispatch();
}

/// Invoke the full handler chain, retrying with exponential backoff.
/// The chain runs at most `handle_max_retries` times.
async fn handle_with_retry(
    handlers: &[HandlerFn],
    record: &Record,
    config: &ManualCommitConfig,
) -> Result<()> {
    let attempts = config.handle_max_retries.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        match run_chain(handlers, record).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    offset = record.offset,
                    attempt = attempt + 1,
                    error = %e,
                    "handler chain failed"
                );
                last_error = Some(e);
                if attempt + 1 < attempts {
                    sleep(backoff_delay(config.handle_backoff_step, attempt)).await;
                }
            }
        }
    }
    Err(BusError::HandleFailed {
        attempts,
        source: last_error.expect("at least one attempt ran"),
    })
}

async fn run_chain(
    handlers: &[HandlerFn],
    record: &Record,
) -> std::result::Result<(), crate::subscriber::HandlerError> {
    for handler in handlers {
        handler(record.value.clone()).await?;
    }
    Ok(())
}

/// Forward the raw record value to the dead-letter topic. The original
/// request context is recovered from the envelope when it still parses;
/// a synthetic one is minted for poison bytes.
async fn forward_to_dlq(dlq: &Producer, topic: &str, record: &Record) -> Result<()> {
    let request = Message::unmarshal(&record.value)
        .map(|envelope| envelope.ctx)
        .unwrap_or_else(|_| {
            RequestContext::new(format!("dlq-{}-{}-{}", topic, record.partition, record.offset))
        });
    let key = String::from_utf8_lossy(&record.key).into_owned();
    let dlq_message = DlqMessage::new(topic, &record.value);
    dlq.send(&Context::with_request(request), &key, &dlq_message)
        .await
}

/// Commit one record's offset, retrying with exponential backoff.
/// Exhaustion is terminal but absorbed: the message was handled, its
/// offset may simply be redelivered later.
async fn commit_with_retry(
    reader: &dyn RecordReader,
    topic: &str,
    record: &Record,
    config: &ManualCommitConfig,
    metrics: &BusMetrics,
) {
    let attempts = config.commit_max_retries.max(1);
    for attempt in 0..attempts {
        match reader.commit(record).await {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    topic = %topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempt = attempt + 1,
                    error = %e,
                    "commit failed"
                );
                if attempt + 1 < attempts {
                    sleep(backoff_delay(config.commit_backoff_step, attempt)).await;
                } else {
                    metrics.record_commit_failure();
                    let e = BusError::CommitFailed {
                        attempts,
                        source: Box::new(e),
                    };
                    error!(
                        topic = %topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        code = e.code(),
                        "commit failed terminally, offset may be redelivered"
                    );
                }
            }
        }
    }
}

/// Backoff before retry `attempt + 1`: `step * 2^attempt`
fn backoff_delay(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::handler_fn;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record() -> Record {
        Record {
            topic: "orders".to_string(),
            partition: 0,
            offset: 7,
            key: Bytes::from("k"),
            value: Bytes::from("v"),
        }
    }

    fn failing_handler(counter: Arc<AtomicU32>) -> HandlerFn {
        handler_fn(move |_payload| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("always fails".into())
            }
        })
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let step = Duration::from_millis(500);
        assert_eq!(backoff_delay(step, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(step, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(step, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(step, 3), Duration::from_millis(4000));
        // strictly increasing
        for attempt in 0..10 {
            assert!(backoff_delay(step, attempt) < backoff_delay(step, attempt + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_with_retry_respects_attempt_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let config = ManualCommitConfig {
            handle_max_retries: 3,
            handle_backoff_step: Duration::from_millis(500),
            ..Default::default()
        };

        let err = handle_with_retry(
            &[failing_handler(Arc::clone(&counter))],
            &record(),
            &config,
        )
        .await
        .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(err.code(), "HANDLE_FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_with_retry_stops_on_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let flaky = {
            let counter = Arc::clone(&counter);
            handler_fn(move |_payload| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet".into())
                    } else {
                        Ok(())
                    }
                }
            })
        };
        let config = ManualCommitConfig {
            handle_max_retries: 5,
            handle_backoff_step: Duration::from_millis(10),
            ..Default::default()
        };

        handle_with_retry(&[flaky], &record(), &config).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    struct FlakyCommitReader {
        commit_calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl RecordReader for FlakyCommitReader {
        async fn read(&self) -> Result<Record> {
            Err(BusError::EndOfStream)
        }

        async fn fetch(&self) -> Result<Record> {
            Err(BusError::EndOfStream)
        }

        async fn commit(&self, _record: &Record) -> Result<()> {
            let call = self.commit_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(BusError::connection("commit refused"))
            } else {
                Ok(())
            }
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_with_retry_eventually_succeeds() {
        let reader = FlakyCommitReader {
            commit_calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let config = ManualCommitConfig::default();
        let metrics = BusMetrics::default();

        commit_with_retry(&reader, "orders", &record(), &config, &metrics).await;
        assert_eq!(reader.commit_calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().commit_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_with_retry_absorbs_terminal_failure() {
        let reader = FlakyCommitReader {
            commit_calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let config = ManualCommitConfig {
            commit_max_retries: 4,
            commit_backoff_step: Duration::from_millis(100),
            ..Default::default()
        };
        let metrics = BusMetrics::default();

        commit_with_retry(&reader, "orders", &record(), &config, &metrics).await;
        assert_eq!(reader.commit_calls.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.snapshot().commit_failures, 1);
    }
}
