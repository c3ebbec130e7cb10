//! Producer delivery path: envelope construction, serialization, and
//! retried batch writes
//!
//! A producer is bound to one topic and one underlying writer configured
//! with the FNV-1a hash balancer, so all messages sharing a routing key
//! land on the same partition. Leader-elections are waited out with a
//! fixed-interval retry; every other write error is surfaced immediately.

use crate::client::{Record, RecordWriter};
use crate::config::ProducerConfig;
use crate::context::Context;
use crate::envelope::Message;
use crate::error::BusError;
use crate::metrics::{global_metrics, BusMetrics};
use crate::Result;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Producer for one topic
pub struct Producer {
    topic: String,
    config: ProducerConfig,
    writer: Arc<dyn RecordWriter>,
    metrics: Arc<BusMetrics>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .field("config", &self.config)
            .finish()
    }
}

impl Producer {
    pub(crate) fn new(
        topic: String,
        config: ProducerConfig,
        writer: Arc<dyn RecordWriter>,
    ) -> Self {
        Self {
            topic,
            config,
            writer,
            metrics: global_metrics(),
        }
    }

    /// Topic this producer writes to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send one payload under the given routing key
    ///
    /// The request context is extracted from `ctx` and embedded in the
    /// envelope; a carrier without one is rejected.
    pub async fn send<T: Serialize>(&self, ctx: &Context, key: &str, payload: &T) -> Result<()> {
        self.send_many(ctx, &[(key, payload)]).await
    }

    /// Send a batch of (key, payload) pairs as one write
    pub async fn send_many<T: Serialize>(
        &self,
        ctx: &Context,
        messages: &[(&str, &T)],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let request = ctx.request().ok_or(BusError::InvalidMessageContext)?;

        let mut records = Vec::with_capacity(messages.len());
        for (key, payload) in messages {
            let value = serde_json::to_value(payload)
                .map_err(|source| BusError::MarshalFailed { source })?;
            let envelope = Message::new(request.clone(), *key, value);
            records.push(Record::outbound(
                self.topic.clone(),
                Bytes::copy_from_slice(key.as_bytes()),
                envelope.marshal()?,
            ));
        }

        if self.config.async_send {
            let writer = Arc::clone(&self.writer);
            let metrics = Arc::clone(&self.metrics);
            let topic = self.topic.clone();
            let retry_count = self.config.retry_count;
            let retry_interval = self.config.retry_interval;
            tokio::spawn(async move {
                if let Err(e) = write_with_retry(
                    writer.as_ref(),
                    &topic,
                    records,
                    retry_count,
                    retry_interval,
                    &metrics,
                )
                .await
                {
                    error!(topic = %topic, error = %e, code = e.code(), "async write failed");
                }
            });
            return Ok(());
        }

        write_with_retry(
            self.writer.as_ref(),
            &self.topic,
            records,
            self.config.retry_count,
            self.config.retry_interval,
            &self.metrics,
        )
        .await
    }

    /// Close the underlying writer
    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }
}

/// Write the batch, waiting out leader elections up to `retry_count` times
async fn write_with_retry(
    writer: &dyn RecordWriter,
    topic: &str,
    records: Vec<Record>,
    retry_count: usize,
    retry_interval: Duration,
    metrics: &BusMetrics,
) -> Result<()> {
    let count = records.len() as u64;
    let mut attempt = 0usize;
    loop {
        match writer.write(records.clone()).await {
            Ok(()) => {
                metrics.record_publish(count);
                return Ok(());
            }
            Err(e) if e.is_leader_not_available() && attempt < retry_count => {
                attempt += 1;
                metrics.record_publish_retry();
                warn!(topic, attempt, error = %e, "leader not available, retrying write");
                sleep(retry_interval).await;
            }
            Err(e) if e.is_leader_not_available() => {
                metrics.record_publish_error();
                return Err(BusError::WriteFailed {
                    attempts: attempt + 1,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                metrics.record_publish_error();
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BrokerClient, WriterConfig};
    use crate::context::RequestContext;
    use crate::memory::MemoryBroker;
    use serde_json::json;

    async fn producer_for(broker: &MemoryBroker, config: ProducerConfig) -> Producer {
        broker.create_topic("orders", 1);
        let writer = broker
            .open_writer(WriterConfig {
                topic: "orders".to_string(),
                balancer: Default::default(),
                required_acks: config.required_acks,
                batch_size: config.batch_size,
                batch_timeout: config.batch_timeout,
                max_attempts: config.max_attempts,
            })
            .await
            .unwrap();
        Producer::new("orders".to_string(), config, writer)
    }

    fn request_ctx() -> Context {
        Context::with_request(RequestContext::new("req-1"))
    }

    #[tokio::test]
    async fn test_send_requires_request_context() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, ProducerConfig::default()).await;

        let err = producer
            .send(&Context::background(), "k", &json!({"n": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE_CONTEXT");
        assert!(broker.records("orders").is_empty());
    }

    #[tokio::test]
    async fn test_send_writes_serialized_envelope() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, ProducerConfig::default()).await;

        producer
            .send(&request_ctx(), "user-1", &json!({"n": 41}))
            .await
            .unwrap();

        let records = broker.records("orders");
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].key[..], b"user-1");

        let envelope = Message::unmarshal(&records[0].value).unwrap();
        assert_eq!(envelope.key, "user-1");
        assert_eq!(envelope.ctx.request_id, "req-1");
        assert_eq!(envelope.payload["n"], 41);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_not_available_is_retried() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, ProducerConfig::default()).await;

        broker.fail_next_write(BusError::LeaderNotAvailable {
            topic: "orders".to_string(),
        });
        broker.fail_next_write(BusError::LeaderNotAvailable {
            topic: "orders".to_string(),
        });

        producer
            .send(&request_ctx(), "k", &json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(broker.records("orders").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_surfaces_write_error() {
        let broker = MemoryBroker::new();
        let config = ProducerConfig::builder().retry_count(2).build();
        let producer = producer_for(&broker, config).await;

        for _ in 0..3 {
            broker.fail_next_write(BusError::LeaderNotAvailable {
                topic: "orders".to_string(),
            });
        }

        let err = producer
            .send(&request_ctx(), "k", &json!({"n": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WRITE_FAILED");
    }

    #[tokio::test]
    async fn test_other_write_errors_are_fatal_immediately() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, ProducerConfig::default()).await;

        broker.fail_next_write(BusError::connection("broker gone"));

        let err = producer
            .send(&request_ctx(), "k", &json!({"n": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        // the fault was consumed on the first and only attempt
        assert!(broker.records("orders").is_empty());
    }

    #[tokio::test]
    async fn test_async_send_hides_write_failures() {
        let broker = MemoryBroker::new();
        let config = ProducerConfig::builder().async_send(true).retry_count(0).build();
        let producer = producer_for(&broker, config).await;

        broker.fail_next_write(BusError::connection("broker gone"));
        producer
            .send(&request_ctx(), "k", &json!({"n": 1}))
            .await
            .unwrap();

        // a subsequent send lands even though the first was dropped
        producer
            .send(&request_ctx(), "k", &json!({"n": 2}))
            .await
            .unwrap();
        for _ in 0..100 {
            if broker.records("orders").len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.records("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_send_many_is_one_batch() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, ProducerConfig::default()).await;

        let a = json!({"n": 1});
        let b = json!({"n": 2});
        producer
            .send_many(&request_ctx(), &[("k0", &a), ("k1", &b)])
            .await
            .unwrap();
        assert_eq!(broker.records("orders").len(), 2);
    }
}
