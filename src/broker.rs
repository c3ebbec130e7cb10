//! Broker lifecycle: connection setup, topic registry, and coordinated
//! startup/shutdown of every registered producer and subscriber
//!
//! The broker owns the canonical registries for its process lifetime.
//! Startup orders topic declaration before the first fetch loop so
//! auto-created topics exist prior to consumption; shutdown fans out a
//! concurrent close over every subscriber, waits for all of them, then
//! closes the control connection and cancels the shared lifetime token.

use crate::client::{Balancer, BrokerClient, WriterConfig};
use crate::config::{BrokerConfig, ProducerConfig, SubscriberConfig, TopicConfig};
use crate::error::BusError;
use crate::producer::Producer;
use crate::subscriber::{HandlerFn, Subscriber};
use crate::Result;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// (topic, group id) — the registry key for one live subscriber
type SubKey = (String, String);

struct Inner {
    config: BrokerConfig,
    client: Arc<dyn BrokerClient>,
    token: CancellationToken,
    topics: Vec<TopicConfig>,
    producers: Vec<Arc<Producer>>,
    subscribers: HashMap<SubKey, Arc<Subscriber>>,
}

/// Top-level lifecycle manager for the messaging layer
pub struct Broker {
    inner: Mutex<Option<Inner>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// An uninitialized broker; call [`Broker::init`] before anything else
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Validate the configuration, resolve SASL, and open the control
    /// connection. Must be called exactly once.
    pub async fn init(&self, config: BrokerConfig, client: Arc<dyn BrokerClient>) -> Result<()> {
        if self.inner.lock().is_some() {
            return Err(BusError::invalid_config("broker already initialized"));
        }
        config.validate()?;

        client.dial(&config).await?;
        info!(client_id = %config.client_id, urls = ?config.urls, "broker connected");

        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(BusError::invalid_config("broker already initialized"));
        }
        *guard = Some(Inner {
            config,
            client,
            token: CancellationToken::new(),
            topics: Vec::new(),
            producers: Vec::new(),
            subscribers: HashMap::new(),
        });
        Ok(())
    }

    /// Register a topic and return a live producer bound to it
    pub async fn add_producer(
        &self,
        topic: TopicConfig,
        config: ProducerConfig,
    ) -> Result<Arc<Producer>> {
        topic.validate()?;

        let client = {
            let mut guard = self.inner.lock();
            let inner = guard.as_mut().ok_or(BusError::NotInitialized)?;
            register_topic(&mut inner.topics, topic.clone());
            Arc::clone(&inner.client)
        };

        let writer = client
            .open_writer(WriterConfig {
                topic: topic.name.clone(),
                balancer: Balancer::Fnv1aHash,
                required_acks: config.required_acks,
                batch_size: config.batch_size,
                batch_timeout: config.batch_timeout,
                max_attempts: config.max_attempts,
            })
            .await?;
        let producer = Arc::new(Producer::new(topic.name, config, writer));

        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(BusError::NotInitialized)?;
        inner.producers.push(Arc::clone(&producer));
        Ok(producer)
    }

    /// Register a topic and a subscriber for it, keyed by (topic, group).
    /// Re-adding the same pair before `start` replaces the prior
    /// registration.
    pub fn add_subscriber(
        &self,
        topic: TopicConfig,
        config: SubscriberConfig,
        handlers: Vec<HandlerFn>,
    ) -> Result<()> {
        topic.validate()?;
        let subscriber = Subscriber::new(topic.name.clone(), config, handlers)?;

        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(BusError::NotInitialized)?;
        register_topic(&mut inner.topics, topic);
        let key = (
            subscriber.topic().to_string(),
            subscriber.group_id().to_string(),
        );
        inner.subscribers.insert(key, Arc::new(subscriber));
        Ok(())
    }

    /// Create every registered topic; a no-op unless topic auto-creation
    /// is enabled. Invoked by `start` before any fetch loop begins.
    pub async fn declare_topics(&self) -> Result<()> {
        let (client, topics) = {
            let guard = self.inner.lock();
            let inner = guard.as_ref().ok_or(BusError::NotInitialized)?;
            if !inner.config.allow_topic_creation || inner.topics.is_empty() {
                return Ok(());
            }
            (Arc::clone(&inner.client), inner.topics.clone())
        };
        info!(count = topics.len(), "declaring topics");
        client.create_topics(&topics).await
    }

    /// Declare topics, then start every registered subscriber
    pub async fn start(&self) -> Result<()> {
        self.declare_topics().await?;

        let (client, token, subscribers) = {
            let guard = self.inner.lock();
            let inner = guard.as_ref().ok_or(BusError::NotInitialized)?;
            (
                Arc::clone(&inner.client),
                inner.token.clone(),
                inner.subscribers.values().cloned().collect::<Vec<_>>(),
            )
        };

        for subscriber in &subscribers {
            subscriber
                .start(token.clone(), Arc::clone(&client))
                .await?;
            info!(
                topic = subscriber.topic(),
                group = subscriber.group_id(),
                "subscriber started"
            );
        }
        Ok(())
    }

    /// Close every subscriber concurrently, wait for all of them, then
    /// release the producers, close the control connection, and cancel
    /// the shared lifetime token
    pub async fn close(&self) -> Result<()> {
        let (client, token, subscribers, producers) = {
            let guard = self.inner.lock();
            let inner = guard.as_ref().ok_or(BusError::NotInitialized)?;
            (
                Arc::clone(&inner.client),
                inner.token.clone(),
                inner.subscribers.values().cloned().collect::<Vec<_>>(),
                inner.producers.clone(),
            )
        };

        let mut first_error = None;
        let results = join_all(subscribers.iter().map(|s| s.close())).await;
        for (subscriber, result) in subscribers.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    topic = subscriber.topic(),
                    group = subscriber.group_id(),
                    error = %e,
                    "subscriber close failed"
                );
                first_error.get_or_insert(e);
            }
        }

        for producer in &producers {
            if let Err(e) = producer.close().await {
                error!(topic = producer.topic(), error = %e, "producer close failed");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = client.close().await {
            error!(error = %e, "closing broker connection failed");
            first_error.get_or_insert(e);
        }
        token.cancel();
        info!("broker closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Register a topic config, replacing any prior one with the same name
fn register_topic(topics: &mut Vec<TopicConfig>, topic: TopicConfig) {
    match topics.iter_mut().find(|t| t.name == topic.name) {
        Some(existing) => *existing = topic,
        None => topics.push(topic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::subscriber::handler_fn;
    use std::time::Duration;

    fn noop_handler() -> HandlerFn {
        handler_fn(|_payload| async { Ok(()) })
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig::builder()
            .client_id("test-client")
            .urls(vec!["mem://local"])
            .allow_topic_creation(true)
            .build()
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let broker = Broker::new();
        let err = broker
            .add_producer(TopicConfig::new("orders"), ProducerConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BROKER_NOT_INITIALIZED");

        let err = broker.declare_topics().await.unwrap_err();
        assert_eq!(err.code(), "BROKER_NOT_INITIALIZED");
    }

    #[tokio::test]
    async fn test_init_validates_config() {
        let broker = Broker::new();
        let client = Arc::new(MemoryBroker::new());
        let err = broker
            .init(BrokerConfig::default(), client)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_init_is_exactly_once() {
        let broker = Broker::new();
        let client = Arc::new(MemoryBroker::new());
        broker
            .init(broker_config(), client.clone())
            .await
            .unwrap();
        let err = broker.init(broker_config(), client).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_add_producer_rejects_empty_topic() {
        let broker = Broker::new();
        broker
            .init(broker_config(), Arc::new(MemoryBroker::new()))
            .await
            .unwrap();
        let err = broker
            .add_producer(TopicConfig::new(""), ProducerConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_add_subscriber_requires_handlers() {
        let broker = Broker::new();
        broker
            .init(broker_config(), Arc::new(MemoryBroker::new()))
            .await
            .unwrap();
        let err = broker
            .add_subscriber(
                TopicConfig::new("orders"),
                SubscriberConfig::default(),
                Vec::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_declare_topics_is_gated_by_flag() {
        let client = MemoryBroker::new();
        let broker = Broker::new();
        let config = BrokerConfig::builder()
            .urls(vec!["mem://local"])
            .allow_topic_creation(false)
            .build();
        broker
            .init(config, Arc::new(client.clone()))
            .await
            .unwrap();
        broker
            .add_subscriber(
                TopicConfig::new("orders").with_partitions(3),
                SubscriberConfig {
                    group_id: "grp".to_string(),
                    ..Default::default()
                },
                vec![noop_handler()],
            )
            .unwrap();

        broker.declare_topics().await.unwrap();
        assert!(client.records("orders").is_empty());
        // topic was never created: a writer-side vivification would show 1
        // partition, creation via declare would show 3
        assert!(client.committed_offset("grp", "orders", 0).is_none());
    }

    #[tokio::test]
    async fn test_same_topic_group_replaces_registration() {
        let broker = Broker::new();
        broker
            .init(broker_config(), Arc::new(MemoryBroker::new()))
            .await
            .unwrap();

        let config = SubscriberConfig {
            group_id: "grp".to_string(),
            ..Default::default()
        };
        broker
            .add_subscriber(
                TopicConfig::new("orders"),
                config.clone(),
                vec![noop_handler()],
            )
            .unwrap();
        broker
            .add_subscriber(TopicConfig::new("orders"), config, vec![noop_handler()])
            .unwrap();

        let guard = broker.inner.lock();
        let inner = guard.as_ref().unwrap();
        assert_eq!(inner.subscribers.len(), 1);
        assert_eq!(inner.topics.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_close_round_trip() {
        let client = MemoryBroker::new();
        let broker = Broker::new();
        broker
            .init(broker_config(), Arc::new(client.clone()))
            .await
            .unwrap();
        broker
            .add_subscriber(
                TopicConfig::new("orders").with_partitions(2),
                SubscriberConfig {
                    group_id: "grp".to_string(),
                    commit_interval: Duration::from_secs(1),
                    ..Default::default()
                },
                vec![noop_handler()],
            )
            .unwrap();

        broker.start().await.unwrap();
        broker.close().await.unwrap();
    }
}
