//! Subscriber: configuration-driven selection of a delivery strategy
//!
//! A subscriber is a thin configuration object. At construction it
//! validates the config and picks exactly one of two strategies — a
//! strictly positive commit interval selects [`AutoCommitStrategy`],
//! anything else selects [`ManualCommitStrategy`] — and never changes
//! its mind afterwards. `start` and `close` just delegate.

use crate::auto_commit::AutoCommitStrategy;
use crate::client::BrokerClient;
use crate::config::SubscriberConfig;
use crate::error::BusError;
use crate::manual_commit::ManualCommitStrategy;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capacity of each worker lane's input queue
pub(crate) const LANE_CAPACITY: usize = 255;

/// Wait before a fetch loop restarts itself after end-of-stream
pub(crate) const RECONNECT_WAIT: Duration = Duration::from_secs(30);

/// Empty group ids mean "no consumer group"
pub(crate) fn group_of(group_id: &str) -> Option<String> {
    if group_id.is_empty() {
        None
    } else {
        Some(group_id.to_string())
    }
}

/// Error type handlers are allowed to return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The contract every registered handler must satisfy: raw record value
/// in, success or error out
pub type HandlerFn =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// One delivery strategy: owns the fetch loop and worker pool for a
/// (topic, group) pair
#[async_trait]
pub(crate) trait SubscriberStrategy: Send + Sync {
    /// Spin up the fetch loop and workers under the given lifetime token
    async fn start(
        self: Arc<Self>,
        token: CancellationToken,
        client: Arc<dyn BrokerClient>,
    ) -> Result<()>;

    /// Stop the fetch loop and wait for the workers to drain
    async fn close(&self) -> Result<()>;
}

/// A configured subscription for one (topic, group) pair
pub struct Subscriber {
    topic: String,
    group_id: String,
    strategy: Arc<dyn SubscriberStrategy>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .finish()
    }
}

impl Subscriber {
    /// Validate the configuration and select the strategy
    pub(crate) fn new(
        topic: String,
        config: SubscriberConfig,
        handlers: Vec<HandlerFn>,
    ) -> Result<Self> {
        if handlers.is_empty() {
            return Err(BusError::invalid_config("no handlers registered"));
        }
        config.validate()?;

        let group_id = config.group_id.clone();
        let strategy: Arc<dyn SubscriberStrategy> = if config.is_auto_commit() {
            Arc::new(AutoCommitStrategy::new(topic.clone(), config, handlers))
        } else {
            Arc::new(ManualCommitStrategy::new(topic.clone(), config, handlers))
        };

        Ok(Self {
            topic,
            group_id,
            strategy,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub(crate) async fn start(
        &self,
        token: CancellationToken,
        client: Arc<dyn BrokerClient>,
    ) -> Result<()> {
        Arc::clone(&self.strategy).start(token, client).await
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.strategy.close().await
    }
}
