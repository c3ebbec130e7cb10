//! # streambus
//!
//! A client-side messaging layer for Kafka-compatible brokers.
//!
//! streambus gives producers and consumers of a service fleet one way to
//! publish and consume envelopes that carry propagated request context,
//! while handling the hard distributed-systems concerns itself:
//!
//! - **Per-key ordering**: messages sharing a routing key land on one
//!   partition and are dispatched on one worker lane, in fetch order
//! - **Bounded concurrency**: a fixed worker pool per subscription, each
//!   worker fed by its own bounded queue
//! - **Commit modes**: broker-side auto-commit for throughput, or
//!   client-driven per-message commit for at-least-once delivery
//! - **Failure isolation**: retried handling with a dead-letter escape
//!   path under manual commit
//! - **Self-healing**: fetch loops restart themselves after an
//!   end-of-stream disconnect
//!
//! ## Producing
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streambus::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::new();
//!     let config = BrokerConfig::builder()
//!         .client_id("svc-orders")
//!         .urls(vec!["localhost:9092"])
//!         .allow_topic_creation(true)
//!         .build();
//!     broker.init(config, Arc::new(MemoryBroker::new())).await?;
//!
//!     let producer = broker
//!         .add_producer(
//!             TopicConfig::new("orders").with_partitions(3),
//!             ProducerConfig::default(),
//!         )
//!         .await?;
//!
//!     let ctx = Context::with_request(RequestContext::new("req-1"));
//!     producer
//!         .send(&ctx, "user-123", &serde_json::json!({"total": 42}))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Subscribing
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use streambus::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::new();
//!     let config = BrokerConfig::builder()
//!         .urls(vec!["localhost:9092"])
//!         .build();
//!     broker.init(config, Arc::new(MemoryBroker::new())).await?;
//!
//!     // a positive commit interval selects the auto-commit strategy
//!     let subscription = SubscriberConfig::builder()
//!         .group_id("billing")
//!         .commit_interval(Duration::from_secs(1))
//!         .worker_count(4)
//!         .build()?;
//!
//!     broker.add_subscriber(
//!         TopicConfig::new("orders"),
//!         subscription,
//!         vec![handler_fn(|payload| async move {
//!             let envelope = Message::unmarshal(&payload)?;
//!             println!("order: {}", envelope.payload);
//!             Ok(())
//!         })],
//!     )?;
//!
//!     broker.start().await?;
//!     // ... application runtime ...
//!     broker.close().await
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod routing;
pub mod subscriber;

mod auto_commit;
mod manual_commit;

pub use broker::Broker;
pub use client::{Balancer, BrokerClient, ReaderConfig, Record, RecordReader, RecordWriter, WriterConfig};
pub use config::{
    BrokerConfig, BrokerConfigBuilder, ManualCommitConfig, ProducerConfig, ProducerConfigBuilder,
    RequiredAcks, Sasl, SaslMechanism, StartOffset, SubscriberConfig, SubscriberConfigBuilder,
    TopicConfig,
};
pub use context::{Context, RequestContext};
pub use envelope::{DlqMessage, Message};
pub use error::BusError;
pub use memory::MemoryBroker;
pub use metrics::{global_metrics, BusMetrics, MetricsSnapshot};
pub use producer::Producer;
pub use subscriber::{handler_fn, HandlerError, HandlerFn, Subscriber};

/// Result type used across the messaging layer
pub type Result<T> = std::result::Result<T, BusError>;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
