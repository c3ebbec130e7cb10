//! Configuration types for the streambus messaging layer

use crate::error::BusError;
use crate::producer::Producer;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Broker-level configuration. Immutable after `Broker::init`.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Client identifier reported to the broker
    pub client_id: String,
    /// Broker address list; must be non-empty
    pub urls: Vec<String>,
    /// Create registered topics on `start` when they do not exist
    pub allow_topic_creation: bool,
    /// SASL settings
    pub sasl: Sasl,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: "streambus".to_string(),
            urls: Vec::new(),
            allow_topic_creation: false,
            sasl: Sasl::default(),
        }
    }
}

impl BrokerConfig {
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Validate the configuration; a non-empty url list is mandatory
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(BusError::invalid_config("broker url list is empty"));
        }
        if self.sasl.enabled {
            self.sasl.mechanism()?;
        }
        Ok(())
    }
}

/// SASL settings: an enabled flag, a mechanism name, and credentials
#[derive(Debug, Clone, Default)]
pub struct Sasl {
    pub enabled: bool,
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl Sasl {
    /// Resolve the configured mechanism name. An unknown name is a hard
    /// configuration error.
    pub fn mechanism(&self) -> Result<SaslMechanism> {
        match self.mechanism.to_ascii_lowercase().as_str() {
            "plain" => Ok(SaslMechanism::Plain),
            "scram-sha-256" => Ok(SaslMechanism::ScramSha256),
            "scram-sha-512" => Ok(SaslMechanism::ScramSha512),
            _ => Err(BusError::UnsupportedSaslMechanism {
                mechanism: self.mechanism.clone(),
            }),
        }
    }
}

/// Supported SASL mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

/// Builder for BrokerConfig
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.urls = urls.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn allow_topic_creation(mut self, allow: bool) -> Self {
        self.config.allow_topic_creation = allow;
        self
    }

    pub fn sasl(mut self, sasl: Sasl) -> Self {
        self.config.sasl = sasl;
        self
    }

    pub fn build(self) -> BrokerConfig {
        self.config
    }
}

/// Topic registration: a required name plus optional creation parameters
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Topic name; must be non-empty
    pub name: String,
    /// Partition count used when the broker creates the topic
    pub partitions: Option<u32>,
    /// Key/value topic configuration entries
    pub config: Option<HashMap<String, String>>,
}

impl TopicConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            partitions: None,
            config: None,
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_config_entry<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BusError::invalid_config("topic name is empty"));
        }
        Ok(())
    }
}

/// Acknowledgment level required from the broker on writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// Fire into the socket, wait for nobody
    None,
    /// Wait for the partition leader
    Leader,
    /// Wait for full in-sync replication
    All,
}

impl RequiredAcks {
    /// Kafka wire value for this level
    pub fn as_i16(self) -> i16 {
        match self {
            Self::None => 0,
            Self::Leader => 1,
            Self::All => -1,
        }
    }
}

pub(crate) const DEFAULT_RETRY_COUNT: usize = 3;
pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Producer configuration; every field has a documented default
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Records accumulated by the underlying writer before a flush
    pub batch_size: usize,
    /// Maximum time the underlying writer holds a partial batch
    pub batch_timeout: Duration,
    /// Acknowledgment level for writes
    pub required_acks: RequiredAcks,
    /// Write attempt budget inside the underlying client
    pub max_attempts: usize,
    /// Fire-and-forget mode: failures are logged, not returned
    pub async_send: bool,
    /// Retry budget for leader-not-available write errors
    pub retry_count: usize,
    /// Fixed sleep between those retries
    pub retry_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            required_acks: RequiredAcks::Leader,
            max_attempts: 3,
            async_send: false,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ProducerConfig {
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::new()
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    pub fn required_acks(mut self, acks: RequiredAcks) -> Self {
        self.config.required_acks = acks;
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn async_send(mut self, async_send: bool) -> Self {
        self.config.async_send = async_send;
        self
    }

    pub fn retry_count(mut self, count: usize) -> Self {
        self.config.retry_count = count;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

/// Position a fresh consumer group starts reading from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

pub(crate) const DEFAULT_WORKER_COUNT: usize = 4;

/// Subscriber configuration. The commit interval selects the strategy:
/// a strictly positive interval selects auto-commit, otherwise the
/// subscriber runs manual per-message commit.
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Consumer group id; empty means no group (fan-out consumption)
    pub group_id: String,
    /// Maximum time one fetch waits for records
    pub batch_timeout: Duration,
    /// Broker-side periodic commit interval; zero means unset
    pub commit_interval: Duration,
    /// Fixed number of worker lanes
    pub worker_count: usize,
    /// Fetch attempt budget inside the underlying client
    pub max_attempts: usize,
    /// Where a fresh group starts reading
    pub start_offset: StartOffset,
    /// Backoff between group-join attempts
    pub join_group_backoff: Duration,
    /// Log consumed payloads at debug level
    pub log_payload: bool,
    /// Manual-commit tuning; mutually exclusive with a positive commit interval
    pub manual_commit: Option<ManualCommitConfig>,
    /// Dead-letter producer; only meaningful under manual commit
    pub dlq_producer: Option<Arc<Producer>>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            batch_timeout: Duration::from_secs(10),
            commit_interval: Duration::ZERO,
            worker_count: DEFAULT_WORKER_COUNT,
            max_attempts: 3,
            start_offset: StartOffset::Earliest,
            join_group_backoff: Duration::from_secs(5),
            log_payload: false,
            manual_commit: None,
            dlq_producer: None,
        }
    }
}

impl std::fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("group_id", &self.group_id)
            .field("batch_timeout", &self.batch_timeout)
            .field("commit_interval", &self.commit_interval)
            .field("worker_count", &self.worker_count)
            .field("max_attempts", &self.max_attempts)
            .field("start_offset", &self.start_offset)
            .field("join_group_backoff", &self.join_group_backoff)
            .field("log_payload", &self.log_payload)
            .field("manual_commit", &self.manual_commit)
            .field("dlq_producer", &self.dlq_producer.is_some())
            .finish()
    }
}

impl SubscriberConfig {
    pub fn builder() -> SubscriberConfigBuilder {
        SubscriberConfigBuilder::new()
    }

    /// True when the positive commit interval selects the auto-commit strategy
    pub fn is_auto_commit(&self) -> bool {
        self.commit_interval > Duration::ZERO
    }

    /// Validate strategy-selection invariants
    pub fn validate(&self) -> Result<()> {
        if self.is_auto_commit() && self.manual_commit.is_some() {
            return Err(BusError::invalid_config(
                "manual-commit configuration and a positive commit interval are mutually exclusive",
            ));
        }
        if self.is_auto_commit() && self.dlq_producer.is_some() {
            return Err(BusError::invalid_config(
                "a DLQ producer requires manual commit",
            ));
        }
        if self.worker_count == 0 {
            return Err(BusError::invalid_config("worker count must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for SubscriberConfig
#[derive(Debug, Default)]
pub struct SubscriberConfigBuilder {
    config: SubscriberConfig,
}

impl SubscriberConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.config.commit_interval = interval;
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn start_offset(mut self, offset: StartOffset) -> Self {
        self.config.start_offset = offset;
        self
    }

    pub fn join_group_backoff(mut self, backoff: Duration) -> Self {
        self.config.join_group_backoff = backoff;
        self
    }

    pub fn log_payload(mut self, log_payload: bool) -> Self {
        self.config.log_payload = log_payload;
        self
    }

    pub fn manual_commit(mut self, manual_commit: ManualCommitConfig) -> Self {
        self.config.manual_commit = Some(manual_commit);
        self
    }

    pub fn dlq_producer(mut self, producer: Arc<Producer>) -> Self {
        self.config.dlq_producer = Some(producer);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<SubscriberConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

pub(crate) const DEFAULT_MANUAL_MAX_RETRIES: u32 = 5;
pub(crate) const DEFAULT_MANUAL_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Retry tuning for the manual-commit strategy. Negative or unset values
/// fall back to the defaults (5 retries, 500ms backoff step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualCommitConfig {
    /// Attempt budget for the per-message commit call
    pub commit_max_retries: u32,
    /// Base backoff step for commit retries; doubled per attempt
    pub commit_backoff_step: Duration,
    /// Attempt budget for the handler chain
    pub handle_max_retries: u32,
    /// Base backoff step for handler retries; doubled per attempt
    pub handle_backoff_step: Duration,
}

impl Default for ManualCommitConfig {
    fn default() -> Self {
        Self {
            commit_max_retries: DEFAULT_MANUAL_MAX_RETRIES,
            commit_backoff_step: DEFAULT_MANUAL_BACKOFF_STEP,
            handle_max_retries: DEFAULT_MANUAL_MAX_RETRIES,
            handle_backoff_step: DEFAULT_MANUAL_BACKOFF_STEP,
        }
    }
}

impl ManualCommitConfig {
    /// Build from raw settings where negative means "use the default"
    pub fn from_raw(
        commit_max_retries: i64,
        commit_backoff_step_ms: i64,
        handle_max_retries: i64,
        handle_backoff_step_ms: i64,
    ) -> Self {
        let defaults = Self::default();
        Self {
            commit_max_retries: if commit_max_retries < 0 {
                defaults.commit_max_retries
            } else {
                commit_max_retries as u32
            },
            commit_backoff_step: if commit_backoff_step_ms < 0 {
                defaults.commit_backoff_step
            } else {
                Duration::from_millis(commit_backoff_step_ms as u64)
            },
            handle_max_retries: if handle_max_retries < 0 {
                defaults.handle_max_retries
            } else {
                handle_max_retries as u32
            },
            handle_backoff_step: if handle_backoff_step_ms < 0 {
                defaults.handle_backoff_step
            } else {
                Duration::from_millis(handle_backoff_step_ms as u64)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_requires_urls() {
        let config = BrokerConfig::builder().client_id("svc-orders").build();
        assert!(config.validate().is_err());

        let config = BrokerConfig::builder()
            .client_id("svc-orders")
            .urls(vec!["broker1:9092", "broker2:9092"])
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.urls.len(), 2);
    }

    #[test]
    fn test_sasl_mechanism_resolution() {
        let mut sasl = Sasl {
            enabled: true,
            mechanism: "scram-sha-512".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(sasl.mechanism().unwrap(), SaslMechanism::ScramSha512);

        sasl.mechanism = "PLAIN".to_string();
        assert_eq!(sasl.mechanism().unwrap(), SaslMechanism::Plain);

        sasl.mechanism = "gssapi".to_string();
        let err = sasl.mechanism().unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_SASL_MECHANISM");
    }

    #[test]
    fn test_invalid_sasl_fails_broker_validation() {
        let config = BrokerConfig::builder()
            .urls(vec!["broker1:9092"])
            .sasl(Sasl {
                enabled: true,
                mechanism: "oauthbearer".to_string(),
                username: String::new(),
                password: String::new(),
            })
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topic_config_requires_name() {
        assert!(TopicConfig::new("").validate().is_err());

        let topic = TopicConfig::new("orders")
            .with_partitions(3)
            .with_config_entry("retention.ms", "60000");
        assert!(topic.validate().is_ok());
        assert_eq!(topic.partitions, Some(3));
    }

    #[test]
    fn test_producer_config_defaults() {
        let config = ProducerConfig::default();
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.required_acks, RequiredAcks::Leader);
        assert!(!config.async_send);
    }

    #[test]
    fn test_subscriber_strategy_selection_rule() {
        let auto = SubscriberConfig::builder()
            .group_id("grp")
            .commit_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(auto.is_auto_commit());

        let manual = SubscriberConfig::builder().group_id("grp").build().unwrap();
        assert!(!manual.is_auto_commit());
    }

    #[test]
    fn test_manual_commit_and_interval_are_exclusive() {
        let err = SubscriberConfig::builder()
            .commit_interval(Duration::from_secs(1))
            .manual_commit(ManualCommitConfig::default())
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_manual_commit_defaults_from_raw() {
        let config = ManualCommitConfig::from_raw(-1, -1, 2, 100);
        assert_eq!(config.commit_max_retries, 5);
        assert_eq!(config.commit_backoff_step, Duration::from_millis(500));
        assert_eq!(config.handle_max_retries, 2);
        assert_eq!(config.handle_backoff_step, Duration::from_millis(100));
    }

    #[test]
    fn test_required_acks_wire_values() {
        assert_eq!(RequiredAcks::None.as_i16(), 0);
        assert_eq!(RequiredAcks::Leader.as_i16(), 1);
        assert_eq!(RequiredAcks::All.as_i16(), -1);
    }
}
