//! Error types for the streambus messaging layer

/// Main error type for streambus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker operation attempted before `init`
    #[error("broker not initialized")]
    NotInitialized,

    /// Invalid configuration supplied at registration or init time
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// SASL mechanism string does not name a supported mechanism
    #[error("unsupported SASL mechanism: {mechanism}")]
    UnsupportedSaslMechanism { mechanism: String },

    /// No request context attached to the send-side context carrier
    #[error("message context invalid: no request context attached")]
    InvalidMessageContext,

    /// Envelope serialization failure
    #[error("marshal failed")]
    MarshalFailed {
        #[source]
        source: serde_json::Error,
    },

    /// Envelope deserialization failure
    #[error("unmarshal failed")]
    UnmarshalFailed {
        #[source]
        source: serde_json::Error,
    },

    /// Write failed after exhausting the retry budget
    #[error("write failed after {attempts} attempt(s)")]
    WriteFailed {
        attempts: usize,
        #[source]
        source: Box<BusError>,
    },

    /// Transient broker-side condition: partition leader not elected yet
    #[error("leader not available for topic '{topic}'")]
    LeaderNotAvailable { topic: String },

    /// The reader reached end of stream; treated as a recoverable disconnect
    #[error("end of stream")]
    EndOfStream,

    /// Fetch failure inside a running fetch loop; logged and looped
    #[error("fetch failed: {message}")]
    FetchFailed { message: String },

    /// Handler chain exhausted its retry budget for one message
    #[error("handling failed after {attempts} attempt(s)")]
    HandleFailed {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Per-message commit exhausted its retry budget
    #[error("commit failed after {attempts} attempt(s)")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: Box<BusError>,
    },

    /// Dead-letter forwarding failed; the message is left uncommitted
    #[error("dead-letter send failed")]
    DlqFailed {
        #[source]
        source: Box<BusError>,
    },

    /// Topic does not exist on the broker
    #[error("topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    /// Connection-level failure
    #[error("connection error: {message}")]
    Connection { message: String },

    /// I/O errors from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new fetch error
    pub fn fetch<S: Into<String>>(message: S) -> Self {
        Self::FetchFailed {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "BROKER_NOT_INITIALIZED",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::UnsupportedSaslMechanism { .. } => "UNSUPPORTED_SASL_MECHANISM",
            Self::InvalidMessageContext => "INVALID_MESSAGE_CONTEXT",
            Self::MarshalFailed { .. } => "MARSHAL_FAILED",
            Self::UnmarshalFailed { .. } => "UNMARSHAL_FAILED",
            Self::WriteFailed { .. } => "WRITE_FAILED",
            Self::LeaderNotAvailable { .. } => "LEADER_NOT_AVAILABLE",
            Self::EndOfStream => "END_OF_STREAM",
            Self::FetchFailed { .. } => "FETCH_FAILED",
            Self::HandleFailed { .. } => "HANDLE_FAILED",
            Self::CommitFailed { .. } => "COMMIT_FAILED",
            Self::DlqFailed { .. } => "DLQ_FAILED",
            Self::TopicNotFound { .. } => "TOPIC_NOT_FOUND",
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::Io(_) => "IO",
        }
    }

    /// Check if this error is the transient leader-election condition
    /// that the producer retry loop is allowed to wait out
    pub fn is_leader_not_available(&self) -> bool {
        matches!(self, Self::LeaderNotAvailable { .. })
    }

    /// Check if this error is the recoverable end-of-stream disconnect
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Check if this error is retryable at all
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LeaderNotAvailable { .. }
                | Self::Connection { .. }
                | Self::FetchFailed { .. }
                | Self::Io(_)
        )
    }
}
