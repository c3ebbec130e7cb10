//! Request-context propagation for message envelopes
//!
//! Every envelope put on the wire carries the request context of the
//! operation that produced it, so consumers downstream can continue the
//! same logical request. The [`Context`] carrier models "a generic
//! context that may hold a request context"; producers extract from it
//! and refuse to send when nothing is attached.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Propagated request context carried inside every message envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation identifier of the originating request
    pub request_id: String,
    /// Additional propagated key/value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub values: HashMap<String, String>,
}

impl RequestContext {
    pub fn new<S: Into<String>>(request_id: S) -> Self {
        Self {
            request_id: request_id.into(),
            values: HashMap::new(),
        }
    }

    pub fn with_value<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Generic context carrier passed through the send path
#[derive(Debug, Clone, Default)]
pub struct Context {
    request: Option<RequestContext>,
}

impl Context {
    /// An empty carrier with no request context attached
    pub fn background() -> Self {
        Self::default()
    }

    /// A carrier holding the given request context
    pub fn with_request(request: RequestContext) -> Self {
        Self {
            request: Some(request),
        }
    }

    /// Attach a request context, replacing any previous one
    pub fn attach(&mut self, request: RequestContext) {
        self.request = Some(request);
    }

    /// Extract the current request context, if any
    pub fn request(&self) -> Option<&RequestContext> {
        self.request.as_ref()
    }
}
