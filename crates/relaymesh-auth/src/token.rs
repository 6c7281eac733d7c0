//! Verified endpoint permissions

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Endpoint pattern matching any endpoint ID
pub const WILDCARD_ENDPOINT: &str = "*";

/// The result of verifying an upstream's bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointToken {
    /// Endpoint IDs the holder may register; `*` permits all
    pub endpoints: Vec<String>,
    /// When the permission lapses; `None` never expires
    pub expiry: Option<DateTime<Utc>>,
}

impl EndpointToken {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            expiry: None,
        }
    }

    /// Token permitting every endpoint
    pub fn wildcard() -> Self {
        Self::new(vec![WILDCARD_ENDPOINT.to_string()])
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn permits(&self, endpoint_id: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e == WILDCARD_ENDPOINT || e == endpoint_id)
    }

    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|exp| exp <= Utc::now())
    }

    /// Time left before expiry, zero once passed; `None` if the token never expires
    pub fn remaining(&self) -> Option<Duration> {
        self.expiry
            .map(|exp| (exp - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}
