//! Normalized job message handed to processors.
//!
//! A `Message` is a plain value: the runner builds it from the broker
//! delivery by copying the payload and attributes, so processors never hold
//! references into broker-owned buffers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// Transport-neutral message delivered to a [`crate::Processor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned identifier (opaque).
    pub id: String,
    /// Payload bytes (owned copy).
    pub data: Vec<u8>,
    /// Message attributes (owned copy).
    pub attributes: HashMap<String, String>,
    /// Instant the broker stamped on publish.
    pub publish_time: DateTime<Utc>,
    /// Delivery counter maintained by the broker; `0` when unknown.
    pub delivery_attempt: u32,
    /// Ordering key used by the broker (not interpreted by the runtime).
    pub ordering_key: Option<String>,
    /// Fully qualified subscription path, for diagnostics.
    pub subscription_name: String,
}

impl Message {
    /// Decode the JSON payload into `T`.
    ///
    /// The parse error is returned unchanged; callers usually wrap it with
    /// [`crate::permanent`] since a malformed payload never heals on redelivery.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Attribute value for `key`, or an empty string when absent.
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }

    /// Compact representation used in logs and errors.
    pub fn debug_string(&self) -> String {
        format!(
            "msg[id={} attempt={} subscription={}]",
            self.id, self.delivery_attempt, self.subscription_name
        )
    }
}
