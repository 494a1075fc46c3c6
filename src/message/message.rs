use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// An immutable message body plus its header metadata.
///
/// Bodies are owned by a [`MessageStore`](super::MessageStore); every
/// [`MessageReference`](super::MessageReference) to the same id shares one
/// body.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
    /// Unique identifier for this message
    pub id: String,
    /// Serialized payload (typically bitcode or JSON)
    pub payload: Vec<u8>,
    /// Reliable messages must survive a crash of a recoverable channel.
    pub reliable: bool,
    /// Absent means the message is eligible for delivery immediately.
    pub scheduled_delivery: Option<SystemTime>,
    /// Optional headers (correlation ids, routing hints, ...)
    pub headers: Option<Vec<(String, String)>>,
}

impl Message {
    /// Create a non-reliable message with the given payload.
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
            reliable: false,
            scheduled_delivery: None,
            headers: None,
        }
    }

    /// Create a message with a bitcode-serialized payload.
    pub fn encode<T: Serialize>(id: impl Into<String>, payload: &T) -> Result<Self, bitcode::Error> {
        let bytes = bitcode::serialize(payload)?;
        Ok(Self::new(id, bytes))
    }

    /// Decode the payload from bitcode binary format.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, bitcode::Error> {
        bitcode::deserialize(&self.payload)
    }

    /// Create a message with a string payload.
    pub fn with_string_payload(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(id, payload.into().into_bytes())
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Hold the message back until `at`.
    pub fn with_scheduled_delivery(mut self, at: SystemTime) -> Self {
        self.scheduled_delivery = Some(at);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// First header value stored under `key`.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
