//! Transport message type.
//!
//! The unit of delivery moved by the queue transport: an identifier, an
//! owned header map, and an opaque byte payload. Headers are mutated in
//! place by the fault router and by gateway header updates; each message
//! owns its map exclusively.

use std::collections::HashMap;

use uuid::Uuid;

/// A message as it travels through the bus.
///
/// `id` is mutable on purpose: transports are allowed to overwrite it with
/// a transport-assigned value on send, and the fault router restores it
/// afterwards (see `faults`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Message identifier.
    pub id: String,
    /// Key/value headers, owned by this message.
    pub headers: HashMap<String, String>,
    /// Opaque payload bytes.
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Create a message with a freshly generated id and empty headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Create a message with an explicit id.
    pub fn with_id(id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header to the message.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
