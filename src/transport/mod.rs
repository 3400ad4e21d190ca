//! Queue transport abstraction and the pump that drives it.
//!
//! This module contains:
//! - `Address`: opaque queue address
//! - `SendMessages` trait: the one-way send capability
//! - `MessageQueue` trait: receive with explicit complete/abandon
//! - `TransportPump`: worker pool with lifecycle events (see `pump`)
//! - Implementations: in-memory queue for standalone mode and testing

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::message::TransportMessage;

// Implementation modules
pub mod memory;
pub mod pump;

// Re-exports
pub use memory::InMemoryQueue;
pub use pump::{
    DispatchError, ProcessingContext, PumpConfig, PumpError, PumpListener, TransportPump,
};

// ============================================================================
// Addresses
// ============================================================================

/// Opaque address of a queue on the transport.
///
/// The concrete meaning (broker queue name, connection string fragment,
/// machine-qualified name) belongs to the transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Create an address from a queue name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Address {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(Address),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("unknown delivery receipt: {0}")]
    UnknownReceipt(Uuid),
}

/// The one-way send capability of the transport.
///
/// The message is passed mutably because transports are known to overwrite
/// `id` with a transport-assigned value on send; callers that care about
/// the logical identity must save and restore it (the fault router does).
#[async_trait]
pub trait SendMessages: Send + Sync {
    /// Send a message to a destination queue.
    async fn send(&self, message: &mut TransportMessage, destination: &Address) -> Result<()>;
}

/// Receipt identifying one in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    id: Uuid,
    address: Address,
}

impl DeliveryReceipt {
    /// Create a receipt for a delivery from the given queue.
    pub fn new(id: Uuid, address: Address) -> Self {
        Self { id, address }
    }

    /// The receipt id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The queue the delivery came from.
    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// One dequeued message plus the receipt needed to settle it.
#[derive(Debug)]
pub struct Delivery {
    /// The dequeued message.
    pub message: TransportMessage,
    /// Receipt for `complete`/`abandon`.
    pub receipt: DeliveryReceipt,
}

/// A consumable queue with explicit settlement.
///
/// A received delivery stays invisible until it is completed or abandoned;
/// an abandoned (or never-completed) delivery becomes eligible for
/// redelivery. This is the contract the pump relies on to guarantee that
/// failed or aborted messages are not lost.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Take the next message from a queue, if any.
    async fn receive(&self, address: &Address) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery, removing the message permanently.
    async fn complete(&self, receipt: &DeliveryReceipt) -> Result<()>;

    /// Return a delivery to the queue for redelivery.
    async fn abandon(&self, receipt: &DeliveryReceipt) -> Result<()>;
}
