//! In-memory queue transport for standalone mode and testing.
//!
//! Queues must be declared before use; sending to an undeclared address
//! fails with `QueueError::QueueNotFound`, which is what exercises the
//! fault router's fatal path in tests. Receiving moves a message to an
//! in-flight table; `complete` discards it and `abandon` puts it back at
//! the front of the queue so redelivery preserves ordering.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Address, Delivery, DeliveryReceipt, MessageQueue, QueueError, Result, SendMessages};
use crate::message::TransportMessage;

struct InFlight {
    address: Address,
    message: TransportMessage,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<Address, VecDeque<TransportMessage>>,
    in_flight: HashMap<Uuid, InFlight>,
}

/// In-memory queue transport.
///
/// Single-process only; the durable-broker equivalents live outside this
/// crate behind the same traits.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue so it can be sent to and received from.
    pub async fn declare(&self, address: &Address) {
        let mut state = self.state.lock().await;
        state.queues.entry(address.clone()).or_default();
        debug!(queue = %address, "Queue declared");
    }

    /// Enqueue a message as-is, without the id reassignment `send` does.
    ///
    /// Producer-side seam for tests that need to track a specific id.
    pub async fn enqueue(&self, address: &Address, message: TransportMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(address)
            .ok_or_else(|| QueueError::QueueNotFound(address.clone()))?;
        queue.push_back(message);
        Ok(())
    }

    /// Number of visible (not in-flight) messages on a queue.
    pub async fn len(&self, address: &Address) -> usize {
        let state = self.state.lock().await;
        state.queues.get(address).map(VecDeque::len).unwrap_or(0)
    }

    /// Snapshot of the visible messages on a queue.
    pub async fn messages(&self, address: &Address) -> Vec<TransportMessage> {
        let state = self.state.lock().await;
        state
            .queues
            .get(address)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of deliveries that have been received but not settled.
    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl SendMessages for InMemoryQueue {
    async fn send(&self, message: &mut TransportMessage, destination: &Address) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(destination)
            .ok_or_else(|| QueueError::QueueNotFound(destination.clone()))?;

        // Transport-assigned id, overwriting the caller's. Callers that
        // need the logical id afterwards must restore it themselves.
        message.id = Uuid::new_v4().to_string();
        queue.push_back(message.clone());

        debug!(queue = %destination, id = %message.id, "Message sent");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self, address: &Address) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(address)
            .ok_or_else(|| QueueError::QueueNotFound(address.clone()))?;

        let Some(message) = queue.pop_front() else {
            return Ok(None);
        };

        let receipt = DeliveryReceipt::new(Uuid::new_v4(), address.clone());
        state.in_flight.insert(
            receipt.id(),
            InFlight {
                address: address.clone(),
                message: message.clone(),
            },
        );

        Ok(Some(Delivery { message, receipt }))
    }

    async fn complete(&self, receipt: &DeliveryReceipt) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&receipt.id())
            .ok_or(QueueError::UnknownReceipt(receipt.id()))?;
        Ok(())
    }

    async fn abandon(&self, receipt: &DeliveryReceipt) -> Result<()> {
        let mut state = self.state.lock().await;
        let in_flight = state
            .in_flight
            .remove(&receipt.id())
            .ok_or(QueueError::UnknownReceipt(receipt.id()))?;

        state
            .queues
            .entry(in_flight.address.clone())
            .or_default()
            .push_front(in_flight.message);

        debug!(queue = %in_flight.address, "Delivery abandoned, message requeued");
        Ok(())
    }
}
