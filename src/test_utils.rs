//! Shared helpers for unit tests.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::message::TransportMessage;
use crate::transport::{DispatchError, ProcessingContext, PumpListener};

/// Poll `cond` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Listener that records lifecycle events and can be told to fail or
/// abort a configurable number of attempts.
#[derive(Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<String>>>,
    fail_started: AtomicUsize,
    fail_received: AtomicUsize,
    abort_received: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` `started_processing` calls.
    pub fn fail_started(self, n: usize) -> Self {
        self.fail_started.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` `message_received` calls.
    pub fn fail_received(self, n: usize) -> Self {
        self.fail_received.store(n, Ordering::SeqCst);
        self
    }

    /// Abort the next `n` attempts from inside `message_received`.
    pub fn abort_received(self, n: usize) -> Self {
        self.abort_received.store(n, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside `message_received` before recording it.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared handle to the recorded event log.
    pub fn events(&self) -> Arc<Mutex<Vec<String>>> {
        self.events.clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

/// Decrement `counter` if positive; true when a charge was consumed.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PumpListener for RecordingListener {
    async fn started_processing(&self, message: &TransportMessage) -> Result<(), DispatchError> {
        self.record(format!("started:{}", message.id));
        if take_one(&self.fail_started) {
            return Err(DispatchError::HandlerFailed("started failure".to_string()));
        }
        Ok(())
    }

    async fn message_received(
        &self,
        message: &TransportMessage,
        ctx: &ProcessingContext,
    ) -> Result<(), DispatchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("received:{}", message.id));
        if take_one(&self.abort_received) {
            ctx.abort_current_message();
            return Ok(());
        }
        if take_one(&self.fail_received) {
            return Err(DispatchError::HandlerFailed("received failure".to_string()));
        }
        Ok(())
    }

    async fn failed_processing(&self, error: &DispatchError) -> Result<(), DispatchError> {
        self.record(format!("failed:{error}"));
        Ok(())
    }

    async fn finished_processing(&self) -> Result<(), DispatchError> {
        self.record("finished".to_string());
        Ok(())
    }
}
