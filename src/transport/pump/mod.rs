//! Transport pump: a worker pool that drives message consumption.
//!
//! The pump owns a configurable number of workers, each independently
//! pulling messages from one input queue and surfacing a four-phase
//! lifecycle to registered listeners:
//!
//! ```text
//! started_processing -> message_received -> finished_processing
//!                                        \> failed_processing -> finished_processing
//! ```
//!
//! Exactly one `finished_processing` fires per dequeued message, and
//! `started_processing` always fires first. A listener error never crashes
//! a worker: the delivery is abandoned (so the queue redelivers it), the
//! failure is reported, and the worker keeps consuming.
//!
//! The worker pool can be resized at runtime without interrupting in-flight
//! messages; retired workers drain their current message and exit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Address, Delivery, MessageQueue};
use crate::message::TransportMessage;


// ============================================================================
// Configuration
// ============================================================================

/// Transport pump configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Initial number of concurrent workers. Default: 1.
    pub worker_count: usize,
    /// Idle poll interval in milliseconds. Default: 20.
    pub poll_interval_ms: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            poll_interval_ms: 20,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur operating the pump itself.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("transport pump already started on '{0}'")]
    AlreadyStarted(Address),
}

/// Why processing of one dequeued message failed.
///
/// Listener failures and aborts both land here; either way the delivery is
/// abandoned so the transport redelivers the message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("processing aborted before completion")]
    Aborted,
}

// ============================================================================
// Listener contract
// ============================================================================

/// Per-message processing context handed to the dispatch pipeline.
///
/// Cloned handles all point at the same attempt; aborting through any of
/// them cancels only the owning worker's in-flight message.
#[derive(Debug, Clone, Default)]
pub struct ProcessingContext {
    abort: Arc<AtomicBool>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel handling of the current message.
    ///
    /// The worker will not complete the delivery toward the queue, so the
    /// message becomes visible again for redelivery. Side effects already
    /// performed by handlers are not rolled back.
    pub fn abort_current_message(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested for this attempt.
    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Observer of the pump's message lifecycle.
///
/// `started_processing` and `message_received` are fallible: an `Err` from
/// either is caught at the worker boundary and reported through
/// `failed_processing`. The two notification callbacks are invoked in
/// isolation per listener; an `Err` there is logged and the remaining
/// listeners still run.
#[async_trait]
pub trait PumpListener: Send + Sync {
    /// A message has been dequeued and is about to be dispatched.
    async fn started_processing(
        &self,
        _message: &TransportMessage,
    ) -> std::result::Result<(), DispatchError> {
        Ok(())
    }

    /// The message is available for handling by the dispatch pipeline.
    async fn message_received(
        &self,
        message: &TransportMessage,
        ctx: &ProcessingContext,
    ) -> std::result::Result<(), DispatchError>;

    /// Processing of the current message failed.
    async fn failed_processing(
        &self,
        _error: &DispatchError,
    ) -> std::result::Result<(), DispatchError> {
        Ok(())
    }

    /// The worker slot is done with the current message.
    async fn finished_processing(&self) -> std::result::Result<(), DispatchError> {
        Ok(())
    }
}

// Shared listeners can be registered directly.
#[async_trait]
impl<T: PumpListener + ?Sized> PumpListener for Arc<T> {
    async fn started_processing(
        &self,
        message: &TransportMessage,
    ) -> std::result::Result<(), DispatchError> {
        (**self).started_processing(message).await
    }

    async fn message_received(
        &self,
        message: &TransportMessage,
        ctx: &ProcessingContext,
    ) -> std::result::Result<(), DispatchError> {
        (**self).message_received(message, ctx).await
    }

    async fn failed_processing(
        &self,
        error: &DispatchError,
    ) -> std::result::Result<(), DispatchError> {
        (**self).failed_processing(error).await
    }

    async fn finished_processing(&self) -> std::result::Result<(), DispatchError> {
        (**self).finished_processing().await
    }
}

type Listeners = Arc<RwLock<Vec<Box<dyn PumpListener>>>>;

// ============================================================================
// Pump
// ============================================================================

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PumpState {
    input: Option<Address>,
    workers: Vec<WorkerHandle>,
    /// Workers signalled to stop that may still be draining a message.
    retired: Vec<WorkerHandle>,
}

/// Worker pool pulling messages from one input queue.
pub struct TransportPump {
    queue: Arc<dyn MessageQueue>,
    listeners: Listeners,
    state: Mutex<PumpState>,
    /// Desired worker count; workers converge to this after a resize.
    target: AtomicUsize,
    /// Number of worker tasks currently running.
    active: Arc<AtomicUsize>,
    next_worker_id: AtomicUsize,
    poll_interval: Duration,
}

impl TransportPump {
    /// Create a pump over the given queue transport.
    pub fn new(queue: Arc<dyn MessageQueue>, config: PumpConfig) -> Self {
        Self {
            queue,
            listeners: Arc::new(RwLock::new(Vec::new())),
            state: Mutex::new(PumpState::default()),
            target: AtomicUsize::new(config.worker_count),
            active: Arc::new(AtomicUsize::new(0)),
            next_worker_id: AtomicUsize::new(0),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Register a lifecycle listener.
    pub async fn subscribe(&self, listener: Box<dyn PumpListener>) {
        let count = {
            let mut listeners = self.listeners.write().await;
            listeners.push(listener);
            listeners.len()
        };
        debug!(listener_count = count, "Listener subscribed to pump");
    }

    /// Begin consuming from the input queue.
    ///
    /// Fails with `PumpError::AlreadyStarted` if called again without an
    /// intervening `dispose`.
    pub async fn start(&self, input: Address) -> std::result::Result<(), PumpError> {
        let mut state = self.state.lock().await;
        if let Some(current) = &state.input {
            return Err(PumpError::AlreadyStarted(current.clone()));
        }

        state.input = Some(input.clone());
        let target = self.target.load(Ordering::SeqCst);
        for _ in 0..target {
            self.spawn_worker(&mut state, &input);
        }

        info!(queue = %input, workers = target, "Transport pump started");
        Ok(())
    }

    /// Request the pool converge to `target` concurrent workers.
    ///
    /// Safe to call while messages are being processed. Retired workers
    /// finish their current message before exiting; no in-flight message
    /// is aborted by the resize.
    pub async fn change_worker_count(&self, target: usize) {
        self.target.store(target, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        let Some(input) = state.input.clone() else {
            // Not started yet; the new target applies at start.
            return;
        };

        while state.workers.len() < target {
            self.spawn_worker(&mut state, &input);
        }
        while state.workers.len() > target {
            if let Some(worker) = state.workers.pop() {
                let _ = worker.shutdown.send(true);
                state.retired.push(worker);
            }
        }

        info!(workers = target, "Worker count change requested");
    }

    /// Stop all workers and release consumption resources.
    ///
    /// Each worker drains its current message first. Safe to call when the
    /// pump was never started; the pump may be started again afterwards.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        let mut workers: Vec<WorkerHandle> = state.workers.drain(..).collect();
        workers.extend(state.retired.drain(..));
        state.input = None;

        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let _ = worker.shutdown.send(true);
            handles.push(worker.handle);
        }
        futures::future::join_all(handles).await;

        info!("Transport pump disposed");
    }

    /// Number of worker tasks currently running (including draining ones).
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self, state: &mut PumpState, input: &Address) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(worker_loop(
            id,
            self.queue.clone(),
            input.clone(),
            self.listeners.clone(),
            shutdown_rx,
            self.poll_interval,
            self.active.clone(),
        ));

        state.workers.push(WorkerHandle {
            shutdown: shutdown_tx,
            handle,
        });
    }
}

// ============================================================================
// Worker loop
// ============================================================================

async fn worker_loop(
    id: usize,
    queue: Arc<dyn MessageQueue>,
    input: Address,
    listeners: Listeners,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    active: Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::SeqCst);
    debug!(worker = id, queue = %input, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.receive(&input).await {
            Ok(Some(delivery)) => {
                process_delivery(&*queue, &listeners, delivery).await;
            }
            Ok(None) => {
                idle_wait(&mut shutdown, poll_interval).await;
            }
            Err(e) => {
                error!(worker = id, queue = %input, error = %e, "Receive failed, backing off");
                idle_wait(&mut shutdown, poll_interval).await;
            }
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
    debug!(worker = id, "Worker stopped");
}

async fn idle_wait(shutdown: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

/// Run one dequeued message through the full lifecycle.
async fn process_delivery(queue: &dyn MessageQueue, listeners: &Listeners, delivery: Delivery) {
    let ctx = ProcessingContext::new();

    let failure = match notify_started(listeners, &delivery.message).await {
        Err(e) => Some(e),
        Ok(()) => match notify_received(listeners, &delivery.message, &ctx).await {
            Err(e) => Some(e),
            Ok(()) if ctx.abort_requested() => Some(DispatchError::Aborted),
            Ok(()) => None,
        },
    };

    match failure {
        None => {
            if let Err(e) = queue.complete(&delivery.receipt).await {
                error!(id = %delivery.message.id, error = %e, "Failed to complete delivery");
            }
        }
        Some(failure) => {
            // Leave the message redeliverable before reporting the failure.
            if let Err(e) = queue.abandon(&delivery.receipt).await {
                error!(id = %delivery.message.id, error = %e, "Failed to abandon delivery");
            }
            notify_failed(listeners, &failure).await;
        }
    }

    notify_finished(listeners).await;
}

/// Raise `started_processing`, stopping at the first listener error.
async fn notify_started(
    listeners: &Listeners,
    message: &TransportMessage,
) -> std::result::Result<(), DispatchError> {
    let listeners = listeners.read().await;
    for listener in listeners.iter() {
        listener.started_processing(message).await?;
    }
    Ok(())
}

/// Raise `message_received`, stopping at the first listener error.
async fn notify_received(
    listeners: &Listeners,
    message: &TransportMessage,
    ctx: &ProcessingContext,
) -> std::result::Result<(), DispatchError> {
    let listeners = listeners.read().await;
    for listener in listeners.iter() {
        listener.message_received(message, ctx).await?;
    }
    Ok(())
}

/// Raise `failed_processing` on every listener in isolation.
async fn notify_failed(listeners: &Listeners, failure: &DispatchError) {
    let listeners = listeners.read().await;
    for listener in listeners.iter() {
        if let Err(e) = listener.failed_processing(failure).await {
            error!(error = %e, "failed_processing listener failed");
        }
    }
}

/// Raise `finished_processing` on every listener in isolation.
async fn notify_finished(listeners: &Listeners) {
    let listeners = listeners.read().await;
    for listener in listeners.iter() {
        if let Err(e) = listener.finished_processing().await {
            error!(error = %e, "finished_processing listener failed");
        }
    }
}
