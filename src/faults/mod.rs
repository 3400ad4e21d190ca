//! Fault routing for poison messages.
//!
//! When the dispatch pipeline gives up on a message, the `FaultRouter`
//! stamps a forensic header set onto it and forwards it to the configured
//! error queue. A message that cannot even reach the error queue is an
//! integrity risk: the router logs loudly, pauses so an operator can see
//! the log, and terminates the process through an injectable `Terminator`.
//!
//! The send capability is resolved through a provider closure at call
//! time, not captured at construction; fault handling and the messaging
//! infrastructure initialize in a cycle otherwise.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::error;

use crate::message::TransportMessage;
use crate::transport::{Address, QueueError, SendMessages};

// ============================================================================
// Header keys and reason codes
// ============================================================================

/// Reason code header.
pub const FAULT_REASON: &str = "courier.fault.reason";
/// Fault type name header.
pub const FAULT_EXCEPTION_TYPE: &str = "courier.fault.exception-type";
/// Inner fault type name header (set only when an inner fault exists).
pub const FAULT_INNER_EXCEPTION_TYPE: &str = "courier.fault.inner-exception-type";
/// Help link header.
pub const FAULT_HELP_LINK: &str = "courier.fault.help-link";
/// Fault message text header.
pub const FAULT_MESSAGE: &str = "courier.fault.message";
/// Fault source header.
pub const FAULT_SOURCE: &str = "courier.fault.source";
/// Stack trace text header.
pub const FAULT_STACK_TRACE: &str = "courier.fault.stack-trace";
/// The message id as it was before forwarding.
pub const ORIGINAL_ID: &str = "courier.original-id";
/// The queue the message was being consumed from when it failed.
pub const FAILED_QUEUE: &str = "courier.failed-queue";

/// Reason code for messages that could not be deserialized.
pub const REASON_SERIALIZATION_FAILED: &str = "SerializationFailed";
/// Reason code for messages whose handling permanently failed.
pub const REASON_PROCESSING_FAILED: &str = "ProcessingFailed";

// ============================================================================
// Fault metadata
// ============================================================================

/// Structured metadata describing why a message failed.
///
/// This is the transport-agnostic record that ends up in the fault
/// headers; it mirrors what an exception carries in managed runtimes.
#[derive(Debug, Clone, Default)]
pub struct FaultDetails {
    /// Name of the error type.
    pub type_name: String,
    /// Human-readable failure text.
    pub message: String,
    /// Component the failure originated in.
    pub source: String,
    /// Captured stack or failure trace, if any.
    pub stack_trace: String,
    /// Link to remediation documentation, if any.
    pub help_link: String,
    /// The underlying fault, if this one wraps another.
    pub inner: Option<Box<FaultDetails>>,
}

impl FaultDetails {
    /// Create fault details with a type name and message.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Capture details from a Rust error, including its source chain.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut details = Self::new(std::any::type_name::<E>(), error.to_string());
        if let Some(source) = error.source() {
            details.inner = Some(Box::new(Self::new(
                "dyn core::error::Error",
                source.to_string(),
            )));
        }
        details
    }

    /// Set the originating component.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Set the stack trace text.
    pub fn with_stack_trace(mut self, stack_trace: &str) -> Self {
        self.stack_trace = stack_trace.to_string();
        self
    }

    /// Set the help link.
    pub fn with_help_link(mut self, help_link: &str) -> Self {
        self.help_link = help_link.to_string();
        self
    }

    /// Set the wrapped inner fault.
    pub fn with_inner(mut self, inner: FaultDetails) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Resolves the send capability at call time.
pub type SenderProvider = Arc<dyn Fn() -> Arc<dyn SendMessages> + Send + Sync>;

/// Pure fault-scrubbing function applied before header extraction.
pub type Sanitizer = Arc<dyn Fn(FaultDetails) -> FaultDetails + Send + Sync>;

/// Ends the process on an unrecoverable forward failure.
///
/// Injectable so tests can assert the fatal path was reached without
/// killing the test process.
pub trait Terminator: Send + Sync {
    fn terminate(&self);
}

/// Production terminator: exits the process immediately.
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self) {
        std::process::exit(1);
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Fault routing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Queue terminally-failed messages are forwarded to.
    pub error_queue: String,
    /// Whether to pass faults through a sanitizer before forwarding.
    /// Default: false.
    pub sanitize: bool,
    /// Seconds to wait after logging a fatal forward failure before
    /// terminating, so an operator can see the log. Default: 10.
    pub termination_grace_secs: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            error_queue: "error".to_string(),
            sanitize: false,
            termination_grace_secs: 10,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by fault routing.
///
/// In production the forward-failure variant is unreachable: the process
/// terminates first. It exists so the fatal path is observable in tests.
#[derive(Debug, thiserror::Error)]
pub enum FaultError {
    #[error("could not forward failed message to error queue '{queue}': {source}")]
    ForwardFailed {
        queue: Address,
        #[source]
        source: QueueError,
    },
}

// ============================================================================
// Router
// ============================================================================

/// Routes terminally-failed messages to the error queue.
pub struct FaultRouter {
    error_address: Address,
    local_address: Address,
    termination_grace: Duration,
    sender_provider: SenderProvider,
    sanitizer: Option<Sanitizer>,
    terminator: Arc<dyn Terminator>,
}

impl FaultRouter {
    /// Create a router forwarding to `error_address`.
    ///
    /// `local_address` is the queue the failing messages were consumed
    /// from; it is recorded in the failed-queue header.
    pub fn new(
        error_address: Address,
        local_address: Address,
        sender_provider: SenderProvider,
    ) -> Self {
        Self {
            error_address,
            local_address,
            termination_grace: Duration::from_secs(FaultConfig::default().termination_grace_secs),
            sender_provider,
            sanitizer: None,
            terminator: Arc::new(ProcessExit),
        }
    }

    /// Create a router from configuration.
    ///
    /// The sanitizer is wired in only when the config enables it.
    pub fn from_config(
        config: &FaultConfig,
        local_address: Address,
        sender_provider: SenderProvider,
        sanitizer: Option<Sanitizer>,
    ) -> Self {
        let mut router = Self::new(
            Address::new(config.error_queue.clone()),
            local_address,
            sender_provider,
        )
        .with_termination_grace(Duration::from_secs(config.termination_grace_secs));

        if config.sanitize {
            if let Some(sanitizer) = sanitizer {
                router = router.with_sanitizer(sanitizer);
            }
        }

        router
    }

    /// Install a fault sanitizer, enabling sanitization.
    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Replace the terminator used on fatal forward failures.
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Change the pause between the fatal log and termination.
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Report a message that could not be deserialized.
    pub async fn report_serialization_failure(
        &self,
        message: &mut TransportMessage,
        fault: &FaultDetails,
    ) -> Result<(), FaultError> {
        self.send_failure_message(message, fault, REASON_SERIALIZATION_FAILED)
            .await
    }

    /// Report a message whose handling permanently failed.
    ///
    /// The message id is saved before forwarding and restored after,
    /// unconditionally: the send path may overwrite `id` with a
    /// transport-assigned value, and that value must never leak into the
    /// message's logical identity.
    pub async fn report_processing_failure(
        &self,
        message: &mut TransportMessage,
        fault: &FaultDetails,
    ) -> Result<(), FaultError> {
        let fault = match &self.sanitizer {
            Some(sanitize) => sanitize(fault.clone()),
            None => fault.clone(),
        };

        let original_id = message.id.clone();
        let result = self
            .send_failure_message(message, &fault, REASON_PROCESSING_FAILED)
            .await;
        message.id = original_id;
        result
    }

    async fn send_failure_message(
        &self,
        message: &mut TransportMessage,
        fault: &FaultDetails,
        reason: &str,
    ) -> Result<(), FaultError> {
        set_fault_headers(message, fault, reason, &self.local_address);

        let sender = (self.sender_provider)();
        if let Err(source) = sender.send(message, &self.error_address).await {
            match &source {
                QueueError::QueueNotFound(queue) => {
                    error!(
                        error_queue = %queue,
                        "Could not forward failed message to error queue because the queue could not be found. Process will now exit."
                    );
                }
                other => {
                    error!(
                        error_queue = %self.error_address,
                        error = %other,
                        "Could not forward failed message to error queue. Process will now exit."
                    );
                }
            }

            tokio::time::sleep(self.termination_grace).await;
            self.terminator.terminate();
            return Err(FaultError::ForwardFailed {
                queue: self.error_address.clone(),
                source,
            });
        }

        Ok(())
    }
}

/// Stamp the forensic header set onto a failed message.
fn set_fault_headers(
    message: &mut TransportMessage,
    fault: &FaultDetails,
    reason: &str,
    failed_queue: &Address,
) {
    let original_id = message.id.clone();
    let headers = &mut message.headers;

    headers.insert(FAULT_REASON.to_string(), reason.to_string());
    headers.insert(FAULT_EXCEPTION_TYPE.to_string(), fault.type_name.clone());
    if let Some(inner) = &fault.inner {
        headers.insert(
            FAULT_INNER_EXCEPTION_TYPE.to_string(),
            inner.type_name.clone(),
        );
    }
    headers.insert(FAULT_HELP_LINK.to_string(), fault.help_link.clone());
    headers.insert(FAULT_MESSAGE.to_string(), fault.message.clone());
    headers.insert(FAULT_SOURCE.to_string(), fault.source.clone());
    headers.insert(FAULT_STACK_TRACE.to_string(), fault.stack_trace.clone());
    headers.insert(ORIGINAL_ID.to_string(), original_id);
    headers.insert(FAILED_QUEUE.to_string(), failed_queue.to_string());
}
