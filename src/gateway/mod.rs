//! Gateway deduplication store.
//!
//! The inbound gateway admits each logical submission exactly once, even
//! under duplicate delivery: `insert_message` performs a conditional
//! create keyed by the escaped client id, and the caller that loses the
//! race is told so. `ack_message` flips the acknowledged flag exactly
//! once and hands back the stored payload; a second acknowledgment is
//! refused, not an error.
//!
//! Races on the create path are resolved by the underlying storage's
//! conditional write, never by an application-level lock: multiple bus
//! processes may share one store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info};

// Implementation modules
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-exports
pub use memory::InMemoryMessagePersistence;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMessagePersistence;

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Errors that can occur during gateway persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("no stored message with client id '{0}'")]
    NotFound(String),

    #[error("invalid stored headers: {0}")]
    Headers(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Replace path-separator characters in a client-supplied id so it is
/// safe to use as a storage key.
///
/// Applied identically by every operation: the raw and escaped forms of
/// the same logical id always resolve to the same record.
pub fn escape_client_id(client_id: &str) -> String {
    client_id.replace('\\', "_")
}

/// Persisted form of a message at the dedup boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Escaped client id, primary key.
    pub id: String,
    /// When the message arrived at the gateway.
    pub time_received: DateTime<Utc>,
    /// Headers as received.
    pub headers: HashMap<String, String>,
    /// Raw payload as received.
    pub original_message: Vec<u8>,
    /// Set true exactly once; never reverts.
    pub acknowledged: bool,
}

/// Idempotent message acceptance for the gateway boundary.
#[async_trait]
pub trait MessagePersistence: Send + Sync {
    /// Store an inbound message under the escaped client id.
    ///
    /// Returns `Ok(true)` if this call created the record, `Ok(false)` if
    /// a concurrent create for the same id won the race. At most one
    /// record is ever durably created per escaped id. Storage failures
    /// propagate.
    async fn insert_message(
        &self,
        client_id: &str,
        time_received: DateTime<Utc>,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<bool>;

    /// Acknowledge the message once, returning the stored body and
    /// headers.
    ///
    /// `Err(PersistenceError::NotFound)` when no record exists for the id
    /// (a caller contract violation). `Ok(None)` when the record was
    /// already acknowledged.
    async fn ack_message(
        &self,
        client_id: &str,
    ) -> Result<Option<(Vec<u8>, HashMap<String, String>)>>;

    /// Set one header on the stored record, last writer wins.
    async fn update_header(&self, client_id: &str, key: &str, value: &str) -> Result<()>;
}

// ============================================================================
// Configuration / factory
// ============================================================================

/// Gateway storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type (sqlite, memory).
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Path to the database file (sqlite only).
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: "./data/gateway.db".to_string(),
        }
    }
}

/// Initialize gateway persistence based on configuration.
pub async fn init_persistence(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn MessagePersistence>, Box<dyn std::error::Error>> {
    info!("Gateway storage: {} at {}", config.storage_type, config.path);

    match config.storage_type.as_str() {
        "memory" => Ok(Arc::new(InMemoryMessagePersistence::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let store = Arc::new(SqliteMessagePersistence::new(pool));
            store.init().await?;

            Ok(store)
        }
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
        other => {
            error!("Unknown storage type: {}", other);
            Err(format!("Unknown storage type: {}", other).into())
        }
    }
}
