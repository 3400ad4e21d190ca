//! In-memory implementation of gateway persistence.
//!
//! Entry occupancy under a single write lock is the conditional-create
//! check here; the durable equivalent lives in the sqlite backend. Used
//! for standalone mode and testing.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{escape_client_id, MessagePersistence, PersistenceError, Result, StoredMessage};

/// In-memory gateway message store.
#[derive(Default)]
pub struct InMemoryMessagePersistence {
    messages: RwLock<HashMap<String, StoredMessage>>,
}

impl InMemoryMessagePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn stored_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Snapshot of one stored record, by raw or escaped client id.
    pub async fn get(&self, client_id: &str) -> Option<StoredMessage> {
        self.messages
            .read()
            .await
            .get(&escape_client_id(client_id))
            .cloned()
    }
}

#[async_trait]
impl MessagePersistence for InMemoryMessagePersistence {
    async fn insert_message(
        &self,
        client_id: &str,
        time_received: DateTime<Utc>,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<bool> {
        let escaped = escape_client_id(client_id);
        let mut messages = self.messages.write().await;

        match messages.entry(escaped.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(StoredMessage {
                    id: escaped,
                    time_received,
                    headers: headers.clone(),
                    original_message: body.to_vec(),
                    acknowledged: false,
                });
                Ok(true)
            }
        }
    }

    async fn ack_message(
        &self,
        client_id: &str,
    ) -> Result<Option<(Vec<u8>, HashMap<String, String>)>> {
        let escaped = escape_client_id(client_id);
        let mut messages = self.messages.write().await;

        let stored = messages
            .get_mut(&escaped)
            .ok_or_else(|| PersistenceError::NotFound(client_id.to_string()))?;

        if stored.acknowledged {
            return Ok(None);
        }

        stored.acknowledged = true;
        Ok(Some((stored.original_message.clone(), stored.headers.clone())))
    }

    async fn update_header(&self, client_id: &str, key: &str, value: &str) -> Result<()> {
        let escaped = escape_client_id(client_id);
        let mut messages = self.messages.write().await;

        let stored = messages
            .get_mut(&escaped)
            .ok_or_else(|| PersistenceError::NotFound(client_id.to_string()))?;

        stored.headers.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_headers() -> HashMap<String, String> {
        HashMap::from([("k".to_string(), "v".to_string())])
    }

    #[tokio::test]
    async fn test_insert_then_ack_scenario() {
        let store = InMemoryMessagePersistence::new();

        assert!(store
            .insert_message("client-1", Utc::now(), b"hello", &test_headers())
            .await
            .unwrap());
        assert!(!store
            .insert_message("client-1", Utc::now(), b"other", &test_headers())
            .await
            .unwrap());
        assert_eq!(store.stored_count().await, 1);

        let (body, headers) = store
            .ack_message("client-1")
            .await
            .unwrap()
            .expect("first ack succeeds");
        assert_eq!(body, b"hello");
        assert_eq!(headers, test_headers());

        // Re-ack is refused, not an error.
        assert!(store.ack_message("client-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_losing_insert_does_not_overwrite() {
        let store = InMemoryMessagePersistence::new();

        store
            .insert_message("client-1", Utc::now(), b"first", &HashMap::new())
            .await
            .unwrap();
        store
            .insert_message("client-1", Utc::now(), b"second", &HashMap::new())
            .await
            .unwrap();

        let stored = store.get("client-1").await.unwrap();
        assert_eq!(stored.original_message, b"first");
    }

    #[tokio::test]
    async fn test_ack_unknown_id_is_contract_violation() {
        let store = InMemoryMessagePersistence::new();

        let err = store.ack_message("ghost").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_escaping_equivalence() {
        let store = InMemoryMessagePersistence::new();

        assert!(store
            .insert_message("a\\b", Utc::now(), b"payload", &HashMap::new())
            .await
            .unwrap());
        assert!(!store
            .insert_message("a_b", Utc::now(), b"payload", &HashMap::new())
            .await
            .unwrap());

        let acked = store.ack_message("a_b").await.unwrap();
        assert!(acked.is_some());
        assert!(store.ack_message("a\\b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acknowledged_flag_is_monotonic() {
        let store = InMemoryMessagePersistence::new();

        store
            .insert_message("client-1", Utc::now(), b"hello", &HashMap::new())
            .await
            .unwrap();
        store.ack_message("client-1").await.unwrap();

        // A late duplicate insert neither resurrects nor resets the flag.
        assert!(!store
            .insert_message("client-1", Utc::now(), b"hello", &HashMap::new())
            .await
            .unwrap());
        assert!(store.get("client-1").await.unwrap().acknowledged);
    }

    #[tokio::test]
    async fn test_update_header_last_writer_wins() {
        let store = InMemoryMessagePersistence::new();

        store
            .insert_message("client-1", Utc::now(), b"hello", &test_headers())
            .await
            .unwrap();
        store
            .update_header("client-1", "routed-to", "orders")
            .await
            .unwrap();
        store
            .update_header("client-1", "routed-to", "billing")
            .await
            .unwrap();

        let stored = store.get("client-1").await.unwrap();
        assert_eq!(stored.headers.get("routed-to"), Some(&"billing".to_string()));

        let err = store.update_header("ghost", "k", "v").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
