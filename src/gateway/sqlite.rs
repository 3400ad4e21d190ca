//! SQLite implementation of gateway persistence.
//!
//! The create path relies on the database's conflict detection: the
//! insert carries `ON CONFLICT DO NOTHING` and a zero row count tells the
//! caller it lost the race. The acknowledge path flips the flag inside a
//! transaction with `WHERE acknowledged = 0`, so a duplicate ack always
//! observes the committed flag.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Acquire, Row, SqlitePool};

use super::schema::{GatewayMessages, CREATE_GATEWAY_MESSAGES_TABLE};
use super::{escape_client_id, MessagePersistence, PersistenceError, Result};

/// SQLite-backed gateway message store.
pub struct SqliteMessagePersistence {
    pool: SqlitePool,
}

impl SqliteMessagePersistence {
    /// Create a new SQLite gateway store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_GATEWAY_MESSAGES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessagePersistence for SqliteMessagePersistence {
    async fn insert_message(
        &self,
        client_id: &str,
        time_received: DateTime<Utc>,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<bool> {
        let escaped = escape_client_id(client_id);
        let headers_json = serde_json::to_string(headers)?;

        let query = Query::insert()
            .into_table(GatewayMessages::Table)
            .columns([
                GatewayMessages::Id,
                GatewayMessages::TimeReceived,
                GatewayMessages::Headers,
                GatewayMessages::OriginalMessage,
                GatewayMessages::Acknowledged,
            ])
            .values_panic([
                escaped.into(),
                time_received.to_rfc3339().into(),
                headers_json.into(),
                body.to_vec().into(),
                0i32.into(),
            ])
            .on_conflict(OnConflict::column(GatewayMessages::Id).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;

        // Zero rows affected means a conflicting create already won.
        Ok(result.rows_affected() == 1)
    }

    async fn ack_message(
        &self,
        client_id: &str,
    ) -> Result<Option<(Vec<u8>, HashMap<String, String>)>> {
        let escaped = escape_client_id(client_id);

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let select = Query::select()
            .columns([
                GatewayMessages::OriginalMessage,
                GatewayMessages::Headers,
                GatewayMessages::Acknowledged,
            ])
            .from(GatewayMessages::Table)
            .and_where(Expr::col(GatewayMessages::Id).eq(escaped.clone()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(client_id.to_string()))?;

        let acknowledged: i64 = row.get(2);
        if acknowledged != 0 {
            return Ok(None);
        }

        let update = Query::update()
            .table(GatewayMessages::Table)
            .value(GatewayMessages::Acknowledged, 1i32)
            .and_where(Expr::col(GatewayMessages::Id).eq(escaped))
            .and_where(Expr::col(GatewayMessages::Acknowledged).eq(0i32))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&mut *tx).await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            // A concurrent ack flipped the flag between our read and write.
            return Ok(None);
        }

        let body: Vec<u8> = row.get(0);
        let headers_json: String = row.get(1);
        let headers: HashMap<String, String> = serde_json::from_str(&headers_json)?;

        Ok(Some((body, headers)))
    }

    async fn update_header(&self, client_id: &str, key: &str, value: &str) -> Result<()> {
        let escaped = escape_client_id(client_id);

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let select = Query::select()
            .columns([GatewayMessages::Headers])
            .from(GatewayMessages::Table)
            .and_where(Expr::col(GatewayMessages::Id).eq(escaped.clone()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(client_id.to_string()))?;

        let headers_json: String = row.get(0);
        let mut headers: HashMap<String, String> = serde_json::from_str(&headers_json)?;
        headers.insert(key.to_string(), value.to_string());

        let update = Query::update()
            .table(GatewayMessages::Table)
            .value(GatewayMessages::Headers, serde_json::to_string(&headers)?)
            .and_where(Expr::col(GatewayMessages::Id).eq(escaped))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&update).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteMessagePersistence) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.db");
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap();
        let store = SqliteMessagePersistence::new(pool);
        store.init().await.unwrap();
        (dir, store)
    }

    fn test_headers() -> HashMap<String, String> {
        HashMap::from([("k".to_string(), "v".to_string())])
    }

    #[tokio::test]
    async fn test_insert_then_ack_scenario() {
        let (_dir, store) = test_store().await;

        assert!(store
            .insert_message("client-1", Utc::now(), b"hello", &test_headers())
            .await
            .unwrap());
        assert!(!store
            .insert_message("client-1", Utc::now(), b"hello", &test_headers())
            .await
            .unwrap());

        let (body, headers) = store
            .ack_message("client-1")
            .await
            .unwrap()
            .expect("first ack succeeds");
        assert_eq!(body, b"hello");
        assert_eq!(headers, test_headers());

        assert!(store.ack_message("client-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ack_unknown_id_is_contract_violation() {
        let (_dir, store) = test_store().await;

        let err = store.ack_message("ghost").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_escaping_equivalence() {
        let (_dir, store) = test_store().await;

        assert!(store
            .insert_message("a\\b", Utc::now(), b"payload", &HashMap::new())
            .await
            .unwrap());
        // The pre-escaped form resolves to the same record.
        assert!(!store
            .insert_message("a_b", Utc::now(), b"payload", &HashMap::new())
            .await
            .unwrap());

        let (body, _) = store
            .ack_message("a_b")
            .await
            .unwrap()
            .expect("ack through escaped form");
        assert_eq!(body, b"payload");
        assert!(store.ack_message("a\\b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_create_one_record() {
        let (_dir, store) = test_store().await;
        let store = std::sync::Arc::new(store);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_message("contended", Utc::now(), b"hello", &HashMap::new())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let created = results
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(created, 1);

        // Exactly one record exists and it is still acknowledgeable once.
        assert!(store.ack_message("contended").await.unwrap().is_some());
        assert!(store.ack_message("contended").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_header() {
        let (_dir, store) = test_store().await;

        store
            .insert_message("client-1", Utc::now(), b"hello", &test_headers())
            .await
            .unwrap();
        store
            .update_header("client-1", "routed-to", "orders")
            .await
            .unwrap();
        store.update_header("client-1", "k", "v2").await.unwrap();

        let (_, headers) = store.ack_message("client-1").await.unwrap().unwrap();
        assert_eq!(headers.get("routed-to"), Some(&"orders".to_string()));
        assert_eq!(headers.get("k"), Some(&"v2".to_string()));
    }

    #[tokio::test]
    async fn test_update_header_unknown_id() {
        let (_dir, store) = test_store().await;

        let err = store.update_header("ghost", "k", "v").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
