//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building.

use sea_query::Iden;

/// Gateway messages table schema.
#[derive(Iden)]
pub enum GatewayMessages {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "time_received"]
    TimeReceived,
    #[iden = "headers"]
    Headers,
    #[iden = "original_message"]
    OriginalMessage,
    #[iden = "acknowledged"]
    Acknowledged,
}

/// SQL for creating the gateway messages table.
pub const CREATE_GATEWAY_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS gateway_messages (
    id TEXT PRIMARY KEY,
    time_received TEXT NOT NULL,
    headers TEXT NOT NULL,
    original_message BLOB NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0
);
"#;
