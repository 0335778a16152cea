//! Chat message history stored in a SQL Server table.
//!
//! One table holds many sessions; every statement here filters on the
//! session id, and messages come back in insertion order (`ORDER BY id`).

use crate::database::schema::{check_chat_history_columns, table_columns};
use crate::engine::{EngineConnection, MssqlEngine};
use crate::error::MssqlError;
use crate::message::{ChatMessage, StoredMessage};
use crate::security::safe_identifier;
use std::sync::Arc;
use tracing::debug;

/// Message history of one session.
#[derive(Debug, Clone)]
pub struct MssqlChatMessageHistory {
    engine: Arc<MssqlEngine>,
    table_name: String,
    table: String,
    session_id: String,
}

impl MssqlChatMessageHistory {
    /// Open the history of `session_id` in `table_name`.
    ///
    /// The table must exist with the columns `id`, `session_id`, `data` and
    /// `type`; see [`MssqlEngine::init_chat_history_table`].
    pub async fn new(
        engine: Arc<MssqlEngine>,
        table_name: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self, MssqlError> {
        let table_name = table_name.into();
        let table = safe_identifier(&table_name)?;

        {
            let mut conn = engine.connect().await?;
            let columns = table_columns(&mut conn, &table_name)
                .await
                .map_err(|e| e.with_context(format!("table '{}'", table_name)))?;
            check_chat_history_columns(&table_name, &columns)?;
        }

        Ok(Self {
            engine,
            table_name,
            table,
            session_id: session_id.into(),
        })
    }

    /// The session this history reads and writes.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The backing table.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn context(&self) -> String {
        format!("table '{}', session '{}'", self.table_name, self.session_id)
    }

    /// All messages of the session, oldest first.
    pub async fn messages(&self) -> Result<Vec<ChatMessage>, MssqlError> {
        let sql = format!(
            "SELECT [data], [type] FROM {} WHERE [session_id] = @P1 ORDER BY [id]",
            self.table
        );

        let result = {
            let mut conn = self.engine.connect().await?;
            conn.fetch_all(&sql, &[&self.session_id.as_str()])
                .await
                .map_err(|e| e.with_context(self.context()))?
        };

        result
            .rows
            .iter()
            .map(|row| {
                let (Some(data), Some(type_tag)) = (row.get_str("data"), row.get_str("type"))
                else {
                    return Err(MssqlError::decode(
                        "History row has a NULL or non-text data/type column",
                    ));
                };
                ChatMessage::from_stored(type_tag, data)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.with_context(self.context()))
    }

    async fn insert(
        &self,
        conn: &mut EngineConnection<'_>,
        stored: &StoredMessage,
    ) -> Result<(), MssqlError> {
        let sql = format!(
            "INSERT INTO {} ([session_id], [data], [type]) VALUES (@P1, @P2, @P3)",
            self.table
        );
        conn.execute(
            &sql,
            &[
                &self.session_id.as_str(),
                &stored.data.as_str(),
                &stored.message_type.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Append one message.
    pub async fn add_message(&self, message: &ChatMessage) -> Result<(), MssqlError> {
        let stored = message.to_stored()?;
        let mut conn = self.engine.connect().await?;
        self.insert(&mut conn, &stored)
            .await
            .map_err(|e| e.with_context(self.context()))?;
        debug!("Added {} message to {}", stored.message_type, self.context());
        Ok(())
    }

    /// Append a human message.
    pub async fn add_user_message(&self, content: impl Into<String>) -> Result<(), MssqlError> {
        self.add_message(&ChatMessage::human(content)).await
    }

    /// Append an AI message.
    pub async fn add_ai_message(&self, content: impl Into<String>) -> Result<(), MssqlError> {
        self.add_message(&ChatMessage::ai(content)).await
    }

    /// Append several messages in order, all or none.
    pub async fn add_messages(&self, messages: &[ChatMessage]) -> Result<(), MssqlError> {
        if messages.is_empty() {
            return Ok(());
        }
        let stored = messages
            .iter()
            .map(ChatMessage::to_stored)
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.engine.connect().await?;
        conn.begin_transaction()
            .await
            .map_err(|e| e.with_context(self.context()))?;

        let inserted = async {
            for message in &stored {
                self.insert(&mut conn, message).await?;
            }
            Ok::<(), MssqlError>(())
        }
        .await;

        conn.finish_transaction(inserted)
            .await
            .map_err(|e| e.with_context(self.context()))?;
        debug!("Added {} messages to {}", stored.len(), self.context());
        Ok(())
    }

    /// Delete every message of the session. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64, MssqlError> {
        let sql = format!("DELETE FROM {} WHERE [session_id] = @P1", self.table);
        let mut conn = self.engine.connect().await?;
        let removed = conn
            .execute(&sql, &[&self.session_id.as_str()])
            .await
            .map_err(|e| e.with_context(self.context()))?;
        debug!("Cleared {} messages from {}", removed, self.context());
        Ok(removed)
    }
}
