use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};

use datapilot_core::{CheckpointError, CheckpointStore, ConversationState, Intent, ThreadId};

use super::RepositoryError;
use crate::DbPool;

/// Row metadata kept beside the serialized state for operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub thread_id: String,
    pub intent: String,
    pub message_count: i64,
    pub updated_at: DateTime<Utc>,
}

pub struct SqlCheckpointStore {
    pool: DbPool,
}

impl SqlCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, RepositoryError> {
        let row = sqlx::query("SELECT state_json FROM conversation_checkpoint WHERE thread_id = ?")
            .bind(thread_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let raw = row.try_get::<String, _>("state_json")?;
            serde_json::from_str::<ConversationState>(&raw)
                .map_err(|error| RepositoryError::Decode(error.to_string()))
        })
        .transpose()
    }

    pub async fn upsert(&self, thread_id: &ThreadId, state: &ConversationState) -> Result<(), RepositoryError> {
        let state_json =
            serde_json::to_string(state).map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO conversation_checkpoint (
                thread_id,
                intent,
                message_count,
                state_json,
                updated_at
             ) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                intent = excluded.intent,
                message_count = excluded.message_count,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
        )
        .bind(thread_id.as_str())
        .bind(state.intent.as_str())
        .bind(state.message_count() as i64)
        .bind(state_json)
        // Fixed-width timestamps keep `ORDER BY updated_at` chronological.
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recently updated threads first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<CheckpointSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                thread_id,
                intent,
                message_count,
                updated_at
             FROM conversation_checkpoint
             ORDER BY updated_at DESC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(summary_from_row).collect()
    }
}

fn summary_from_row(row: SqliteRow) -> Result<CheckpointSummary, RepositoryError> {
    let updated_raw = row.try_get::<String, _>("updated_at")?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid updated_at `{updated_raw}`: {error}")))?
        .with_timezone(&Utc);
    let intent = row.try_get::<String, _>("intent")?;

    Ok(CheckpointSummary {
        thread_id: row.try_get("thread_id")?,
        intent: Intent::from_label(&intent).as_str().to_string(),
        message_count: row.try_get("message_count")?,
        updated_at,
    })
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, CheckpointError> {
        self.find(thread_id).await.map_err(|error| match error {
            RepositoryError::Decode(message) => {
                CheckpointError::Corrupt { thread_id: thread_id.to_string(), message }
            }
            RepositoryError::Database(error) => CheckpointError::Storage(error.to_string()),
        })
    }

    async fn save(&self, thread_id: &ThreadId, state: &ConversationState) -> Result<(), CheckpointError> {
        self.upsert(thread_id, state).await.map_err(|error| CheckpointError::Storage(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use datapilot_core::{
        CheckpointError, CheckpointStore, ConversationState, Intent, Message, ThreadId, ToolCall,
    };

    use super::SqlCheckpointStore;
    use crate::migrations;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_state() -> ConversationState {
        let mut state = ConversationState::new();
        state.intent = Intent::Database;
        state.set_system_instruction("sys");
        state.push(Message::user("how many orders?"));
        let mut arguments = serde_json::Map::new();
        arguments.insert("sql".to_string(), serde_json::json!("SELECT COUNT(*) FROM orders"));
        state.push(Message::assistant_with_calls(
            "",
            vec![ToolCall { id: "c1".to_string(), name: "query".to_string(), arguments }],
        ));
        state.push(Message::tool_result("c1", "query", "42"));
        state.push(Message::assistant("42 orders."));
        state
    }

    #[tokio::test]
    async fn saved_state_loads_back_per_thread() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        let thread = ThreadId("slack:C1:1700000000.1".to_string());
        let state = sample_state();

        store.save(&thread, &state).await.expect("save");

        assert_eq!(store.load(&thread).await.expect("load"), Some(state));
        assert_eq!(store.load(&ThreadId("other".to_string())).await.expect("load"), None);
    }

    #[tokio::test]
    async fn save_overwrites_previous_checkpoint() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        let thread = ThreadId("t-1".to_string());
        store.save(&thread, &ConversationState::new()).await.expect("first save");
        store.save(&thread, &sample_state()).await.expect("second save");

        let recent = store.recent(10).await.expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].intent, "DATABASE");
        assert_eq!(recent[0].message_count, 5);
    }

    #[tokio::test]
    async fn unreadable_payload_is_reported_as_corrupt() {
        let pool = setup_pool().await;
        sqlx::query(
            "INSERT INTO conversation_checkpoint (thread_id, intent, message_count, state_json, updated_at)
             VALUES ('broken', 'GENERAL', 0, '{not json', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("seed broken row");

        let store = SqlCheckpointStore::new(pool);
        let error = store.load(&ThreadId("broken".to_string())).await.expect_err("corrupt");
        assert!(matches!(error, CheckpointError::Corrupt { ref thread_id, .. } if thread_id == "broken"));
    }
}
