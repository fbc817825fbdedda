use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::conversation::{ConversationState, ThreadId};
use crate::errors::CheckpointError;

/// Per-thread persistence of conversation state between turns.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, CheckpointError>;
    async fn save(&self, thread_id: &ThreadId, state: &ConversationState) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<ThreadId, ConversationState>>,
}

impl InMemoryCheckpointStore {
    pub async fn thread_count(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, CheckpointError> {
        Ok(self.states.read().await.get(thread_id).cloned())
    }

    async fn save(&self, thread_id: &ThreadId, state: &ConversationState) -> Result<(), CheckpointError> {
        self.states.write().await.insert(thread_id.clone(), state.clone());
        Ok(())
    }
}
