use crate::{append_message, into_listing, ConversationStore};
use async_trait::async_trait;
use kairos_common::{ChatMessage, Conversation, ConversationId, Error, Result, Role};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store, used by tests and `--ephemeral` sessions
#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self, title: &str) -> Result<Conversation> {
        let conversation = Conversation::new(title);
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn list(&self) -> Result<Vec<Conversation>> {
        let all = self.conversations.read().await.values().cloned().collect();
        Ok(into_listing(all))
    }

    async fn get(&self, id: &ConversationId) -> Result<Conversation> {
        let mut conversation = self
            .conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))?;
        conversation.sort_messages();
        Ok(conversation)
    }

    async fn delete(&self, id: &ConversationId) -> Result<()> {
        self.conversations
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))
    }

    async fn rename(&self, id: &ConversationId, title: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))?;
        conversation.title = title.to_string();
        conversation.touch();
        Ok(())
    }

    async fn add_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        role: Role,
    ) -> Result<ChatMessage> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        append_message(conversation, content, role)
    }
}
