mod json_store;
mod memory;


pub use json_store::JsonStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use kairos_common::{ChatMessage, Conversation, ConversationId, Result, Role};

/// Durable conversation history
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation
    async fn create(&self, title: &str) -> Result<Conversation>;

    /// All conversations, most recently updated first.
    ///
    /// Only headers are returned; `messages` is left empty.
    async fn list(&self) -> Result<Vec<Conversation>>;

    /// One conversation with its messages in timestamp order
    async fn get(&self, id: &ConversationId) -> Result<Conversation>;

    async fn delete(&self, id: &ConversationId) -> Result<()>;

    async fn rename(&self, id: &ConversationId, title: &str) -> Result<()>;

    /// Append a message and bump the conversation's `last_updated`
    async fn add_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        role: Role,
    ) -> Result<ChatMessage>;
}

/// Build and validate a message for `conversation`, then append it
pub(crate) fn append_message(
    conversation: &mut Conversation,
    content: &str,
    role: Role,
) -> Result<ChatMessage> {
    let message = ChatMessage::new(conversation.id.clone(), role, content);
    message.validate()?;
    conversation.push_message(message.clone());
    Ok(message)
}

/// Strip messages and order by `last_updated` descending
pub(crate) fn into_listing(mut conversations: Vec<Conversation>) -> Vec<Conversation> {
    for conversation in &mut conversations {
        conversation.messages.clear();
    }
    conversations.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    conversations
}
