use crate::{append_message, into_listing, ConversationStore};
use async_trait::async_trait;
use kairos_common::{ChatMessage, Conversation, ConversationId, Error, Result, Role};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One pretty-printed JSON file per conversation, named `<id>.json`
pub struct JsonStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Cannot create {}: {}", dir.display(), e)))?;
        debug!(dir = %dir.display(), "Opened conversation store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, id: &ConversationId) -> Result<PathBuf> {
        let valid = !id.as_str().is_empty()
            && id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::BadRequest(format!("Invalid conversation id: {}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read(&self, id: &ConversationId) -> Result<Conversation> {
        let path = self.file_path(id)?;
        let payload = match fs::read_to_string(&path).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ConversationNotFound(id.to_string()));
            }
            Err(e) => return Err(Error::Storage(format!("Cannot read {}: {}", path.display(), e))),
        };
        Ok(serde_json::from_str(&payload)?)
    }

    /// Write through a temp file so a crash never leaves a torn record
    async fn write(&self, conversation: &Conversation) -> Result<()> {
        let path = self.file_path(&conversation.id)?;
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(conversation)?;

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&payload).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Storage(format!("Cannot write {}: {}", path.display(), e)));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonStore {
    async fn create(&self, title: &str) -> Result<Conversation> {
        let _guard = self.write_lock.lock().await;
        let conversation = Conversation::new(title);
        self.write(&conversation).await?;
        Ok(conversation)
    }

    async fn list(&self) -> Result<Vec<Conversation>> {
        let mut conversations = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let payload = fs::read_to_string(&path).await?;
            match serde_json::from_str::<Conversation>(&payload) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable conversation: {}", e),
            }
        }

        Ok(into_listing(conversations))
    }

    async fn get(&self, id: &ConversationId) -> Result<Conversation> {
        let mut conversation = self.read(id).await?;
        conversation.sort_messages();
        Ok(conversation)
    }

    async fn delete(&self, id: &ConversationId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.file_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ConversationNotFound(id.to_string()))
            }
            Err(e) => Err(Error::Storage(format!("Cannot delete {}: {}", path.display(), e))),
        }
    }

    async fn rename(&self, id: &ConversationId, title: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self.read(id).await?;
        conversation.title = title.to_string();
        conversation.touch();
        self.write(&conversation).await
    }

    async fn add_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        role: Role,
    ) -> Result<ChatMessage> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self.read(conversation_id).await?;
        let message = append_message(&mut conversation, content, role)?;
        self.write(&conversation).await?;
        Ok(message)
    }
}
