use crate::state::{SessionSnapshot, SessionState};
use kairos_acquire::DownloadState;
use kairos_common::{ChatMessage, Conversation, ConversationId, GenerationId, MessageId, Result};
use tokio::sync::oneshot;

/// Requests handled by the orchestrator task
pub enum SessionCommand {
    SelectModel(String),
    SendMessage(String),
    Cancel,
    NewConversation,
    LoadConversation(ConversationId),
    DeleteConversation(ConversationId),
    ListConversations(oneshot::Sender<Result<Vec<Conversation>>>),
    ListModels(oneshot::Sender<Result<Vec<String>>>),
    DeleteModel(String, oneshot::Sender<Result<bool>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// How a generation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Everything a front end needs to render the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Status(String),
    /// Fresh conversation; the transcript is empty
    ConversationStarted(Conversation),
    /// Transcript replaced by a stored conversation
    ConversationLoaded(Conversation),
    ConversationDeleted(ConversationId),
    TitleChanged {
        conversation_id: ConversationId,
        title: String,
    },
    /// A persisted user message
    MessageAdded(ChatMessage),
    /// Empty assistant placeholder appended to the transcript
    AssistantStarted { message_id: MessageId },
    Fragment { message_id: MessageId, text: String },
    GenerationFinished {
        message_id: MessageId,
        /// Final visible content, markers included
        content: String,
        /// Whether an assistant message was written to the store
        persisted: bool,
        outcome: GenerationOutcome,
    },
    DownloadProgress(DownloadState),
    ModelReady { model: String },
    Error {
        category: &'static str,
        message: String,
    },
}

/// Results posted back by background tasks
pub(crate) enum WorkerEvent {
    Fragment {
        generation: GenerationId,
        text: String,
    },
    GenerationEnded {
        generation: GenerationId,
        outcome: Result<()>,
    },
    DownloadPercent {
        model: String,
        percent: f64,
    },
    DownloadDetail(DownloadState),
    Acquired {
        model: String,
    },
    LoadFinished {
        model: String,
        result: Result<()>,
    },
}
