use kairos_common::{ChatMessage, Conversation, GenerationId, MessageId};
use std::fmt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    AwaitingModel,
    Acquiring,
    Loading,
    Ready,
    Generating,
    Errored,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::AwaitingModel => "awaiting model",
            SessionState::Acquiring => "acquiring",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// The one in-flight generation
pub(crate) struct ActiveGeneration {
    pub id: GenerationId,
    pub cancel: CancellationToken,
    pub message_id: MessageId,
    /// Filtered text received so far
    pub content: String,
    pub task: JoinHandle<()>,
}

/// Internal state. Only `Generating` holds a generation token, so two
/// generations cannot be represented at once.
pub(crate) enum Phase {
    Uninitialized,
    AwaitingModel,
    Acquiring { model: String, cancel: CancellationToken },
    Loading { model: String },
    Ready,
    Generating(ActiveGeneration),
    Errored { message: String },
}

impl Phase {
    pub fn state(&self) -> SessionState {
        match self {
            Phase::Uninitialized => SessionState::Uninitialized,
            Phase::AwaitingModel => SessionState::AwaitingModel,
            Phase::Acquiring { .. } => SessionState::Acquiring,
            Phase::Loading { .. } => SessionState::Loading,
            Phase::Ready => SessionState::Ready,
            Phase::Generating(_) => SessionState::Generating,
            Phase::Errored { .. } => SessionState::Errored,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Phase::Acquiring { .. } | Phase::Loading { .. } | Phase::Generating(_)
        )
    }
}

/// Read-only view of the session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Current conversation header; `messages` is empty
    pub conversation: Option<Conversation>,
    /// Visible messages, including an unsaved assistant placeholder
    pub transcript: Vec<ChatMessage>,
    pub model: Option<String>,
    /// Model being acquired or loaded
    pub pending_model: Option<String>,
    pub error: Option<String>,
    pub status: String,
}

impl SessionSnapshot {
    pub fn is_generating(&self) -> bool {
        self.state == SessionState::Generating
    }
}
