use crate::events::{GenerationOutcome, SessionCommand, SessionEvent, WorkerEvent};
use crate::state::{ActiveGeneration, Phase, SessionSnapshot, SessionState};
use futures::StreamExt;
use kairos_acquire::{AcquisitionManager, ProgressReporter};
use kairos_common::{
    derive_title, ChatMessage, Conversation, ConversationId, Error, GenerationId,
    GenerationParams, Result, Role, DEFAULT_CONVERSATION_TITLE,
};
use kairos_config::{ModelCatalog, ModelDescriptor};
use kairos_runtime::{InferenceEngine, StreamFilter};
use kairos_store::ConversationStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 32;
const CANCELLED_SUFFIX: &str = " [Cancelled]";

const STATUS_INITIALIZING: &str = "Initializing database...";
const STATUS_SELECT_MODEL: &str = "Please select a model to continue...";
const STATUS_CHECKING: &str = "Checking for model...";
const STATUS_READY: &str = "Ready! Start chatting...";
const STATUS_THINKING: &str = "Thinking...";
const STATUS_RESPONSE_CANCELLED: &str = "Response cancelled.";
const STATUS_DOWNLOAD_CANCELLED: &str = "Download cancelled.";
const STATUS_NEW_CONVERSATION: &str = "New conversation started.";
const STATUS_RETRY_HINT: &str = "Select the model again to retry.";

/// Engine shared between the session task and its background workers.
///
/// Loading takes the write half; a generation holds the read half only
/// while its stream is being opened.
pub type SharedEngine = Arc<RwLock<Box<dyn InferenceEngine>>>;

/// Collaborators handed to a session
pub struct SessionDeps {
    pub engine: Box<dyn InferenceEngine>,
    pub store: Arc<dyn ConversationStore>,
    pub acquisition: Arc<AcquisitionManager>,
    pub catalog: Arc<ModelCatalog>,
    pub filter: StreamFilter,
    pub params: GenerationParams,
}

/// Cloneable front-end handle onto a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::RuntimeError("Session has shut down".into()))
    }

    /// Acquire if needed, then load the named catalog model
    pub async fn select_model(&self, name: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::SelectModel(name.into())).await
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::SendMessage(text.into())).await
    }

    /// Stop the active generation or download
    pub async fn cancel(&self) -> Result<()> {
        self.send(SessionCommand::Cancel).await
    }

    pub async fn new_conversation(&self) -> Result<()> {
        self.send(SessionCommand::NewConversation).await
    }

    pub async fn load_conversation(&self, id: ConversationId) -> Result<()> {
        self.send(SessionCommand::LoadConversation(id)).await
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        self.send(SessionCommand::DeleteConversation(id)).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ListConversations(tx)).await?;
        rx.await
            .map_err(|_| Error::RuntimeError("Session has shut down".into()))?
    }

    /// Names of the model artifacts on disk
    pub async fn list_downloaded_models(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ListModels(tx)).await?;
        rx.await
            .map_err(|_| Error::RuntimeError("Session has shut down".into()))?
    }

    /// Delete a downloaded model; returns whether a file was removed.
    ///
    /// The loaded model and one being acquired or loaded cannot be deleted.
    pub async fn delete_model(&self, name: impl Into<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::DeleteModel(name.into(), tx)).await?;
        rx.await
            .map_err(|_| Error::RuntimeError("Session has shut down".into()))?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| Error::RuntimeError("Session has shut down".into()))
    }

    /// Stop background work and release the engine
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }
}

/// Start the session task.
///
/// Events are delivered in the order the session produced them. The task
/// ends after `shutdown` or once every handle is dropped.
pub fn spawn(
    deps: SessionDeps,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();

    let orchestrator = Orchestrator {
        engine: Arc::new(RwLock::new(deps.engine)),
        store: deps.store,
        acquisition: deps.acquisition,
        catalog: deps.catalog,
        filter: deps.filter,
        params: deps.params,
        phase: Phase::Uninitialized,
        conversation: None,
        transcript: Vec::new(),
        model_loaded: None,
        status: String::new(),
        last_error: None,
        events: event_tx,
        worker_tx,
    };

    let task = tokio::spawn(orchestrator.run(command_rx, worker_rx));
    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
        task,
    )
}

struct Orchestrator {
    engine: SharedEngine,
    store: Arc<dyn ConversationStore>,
    acquisition: Arc<AcquisitionManager>,
    catalog: Arc<ModelCatalog>,
    filter: StreamFilter,
    params: GenerationParams,

    phase: Phase,
    /// Header of the current conversation
    conversation: Option<Conversation>,
    transcript: Vec<ChatMessage>,
    model_loaded: Option<String>,
    status: String,
    last_error: Option<String>,

    events: mpsc::UnboundedSender<SessionEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        self.start().await;

        loop {
            tokio::select! {
                biased;
                Some(event) = worker_rx.recv() => self.handle_worker(event).await,
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        self.stop().await;
    }

    async fn start(&mut self) {
        self.set_status(STATUS_INITIALIZING);
        self.start_conversation().await;
        self.set_phase(Phase::AwaitingModel);
        self.set_status(STATUS_SELECT_MODEL);
    }

    async fn stop(&mut self) {
        info!("Session shutting down");
        match std::mem::replace(&mut self.phase, Phase::Uninitialized) {
            Phase::Generating(active) => {
                active.cancel.cancel();
                let _ = active.task.await;
            }
            Phase::Acquiring { cancel, .. } => cancel.cancel(),
            _ => {}
        }

        if let Err(e) = self.engine.write().await.shutdown().await {
            warn!(error = %e, "Engine shutdown failed");
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SelectModel(name) => self.select_model(name).await,
            SessionCommand::SendMessage(text) => self.send_message(text).await,
            SessionCommand::Cancel => self.cancel().await,
            SessionCommand::NewConversation => self.new_conversation().await,
            SessionCommand::LoadConversation(id) => self.load_conversation(id).await,
            SessionCommand::DeleteConversation(id) => self.delete_conversation(id).await,
            SessionCommand::ListConversations(reply) => {
                let _ = reply.send(self.store.list().await);
            }
            SessionCommand::ListModels(reply) => {
                let _ = reply.send(self.acquisition.list_downloaded().await);
            }
            SessionCommand::DeleteModel(name, reply) => {
                let _ = reply.send(self.delete_model(&name).await);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn handle_worker(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Fragment { generation, text } => self.on_fragment(generation, text),
            WorkerEvent::GenerationEnded {
                generation,
                outcome,
            } => self.on_generation_ended(generation, outcome).await,
            WorkerEvent::DownloadPercent { model, percent } => {
                if matches!(&self.phase, Phase::Acquiring { model: m, .. } if *m == model) {
                    let display = self.display_name(&model);
                    self.set_status(format!("Downloading {}: {:.1}%", display, percent));
                }
            }
            WorkerEvent::DownloadDetail(state) => {
                if matches!(self.phase, Phase::Acquiring { .. }) {
                    self.emit(SessionEvent::DownloadProgress(state));
                }
            }
            WorkerEvent::Acquired { model } => {
                if matches!(&self.phase, Phase::Acquiring { model: m, .. } if *m == model) {
                    let display = self.display_name(&model);
                    self.set_phase(Phase::Loading { model });
                    self.set_status(format!("Loading {}...", display));
                }
            }
            WorkerEvent::LoadFinished { model, result } => {
                self.on_load_finished(model, result).await
            }
        }
    }

    async fn select_model(&mut self, name: String) {
        if self.phase.is_busy() {
            warn!(model = %name, state = %self.phase.state(), "Model selection rejected");
            self.report(Error::BadRequest(format!(
                "Cannot change model while {}",
                self.phase.state()
            )));
            return;
        }

        let descriptor = match self.catalog.get(&name) {
            Ok(descriptor) => descriptor.clone(),
            Err(e) => {
                self.report(e);
                return;
            }
        };

        self.set_status(STATUS_CHECKING);
        let cancel = CancellationToken::new();
        if self.acquisition.is_downloaded(&descriptor.name) {
            debug!(model = %descriptor.name, "Model present, skipping download");
            self.set_phase(Phase::Loading {
                model: descriptor.name.clone(),
            });
            self.set_status(format!("Loading {}...", descriptor.display_name));
        } else {
            self.set_phase(Phase::Acquiring {
                model: descriptor.name.clone(),
                cancel: cancel.clone(),
            });
            self.set_status(format!("Downloading {}...", descriptor.display_name));
        }

        info!(model = %descriptor.name, "Model selected");
        tokio::spawn(acquire_and_load(
            self.acquisition.clone(),
            self.engine.clone(),
            descriptor,
            cancel,
            self.worker_tx.clone(),
        ));
    }

    async fn on_load_finished(&mut self, model: String, result: Result<()>) {
        let (pending, attempted_load) = match &self.phase {
            Phase::Acquiring { model: m, .. } => (m == &model, false),
            Phase::Loading { model: m } => (m == &model, true),
            _ => (false, false),
        };
        if !pending {
            debug!(model = %model, "Ignoring stale load result");
            return;
        }
        if attempted_load && result.is_err() {
            // A failed initialize leaves the engine without a model
            self.model_loaded = None;
        }

        match result {
            Ok(()) => {
                info!(model = %model, "Model ready");
                self.model_loaded = Some(model.clone());
                self.last_error = None;
                self.set_phase(Phase::Ready);
                self.emit(SessionEvent::ModelReady { model });
                self.set_status(STATUS_READY);
            }
            Err(e) if e.is_cancellation() => {
                info!(model = %model, "Download cancelled");
                let engine_ready = self.engine.read().await.is_initialized();
                if !engine_ready {
                    self.model_loaded = None;
                }
                if self.model_loaded.is_some() {
                    self.set_phase(Phase::Ready);
                } else {
                    self.set_phase(Phase::AwaitingModel);
                }
                self.set_status(STATUS_DOWNLOAD_CANCELLED);
            }
            Err(e) => {
                error!(model = %model, category = e.category(), error = %e, "Model setup failed");
                let message = e.to_string();
                self.set_phase(Phase::Errored {
                    message: message.clone(),
                });
                self.last_error = Some(message.clone());
                self.emit(SessionEvent::Error {
                    category: e.category(),
                    message: message.clone(),
                });
                if e.is_retryable() {
                    self.set_status(format!("Error: {}. {}", message, STATUS_RETRY_HINT));
                } else {
                    self.set_status(format!("Error: {}", message));
                }
            }
        }
    }

    /// Remove a downloaded model unless it is loaded or being set up
    async fn delete_model(&mut self, name: &str) -> Result<bool> {
        let pending = match &self.phase {
            Phase::Acquiring { model, .. } | Phase::Loading { model } => Some(model.as_str()),
            _ => None,
        };
        if self.model_loaded.as_deref() == Some(name) || pending == Some(name) {
            warn!(model = name, "Refusing to delete a model in use");
            return Err(Error::BadRequest(format!(
                "Cannot delete {} while it is in use",
                name
            )));
        }

        let deleted = self.acquisition.delete(name).await?;
        if deleted {
            let display = self.display_name(name);
            self.set_status(format!("Deleted {}.", display));
        }
        Ok(deleted)
    }

    async fn send_message(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        match &self.phase {
            Phase::Ready => {}
            Phase::Generating(_) => {
                warn!("Generation already in progress, message ignored");
                return;
            }
            _ => {
                self.report(Error::RuntimeNotReady);
                return;
            }
        }

        let conversation_id = match self.current_conversation_id().await {
            Ok(id) => id,
            Err(e) => {
                self.report(e);
                return;
            }
        };

        let first_message = !self.transcript.iter().any(|m| m.role == Role::User);
        let user_message = match self.store.add_message(&conversation_id, text, Role::User).await {
            Ok(message) => message,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        self.transcript.push(user_message.clone());
        self.emit(SessionEvent::MessageAdded(user_message));

        if first_message {
            self.retitle(&conversation_id, derive_title(text)).await;
        }

        let placeholder = ChatMessage::new(conversation_id.clone(), Role::Assistant, "");
        let message_id = placeholder.id.clone();
        self.transcript.push(placeholder);

        let history = match self.store.get(&conversation_id).await {
            Ok(conversation) => conversation.messages,
            Err(e) => {
                self.transcript.pop();
                self.report(e);
                return;
            }
        };

        let generation = GenerationId::new();
        let cancel = CancellationToken::new();
        info!(generation = %generation, messages = history.len(), "Starting generation");

        let task = tokio::spawn(stream_generation(
            self.engine.clone(),
            self.filter.clone(),
            history,
            self.params.clone(),
            cancel.clone(),
            generation.clone(),
            self.worker_tx.clone(),
        ));

        self.set_phase(Phase::Generating(ActiveGeneration {
            id: generation,
            cancel,
            message_id: message_id.clone(),
            content: String::new(),
            task,
        }));
        self.emit(SessionEvent::AssistantStarted { message_id });
        self.set_status(STATUS_THINKING);
    }

    async fn retitle(&mut self, conversation_id: &ConversationId, title: String) {
        if let Err(e) = self.store.rename(conversation_id, &title).await {
            self.report(e);
            return;
        }
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.title = title.clone();
        }
        self.emit(SessionEvent::TitleChanged {
            conversation_id: conversation_id.clone(),
            title,
        });
    }

    fn on_fragment(&mut self, generation: GenerationId, text: String) {
        let Phase::Generating(active) = &mut self.phase else {
            return;
        };
        if active.id != generation {
            return;
        }

        active.content.push_str(&text);
        let message_id = active.message_id.clone();
        if let Some(placeholder) = self.transcript.iter_mut().rev().find(|m| m.id == message_id) {
            placeholder.content.push_str(&text);
        }
        self.emit(SessionEvent::Fragment { message_id, text });
    }

    async fn on_generation_ended(&mut self, generation: GenerationId, outcome: Result<()>) {
        let matches = matches!(&self.phase, Phase::Generating(active) if active.id == generation);
        if !matches {
            debug!(generation = %generation, "Ignoring stale generation result");
            return;
        }

        let outcome = match outcome {
            Ok(()) => GenerationOutcome::Completed,
            Err(e) if e.is_cancellation() => GenerationOutcome::Cancelled,
            Err(e) => {
                error!(generation = %generation, error = %e, "Generation failed");
                GenerationOutcome::Failed(e.to_string())
            }
        };
        self.finish_generation(outcome).await;
    }

    async fn cancel(&mut self) {
        match &self.phase {
            Phase::Generating(active) => {
                info!(generation = %active.id, "Cancelling generation");
                active.cancel.cancel();
                self.finish_generation(GenerationOutcome::Cancelled).await;
            }
            Phase::Acquiring { model, cancel } => {
                info!(model = %model, "Cancelling download");
                cancel.cancel();
            }
            _ => debug!("Nothing to cancel"),
        }
    }

    /// Close the active generation and return to `Ready`.
    ///
    /// Completed text is saved when non-blank. Cancelled text is saved with
    /// the cancellation marker. Failed output is shown but never saved.
    async fn finish_generation(&mut self, outcome: GenerationOutcome) {
        let Phase::Generating(active) = std::mem::replace(&mut self.phase, Phase::Ready) else {
            return;
        };
        active.cancel.cancel();

        let (visible, to_persist) = match &outcome {
            GenerationOutcome::Completed => {
                let persist = (!active.content.trim().is_empty()).then(|| active.content.clone());
                (active.content.clone(), persist)
            }
            GenerationOutcome::Cancelled => {
                let visible = format!("{}{}", active.content, CANCELLED_SUFFIX);
                let persist = (!active.content.trim().is_empty()).then(|| visible.clone());
                (visible, persist)
            }
            GenerationOutcome::Failed(message) => {
                let visible = if active.content.is_empty() {
                    format!("Error: {}", message)
                } else {
                    format!("{}\n\nError: {}", active.content, message)
                };
                (visible, None)
            }
        };

        let mut persisted = false;
        if let Some(content) = to_persist {
            if let Some(conversation_id) = self.conversation.as_ref().map(|c| c.id.clone()) {
                match self
                    .store
                    .add_message(&conversation_id, &content, Role::Assistant)
                    .await
                {
                    Ok(_) => persisted = true,
                    Err(e) => {
                        error!(generation = %active.id, error = %e, "Failed to save response");
                        self.report(e);
                    }
                }
            }
        }

        if let Some(placeholder) = self
            .transcript
            .iter_mut()
            .rev()
            .find(|m| m.id == active.message_id)
        {
            placeholder.content = visible.clone();
        }

        info!(
            generation = %active.id,
            chars = active.content.chars().count(),
            persisted,
            "Generation finished"
        );

        self.emit(SessionEvent::StateChanged(SessionState::Ready));
        match &outcome {
            GenerationOutcome::Completed => self.set_status(STATUS_READY),
            GenerationOutcome::Cancelled => self.set_status(STATUS_RESPONSE_CANCELLED),
            GenerationOutcome::Failed(message) => {
                self.last_error = Some(message.clone());
                self.emit(SessionEvent::Error {
                    category: "generation",
                    message: message.clone(),
                });
                self.set_status(format!("Error: {}", message));
            }
        }
        self.emit(SessionEvent::GenerationFinished {
            message_id: active.message_id,
            content: visible,
            persisted,
            outcome,
        });
    }

    async fn new_conversation(&mut self) {
        if matches!(self.phase, Phase::Generating(_)) {
            self.report(Error::BadRequest(
                "Cannot start a new conversation while generating".into(),
            ));
            return;
        }

        if matches!(self.phase, Phase::Ready) {
            self.set_phase(Phase::Uninitialized);
            self.start_conversation().await;
            self.set_phase(Phase::Ready);
        } else {
            self.start_conversation().await;
        }
        self.set_status(STATUS_NEW_CONVERSATION);
    }

    async fn load_conversation(&mut self, id: ConversationId) {
        if matches!(self.phase, Phase::Generating(_)) {
            self.report(Error::BadRequest(
                "Cannot switch conversations while generating".into(),
            ));
            return;
        }

        match self.store.get(&id).await {
            Ok(conversation) => {
                info!(conversation = %id, messages = conversation.messages.len(), "Conversation loaded");
                self.transcript = conversation.messages.clone();
                let mut header = conversation.clone();
                header.messages.clear();
                self.conversation = Some(header);
                self.emit(SessionEvent::ConversationLoaded(conversation));
            }
            Err(e) => self.report(e),
        }
    }

    async fn delete_conversation(&mut self, id: ConversationId) {
        let is_current = self.conversation.as_ref().is_some_and(|c| c.id == id);
        if is_current && matches!(self.phase, Phase::Generating(_)) {
            self.report(Error::BadRequest(
                "Cannot delete a conversation while generating".into(),
            ));
            return;
        }

        if let Err(e) = self.store.delete(&id).await {
            self.report(e);
            return;
        }
        info!(conversation = %id, "Conversation deleted");
        self.emit(SessionEvent::ConversationDeleted(id));

        if is_current {
            self.start_conversation().await;
        }
    }

    /// Create a fresh conversation and make it current
    async fn start_conversation(&mut self) {
        self.transcript.clear();
        match self.store.create(DEFAULT_CONVERSATION_TITLE).await {
            Ok(conversation) => {
                debug!(conversation = %conversation.id, "Conversation created");
                self.conversation = Some(conversation.clone());
                self.emit(SessionEvent::ConversationStarted(conversation));
            }
            Err(e) => {
                self.conversation = None;
                self.report(e);
            }
        }
    }

    /// Current conversation id, creating a conversation if an earlier
    /// attempt failed
    async fn current_conversation_id(&mut self) -> Result<ConversationId> {
        if let Some(conversation) = &self.conversation {
            return Ok(conversation.id.clone());
        }
        let conversation = self.store.create(DEFAULT_CONVERSATION_TITLE).await?;
        let id = conversation.id.clone();
        self.conversation = Some(conversation.clone());
        self.emit(SessionEvent::ConversationStarted(conversation));
        Ok(id)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let pending_model = match &self.phase {
            Phase::Acquiring { model, .. } | Phase::Loading { model } => Some(model.clone()),
            _ => None,
        };
        let error = match &self.phase {
            Phase::Errored { message } => Some(message.clone()),
            _ => self.last_error.clone(),
        };
        SessionSnapshot {
            state: self.phase.state(),
            conversation: self.conversation.clone(),
            transcript: self.transcript.clone(),
            model: self.model_loaded.clone(),
            pending_model,
            error,
            status: self.status.clone(),
        }
    }

    fn display_name(&self, model: &str) -> String {
        self.catalog
            .get(model)
            .map(|d| d.display_name.clone())
            .unwrap_or_else(|_| model.to_string())
    }

    fn set_phase(&mut self, phase: Phase) {
        let state = phase.state();
        self.phase = phase;
        debug!(state = %state, "Session state changed");
        self.emit(SessionEvent::StateChanged(state));
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.emit(SessionEvent::Status(self.status.clone()));
    }

    /// Surface a failure without leaving the current state
    fn report(&mut self, error: Error) {
        warn!(category = error.category(), error = %error, "Session operation failed");
        let message = error.to_string();
        self.last_error = Some(message.clone());
        self.emit(SessionEvent::Error {
            category: error.category(),
            message: message.clone(),
        });
        self.set_status(format!("Error: {}", message));
    }

    fn emit(&self, event: SessionEvent) {
        // A front end that stopped listening does not stop the session
        let _ = self.events.send(event);
    }
}

async fn acquire_and_load(
    acquisition: Arc<AcquisitionManager>,
    engine: SharedEngine,
    descriptor: ModelDescriptor,
    cancel: CancellationToken,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let model = descriptor.name.clone();
    let percent_tx = worker_tx.clone();
    let percent_model = model.clone();
    let detail_tx = worker_tx.clone();
    let progress = ProgressReporter::default()
        .on_percent(move |percent| {
            let _ = percent_tx.send(WorkerEvent::DownloadPercent {
                model: percent_model.clone(),
                percent,
            });
        })
        .on_detailed(move |state| {
            let _ = detail_tx.send(WorkerEvent::DownloadDetail(state));
        });

    let result = match acquisition.acquire(&descriptor, progress, &cancel).await {
        Ok(path) => {
            let _ = worker_tx.send(WorkerEvent::Acquired {
                model: model.clone(),
            });
            engine.write().await.initialize(&path).await
        }
        Err(e) => Err(e),
    };

    let _ = worker_tx.send(WorkerEvent::LoadFinished { model, result });
}

async fn stream_generation(
    engine: SharedEngine,
    filter: StreamFilter,
    history: Vec<ChatMessage>,
    params: GenerationParams,
    cancel: CancellationToken,
    generation: GenerationId,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let outcome = forward_fragments(
        &engine,
        &filter,
        &history,
        &params,
        &cancel,
        &generation,
        &worker_tx,
    )
    .await;
    let _ = worker_tx.send(WorkerEvent::GenerationEnded {
        generation,
        outcome,
    });
}

async fn forward_fragments(
    engine: &SharedEngine,
    filter: &StreamFilter,
    history: &[ChatMessage],
    params: &GenerationParams,
    cancel: &CancellationToken,
    generation: &GenerationId,
    worker_tx: &mpsc::UnboundedSender<WorkerEvent>,
) -> Result<()> {
    let raw = {
        let engine = engine.read().await;
        engine.generate(history, params, cancel.clone()).await?
    };

    let mut stream = filter.apply(raw, cancel.clone());
    while let Some(fragment) = stream.next().await {
        let text = fragment?;
        let sent = worker_tx.send(WorkerEvent::Fragment {
            generation: generation.clone(),
            text,
        });
        if sent.is_err() {
            break;
        }
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled("generation cancelled".into()));
    }
    Ok(())
}
