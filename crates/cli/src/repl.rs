use kairos_acquire::{AcquisitionManager, DownloadState};
use kairos_common::{Conversation, ConversationId};
use kairos_config::{ModelCatalog, ModelCategory};
use kairos_session::{GenerationOutcome, SessionEvent, SessionHandle};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

pub const HELP: &str = "\
Commands:
  /models            list available models
  /model <name>      download if needed and load a model
  /downloaded        list models on disk
  /rmmodel <name>    delete a downloaded model
  /new               start a new conversation
  /history           list saved conversations
  /load <n|id>       open a conversation from /history
  /delete <n|id>     delete a conversation
  /cancel            stop the current response or download
  /status            show session state
  /help              show this help
  /quit              exit
Anything else is sent as a message.";

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Models,
    Model(String),
    Downloaded,
    RemoveModel(String),
    New,
    History,
    Load(String),
    Delete(String),
    Cancel,
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    match (name, arg.is_empty()) {
        ("models", _) => Input::Models,
        ("model", false) => Input::Model(arg.to_string()),
        ("downloaded", _) => Input::Downloaded,
        ("rmmodel", false) => Input::RemoveModel(arg.to_string()),
        ("new", _) => Input::New,
        ("history", _) => Input::History,
        ("load", false) => Input::Load(arg.to_string()),
        ("delete", false) => Input::Delete(arg.to_string()),
        ("cancel", _) => Input::Cancel,
        ("status", _) => Input::Status,
        ("help", _) => Input::Help,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Resolve a `/history` index (1-based) or a literal conversation id
pub fn resolve_conversation(arg: &str, listing: &[Conversation]) -> ConversationId {
    match arg.parse::<usize>() {
        Ok(n) if n >= 1 && n <= listing.len() => listing[n - 1].id.clone(),
        _ => ConversationId::from(arg),
    }
}

/// Catalog listing grouped by category
pub fn format_models(catalog: &ModelCatalog, acquisition: &AcquisitionManager) -> String {
    let mut out = String::new();
    for category in [ModelCategory::Small, ModelCategory::Medium, ModelCategory::Large] {
        let models = catalog.by_category(category);
        if models.is_empty() {
            continue;
        }
        out.push_str(&format!("{}:\n", category));
        for model in models {
            let mut tags = Vec::new();
            if model.recommended {
                tags.push("recommended");
            }
            if acquisition.is_downloaded(&model.name) {
                tags.push("downloaded");
            }
            let tags = if tags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", tags.join(", "))
            };
            out.push_str(&format!(
                "  {:<40} {:<28} {:>8}  RAM {}{}\n",
                model.name,
                model.display_name,
                model.size_text(),
                model.min_ram,
                tags
            ));
        }
    }
    out
}

pub fn format_download(state: &DownloadState) -> String {
    let percent = state
        .percent
        .map(|p| format!("{:5.1}%", p))
        .unwrap_or_else(|| format!("{} MB", state.bytes_downloaded / (1024 * 1024)));
    match state.formatted_eta() {
        Some(eta) if !state.complete => {
            format!("{}  {}  ETA {}", percent, state.formatted_speed(), eta)
        }
        _ => format!("{}  {}", percent, state.formatted_speed()),
    }
}

/// Print session events until the session goes away
pub async fn render_events(mut events: UnboundedReceiver<SessionEvent>) {
    let mut stdout = std::io::stdout();
    let mut downloading = false;

    while let Some(event) = events.recv().await {
        if downloading && !matches!(event, SessionEvent::DownloadProgress(_)) {
            let _ = writeln!(stdout);
            downloading = false;
        }

        match event {
            SessionEvent::Status(status) => {
                let _ = writeln!(stdout, "-- {}", status);
            }
            SessionEvent::AssistantStarted { .. } => {
                let _ = write!(stdout, "assistant> ");
            }
            SessionEvent::Fragment { text, .. } => {
                let _ = write!(stdout, "{}", text);
            }
            SessionEvent::GenerationFinished { outcome, .. } => match outcome {
                GenerationOutcome::Completed => {
                    let _ = writeln!(stdout);
                }
                GenerationOutcome::Cancelled => {
                    let _ = writeln!(stdout, " [Cancelled]");
                }
                GenerationOutcome::Failed(message) => {
                    let _ = writeln!(stdout, "\nError: {}", message);
                }
            },
            SessionEvent::DownloadProgress(state) => {
                let _ = write!(stdout, "\r{:<60}", format_download(&state));
                downloading = !state.complete;
                if state.complete {
                    let _ = writeln!(stdout);
                }
            }
            SessionEvent::ConversationLoaded(conversation) => {
                let _ = writeln!(stdout, "== {}", conversation.title);
                for message in &conversation.messages {
                    let _ = writeln!(stdout, "{}> {}", message.role, message.content);
                }
            }
            SessionEvent::TitleChanged { title, .. } => {
                let _ = writeln!(stdout, "== {}", title);
            }
            SessionEvent::StateChanged(_)
            | SessionEvent::ConversationStarted(_)
            | SessionEvent::ConversationDeleted(_)
            | SessionEvent::MessageAdded(_)
            | SessionEvent::ModelReady { .. }
            | SessionEvent::Error { .. } => {}
        }
        let _ = stdout.flush();
    }
}

/// Read commands from stdin until `/quit` or end of input
pub async fn run(
    session: SessionHandle,
    catalog: &ModelCatalog,
    acquisition: &AcquisitionManager,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut listing: Vec<Conversation> = Vec::new();

    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Empty => {}
            Input::Message(text) => session.send_message(text).await?,
            Input::Models => print!("{}", format_models(catalog, acquisition)),
            Input::Model(name) => session.select_model(name).await?,
            Input::Downloaded => {
                let names = session.list_downloaded_models().await?;
                if names.is_empty() {
                    println!("No models downloaded yet.");
                }
                for name in names {
                    println!("  {}", name);
                }
            }
            Input::RemoveModel(name) => match session.delete_model(name.as_str()).await {
                Ok(true) => {}
                Ok(false) => println!("{} is not downloaded", name),
                Err(e) => println!("Error: {}", e),
            },
            Input::New => session.new_conversation().await?,
            Input::History => {
                listing = session.list_conversations().await?;
                for (i, conversation) in listing.iter().enumerate() {
                    println!(
                        "{:>3}. {}  ({})",
                        i + 1,
                        conversation.title,
                        conversation.last_updated.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Input::Load(arg) => {
                let id = resolve_conversation(&arg, &listing);
                session.load_conversation(id).await?;
            }
            Input::Delete(arg) => {
                let id = resolve_conversation(&arg, &listing);
                session.delete_conversation(id).await?;
            }
            Input::Cancel => session.cancel().await?,
            Input::Status => {
                let snapshot = session.snapshot().await?;
                println!("state: {}", snapshot.state);
                println!("model: {}", snapshot.model.as_deref().unwrap_or("none"));
                if let Some(pending) = snapshot.pending_model {
                    println!("pending: {}", pending);
                }
                if let Some(conversation) = snapshot.conversation {
                    println!(
                        "conversation: {} ({} messages)",
                        conversation.title,
                        snapshot.transcript.len()
                    );
                }
                if let Some(error) = snapshot.error {
                    println!("last error: {}", error);
                }
            }
            Input::Help => println!("{}", HELP),
            Input::Quit => break,
            Input::Unknown(command) => println!("Unknown command: {} (try /help)", command),
        }
    }

    Ok(())
}
