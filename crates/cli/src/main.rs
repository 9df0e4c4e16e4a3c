use anyhow::{Context, Result};
use clap::Parser;
use kairos_acquire::AcquisitionManager;
use kairos_common::init_tracing;
use kairos_config::{ConfigLoader, ModelCatalog, PathsConfig};
use kairos_runtime::{LlamaServerEngine, StreamFilter};
use kairos_session::{SessionDeps, SessionHandle};
use kairos_store::{ConversationStore, JsonStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod repl;

/// Local-first chat with downloadable models
#[derive(Parser, Debug)]
#[command(name = "kairos", version)]
struct Args {
    /// Configuration file (defaults to ./kairos.json, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to select on startup
    #[arg(short, long)]
    model: Option<String>,

    /// Keep models and conversations under this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Alternative model catalog (JSON)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Keep conversations in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    });

    let mut config = ConfigLoader::load(args.config.as_ref())?;
    if let Some(root) = &args.data_dir {
        config.paths = PathsConfig::rooted_at(root);
    }

    let catalog = match &args.catalog {
        Some(path) => ModelCatalog::load_from_file(path)?,
        None => ModelCatalog::load_defaults()?,
    };
    let catalog = Arc::new(catalog);

    let store: Arc<dyn ConversationStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            JsonStore::open(&config.paths.conversations_dir)
                .await
                .with_context(|| {
                    format!(
                        "opening conversations in {}",
                        config.paths.conversations_dir.display()
                    )
                })?,
        )
    };

    let acquisition = Arc::new(AcquisitionManager::with_http(
        &config.paths.models_dir,
        &config.download,
    )?);
    let filter = StreamFilter::from_config(&config.filter)?;
    let engine = LlamaServerEngine::new(config.runtime.clone())?;

    info!(models_dir = %config.paths.models_dir.display(), "Starting KAIROS");

    let (session, events, task) = kairos_session::spawn(SessionDeps {
        engine: Box::new(engine),
        store,
        acquisition: acquisition.clone(),
        catalog: catalog.clone(),
        filter,
        params: config.generation.clone(),
    });
    let renderer = tokio::spawn(repl::render_events(events));

    println!("KAIROS {}. Type /help for commands.", env!("CARGO_PKG_VERSION"));
    select_initial_model(&session, &catalog, args.model).await?;

    let outcome = repl::run(session.clone(), &catalog, &acquisition).await;

    session.shutdown().await.ok();
    task.await.ok();
    renderer.await.ok();
    outcome
}

async fn select_initial_model(
    session: &SessionHandle,
    catalog: &ModelCatalog,
    model: Option<String>,
) -> Result<()> {
    match model {
        Some(name) => session.select_model(name).await?,
        None => {
            if let Some(recommended) = catalog.recommended() {
                println!(
                    "Select a model with /model <name>; /models lists them. Recommended: {}",
                    recommended.name
                );
            }
        }
    }
    Ok(())
}
