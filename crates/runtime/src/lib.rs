mod llama_adapter;
mod process_manager;
pub mod stream_filter;
pub mod template_engine;

#[cfg(test)]
mod tests;

pub use llama_adapter::LlamaServerEngine;
pub use process_manager::ProcessManager;
pub use stream_filter::{FilterSession, FilterStep, StreamFilter};
pub use template_engine::{PromptTemplate, TemplateEngine};

use async_trait::async_trait;
use futures::Stream;
use kairos_common::{ChatMessage, GenerationParams, Result};
use std::path::Path;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Lazy sequence of generated text fragments
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Trait for inference engine implementations
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load the model file; must succeed before `generate`
    async fn initialize(&mut self, model_path: &Path) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Stream a completion for the ordered history.
    ///
    /// Returns `Error::RuntimeNotReady` before a successful `initialize`.
    /// The stream ends early once `cancel` fires.
    async fn generate(
        &self,
        history: &[ChatMessage],
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;

    /// Release the model and any backing process
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
