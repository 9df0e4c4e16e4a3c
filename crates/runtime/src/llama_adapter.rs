use crate::process_manager::ProcessManager;
use crate::template_engine::{PromptTemplate, TemplateEngine};
use crate::{FragmentStream, InferenceEngine};
use async_trait::async_trait;
use futures::StreamExt;
use kairos_common::{ChatMessage, Error, GenerationParams, Result};
use kairos_config::RuntimeConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: String,
    n_predict: usize,
    temperature: f32,
    top_p: f32,
    top_k: i32,
    repeat_penalty: f32,
    stop: &'a [String],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

/// Inference engine backed by a llama.cpp `llama-server` process
pub struct LlamaServerEngine {
    config: RuntimeConfig,
    template: PromptTemplate,
    client: Client,
    server_url: String,
    // None when talking to a server started elsewhere
    process: Option<ProcessManager>,
    model_path: Option<PathBuf>,
}

impl LlamaServerEngine {
    /// Engine that launches its own server on `config.port`
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let server_url = format!("http://127.0.0.1:{}", config.port);
        Ok(Self {
            client: Self::build_client()?,
            server_url,
            process: Some(ProcessManager::new("llama-server")),
            template: PromptTemplate::default(),
            model_path: None,
            config,
        })
    }

    /// Engine for an already running server
    pub fn attach(server_url: impl Into<String>, config: RuntimeConfig) -> Result<Self> {
        Ok(Self {
            client: Self::build_client()?,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            process: None,
            template: PromptTemplate::default(),
            model_path: None,
            config,
        })
    }

    fn build_client() -> Result<Client> {
        // No overall timeout: a generation runs until stop or cancel
        Ok(Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?)
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    fn server_command(&self, model_path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.server_binary);
        cmd.arg("--model")
            .arg(model_path)
            .arg("--ctx-size")
            .arg(self.config.context_size.to_string())
            .arg("--n-gpu-layers")
            .arg(self.config.gpu_layers.to_string())
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--threads")
            .arg(self.config.threads.to_string());
        cmd
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/health", self.server_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn wait_until_healthy(&mut self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);

        loop {
            if self.is_healthy().await {
                return Ok(());
            }

            if let Some(process) = self.process.as_mut() {
                if !process.is_running() {
                    let detail = process.stderr_tail().join("\n");
                    return Err(Error::ModelLoadFailed(format!(
                        "llama-server exited during startup: {}",
                        detail
                    )));
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::ModelLoadFailed(format!(
                    "Server at {} not healthy after {}s",
                    self.server_url, self.config.startup_timeout_secs
                )));
            }

            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl InferenceEngine for LlamaServerEngine {
    async fn initialize(&mut self, model_path: &Path) -> Result<()> {
        if !model_path.is_file() {
            return Err(Error::ModelLoadFailed(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }

        self.model_path = None;
        info!(model = %model_path.display(), "Loading model");
        let started = Instant::now();

        if self.process.is_some() {
            let cmd = self.server_command(model_path);
            if let Some(process) = self.process.as_mut() {
                process.spawn(cmd).await?;
            }
        }

        if let Err(e) = self.wait_until_healthy().await {
            if let Some(process) = self.process.as_mut() {
                let _ = process.terminate().await;
            }
            return Err(e);
        }

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Model loaded");
        self.model_path = Some(model_path.to_path_buf());
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.model_path.is_some()
    }

    async fn generate(
        &self,
        history: &[ChatMessage],
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        if !self.is_initialized() {
            return Err(Error::RuntimeNotReady);
        }

        let prompt = TemplateEngine::format_prompt(history, &self.config.system_prompt, &self.template);
        let request = CompletionRequest {
            prompt,
            n_predict: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            repeat_penalty: params.repeat_penalty,
            stop: &params.stop_sequences,
            stream: true,
        };

        let url = format!("{}/completion", self.server_url);
        debug!(messages = history.len(), "Sending completion request");

        let send = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("generation cancelled before start".into()));
            }
            response = send => response
                .map_err(|e| Error::RuntimeError(format!("Request failed: {}", e)))?,
        };

        if !response.status().is_success() {
            return Err(Error::RuntimeError(format!(
                "Server error: {}",
                response.status()
            )));
        }

        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut fragments = 0usize;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(fragments, "Generation cancelled");
                        return;
                    }
                    chunk = bytes_stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!("Stream read error: {}", e);
                        yield Err(Error::RuntimeError(format!("Stream error: {}", e)));
                        return;
                    }
                    None => break,
                };

                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
                    let event_bytes: Vec<u8> = buffer.drain(..pos + 2).collect();
                    let event = String::from_utf8_lossy(&event_bytes);

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let chunk: CompletionChunk = match serde_json::from_str(data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                debug!("Skipping malformed event: {}", e);
                                continue;
                            }
                        };

                        if !chunk.content.is_empty()
                            && !TemplateEngine::is_echoed_role_marker(&chunk.content)
                        {
                            fragments += 1;
                            yield Ok(chunk.content);
                        }

                        if chunk.stop {
                            debug!(fragments, "Generation complete");
                            return;
                        }
                    }
                }
            }

            debug!(fragments, "Server closed the stream");
        };

        Ok(Box::pin(stream))
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(process) = self.process.as_mut() {
            process.terminate().await?;
        }
        self.model_path = None;
        Ok(())
    }
}
