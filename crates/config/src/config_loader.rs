use kairos_common::{Error, GenerationParams, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub filter: FilterConfig,
    pub download: DownloadConfig,
    pub runtime: RuntimeConfig,
    pub generation: GenerationParams,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Downloaded model artifacts, one file per descriptor name
    pub models_dir: PathBuf,
    /// Conversation history, one JSON file per conversation
    pub conversations_dir: PathBuf,
}

/// Stream filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub stop_markers: Vec<String>,
    /// Trailing window in characters; derived from the markers when absent
    pub window: Option<usize>,
}

/// Model download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Whole-transfer timeout; multi-gigabyte artifacts need hours
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub buffer_bytes: usize,
}

/// llama.cpp server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub server_binary: PathBuf,
    pub port: u16,
    pub context_size: usize,
    pub threads: usize,
    /// 0 keeps inference on the CPU
    pub gpu_layers: i32,
    pub startup_timeout_secs: u64,
    pub system_prompt: String,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kairos")
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = data_dir();
        Self {
            models_dir: root.join("models"),
            conversations_dir: root.join("conversations"),
        }
    }
}

impl PathsConfig {
    /// Re-root both directories under `root`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            models_dir: root.join("models"),
            conversations_dir: root.join("conversations"),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            stop_markers: vec![
                "\n\nUser:".to_string(),
                "\nUser:".to_string(),
                "User:".to_string(),
                "### User:".to_string(),
                "<|user|>".to_string(),
                "<|endoftext|>".to_string(),
                "</s>".to_string(),
                "<|eot_id|>".to_string(),
                "<|im_end|>".to_string(),
            ],
            window: None,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 2 * 60 * 60,
            connect_timeout_secs: 30,
            buffer_bytes: 1024 * 1024,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_binary: PathBuf::from("llama-server"),
            port: 8080,
            context_size: 4096,
            threads: 4,
            gpu_layers: 0,
            startup_timeout_secs: 60,
            system_prompt: "You are KAIROS, a helpful and knowledgeable AI assistant. \
                Provide clear, accurate, and concise responses."
                .to_string(),
        }
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<AppConfig> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::ConfigError(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            return Self::read(path);
        }

        // Check default locations
        let default_paths = vec![
            PathBuf::from("kairos.json"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("kairos/config.json"),
        ];

        for path in default_paths {
            if path.exists() {
                return Self::read(&path);
            }
        }

        debug!("No config file found, using defaults");
        Ok(AppConfig::default())
    }

    fn read(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(config: &AppConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
