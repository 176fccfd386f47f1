//! # Stage: Configuration
//!
//! ## Responsibility
//! Load [`RelayConfig`] from an optional TOML file, layer CLI overrides on
//! top, and validate the result before anything binds a socket.
//!
//! ## Guarantees
//! - Every section and field has a default; an empty file is a valid config
//! - `validate()` rejects configurations the relay cannot serve with
//! - The API token is read from the environment, never from the file
//!
//! ## NOT Responsible For
//! - Hot reload (restart the process)
//! - Secrets management beyond reading one environment variable

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::{Args, StoreKind};
use crate::error::ConfigError;
use crate::persona::{ModelFamily, Persona, PersonaSet};
use crate::relay::{GenerationParams, MODEL_PLACEHOLDER};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub generation: GenerationConfig,
    pub queue: QueueConfig,
    pub models: ModelsConfig,
    pub personas: BTreeMap<String, PersonaConfig>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long in-flight connections may run after shutdown is requested.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            shutdown_grace_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Chat-completion URL; `{model}` is replaced per attempt.
    pub chat_url: String,
    pub image_url: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            chat_url: "https://api-inference.huggingface.co/models/{model}/v1/chat/completions"
                .to_string(),
            image_url:
                "https://api-inference.huggingface.co/models/black-forest-labs/FLUX.1-schnell"
                    .to_string(),
            token_env: "HF_TOKEN".to_string(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 60,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let params = GenerationParams::default();
        Self {
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub general: Vec<String>,
    pub coder: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            general: [
                "Qwen/Qwen2.5-7B-Instruct",
                "Qwen/Qwen2.5-1.5B-Instruct",
                "meta-llama/Llama-3.2-3B-Instruct",
                "mistralai/Mistral-7B-Instruct-v0.3",
                "google/gemma-2-2b-it",
            ]
            .map(String::from)
            .to_vec(),
            coder: [
                "deepseek-ai/deepseek-coder-6.7b-instruct",
                "Qwen/Qwen2.5-Coder-7B-Instruct",
                "Qwen/Qwen2.5-Coder-1.5B-Instruct",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub prompt: String,
    #[serde(default)]
    pub models: ModelFamily,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StoreKind,
    pub directory: PathBuf,
    pub redis_url: Option<String>,
    /// Key prefix for the Redis backend.
    pub redis_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreKind::File,
            directory: PathBuf::from("conversations"),
            redis_url: None,
            redis_prefix: "transcripts".to_string(),
        }
    }
}

fn default_personas() -> BTreeMap<String, PersonaConfig> {
    let general = |prompt: &str| PersonaConfig {
        prompt: prompt.to_string(),
        models: ModelFamily::General,
    };
    let mut personas = BTreeMap::new();
    personas.insert(
        "vibe".to_string(),
        general("You are an expert full-stack developer and friendly assistant. Be professional, direct, and kind."),
    );
    personas.insert(
        "ui".to_string(),
        general("You are a world-class UI/UX and CSS expert. Focus on modern aesthetics, animations, and beautiful responsive layouts."),
    );
    personas.insert(
        "security".to_string(),
        general("You are a cyber-security teacher and researcher. Explain vulnerabilities and defenses clearly and focus on protecting systems."),
    );
    personas.insert(
        "logic".to_string(),
        general("You are a backend architect specializing in algorithms and data structures. Reason step by step and favour correct, efficient solutions."),
    );
    personas.insert(
        "creative".to_string(),
        general("You are a creative storyteller and game designer. Offer vivid, original ideas and help shape them into something playable."),
    );
    personas.insert(
        "data".to_string(),
        general("You are a data scientist and analyst. Explain statistics plainly and write clean analysis code."),
    );
    personas.insert(
        "deepseek".to_string(),
        PersonaConfig {
            prompt: "You are DeepSeek-Coder, an expert in all programming languages and software engineering. Provide clean, efficient, and well-documented code.".to_string(),
            models: ModelFamily::Coder,
        },
    );
    personas
}

impl RelayConfig {
    /// Built-in defaults, including the stock persona table.
    pub fn defaults() -> Self {
        Self {
            personas: default_personas(),
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut config: RelayConfig = toml::from_str(text)?;
        if config.personas.is_empty() {
            config.personas = default_personas();
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Config file if given, defaults otherwise, then CLI overrides, then
    /// validation.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::defaults(),
        };
        config.apply_overrides(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(n) = args.max_concurrent {
            self.queue.max_concurrent = n;
        }
        if let Some(store) = args.store {
            self.storage.backend = store;
        }
        if let Some(dir) = &args.storage_dir {
            self.storage.directory = dir.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid("queue.max_concurrent must be at least 1".into()));
        }
        if !self.upstream.chat_url.contains(MODEL_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "upstream.chat_url must contain {}",
                MODEL_PLACEHOLDER
            )));
        }
        if self.upstream.idle_timeout_secs == 0 || self.upstream.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("upstream timeouts must be non-zero".into()));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::Invalid("generation.temperature must be within 0.0..=2.0".into()));
        }
        if self.storage.backend == StoreKind::Redis {
            if !cfg!(feature = "redis-backing") {
                return Err(ConfigError::Invalid(
                    "storage.backend = \"redis\" needs the redis-backing feature".into(),
                ));
            }
            if self.storage.redis_url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Invalid("storage.redis_url is required for the redis backend".into()));
            }
        }
        // Surfaces missing `vibe` and empty model lists.
        self.personas().map(|_| ())
    }

    pub fn personas(&self) -> Result<PersonaSet, ConfigError> {
        let personas = self
            .personas
            .iter()
            .map(|(name, p)| Persona {
                name: name.clone(),
                system_prompt: p.prompt.clone(),
                family: p.models,
            })
            .collect();
        PersonaSet::new(personas, self.models.general.clone(), self.models.coder.clone())
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
        }
    }

    /// Bearer token from the configured environment variable, if set.
    pub fn api_token(&self) -> Option<String> {
        std::env::var(&self.upstream.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
