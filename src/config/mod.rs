//! Configuration management for chronicler
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Environment variable that flips the embedding backend to the remote API
pub const USE_OPENAI_ENV: &str = "CHRONICLER_USE_OPENAI";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Embedding backend configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Persona chat configuration
    #[serde(default)]
    pub chat: ChatConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Use the remote OpenAI embeddings API instead of the local model
    #[serde(default = "default_use_openai")]
    pub use_openai: bool,

    /// Local model name/identifier
    #[serde(default = "default_local_model")]
    pub local_model: String,

    /// Remote model name
    #[serde(default = "default_openai_embedding_model")]
    pub openai_model: String,

    /// Environment variable holding the OpenAI API key
    #[serde(default = "default_openai_api_key_env")]
    pub openai_api_key_env: String,

    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    /// Explicit dimension for models missing from the known-model table
    #[serde(default)]
    pub dimension: Option<usize>,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// HTTP timeout for the remote backend
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Retries for transient remote failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

/// Which embedding backend a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    Local,
    OpenAi,
}

impl std::fmt::Display for EmbeddingBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingBackendKind::Local => write!(f, "local"),
            EmbeddingBackendKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// Lookup the expected embedding dimension for a known model
pub fn embedding_dimension_for_model(model: &str) -> Option<usize> {
    match model {
        "sentence-transformers/all-MiniLM-L6-v2" | "all-MiniLM-L6-v2" => Some(384),
        "BAAI/bge-small-en-v1.5" => Some(384),
        "BAAI/bge-base-en-v1.5" => Some(768),
        "BAAI/bge-large-en-v1.5" => Some(1024),
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

impl EmbeddingConfig {
    pub fn backend(&self) -> EmbeddingBackendKind {
        if self.use_openai {
            EmbeddingBackendKind::OpenAi
        } else {
            EmbeddingBackendKind::Local
        }
    }

    /// Model identifier of the selected backend
    pub fn active_model(&self) -> &str {
        match self.backend() {
            EmbeddingBackendKind::Local => &self.local_model,
            EmbeddingBackendKind::OpenAi => &self.openai_model,
        }
    }

    /// Resolve the effective embedding dimension for the selected model
    pub fn resolved_dimension(&self) -> Result<usize> {
        let model = self.active_model();
        match (embedding_dimension_for_model(model), self.dimension) {
            (Some(expected), Some(configured)) if expected != configured => {
                warn!(
                    "Embedding dimension {} does not match model '{}' ({}); using {}",
                    configured, model, expected, expected
                );
                Ok(expected)
            }
            (Some(expected), _) => Ok(expected),
            (None, Some(configured)) => Ok(configured),
            (None, None) => Err(Error::Config(format!(
                "Unknown embedding model '{}': set embedding.dimension explicitly",
                model
            ))),
        }
    }

    /// Read the OpenAI API key from the configured environment variable
    pub fn openai_api_key(&self) -> Option<String> {
        std::env::var(&self.openai_api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Vector index backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackendKind {
    Sqlite,
    Qdrant,
}

impl FromStr for IndexBackendKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(Error::Config(format!(
                "Unsupported index backend '{}'; expected 'sqlite' or 'qdrant'",
                value
            ))),
        }
    }
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Backend: "sqlite" (embedded) or "qdrant"
    #[serde(default = "default_index_backend")]
    pub backend: String,

    /// Collection name; when unset each embedding backend gets its own
    /// collection (`figure_contexts_local`, `figure_contexts_openai`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,

    /// Qdrant connection URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Environment variable name for Qdrant API key
    #[serde(default = "default_qdrant_api_key_env")]
    pub qdrant_api_key_env: String,
}

impl IndexConfig {
    pub fn backend_kind(&self) -> Result<IndexBackendKind> {
        self.backend.parse()
    }

    /// Get the Qdrant API key from environment
    pub fn qdrant_api_key(&self) -> Option<String> {
        std::env::var(&self.qdrant_api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Chunks fetched, embedded and upserted per page
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,

    /// Remove index entries whose chunk no longer exists (full runs only)
    #[serde(default = "default_prune_orphans")]
    pub prune_orphans: bool,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Maximum results allowed
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

/// Persona chat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Chat completion model
    #[serde(default = "default_chat_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_chat_temperature")]
    pub temperature: f32,

    /// System prompt template; `{name}` is replaced by the figure's name
    #[serde(default = "default_persona_template")]
    pub persona_template: String,

    /// Passages retrieved per turn
    #[serde(default = "default_context_top_k")]
    pub context_top_k: usize,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// HTTP timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for chronicler data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to the context store database
    pub db_file: PathBuf,

    /// Path to the embedded vector index database
    pub index_file: PathBuf,
}

impl PathsConfig {
    fn under(base: PathBuf, config_file: PathBuf) -> Self {
        Self {
            config_file,
            db_file: base.join("context.db"),
            index_file: base.join("vectors.db"),
            base_dir: base,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            use_openai: default_use_openai(),
            local_model: default_local_model(),
            openai_model: default_openai_embedding_model(),
            openai_api_key_env: default_openai_api_key_env(),
            openai_base_url: default_openai_base_url(),
            dimension: None,
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_http_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            collection_name: None,
            qdrant_url: default_qdrant_url(),
            qdrant_api_key_env: default_qdrant_api_key_env(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_ingest_batch_size(),
            prune_orphans: default_prune_orphans(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            temperature: default_chat_temperature(),
            persona_template: default_persona_template(),
            context_top_k: default_context_top_k(),
            api_key_env: default_openai_api_key_env(),
            base_url: default_openai_base_url(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Config {
    /// Get the default base directory for chronicler (~/.chronicler)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chronicler")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        let config_file = base.join("config.toml");
        self.paths = PathsConfig::under(base, config_file);
    }

    /// Default configuration rooted at a specific base directory
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        let mut config = Config::default();
        config.init_paths(Some(base_dir));
        config
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Set up paths based on config file location
        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::under(base, config_path.to_path_buf());

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// The environment-level backend switch wins over the file
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(USE_OPENAI_ENV) {
            match parse_bool_flag(&value) {
                Some(flag) => {
                    debug!("{} overrides embedding.use_openai = {}", USE_OPENAI_ENV, flag);
                    self.embedding.use_openai = flag;
                }
                None => warn!("Ignoring unparseable {}={:?}", USE_OPENAI_ENV, value),
            }
        }
    }

    /// Effective collection name for the selected embedding backend
    pub fn collection_name(&self) -> String {
        match &self.index.collection_name {
            Some(name) => name.clone(),
            None => format!("{}_{}", default_collection_prefix(), self.embedding.backend()),
        }
    }

    /// Check if chronicler is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be positive".to_string(),
            ));
        }

        if self.ingest.batch_size == 0 {
            return Err(Error::Config("ingest.batch_size must be positive".to_string()));
        }

        if self.query.default_top_k == 0 || self.query.max_top_k == 0 {
            return Err(Error::Config(
                "query.default_top_k and query.max_top_k must be positive".to_string(),
            ));
        }

        if self.query.default_top_k > self.query.max_top_k {
            return Err(Error::Config(
                "query.default_top_k must be <= query.max_top_k".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(Error::Config(
                "chat.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.chat.context_top_k == 0 {
            return Err(Error::Config(
                "chat.context_top_k must be positive".to_string(),
            ));
        }

        if self.collection_name().trim().is_empty() {
            return Err(Error::Config(
                "index.collection_name must not be empty".to_string(),
            ));
        }

        self.index.backend_kind()?;
        self.embedding.resolved_dimension()?;

        Ok(())
    }
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
