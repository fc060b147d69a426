//! Layered configuration.
//!
//! Figment merges built-in defaults, `shoprag.toml`, `shoprag.<env>.toml`
//! (`RUST_ENV`, default `dev`) and `SHOPRAG_*` environment variables, with
//! `__` separating nested keys (`SHOPRAG_FUSION__K_FINAL=3`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Token-window chunking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    /// Prefer ending a chunk at a sentence boundary in the last 20% of the window.
    pub sentence_aware: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { target_tokens: 800, overlap_tokens: 100, sentence_aware: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub vector_weight: f32,
    pub lexical_weight: f32,
    /// Candidates fetched from each index before fusion.
    pub k_retrieve: usize,
    /// Candidates returned when the caller does not ask for a specific count.
    pub k_final: usize,
    /// Return nothing when the best fused score falls below this. 0 disables the gate.
    pub min_confidence: f32,
    /// Per-index sub-query timeout.
    pub query_timeout_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.6,
            lexical_weight: 0.4,
            k_retrieve: 20,
            k_final: 5,
            min_confidence: 0.0,
            query_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Serve lexical-only results when the query embedding cannot be computed.
    pub lexical_fallback: bool,
    pub embed_batch_size: usize,
    /// Upper bound on the grounding context handed to the answer generator.
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { lexical_fallback: true, embed_batch_size: 32, max_context_chars: 6_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Hashing,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    /// Dimension of the hashing embedder. The model embedder reports its own.
    pub dim: usize,
    pub model_dir: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { provider: EmbeddingProviderKind::Hashing, dim: 384, model_dir: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// LanceDB directory; `None` keeps everything in memory.
    pub lancedb_dir: Option<String>,
}

impl StorageConfig {
    /// Relative directories resolve against `base` (usually the config directory).
    pub fn lancedb_path(&self, base: &Path) -> Option<PathBuf> {
        self.lancedb_dir.as_deref().map(|dir| resolve_with_base(base, dir))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingConfig,
    pub fusion: FusionConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub storage: StorageConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.target_tokens == 0 {
            return Err(Error::InvalidConfig("chunking.target_tokens must be > 0".into()));
        }
        if c.overlap_tokens >= c.target_tokens {
            return Err(Error::InvalidConfig(format!(
                "chunking.overlap_tokens ({}) must be smaller than target_tokens ({})",
                c.overlap_tokens, c.target_tokens
            )));
        }
        let f = &self.fusion;
        if !(f.vector_weight >= 0.0 && f.lexical_weight >= 0.0) {
            return Err(Error::InvalidConfig("fusion weights must be non-negative".into()));
        }
        if f.vector_weight + f.lexical_weight <= 0.0 {
            return Err(Error::InvalidConfig("fusion weights must not both be zero".into()));
        }
        if f.k_retrieve == 0 || f.k_final == 0 {
            return Err(Error::InvalidConfig("fusion.k_retrieve and fusion.k_final must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&f.min_confidence) {
            return Err(Error::InvalidConfig("fusion.min_confidence must be within [0, 1]".into()));
        }
        if self.retrieval.max_context_chars == 0 {
            return Err(Error::InvalidConfig("retrieval.max_context_chars must be > 0".into()));
        }
        if self.retrieval.embed_batch_size == 0 {
            return Err(Error::InvalidConfig("retrieval.embed_batch_size must be > 0".into()));
        }
        if self.embedding.dim == 0 {
            return Err(Error::InvalidConfig("embedding.dim must be > 0".into()));
        }
        Ok(())
    }
}

pub struct Config {
    figment: Figment,
}

impl Config {
    /// Loads `shoprag.toml` and `shoprag.<env>.toml` from the working directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    pub fn load_from(base: &Path) -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(base.join("shoprag.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(base.join("shoprag.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(base.join("shoprag.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(base.join("shoprag.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("SHOPRAG_").split("__"));

        let config = Self { figment };
        config.settings()?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{key}': {e}")))
    }

    /// Extracts and validates the full settings tree.
    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
