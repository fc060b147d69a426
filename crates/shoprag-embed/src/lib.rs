//! Embedding providers.
//!
//! [`HashingEmbedder`] is always available and needs no model files. The
//! `model` feature adds [`ModelEmbedder`], a candle BERT encoder.
use anyhow::Result;
use std::sync::Arc;

use shoprag_core::config::{EmbeddingConfig, EmbeddingProviderKind};
use shoprag_core::traits::Embedder;

mod hashing;
pub use hashing::HashingEmbedder;

#[cfg(feature = "model")]
pub mod device;
#[cfg(feature = "model")]
mod model;
#[cfg(feature = "model")]
pub mod pool;
#[cfg(feature = "model")]
pub mod tokenize;
#[cfg(feature = "model")]
pub use model::{resolve_model_dir, ModelEmbedder};

pub fn get_default_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider {
        EmbeddingProviderKind::Hashing => {
            tracing::info!(dim = config.dim, "using hashing embedder");
            Ok(Arc::new(HashingEmbedder::new(config.dim)))
        }
        #[cfg(feature = "model")]
        EmbeddingProviderKind::Model => {
            let dir = resolve_model_dir(config.model_dir.as_deref())?;
            Ok(Arc::new(ModelEmbedder::load(&dir)?))
        }
        #[cfg(not(feature = "model"))]
        EmbeddingProviderKind::Model => {
            anyhow::bail!("embedding.provider = \"model\" requires the `model` feature")
        }
    }
}
