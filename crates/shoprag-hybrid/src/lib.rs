//! Hybrid retrieval: ingestion into a vector and a lexical index, fused and
//! machine-scoped querying, and grounding context for the answer generator.

pub mod catalog;
pub mod fusion;
pub mod grounding;
pub mod ingest;
mod locks;
pub mod service;

pub use catalog::{Catalog, CatalogStats};
pub use fusion::{FusedHit, FusionRanker};
pub use grounding::{AnswerGenerator, Answer, ContextBuilder, GroundingContext, SourceRef, NO_RELEVANT_INFORMATION};
pub use ingest::{DocumentRequest, NoteRequest};
pub use service::{QueryOutcome, QueryRequest, RetrievalMode, RetrievalService, ServiceStats};
