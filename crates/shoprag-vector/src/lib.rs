//! Dense side of retrieval: a LanceDB vector index queried with cosine
//! `vector_search`, and a LanceDB store that persists documents, chunks and
//! their vectors.
pub mod index;
pub mod schema;
pub mod store;
pub mod table;

pub use index::VectorIndex;
pub use store::LanceChunkStore;
