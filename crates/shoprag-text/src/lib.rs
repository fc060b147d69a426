//! shoprag-text
//!
//! Lexical side of retrieval: a tantivy token pipeline (see `analyzer`)
//! registered on an in-RAM tantivy index that ranks chunks with BM25 (see
//! `lexical`).
pub mod analyzer;
pub mod lexical;

pub use analyzer::Analyzer;
pub use lexical::LexicalIndex;
