use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Chunk, ChunkId, Document, DocumentId, MachineFilter, MachineTag, SearchHit};

/// Maps text to fixed-dimension vectors. Identical input must give identical output.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

fn always_visible(_: ChunkId) -> bool {
    true
}

/// One chunk as handed to the indices.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry<'a> {
    pub id: ChunkId,
    pub text: &'a str,
    pub vector: &'a [f32],
    pub machine: Option<&'a MachineTag>,
}

/// Which index entries a query may see.
///
/// Indices push the machine filter into their own query, so it applies before
/// top-k. Publication is checked per ranked window with [`Scope::settle`].
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub filter: &'a MachineFilter,
    pub visible: &'a (dyn Fn(ChunkId) -> bool + Sync),
}

impl<'a> Scope<'a> {
    pub fn new(filter: &'a MachineFilter, visible: &'a (dyn Fn(ChunkId) -> bool + Sync)) -> Self {
        Self { filter, visible }
    }

    /// Machine scoping only; every entry counts as published.
    pub fn unrestricted(filter: &'a MachineFilter) -> Self {
        Self { filter, visible: &always_visible }
    }

    pub fn is_visible(&self, id: ChunkId) -> bool {
        (self.visible)(id)
    }

    /// Turns one ranked window of an index scan into the final top `k`.
    ///
    /// `window` is already machine-scoped, best first. Unpublished and
    /// unscorable hits are dropped; equal scores order by ascending id.
    /// Unless the scan is `exhausted`, returns `None` when the window may have
    /// cut off an eligible hit: fewer than `k` survivors, or a `k`-th survivor
    /// tied with the last hit fetched. The caller then fetches a wider window.
    pub fn settle(&self, window: Vec<SearchHit>, exhausted: bool, k: usize) -> Option<Vec<SearchHit>> {
        if k == 0 {
            return Some(Vec::new());
        }
        let floor = window.last().map(|h| h.score);
        let mut hits: Vec<SearchHit> =
            window.into_iter().filter(|h| h.score.is_finite() && self.is_visible(h.id)).collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        if !exhausted {
            let cut_short = match hits.get(k - 1) {
                None => true,
                Some(kth) => Some(kth.score) == floor,
            };
            if cut_short {
                return None;
            }
        }
        hits.truncate(k);
        Some(hits)
    }
}

/// Dense side. Writes are batched per document so each lands as one table
/// operation.
#[async_trait]
pub trait VectorIndexer: Send + Sync {
    /// Re-inserting an id replaces its entry.
    async fn insert(&self, entries: &[IndexEntry<'_>]) -> Result<()>;
    async fn remove(&self, ids: &[ChunkId]) -> Result<()>;
    async fn search_vec(&self, query: &[f32], k: usize, scope: &Scope<'_>) -> Result<Vec<SearchHit>>;
    async fn len(&self) -> Result<usize>;
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Lexical side. Each write is committed before it returns.
pub trait TextIndexer: Send + Sync {
    /// Re-inserting an id replaces its entry.
    fn insert(&self, entries: &[IndexEntry<'_>]) -> Result<()>;
    fn remove(&self, ids: &[ChunkId]) -> Result<()>;
    /// `query` is raw text; the index analyzes it the way it analyzed chunks.
    fn search(&self, query: &str, k: usize, scope: &Scope<'_>) -> Result<Vec<SearchHit>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A chunk row as persisted: the chunk plus its dense vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document: Document,
    pub chunks: Vec<StoredChunk>,
}

/// Persistence contract: documents table, chunks table with a vector column.
/// Lexical postings are derived from chunk text and rebuilt on load.
/// A save must never leave a mix of two versions of one document loadable.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Replaces any previously saved rows for the same document id.
    async fn save_document(&self, doc: &StoredDocument) -> anyhow::Result<()>;
    async fn delete_document(&self, id: &DocumentId) -> anyhow::Result<()>;
    async fn load_all(&self) -> anyhow::Result<Vec<StoredDocument>>;
}
