//! Published documents and their chunks.
//!
//! The service keeps the catalog behind `RwLock<Arc<Catalog>>`. Queries clone
//! the `Arc` and work against that snapshot; ingestion publishes through
//! `Arc::make_mut`, which copies the catalog only while a query still holds the
//! previous snapshot. A chunk is visible to queries iff the snapshot lists it.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use shoprag_core::types::{Chunk, ChunkId, Document, DocumentId, MachineTag, SourceKind};

#[derive(Debug, Clone)]
struct Published {
    document: Arc<Document>,
    chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    documents: HashMap<DocumentId, Published>,
    chunks: HashMap<ChunkId, Arc<Chunk>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub manuals: usize,
    pub notes: usize,
    pub chunks: usize,
}

impl Catalog {
    /// Makes `document` and `chunks` visible, replacing any previous version of
    /// the same document. Returns the ids of the replaced chunks.
    pub fn publish(&mut self, document: Document, chunks: Vec<Chunk>) -> Vec<ChunkId> {
        let replaced = self.unpublish(&document.id).unwrap_or_default();
        let chunk_ids = chunks.iter().map(|c| c.id).collect();
        for chunk in chunks {
            self.chunks.insert(chunk.id, Arc::new(chunk));
        }
        self.documents
            .insert(document.id.clone(), Published { document: Arc::new(document), chunk_ids });
        replaced
    }

    /// Hides a document. Returns its chunk ids, or `None` if it was not published.
    pub fn unpublish(&mut self, id: &DocumentId) -> Option<Vec<ChunkId>> {
        let published = self.documents.remove(id)?;
        for chunk_id in &published.chunk_ids {
            self.chunks.remove(chunk_id);
        }
        Some(published.chunk_ids)
    }

    pub fn is_visible(&self, id: ChunkId) -> bool {
        self.chunks.contains_key(&id)
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id).map(AsRef::as_ref)
    }

    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id).map(|p| p.document.as_ref())
    }

    pub fn chunk_ids(&self, id: &DocumentId) -> Option<&[ChunkId]> {
        self.documents.get(id).map(|p| p.chunk_ids.as_slice())
    }

    /// Distinct machine tags present in the corpus, sorted.
    pub fn machines(&self) -> Vec<MachineTag> {
        self.documents
            .values()
            .filter_map(|p| p.document.machine.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn max_chunk_id(&self) -> Option<ChunkId> {
        self.chunks.keys().copied().max()
    }

    pub fn stats(&self) -> CatalogStats {
        let notes = self.documents.values().filter(|p| p.document.kind == SourceKind::Note).count();
        CatalogStats { manuals: self.documents.len() - notes, notes, chunks: self.chunks.len() }
    }
}
