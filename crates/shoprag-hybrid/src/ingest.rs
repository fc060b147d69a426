//! Ingestion: chunk, embed, index (invisible), persist, publish, retire.
//!
//! Nothing becomes visible to queries until the catalog publish step. Any
//! failure before it removes the entries this ingestion inserted, so a failed
//! document leaves the corpus exactly as it was.
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use shoprag_core::chunker::ChunkDraft;
use shoprag_core::error::{Error, Result};
use shoprag_core::traits::{IndexEntry, StoredChunk, StoredDocument, TextIndexer, VectorIndexer};
use shoprag_core::types::{Chunk, ChunkId, Document, DocumentId, MachineTag, SourceKind};

use crate::service::RetrievalService;

/// A document to ingest, usually a manual.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    /// Derived from kind, title and machine when absent.
    pub id: Option<DocumentId>,
    pub title: String,
    /// Page text; form feeds separate pages.
    pub text: String,
    pub machine: Option<MachineTag>,
    /// `Note` stores the document as a note whose id is the title.
    pub kind: SourceKind,
}

impl DocumentRequest {
    pub fn manual(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: None, title: title.into(), text: text.into(), machine: None, kind: SourceKind::Manual }
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn for_machine(mut self, machine: Option<MachineTag>) -> Self {
        self.machine = machine;
        self
    }
}

/// A worker note. Re-submitting the same `note_id` replaces the earlier text.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRequest {
    pub note_id: String,
    pub text: String,
    pub machine: Option<MachineTag>,
    /// Defaults to the ingestion time.
    pub created_at: Option<DateTime<Utc>>,
}

impl NoteRequest {
    pub fn new(note_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { note_id: note_id.into(), text: text.into(), machine: None, created_at: None }
    }

    pub fn for_machine(mut self, machine: Option<MachineTag>) -> Self {
        self.machine = machine;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

impl<TI, VI> RetrievalService<TI, VI>
where
    TI: TextIndexer + 'static,
    VI: VectorIndexer + 'static,
{
    /// Ingests a document and returns its id.
    pub async fn ingest(&self, request: DocumentRequest) -> Result<DocumentId> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(Error::ingestion("document title is empty"));
        }
        let kind = request.kind;
        let id = request.id.unwrap_or_else(|| match kind {
            SourceKind::Manual => DocumentId::for_manual(kind, title, request.machine.as_ref()),
            SourceKind::Note => DocumentId::for_note(title),
        });
        let document = Document {
            id: id.clone(),
            title: title.to_string(),
            machine: request.machine,
            kind,
            created_at: Utc::now(),
            note_id: (kind == SourceKind::Note).then(|| title.to_string()),
        };
        self.index_document(document, &request.text).await?;
        Ok(id)
    }

    /// Ingests a worker note; it is queryable as soon as this returns.
    /// Returns the number of chunks indexed.
    pub async fn ingest_note(&self, request: NoteRequest) -> Result<usize> {
        let note_id = request.note_id.trim();
        if note_id.is_empty() {
            return Err(Error::ingestion("note id is empty"));
        }
        let document = Document {
            id: DocumentId::for_note(note_id),
            title: format!("Note {note_id}"),
            machine: request.machine,
            kind: SourceKind::Note,
            created_at: request.created_at.unwrap_or_else(Utc::now),
            note_id: Some(note_id.to_string()),
        };
        self.index_document(document, &request.text).await
    }

    /// Unpublishes a document and drops its index entries and stored rows.
    /// Returns `false` if no such document was published.
    pub async fn remove_document(&self, id: &DocumentId) -> Result<bool> {
        let _guard = self.doc_locks.lock(id).await?;
        let Some(chunk_ids) = self.unpublish(id)? else { return Ok(false) };
        self.rollback(&chunk_ids).await;
        if let Some(store) = &self.store {
            store.delete_document(id).await.map_err(|e| Error::Store(e.to_string()))?;
        }
        info!(document = %id, chunks = chunk_ids.len(), "removed document");
        Ok(true)
    }

    async fn index_document(&self, document: Document, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            return Err(Error::ingestion(format!("document {} has no text", document.id)));
        }
        let _guard = self.doc_locks.lock(&document.id).await?;

        let drafts: Vec<ChunkDraft> = self.chunker.split(text).collect();
        let vectors = self.embed_drafts(&drafts).await?;

        let first = self.next_id.fetch_add(drafts.len() as u64, Ordering::SeqCst);
        let chunks: Vec<Chunk> = drafts
            .into_iter()
            .zip(first..)
            .map(|(draft, id)| Chunk {
                id,
                document_id: document.id.clone(),
                ordinal: draft.ordinal,
                text: draft.text,
                token_len: draft.token_len,
                byte_start: draft.byte_start,
                byte_end: draft.byte_end,
                overlap_bytes: draft.overlap_bytes,
                pages: draft.pages,
                section: draft.section,
                machine: document.machine.clone(),
            })
            .collect();

        let entries: Vec<IndexEntry<'_>> = chunks
            .iter()
            .zip(&vectors)
            .map(|(chunk, vector)| IndexEntry {
                id: chunk.id,
                text: &chunk.text,
                vector,
                machine: chunk.machine.as_ref(),
            })
            .collect();
        if let Err(e) = self.insert_entries(&entries).await {
            return Err(Error::ingestion(format!("indexing {} failed: {e}", document.id)));
        }
        let inserted: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
        drop(entries);

        if let Some(store) = &self.store {
            let stored = StoredDocument {
                document: document.clone(),
                chunks: chunks
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(chunk, vector)| StoredChunk { chunk, vector })
                    .collect(),
            };
            if let Err(e) = store.save_document(&stored).await {
                self.rollback(&inserted).await;
                return Err(Error::ingestion(format!("persisting {} failed: {e}", document.id)));
            }
        }

        let id = document.id.clone();
        let kind = document.kind;
        let count = chunks.len();
        let replaced = match self.publish(document, chunks) {
            Ok(replaced) => replaced,
            Err(e) => {
                self.rollback(&inserted).await;
                return Err(e);
            }
        };
        self.rollback(&replaced).await;
        info!(document = %id, kind = kind.as_str(), chunks = count, replaced = replaced.len(), "ingested");
        Ok(count)
    }

    /// Embeds chunk texts in configured batches on the blocking pool.
    async fn embed_drafts(&self, drafts: &[ChunkDraft]) -> Result<Vec<Vec<f32>>> {
        let embedder = Arc::clone(&self.embedder);
        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let batch_size = self.settings.retrieval.embed_batch_size;
        let vectors = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Vec<f32>>> {
            let mut out = Vec::with_capacity(texts.len());
            for batch in texts.chunks(batch_size) {
                let vectors = embedder.embed_batch(batch)?;
                anyhow::ensure!(
                    vectors.len() == batch.len(),
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
                out.extend(vectors);
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::ingestion(format!("embedding task failed: {e}")))?
        .map_err(|e| {
            warn!(error = %e, "embedding failed during ingestion");
            Error::ingestion(format!("embedding failed: {e}"))
        })?;

        let dim = self.embedder.dim();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::ingestion(format!("embedder produced dimension {}, expected {dim}", bad.len())));
        }
        Ok(vectors)
    }
}
