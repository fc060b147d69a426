use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use shoprag_core::chunker::Chunker;
use shoprag_core::config::Settings;
use shoprag_core::error::{Error, Result};
use shoprag_core::traits::{ChunkStore, Embedder, IndexEntry, Scope, TextIndexer, VectorIndexer};
use shoprag_core::types::{Candidate, Chunk, ChunkId, Document, DocumentId, MachineFilter, MachineTag, SearchHit};
use shoprag_text::LexicalIndex;
use shoprag_vector::VectorIndex;

use crate::catalog::Catalog;
use crate::fusion::{FusedHit, FusionRanker};
use crate::locks::KeyedLocks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub text: String,
    pub machine: MachineFilter,
    /// Overrides `fusion.k_final` for this query.
    pub top_k: Option<usize>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), machine: MachineFilter::All, top_k: None }
    }

    pub fn for_machine(mut self, machine: Option<MachineTag>) -> Self {
        self.machine = machine.into();
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Hybrid,
    /// Only BM25 contributed: the query could not be embedded, or the vector
    /// sub-query failed or timed out.
    LexicalOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub candidates: Vec<Candidate>,
    pub mode: RetrievalMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub manuals: usize,
    pub notes: usize,
    pub chunks: usize,
    pub vector_entries: usize,
    pub lexical_entries: usize,
}

/// Hybrid retrieval over manuals and notes.
///
/// Both indices may hold entries that are not yet (or no longer) published;
/// the catalog decides visibility, so queries only ever see complete documents.
pub struct RetrievalService<TI = LexicalIndex, VI = VectorIndex> {
    pub(crate) settings: Settings,
    pub(crate) chunker: Chunker,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) text: Arc<TI>,
    pub(crate) vector: Arc<VI>,
    pub(crate) catalog: RwLock<Arc<Catalog>>,
    pub(crate) store: Option<Arc<dyn ChunkStore>>,
    pub(crate) ranker: FusionRanker,
    pub(crate) next_id: AtomicU64,
    pub(crate) doc_locks: KeyedLocks<DocumentId>,
}

impl RetrievalService {
    /// In-memory service without persistence.
    pub async fn new(settings: Settings, embedder: Arc<dyn Embedder>) -> Result<Self> {
        check_setup(&settings, embedder.as_ref())?;
        let vector = VectorIndex::in_memory(embedder.dim()).await?;
        Self::with_indices(settings, embedder, LexicalIndex::new()?, vector, None)
    }

    /// Builds a service backed by `store` and restores every stored document
    /// into fresh indices without re-embedding.
    pub async fn open(settings: Settings, embedder: Arc<dyn Embedder>, store: Arc<dyn ChunkStore>) -> Result<Self> {
        check_setup(&settings, embedder.as_ref())?;
        let vector = VectorIndex::in_memory(embedder.dim()).await?;
        let service = Self::with_indices(settings, embedder, LexicalIndex::new()?, vector, Some(store))?;
        service.restore().await?;
        Ok(service)
    }
}

fn check_setup(settings: &Settings, embedder: &dyn Embedder) -> Result<()> {
    settings.validate()?;
    if embedder.dim() == 0 {
        return Err(Error::InvalidConfig("embedder reports dimension 0".into()));
    }
    Ok(())
}

impl<TI, VI> RetrievalService<TI, VI>
where
    TI: TextIndexer + 'static,
    VI: VectorIndexer + 'static,
{
    pub fn with_indices(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        text: TI,
        vector: VI,
        store: Option<Arc<dyn ChunkStore>>,
    ) -> Result<Self> {
        check_setup(&settings, embedder.as_ref())?;
        Ok(Self {
            chunker: Chunker::new(settings.chunking.clone())?,
            ranker: FusionRanker::new(settings.fusion.clone()),
            settings,
            embedder,
            text: Arc::new(text),
            vector: Arc::new(vector),
            catalog: RwLock::new(Arc::new(Catalog::default())),
            store,
            next_id: AtomicU64::new(1),
            doc_locks: KeyedLocks::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Loads all stored documents into the indices and publishes them.
    /// Returns the number of documents restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else { return Ok(0) };
        let stored = store.load_all().await.map_err(|e| Error::Store(e.to_string()))?;
        let dim = self.embedder.dim();
        let mut restored = 0usize;
        for doc in stored {
            if let Some(bad) = doc.chunks.iter().find(|c| c.vector.len() != dim) {
                return Err(Error::Store(format!(
                    "stored chunk {} has dimension {}, embedder produces {dim}",
                    bad.chunk.id,
                    bad.vector.len()
                )));
            }
            let entries: Vec<IndexEntry<'_>> = doc
                .chunks
                .iter()
                .map(|row| IndexEntry {
                    id: row.chunk.id,
                    text: &row.chunk.text,
                    vector: &row.vector,
                    machine: row.chunk.machine.as_ref(),
                })
                .collect();
            self.insert_entries(&entries).await?;
            let inserted: HashSet<ChunkId> = entries.iter().map(|e| e.id).collect();
            drop(entries);
            if let Some(max) = inserted.iter().copied().max() {
                self.next_id.fetch_max(max + 1, Ordering::SeqCst);
            }
            let chunks = doc.chunks.into_iter().map(|row| row.chunk).collect();
            let mut replaced = self.publish(doc.document, chunks)?;
            // restoring over a live document re-inserts the same ids
            replaced.retain(|id| !inserted.contains(id));
            self.rollback(&replaced).await;
            restored += 1;
        }
        info!(documents = restored, "restored corpus from store");
        Ok(restored)
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<Catalog>> {
        self.catalog
            .read()
            .map(|c| Arc::clone(&c))
            .map_err(|_| Error::IndexCorruption("catalog lock poisoned".into()))
    }

    /// Single write that makes a document visible. Returns replaced chunk ids.
    pub(crate) fn publish(&self, document: Document, chunks: Vec<Chunk>) -> Result<Vec<ChunkId>> {
        let mut guard = self
            .catalog
            .write()
            .map_err(|_| Error::IndexCorruption("catalog lock poisoned".into()))?;
        Ok(Arc::make_mut(&mut guard).publish(document, chunks))
    }

    pub(crate) fn unpublish(&self, id: &DocumentId) -> Result<Option<Vec<ChunkId>>> {
        let mut guard = self
            .catalog
            .write()
            .map_err(|_| Error::IndexCorruption("catalog lock poisoned".into()))?;
        if guard.document(id).is_none() {
            return Ok(None);
        }
        Ok(Arc::make_mut(&mut guard).unpublish(id))
    }

    /// Inserts entries into both indices. On failure neither side keeps them.
    pub(crate) async fn insert_entries(&self, entries: &[IndexEntry<'_>]) -> Result<()> {
        self.vector.insert(entries).await?;
        if let Err(e) = self.text.insert(entries) {
            let ids: Vec<ChunkId> = entries.iter().map(|e| e.id).collect();
            if let Err(undo) = self.vector.remove(&ids).await {
                warn!(error = %undo, chunks = ids.len(), "vector entries left behind after a failed insert");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drops index entries from both sides. Entries that fail to go stay
    /// unpublished, so queries never see them.
    pub(crate) async fn rollback(&self, ids: &[ChunkId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.vector.remove(ids).await {
            warn!(error = %e, chunks = ids.len(), "vector entries not removed");
        }
        if let Err(e) = self.text.remove(ids) {
            warn!(error = %e, chunks = ids.len(), "lexical entries not removed");
        }
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryOutcome> {
        let k = request.top_k.unwrap_or(self.settings.fusion.k_final);
        let (query_vector, mode) = match self.embed_query(&request.text).await {
            Ok(v) => (Some(v), RetrievalMode::Hybrid),
            Err(e) if self.settings.retrieval.lexical_fallback => {
                warn!(error = %e, "query embedding failed; serving lexical-only results");
                (None, RetrievalMode::LexicalOnly)
            }
            Err(e) => return Err(e),
        };
        if k == 0 {
            return Ok(QueryOutcome { candidates: Vec::new(), mode });
        }

        let snapshot = self.snapshot()?;
        let k_retrieve = self.settings.fusion.k_retrieve.max(k);

        let visible = |id: ChunkId| snapshot.is_visible(id);
        let scope = Scope::new(&request.machine, &visible);
        let vector_side = async {
            match &query_vector {
                Some(q) => self.run_side("vector", self.vector.search_vec(q, k_retrieve, &scope)).await,
                None => Ok(None),
            }
        };
        let lexical_job = {
            let index = Arc::clone(&self.text);
            let catalog = Arc::clone(&snapshot);
            let filter = request.machine.clone();
            let text = request.text.clone();
            move || {
                let visible = |id: ChunkId| catalog.is_visible(id);
                index.search(&text, k_retrieve, &Scope::new(&filter, &visible))
            }
        };
        let lexical_side = self.run_side("lexical", async move {
            tokio::task::spawn_blocking(lexical_job)
                .await
                .map_err(|e| Error::Index(format!("lexical task failed: {e}")))?
        });
        let (vector_hits, lexical_hits) = tokio::join!(vector_side, lexical_side);
        let (vector_hits, lexical_hits) = (vector_hits?, lexical_hits?.unwrap_or_default());
        let mode = if vector_hits.is_some() { RetrievalMode::Hybrid } else { RetrievalMode::LexicalOnly };
        let vector_hits = vector_hits.unwrap_or_default();

        let fused = self.ranker.fuse(&vector_hits, &lexical_hits, k);
        let candidates = self.candidates(fused, &snapshot, &request.machine)?;
        debug!(
            query = %request.text,
            filter = %request.machine,
            vector = vector_hits.len(),
            lexical = lexical_hits.len(),
            returned = candidates.len(),
            ?mode,
            "query served"
        );
        Ok(QueryOutcome { candidates, mode })
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let texts = vec![text.to_string()];
        let mut vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
            .await
            .map_err(|e| Error::EmbeddingUnavailable(format!("embedding task failed: {e}")))?
            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;
        let vector = vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingUnavailable("embedder returned no vector".into()))?;
        if vector.len() != self.embedder.dim() {
            return Err(Error::EmbeddingUnavailable(format!(
                "query vector has dimension {}, expected {}",
                vector.len(),
                self.embedder.dim()
            )));
        }
        Ok(vector)
    }

    /// Awaits one sub-query under the configured timeout. Failure or timeout
    /// give `None` and fusion ranks without that side; corruption propagates.
    async fn run_side<F>(&self, side: &'static str, search: F) -> Result<Option<Vec<SearchHit>>>
    where
        F: Future<Output = Result<Vec<SearchHit>>>,
    {
        let timeout_ms = self.settings.fusion.query_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), search).await {
            Ok(Ok(hits)) => Ok(Some(hits)),
            Ok(Err(e @ Error::IndexCorruption(_))) => {
                error!(side, error = %e, "index corruption during query");
                Err(e)
            }
            Ok(Err(e)) => {
                warn!(side, error = %e, "sub-query failed; ranking without it");
                Ok(None)
            }
            Err(_) => {
                warn!(side, timeout_ms, "sub-query timed out; ranking without it");
                Ok(None)
            }
        }
    }

    fn candidates(&self, fused: Vec<FusedHit>, snapshot: &Catalog, filter: &MachineFilter) -> Result<Vec<Candidate>> {
        let mut out = Vec::with_capacity(fused.len());
        for (i, hit) in fused.into_iter().enumerate() {
            let chunk = snapshot
                .chunk(hit.id)
                .ok_or_else(|| Error::IndexCorruption(format!("chunk {} ranked but not published", hit.id)))?;
            if !filter.admits(chunk.machine.as_ref()) {
                let tag = chunk.machine.as_ref().map_or("", MachineTag::as_str);
                error!(chunk = hit.id, machine = tag, %filter, "cross-machine chunk survived filtering");
                return Err(Error::IndexCorruption(format!(
                    "chunk {} tagged '{tag}' returned for filter '{filter}'",
                    hit.id
                )));
            }
            let document = snapshot.document(&chunk.document_id).ok_or_else(|| {
                Error::IndexCorruption(format!("chunk {} belongs to unknown document {}", hit.id, chunk.document_id))
            })?;
            out.push(Candidate {
                chunk_id: hit.id,
                document_id: chunk.document_id.clone(),
                text: chunk.text.clone(),
                machine: chunk.machine.clone(),
                vector_score: hit.vector_score,
                lexical_score: hit.lexical_score,
                fused_score: hit.fused_score,
                rank: i + 1,
                provenance: chunk.provenance(document),
            });
        }
        Ok(out)
    }

    /// Distinct machine tags across published documents.
    pub fn machines(&self) -> Result<Vec<MachineTag>> {
        Ok(self.snapshot()?.machines())
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let catalog = self.snapshot()?.stats();
        Ok(ServiceStats {
            manuals: catalog.manuals,
            notes: catalog.notes,
            chunks: catalog.chunks,
            vector_entries: self.vector.len().await?,
            lexical_entries: self.text.len(),
        })
    }
}
