use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use shoprag_core::config::Settings;
use shoprag_core::store::MemoryStore;
use shoprag_core::traits::{ChunkStore, Embedder, IndexEntry, Scope, VectorIndexer};
use shoprag_core::types::{ChunkId, DocumentId, MachineFilter, MachineTag, Provenance, SearchHit, SourceKind};
use shoprag_core::Error;
use shoprag_embed::HashingEmbedder;
use shoprag_hybrid::{DocumentRequest, NoteRequest, QueryRequest, RetrievalMode, RetrievalService};
use shoprag_text::LexicalIndex;
use shoprag_vector::{LanceChunkStore, VectorIndex};

const DIM: usize = 64;

const VF2_MANUAL: &str = "HAAS VF-2 OPERATOR MANUAL\nThis manual covers daily operation of the vertical machining center. \
Keep the enclosure doors closed while the machine is running and wear safety glasses at all times.\x0C\
SPINDLE WARM-UP\nRun the spindle warm-up program for twenty minutes before machining if the machine has been idle \
for more than four days. Skipping the warm-up can damage the spindle bearings.\x0C\
COOLANT\nCheck the coolant concentration weekly with a refractometer and keep it between six and nine percent.";

const SAFETY_RULES: &str = "LOCKOUT TAGOUT\nBefore any maintenance isolate the machine from power and apply your \
personal lock. Verify zero energy before touching the spindle or the robot arm.";

const UR10E_MANUAL: &str = "UR10E USER MANUAL\nThe robot arm has six joints. Recalibrate the joint encoders after \
replacing a joint motor and check the payload settings before running a program.";

fn tag(s: &str) -> MachineTag {
    MachineTag::parse(s).expect("tag")
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.chunking.target_tokens = 30;
    settings.chunking.overlap_tokens = 5;
    settings.embedding.dim = DIM;
    settings
}

fn embedder() -> Arc<dyn Embedder> {
    Arc::new(HashingEmbedder::new(DIM))
}

async fn service() -> RetrievalService {
    RetrievalService::new(settings(), embedder()).await.expect("service")
}

async fn seed<TI, VI>(service: &RetrievalService<TI, VI>) -> anyhow::Result<()>
where
    TI: shoprag_core::traits::TextIndexer + 'static,
    VI: VectorIndexer + 'static,
{
    service.ingest(DocumentRequest::manual("VF-2 Operator Manual", VF2_MANUAL).for_machine(Some(tag("haas-vf2")))).await?;
    service.ingest(DocumentRequest::manual("Shop Safety Rules", SAFETY_RULES)).await?;
    service.ingest(DocumentRequest::manual("UR10e User Manual", UR10E_MANUAL).for_machine(Some(tag("ur10e")))).await?;
    Ok(())
}

/// Hashing embedder that can be switched into failure.
struct FlakyEmbedder {
    inner: HashingEmbedder,
    failing: AtomicBool,
}

impl FlakyEmbedder {
    fn new() -> Self {
        Self { inner: HashingEmbedder::new(DIM), failing: AtomicBool::new(false) }
    }
}

impl Embedder for FlakyEmbedder {
    fn dim(&self) -> usize {
        DIM
    }

    fn max_len(&self) -> usize {
        usize::MAX
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("model offline");
        }
        self.inner.embed_batch(texts)
    }
}

/// Fails any batch containing `trigger`.
struct TriggerEmbedder {
    inner: HashingEmbedder,
    trigger: &'static str,
}

impl Embedder for TriggerEmbedder {
    fn dim(&self) -> usize {
        DIM
    }

    fn max_len(&self) -> usize {
        usize::MAX
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(self.trigger)) {
            anyhow::bail!("cannot embed chunk");
        }
        self.inner.embed_batch(texts)
    }
}

/// Vector index that ignores the query scope.
struct LeakyIndex(VectorIndex);

#[async_trait]
impl VectorIndexer for LeakyIndex {
    async fn insert(&self, entries: &[IndexEntry<'_>]) -> shoprag_core::Result<()> {
        self.0.insert(entries).await
    }

    async fn remove(&self, ids: &[ChunkId]) -> shoprag_core::Result<()> {
        self.0.remove(ids).await
    }

    async fn search_vec(&self, query: &[f32], k: usize, _scope: &Scope<'_>) -> shoprag_core::Result<Vec<SearchHit>> {
        let all = MachineFilter::All;
        self.0.search_vec(query, k, &Scope::unrestricted(&all)).await
    }

    async fn len(&self) -> shoprag_core::Result<usize> {
        self.0.len().await
    }
}

/// Vector index whose searches fail after a successful write path.
struct BrokenSearchIndex(VectorIndex);

#[async_trait]
impl VectorIndexer for BrokenSearchIndex {
    async fn insert(&self, entries: &[IndexEntry<'_>]) -> shoprag_core::Result<()> {
        self.0.insert(entries).await
    }

    async fn remove(&self, ids: &[ChunkId]) -> shoprag_core::Result<()> {
        self.0.remove(ids).await
    }

    async fn search_vec(&self, _query: &[f32], _k: usize, _scope: &Scope<'_>) -> shoprag_core::Result<Vec<SearchHit>> {
        Err(Error::Index("vector table unreadable".into()))
    }

    async fn len(&self) -> shoprag_core::Result<usize> {
        self.0.len().await
    }
}

#[tokio::test]
async fn manual_passage_carries_page_provenance() -> anyhow::Result<()> {
    let service = service().await;
    seed(&service).await?;

    let outcome = service
        .query(QueryRequest::new("how long should the spindle warm-up program run after idle").for_machine(Some(tag("haas-vf2"))))
        .await?;
    assert_eq!(outcome.mode, RetrievalMode::Hybrid);
    let top = outcome.candidates.first().expect("a candidate");
    assert_eq!(top.rank, 1);
    assert!(top.text.contains("warm-up"));
    match &top.provenance {
        Provenance::Manual { title, pages, .. } => {
            assert_eq!(title, "VF-2 Operator Manual");
            assert!(pages.first <= 2 && pages.last >= 2, "unexpected pages {pages}");
        }
        other => panic!("expected manual provenance, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn note_is_queryable_immediately_after_ingestion() -> anyhow::Result<()> {
    let service = service().await;
    seed(&service).await?;
    let at = Utc.with_ymd_and_hms(2024, 3, 2, 14, 5, 0).single().expect("timestamp");

    let chunks = service
        .ingest_note(
            NoteRequest::new("N1", "Coolant pump was noisy, replaced the pump impeller and bled the coolant lines.")
                .for_machine(Some(tag("haas-vf2")))
                .created_at(at),
        )
        .await?;
    assert_eq!(chunks, 1);

    let outcome = service
        .query(QueryRequest::new("noisy coolant pump impeller").for_machine(Some(tag("haas-vf2"))))
        .await?;
    let top = &outcome.candidates[0];
    assert_eq!(top.document_id, DocumentId::for_note("N1"));
    assert_eq!(top.provenance, Provenance::Note { note_id: "N1".into(), created_at: at });
    Ok(())
}

#[tokio::test]
async fn machine_scope_never_leaks_other_machines() -> anyhow::Result<()> {
    let service = service().await;
    seed(&service).await?;
    let question = "spindle maintenance lockout robot arm joints";

    let ur10e = service.query(QueryRequest::new(question).for_machine(Some(tag("ur10e"))).top_k(20)).await?;
    assert!(!ur10e.candidates.is_empty());
    assert!(ur10e.candidates.iter().all(|c| c.machine.as_ref().map_or(true, |m| m == &tag("ur10e"))));

    let unknown = service.query(QueryRequest::new(question).for_machine(Some(tag("bridgeport"))).top_k(20)).await?;
    assert!(!unknown.candidates.is_empty());
    assert!(unknown.candidates.iter().all(|c| c.machine.is_none()));

    let all = service.query(QueryRequest::new(question).top_k(20)).await?;
    assert!(all.candidates.iter().any(|c| c.machine == Some(tag("haas-vf2"))));
    assert!(all.candidates.iter().any(|c| c.machine == Some(tag("ur10e"))));
    Ok(())
}

#[tokio::test]
async fn embedding_outage_falls_back_to_lexical() -> anyhow::Result<()> {
    let flaky = Arc::new(FlakyEmbedder::new());
    let service = RetrievalService::new(settings(), flaky.clone()).await?;
    seed(&service).await?;
    flaky.failing.store(true, Ordering::SeqCst);

    let outcome = service.query(QueryRequest::new("coolant refractometer concentration")).await?;
    assert_eq!(outcome.mode, RetrievalMode::LexicalOnly);
    assert!(!outcome.candidates.is_empty());
    assert!(outcome.candidates.iter().all(|c| c.vector_score == 0.0));
    assert!(outcome.candidates[0].text.contains("refractometer"));
    Ok(())
}

#[tokio::test]
async fn embedding_outage_without_fallback_is_an_error() -> anyhow::Result<()> {
    let flaky = Arc::new(FlakyEmbedder::new());
    let mut strict = settings();
    strict.retrieval.lexical_fallback = false;
    let service = RetrievalService::new(strict, flaky.clone()).await?;
    seed(&service).await?;
    flaky.failing.store(true, Ordering::SeqCst);

    let result = service.query(QueryRequest::new("coolant")).await;
    assert!(matches!(result, Err(Error::EmbeddingUnavailable(_))));
    Ok(())
}

#[tokio::test]
async fn failed_ingestion_leaves_corpus_untouched() -> anyhow::Result<()> {
    let embedder = Arc::new(TriggerEmbedder { inner: HashingEmbedder::new(DIM), trigger: "BROKEN" });
    let mut small_batches = settings();
    small_batches.retrieval.embed_batch_size = 1;
    let service = RetrievalService::new(small_batches, embedder).await?;
    seed(&service).await?;
    let before = service.stats().await?;

    let text = format!("{VF2_MANUAL}\x0CAPPENDIX\nBROKEN hydraulic accumulator precharge table.");
    let result = service.ingest(DocumentRequest::manual("VF-2 Service Manual", text)).await;
    assert!(matches!(result, Err(Error::IngestionFailed { .. })));
    assert_eq!(service.stats().await?, before);

    let outcome = service.query(QueryRequest::new("hydraulic accumulator precharge").top_k(20)).await?;
    assert!(outcome.candidates.iter().all(|c| c.document_id != DocumentId::for_manual(
        SourceKind::Manual,
        "VF-2 Service Manual",
        None
    )));
    Ok(())
}

#[tokio::test]
async fn blank_input_is_rejected() {
    let service = service().await;
    let empty = service.ingest(DocumentRequest::manual("Empty", "  \n\x0C ")).await;
    assert!(matches!(empty, Err(Error::IngestionFailed { .. })));
    let untitled = service.ingest(DocumentRequest::manual(" ", "text")).await;
    assert!(matches!(untitled, Err(Error::IngestionFailed { .. })));
    let anonymous = service.ingest_note(NoteRequest::new("", "text")).await;
    assert!(matches!(anonymous, Err(Error::IngestionFailed { .. })));
}

#[tokio::test]
async fn note_kind_document_gets_note_provenance() -> anyhow::Result<()> {
    let service = service().await;
    let id = service
        .ingest(DocumentRequest::manual("N9", "Tool changer carousel jammed at pocket 12.").with_kind(SourceKind::Note))
        .await?;
    assert_eq!(id, DocumentId::for_note("N9"));
    let outcome = service.query(QueryRequest::new("tool changer jammed")).await?;
    assert_eq!(outcome.candidates[0].provenance.note_id(), Some("N9"));
    assert_eq!(service.stats().await?.notes, 1);
    Ok(())
}

#[tokio::test]
async fn reingesting_a_manual_replaces_it() -> anyhow::Result<()> {
    let service = service().await;
    let request = DocumentRequest::manual("VF-2 Operator Manual", VF2_MANUAL).for_machine(Some(tag("haas-vf2")));
    let first = service.ingest(request.clone()).await?;
    let once = service.stats().await?;
    let before = service.query(QueryRequest::new("spindle bearings")).await?;

    let second = service.ingest(request).await?;
    assert_eq!(first, second);
    let twice = service.stats().await?;
    assert_eq!(once, twice);
    assert_eq!(twice.vector_entries, twice.chunks);
    assert_eq!(twice.lexical_entries, twice.chunks);

    let after = service.query(QueryRequest::new("spindle bearings")).await?;
    let texts = |o: &shoprag_hybrid::QueryOutcome| o.candidates.iter().map(|c| c.text.clone()).collect::<Vec<_>>();
    assert_eq!(texts(&before), texts(&after));
    Ok(())
}

#[tokio::test]
async fn note_resubmission_replaces_text() -> anyhow::Result<()> {
    let service = service().await;
    service.ingest_note(NoteRequest::new("N7", "Way lube tank was empty.")).await?;
    service.ingest_note(NoteRequest::new("N7", "Way lube tank refilled with Vactra 2.")).await?;
    assert_eq!(service.stats().await?.notes, 1);

    let outcome = service.query(QueryRequest::new("way lube tank")).await?;
    assert_eq!(outcome.candidates.len(), 1);
    assert!(outcome.candidates[0].text.contains("Vactra"));
    Ok(())
}

#[tokio::test]
async fn identical_corpora_rank_identically() -> anyhow::Result<()> {
    let (a, b) = (service().await, service().await);
    seed(&a).await?;
    seed(&b).await?;
    let request = QueryRequest::new("spindle warm-up before machining").for_machine(Some(tag("haas-vf2")));
    let first = a.query(request.clone()).await?;
    assert_eq!(first, a.query(request.clone()).await?);
    assert_eq!(first, b.query(request).await?);
    Ok(())
}

#[tokio::test]
async fn larger_top_k_extends_the_same_ranking() -> anyhow::Result<()> {
    let service = service().await;
    seed(&service).await?;
    let question = "machine spindle coolant robot safety";
    let short = service.query(QueryRequest::new(question).top_k(2)).await?;
    let long = service.query(QueryRequest::new(question).top_k(6)).await?;
    assert_eq!(short.candidates.len(), 2);
    assert!(long.candidates.len() > 2);
    let ids = |o: &shoprag_hybrid::QueryOutcome| o.candidates.iter().map(|c| c.chunk_id).collect::<Vec<_>>();
    assert_eq!(ids(&short)[..], ids(&long)[..2]);
    assert!(long.candidates.windows(2).all(|w| w[0].fused_score >= w[1].fused_score));
    assert!(long.candidates.iter().enumerate().all(|(i, c)| c.rank == i + 1));
    Ok(())
}

#[tokio::test]
async fn zero_top_k_and_empty_corpus_return_nothing() -> anyhow::Result<()> {
    let service = service().await;
    assert!(service.query(QueryRequest::new("spindle")).await?.candidates.is_empty());
    seed(&service).await?;
    assert!(service.query(QueryRequest::new("spindle").top_k(0)).await?.candidates.is_empty());
    Ok(())
}

#[tokio::test]
async fn confidence_gate_suppresses_weak_results() -> anyhow::Result<()> {
    let mut gated = settings();
    gated.fusion.min_confidence = 0.99;
    let service = RetrievalService::new(gated, embedder()).await?;
    seed(&service).await?;
    let outcome = service.query(QueryRequest::new("hydraulic chuck jaw pressure")).await?;
    assert!(outcome.candidates.is_empty());
    Ok(())
}

#[tokio::test]
async fn leaked_cross_machine_hit_is_reported_as_corruption() -> anyhow::Result<()> {
    let service = RetrievalService::with_indices(
        settings(),
        embedder(),
        LexicalIndex::new()?,
        LeakyIndex(VectorIndex::in_memory(DIM).await?),
        None,
    )?;
    service.ingest(DocumentRequest::manual("VF-2 Operator Manual", VF2_MANUAL).for_machine(Some(tag("haas-vf2")))).await?;

    let result = service.query(QueryRequest::new("spindle warm-up").for_machine(Some(tag("ur10e")))).await;
    assert!(matches!(result, Err(Error::IndexCorruption(_))));
    Ok(())
}

#[tokio::test]
async fn failed_vector_search_serves_lexical_only() -> anyhow::Result<()> {
    let service = RetrievalService::with_indices(
        settings(),
        embedder(),
        LexicalIndex::new()?,
        BrokenSearchIndex(VectorIndex::in_memory(DIM).await?),
        None,
    )?;
    seed(&service).await?;

    let outcome = service.query(QueryRequest::new("coolant refractometer concentration")).await?;
    assert_eq!(outcome.mode, RetrievalMode::LexicalOnly);
    assert!(!outcome.candidates.is_empty());
    assert!(outcome.candidates.iter().all(|c| c.vector_score == 0.0));
    assert!(outcome.candidates[0].text.contains("refractometer"));
    Ok(())
}

#[tokio::test]
async fn remove_document_hides_and_drops_entries() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let service = RetrievalService::open(settings(), embedder(), store.clone()).await?;
    let id = service.ingest(DocumentRequest::manual("Shop Safety Rules", SAFETY_RULES)).await?;
    assert_eq!(store.len(), 1);

    assert!(service.remove_document(&id).await?);
    assert!(!service.remove_document(&id).await?);
    let stats = service.stats().await?;
    assert_eq!((stats.manuals, stats.chunks, stats.vector_entries, stats.lexical_entries), (0, 0, 0, 0));
    assert!(store.is_empty());
    assert!(service.query(QueryRequest::new("lockout tagout")).await?.candidates.is_empty());
    Ok(())
}

#[tokio::test]
async fn machines_and_stats_reflect_the_corpus() -> anyhow::Result<()> {
    let service = service().await;
    seed(&service).await?;
    service.ingest_note(NoteRequest::new("N1", "Replaced way cover wiper.").for_machine(Some(tag("Haas VF2")))).await?;

    assert_eq!(service.machines()?, vec![tag("haas-vf2"), tag("ur10e")]);
    let stats = service.stats().await?;
    assert_eq!((stats.manuals, stats.notes), (3, 1));
    assert_eq!(stats.vector_entries, stats.chunks);
    assert_eq!(stats.lexical_entries, stats.chunks);
    Ok(())
}

#[tokio::test]
async fn restart_from_memory_store_restores_ranking() -> anyhow::Result<()> {
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
    let request = QueryRequest::new("spindle warm-up").for_machine(Some(tag("haas-vf2")));

    let first = RetrievalService::open(settings(), embedder(), store.clone()).await?;
    seed(&first).await?;
    let expected = first.query(request.clone()).await?;
    let max_id = expected.candidates.iter().map(|c| c.chunk_id).max().unwrap_or_default();
    drop(first);

    let second = RetrievalService::open(settings(), embedder(), store).await?;
    assert_eq!(second.query(request).await?, expected);

    second.ingest_note(NoteRequest::new("N2", "Spindle ran warm after the warm-up cycle.")).await?;
    let note = second.query(QueryRequest::new("spindle ran warm").top_k(1)).await?;
    assert!(note.candidates[0].chunk_id > max_id);
    Ok(())
}

#[tokio::test]
async fn restoring_a_live_service_keeps_its_entries() -> anyhow::Result<()> {
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
    let service = RetrievalService::open(settings(), embedder(), store).await?;
    seed(&service).await?;
    let request = QueryRequest::new("spindle warm-up").for_machine(Some(tag("haas-vf2")));
    let expected = service.query(request.clone()).await?;
    let before = service.stats().await?;

    assert_eq!(service.restore().await?, 3);
    let after = service.stats().await?;
    assert_eq!(after, before);
    assert_eq!(after.vector_entries, after.chunks);
    assert_eq!(after.lexical_entries, after.chunks);
    assert_eq!(service.query(request).await?, expected);
    Ok(())
}

#[tokio::test]
async fn restart_from_lancedb_restores_ranking() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let request = QueryRequest::new("coolant concentration refractometer");

    let expected = {
        let store = Arc::new(LanceChunkStore::open(dir.path(), DIM).await?);
        let service = RetrievalService::open(settings(), embedder(), store).await?;
        seed(&service).await?;
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 30, 0).single().expect("timestamp");
        let note = NoteRequest::new("N3", "Coolant concentration measured at 4 percent, topped up.").created_at(at);
        service.ingest_note(note).await?;
        service.query(request.clone()).await?
    };
    assert!(!expected.candidates.is_empty());

    let store = Arc::new(LanceChunkStore::open(dir.path(), DIM).await?);
    let service = RetrievalService::open(settings(), embedder(), store).await?;
    assert_eq!(service.stats().await?.notes, 1);
    assert_eq!(service.query(request).await?, expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_notes_and_queries() -> anyhow::Result<()> {
    let service = Arc::new(service().await);
    seed(&service).await?;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            let note = NoteRequest::new(format!("N{i}"), format!("Checked spindle belt tension on shift {i}."));
            service.ingest_note(note.for_machine(Some(tag("haas-vf2")))).await?;
            service.query(QueryRequest::new("spindle belt tension").for_machine(Some(tag("haas-vf2")))).await?;
            Ok::<_, Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let stats = service.stats().await?;
    assert_eq!(stats.notes, 8);
    assert_eq!(stats.vector_entries, stats.chunks);
    let outcome = service.query(QueryRequest::new("spindle belt tension").top_k(20)).await?;
    let notes = outcome.candidates.iter().filter(|c| c.provenance.note_id().is_some()).count();
    assert_eq!(notes, 8);
    Ok(())
}
