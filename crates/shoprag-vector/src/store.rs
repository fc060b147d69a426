//! LanceDB-backed [`ChunkStore`].
//!
//! Two tables: `documents` (one row per published document) and `chunks` (one
//! row per chunk, with its vector). Both carry a `revision`, the first chunk id
//! of the version that wrote them. A save appends the new chunk rows, then
//! upserts the document row, then deletes chunk rows of older revisions. The
//! document upsert is the commit point: loading only pairs a document with
//! chunk rows of its own revision, so a save that fails part way leaves the
//! previous version loadable. Leftover rows are purged on the next load.
use anyhow::{anyhow, bail, Context, Result};
use arrow_array::types::Float32Type;
use arrow_array::{
	Array, FixedSizeListArray, Float32Array, RecordBatch, StringArray, TimestampMillisecondArray, UInt32Array,
	UInt64Array,
};
use async_trait::async_trait;
use chrono::DateTime;
use lancedb::Table;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use shoprag_core::traits::{ChunkStore, StoredChunk, StoredDocument};
use shoprag_core::types::{Chunk, Document, DocumentId, MachineTag, PageSpan, SourceKind};

use crate::schema::{chunks_schema, documents_schema, vector_dim, CHUNKS_TABLE, DOCUMENTS_TABLE};
use crate::table::{append, column, ensure_table, open_db, opt_str, quote, scan, upsert};

pub struct LanceChunkStore {
	documents: Table,
	chunks: Table,
	dim: usize,
	/// Serializes writes; one save spans both tables.
	writes: Mutex<()>,
}

fn revision_of(doc: &StoredDocument) -> u64 {
	doc.chunks.iter().map(|c| c.chunk.id).min().unwrap_or_default()
}

impl LanceChunkStore {
	/// Opens (or creates) the store at `path`. Fails if an existing chunks
	/// table was written with a different vector dimension.
	pub async fn open(path: &Path, dim: usize) -> Result<Self> {
		std::fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
		let db = open_db(path.to_string_lossy().as_ref()).await?;
		let width = i32::try_from(dim).context("vector dimension too large")?;
		let documents = ensure_table(&db, DOCUMENTS_TABLE, documents_schema()).await?;
		let chunks = ensure_table(&db, CHUNKS_TABLE, chunks_schema(width)).await?;
		let existing = vector_dim(&*chunks.schema().await?);
		if existing != Some(width) {
			bail!("chunks table has vector dimension {existing:?}, embedder produces {dim}");
		}
		tracing::info!(path = %path.display(), dim, "opened lancedb store");
		Ok(Self { documents, chunks, dim, writes: Mutex::new(()) })
	}

	fn document_batch(&self, doc: &Document, revision: u64) -> Result<RecordBatch> {
		Ok(RecordBatch::try_new(
			documents_schema(),
			vec![
				Arc::new(StringArray::from(vec![doc.id.as_str().to_string()])),
				Arc::new(StringArray::from(vec![doc.title.clone()])),
				Arc::new(StringArray::from(vec![doc.machine.as_ref().map(|m| m.as_str().to_string())])),
				Arc::new(StringArray::from(vec![doc.kind.as_str().to_string()])),
				Arc::new(TimestampMillisecondArray::from(vec![doc.created_at.timestamp_millis()])),
				Arc::new(StringArray::from(vec![doc.note_id.clone()])),
				Arc::new(UInt64Array::from(vec![revision])),
			],
		)?)
	}

	fn chunk_batch(&self, rows: &[StoredChunk], revision: u64) -> Result<RecordBatch> {
		let mut ids = Vec::with_capacity(rows.len());
		let mut doc_ids = Vec::with_capacity(rows.len());
		let mut ordinals = Vec::with_capacity(rows.len());
		let mut texts = Vec::with_capacity(rows.len());
		let mut token_lens = Vec::with_capacity(rows.len());
		let mut starts = Vec::with_capacity(rows.len());
		let mut ends = Vec::with_capacity(rows.len());
		let mut overlaps = Vec::with_capacity(rows.len());
		let mut first_pages = Vec::with_capacity(rows.len());
		let mut last_pages = Vec::with_capacity(rows.len());
		let mut sections: Vec<Option<String>> = Vec::with_capacity(rows.len());
		let mut machines: Vec<Option<String>> = Vec::with_capacity(rows.len());
		let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(rows.len());
		for StoredChunk { chunk, vector } in rows {
			if vector.len() != self.dim {
				bail!("chunk {} has dimension {}, store expects {}", chunk.id, vector.len(), self.dim);
			}
			ids.push(chunk.id);
			doc_ids.push(chunk.document_id.as_str().to_string());
			ordinals.push(u32::try_from(chunk.ordinal)?);
			texts.push(chunk.text.clone());
			token_lens.push(u32::try_from(chunk.token_len)?);
			starts.push(chunk.byte_start as u64);
			ends.push(chunk.byte_end as u64);
			overlaps.push(chunk.overlap_bytes as u64);
			first_pages.push(chunk.pages.first);
			last_pages.push(chunk.pages.last);
			sections.push(chunk.section.clone());
			machines.push(chunk.machine.as_ref().map(|m| m.as_str().to_string()));
			vectors.push(Some(vector.iter().map(|&x| Some(x)).collect()));
		}
		let width = i32::try_from(self.dim)?;
		Ok(RecordBatch::try_new(
			chunks_schema(width),
			vec![
				Arc::new(UInt64Array::from(ids)),
				Arc::new(StringArray::from(doc_ids)),
				Arc::new(UInt32Array::from(ordinals)),
				Arc::new(StringArray::from(texts)),
				Arc::new(UInt32Array::from(token_lens)),
				Arc::new(UInt64Array::from(starts)),
				Arc::new(UInt64Array::from(ends)),
				Arc::new(UInt64Array::from(overlaps)),
				Arc::new(UInt32Array::from(first_pages)),
				Arc::new(UInt32Array::from(last_pages)),
				Arc::new(StringArray::from(sections)),
				Arc::new(StringArray::from(machines)),
				Arc::new(UInt64Array::from(vec![revision; rows.len()])),
				Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors.into_iter(), width)),
			],
		)?)
	}

	async fn read_documents(&self) -> Result<Vec<(Document, u64)>> {
		let mut out = Vec::new();
		for batch in scan(&self.documents).await? {
			let ids = column::<StringArray>(&batch, "id")?;
			let titles = column::<StringArray>(&batch, "title")?;
			let machines = column::<StringArray>(&batch, "machine")?;
			let kinds = column::<StringArray>(&batch, "kind")?;
			let created = column::<TimestampMillisecondArray>(&batch, "created_at")?;
			let note_ids = column::<StringArray>(&batch, "note_id")?;
			let revisions = column::<UInt64Array>(&batch, "revision")?;
			for i in 0..batch.num_rows() {
				let created_at = DateTime::from_timestamp_millis(created.value(i))
					.ok_or_else(|| anyhow!("invalid created_at for document {}", ids.value(i)))?;
				let document = Document {
					id: DocumentId::new(ids.value(i)),
					title: titles.value(i).to_string(),
					machine: opt_str(machines, i).as_deref().and_then(MachineTag::parse),
					kind: kinds.value(i).parse::<SourceKind>()?,
					created_at,
					note_id: opt_str(note_ids, i),
				};
				out.push((document, revisions.value(i)));
			}
		}
		Ok(out)
	}

	async fn read_chunks(&self) -> Result<Vec<(StoredChunk, u64)>> {
		let mut out = Vec::new();
		for batch in scan(&self.chunks).await? {
			let ids = column::<UInt64Array>(&batch, "chunk_id")?;
			let doc_ids = column::<StringArray>(&batch, "document_id")?;
			let ordinals = column::<UInt32Array>(&batch, "ordinal")?;
			let texts = column::<StringArray>(&batch, "text")?;
			let token_lens = column::<UInt32Array>(&batch, "token_len")?;
			let starts = column::<UInt64Array>(&batch, "byte_start")?;
			let ends = column::<UInt64Array>(&batch, "byte_end")?;
			let overlaps = column::<UInt64Array>(&batch, "overlap_bytes")?;
			let first_pages = column::<UInt32Array>(&batch, "page_first")?;
			let last_pages = column::<UInt32Array>(&batch, "page_last")?;
			let sections = column::<StringArray>(&batch, "section")?;
			let machines = column::<StringArray>(&batch, "machine")?;
			let revisions = column::<UInt64Array>(&batch, "revision")?;
			let vectors = column::<FixedSizeListArray>(&batch, "vector")?;
			for i in 0..batch.num_rows() {
				if vectors.is_null(i) {
					bail!("chunk {} has no vector", ids.value(i));
				}
				let values = vectors.value(i);
				let floats = values
					.as_any()
					.downcast_ref::<Float32Array>()
					.ok_or_else(|| anyhow!("vector column is not Float32"))?;
				let row = StoredChunk {
					chunk: Chunk {
						id: ids.value(i),
						document_id: DocumentId::new(doc_ids.value(i)),
						ordinal: ordinals.value(i) as usize,
						text: texts.value(i).to_string(),
						token_len: token_lens.value(i) as usize,
						byte_start: usize::try_from(starts.value(i))?,
						byte_end: usize::try_from(ends.value(i))?,
						overlap_bytes: usize::try_from(overlaps.value(i))?,
						pages: PageSpan { first: first_pages.value(i), last: last_pages.value(i) },
						section: opt_str(sections, i),
						machine: opt_str(machines, i).as_deref().and_then(MachineTag::parse),
					},
					vector: floats.values().to_vec(),
				};
				out.push((row, revisions.value(i)));
			}
		}
		Ok(out)
	}
}

#[async_trait]
impl ChunkStore for LanceChunkStore {
	async fn save_document(&self, doc: &StoredDocument) -> Result<()> {
		let revision = revision_of(doc);
		let document = self.document_batch(&doc.document, revision)?;
		let chunks = self.chunk_batch(&doc.chunks, revision)?;
		let key = quote(doc.document.id.as_str());

		let _writes = self.writes.lock().await;
		append(&self.chunks, chunks).await?;
		if let Err(e) = upsert(&self.documents, &["id"], document).await {
			if let Err(cleanup) =
				self.chunks.delete(&format!("document_id = {key} AND revision = {revision}")).await
			{
				tracing::warn!(document = %doc.document.id, error = %cleanup, "unreferenced chunk rows left behind");
			}
			return Err(e.context(format!("saving document {}", doc.document.id)));
		}
		// committed; stale rows are ignored on load and purged there if this fails
		if let Err(e) = self.chunks.delete(&format!("document_id = {key} AND revision <> {revision}")).await {
			tracing::warn!(document = %doc.document.id, error = %e, "previous chunk rows not deleted");
		}
		tracing::debug!(document = %doc.document.id, chunks = doc.chunks.len(), revision, "saved document");
		Ok(())
	}

	async fn delete_document(&self, id: &DocumentId) -> Result<()> {
		let key = quote(id.as_str());
		let _writes = self.writes.lock().await;
		self.documents.delete(&format!("id = {key}")).await?;
		self.chunks.delete(&format!("document_id = {key}")).await?;
		Ok(())
	}

	async fn load_all(&self) -> Result<Vec<StoredDocument>> {
		let documents = self.read_documents().await?;
		let revisions: HashMap<&DocumentId, u64> = documents.iter().map(|(d, rev)| (&d.id, *rev)).collect();
		let mut grouped: BTreeMap<DocumentId, Vec<StoredChunk>> = BTreeMap::new();
		let mut stale: Vec<u64> = Vec::new();
		for (row, revision) in self.read_chunks().await? {
			if revisions.get(&row.chunk.document_id) == Some(&revision) {
				grouped.entry(row.chunk.document_id.clone()).or_default().push(row);
			} else {
				stale.push(row.chunk.id);
			}
		}
		if !stale.is_empty() {
			tracing::warn!(rows = stale.len(), "purging chunk rows of unfinished or replaced saves");
			let list = stale.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
			let _writes = self.writes.lock().await;
			self.chunks.delete(&format!("chunk_id IN ({list})")).await?;
		}

		let mut out = Vec::with_capacity(documents.len());
		for (document, _) in documents {
			let mut chunks = grouped.remove(&document.id).unwrap_or_default();
			chunks.sort_by_key(|c| c.chunk.ordinal);
			out.push(StoredDocument { document, chunks });
		}
		Ok(out)
	}
}
