//! Dense nearest-neighbour search served by LanceDB.
//!
//! Entries live in a `vectors` table (chunk id, machine tag, vector) on a
//! private `memory://` connection; the durable copy of every vector is the
//! chunk store, and the index is rebuilt from it on restore. Queries run an
//! exact cosine `vector_search` with the machine scope as a prefilter, so rows
//! of other machines never take a top-k slot. Scores map cosine similarity
//! from [-1, 1] onto [0, 1]: `1 - distance / 2`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, StringArray, UInt64Array};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{DistanceType, Table};
use tokio::sync::Mutex;

use shoprag_core::error::{Error, Result};
use shoprag_core::traits::{IndexEntry, Scope, VectorIndexer};
use shoprag_core::types::{ChunkId, HitSource, MachineFilter, SearchHit};

use crate::schema::{vectors_schema, VECTORS_TABLE};
use crate::table::{column, ensure_table, open_db, quote, upsert};

/// Extra hits fetched beyond `k` in the first window.
const WINDOW_SLACK: usize = 16;

static EPHEMERAL_DBS: AtomicU64 = AtomicU64::new(0);

fn index_error(e: anyhow::Error) -> Error {
	Error::Index(format!("{e:#}"))
}

fn machine_predicate(filter: &MachineFilter) -> Option<String> {
	match filter {
		MachineFilter::All => None,
		MachineFilter::Machine(tag) => Some(format!("(machine = {} OR machine IS NULL)", quote(tag.as_str()))),
	}
}

pub struct VectorIndex {
	table: Table,
	dim: usize,
	/// Serializes table writes; reads never take it.
	writes: Mutex<()>,
}

impl VectorIndex {
	/// Opens an empty index on its own in-memory database.
	pub async fn in_memory(dim: usize) -> Result<Self> {
		let n = EPHEMERAL_DBS.fetch_add(1, Ordering::Relaxed);
		let width = i32::try_from(dim).map_err(|_| Error::InvalidConfig(format!("vector dimension {dim} too large")))?;
		let db = open_db(&format!("memory://shoprag-vectors-{n}")).await.map_err(index_error)?;
		let table = ensure_table(&db, VECTORS_TABLE, vectors_schema(width)).await.map_err(index_error)?;
		Ok(Self { table, dim, writes: Mutex::new(()) })
	}

	fn batch(&self, entries: &[IndexEntry<'_>]) -> anyhow::Result<RecordBatch> {
		let width = i32::try_from(self.dim)?;
		let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
		let machines: Vec<Option<String>> = entries.iter().map(|e| e.machine.map(|m| m.as_str().to_string())).collect();
		let vectors = entries.iter().map(|e| Some(e.vector.iter().map(|&x| Some(x)).collect::<Vec<_>>()));
		Ok(RecordBatch::try_new(
			vectors_schema(width),
			vec![
				Arc::new(UInt64Array::from(ids)),
				Arc::new(StringArray::from(machines)),
				Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors, width)),
			],
		)?)
	}

	/// One ranked window: the `limit` nearest rows passing `predicate`.
	async fn nearest(&self, query: &[f32], limit: usize, predicate: Option<&str>) -> anyhow::Result<Vec<SearchHit>> {
		let mut search = self
			.table
			.vector_search(query.to_vec())?
			.distance_type(DistanceType::Cosine)
			.select(Select::columns(&["chunk_id"]))
			.limit(limit);
		if let Some(predicate) = predicate {
			search = search.only_if(predicate);
		}
		let mut stream = search.execute().await?;
		let mut hits = Vec::with_capacity(limit);
		while let Some(batch) = stream.try_next().await? {
			let ids = column::<UInt64Array>(&batch, "chunk_id")?;
			let distances = column::<Float32Array>(&batch, "_distance")?;
			for i in 0..batch.num_rows() {
				let score = if distances.is_null(i) { f32::NAN } else { (1.0 - distances.value(i) / 2.0).clamp(0.0, 1.0) };
				hits.push(SearchHit { id: ids.value(i), score, source: HitSource::Vector });
			}
		}
		Ok(hits)
	}
}

#[async_trait]
impl VectorIndexer for VectorIndex {
	async fn insert(&self, entries: &[IndexEntry<'_>]) -> Result<()> {
		if let Some(bad) = entries.iter().find(|e| e.vector.len() != self.dim) {
			return Err(Error::ingestion(format!(
				"vector for chunk {} has dimension {} but the index expects {}",
				bad.id,
				bad.vector.len(),
				self.dim
			)));
		}
		if entries.is_empty() {
			return Ok(());
		}
		let batch = self.batch(entries).map_err(index_error)?;
		let _writes = self.writes.lock().await;
		upsert(&self.table, &["chunk_id"], batch).await.map_err(index_error)
	}

	async fn remove(&self, ids: &[ChunkId]) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}
		let list = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
		let _writes = self.writes.lock().await;
		self.table
			.delete(&format!("chunk_id IN ({list})"))
			.await
			.map_err(|e| Error::Index(e.to_string()))?;
		Ok(())
	}

	async fn search_vec(&self, query: &[f32], k: usize, scope: &Scope<'_>) -> Result<Vec<SearchHit>> {
		if query.len() != self.dim {
			return Err(Error::EmbeddingUnavailable(format!(
				"query vector has dimension {} but the index expects {}",
				query.len(),
				self.dim
			)));
		}
		let norm: f32 = query.iter().map(|x| x * x).sum();
		if k == 0 || norm <= 0.0 || !norm.is_finite() {
			return Ok(Vec::new());
		}
		let total = self.len().await?;
		if total == 0 {
			return Ok(Vec::new());
		}

		let predicate = machine_predicate(scope.filter);
		let mut limit = k.saturating_add(WINDOW_SLACK).min(total);
		loop {
			let window = self.nearest(query, limit, predicate.as_deref()).await.map_err(index_error)?;
			let exhausted = window.len() < limit || limit >= total;
			if let Some(hits) = scope.settle(window, exhausted, k) {
				tracing::trace!(limit, hits = hits.len(), "vector search");
				return Ok(hits);
			}
			limit = limit.saturating_mul(2).min(total);
		}
	}

	async fn len(&self) -> Result<usize> {
		self.table.count_rows(None).await.map_err(|e| Error::Index(e.to_string()))
	}
}
