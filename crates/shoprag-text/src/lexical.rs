//! BM25 over chunk text, served by an in-RAM tantivy index.
//!
//! Every write is one commit plus a reader reload, taken under the writer
//! mutex. Queries run on a `Searcher` snapshot and never touch that mutex.
//! Segments that carry deletes are merged right after the commit that made
//! them, so term statistics only ever count live entries.
use std::sync::Mutex;

use tantivy::collector::TopDocs;
use tantivy::indexer::NoMergePolicy;
use tantivy::query::{BooleanQuery, ConstScoreQuery, Occur, Query, TermQuery};
use tantivy::schema::{
	Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, INDEXED, STORED, STRING,
};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, TantivyError, Term};
use tracing::trace;

use shoprag_core::error::{Error, Result};
use shoprag_core::traits::{IndexEntry, Scope, TextIndexer};
use shoprag_core::types::{ChunkId, HitSource, MachineFilter, MachineTag, SearchHit};

use crate::analyzer::{Analyzer, TOKENIZER};

/// Indexed in the `machine` field for chunks that apply to every machine.
/// Tags never contain whitespace, so it cannot collide with one.
const GLOBAL_MACHINE: &str = "all machines";
const WRITER_HEAP_BYTES: usize = 20_000_000;
const MAX_SEGMENTS: usize = 8;
/// Extra hits fetched beyond `k` in the first window.
const WINDOW_SLACK: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Fields {
	chunk_id: Field,
	text: Field,
	machine: Field,
}

fn build_schema() -> (Schema, Fields) {
	let mut schema_builder = Schema::builder();
	let chunk_id = schema_builder.add_u64_field("chunk_id", INDEXED | STORED | FAST);
	let text_indexing = TextFieldIndexing::default()
		.set_tokenizer(TOKENIZER)
		.set_index_option(IndexRecordOption::WithFreqs);
	let text = schema_builder.add_text_field("text", TextOptions::default().set_indexing_options(text_indexing));
	let machine = schema_builder.add_text_field("machine", STRING);
	(schema_builder.build(), Fields { chunk_id, text, machine })
}

fn index_error(e: TantivyError) -> Error {
	Error::Index(e.to_string())
}

fn poisoned<T>(_: T) -> Error {
	Error::IndexCorruption("lexical writer lock poisoned".into())
}

pub struct LexicalIndex {
	index: Index,
	fields: Fields,
	analyzer: Analyzer,
	writer: Mutex<IndexWriter>,
	reader: IndexReader,
}

impl LexicalIndex {
	pub fn new() -> Result<Self> {
		let (schema, fields) = build_schema();
		let index = Index::create_in_ram(schema);
		let analyzer = Analyzer::new();
		analyzer.register(&index);
		let writer: IndexWriter = index.writer_with_num_threads(1, WRITER_HEAP_BYTES).map_err(index_error)?;
		writer.set_merge_policy(Box::new(NoMergePolicy));
		let reader = index
			.reader_builder()
			.reload_policy(ReloadPolicy::Manual)
			.try_into()
			.map_err(index_error)?;
		Ok(Self { index, fields, analyzer, writer: Mutex::new(writer), reader })
	}

	/// Commits pending operations, compacts and makes them searchable.
	fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
		writer.commit().map_err(index_error)?;
		let metas = self.index.searchable_segment_metas().map_err(index_error)?;
		if metas.len() > MAX_SEGMENTS || metas.iter().any(|m| m.has_deletes()) {
			let ids: Vec<_> = metas.iter().map(|m| m.id()).collect();
			writer.merge(&ids).wait().map_err(index_error)?;
		}
		self.reader.reload().map_err(index_error)
	}

	/// Text terms OR-ed together; a machine filter adds a non-scoring
	/// `machine:M OR machine:<global>` requirement.
	fn build_query(&self, text: &str, filter: &MachineFilter) -> Option<Box<dyn Query>> {
		let terms: Vec<(Occur, Box<dyn Query>)> = self
			.analyzer
			.tokens(text)
			.iter()
			.map(|token| {
				let term = Term::from_field_text(self.fields.text, token);
				(Occur::Should, Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)) as Box<dyn Query>)
			})
			.collect();
		if terms.is_empty() {
			return None;
		}
		let text_query: Box<dyn Query> = Box::new(BooleanQuery::new(terms));
		let MachineFilter::Machine(tag) = filter else { return Some(text_query) };

		let machine = |value: &str| -> Box<dyn Query> {
			let term = Term::from_field_text(self.fields.machine, value);
			Box::new(TermQuery::new(term, IndexRecordOption::Basic))
		};
		let scope = BooleanQuery::new(vec![
			(Occur::Should, machine(tag.as_str())),
			(Occur::Should, machine(GLOBAL_MACHINE)),
		]);
		Some(Box::new(BooleanQuery::new(vec![
			(Occur::Must, text_query),
			(Occur::Must, Box::new(ConstScoreQuery::new(Box::new(scope), 0.0))),
		])))
	}
}

impl TextIndexer for LexicalIndex {
	fn insert(&self, entries: &[IndexEntry<'_>]) -> Result<()> {
		if entries.is_empty() {
			return Ok(());
		}
		let mut writer = self.writer.lock().map_err(poisoned)?;
		for entry in entries {
			writer.delete_term(Term::from_field_u64(self.fields.chunk_id, entry.id));
			let machine = entry.machine.map_or(GLOBAL_MACHINE, MachineTag::as_str);
			let added = writer.add_document(doc!(
				self.fields.chunk_id => entry.id,
				self.fields.text => entry.text.to_string(),
				self.fields.machine => machine.to_string(),
			));
			if let Err(e) = added {
				writer.rollback().map_err(index_error)?;
				return Err(index_error(e));
			}
		}
		self.commit(&mut writer)
	}

	fn remove(&self, ids: &[ChunkId]) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}
		let mut writer = self.writer.lock().map_err(poisoned)?;
		for &id in ids {
			writer.delete_term(Term::from_field_u64(self.fields.chunk_id, id));
		}
		self.commit(&mut writer)
	}

	fn search(&self, query: &str, k: usize, scope: &Scope<'_>) -> Result<Vec<SearchHit>> {
		if k == 0 {
			return Ok(Vec::new());
		}
		let Some(parsed) = self.build_query(query, scope.filter) else { return Ok(Vec::new()) };
		let searcher = self.reader.searcher();
		let total = usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX);
		if total == 0 {
			return Ok(Vec::new());
		}

		let mut limit = k.saturating_add(WINDOW_SLACK).min(total);
		loop {
			let top = searcher.search(&parsed, &TopDocs::with_limit(limit)).map_err(index_error)?;
			let exhausted = top.len() < limit || limit >= total;
			let mut window = Vec::with_capacity(top.len());
			for (score, address) in top {
				let doc: TantivyDocument = searcher.doc(address).map_err(index_error)?;
				let id = doc.get_first(self.fields.chunk_id).and_then(|v| v.as_u64()).ok_or_else(|| {
					Error::IndexCorruption(format!("lexical entry {address:?} has no chunk id"))
				})?;
				window.push(SearchHit { id, score, source: HitSource::Lexical });
			}
			if let Some(hits) = scope.settle(window, exhausted, k) {
				trace!(limit, hits = hits.len(), "lexical search");
				return Ok(hits);
			}
			limit = limit.saturating_mul(2).min(total);
		}
	}

	fn len(&self) -> usize {
		usize::try_from(self.reader.searcher().num_docs()).unwrap_or(usize::MAX)
	}
}
