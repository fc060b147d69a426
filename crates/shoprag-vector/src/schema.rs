use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

pub const DOCUMENTS_TABLE: &str = "documents";
pub const CHUNKS_TABLE: &str = "chunks";
pub const VECTORS_TABLE: &str = "vectors";

fn vector_field(dim: i32) -> Field {
	Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true)
}

pub fn documents_schema() -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("id", DataType::Utf8, false),
		Field::new("title", DataType::Utf8, false),
		Field::new("machine", DataType::Utf8, true),
		Field::new("kind", DataType::Utf8, false),
		Field::new("created_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
		Field::new("note_id", DataType::Utf8, true),
		Field::new("revision", DataType::UInt64, false),
	]))
}

/// Chunk rows. The vector column width is fixed per table at creation time.
/// `revision` ties a row to the document version that wrote it.
pub fn chunks_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("chunk_id", DataType::UInt64, false),
		Field::new("document_id", DataType::Utf8, false),
		Field::new("ordinal", DataType::UInt32, false),
		Field::new("text", DataType::Utf8, false),
		Field::new("token_len", DataType::UInt32, false),
		Field::new("byte_start", DataType::UInt64, false),
		Field::new("byte_end", DataType::UInt64, false),
		Field::new("overlap_bytes", DataType::UInt64, false),
		Field::new("page_first", DataType::UInt32, false),
		Field::new("page_last", DataType::UInt32, false),
		Field::new("section", DataType::Utf8, true),
		Field::new("machine", DataType::Utf8, true),
		Field::new("revision", DataType::UInt64, false),
		vector_field(dim),
	]))
}

/// Search entries of the vector index.
pub fn vectors_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("chunk_id", DataType::UInt64, false),
		Field::new("machine", DataType::Utf8, true),
		vector_field(dim),
	]))
}

/// Width of the `vector` column, if the schema has one.
pub fn vector_dim(schema: &Schema) -> Option<i32> {
	match schema.field_with_name("vector").ok()?.data_type() {
		DataType::FixedSizeList(_, dim) => Some(*dim),
		_ => None,
	}
}
