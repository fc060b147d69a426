//! LanceDB connection and housekeeping helpers.
use anyhow::{anyhow, Result};
use arrow_array::{Array, RecordBatch, RecordBatchIterator};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, Table};
use std::sync::Arc;

pub async fn open_db(uri: &str) -> Result<Connection> {
	Ok(connect(uri).execute().await?)
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<Table> {
	let names = conn.table_names().execute().await?;
	if names.contains(&name.to_string()) {
		return Ok(conn.open_table(name).execute().await?);
	}
	// create empty table with 0 rows
	let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
	Ok(conn.create_table(name, Box::new(iter)).execute().await?)
}

pub async fn append(table: &Table, batch: RecordBatch) -> Result<()> {
	if batch.num_rows() == 0 {
		return Ok(());
	}
	let schema = batch.schema();
	let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
	table.add(reader).execute().await?;
	Ok(())
}

/// Inserts `batch`, replacing rows whose `key` columns match.
pub async fn upsert(table: &Table, key: &[&str], batch: RecordBatch) -> Result<()> {
	if batch.num_rows() == 0 {
		return Ok(());
	}
	let schema = batch.schema();
	let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
	let mut merge = table.merge_insert(key);
	merge.when_matched_update_all(None).when_not_matched_insert_all();
	merge.execute(reader).await?;
	Ok(())
}

/// Reads every row.
pub async fn scan(table: &Table) -> Result<Vec<RecordBatch>> {
	let rows = table.count_rows(None).await?;
	if rows == 0 {
		return Ok(Vec::new());
	}
	let mut stream = table.query().limit(rows).execute().await?;
	let mut batches = Vec::new();
	while let Some(batch) = stream.try_next().await? {
		batches.push(batch);
	}
	Ok(batches)
}

pub fn quote(value: &str) -> String {
	format!("'{}'", value.replace('\'', "''"))
}

pub fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
	batch
		.column_by_name(name)
		.and_then(|c| c.as_any().downcast_ref::<T>())
		.ok_or_else(|| anyhow!("column '{name}' missing or of unexpected type"))
}

pub fn opt_str(array: &arrow_array::StringArray, i: usize) -> Option<String> {
	if array.is_null(i) { None } else { Some(array.value(i).to_string()) }
}
