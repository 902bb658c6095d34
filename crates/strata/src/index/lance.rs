use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::DistanceType;
use lancedb::Table;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::{IndexEntry, IndexFilter, IndexHit, IndexMetadata, SimilarityIndex, rank_hits};
use crate::error::{Result, StrataError};
use crate::memory::scoring::cosine_similarity;
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, validate_vector};

const INDEX_BACKEND: &str = "similarity-index";

/// LanceDB-backed similarity index, one table per collection.
pub struct LanceIndex {
    collection: String,
    dimension: usize,
    table: Table,
}

impl LanceIndex {
    /// Connect to the database at `path` and open the collection's table,
    /// creating it when missing.
    pub async fn open(path: &Path, collection: &str, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| StrataError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| unavailable(format!("Failed to connect to LanceDB: {e}")))?;

        let table_name = table_name(collection);
        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| unavailable(format!("Failed to list tables: {e}")))?;

        let table = if names.contains(&table_name) {
            tracing::debug!("Opening existing table {table_name}");
            connection
                .open_table(&table_name)
                .execute()
                .await
                .map_err(|e| unavailable(format!("Failed to open table {table_name}: {e}")))?
        } else {
            tracing::info!("Creating table {table_name}");
            let schema = Self::schema(dimension);
            let batch = Self::to_batch(&[], schema.clone(), dimension)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            connection
                .create_table(&table_name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| unavailable(format!("Failed to create table {table_name}: {e}")))?
        };

        Ok(Self {
            collection: collection.to_string(),
            dimension,
            table,
        })
    }

    pub async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| unavailable(format!("Failed to count rows: {e}")))
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
            Field::new("session_id", DataType::Utf8, true),
            Field::new("source_task_id", DataType::Utf8, true),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("record", DataType::Utf8, true),
        ]))
    }

    fn to_batch(
        rows: &[(ItemId, &[f32], &IndexMetadata)],
        schema: Arc<Schema>,
        dimension: usize,
    ) -> Result<RecordBatch> {
        let ids: Vec<String> = rows.iter().map(|(id, _, _)| id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let embeddings: Vec<Option<Vec<Option<f32>>>> = rows
            .iter()
            .map(|(_, vector, _)| Some(vector.iter().map(|&v| Some(v)).collect()))
            .collect();

        let sessions: Vec<Option<&str>> = rows
            .iter()
            .map(|(_, _, m)| m.session_id.as_ref().map(SessionId::as_str))
            .collect();

        let tasks: Vec<Option<&str>> = rows
            .iter()
            .map(|(_, _, m)| m.source_task_id.as_deref())
            .collect();

        let created_at: Vec<i64> = rows
            .iter()
            .map(|(_, _, m)| m.created_at.timestamp_micros())
            .collect();

        let records: Vec<Option<&str>> = rows
            .iter()
            .map(|(_, _, m)| m.record.as_deref())
            .collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, dimension as i32)),
                Arc::new(StringArray::from(sessions)),
                Arc::new(StringArray::from(tasks)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(StringArray::from(records)),
            ],
        )
        .map_err(|e| StrataError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    /// Convert one result row back into an id and its metadata
    fn row_to_entry(batch: &RecordBatch, row: usize) -> Result<IndexEntry> {
        let id_array = string_column(batch, "id")?;
        let session_array = string_column(batch, "session_id")?;
        let task_array = string_column(batch, "source_task_id")?;
        let record_array = string_column(batch, "record")?;

        let created_at_array = batch
            .column_by_name("created_at")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMicrosecondArray>())
            .ok_or_else(|| StrataError::Storage("Failed to get created_at column".to_string()))?;

        let id = ItemId::parse(id_array.value(row))
            .map_err(|e| StrataError::Storage(format!("Failed to parse id: {e}")))?;

        let session_id = if session_array.is_null(row) {
            None
        } else {
            Some(
                SessionId::try_from(session_array.value(row))
                    .map_err(|e| StrataError::Storage(format!("Invalid stored session id: {e}")))?,
            )
        };

        let source_task_id = (!task_array.is_null(row)).then(|| task_array.value(row).to_string());
        let record = (!record_array.is_null(row)).then(|| record_array.value(row).to_string());

        let created_at = Utc
            .timestamp_micros(created_at_array.value(row))
            .single()
            .ok_or_else(|| {
                StrataError::Storage("Failed to parse created_at timestamp".to_string())
            })?;

        Ok(IndexEntry {
            id,
            metadata: IndexMetadata {
                session_id,
                source_task_id,
                created_at,
                record,
            },
        })
    }

    /// Convert one result row back into a hit scored against `query`
    fn row_to_hit(batch: &RecordBatch, row: usize, query: &[f32]) -> Result<IndexHit> {
        let entry = Self::row_to_entry(batch, row)?;

        let embedding_array = batch
            .column_by_name("embedding")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| StrataError::Storage("Failed to get embedding column".to_string()))?;
        let embedding_list = embedding_array.value(row);
        let embedding_values = embedding_list
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| StrataError::Storage("Failed to get embedding values".to_string()))?;

        Ok(IndexHit {
            id: entry.id,
            score: cosine_similarity(query, embedding_values.values()),
            metadata: entry.metadata,
        })
    }
}

#[async_trait]
impl SimilarityIndex for LanceIndex {
    async fn upsert(&self, id: ItemId, vector: &[f32], metadata: IndexMetadata) -> Result<()> {
        validate_vector(vector)?;
        if vector.len() != self.dimension {
            return Err(StrataError::Validation(format!(
                "Vector has {} dimensions, collection {} expects {}",
                vector.len(),
                self.collection,
                self.dimension
            )));
        }

        // Delete-then-add keeps one row per id.
        self.table
            .delete(&format!("id = '{id}'"))
            .await
            .map_err(|e| unavailable(format!("Failed to replace {id}: {e}")))?;

        let schema = Self::schema(self.dimension);
        let batch = Self::to_batch(&[(id, vector, &metadata)], schema.clone(), self.dimension)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| unavailable(format!("Failed to insert {id}: {e}")))?;

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut query = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(|e| StrataError::Storage(format!("Failed to create vector query: {e}")))?
            .distance_type(DistanceType::Cosine)
            .limit(top_k);

        if let Some(sql_filter) = filter.to_sql_clause() {
            query = query.only_if(sql_filter);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| unavailable(format!("Failed to execute search: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| unavailable(format!("Failed to collect search results: {e}")))?;

        let mut hits = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                hits.push(Self::row_to_hit(batch, row, vector)?);
            }
        }

        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, id: ItemId) -> Result<bool> {
        let existing = self
            .table
            .count_rows(Some(format!("id = '{id}'")))
            .await
            .map_err(|e| unavailable(format!("Failed to look up {id}: {e}")))?;

        if existing > 0 {
            self.table
                .delete(&format!("id = '{id}'"))
                .await
                .map_err(|e| unavailable(format!("Failed to delete {id}: {e}")))?;
        }

        Ok(existing > 0)
    }

    async fn scan(&self) -> Result<Vec<IndexEntry>> {
        let total = self.count().await?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .limit(total)
            .execute()
            .await
            .map_err(|e| unavailable(format!("Failed to scan {}: {e}", self.collection)))?
            .try_collect()
            .await
            .map_err(|e| unavailable(format!("Failed to collect scan results: {e}")))?;

        let mut entries = Vec::with_capacity(total);
        for batch in &batches {
            for row in 0..batch.num_rows() {
                entries.push(Self::row_to_entry(batch, row)?);
            }
        }
        Ok(entries)
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}

fn unavailable(reason: String) -> StrataError {
    StrataError::unavailable(INDEX_BACKEND, reason)
}

/// LanceDB table names allow alphanumerics, underscores and hyphens.
fn table_name(collection: &str) -> String {
    collection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| StrataError::Storage(format!("Failed to get {name} column")))
}
