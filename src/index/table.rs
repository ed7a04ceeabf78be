//! LanceDB table holding source records: dense vectors plus scalar metadata
//! columns.
//!
//! The vector dimension is fixed when the table is first created; later
//! writes of a different dimension are rejected with `DIM_MISMATCH`.

use crate::error::{IndexError, Result};
use crate::record::{decode_array, SourceRecord, SourceType, StructuredFormat};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Int64Type};
use arrow_array::{Array, FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

const TABLE_NAME: &str = "records";

/// Columns fetched when materializing full records.
const RECORD_COLUMNS: [&str; 16] = [
    "id",
    "source_type",
    "source_id",
    "chunk_ord",
    "text",
    "title",
    "url",
    "workspace_id",
    "block_types",
    "block_markers",
    "block_depths",
    "block_starts",
    "structured_format",
    "structured_text",
    "file_path",
    "ingested_at",
];

/// LanceDB-backed record table for one workspace.
pub struct RecordTable {
    table: lancedb::Table,
    dim: i32,
}

impl Clone for RecordTable {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            dim: self.dim,
        }
    }
}

impl RecordTable {
    /// Open the existing table if present, reading its recorded dimension.
    pub async fn open_existing(connection: &lancedb::Connection) -> Result<Option<Self>> {
        let table = match connection.open_table(TABLE_NAME).execute().await {
            Ok(table) => table,
            Err(error) => {
                tracing::debug!(%error, "records table not openable");
                return Ok(None);
            }
        };
        let schema = table
            .schema()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;
        let dim = schema
            .fields()
            .iter()
            .find(|f| f.name() == "embedding")
            .and_then(|f| match f.data_type() {
                arrow_schema::DataType::FixedSizeList(_, n) => Some(*n),
                _ => None,
            })
            .ok_or_else(|| IndexError::Store("records table has no embedding column".into()))?;
        Ok(Some(Self { table, dim }))
    }

    /// Open the table, creating it with the given dimension when absent.
    ///
    /// A table that exists but cannot be opened (process killed mid-write) is
    /// dropped and recreated; its sources need re-ingesting.
    pub async fn open_or_create(connection: &lancedb::Connection, dim: usize) -> Result<Self> {
        if let Some(table) = Self::open_existing(connection).await? {
            if table.dim as usize != dim {
                return Err(IndexError::DimMismatch {
                    expected: table.dim as usize,
                    got: dim,
                }
                .into());
            }
            return Ok(table);
        }

        match Self::create_empty(connection, dim).await {
            Ok(table) => return Ok(table),
            Err(error) => {
                tracing::warn!(
                    %error,
                    "failed to create records table, attempting recovery from corrupted state"
                );
            }
        }

        if let Err(error) = connection.drop_table(TABLE_NAME).await {
            tracing::warn!(%error, "drop_table failed during recovery, proceeding anyway");
        }
        let table = Self::create_empty(connection, dim).await?;
        tracing::info!("records table recovered, sources need re-indexing");
        Ok(table)
    }

    async fn create_empty(connection: &lancedb::Connection, dim: usize) -> Result<Self> {
        let schema = Self::schema(dim as i32);
        let batches = RecordBatchIterator::new(vec![].into_iter().map(Ok), Arc::new(schema));
        let table = connection
            .create_table(TABLE_NAME, Box::new(batches))
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;
        Ok(Self {
            table,
            dim: dim as i32,
        })
    }

    /// Vector dimension recorded by the table.
    pub fn dim(&self) -> usize {
        self.dim as usize
    }

    fn schema(dim: i32) -> arrow_schema::Schema {
        use arrow_schema::{DataType, Field};
        arrow_schema::Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("source_type", DataType::Utf8, false),
            Field::new("source_id", DataType::Utf8, false),
            Field::new("chunk_ord", DataType::Int64, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("url", DataType::Utf8, false),
            Field::new("workspace_id", DataType::Int64, false),
            Field::new("block_types", DataType::Utf8, false),
            Field::new("block_markers", DataType::Utf8, false),
            Field::new("block_depths", DataType::Utf8, false),
            Field::new("block_starts", DataType::Utf8, false),
            Field::new("structured_format", DataType::Utf8, false),
            Field::new("structured_text", DataType::Utf8, true),
            Field::new("file_path", DataType::Utf8, true),
            Field::new("ingested_at", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim),
                false,
            ),
        ])
    }

    /// Upsert records by deterministic id (matched rows updated, new rows
    /// inserted).
    pub async fn upsert(&self, records: &[SourceRecord], vectors: &[Vec<f32>]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for vector in vectors {
            if vector.len() != self.dim as usize {
                return Err(IndexError::DimMismatch {
                    expected: self.dim as usize,
                    got: vector.len(),
                }
                .into());
            }
        }

        let batch = self.build_batch(records, vectors)?;
        let batches =
            RecordBatchIterator::new(vec![Ok(batch)], Arc::new(Self::schema(self.dim)));

        let mut merge = self.table.merge_insert(&["id"]);
        merge.when_matched_update_all(None);
        merge.when_not_matched_insert_all();
        merge
            .execute(Box::new(batches))
            .await
            .map_err(|e| IndexError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn build_batch(&self, records: &[SourceRecord], vectors: &[Vec<f32>]) -> Result<RecordBatch> {
        use crate::record::encode_array;

        let ids: Vec<String> = records.iter().map(|r| r.record_id()).collect();
        let id_array = StringArray::from(ids);
        let source_types =
            StringArray::from(records.iter().map(|r| r.source_type.as_str()).collect::<Vec<_>>());
        let source_ids =
            StringArray::from(records.iter().map(|r| r.source_id.as_str()).collect::<Vec<_>>());
        let chunk_ords =
            Int64Array::from(records.iter().map(|r| r.chunk_ord as i64).collect::<Vec<_>>());
        let texts = StringArray::from(records.iter().map(|r| r.text.as_str()).collect::<Vec<_>>());
        let titles = StringArray::from(records.iter().map(|r| r.title.as_str()).collect::<Vec<_>>());
        let urls = StringArray::from(records.iter().map(|r| r.url.as_str()).collect::<Vec<_>>());
        let workspace_ids =
            Int64Array::from(records.iter().map(|r| r.workspace_id).collect::<Vec<_>>());
        let block_types =
            StringArray::from(records.iter().map(|r| encode_array(&r.block_types)).collect::<Vec<_>>());
        let block_markers = StringArray::from(
            records.iter().map(|r| encode_array(&r.block_markers)).collect::<Vec<_>>(),
        );
        let block_depths = StringArray::from(
            records.iter().map(|r| encode_array(&r.block_depths)).collect::<Vec<_>>(),
        );
        let block_starts = StringArray::from(
            records.iter().map(|r| encode_array(&r.block_starts)).collect::<Vec<_>>(),
        );
        let structured_formats = StringArray::from(
            records.iter().map(|r| r.structured_format.as_str()).collect::<Vec<_>>(),
        );
        let structured_texts = StringArray::from(
            records.iter().map(|r| r.structured_text.clone()).collect::<Vec<Option<String>>>(),
        );
        let file_paths = StringArray::from(
            records.iter().map(|r| r.file_path.clone()).collect::<Vec<Option<String>>>(),
        );
        let ingested_ats = StringArray::from(
            records.iter().map(|r| r.ingested_at.to_rfc3339()).collect::<Vec<_>>(),
        );

        let embeddings = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            vectors
                .iter()
                .map(|v| Some(v.iter().map(|x| Some(*x)).collect::<Vec<_>>())),
            self.dim,
        );

        RecordBatch::try_new(
            Arc::new(Self::schema(self.dim)),
            vec![
                Arc::new(id_array) as arrow_array::ArrayRef,
                Arc::new(source_types),
                Arc::new(source_ids),
                Arc::new(chunk_ords),
                Arc::new(texts),
                Arc::new(titles),
                Arc::new(urls),
                Arc::new(workspace_ids),
                Arc::new(block_types),
                Arc::new(block_markers),
                Arc::new(block_depths),
                Arc::new(block_starts),
                Arc::new(structured_formats),
                Arc::new(structured_texts),
                Arc::new(file_paths),
                Arc::new(ingested_ats),
                Arc::new(embeddings),
            ],
        )
        .map_err(|e| IndexError::WriteFailed(e.to_string()).into())
    }

    /// Delete rows matching a SQL predicate.
    pub async fn delete_where(&self, predicate: &str) -> Result<()> {
        self.table
            .delete(predicate)
            .await
            .map_err(|e| IndexError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Record ids matching a predicate.
    pub async fn ids_where(&self, predicate: &str) -> Result<Vec<String>> {
        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .only_if(predicate.to_string())
            .select(lancedb::query::Select::columns(&["id"]))
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;

        let mut ids = Vec::new();
        for batch in batches {
            if let Some(column) = batch.column_by_name("id") {
                let values: &StringArray = column.as_string::<i32>();
                for i in 0..values.len() {
                    if values.is_valid(i) {
                        ids.push(values.value(i).to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Materialize full records for the given ids, preserving input order.
    pub async fn records_by_ids(&self, ids: &[String]) -> Result<Vec<SourceRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let quoted = ids
            .iter()
            .map(|id| format!("'{}'", id.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = format!("id IN ({quoted})");

        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .only_if(predicate)
            .select(lancedb::query::Select::columns(&RECORD_COLUMNS))
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;

        let mut by_id = std::collections::HashMap::new();
        for batch in &batches {
            for (_, record) in decode_records(batch) {
                by_id.insert(record.record_id(), record);
            }
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Nearest-neighbor search by cosine distance. Returns
    /// `(record, distance)` pairs, distance ascending.
    pub async fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(SourceRecord, f32)>> {
        if query.len() != self.dim as usize {
            return Err(IndexError::DimMismatch {
                expected: self.dim as usize,
                got: query.len(),
            }
            .into());
        }

        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .nearest_to(query)
            .map_err(|e| IndexError::Store(e.to_string()))?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;

        let mut results = Vec::new();
        for batch in &batches {
            let records = decode_records(batch);
            if let Some(distances) = batch.column_by_name("_distance") {
                let distances: &arrow_array::PrimitiveArray<Float32Type> =
                    distances.as_primitive();
                for (row, record) in records {
                    if distances.is_valid(row) {
                        results.push((record, distances.value(row)));
                    }
                }
            }
        }
        Ok(results)
    }

    /// Stream `(id, text)` pairs for every record (keyword-index rebuild).
    pub async fn all_texts(&self) -> Result<Vec<(String, String)>> {
        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .select(lancedb::query::Select::columns(&["id", "text"]))
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;

        let mut out = Vec::new();
        for batch in batches {
            if let (Some(id_col), Some(text_col)) =
                (batch.column_by_name("id"), batch.column_by_name("text"))
            {
                let ids: &StringArray = id_col.as_string::<i32>();
                let texts: &StringArray = text_col.as_string::<i32>();
                for i in 0..ids.len() {
                    if ids.is_valid(i) && texts.is_valid(i) {
                        out.push((ids.value(i).to_string(), texts.value(i).to_string()));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Distinct `(source_type, source_id)` pairs currently live.
    pub async fn source_keys(&self) -> Result<Vec<(String, String)>> {
        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .select(lancedb::query::Select::columns(&["source_type", "source_id"]))
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;

        let mut seen = std::collections::BTreeSet::new();
        for batch in batches {
            if let (Some(type_col), Some(id_col)) = (
                batch.column_by_name("source_type"),
                batch.column_by_name("source_id"),
            ) {
                let types: &StringArray = type_col.as_string::<i32>();
                let ids: &StringArray = id_col.as_string::<i32>();
                for i in 0..types.len() {
                    if types.is_valid(i) && ids.is_valid(i) {
                        seen.insert((types.value(i).to_string(), ids.value(i).to_string()));
                    }
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Total record count.
    pub async fn count(&self) -> Result<usize> {
        let batches: Vec<RecordBatch> = self
            .table
            .query()
            .select(lancedb::query::Select::columns(&["id"]))
            .execute()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| IndexError::Store(e.to_string()))?;
        Ok(batches.iter().map(|b| b.num_rows()).sum())
    }

    /// Create the vector index, ignoring "already exists" errors.
    pub async fn create_vector_index(&self) -> Result<()> {
        match self
            .table
            .create_index(&["embedding"], lancedb::index::Index::Auto)
            .execute()
            .await
        {
            Ok(()) => tracing::debug!("vector index created on embedding column"),
            Err(error) => {
                let message = error.to_string();
                if message.contains("already") || message.contains("index") {
                    tracing::trace!("vector index already exists");
                } else {
                    return Err(IndexError::Store(format!(
                        "failed to create vector index: {message}"
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// SQL predicate selecting all rows of one source.
pub fn source_predicate(source_type: SourceType, source_id: &str) -> String {
    format!(
        "source_type = '{}' AND source_id = '{}'",
        source_type.as_str(),
        source_id.replace('\'', "''")
    )
}

/// Decode full records from a batch, keyed by their row index. Rows with an
/// unknown source type are dropped.
fn decode_records(batch: &RecordBatch) -> Vec<(usize, SourceRecord)> {
    let get_string = |name: &str| -> Option<&StringArray> {
        batch.column_by_name(name).map(|c| c.as_string::<i32>())
    };

    let (
        Some(source_types),
        Some(source_ids),
        Some(texts),
        Some(titles),
        Some(urls),
        Some(block_types),
        Some(block_markers),
        Some(block_depths),
        Some(block_starts),
        Some(structured_formats),
        Some(structured_texts),
        Some(file_paths),
        Some(ingested_ats),
    ) = (
        get_string("source_type"),
        get_string("source_id"),
        get_string("text"),
        get_string("title"),
        get_string("url"),
        get_string("block_types"),
        get_string("block_markers"),
        get_string("block_depths"),
        get_string("block_starts"),
        get_string("structured_format"),
        get_string("structured_text"),
        get_string("file_path"),
        get_string("ingested_at"),
    )
    else {
        return Vec::new();
    };
    let (Some(chunk_ords), Some(workspace_ids)) = (
        batch
            .column_by_name("chunk_ord")
            .map(|c| c.as_primitive::<Int64Type>()),
        batch
            .column_by_name("workspace_id")
            .map(|c| c.as_primitive::<Int64Type>()),
    ) else {
        return Vec::new();
    };

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let Some(source_type) = SourceType::parse(source_types.value(i)) else {
            continue;
        };
        let ingested_at = DateTime::parse_from_rfc3339(ingested_ats.value(i))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        records.push((i, SourceRecord {
            source_type,
            source_id: source_ids.value(i).to_string(),
            chunk_ord: chunk_ords.value(i) as u32,
            text: texts.value(i).to_string(),
            title: titles.value(i).to_string(),
            url: urls.value(i).to_string(),
            workspace_id: workspace_ids.value(i),
            block_types: decode_array(block_types.value(i)),
            block_markers: decode_array(block_markers.value(i)),
            block_depths: decode_array(block_depths.value(i)),
            block_starts: decode_array(block_starts.value(i)),
            structured_format: StructuredFormat::parse(structured_formats.value(i)),
            structured_text: if structured_texts.is_valid(i) {
                Some(structured_texts.value(i).to_string())
            } else {
                None
            },
            file_path: if file_paths.is_valid(i) {
                Some(file_paths.value(i).to_string())
            } else {
                None
            },
            ingested_at,
        }));
    }
    records
}
