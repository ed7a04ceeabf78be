//! Shared pieces of the two sync pipelines: record assembly from chunk
//! drafts, skip reporting, and JSONL audit output.

use crate::chunk::ChunkDraft;
use crate::record::{SourceRecord, SourceType, StructuredFormat};
use chrono::Utc;
use std::path::Path;

/// A source that failed or produced nothing; reported, never fatal to the
/// batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkippedSource {
    pub source_id: String,
    pub reason: String,
}

/// Source-level fields shared by every record of one source.
#[derive(Debug, Clone)]
pub struct RecordSource {
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub workspace_id: i64,
    pub structured_format: StructuredFormat,
    pub structured_text: Option<String>,
    pub file_path: Option<String>,
}

impl RecordSource {
    pub fn plain(
        source_type: SourceType,
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        workspace_id: i64,
    ) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            workspace_id,
            structured_format: StructuredFormat::None,
            structured_text: None,
            file_path: None,
        }
    }
}

/// Turn chunk drafts into records with contiguous `chunk_ord` starting at 0.
///
/// The structured payload rides on the first chunk only; the format flag and
/// file path are stamped on every record of the source.
pub fn build_records(source: &RecordSource, drafts: Vec<ChunkDraft>) -> Vec<SourceRecord> {
    let now = Utc::now();
    drafts
        .into_iter()
        .enumerate()
        .map(|(ord, draft)| SourceRecord {
            source_type: source.source_type,
            source_id: source.source_id.clone(),
            chunk_ord: ord as u32,
            text: draft.text,
            title: source.title.clone(),
            url: source.url.clone(),
            workspace_id: source.workspace_id,
            block_types: draft.spans.iter().map(|s| s.block_type.clone()).collect(),
            block_markers: draft.spans.iter().map(|s| s.marker.clone()).collect(),
            block_depths: draft.spans.iter().map(|s| s.depth).collect(),
            block_starts: draft.spans.iter().map(|s| s.start).collect(),
            structured_format: source.structured_format,
            structured_text: if ord == 0 {
                source.structured_text.clone()
            } else {
                None
            },
            file_path: source.file_path.clone(),
            ingested_at: now,
        })
        .collect()
}

/// Write the run's records to a JSONL audit file, one record per line.
pub fn write_jsonl_audit(path: &Path, records: &[SourceRecord]) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    Ok(())
}
