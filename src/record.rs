//! Source records: the unit committed to the retrieval index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin system of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Notion,
    Gdrive,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Notion => "notion",
            SourceType::Gdrive => "gdrive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "notion" => Some(SourceType::Notion),
            "gdrive" => Some(SourceType::Gdrive),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Richer structural payload preserved alongside the plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StructuredFormat {
    #[default]
    None,
    Openxml,
}

impl StructuredFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructuredFormat::None => "none",
            StructuredFormat::Openxml => "openxml",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "openxml" => StructuredFormat::Openxml,
            _ => StructuredFormat::None,
        }
    }
}

/// One retrievable chunk with its metadata.
///
/// The parallel `block_*` arrays describe the structural origin of each
/// textual segment inside `text`: block type, sparse marker, nesting depth and
/// the character offset where the segment starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_type: SourceType,
    pub source_id: String,
    /// 0-based, contiguous ordinal within the source.
    pub chunk_ord: u32,
    pub text: String,
    pub title: String,
    pub url: String,
    pub workspace_id: i64,
    pub block_types: Vec<String>,
    pub block_markers: Vec<String>,
    pub block_depths: Vec<u32>,
    pub block_starts: Vec<u32>,
    #[serde(default)]
    pub structured_format: StructuredFormat,
    #[serde(default)]
    pub structured_text: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl SourceRecord {
    /// Deterministic index id: `{source_type}:{source_id}:{chunk_ord}`.
    pub fn record_id(&self) -> String {
        format!("{}:{}:{}", self.source_type, self.source_id, self.chunk_ord)
    }
}

/// Encode a parallel array as a JSON string for the store's scalar-metadata
/// columns.
pub fn encode_array<T: Serialize>(values: &[T]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a scalar-metadata JSON string back into a parallel array.
pub fn decode_array<T: for<'de> Deserialize<'de>>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_default()
}
