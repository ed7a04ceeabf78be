//! Per-workspace hybrid retrieval index.
//!
//! Dense vectors live in a LanceDB table, keywords in a BM25 sidecar; both
//! are colocated under the workspace storage root. Writes are scoped by
//! `(source_type, source_id)` with replace-by-source semantics: readers
//! observe either the old complete set or the new complete set for a source.

pub mod bm25;
pub mod table;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{Error, IndexError, Result};
use crate::record::{SourceRecord, SourceType};
use crate::workspace::WorkspaceContext;
use bm25::Bm25Index;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use table::{source_predicate, RecordTable};
use tokio::sync::RwLock;

/// Retrieval strategy for `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStrategy {
    Vector,
    Keyword,
    #[default]
    Hybrid,
}

/// Search parameters; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub k: Option<usize>,
    pub alpha: Option<f32>,
    pub rrf_k: Option<u32>,
    pub strategy: SearchStrategy,
}

/// One search hit with its fused (or strategy-native) score.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: SourceRecord,
    pub score: f32,
}

/// Citation metadata surfaced alongside answers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Citation {
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub chunk_id: String,
    pub chunk_ord: u32,
    pub score: f32,
    pub snippet: String,
    /// 1-based `[N]` index of the context block this citation backs.
    pub context_index: Option<usize>,
}

/// Prompt context assembled from search hits.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub context: String,
    pub citations: Vec<Citation>,
}

/// Live index counts: distinct sources and total records.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexCounts {
    pub object_count: usize,
    pub vector_count: usize,
}

/// Maximum characters of assembled context handed to the LLM.
const CONTEXT_CHAR_BUDGET: usize = 12_000;
/// Characters of record text quoted per context block.
const CONTEXT_SNIPPET_CHARS: usize = 1_200;
/// Characters per citation snippet.
const CITATION_SNIPPET_CHARS: usize = 360;

/// Hybrid (vector + BM25) retrieval store for one workspace.
pub struct RetrievalIndex {
    connection: lancedb::Connection,
    table: RwLock<Option<RecordTable>>,
    bm25: RwLock<Bm25Index>,
    bm25_path: PathBuf,
    embedder: Arc<dyn Embedder>,
    defaults: RetrievalConfig,
}

impl RetrievalIndex {
    /// Open the workspace index, creating storage directories as needed.
    pub async fn open(
        workspace: &WorkspaceContext,
        embedder: Arc<dyn Embedder>,
        defaults: RetrievalConfig,
    ) -> Result<Self> {
        workspace
            .ensure_storage()
            .map_err(|e| IndexError::Store(e.to_string()))?;

        let vector_dir = workspace.vector_dir();
        let connection = lancedb::connect(
            vector_dir
                .to_str()
                .ok_or_else(|| IndexError::Store("non-utf8 storage path".into()))?,
        )
        .execute()
        .await
        .map_err(|e| IndexError::Store(e.to_string()))?;

        let table = RecordTable::open_existing(&connection).await?;
        let bm25_path = workspace.bm25_path();
        let mut keyword_index = Bm25Index::load(&bm25_path);

        // A missing or stale sidecar is rebuilt from the table so keyword
        // search stays consistent with the dense store.
        if let Some(ref table) = table {
            if keyword_index.doc_count() == 0 {
                let docs = table.all_texts().await?;
                if !docs.is_empty() {
                    tracing::info!(docs = docs.len(), "rebuilding bm25 sidecar from record table");
                    for (id, text) in docs {
                        keyword_index.add_document(&id, &text);
                    }
                    if let Err(error) = keyword_index.save(&bm25_path) {
                        tracing::warn!(%error, "failed to persist rebuilt bm25 sidecar");
                    }
                }
            }
        }

        Ok(Self {
            connection,
            table: RwLock::new(table),
            bm25: RwLock::new(keyword_index),
            bm25_path,
            embedder,
            defaults,
        })
    }

    /// Atomically (from a reader's perspective) replace every record of one
    /// source: upsert the new set under deterministic ids, then delete
    /// pre-existing ids not in it. Returns the number of committed records.
    ///
    /// Concurrent `replace` of the same source is forbidden by caller-side
    /// per-workspace sequencing.
    pub async fn replace(
        &self,
        source_type: SourceType,
        source_id: &str,
        records: Vec<SourceRecord>,
    ) -> Result<usize> {
        let records: Vec<SourceRecord> = records
            .into_iter()
            .filter(|r| !r.text.trim().is_empty())
            .collect();

        if records.is_empty() {
            self.delete_by_source(source_type, source_id).await?;
            return Ok(0);
        }

        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != records.len() {
            return Err(crate::error::LlmError::EmbeddingFailed(format!(
                "embedder returned {} vectors for {} records",
                vectors.len(),
                records.len()
            ))
            .into());
        }
        let dim = vectors
            .first()
            .map(Vec::len)
            .filter(|d| *d > 0)
            .ok_or_else(|| {
                crate::error::LlmError::EmbeddingFailed("embedder returned empty vector".into())
            })?;

        let table = self.table_for_write(dim).await?;

        let predicate = source_predicate(source_type, source_id);
        let old_ids = table.ids_where(&predicate).await?;
        let new_ids: HashSet<String> = records.iter().map(|r| r.record_id()).collect();

        table.upsert(&records, &vectors).await?;

        let stale: Vec<String> = old_ids
            .into_iter()
            .filter(|id| !new_ids.contains(id))
            .collect();
        if !stale.is_empty() {
            let quoted = stale
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(", ");
            table.delete_where(&format!("id IN ({quoted})")).await?;
        }

        {
            let mut keyword_index = self.bm25.write().await;
            for id in &stale {
                keyword_index.remove_document(id);
            }
            for record in &records {
                keyword_index.add_document(&record.record_id(), &record.text);
            }
            if let Err(error) = keyword_index.save(&self.bm25_path) {
                tracing::warn!(%error, "failed to persist bm25 sidecar");
            }
        }

        tracing::debug!(
            source_type = source_type.as_str(),
            source_id,
            records = records.len(),
            removed_stale = stale.len(),
            "source replaced in index"
        );
        Ok(records.len())
    }

    /// Remove all records of one source from both indices.
    pub async fn delete_by_source(&self, source_type: SourceType, source_id: &str) -> Result<usize> {
        self.delete_where(&source_predicate(source_type, source_id))
            .await
    }

    /// Bulk removal of every record of a source type (disconnect flow).
    pub async fn delete_by_source_type(&self, source_type: SourceType) -> Result<usize> {
        self.delete_where(&format!("source_type = '{}'", source_type.as_str()))
            .await
    }

    async fn delete_where(&self, predicate: &str) -> Result<usize> {
        let guard = self.table.read().await;
        let Some(table) = guard.as_ref() else {
            return Ok(0);
        };
        let ids = table.ids_where(predicate).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        table.delete_where(predicate).await?;

        let mut keyword_index = self.bm25.write().await;
        for id in &ids {
            keyword_index.remove_document(id);
        }
        if let Err(error) = keyword_index.save(&self.bm25_path) {
            tracing::warn!(%error, "failed to persist bm25 sidecar");
        }
        Ok(ids.len())
    }

    /// Vector dimension recorded on first write, if any.
    pub async fn dim(&self) -> Option<usize> {
        self.table.read().await.as_ref().map(|t| t.dim())
    }

    /// Live counts for the index metadata row.
    pub async fn counts(&self) -> Result<IndexCounts> {
        let guard = self.table.read().await;
        let Some(table) = guard.as_ref() else {
            return Ok(IndexCounts::default());
        };
        Ok(IndexCounts {
            object_count: table.source_keys().await?.len(),
            vector_count: table.count().await?,
        })
    }

    async fn table_for_write(&self, dim: usize) -> Result<RecordTable> {
        {
            let guard = self.table.read().await;
            if let Some(table) = guard.as_ref() {
                if table.dim() != dim {
                    return Err(IndexError::DimMismatch {
                        expected: table.dim(),
                        got: dim,
                    }
                    .into());
                }
                return Ok(table.clone());
            }
        }

        let mut guard = self.table.write().await;
        if guard.is_none() {
            let table = RecordTable::open_or_create(&self.connection, dim).await?;
            *guard = Some(table);
        }
        let table = guard.as_ref().cloned().ok_or_else(|| {
            Error::from(IndexError::Store("record table unavailable".into()))
        })?;
        if table.dim() != dim {
            return Err(IndexError::DimMismatch {
                expected: table.dim(),
                got: dim,
            }
            .into());
        }
        Ok(table)
    }

    /// Top-k search with the requested strategy.
    ///
    /// `k` clamps to `[1, 10]`; out-of-range `alpha` falls back to the
    /// configured default; `rrf_k` is at least 1. Ties on equal score break
    /// deterministically by `source_id` then `chunk_ord` ascending.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredRecord>> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query is empty".into()));
        }

        let k = options.k.unwrap_or(self.defaults.top_k).clamp(1, 10);
        let mut alpha = options.alpha.unwrap_or(self.defaults.hybrid_alpha);
        if !(alpha > 0.0 && alpha <= 1.0) {
            alpha = self.defaults.hybrid_alpha;
        }
        let rrf_k = options.rrf_k.unwrap_or(self.defaults.hybrid_rrf_k).max(1) as f32;

        // Oversample so fusion has room to disagree with either ranking.
        let pool = k.max((k as f32 / alpha).ceil() as usize);

        let mut hits = match options.strategy {
            SearchStrategy::Vector => {
                let ranked = self.vector_ranked(query, pool).await?;
                ranked
                    .into_iter()
                    .map(|(record, distance)| ScoredRecord {
                        record,
                        score: (1.0 - distance).clamp(0.0, 1.0),
                    })
                    .collect::<Vec<_>>()
            }
            SearchStrategy::Keyword => {
                let ranked = self.keyword_ranked(query, pool).await?;
                ranked
                    .into_iter()
                    .map(|(record, score)| ScoredRecord { record, score })
                    .collect::<Vec<_>>()
            }
            SearchStrategy::Hybrid => self.hybrid_ranked(query, pool, alpha, rrf_k).await?,
        };

        sort_deterministic(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn vector_ranked(&self, query: &str, pool: usize) -> Result<Vec<(SourceRecord, f32)>> {
        let guard = self.table.read().await;
        let Some(table) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                crate::error::LlmError::EmbeddingFailed("embedder returned no vector".into())
            })?;
        table.vector_search(&embedding, pool).await
    }

    async fn keyword_ranked(&self, query: &str, pool: usize) -> Result<Vec<(SourceRecord, f32)>> {
        let ranked_ids = {
            let keyword_index = self.bm25.read().await;
            keyword_index.search(query, pool)
        };
        if ranked_ids.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.table.read().await;
        let Some(table) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = ranked_ids.iter().map(|(id, _)| id.clone()).collect();
        let records = table.records_by_ids(&ids).await?;
        let scores: HashMap<&str, f32> = ranked_ids
            .iter()
            .map(|(id, score)| (id.as_str(), *score))
            .collect();
        Ok(records
            .into_iter()
            .map(|record| {
                let score = scores.get(record.record_id().as_str()).copied().unwrap_or(0.0);
                (record, score)
            })
            .collect())
    }

    async fn hybrid_ranked(
        &self,
        query: &str,
        pool: usize,
        alpha: f32,
        rrf_k: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let vector_hits = self.vector_ranked(query, pool).await?;
        // Keyword failure degrades to vector-only rather than failing the search.
        let keyword_hits = match self.keyword_ranked(query, pool).await {
            Ok(hits) => hits,
            Err(error) => {
                tracing::warn!(%error, "keyword search failed, continuing with vector results only");
                Vec::new()
            }
        };

        let mut records: HashMap<String, SourceRecord> = HashMap::new();
        let mut fused: HashMap<String, f32> = HashMap::new();

        for (rank, (record, _distance)) in vector_hits.into_iter().enumerate() {
            let id = record.record_id();
            fused.insert(id.clone(), alpha / (rrf_k + rank as f32 + 1.0));
            records.entry(id).or_insert(record);
        }
        for (rank, (record, _score)) in keyword_hits.into_iter().enumerate() {
            let id = record.record_id();
            *fused.entry(id.clone()).or_insert(0.0) += (1.0 - alpha) / (rrf_k + rank as f32 + 1.0);
            records.entry(id).or_insert(record);
        }

        Ok(fused
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .filter_map(|(id, score)| {
                records.remove(&id).map(|record| ScoredRecord { record, score })
            })
            .collect())
    }
}

fn sort_deterministic(hits: &mut [ScoredRecord]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.source_id.cmp(&b.record.source_id))
            .then_with(|| a.record.chunk_ord.cmp(&b.record.chunk_ord))
    });
}

/// Assemble the `[N] Title / URL / body` prompt context and citations from
/// ranked hits, dropping lowest-ranked records until the character budget is
/// met.
pub fn build_context(hits: &[ScoredRecord]) -> ContextBundle {
    let mut kept = hits.len();
    let mut context = render_context(&hits[..kept]);
    while context.chars().count() > CONTEXT_CHAR_BUDGET && kept > 1 {
        kept -= 1;
        context = render_context(&hits[..kept]);
    }

    let mut citations: Vec<Citation> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (index, hit) in hits[..kept].iter().enumerate() {
        let chunk_id = hit.record.record_id();
        if !seen.insert(chunk_id.clone()) {
            continue;
        }
        let collapsed = hit.record.text.split_whitespace().collect::<Vec<_>>().join(" ");
        citations.push(Citation {
            source_id: hit.record.source_id.clone(),
            title: hit.record.title.clone(),
            url: hit.record.url.clone(),
            chunk_id,
            chunk_ord: hit.record.chunk_ord,
            score: hit.score,
            snippet: truncate_chars(&collapsed, CITATION_SNIPPET_CHARS),
            context_index: Some(index + 1),
        });
    }

    ContextBundle { context, citations }
}

fn render_context(hits: &[ScoredRecord]) -> String {
    let mut sections = Vec::with_capacity(hits.len());
    for (index, hit) in hits.iter().enumerate() {
        let title = if hit.record.title.trim().is_empty() {
            "Untitled"
        } else {
            hit.record.title.as_str()
        };
        let url = if hit.record.url.trim().is_empty() {
            "(no url)"
        } else {
            hit.record.url.as_str()
        };
        sections.push(format!(
            "[{}] Title: {}\nURL: {}\nContent:\n{}",
            index + 1,
            title,
            url,
            truncate_chars(&hit.record.text, CONTEXT_SNIPPET_CHARS),
        ));
    }
    sections.join("\n\n")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StructuredFormat;
    use chrono::Utc;

    fn record(source_id: &str, chunk_ord: u32, text: &str) -> SourceRecord {
        SourceRecord {
            source_type: SourceType::Notion,
            source_id: source_id.into(),
            chunk_ord,
            text: text.into(),
            title: format!("Title {source_id}"),
            url: format!("https://notion.so/{source_id}"),
            workspace_id: 1,
            block_types: vec!["paragraph".into()],
            block_markers: vec!["P".into()],
            block_depths: vec![0],
            block_starts: vec![0],
            structured_format: StructuredFormat::None,
            structured_text: None,
            file_path: None,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn sort_breaks_ties_by_source_id_then_ord() {
        let mut hits = vec![
            ScoredRecord {
                record: record("b", 0, "x"),
                score: 0.5,
            },
            ScoredRecord {
                record: record("a", 1, "x"),
                score: 0.5,
            },
            ScoredRecord {
                record: record("a", 0, "x"),
                score: 0.5,
            },
        ];
        sort_deterministic(&mut hits);
        assert_eq!(hits[0].record.source_id, "a");
        assert_eq!(hits[0].record.chunk_ord, 0);
        assert_eq!(hits[1].record.chunk_ord, 1);
        assert_eq!(hits[2].record.source_id, "b");
    }

    #[test]
    fn context_respects_char_budget() {
        let big = "word ".repeat(3000);
        let hits: Vec<ScoredRecord> = (0..12)
            .map(|i| ScoredRecord {
                record: record(&format!("s{i:02}"), 0, &big),
                score: 1.0 - i as f32 * 0.01,
            })
            .collect();
        let bundle = build_context(&hits);
        assert!(bundle.context.chars().count() <= super::CONTEXT_CHAR_BUDGET + 2);
        assert!(bundle.citations.len() < hits.len());
    }

    #[test]
    fn citations_dedup_by_chunk_and_number_context_blocks() {
        let hits = vec![
            ScoredRecord {
                record: record("a", 0, "first chunk body"),
                score: 0.9,
            },
            ScoredRecord {
                record: record("b", 0, "second chunk body"),
                score: 0.8,
            },
        ];
        let bundle = build_context(&hits);
        assert_eq!(bundle.citations.len(), 2);
        assert_eq!(bundle.citations[0].context_index, Some(1));
        assert_eq!(bundle.citations[1].context_index, Some(2));
        assert!(bundle.context.contains("[1] Title: Title a"));
        assert!(bundle.context.contains("[2] Title: Title b"));
    }
}
