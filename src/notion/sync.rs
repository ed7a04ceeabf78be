//! Notion sync worker: full and incremental page pull into the retrieval
//! index.
//!
//! Enumeration walks the bot-visible page listing (sorted by last edit,
//! descending) and is resumable from the persisted cursor. A rate-limited
//! response parks the worker until the provider's retry window passes, then
//! re-enters enumeration from the same cursor.

use crate::chunk::assemble_chunks;
use crate::config::ChunkConfig;
use crate::db::Database;
use crate::error::{Error, ProviderError, Result};
use crate::index::RetrievalIndex;
use crate::ingest::{build_records, write_jsonl_audit, RecordSource, SkippedSource};
use crate::notion::client::{compose_page_url, NotionApi, PageMeta};
use crate::notion::render::render_segments;
use crate::record::{SourceRecord, SourceType};
use crate::workspace::WorkspaceContext;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Full reindex or change-driven pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Aggregated result of one pull.
#[derive(Debug, Default)]
pub struct NotionSyncReport {
    pub ingested_chunks: usize,
    pub pages_synced: usize,
    pub skipped: Vec<SkippedSource>,
}

pub struct NotionSyncWorker {
    api: Arc<dyn NotionApi>,
    db: Database,
    chunking: ChunkConfig,
}

impl NotionSyncWorker {
    pub fn new(api: Arc<dyn NotionApi>, db: Database, chunking: ChunkConfig) -> Self {
        Self { api, db, chunking }
    }

    /// Pull pages into the workspace index.
    ///
    /// Per-page failures land in `skipped` and do not abort the batch.
    /// Cancellation aborts in-flight work without advancing sync state.
    pub async fn pull(
        &self,
        workspace: &WorkspaceContext,
        index: &RetrievalIndex,
        data_source_id: i64,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<NotionSyncReport> {
        let mut state = self.db.notion_sync_state(data_source_id).await?;
        let since = match mode {
            SyncMode::Full => None,
            SyncMode::Incremental => state.since,
        };

        // Honor a previously recorded rate-limit window before re-entering
        // enumeration.
        if let Some(until) = state.rate_limited_until {
            let now = Utc::now();
            if until > now {
                let wait = (until - now).to_std().unwrap_or_default();
                tracing::info!(?wait, "notion sync parked by earlier rate limit");
                sleep_cancellable(wait, cancel).await?;
            }
            state.rate_limited_until = None;
        }

        let mut report = NotionSyncReport::default();
        let mut audit: Vec<SourceRecord> = Vec::new();
        let mut cursor = state.next_cursor.clone();
        let mut max_edited: Option<DateTime<Utc>> = None;

        'enumerate: loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let batch = match self.api.search_pages(cursor.as_deref()).await {
                Ok(batch) => batch,
                Err(Error::Provider(ProviderError::RateLimited { retry_after_secs })) => {
                    state.rate_limited_until =
                        Some(Utc::now() + ChronoDuration::seconds(retry_after_secs as i64));
                    state.next_cursor = cursor.clone();
                    self.db.save_notion_sync_state(&state).await?;
                    tracing::warn!(retry_after_secs, "notion rate limited, backing off");
                    sleep_cancellable(
                        std::time::Duration::from_secs(retry_after_secs),
                        cancel,
                    )
                    .await?;
                    state.rate_limited_until = None;
                    continue;
                }
                Err(err) => return Err(err),
            };

            for page in &batch.pages {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                // Results are sorted by last edit descending, so the first
                // page at or before the watermark ends the incremental walk.
                if let (Some(since), Some(edited)) = (since, page.last_edited_time) {
                    if edited <= since {
                        break 'enumerate;
                    }
                }

                let mut attempt = self.sync_page(workspace, index, page).await;
                if let Err(Error::Provider(ProviderError::RateLimited { retry_after_secs })) =
                    attempt
                {
                    tracing::warn!(
                        page_id = %page.id,
                        retry_after_secs,
                        "notion rate limited mid-page, backing off"
                    );
                    sleep_cancellable(
                        std::time::Duration::from_secs(retry_after_secs),
                        cancel,
                    )
                    .await?;
                    attempt = self.sync_page(workspace, index, page).await;
                }

                match attempt {
                    Ok((count, records)) => {
                        if count == 0 {
                            report.skipped.push(SkippedSource {
                                source_id: page.id.clone(),
                                reason: "page produced no indexable text".into(),
                            });
                        } else {
                            report.ingested_chunks += count;
                            report.pages_synced += 1;
                            audit.extend(records);
                        }
                        if let Some(edited) = page.last_edited_time {
                            max_edited = Some(max_edited.map_or(edited, |m| m.max(edited)));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(page_id = %page.id, error = %err, "page sync failed");
                        report.skipped.push(SkippedSource {
                            source_id: page.id.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }

            if !batch.has_more {
                break;
            }
            cursor = batch.next_cursor;
            // Persist the cursor so an aborted run resumes here.
            state.next_cursor = cursor.clone();
            self.db.save_notion_sync_state(&state).await?;
        }

        state.next_cursor = None;
        state.since = match (max_edited, state.since) {
            (Some(edited), Some(previous)) => Some(edited.max(previous)),
            (Some(edited), None) => Some(edited),
            (None, previous) => previous,
        };
        if mode == SyncMode::Full {
            state.last_full_sync = Some(Utc::now());
        }
        self.db.save_notion_sync_state(&state).await?;

        if !audit.is_empty() {
            let path = workspace.jsonl_dir().join("notion.jsonl");
            if let Err(error) = write_jsonl_audit(&path, &audit) {
                tracing::warn!(%error, "failed to write notion jsonl audit");
            }
        }

        tracing::info!(
            pages = report.pages_synced,
            chunks = report.ingested_chunks,
            skipped = report.skipped.len(),
            "notion sync complete"
        );
        Ok(report)
    }

    /// Fetch, render, chunk and commit one page. Returns the committed chunk
    /// count and the records for the audit trail.
    async fn sync_page(
        &self,
        workspace: &WorkspaceContext,
        index: &RetrievalIndex,
        page: &PageMeta,
    ) -> Result<(usize, Vec<SourceRecord>)> {
        let blocks = self.api.block_tree(&page.id).await?;
        let segments = render_segments(&blocks);
        let drafts = assemble_chunks(&segments, &self.chunking);
        if drafts.is_empty() {
            // Keep the index free of stale chunks when a page empties out.
            index.delete_by_source(SourceType::Notion, &page.id).await?;
            return Ok((0, Vec::new()));
        }

        let url = page
            .url
            .clone()
            .unwrap_or_else(|| compose_page_url(&page.id));
        let source = RecordSource::plain(
            SourceType::Notion,
            page.id.clone(),
            page.title.clone(),
            url,
            workspace.workspace_id,
        );
        let records = build_records(&source, drafts);
        let committed = index
            .replace(SourceType::Notion, &page.id, records.clone())
            .await?;
        Ok((committed, records))
    }
}

async fn sleep_cancellable(
    duration: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
