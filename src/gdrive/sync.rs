//! Google Drive sync worker: bootstrap enumeration and changes-driven
//! incremental sync with snapshot reconciliation.

use crate::chunk::{assemble_chunks, segments_from_plain_text};
use crate::config::ChunkConfig;
use crate::db::{Database, DriveFileSnapshot};
use crate::error::{Error, ProviderError, Result};
use crate::index::RetrievalIndex;
use crate::ingest::{build_records, write_jsonl_audit, RecordSource, SkippedSource};
use crate::gdrive::client::{
    is_google_native, is_office, is_supported, DriveApi, DriveFileMeta, MIME_DOCX, MIME_FOLDER,
    MIME_GOOGLE_DOC, MIME_PDF,
};
use crate::gdrive::extract::{docx_openxml, pdf_text, OpenXmlDocument};
use crate::record::{SourceRecord, SourceType, StructuredFormat};
use crate::workspace::WorkspaceContext;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Aggregated result of one sync run.
#[derive(Debug, Default)]
pub struct DriveSyncReport {
    pub ingested_chunks: usize,
    pub files_synced: usize,
    pub skipped: Vec<SkippedSource>,
    pub removed: Vec<String>,
    pub bootstrapped: bool,
}

pub struct DriveSyncWorker {
    api: Arc<dyn DriveApi>,
    db: Database,
    chunking: ChunkConfig,
}

/// Changes classified into work items.
#[derive(Default)]
struct ChangeBatch {
    to_index: Vec<DriveFileMeta>,
    to_remove: Vec<String>,
    skipped: Vec<SkippedSource>,
    new_start_page_token: Option<String>,
}

struct ConvertedFile {
    text: String,
    structured: Option<OpenXmlDocument>,
    pdf_path: String,
}

impl DriveSyncWorker {
    pub fn new(api: Arc<dyn DriveApi>, db: Database, chunking: ChunkConfig) -> Self {
        Self { api, db, chunking }
    }

    /// Run one sync pass: bootstrap on first run, changes-driven afterwards.
    pub async fn pull(
        &self,
        workspace: &WorkspaceContext,
        index: &RetrievalIndex,
        data_source_id: i64,
        root_folder_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DriveSyncReport> {
        let mut state = self.db.drive_sync_state(data_source_id).await?;
        let mut report = DriveSyncReport::default();
        let mut audit: Vec<SourceRecord> = Vec::new();

        let (candidates, removals, new_token) = if state.start_page_token.is_none() {
            // Record the changes cursor before enumerating, so edits made
            // during the bootstrap replay on the next incremental run.
            let token = self.api.start_page_token().await?;
            let files = self.api.list_files_under(root_folder_id).await?;
            report.bootstrapped = true;

            let mut candidates = Vec::new();
            for meta in files {
                if let Some(reason) = unsupported_reason(&meta) {
                    report.skipped.push(SkippedSource {
                        source_id: meta.id.clone(),
                        reason,
                    });
                    continue;
                }
                candidates.push(meta);
            }
            (candidates, Vec::new(), token)
        } else {
            let token = state
                .start_page_token
                .clone()
                .unwrap_or_default();
            let batch = self.collect_changes(&token, root_folder_id, cancel).await?;
            report.skipped.extend(batch.skipped);
            let new_token = batch.new_start_page_token.unwrap_or(token);
            (batch.to_index, batch.to_remove, new_token)
        };

        let now = Utc::now();

        for meta in candidates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let snapshot = self.db.drive_snapshot(data_source_id, &meta.id).await?;
            if !should_reindex(&meta, snapshot.as_ref()) {
                // Metadata-only change (e.g. rename): refresh the snapshot,
                // leave the index untouched.
                if let Some(snapshot) = snapshot {
                    let refreshed = apply_meta(snapshot, &meta, None);
                    self.db.save_drive_snapshot(&refreshed).await?;
                }
                continue;
            }

            match self.convert_and_index(workspace, index, &meta).await {
                Ok((0, _, _)) => {
                    report.skipped.push(SkippedSource {
                        source_id: meta.id.clone(),
                        reason: "file produced no indexable text".into(),
                    });
                    // Still snapshot it so the file is not retried forever.
                    let snapshot = snapshot_row(data_source_id, &meta);
                    self.db
                        .save_drive_snapshot(&apply_meta(snapshot, &meta, Some(now)))
                        .await?;
                }
                Ok((count, records, _pdf_path)) => {
                    report.ingested_chunks += count;
                    report.files_synced += 1;
                    audit.extend(records);
                    let snapshot = snapshot_row(data_source_id, &meta);
                    self.db
                        .save_drive_snapshot(&apply_meta(snapshot, &meta, Some(now)))
                        .await?;
                }
                Err(err) if err.is_per_source() => {
                    tracing::warn!(file_id = %meta.id, error = %err, "drive file sync failed");
                    report.skipped.push(SkippedSource {
                        source_id: meta.id.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let mut seen_removals = HashSet::new();
        for file_id in removals {
            if file_id.is_empty() || !seen_removals.insert(file_id.clone()) {
                continue;
            }
            index.delete_by_source(SourceType::Gdrive, &file_id).await?;
            self.db
                .delete_drive_snapshot(data_source_id, &file_id)
                .await?;
            report.removed.push(file_id);
        }

        state.start_page_token = Some(new_token);
        state.last_synced = Some(now);
        if report.bootstrapped {
            state.bootstrapped_at = Some(now);
        }
        self.db.save_drive_sync_state(&state).await?;

        if !audit.is_empty() {
            let path = workspace.jsonl_dir().join("googledrive.jsonl");
            if let Err(error) = write_jsonl_audit(&path, &audit) {
                tracing::warn!(%error, "failed to write drive jsonl audit");
            }
        }

        tracing::info!(
            files = report.files_synced,
            chunks = report.ingested_chunks,
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            bootstrapped = report.bootstrapped,
            "drive sync complete"
        );
        Ok(report)
    }

    /// Drain the changes stream and classify each entry.
    async fn collect_changes(
        &self,
        page_token: &str,
        root_folder_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChangeBatch> {
        let mut to_index: HashMap<String, DriveFileMeta> = HashMap::new();
        let mut to_remove: HashSet<String> = HashSet::new();
        let mut skipped: HashMap<String, SkippedSource> = HashMap::new();
        let mut new_start_page_token: Option<String> = None;
        let mut ancestor_cache: HashMap<String, bool> = HashMap::new();

        let mut cursor = Some(page_token.to_string());
        while let Some(token) = cursor {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let page = self.api.list_changes(&token).await?;
            if page.new_start_page_token.is_some() {
                new_start_page_token = page.new_start_page_token.clone();
            }

            for change in page.changes {
                let file_id = change.file_id;
                if file_id.is_empty() {
                    continue;
                }

                let mark_removed =
                    |to_index: &mut HashMap<String, DriveFileMeta>,
                     to_remove: &mut HashSet<String>,
                     skipped: &mut HashMap<String, SkippedSource>,
                     id: &str| {
                        to_index.remove(id);
                        skipped.remove(id);
                        to_remove.insert(id.to_string());
                    };

                if change.removed {
                    mark_removed(&mut to_index, &mut to_remove, &mut skipped, &file_id);
                    continue;
                }
                let Some(meta) = change.file else {
                    continue;
                };
                if meta.trashed {
                    mark_removed(&mut to_index, &mut to_remove, &mut skipped, &file_id);
                    continue;
                }
                if meta.mime_type == MIME_FOLDER {
                    continue;
                }
                if let Some(reason) = unsupported_reason(&meta) {
                    to_index.remove(&file_id);
                    to_remove.remove(&file_id);
                    skipped.insert(
                        file_id.clone(),
                        SkippedSource {
                            source_id: file_id.clone(),
                            reason,
                        },
                    );
                    continue;
                }

                let in_scope = !meta.parents.is_empty()
                    && self
                        .is_within_workspace(&meta.parents, root_folder_id, &mut ancestor_cache)
                        .await?;
                if in_scope {
                    to_remove.remove(&file_id);
                    skipped.remove(&file_id);
                    to_index.insert(file_id, meta);
                } else {
                    // Deleted, or moved outside the workspace root.
                    mark_removed(&mut to_index, &mut to_remove, &mut skipped, &file_id);
                }
            }

            cursor = page.next_page_token;
        }

        Ok(ChangeBatch {
            to_index: to_index.into_values().collect(),
            to_remove: to_remove.into_iter().collect(),
            skipped: skipped.into_values().collect(),
            new_start_page_token,
        })
    }

    /// Whether any ancestor chain of `parents` reaches the workspace root.
    async fn is_within_workspace(
        &self,
        parents: &[String],
        root_id: &str,
        cache: &mut HashMap<String, bool>,
    ) -> Result<bool> {
        for parent in parents {
            if parent == root_id {
                return Ok(true);
            }
            if self.has_root_ancestor(parent, root_id, cache).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn has_root_ancestor(
        &self,
        folder_id: &str,
        root_id: &str,
        cache: &mut HashMap<String, bool>,
    ) -> Result<bool> {
        let mut frontier = vec![folder_id.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        let mut walked: Vec<String> = Vec::new();

        while let Some(id) = frontier.pop() {
            if id == root_id {
                for seen in walked {
                    cache.insert(seen, true);
                }
                return Ok(true);
            }
            if let Some(&known) = cache.get(&id) {
                if known {
                    return Ok(true);
                }
                continue;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            walked.push(id.clone());

            let parents = self.api.file_parents(&id).await?;
            // "root" is an API alias; the real My Drive root has no parents.
            if root_id == "root" && parents.is_empty() {
                for seen in walked {
                    cache.insert(seen, true);
                }
                return Ok(true);
            }
            frontier.extend(parents);
        }

        for seen in walked {
            cache.insert(seen, false);
        }
        Ok(false)
    }

    /// Export, extract, chunk and commit one file. Returns the committed
    /// chunk count.
    async fn convert_and_index(
        &self,
        workspace: &WorkspaceContext,
        index: &RetrievalIndex,
        meta: &DriveFileMeta,
    ) -> Result<(usize, Vec<SourceRecord>, String)> {
        let converted = self.convert(workspace, meta).await?;

        let segments = segments_from_plain_text(&converted.text);
        let drafts = assemble_chunks(&segments, &self.chunking);
        if drafts.is_empty() {
            index.delete_by_source(SourceType::Gdrive, &meta.id).await?;
            return Ok((0, Vec::new(), converted.pdf_path));
        }

        let (structured_format, structured_text) = match converted.structured {
            Some(doc) => (StructuredFormat::Openxml, Some(doc.document_xml)),
            None => (StructuredFormat::None, None),
        };
        let source = RecordSource {
            source_type: SourceType::Gdrive,
            source_id: meta.id.clone(),
            title: meta.name.clone(),
            url: meta.web_view_link.clone().unwrap_or_default(),
            workspace_id: workspace.workspace_id,
            structured_format,
            structured_text,
            file_path: Some(converted.pdf_path.clone()),
        };
        let records = build_records(&source, drafts);
        let committed = index
            .replace(SourceType::Gdrive, &meta.id, records.clone())
            .await?;
        Ok((committed, records, converted.pdf_path))
    }

    async fn convert(
        &self,
        workspace: &WorkspaceContext,
        meta: &DriveFileMeta,
    ) -> Result<ConvertedFile> {
        let pdf_bytes = if is_google_native(&meta.mime_type) {
            self.api.export_pdf(&meta.id).await?
        } else if is_office(&meta.mime_type) {
            self.api.copy_export_pdf(&meta.id, &meta.mime_type).await?
        } else if meta.mime_type == MIME_PDF {
            self.api.download(&meta.id).await?
        } else {
            return Err(ProviderError::UnsupportedMime(meta.mime_type.clone()).into());
        };

        let pdf_path = workspace.pdf_dir().join(format!("{}.pdf", meta.id));
        if let Err(error) = std::fs::write(&pdf_path, &pdf_bytes) {
            tracing::warn!(%error, file_id = %meta.id, "failed to persist exported pdf");
        }
        let text = pdf_text(&pdf_bytes)?;

        // Word-processing sources keep their OpenXML structure alongside the
        // extracted text.
        let structured = match meta.mime_type.as_str() {
            MIME_DOCX => {
                let bytes = self.api.download(&meta.id).await?;
                Some(docx_openxml(&bytes)?)
            }
            MIME_GOOGLE_DOC => {
                let bytes = self.api.export_docx(&meta.id).await?;
                Some(docx_openxml(&bytes)?)
            }
            _ => None,
        };

        Ok(ConvertedFile {
            text,
            structured,
            pdf_path: pdf_path.to_string_lossy().into_owned(),
        })
    }
}

/// Reason this file cannot be ingested, if any.
fn unsupported_reason(meta: &DriveFileMeta) -> Option<String> {
    if !is_supported(&meta.mime_type) {
        return Some(format!("unsupported mime type: {}", meta.mime_type));
    }
    // Export-capable Google-native files do not need download permission.
    if !meta.can_download && !is_google_native(&meta.mime_type) {
        return Some("download not permitted".into());
    }
    None
}

/// Re-index decision: checksum for binaries, version then modified time for
/// Google-native files, unconditional when the snapshot is absent.
fn should_reindex(meta: &DriveFileMeta, snapshot: Option<&DriveFileSnapshot>) -> bool {
    let Some(snapshot) = snapshot else {
        return true;
    };

    if let Some(ref checksum) = meta.md5_checksum {
        return snapshot.md5_checksum.as_deref() != Some(checksum.as_str());
    }

    if let Some(version) = meta.version {
        return match snapshot.version {
            None => true,
            Some(snapshot_version) => snapshot_version != version,
        };
    }
    if snapshot.version.is_some() {
        return true;
    }

    match (meta.modified_time, snapshot.modified_time) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(current), Some(previous)) => current != previous,
    }
}

fn snapshot_row(data_source_id: i64, meta: &DriveFileMeta) -> DriveFileSnapshot {
    DriveFileSnapshot {
        data_source_id,
        file_id: meta.id.clone(),
        name: meta.name.clone(),
        mime_type: meta.mime_type.clone(),
        md5_checksum: None,
        version: None,
        modified_time: None,
        web_view_link: None,
        last_synced: None,
    }
}

/// Fold fresh metadata into a snapshot row. `synced_at` is set only when the
/// file was actually re-indexed.
fn apply_meta(
    mut snapshot: DriveFileSnapshot,
    meta: &DriveFileMeta,
    synced_at: Option<chrono::DateTime<Utc>>,
) -> DriveFileSnapshot {
    if !meta.name.is_empty() {
        snapshot.name = meta.name.clone();
    }
    if !meta.mime_type.is_empty() {
        snapshot.mime_type = meta.mime_type.clone();
    }
    snapshot.md5_checksum = meta.md5_checksum.clone();
    snapshot.version = meta.version;
    snapshot.modified_time = meta.modified_time;
    if meta.web_view_link.is_some() {
        snapshot.web_view_link = meta.web_view_link.clone();
    }
    if let Some(at) = synced_at {
        snapshot.last_synced = Some(at);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdrive::client::{MIME_DOCX, MIME_GOOGLE_DOC};
    use chrono::{Duration, Utc};

    fn snapshot(md5: Option<&str>, version: Option<i64>) -> DriveFileSnapshot {
        DriveFileSnapshot {
            data_source_id: 1,
            file_id: "f1".into(),
            name: "A.docx".into(),
            mime_type: MIME_DOCX.into(),
            md5_checksum: md5.map(str::to_string),
            version,
            modified_time: Some(Utc::now()),
            web_view_link: None,
            last_synced: None,
        }
    }

    fn binary_meta(md5: &str) -> DriveFileMeta {
        DriveFileMeta {
            id: "f1".into(),
            name: "A.docx".into(),
            mime_type: MIME_DOCX.into(),
            md5_checksum: Some(md5.into()),
            version: Some(3),
            modified_time: Some(Utc::now()),
            can_download: true,
            ..Default::default()
        }
    }

    #[test]
    fn missing_snapshot_always_reindexes() {
        assert!(should_reindex(&binary_meta("x"), None));
    }

    #[test]
    fn binary_reindexes_only_on_checksum_change() {
        let snap = snapshot(Some("x"), Some(3));
        // Rename-only change: same checksum, same version.
        let mut renamed = binary_meta("x");
        renamed.name = "A-renamed.docx".into();
        assert!(!should_reindex(&renamed, Some(&snap)));

        assert!(should_reindex(&binary_meta("y"), Some(&snap)));
    }

    #[test]
    fn google_native_uses_version_then_modified_time() {
        let now = Utc::now();
        let mut snap = snapshot(None, Some(5));
        snap.modified_time = Some(now);

        let mut meta = DriveFileMeta {
            id: "f1".into(),
            mime_type: MIME_GOOGLE_DOC.into(),
            version: Some(5),
            modified_time: Some(now),
            can_download: true,
            ..Default::default()
        };
        assert!(!should_reindex(&meta, Some(&snap)));

        meta.version = Some(6);
        assert!(should_reindex(&meta, Some(&snap)));

        // No version on either side: modified time decides.
        meta.version = None;
        snap.version = None;
        meta.modified_time = Some(now + Duration::seconds(1));
        assert!(should_reindex(&meta, Some(&snap)));
    }

    #[test]
    fn unsupported_and_unreadable_files_report_reasons() {
        let mut meta = binary_meta("x");
        meta.mime_type = "application/x-hwp".into();
        assert!(unsupported_reason(&meta).unwrap().contains("unsupported"));

        let mut meta = binary_meta("x");
        meta.can_download = false;
        assert!(unsupported_reason(&meta).unwrap().contains("not permitted"));

        let mut meta = binary_meta("x");
        meta.mime_type = MIME_GOOGLE_DOC.into();
        meta.can_download = false;
        assert!(unsupported_reason(&meta).is_none());
    }
}
