//! Drive sync worker scenarios: rename-only changes, deletions, scope
//! filtering and unsupported files.

mod support;

use arcana::config::{ChunkConfig, RetrievalConfig};
use arcana::db::{Database, DriveFileSnapshot, DriveSyncState};
use arcana::gdrive::client::{DriveApi, DriveFileMeta, RawChange, MIME_DOCX};
use arcana::gdrive::sync::DriveSyncWorker;
use arcana::index::{RetrievalIndex, SearchOptions, SearchStrategy};
use arcana::record::SourceType;
use arcana::workspace::WorkspaceContext;
use chrono::Utc;
use std::sync::Arc;
use support::{record, MockDrive, MockEmbedder};
use tokio_util::sync::CancellationToken;

const DATA_SOURCE: i64 = 1;
const ROOT: &str = "root-folder";

struct Harness {
    workspace: WorkspaceContext,
    index: RetrievalIndex,
    db: Database,
    drive: Arc<MockDrive>,
    worker: DriveSyncWorker,
    _dir: tempfile::TempDir,
}

async fn harness(drive: MockDrive) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = WorkspaceContext::new(1, "drive-sync", dir.path());
    let embedder = Arc::new(MockEmbedder::default());
    let index = RetrievalIndex::open(&workspace, embedder, RetrievalConfig::default())
        .await
        .expect("open index");
    let db = Database::open_in_memory().await.expect("open db");

    // Past the bootstrap: a start token and one ingested DOCX snapshot.
    db.save_drive_sync_state(&DriveSyncState {
        data_source_id: DATA_SOURCE,
        start_page_token: Some("token-0".into()),
        bootstrapped_at: Some(Utc::now()),
        last_synced: Some(Utc::now()),
    })
    .await
    .expect("seed state");

    let drive = Arc::new(drive);
    let worker = DriveSyncWorker::new(
        drive.clone() as Arc<dyn DriveApi>,
        db.clone(),
        ChunkConfig::default(),
    );

    Harness {
        workspace,
        index,
        db,
        drive,
        worker,
        _dir: dir,
    }
}

async fn seed_docx_snapshot(h: &Harness, file_id: &str, md5: &str) {
    h.db.save_drive_snapshot(&DriveFileSnapshot {
        data_source_id: DATA_SOURCE,
        file_id: file_id.into(),
        name: "A.docx".into(),
        mime_type: MIME_DOCX.into(),
        md5_checksum: Some(md5.into()),
        version: Some(3),
        modified_time: Some(Utc::now()),
        web_view_link: None,
        last_synced: Some(Utc::now()),
    })
    .await
    .expect("seed snapshot");

    h.index
        .replace(
            SourceType::Gdrive,
            file_id,
            vec![record(
                SourceType::Gdrive,
                file_id,
                0,
                "A.docx",
                "https://drive.google.com/a",
                "quarterly figures inside the docx",
            )],
        )
        .await
        .expect("seed records");
}

fn docx_meta(file_id: &str, name: &str, md5: &str) -> DriveFileMeta {
    DriveFileMeta {
        id: file_id.into(),
        name: name.into(),
        mime_type: MIME_DOCX.into(),
        modified_time: Some(Utc::now()),
        md5_checksum: Some(md5.into()),
        version: Some(3),
        web_view_link: Some("https://drive.google.com/a".into()),
        parents: vec![ROOT.into()],
        trashed: false,
        can_download: true,
    }
}

#[tokio::test]
async fn rename_only_change_updates_snapshot_without_reingest() {
    let renamed = docx_meta("f1", "A-renamed.docx", "md5-x");
    let drive = MockDrive::with_changes(vec![RawChange {
        file_id: "f1".into(),
        removed: false,
        file: Some(renamed),
    }]);
    let h = harness(drive).await;
    seed_docx_snapshot(&h, "f1", "md5-x").await;
    let before = h.index.counts().await.expect("counts");

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            DATA_SOURCE,
            ROOT,
            &CancellationToken::new(),
        )
        .await
        .expect("pull");

    assert_eq!(report.ingested_chunks, 0);
    assert!(report.removed.is_empty());
    // No export or download happened for a metadata-only change.
    assert_eq!(h.drive.conversion_calls(), 0);

    let snapshot = h
        .db
        .drive_snapshot(DATA_SOURCE, "f1")
        .await
        .expect("load")
        .expect("snapshot kept");
    assert_eq!(snapshot.name, "A-renamed.docx");

    let after = h.index.counts().await.expect("counts");
    assert_eq!(before.vector_count, after.vector_count);

    // The changes cursor advanced.
    let state = h.db.drive_sync_state(DATA_SOURCE).await.expect("state");
    assert_eq!(state.start_page_token.as_deref(), Some("token-next"));
}

#[tokio::test]
async fn trashed_file_is_removed_from_index_and_snapshots() {
    let mut trashed = docx_meta("f1", "B.pdf", "md5-x");
    trashed.trashed = true;
    let drive = MockDrive::with_changes(vec![RawChange {
        file_id: "f1".into(),
        removed: false,
        file: Some(trashed),
    }]);
    let h = harness(drive).await;
    seed_docx_snapshot(&h, "f1", "md5-x").await;

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            DATA_SOURCE,
            ROOT,
            &CancellationToken::new(),
        )
        .await
        .expect("pull");

    assert_eq!(report.removed, vec!["f1".to_string()]);
    assert!(h
        .db
        .drive_snapshot(DATA_SOURCE, "f1")
        .await
        .expect("load")
        .is_none());

    let hits = h
        .index
        .search(
            "quarterly figures",
            &SearchOptions {
                strategy: SearchStrategy::Keyword,
                ..Default::default()
            },
        )
        .await
        .expect("search");
    assert!(hits.is_empty(), "chunks of the trashed file must be gone");
}

#[tokio::test]
async fn removed_change_without_file_payload_deletes_too() {
    let drive = MockDrive::with_changes(vec![RawChange {
        file_id: "f1".into(),
        removed: true,
        file: None,
    }]);
    let h = harness(drive).await;
    seed_docx_snapshot(&h, "f1", "md5-x").await;

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            DATA_SOURCE,
            ROOT,
            &CancellationToken::new(),
        )
        .await
        .expect("pull");

    assert_eq!(report.removed, vec!["f1".to_string()]);
    assert_eq!(h.index.counts().await.expect("counts").vector_count, 0);
}

#[tokio::test]
async fn file_moved_out_of_scope_is_removed() {
    let mut moved = docx_meta("f1", "A.docx", "md5-x");
    moved.parents = vec!["elsewhere".into()];
    let drive = MockDrive::with_changes(vec![RawChange {
        file_id: "f1".into(),
        removed: false,
        file: Some(moved),
    }]);
    // "elsewhere" has no path to the workspace root.
    drive
        .parents
        .lock()
        .expect("parents lock")
        .insert("elsewhere".into(), vec![]);

    let h = harness(drive).await;
    seed_docx_snapshot(&h, "f1", "md5-x").await;

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            DATA_SOURCE,
            ROOT,
            &CancellationToken::new(),
        )
        .await
        .expect("pull");

    assert_eq!(report.removed, vec!["f1".to_string()]);
}

#[tokio::test]
async fn unsupported_mime_is_skipped_not_fatal() {
    let mut hwp = docx_meta("f2", "doc.hwp", "md5-y");
    hwp.mime_type = "application/x-hwp".into();
    let drive = MockDrive::with_changes(vec![RawChange {
        file_id: "f2".into(),
        removed: false,
        file: Some(hwp),
    }]);
    let h = harness(drive).await;

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            DATA_SOURCE,
            ROOT,
            &CancellationToken::new(),
        )
        .await
        .expect("pull");

    assert_eq!(report.ingested_chunks, 0);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.contains("unsupported"));
}
