//! Notion sync worker scenarios: idempotent full pulls, skipped pages,
//! incremental watermarks and rate-limit backoff.

mod support;

use arcana::config::{ChunkConfig, RetrievalConfig};
use arcana::db::Database;
use arcana::index::{RetrievalIndex, SearchOptions, SearchStrategy};
use arcana::notion::client::NotionApi;
use arcana::notion::sync::{NotionSyncWorker, SyncMode};
use arcana::workspace::WorkspaceContext;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{image_block, page_meta, paragraph_block, MockEmbedder, MockNotion};
use tokio_util::sync::CancellationToken;

struct Harness {
    workspace: WorkspaceContext,
    index: RetrievalIndex,
    db: Database,
    notion: Arc<MockNotion>,
    worker: NotionSyncWorker,
    _dir: tempfile::TempDir,
}

async fn harness(notion: MockNotion) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = WorkspaceContext::new(1, "notion-sync", dir.path());
    let embedder = Arc::new(MockEmbedder::default());
    let index = RetrievalIndex::open(&workspace, embedder, RetrievalConfig::default())
        .await
        .expect("open index");
    let db = Database::open_in_memory().await.expect("open db");

    let notion = Arc::new(notion);
    let worker = NotionSyncWorker::new(
        notion.clone() as Arc<dyn NotionApi>,
        db.clone(),
        ChunkConfig::default(),
    );

    Harness {
        workspace,
        index,
        db,
        notion,
        worker,
        _dir: dir,
    }
}

#[tokio::test]
async fn full_pull_twice_yields_the_same_record_set() {
    let notion = MockNotion::with_pages(vec![
        (
            page_meta("p1", "Q3 Review", 3600),
            vec![paragraph_block("b1", "revenue grew 18% in Q3")],
        ),
        (
            page_meta("p2", "Roadmap", 7200),
            vec![paragraph_block("b2", "ship the retrieval core next sprint")],
        ),
    ]);
    let h = harness(notion).await;
    let cancel = CancellationToken::new();

    let first = h
        .worker
        .pull(&h.workspace, &h.index, 1, SyncMode::Full, &cancel)
        .await
        .expect("first pull");
    assert_eq!(first.pages_synced, 2);
    assert!(first.ingested_chunks >= 2);

    let counts_first = h.index.counts().await.expect("counts");

    let second = h
        .worker
        .pull(&h.workspace, &h.index, 1, SyncMode::Full, &cancel)
        .await
        .expect("second pull");
    let counts_second = h.index.counts().await.expect("counts");

    assert_eq!(first.ingested_chunks, second.ingested_chunks);
    assert_eq!(counts_first.vector_count, counts_second.vector_count);
    assert_eq!(counts_first.object_count, counts_second.object_count);

    // Content is retrievable with the page URL attached.
    let hits = h
        .index
        .search(
            "revenue Q3",
            &SearchOptions {
                strategy: SearchStrategy::Keyword,
                ..Default::default()
            },
        )
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.url, "https://www.notion.so/p1");

    // State advanced: full sync stamped, cursor cleared.
    let state = h.db.notion_sync_state(1).await.expect("state");
    assert!(state.last_full_sync.is_some());
    assert!(state.next_cursor.is_none());
    assert!(state.since.is_some());
}

#[tokio::test]
async fn media_only_page_is_reported_as_skipped() {
    let notion = MockNotion::with_pages(vec![(
        page_meta("p1", "Screenshots", 60),
        vec![image_block("b1"), image_block("b2")],
    )]);
    let h = harness(notion).await;

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            1,
            SyncMode::Full,
            &CancellationToken::new(),
        )
        .await
        .expect("pull");

    assert_eq!(report.ingested_chunks, 0);
    assert_eq!(report.pages_synced, 0);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].source_id, "p1");
    assert_eq!(h.index.counts().await.expect("counts").vector_count, 0);
}

#[tokio::test]
async fn incremental_pull_stops_at_the_watermark() {
    let notion = MockNotion::with_pages(vec![
        (
            page_meta("new", "Fresh Page", 10),
            vec![paragraph_block("b1", "fresh content just edited")],
        ),
        (
            page_meta("old", "Stale Page", 24 * 3600),
            vec![paragraph_block("b2", "old content from yesterday")],
        ),
    ]);
    let h = harness(notion).await;
    let cancel = CancellationToken::new();

    // Seed the watermark between the two edits.
    let mut state = h.db.notion_sync_state(1).await.expect("state");
    state.since = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    h.db.save_notion_sync_state(&state).await.expect("save");

    let report = h
        .worker
        .pull(&h.workspace, &h.index, 1, SyncMode::Incremental, &cancel)
        .await
        .expect("pull");

    // Only the fresh page was fetched; enumeration stopped at the stale one.
    assert_eq!(report.pages_synced, 1);
    assert_eq!(h.notion.tree_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limited_enumeration_backs_off_and_completes() {
    let notion = MockNotion::with_pages(vec![(
        page_meta("p1", "Doc", 60),
        vec![paragraph_block("b1", "content after the backoff window")],
    )]);
    notion.rate_limit_once.store(true, Ordering::SeqCst);
    let h = harness(notion).await;

    let report = h
        .worker
        .pull(
            &h.workspace,
            &h.index,
            1,
            SyncMode::Full,
            &CancellationToken::new(),
        )
        .await
        .expect("pull survives one 429");

    assert_eq!(report.pages_synced, 1);
    // First call rate-limited, second succeeded.
    assert!(h.notion.search_calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn cancellation_aborts_without_advancing_state() {
    let notion = MockNotion::with_pages(vec![(
        page_meta("p1", "Doc", 60),
        vec![paragraph_block("b1", "content")],
    )]);
    let h = harness(notion).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h
        .worker
        .pull(&h.workspace, &h.index, 1, SyncMode::Full, &cancel)
        .await;
    assert!(matches!(result, Err(arcana::Error::Cancelled)));

    let state = h.db.notion_sync_state(1).await.expect("state");
    assert!(state.last_full_sync.is_none());
    assert!(state.since.is_none());
}
