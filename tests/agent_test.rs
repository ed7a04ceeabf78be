//! End-to-end agent graph scenarios over a real index with scripted models.

mod support;

use arcana::agent::state::AgentMode;
use arcana::agent::{AgentOrchestrator, QueryOptions};
use arcana::config::RetrievalConfig;
use arcana::error::LlmError;
use arcana::index::RetrievalIndex;
use arcana::llm::ChatModel;
use arcana::notion::client::NotionApi;
use arcana::record::SourceType;
use arcana::workspace::WorkspaceContext;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{record, MockEmbedder, MockNotion, ScriptedChatModel};
use tokio_util::sync::CancellationToken;

struct Harness {
    workspace: WorkspaceContext,
    index: RetrievalIndex,
    embedder: Arc<MockEmbedder>,
    notion: Arc<MockNotion>,
    chat_model: Arc<ScriptedChatModel>,
    orchestrator: AgentOrchestrator,
    _dir: tempfile::TempDir,
}

/// Classifies the canned scenario queries the way the production decide
/// deployment would.
fn decide_model() -> ScriptedChatModel {
    ScriptedChatModel::new(|request| {
        let query = request.user.to_lowercase();
        let payload = if query.contains("revenue grow") {
            serde_json::json!({"mode": "search", "use_rag": false, "rationale": "lookup"})
        } else if query.contains("weekly report") {
            serde_json::json!({
                "mode": "generate", "use_rag": true,
                "rationale": "report from existing docs",
                "title_hint": "Weekly Report",
                "instructions": "base it on the Q3 review",
            })
        } else if query.contains("meeting template") {
            serde_json::json!({
                "mode": "generate", "use_rag": false,
                "rationale": "fresh template",
                "title_hint": "Meeting Template",
            })
        } else {
            serde_json::json!({"mode": "chat", "use_rag": false, "rationale": "small talk"})
        };
        Ok(payload.to_string())
    })
}

/// Serves the search answer, the generated document and chat replies
/// depending on which node is calling.
fn worker_model() -> ScriptedChatModel {
    ScriptedChatModel::new(|request| {
        if request.system.contains("retrieval assistant") {
            Ok("Revenue grew 18% in Q3 [1].".to_string())
        } else if request.system.contains("drafting assistant") {
            let body = format!(
                "## Weekly Report\n\nHighlights from the quarter. {}\n\n| Metric | Value |\n|---|---|\n| Revenue growth | 18% |\n",
                "The team reviewed progress across initiatives and summarized outcomes. "
                    .repeat(20),
            );
            Ok(serde_json::json!({
                "title": "Weekly Report",
                "summary": "A one-page weekly report based on the Q3 review.",
                "content": body,
            })
            .to_string())
        } else {
            Ok("Hi! How can I help you today?".to_string())
        }
    })
}

async fn harness(decide: ScriptedChatModel) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = WorkspaceContext::new(1, "agent-test", dir.path());
    let embedder = Arc::new(MockEmbedder::default());
    let index = RetrievalIndex::open(&workspace, embedder.clone(), RetrievalConfig::default())
        .await
        .expect("open index");

    index
        .replace(
            SourceType::Notion,
            "q3-review",
            vec![record(
                SourceType::Notion,
                "q3-review",
                0,
                "Q3 Review",
                "https://www.notion.so/q3review",
                "revenue grew 18% in Q3",
            )],
        )
        .await
        .expect("seed q3 page");

    let notion = Arc::new(MockNotion::default());
    let chat_model = Arc::new(worker_model());
    let orchestrator = AgentOrchestrator::new(
        Arc::new(decide) as Arc<dyn ChatModel>,
        chat_model.clone() as Arc<dyn ChatModel>,
        Arc::new(ScriptedChatModel::passthrough_finalizer()) as Arc<dyn ChatModel>,
        notion.clone() as Arc<dyn NotionApi>,
        1600,
    );

    Harness {
        workspace,
        index,
        embedder,
        notion,
        chat_model,
        orchestrator,
        _dir: dir,
    }
}

#[tokio::test]
async fn pure_search_answers_with_source_url() {
    let h = harness(decide_model()).await;
    let result = h
        .orchestrator
        .run(
            &h.workspace,
            &h.index,
            7,
            "how much did revenue grow in Q3?",
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");

    assert_eq!(result.mode, AgentMode::Search);
    assert!(result.result.answer.contains("18"));
    assert_eq!(
        result.result.top_url.as_deref(),
        Some("https://www.notion.so/q3review")
    );
    assert!(!result.result.citations.is_empty());
}

#[tokio::test]
async fn generation_with_rag_publishes_a_page() {
    let h = harness(decide_model()).await;
    let result = h
        .orchestrator
        .run(
            &h.workspace,
            &h.index,
            7,
            "write a one-page weekly report based on the Q3 Review",
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");

    assert_eq!(result.mode, AgentMode::Generate);
    let decision = result.decision.expect("decision");
    assert!(decision.use_rag);

    let document = result.generated_document.expect("document");
    let len = document.content.chars().count();
    assert!(
        (1200..=2500).contains(&len),
        "document length {len} outside [1200, 2500]"
    );

    let page = result.notion_page.expect("page");
    assert_eq!(page.url, "https://www.notion.so/createdpage");
    assert!(result.result.answer.contains(&page.url));

    // The markdown table reached Notion as a native table block.
    let created = h.notion.created_pages();
    assert_eq!(created.len(), 1);
    assert!(created[0]
        .1
        .iter()
        .any(|block| block["type"].as_str() == Some("table")));
}

#[tokio::test]
async fn generation_without_rag_skips_retrieval() {
    let h = harness(decide_model()).await;
    let seed_calls = h.embedder.calls.load(Ordering::SeqCst);

    let result = h
        .orchestrator
        .run(
            &h.workspace,
            &h.index,
            7,
            "draft a blank meeting template",
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");

    assert_eq!(result.mode, AgentMode::Generate);
    let decision = result.decision.expect("decision");
    assert!(!decision.use_rag);

    // No retrieval happened: the embedder was never invoked after seeding.
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), seed_calls);

    let document = result.generated_document.expect("document");
    assert!(!document.content.contains("notion.so/q3review"));
}

#[tokio::test]
async fn chat_makes_no_retrieval_calls() {
    let h = harness(decide_model()).await;
    let seed_calls = h.embedder.calls.load(Ordering::SeqCst);

    let result = h
        .orchestrator
        .run(
            &h.workspace,
            &h.index,
            7,
            "hello",
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");

    assert_eq!(result.mode, AgentMode::Chat);
    assert!(!result.result.answer.is_empty());
    assert!(result.result.citations.is_empty());
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), seed_calls);
    assert!(h.notion.created_pages().is_empty());
}

#[tokio::test]
async fn unparsable_decision_falls_back_to_chat() {
    let decide = ScriptedChatModel::fixed("I would classify this as a search request.");
    let h = harness(decide).await;

    let result = h
        .orchestrator
        .run(
            &h.workspace,
            &h.index,
            7,
            "anything at all",
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");

    assert_eq!(result.mode, AgentMode::Chat);
    // The chat node (not search) produced the reply.
    assert!(h.chat_model.call_count() >= 1);
}

#[tokio::test]
async fn length_exceeded_generation_retries_then_degrades() {
    use std::sync::atomic::AtomicUsize;

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_inner = attempts.clone();
    let decide = ScriptedChatModel::fixed(
        serde_json::json!({"mode": "generate", "use_rag": false, "rationale": "draft"})
            .to_string(),
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = WorkspaceContext::new(1, "agent-len", dir.path());
    let embedder = Arc::new(MockEmbedder::default());
    let index = RetrievalIndex::open(&workspace, embedder, RetrievalConfig::default())
        .await
        .expect("open index");

    let worker = ScriptedChatModel::new(move |request| {
        if request.system.contains("drafting assistant") {
            attempts_inner.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::LengthExceeded.into())
        } else {
            Ok("fallback reply".into())
        }
    });

    let notion = Arc::new(MockNotion::default());
    let orchestrator = AgentOrchestrator::new(
        Arc::new(decide) as Arc<dyn ChatModel>,
        Arc::new(worker) as Arc<dyn ChatModel>,
        Arc::new(ScriptedChatModel::passthrough_finalizer()) as Arc<dyn ChatModel>,
        notion.clone() as Arc<dyn NotionApi>,
        1600,
    );

    let result = orchestrator
        .run(
            &workspace,
            &index,
            7,
            "draft something enormous",
            &QueryOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("degraded run must not be a hard error");

    assert_eq!(attempts.load(Ordering::SeqCst), 2, "one retry expected");
    assert_eq!(result.mode, AgentMode::Generate);
    // Degraded output: an apology answer, and nothing was published.
    assert!(result.result.answer.to_lowercase().contains("sorry"));
    assert!(result.notion_page.is_none());
    assert!(notion.created_pages().is_empty());
}
