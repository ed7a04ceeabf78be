//! Shared state threaded through the orchestration graph.

use crate::index::Citation;
use crate::notion::client::NotionPageRef;
use crate::workspace::WorkspaceContext;
use serde::{Deserialize, Serialize};

/// How the agent handled the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Search,
    Generate,
    Chat,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentMode::Search => "search",
            AgentMode::Generate => "generate",
            AgentMode::Chat => "chat",
        };
        write!(f, "{name}")
    }
}

/// Structured output of the decide node.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDecision {
    pub mode: AgentMode,
    pub use_rag: bool,
    pub rationale: String,
    pub title_hint: Option<String>,
    pub instructions: Option<String>,
    pub final_message_instructions: Option<String>,
}

impl AgentDecision {
    /// Fallback used when the classifier output does not parse.
    pub fn chat_fallback() -> Self {
        Self {
            mode: AgentMode::Chat,
            use_rag: false,
            rationale: "classifier output unparsable, treating as chat".into(),
            title_hint: None,
            instructions: None,
            final_message_instructions: None,
        }
    }
}

/// Context and citation candidates prepared for the generator.
#[derive(Debug, Clone, Default)]
pub struct RetrievalPayload {
    pub context: String,
    pub citations: Vec<Citation>,
}

/// Answer produced by the search / create-page / chat paths.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub top_url: Option<String>,
}

/// Markdown document drafted by the generation node.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedDocument {
    pub title: String,
    pub summary: String,
    pub content: String,
}

/// Mutable per-request graph state. Created in `run`, mutated only by node
/// execution, discarded when the request completes.
pub struct AgentState {
    pub query: String,
    pub workspace: WorkspaceContext,
    pub user_id: i64,
    pub decision: Option<AgentDecision>,
    pub retrieval: Option<RetrievalPayload>,
    pub result: Option<SearchOutcome>,
    pub generated_document: Option<GeneratedDocument>,
    pub generation_degraded: bool,
    pub mode: Option<AgentMode>,
    pub notion_page: Option<NotionPageRef>,
    pub final_message_instructions: Option<String>,
}

impl AgentState {
    pub fn new(workspace: WorkspaceContext, user_id: i64, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            workspace,
            user_id,
            decision: None,
            retrieval: None,
            result: None,
            generated_document: None,
            generation_degraded: false,
            mode: None,
            notion_page: None,
            final_message_instructions: None,
        }
    }
}

/// Result handed back to the caller once the graph reaches END.
#[derive(Debug)]
pub struct AgentExecutionResult {
    pub mode: AgentMode,
    pub result: SearchOutcome,
    pub notion_page: Option<NotionPageRef>,
    pub decision: Option<AgentDecision>,
    pub generated_document: Option<GeneratedDocument>,
}
