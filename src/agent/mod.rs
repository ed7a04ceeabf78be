//! Agent orchestration graph.
//!
//! The graph is a table of nodes plus a router executed as a plain loop:
//! decide → (search | prepare_rag → generate → create_page | chat) →
//! final_answer → END. Each node runs at most once per request.

pub mod chat;
pub mod decide;
pub mod final_answer;
pub mod generate;
pub mod search;
pub mod state;

use crate::error::{Error, LlmError, Result};
use crate::index::{RetrievalIndex, SearchOptions};
use crate::llm::ChatModel;
use crate::notion::blocks::markdown_to_blocks;
use crate::notion::client::NotionApi;
use crate::workspace::WorkspaceContext;
use chat::ChatNode;
use decide::DecideNode;
use final_answer::FinalAnswerNode;
use generate::GenerateNode;
use search::SearchNode;
use state::{AgentExecutionResult, AgentMode, AgentState, SearchOutcome};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Caller-tunable knobs for one query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub search: SearchOptions,
    /// Extra guidance applied by the final_answer node.
    pub final_message_instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Decide,
    Search,
    PrepareRag,
    Generate,
    CreatePage,
    Chat,
    FinalAnswer,
}

/// Runs the decide/search/generate/chat graph over a workspace index.
pub struct AgentOrchestrator {
    decide: DecideNode,
    search: SearchNode,
    generate: GenerateNode,
    chat: ChatNode,
    final_answer: FinalAnswerNode,
    notion: Arc<dyn NotionApi>,
}

impl AgentOrchestrator {
    pub fn new(
        decision_model: Arc<dyn ChatModel>,
        chat_model: Arc<dyn ChatModel>,
        final_answer_model: Arc<dyn ChatModel>,
        notion: Arc<dyn NotionApi>,
        doc_gen_max_tokens: u32,
    ) -> Self {
        Self {
            decide: DecideNode::new(decision_model),
            search: SearchNode::new(chat_model.clone()),
            generate: GenerateNode::new(chat_model.clone(), doc_gen_max_tokens),
            chat: ChatNode::new(chat_model),
            final_answer: FinalAnswerNode::new(final_answer_model),
            notion,
        }
    }

    /// Execute the graph for one request.
    pub async fn run(
        &self,
        workspace: &WorkspaceContext,
        index: &RetrievalIndex,
        user_id: i64,
        query: &str,
        options: &QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query is empty".into()));
        }

        let mut state = AgentState::new(workspace.clone(), user_id, query.trim());
        state.final_message_instructions = options.final_message_instructions.clone();

        let mut next = Some(Node::Decide);
        let mut visited: HashSet<Node> = HashSet::new();

        while let Some(node) = next {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !visited.insert(node) {
                return Err(Error::Other(anyhow::anyhow!(
                    "agent graph revisited node {node:?}"
                )));
            }

            self.run_node(node, index, options, &mut state).await?;
            next = route(node, &state);
        }

        let result = state
            .result
            .ok_or_else(|| Error::Other(anyhow::anyhow!("agent produced no result")))?;
        let mode = state.mode.unwrap_or(AgentMode::Search);

        Ok(AgentExecutionResult {
            mode,
            result,
            notion_page: state.notion_page,
            decision: state.decision,
            generated_document: state.generated_document,
        })
    }

    async fn run_node(
        &self,
        node: Node,
        index: &RetrievalIndex,
        options: &QueryOptions,
        state: &mut AgentState,
    ) -> Result<()> {
        match node {
            Node::Decide => {
                let decision = match self.decide.decide(&state.query).await {
                    Ok(decision) => decision,
                    Err(Error::Llm(LlmError::ParsingFailed(message))) => {
                        tracing::warn!(message, "decision unparsable, falling back to chat");
                        state::AgentDecision::chat_fallback()
                    }
                    Err(err) => return Err(err),
                };
                if state.final_message_instructions.is_none() {
                    state.final_message_instructions =
                        decision.final_message_instructions.clone();
                }
                tracing::debug!(
                    mode = %decision.mode,
                    use_rag = decision.use_rag,
                    "query classified"
                );
                state.decision = Some(decision);
            }
            Node::Search => {
                let outcome = self
                    .search
                    .run(index, &state.query, &options.search)
                    .await?;
                state.result = Some(outcome);
                state.mode = Some(AgentMode::Search);
            }
            Node::PrepareRag => {
                let payload = self
                    .search
                    .prepare_rag(index, &state.query, &options.search)
                    .await?;
                state.retrieval = Some(payload);
            }
            Node::Generate => {
                let decision = state.decision.as_ref();
                let context = state
                    .retrieval
                    .as_ref()
                    .map(|r| r.context.as_str())
                    .unwrap_or("");
                let (document, degraded) = self
                    .generate
                    .generate(
                        &state.query,
                        context,
                        decision.and_then(|d| d.instructions.as_deref()),
                        decision.and_then(|d| d.title_hint.as_deref()),
                    )
                    .await?;
                if degraded {
                    // The fallback draft is not published; the user gets an
                    // apology instead of a hard error.
                    state.result = Some(SearchOutcome {
                        question: state.query.clone(),
                        answer: "I'm sorry, I couldn't draft that document right now. \
                                 Please try again shortly."
                            .into(),
                        citations: Vec::new(),
                        top_url: None,
                    });
                }
                state.generated_document = Some(document);
                state.generation_degraded = degraded;
                state.mode = Some(AgentMode::Generate);
            }
            Node::CreatePage => {
                let document = state.generated_document.as_ref().ok_or_else(|| {
                    Error::Other(anyhow::anyhow!("create_page reached without a document"))
                })?;
                let children = markdown_to_blocks(&document.content);
                let page = self.notion.create_page(&document.title, children).await?;

                let mut lines = vec![
                    "I created a Notion page from your request.".to_string(),
                    format!(
                        "Title: {}",
                        if document.title.is_empty() {
                            "Untitled"
                        } else {
                            &document.title
                        }
                    ),
                ];
                if !document.summary.is_empty() {
                    lines.push(format!("Summary: {}", document.summary));
                }
                if page.url.is_empty() {
                    lines.push("The page URL could not be retrieved.".to_string());
                } else {
                    lines.push(page.url.clone());
                }

                let citations = state
                    .retrieval
                    .as_ref()
                    .map(|r| r.citations.clone())
                    .unwrap_or_default();
                state.result = Some(SearchOutcome {
                    question: state.query.clone(),
                    answer: lines.join("\n"),
                    citations,
                    top_url: Some(page.url.clone()).filter(|u| !u.is_empty()),
                });
                state.notion_page = Some(page);
            }
            Node::Chat => {
                let answer = self.chat.respond(&state.query).await;
                state.result = Some(SearchOutcome {
                    question: state.query.clone(),
                    answer,
                    citations: Vec::new(),
                    top_url: None,
                });
                state.mode = Some(AgentMode::Chat);
            }
            Node::FinalAnswer => {
                if let Some(result) = state.result.as_mut() {
                    let refined = self
                        .final_answer
                        .craft(
                            &result.answer,
                            &state.query,
                            &state.workspace.workspace_slug,
                            state.mode.unwrap_or(AgentMode::Search),
                            state.final_message_instructions.as_deref(),
                        )
                        .await;
                    result.answer = refined;
                }
            }
        }
        Ok(())
    }
}

/// Routing table. A missing decision ends the run (treated as an internal
/// error by `run`).
fn route(from: Node, state: &AgentState) -> Option<Node> {
    match from {
        Node::Decide => {
            let decision = state.decision.as_ref()?;
            match decision.mode {
                AgentMode::Search => Some(Node::Search),
                AgentMode::Generate if decision.use_rag => Some(Node::PrepareRag),
                AgentMode::Generate => Some(Node::Generate),
                AgentMode::Chat => Some(Node::Chat),
            }
        }
        Node::PrepareRag => Some(Node::Generate),
        Node::Generate => {
            if state.generation_degraded {
                Some(Node::FinalAnswer)
            } else {
                Some(Node::CreatePage)
            }
        }
        Node::Search | Node::CreatePage | Node::Chat => Some(Node::FinalAnswer),
        Node::FinalAnswer => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::AgentDecision;
    use crate::workspace::WorkspaceContext;
    use std::path::Path;

    fn state_with_decision(decision: AgentDecision) -> AgentState {
        let workspace = WorkspaceContext::new(1, "test", Path::new("/tmp/arcana-test"));
        let mut state = AgentState::new(workspace, 1, "query");
        state.decision = Some(decision);
        state
    }

    fn decision(mode: AgentMode, use_rag: bool) -> AgentDecision {
        AgentDecision {
            mode,
            use_rag,
            rationale: String::new(),
            title_hint: None,
            instructions: None,
            final_message_instructions: None,
        }
    }

    #[test]
    fn routes_follow_the_decision() {
        let state = state_with_decision(decision(AgentMode::Search, false));
        assert_eq!(route(Node::Decide, &state), Some(Node::Search));

        let state = state_with_decision(decision(AgentMode::Generate, true));
        assert_eq!(route(Node::Decide, &state), Some(Node::PrepareRag));

        let state = state_with_decision(decision(AgentMode::Generate, false));
        assert_eq!(route(Node::Decide, &state), Some(Node::Generate));

        let state = state_with_decision(decision(AgentMode::Chat, false));
        assert_eq!(route(Node::Decide, &state), Some(Node::Chat));
    }

    #[test]
    fn missing_decision_ends_the_graph() {
        let workspace = WorkspaceContext::new(1, "test", Path::new("/tmp/arcana-test"));
        let state = AgentState::new(workspace, 1, "query");
        assert_eq!(route(Node::Decide, &state), None);
    }

    #[test]
    fn every_path_ends_at_final_answer() {
        let state = state_with_decision(decision(AgentMode::Search, false));
        assert_eq!(route(Node::Search, &state), Some(Node::FinalAnswer));
        assert_eq!(route(Node::PrepareRag, &state), Some(Node::Generate));
        assert_eq!(route(Node::Generate, &state), Some(Node::CreatePage));
        assert_eq!(route(Node::CreatePage, &state), Some(Node::FinalAnswer));
        assert_eq!(route(Node::Chat, &state), Some(Node::FinalAnswer));
        assert_eq!(route(Node::FinalAnswer, &state), None);
    }

    #[test]
    fn degraded_generation_skips_page_creation() {
        let mut state = state_with_decision(decision(AgentMode::Generate, false));
        state.generation_degraded = true;
        assert_eq!(route(Node::Generate, &state), Some(Node::FinalAnswer));
    }
}
