//! Finalizer node: polishes the draft answer on a dedicated deployment.

use crate::agent::state::AgentMode;
use crate::llm::{ChatModel, ChatRequest};
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are the response editor of a workspace assistant. \
Rewrite the provided draft (answer_draft) into the final message shown to the user.\n\
- Keep every fact and URL from the draft; invent nothing new.\n\
- Preserve citation markers and quoted links exactly.\n\
- Improve readability without changing meaning.\n\
- In chat mode, converse naturally and do not mention workspace documents.\n\
- In generate mode, keep the created document's title, summary and URL visible.";

const EMPTY_FALLBACK: &str = "I couldn't prepare an answer right now. Please try once more.";

pub struct FinalAnswerNode {
    model: Arc<dyn ChatModel>,
}

impl FinalAnswerNode {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Refine the draft. Editing failures fall back to the draft itself so
    /// the user never receives an empty reply.
    pub async fn craft(
        &self,
        draft: &str,
        question: &str,
        workspace_name: &str,
        mode: AgentMode,
        custom_instructions: Option<&str>,
    ) -> String {
        let request = ChatRequest::new(
            SYSTEM_PROMPT,
            format!(
                "Mode: {mode}\nWorkspace: {workspace_name}\nUser question: {question}\n\
                 Extra guidance: {}\nDraft (answer_draft):\n{draft}\n\n\
                 Rewrite the draft into the final user-facing message.",
                custom_instructions.unwrap_or("(none)"),
            ),
        )
        .with_temperature(0.2)
        .with_max_tokens(600);

        match self.model.complete(request).await {
            Ok(refined) => {
                let refined = refined.trim().to_string();
                if refined.is_empty() {
                    non_empty_draft(draft)
                } else {
                    refined
                }
            }
            Err(error) => {
                tracing::warn!(%error, "final answer refinement failed, returning draft");
                non_empty_draft(draft)
            }
        }
    }
}

fn non_empty_draft(draft: &str) -> String {
    let trimmed = draft.trim();
    if trimmed.is_empty() {
        EMPTY_FALLBACK.to_string()
    } else {
        trimmed.to_string()
    }
}
