//! Conversational node: short replies, no retrieval.

use crate::llm::{ChatModel, ChatRequest};
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are the conversational assistant of a workspace \
knowledge platform that can search connected data sources and draft documents. \
Reply to the user in two to four friendly, concise sentences. Do not mention \
specific workspace documents or external links; if you lack material, say so \
honestly.";

const FALLBACK_REPLY: &str =
    "I couldn't put together a reply just now. Could you say that again?";

pub struct ChatNode {
    model: Arc<dyn ChatModel>,
}

impl ChatNode {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Produce a short reply; failures degrade to a canned line.
    pub async fn respond(&self, query: &str) -> String {
        let request = ChatRequest::new(SYSTEM_PROMPT, format!("User message: {query}"))
            .with_temperature(0.4)
            .with_max_tokens(400);

        match self.model.complete(request).await {
            Ok(answer) => {
                let cleaned = answer.trim().to_string();
                if cleaned.is_empty() {
                    FALLBACK_REPLY.to_string()
                } else {
                    cleaned
                }
            }
            Err(error) => {
                tracing::warn!(%error, "chat completion failed");
                FALLBACK_REPLY.to_string()
            }
        }
    }
}
