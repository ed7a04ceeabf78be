//! Intent classifier node: one constrained-JSON LLM call.

use crate::agent::state::{AgentDecision, AgentMode};
use crate::error::{LlmError, Result};
use crate::llm::{parse_json_completion, ChatModel, ChatRequest};
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are the routing assistant of a workspace knowledge agent. \
Read the user's request and pick exactly one mode:\n\
1. search: the user wants to locate, confirm or ask about existing workspace documents.\n\
2. generate: the user wants a new document or draft to be written.\n\
3. chat: small talk or a question needing neither documents nor drafting.\n\
If a generate request should build on existing workspace documents (e.g. \
'write a report based on last week's meeting notes'), set use_rag to true; \
if the user only asks for a fresh document without referencing existing ones, \
use_rag is false.\n\
Respond with JSON only, matching:\n\
{\"mode\": \"search|generate|chat\", \"use_rag\": bool, \"rationale\": string, \
\"title_hint\": string|null, \"instructions\": string|null, \
\"final_message_instructions\": string|null}";

pub struct DecideNode {
    model: Arc<dyn ChatModel>,
}

impl DecideNode {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Classify the query. Returns `LlmError::ParsingFailed` when the model
    /// output does not conform; the router treats that as chat.
    pub async fn decide(&self, query: &str) -> Result<AgentDecision> {
        let request = ChatRequest::new(SYSTEM_PROMPT, format!("User request: {query}"))
            .with_temperature(0.0)
            .with_max_tokens(300)
            .expect_json();

        let raw = self.model.complete(request).await?;
        let payload = parse_json_completion(&raw)?;

        let mode = match payload["mode"].as_str() {
            Some("search") => AgentMode::Search,
            Some("generate") => AgentMode::Generate,
            Some("chat") => AgentMode::Chat,
            other => {
                return Err(LlmError::ParsingFailed(format!(
                    "unknown mode in decision: {other:?}"
                ))
                .into());
            }
        };

        let optional = |key: &str| -> Option<String> {
            payload[key]
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(AgentDecision {
            mode,
            use_rag: payload["use_rag"].as_bool().unwrap_or(false),
            rationale: payload["rationale"].as_str().unwrap_or("").trim().to_string(),
            title_hint: optional("title_hint"),
            instructions: optional("instructions"),
            final_message_instructions: optional("final_message_instructions"),
        })
    }
}
