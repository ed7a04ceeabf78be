//! Document generation node with a bounded length-failure retry.

use crate::agent::state::GeneratedDocument;
use crate::error::{Error, LlmError, Result};
use crate::llm::{parse_json_completion, ChatModel, ChatRequest};
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are a workspace document drafting assistant. \
Produce a page draft following these rules:\n\
- Respond with JSON only: {\"title\": string, \"summary\": string, \"content\": string}.\n\
- title is concise, at most 80 characters.\n\
- summary captures the essentials in two or three sentences.\n\
- content is Markdown with a heading per section; use lists and tables where they help. \
Aim for roughly 1500-2000 characters of body content.\n\
- Use only facts from the provided context; do not invent new ones.";

const SUMMARIZE_FIRST: &str = "\nThe previous draft exceeded the output budget. \
Summarize first: produce a tighter document that fits comfortably.";

pub struct GenerateNode {
    model: Arc<dyn ChatModel>,
    max_tokens: u32,
}

impl GenerateNode {
    pub fn new(model: Arc<dyn ChatModel>, max_tokens: u32) -> Self {
        Self { model, max_tokens }
    }

    /// Draft a document from the query, optional retrieval context and the
    /// decision's instructions.
    ///
    /// A truncated completion retries once with an elevated budget and a
    /// summarize-first instruction. A second failure degrades to a fallback
    /// summary (`degraded = true`); it is never a hard error.
    pub async fn generate(
        &self,
        query: &str,
        context: &str,
        instructions: Option<&str>,
        title_hint: Option<&str>,
    ) -> Result<(GeneratedDocument, bool)> {
        let user = format!(
            "User request: {query}\n\
             Drafting instructions: {}\n\
             Reference context:\n-----BEGIN CONTEXT-----\n{}\n-----END CONTEXT-----",
            instructions.unwrap_or("(none)"),
            if context.is_empty() {
                "(no context provided)"
            } else {
                context
            },
        );

        match self.attempt(SYSTEM_PROMPT, &user, self.max_tokens).await {
            Ok(document) => Ok((document, false)),
            Err(Error::Llm(LlmError::LengthExceeded)) => {
                tracing::debug!("generation hit the token budget, retrying with summarize-first");
                let system = format!("{SYSTEM_PROMPT}{SUMMARIZE_FIRST}");
                match self
                    .attempt(&system, &user, self.max_tokens.saturating_mul(2))
                    .await
                {
                    Ok(document) => Ok((document, false)),
                    Err(error) => {
                        tracing::warn!(%error, "generation retry failed, using fallback summary");
                        Ok((fallback_document(query, title_hint), true))
                    }
                }
            }
            Err(Error::Llm(LlmError::ParsingFailed(message))) => {
                tracing::warn!(message, "generator returned non-conforming output");
                Ok((fallback_document(query, title_hint), true))
            }
            Err(error) => Err(error),
        }
    }

    async fn attempt(&self, system: &str, user: &str, max_tokens: u32) -> Result<GeneratedDocument> {
        let request = ChatRequest::new(system, user)
            .with_temperature(0.2)
            .with_max_tokens(max_tokens)
            .expect_json();

        let raw = self.model.complete(request).await?;
        let payload = parse_json_completion(&raw)?;

        let content = payload["content"].as_str().unwrap_or("").trim().to_string();
        if content.is_empty() {
            return Err(LlmError::ParsingFailed("generated content is empty".into()).into());
        }

        Ok(GeneratedDocument {
            title: payload["title"].as_str().unwrap_or("").trim().to_string(),
            summary: payload["summary"].as_str().unwrap_or("").trim().to_string(),
            content,
        })
    }
}

fn fallback_document(query: &str, title_hint: Option<&str>) -> GeneratedDocument {
    let title = title_hint
        .map(str::to_string)
        .unwrap_or_else(|| "Draft".to_string());
    GeneratedDocument {
        title,
        summary: String::new(),
        content: format!(
            "The requested document could not be fully drafted this time.\n\n\
             Request: {query}"
        ),
    }
}
