//! Notion API seam and the reqwest implementation.

use crate::error::{ProviderError, Result};
use crate::oauth::{CredentialKey, TokenProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const NOTION_API_BASE: &str = "https://api.notion.com/v1";
/// Explicit version header for consistent payload shapes.
const NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;
/// Transient failures are retried this many times before surfacing.
const MAX_RETRIES: u32 = 2;

/// Page metadata from the search endpoint.
#[derive(Debug, Clone)]
pub struct PageMeta {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub last_edited_time: Option<DateTime<Utc>>,
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct PageBatch {
    pub pages: Vec<PageMeta>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// A block with its textual payload; children are populated recursively
/// except under `child_page` (nested pages are pulled separately).
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub block_type: String,
    pub data: Value,
    pub children: Vec<Block>,
}

/// Reference to a created page.
#[derive(Debug, Clone)]
pub struct NotionPageRef {
    pub page_id: String,
    pub url: String,
    pub title: String,
}

/// Notion API capability used by the sync worker and the create_page node.
#[async_trait]
pub trait NotionApi: Send + Sync {
    /// One page of the bot-visible page listing, sorted by last_edited_time
    /// descending.
    async fn search_pages(&self, cursor: Option<&str>) -> Result<PageBatch>;
    /// Full block tree of a page (child_page bodies excluded).
    async fn block_tree(&self, page_id: &str) -> Result<Vec<Block>>;
    /// Create a workspace-level page with the given children blocks.
    async fn create_page(&self, title: &str, children: Vec<Value>) -> Result<NotionPageRef>;
}

/// reqwest-backed client; a fresh access token is resolved per call.
pub struct HttpNotionClient {
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    credential: CredentialKey,
    base_url: String,
}

impl HttpNotionClient {
    pub fn new(tokens: Arc<TokenProvider>, credential: CredentialKey, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            tokens,
            credential,
            base_url: NOTION_API_BASE.to_string(),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0u32;
        loop {
            let token = self.tokens.access_token(self.credential).await?;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .header("Notion-Version", NOTION_VERSION);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    if attempt < MAX_RETRIES {
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                        continue;
                    }
                    return Err(ProviderError::Unavailable(error.to_string()).into());
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                return Err(ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                }
                .into());
            }
            if status.is_server_error() && attempt < MAX_RETRIES {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    message,
                }
                .into());
            }

            return response
                .json()
                .await
                .map_err(|e| ProviderError::Unavailable(e.to_string()).into());
        }
    }

    async fn block_children(&self, block_id: &str) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut path = format!("/blocks/{block_id}/children?page_size={PAGE_SIZE}");
            if let Some(ref cursor) = cursor {
                path.push_str(&format!("&start_cursor={cursor}"));
            }
            let payload = self.request(reqwest::Method::GET, &path, None).await?;
            if let Some(batch) = payload["results"].as_array() {
                results.extend(batch.iter().cloned());
            }
            if !payload["has_more"].as_bool().unwrap_or(false) {
                break;
            }
            cursor = payload["next_cursor"].as_str().map(str::to_string);
        }
        Ok(results)
    }

    fn build_tree<'a>(&'a self, raw_blocks: Vec<Value>) -> BoxFuture<'a, Result<Vec<Block>>> {
        Box::pin(async move {
            let mut blocks = Vec::new();
            for raw in raw_blocks {
                let block_type = raw["type"].as_str().unwrap_or("").to_string();
                let id = raw["id"].as_str().unwrap_or("").to_string();
                let data = raw.get(&block_type).cloned().unwrap_or(Value::Null);
                let has_children = raw["has_children"].as_bool().unwrap_or(false);

                // Nested pages are enumerated and pulled on their own; only
                // the title survives here.
                let children = if has_children && block_type != "child_page" {
                    let raw_children = self.block_children(&id).await?;
                    self.build_tree(raw_children).await?
                } else {
                    Vec::new()
                };

                blocks.push(Block {
                    id,
                    block_type,
                    data,
                    children,
                });
            }
            Ok(blocks)
        })
    }
}

#[async_trait]
impl NotionApi for HttpNotionClient {
    async fn search_pages(&self, cursor: Option<&str>) -> Result<PageBatch> {
        let mut body = serde_json::json!({
            "filter": {"property": "object", "value": "page"},
            "sort": {"direction": "descending", "timestamp": "last_edited_time"},
            "page_size": PAGE_SIZE,
        });
        if let Some(cursor) = cursor {
            body["start_cursor"] = Value::String(cursor.to_string());
        }

        let payload = self
            .request(reqwest::Method::POST, "/search", Some(&body))
            .await?;

        let pages = payload["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .filter(|item| item["object"].as_str() == Some("page"))
                    .map(parse_page_meta)
                    .collect()
            })
            .unwrap_or_default();

        Ok(PageBatch {
            pages,
            next_cursor: payload["next_cursor"].as_str().map(str::to_string),
            has_more: payload["has_more"].as_bool().unwrap_or(false),
        })
    }

    async fn block_tree(&self, page_id: &str) -> Result<Vec<Block>> {
        let raw = self.block_children(page_id).await?;
        self.build_tree(raw).await
    }

    async fn create_page(&self, title: &str, children: Vec<Value>) -> Result<NotionPageRef> {
        let title = if title.trim().is_empty() {
            "Untitled"
        } else {
            title
        };
        let body = serde_json::json!({
            "parent": {"type": "workspace", "workspace": true},
            "properties": {
                "title": {"title": crate::notion::blocks::rich_text(title, 400)},
            },
            "children": children,
        });

        let payload = self
            .request(reqwest::Method::POST, "/pages", Some(&body))
            .await?;

        Ok(NotionPageRef {
            page_id: payload["id"].as_str().unwrap_or("").to_string(),
            url: payload["url"].as_str().unwrap_or("").to_string(),
            title: title.to_string(),
        })
    }
}

fn parse_page_meta(page: &Value) -> PageMeta {
    PageMeta {
        id: page["id"].as_str().unwrap_or("").to_string(),
        title: extract_page_title(page),
        url: page["url"].as_str().map(str::to_string),
        last_edited_time: page["last_edited_time"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// Best-effort page title: the first `title`-typed property, then the
/// top-level `title` array (databases), then the URL or id.
pub fn extract_page_title(page: &Value) -> String {
    if let Some(properties) = page["properties"].as_object() {
        for value in properties.values() {
            if value["type"].as_str() == Some("title") {
                let joined = flatten_plain_text(&value["title"]);
                if !joined.is_empty() {
                    return joined;
                }
            }
        }
    }
    let joined = flatten_plain_text(&page["title"]);
    if !joined.is_empty() {
        return joined;
    }
    page["url"]
        .as_str()
        .or_else(|| page["id"].as_str())
        .unwrap_or("")
        .to_string()
}

fn flatten_plain_text(items: &Value) -> String {
    items
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["plain_text"].as_str())
                .collect::<Vec<_>>()
                .join("")
                .trim()
                .to_string()
        })
        .unwrap_or_default()
}

/// Canonical page URL when the search payload carries none.
pub fn compose_page_url(page_id: &str) -> String {
    format!("https://www.notion.so/{}", page_id.replace('-', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_comes_from_title_property() {
        let page = serde_json::json!({
            "id": "p1",
            "properties": {
                "Name": {"type": "title", "title": [
                    {"plain_text": "Q3 "}, {"plain_text": "Review"}
                ]},
                "Status": {"type": "select"},
            },
        });
        assert_eq!(extract_page_title(&page), "Q3 Review");
    }

    #[test]
    fn title_falls_back_to_top_level_then_id() {
        let page = serde_json::json!({
            "id": "p2",
            "title": [{"plain_text": "Database Title"}],
        });
        assert_eq!(extract_page_title(&page), "Database Title");

        let page = serde_json::json!({"id": "p3"});
        assert_eq!(extract_page_title(&page), "p3");
    }

    #[test]
    fn compose_url_strips_dashes() {
        assert_eq!(
            compose_page_url("123e4567-e89b-12d3-a456-426614174000"),
            "https://www.notion.so/123e4567e89b12d3a456426614174000"
        );
    }
}
