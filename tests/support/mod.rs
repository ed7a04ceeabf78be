//! Shared test doubles: deterministic embedder, scripted chat models, and
//! in-memory provider APIs with observable call counters.

#![allow(dead_code)]

use arcana::embedding::Embedder;
use arcana::error::{ProviderError, Result};
use arcana::gdrive::client::{ChangePage, DriveApi, RawChange};
use arcana::llm::{ChatModel, ChatRequest};
use arcana::notion::client::{Block, NotionApi, NotionPageRef, PageBatch, PageMeta};
use arcana::record::{SourceRecord, SourceType, StructuredFormat};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub const EMBED_DIM: usize = 16;

/// Deterministic bag-of-words embedder: shared words produce nearby vectors.
#[derive(Default)]
pub struct MockEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBED_DIM];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        vector[(hasher.finish() as usize) % EMBED_DIM] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

type Responder = Box<dyn Fn(&ChatRequest) -> Result<String> + Send + Sync>;

/// Chat model driven by a closure, with a call counter.
pub struct ScriptedChatModel {
    respond: Responder,
    pub calls: AtomicUsize,
}

impl ScriptedChatModel {
    pub fn new(respond: impl Fn(&ChatRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same string.
    pub fn fixed(answer: impl Into<String>) -> Self {
        let answer = answer.into();
        Self::new(move |_| Ok(answer.clone()))
    }

    /// A finalizer that returns the draft untouched.
    pub fn passthrough_finalizer() -> Self {
        Self::new(|request| {
            let draft = request
                .user
                .split("Draft (answer_draft):\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\nRewrite the draft").next())
                .unwrap_or("");
            Ok(draft.to_string())
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(&request)
    }
}

/// In-memory Notion workspace.
#[derive(Default)]
pub struct MockNotion {
    pub pages: Mutex<Vec<(PageMeta, Vec<Block>)>>,
    pub created: Mutex<Vec<(String, Vec<Value>)>>,
    pub rate_limit_once: AtomicBool,
    pub search_calls: AtomicUsize,
    pub tree_calls: AtomicUsize,
}

impl MockNotion {
    pub fn with_pages(pages: Vec<(PageMeta, Vec<Block>)>) -> Self {
        Self {
            pages: Mutex::new(pages),
            ..Default::default()
        }
    }

    pub fn created_pages(&self) -> Vec<(String, Vec<Value>)> {
        self.created.lock().expect("created lock").clone()
    }
}

#[async_trait]
impl NotionApi for MockNotion {
    async fn search_pages(&self, _cursor: Option<&str>) -> Result<PageBatch> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.rate_limit_once.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 1,
            }
            .into());
        }
        let pages = self
            .pages
            .lock()
            .expect("pages lock")
            .iter()
            .map(|(meta, _)| meta.clone())
            .collect();
        Ok(PageBatch {
            pages,
            next_cursor: None,
            has_more: false,
        })
    }

    async fn block_tree(&self, page_id: &str) -> Result<Vec<Block>> {
        self.tree_calls.fetch_add(1, Ordering::SeqCst);
        let pages = self.pages.lock().expect("pages lock");
        pages
            .iter()
            .find(|(meta, _)| meta.id == page_id)
            .map(|(_, blocks)| blocks.clone())
            .ok_or_else(|| {
                ProviderError::Api {
                    status: 404,
                    message: format!("page {page_id} not found"),
                }
                .into()
            })
    }

    async fn create_page(&self, title: &str, children: Vec<Value>) -> Result<NotionPageRef> {
        self.created
            .lock()
            .expect("created lock")
            .push((title.to_string(), children));
        Ok(NotionPageRef {
            page_id: "created-page".into(),
            url: "https://www.notion.so/createdpage".into(),
            title: title.to_string(),
        })
    }
}

/// In-memory Drive changes stream.
#[derive(Default)]
pub struct MockDrive {
    pub changes: Mutex<Vec<RawChange>>,
    pub parents: Mutex<HashMap<String, Vec<String>>>,
    pub new_start_page_token: String,
    pub export_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
}

impl MockDrive {
    pub fn with_changes(changes: Vec<RawChange>) -> Self {
        Self {
            changes: Mutex::new(changes),
            new_start_page_token: "token-next".into(),
            ..Default::default()
        }
    }

    pub fn conversion_calls(&self) -> usize {
        self.export_calls.load(Ordering::SeqCst) + self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriveApi for MockDrive {
    async fn start_page_token(&self) -> Result<String> {
        Ok("token-0".into())
    }

    async fn list_files_under(
        &self,
        _root_id: &str,
    ) -> Result<Vec<arcana::gdrive::client::DriveFileMeta>> {
        Ok(Vec::new())
    }

    async fn list_changes(&self, _page_token: &str) -> Result<ChangePage> {
        Ok(ChangePage {
            changes: self.changes.lock().expect("changes lock").clone(),
            next_page_token: None,
            new_start_page_token: Some(self.new_start_page_token.clone()),
        })
    }

    async fn file_parents(&self, file_id: &str) -> Result<Vec<String>> {
        Ok(self
            .parents
            .lock()
            .expect("parents lock")
            .get(file_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn export_pdf(&self, _file_id: &str) -> Result<Vec<u8>> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Unavailable("export not scripted".into()).into())
    }

    async fn copy_export_pdf(&self, _file_id: &str, _mime_type: &str) -> Result<Vec<u8>> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Unavailable("export not scripted".into()).into())
    }

    async fn export_docx(&self, _file_id: &str) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Unavailable("export not scripted".into()).into())
    }

    async fn download(&self, _file_id: &str) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Unavailable("download not scripted".into()).into())
    }
}

/// Construct a record for direct index seeding.
pub fn record(
    source_type: SourceType,
    source_id: &str,
    chunk_ord: u32,
    title: &str,
    url: &str,
    text: &str,
) -> SourceRecord {
    SourceRecord {
        source_type,
        source_id: source_id.into(),
        chunk_ord,
        text: text.into(),
        title: title.into(),
        url: url.into(),
        workspace_id: 1,
        block_types: vec!["paragraph".into()],
        block_markers: vec!["P".into()],
        block_depths: vec![0],
        block_starts: vec![0],
        structured_format: StructuredFormat::None,
        structured_text: None,
        file_path: None,
        ingested_at: Utc::now(),
    }
}

/// Notion page + block fixtures.
pub fn page_meta(id: &str, title: &str, edited_secs_ago: i64) -> PageMeta {
    PageMeta {
        id: id.into(),
        title: title.into(),
        url: Some(format!("https://www.notion.so/{id}")),
        last_edited_time: Some(Utc::now() - chrono::Duration::seconds(edited_secs_ago)),
    }
}

pub fn paragraph_block(id: &str, text: &str) -> Block {
    Block {
        id: id.into(),
        block_type: "paragraph".into(),
        data: serde_json::json!({
            "rich_text": [{"plain_text": text, "annotations": {}}],
        }),
        children: Vec::new(),
    }
}

pub fn image_block(id: &str) -> Block {
    Block {
        id: id.into(),
        block_type: "image".into(),
        data: serde_json::json!({}),
        children: Vec::new(),
    }
}
