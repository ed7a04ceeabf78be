//! Library facade: the inbound operations consumed by the REST adapter.
//!
//! Sync runs for the same workspace are serialized by an in-process lock;
//! queries carry a cancellation token and a wall-clock budget.

use crate::agent::state::AgentExecutionResult;
use crate::agent::{AgentOrchestrator, QueryOptions};
use crate::config::ArcanaConfig;
use crate::db::{Database, RagIndexMeta, DEFAULT_RAG_INDEX_NAME};
use crate::embedding::{AzureEmbedder, Embedder};
use crate::error::{AuthError, Error, Result};
use crate::gdrive::client::HttpDriveClient;
use crate::gdrive::sync::{DriveSyncReport, DriveSyncWorker};
use crate::index::RetrievalIndex;
use crate::llm::{AzureChatModel, ChatModel};
use crate::notion::client::{HttpNotionClient, NotionApi, NotionPageRef, PageBatch};
use crate::notion::sync::{NotionSyncReport, NotionSyncWorker, SyncMode};
use crate::oauth::{CredentialKey, Provider, StateStore, TokenProvider};
use crate::record::SourceType;
use crate::workspace::WorkspaceContext;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The workspace knowledge & agent core.
pub struct Arcana {
    config: ArcanaConfig,
    db: Database,
    tokens: Arc<TokenProvider>,
    embedder: Arc<dyn Embedder>,
    decision_model: Arc<dyn ChatModel>,
    chat_model: Arc<dyn ChatModel>,
    final_answer_model: Arc<dyn ChatModel>,
    state_store: StateStore,
    sync_locks: Mutex<HashMap<(i64, SourceType), Arc<Mutex<()>>>>,
}

impl Arcana {
    /// Wire the core against the configured HTTP deployments.
    pub fn new(config: ArcanaConfig, db: Database) -> Self {
        let tokens = Arc::new(TokenProvider::new(
            db.clone(),
            config.notion_app.clone(),
            config.google_app.clone(),
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(AzureEmbedder::new(
            config.embedding.clone(),
            config.timeouts.embedding,
        ));
        let decision_model: Arc<dyn ChatModel> = Arc::new(AzureChatModel::new(
            config.decision.clone(),
            config.timeouts.llm,
        ));
        let chat_model: Arc<dyn ChatModel> =
            Arc::new(AzureChatModel::new(config.chat.clone(), config.timeouts.llm));
        let final_answer_model: Arc<dyn ChatModel> = Arc::new(AzureChatModel::new(
            config.final_answer.clone(),
            config.timeouts.llm,
        ));

        Self {
            config,
            db,
            tokens,
            embedder,
            decision_model,
            chat_model,
            final_answer_model,
            state_store: StateStore::default(),
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the core with injected capabilities (tests, alternative stacks).
    pub fn with_capabilities(
        config: ArcanaConfig,
        db: Database,
        embedder: Arc<dyn Embedder>,
        decision_model: Arc<dyn ChatModel>,
        chat_model: Arc<dyn ChatModel>,
        final_answer_model: Arc<dyn ChatModel>,
    ) -> Self {
        let tokens = Arc::new(TokenProvider::new(
            db.clone(),
            config.notion_app.clone(),
            config.google_app.clone(),
        ));
        Self {
            config,
            db,
            tokens,
            embedder,
            decision_model,
            chat_model,
            final_answer_model,
            state_store: StateStore::default(),
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn token_provider(&self) -> Arc<TokenProvider> {
        self.tokens.clone()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Open (or create) the retrieval index of a workspace.
    pub async fn open_index(&self, workspace: &WorkspaceContext) -> Result<RetrievalIndex> {
        RetrievalIndex::open(
            workspace,
            self.embedder.clone(),
            self.config.retrieval.clone(),
        )
        .await
    }

    /// Serializes sync runs per `(workspace, source)`. Two refreshes of the
    /// same workspace against different sources proceed concurrently; against
    /// the same source the second waits.
    async fn sync_lock(&self, workspace_id: i64, source_type: SourceType) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().await;
        locks
            .entry((workspace_id, source_type))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Pull Notion pages into the workspace index.
    pub async fn ingest_notion(
        &self,
        workspace: &WorkspaceContext,
        credential: CredentialKey,
        mode: SyncMode,
    ) -> Result<NotionSyncReport> {
        let lock = self
            .sync_lock(workspace.workspace_id, SourceType::Notion)
            .await;
        let _guard = lock.lock().await;

        let index = self.open_index(workspace).await?;
        self.mark_index_status(workspace, &index, "building").await?;

        let api: Arc<dyn NotionApi> = Arc::new(HttpNotionClient::new(
            self.tokens.clone(),
            credential,
            self.config.timeouts.provider,
        ));
        let worker = NotionSyncWorker::new(api, self.db.clone(), self.config.chunking);
        let cancel = CancellationToken::new();

        let outcome = worker
            .pull(workspace, &index, credential.data_source_id, mode, &cancel)
            .await;

        match outcome {
            Ok(report) => {
                self.mark_index_status(workspace, &index, "ready").await?;
                Ok(report)
            }
            Err(err) => {
                if let Err(meta_err) = self.mark_index_status(workspace, &index, "failed").await {
                    tracing::warn!(error = %meta_err, "failed to record index failure status");
                }
                Err(err)
            }
        }
    }

    /// Pull Google Drive changes into the workspace index.
    pub async fn ingest_gdrive(
        &self,
        workspace: &WorkspaceContext,
        credential: CredentialKey,
    ) -> Result<DriveSyncReport> {
        let lock = self
            .sync_lock(workspace.workspace_id, SourceType::Gdrive)
            .await;
        let _guard = lock.lock().await;

        let index = self.open_index(workspace).await?;
        self.mark_index_status(workspace, &index, "building").await?;

        let root_folder_id = self.resolve_root_folder(credential).await?;
        let api = Arc::new(HttpDriveClient::new(
            self.tokens.clone(),
            credential,
            self.config.timeouts.provider,
        ));
        let worker = DriveSyncWorker::new(api, self.db.clone(), self.config.chunking);
        let cancel = CancellationToken::new();

        let outcome = worker
            .pull(
                workspace,
                &index,
                credential.data_source_id,
                &root_folder_id,
                &cancel,
            )
            .await;

        match outcome {
            Ok(report) => {
                self.mark_index_status(workspace, &index, "ready").await?;
                Ok(report)
            }
            Err(err) => {
                if let Err(meta_err) = self.mark_index_status(workspace, &index, "failed").await {
                    tracing::warn!(error = %meta_err, "failed to record index failure status");
                }
                Err(err)
            }
        }
    }

    /// Remove one provider's records, credentials and sync state.
    pub async fn disconnect(
        &self,
        source_type: SourceType,
        workspace: &WorkspaceContext,
        data_source_id: i64,
    ) -> Result<()> {
        let lock = self
            .sync_lock(workspace.workspace_id, source_type)
            .await;
        let _guard = lock.lock().await;

        let index = self.open_index(workspace).await?;
        let removed = index.delete_by_source_type(source_type).await?;

        let provider = match source_type {
            SourceType::Notion => Provider::Notion,
            SourceType::Gdrive => Provider::GoogleDrive,
        };
        self.tokens.delete_credentials(provider, data_source_id).await?;
        match source_type {
            SourceType::Notion => self.db.delete_notion_sync_state(data_source_id).await?,
            SourceType::Gdrive => self.db.delete_drive_sync_state(data_source_id).await?,
        }

        self.mark_index_status(workspace, &index, "ready").await?;
        tracing::info!(
            source_type = source_type.as_str(),
            workspace_id = workspace.workspace_id,
            removed,
            "source disconnected"
        );
        Ok(())
    }

    /// Answer one user query through the agent graph.
    ///
    /// `notion_credential` enables the create-page path; without it, generate
    /// requests surface a reconnect-required failure when they reach
    /// publication.
    pub async fn query(
        &self,
        workspace: &WorkspaceContext,
        user_id: i64,
        query: &str,
        options: QueryOptions,
        notion_credential: Option<CredentialKey>,
    ) -> Result<AgentExecutionResult> {
        let cancel = CancellationToken::new();
        self.query_with_cancel(workspace, user_id, query, options, notion_credential, &cancel)
            .await
    }

    /// `query` with a caller-owned cancellation token.
    pub async fn query_with_cancel(
        &self,
        workspace: &WorkspaceContext,
        user_id: i64,
        query: &str,
        options: QueryOptions,
        notion_credential: Option<CredentialKey>,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query is empty".into()));
        }

        let index = self.open_index(workspace).await?;
        let notion: Arc<dyn NotionApi> = match notion_credential {
            Some(credential) => Arc::new(HttpNotionClient::new(
                self.tokens.clone(),
                credential,
                self.config.timeouts.provider,
            )),
            None => Arc::new(DisconnectedNotion),
        };

        let orchestrator = AgentOrchestrator::new(
            self.decision_model.clone(),
            self.chat_model.clone(),
            self.final_answer_model.clone(),
            notion,
            self.config.doc_gen_max_tokens,
        );

        let run = orchestrator.run(workspace, &index, user_id, query, &options, cancel);
        match tokio::time::timeout(self.config.timeouts.request_budget, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    async fn mark_index_status(
        &self,
        workspace: &WorkspaceContext,
        index: &RetrievalIndex,
        status: &str,
    ) -> Result<()> {
        let counts = index.counts().await.unwrap_or_default();
        let meta = RagIndexMeta {
            workspace_id: workspace.workspace_id,
            name: DEFAULT_RAG_INDEX_NAME.to_string(),
            engine: "lancedb".to_string(),
            storage_uri: workspace.storage_root.to_string_lossy().into_owned(),
            dim: index.dim().await.map(|d| d as i64),
            status: status.to_string(),
            object_count: counts.object_count as i64,
            vector_count: counts.vector_count as i64,
            updated_at: Some(Utc::now()),
        };
        self.db.save_rag_index_meta(&meta).await
    }

    async fn resolve_root_folder(&self, credential: CredentialKey) -> Result<String> {
        let cred = self.tokens.credential(credential).await?;
        let payload = &cred.provider_payload;
        let root = payload
            .get("workspace_root_id")
            .or_else(|| payload.get("root_folder_id"))
            .or_else(|| payload.get("selected_folder_id"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("root");
        Ok(root.to_string())
    }
}

/// Stand-in when no Notion credential accompanies a query: every call is a
/// reconnect-required failure.
struct DisconnectedNotion;

#[async_trait]
impl NotionApi for DisconnectedNotion {
    async fn search_pages(&self, _cursor: Option<&str>) -> Result<PageBatch> {
        Err(AuthError::MissingCredential("notion".into()).into())
    }

    async fn block_tree(&self, _page_id: &str) -> Result<Vec<crate::notion::client::Block>> {
        Err(AuthError::MissingCredential("notion".into()).into())
    }

    async fn create_page(
        &self,
        _title: &str,
        _children: Vec<serde_json::Value>,
    ) -> Result<NotionPageRef> {
        Err(AuthError::MissingCredential("notion".into()).into())
    }
}
