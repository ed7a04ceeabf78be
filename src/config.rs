//! Environment-driven configuration for retrieval, chunking, deployments and
//! provider OAuth apps.

use std::path::PathBuf;
use std::time::Duration;

/// One Azure-OpenAI-style deployment: shared endpoint + named deployment.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub deployment: String,
}

/// OAuth application registration for one provider.
#[derive(Debug, Clone)]
pub struct OauthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Retrieval and fusion defaults.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Default number of results returned by search.
    pub top_k: usize,
    /// RRF vector weight, clamped to (0, 1].
    pub hybrid_alpha: f32,
    /// RRF rank smoothing constant.
    pub hybrid_rrf_k: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            hybrid_alpha: 0.6,
            hybrid_rrf_k: 60,
        }
    }
}

/// Chunking policy.
#[derive(Debug, Clone, Copy)]
pub struct ChunkConfig {
    /// Token budget per record.
    pub chunk_size: usize,
    /// Overlap fraction of the chunk size, 0 <= r < 1.
    pub overlap_ratio: f32,
}

impl ChunkConfig {
    /// Overlap in tokens: `max(0, min(chunk_size - 1, round(chunk_size * ratio)))`.
    pub fn overlap(&self) -> usize {
        let raw = (self.chunk_size as f32 * self.overlap_ratio).round() as usize;
        raw.min(self.chunk_size.saturating_sub(1))
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            overlap_ratio: 0.10,
        }
    }
}

/// Per-call and per-request time budgets.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub llm: Duration,
    pub provider: Duration,
    pub embedding: Duration,
    pub request_budget: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            llm: Duration::from_secs(30),
            provider: Duration::from_secs(60),
            embedding: Duration::from_secs(10),
            request_budget: Duration::from_secs(120),
        }
    }
}

/// Full crate configuration.
#[derive(Debug, Clone)]
pub struct ArcanaConfig {
    pub storage_root: PathBuf,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkConfig,
    pub timeouts: TimeoutConfig,
    /// Deployment used by the search/generate/chat nodes.
    pub chat: Deployment,
    /// Deployment used by the decide node. Falls back to `chat`.
    pub decision: Deployment,
    /// Dedicated deployment used by the final_answer node.
    pub final_answer: Deployment,
    /// Embedding deployment.
    pub embedding: Deployment,
    pub doc_gen_max_tokens: u32,
    pub notion_app: OauthApp,
    pub google_app: OauthApp,
}

fn env_var(name: &str) -> crate::error::Result<String> {
    std::env::var(name)
        .map_err(|_| crate::error::Error::Validation(format!("missing environment variable {name}")))
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ArcanaConfig {
    /// Load the configuration from the environment.
    ///
    /// Deployment and OAuth variables are required; tuning knobs fall back to
    /// their defaults when unset or unparsable.
    pub fn from_env() -> crate::error::Result<Self> {
        let endpoint = env_var("AZURE_OPENAI_ENDPOINT")?;
        let api_key = env_var("AZURE_OPENAI_API_KEY")?;
        let api_version = env_or(
            "AZURE_OPENAI_API_VERSION",
            "2024-08-01-preview".to_string(),
        );

        let deployment = |name: &str| -> crate::error::Result<Deployment> {
            Ok(Deployment {
                endpoint: endpoint.clone(),
                api_key: api_key.clone(),
                api_version: api_version.clone(),
                deployment: env_var(name)?,
            })
        };

        let chat = deployment("CHAT_DEPLOYMENT")?;
        let decision = match std::env::var("DECISION_DEPLOYMENT") {
            Ok(name) => Deployment {
                deployment: name,
                ..chat.clone()
            },
            Err(_) => chat.clone(),
        };

        let retrieval = RetrievalConfig {
            top_k: env_or("TOP_K", 5),
            hybrid_alpha: env_or("HYBRID_ALPHA", 0.6),
            hybrid_rrf_k: env_or("HYBRID_RRF_K", 60),
        };

        let chunking = ChunkConfig {
            chunk_size: env_or("RAG_CHUNK_SIZE", 800),
            overlap_ratio: env_or("RAG_CHUNK_OVERLAP_RATIO", 0.10),
        };

        let timeouts = TimeoutConfig {
            llm: Duration::from_secs(env_or("LLM_TIMEOUT_SECS", 30)),
            provider: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 60)),
            embedding: Duration::from_secs(env_or("EMBED_TIMEOUT_SECS", 10)),
            request_budget: Duration::from_secs(env_or("REQUEST_BUDGET_SECS", 120)),
        };

        Ok(Self {
            storage_root: PathBuf::from(env_or(
                "WORKSPACE_STORAGE_ROOT",
                "./storage/workspace".to_string(),
            )),
            retrieval,
            chunking,
            timeouts,
            chat,
            decision,
            final_answer: deployment("FINAL_ANSWER_DEPLOYMENT")?,
            embedding: deployment("EMBED_DEPLOYMENT")?,
            doc_gen_max_tokens: env_or("DOC_GEN_MAX_TOKENS", 1600),
            notion_app: OauthApp {
                client_id: env_var("NOTION_CLIENT_ID")?,
                client_secret: env_var("NOTION_CLIENT_SECRET")?,
                redirect_uri: env_var("NOTION_REDIRECT_URI")?,
            },
            google_app: OauthApp {
                client_id: env_var("GOOGLE_CLIENT_ID")?,
                client_secret: env_var("GOOGLE_CLIENT_SECRET")?,
                redirect_uri: env_var("GOOGLE_REDIRECT_URI")?,
            },
        })
    }
}
