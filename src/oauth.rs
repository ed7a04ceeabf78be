//! OAuth credentials and the token provider.
//!
//! The token provider hands out guaranteed-fresh access tokens: a token within
//! 90 seconds of expiry is refreshed before use, and concurrent refreshes of
//! the same credential are coalesced onto one in-flight request.

use crate::config::OauthApp;
use crate::db::Database;
use crate::error::{AuthError, DbError, Result};
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const NOTION_TOKEN_URL: &str = "https://api.notion.com/v1/oauth/token";
const NOTION_AUTH_URL: &str = "https://api.notion.com/v1/oauth/authorize";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Tokens within this window of expiry are refreshed proactively.
const REFRESH_SAFETY_WINDOW_SECS: i64 = 90;

/// Supported OAuth providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Notion,
    GoogleDrive,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Notion => "notion",
            Provider::GoogleDrive => "googledrive",
        }
    }
}

/// Key identifying one stored credential row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub provider: Provider,
    pub user_id: i64,
    pub data_source_id: i64,
}

/// One OAuth credential row.
#[derive(Debug, Clone)]
pub struct OauthCredential {
    pub provider: Provider,
    pub user_id: i64,
    pub data_source_id: i64,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub provider_payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl OauthCredential {
    /// Whether the access token is missing or within the safety window of
    /// expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(expires) => {
                expires <= now + ChronoDuration::seconds(REFRESH_SAFETY_WINDOW_SECS)
            }
            None => false,
        }
    }
}

/// Refresh-on-expiry token provider over the credential store.
pub struct TokenProvider {
    db: Database,
    http: reqwest::Client,
    notion_app: OauthApp,
    google_app: OauthApp,
    /// Per-credential refresh locks; coalesces concurrent refreshes.
    refresh_locks: Mutex<HashMap<CredentialKey, Arc<Mutex<()>>>>,
}

impl TokenProvider {
    pub fn new(db: Database, notion_app: OauthApp, google_app: OauthApp) -> Self {
        Self {
            db,
            http: reqwest::Client::new(),
            notion_app,
            google_app,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Load a credential row.
    pub async fn credential(&self, key: CredentialKey) -> Result<OauthCredential> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, token_type, expires_at, provider_payload, updated_at \
             FROM oauth_credentials WHERE provider = ? AND data_source_id = ? AND user_id = ?",
        )
        .bind(key.provider.as_str())
        .bind(key.data_source_id)
        .bind(key.user_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::Sqlx)?
        .ok_or_else(|| AuthError::MissingCredential(key.provider.as_str().to_string()))?;

        let expires_at: Option<String> = row.get("expires_at");
        let payload: String = row.get("provider_payload");
        let updated_at: String = row.get("updated_at");

        Ok(OauthCredential {
            provider: key.provider,
            user_id: key.user_id,
            data_source_id: key.data_source_id,
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            token_type: row.get("token_type"),
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            provider_payload: serde_json::from_str(&payload).unwrap_or_default(),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    /// Persist a credential row (last-writer-wins on `updated_at`).
    pub async fn store_credential(&self, cred: &OauthCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_credentials
                (provider, user_id, data_source_id, access_token, refresh_token,
                 token_type, expires_at, provider_payload, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, data_source_id, user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                provider_payload = excluded.provider_payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(cred.provider.as_str())
        .bind(cred.user_id)
        .bind(cred.data_source_id)
        .bind(&cred.access_token)
        .bind(&cred.refresh_token)
        .bind(&cred.token_type)
        .bind(cred.expires_at.map(|dt| dt.to_rfc3339()))
        .bind(cred.provider_payload.to_string())
        .bind(cred.updated_at.to_rfc3339())
        .execute(self.db.pool())
        .await
        .map_err(DbError::Sqlx)?;
        Ok(())
    }

    /// Remove credential rows for a provider + data source (disconnect flow).
    pub async fn delete_credentials(&self, provider: Provider, data_source_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM oauth_credentials WHERE provider = ? AND data_source_id = ?")
            .bind(provider.as_str())
            .bind(data_source_id)
            .execute(self.db.pool())
            .await
            .map_err(DbError::Sqlx)?;
        Ok(())
    }

    /// Return a fresh access token, refreshing it first if it is within the
    /// safety window of expiry.
    pub async fn access_token(&self, key: CredentialKey) -> Result<String> {
        let cred = self.credential(key).await?;
        if !cred.needs_refresh(Utc::now()) {
            return Ok(cred.access_token);
        }

        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited for the lock.
        let cred = self.credential(key).await?;
        if !cred.needs_refresh(Utc::now()) {
            return Ok(cred.access_token);
        }

        let refreshed = self.refresh(cred).await?;
        Ok(refreshed.access_token)
    }

    async fn refresh(&self, cred: OauthCredential) -> Result<OauthCredential> {
        let refresh_token = cred.refresh_token.clone().ok_or_else(|| {
            AuthError::ReconnectRequired(format!(
                "{} credential has no refresh token",
                cred.provider.as_str()
            ))
        })?;

        let payload = match cred.provider {
            Provider::Notion => self.refresh_notion(&refresh_token).await,
            Provider::GoogleDrive => self.refresh_google(&refresh_token).await,
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    provider = cred.provider.as_str(),
                    data_source_id = cred.data_source_id,
                    error = %err,
                    "token refresh failed"
                );
                return Err(AuthError::ReconnectRequired(err).into());
            }
        };

        let mut updated = cred;
        apply_token_payload(&mut updated, &payload, Utc::now());
        self.store_credential(&updated).await?;
        tracing::debug!(
            provider = updated.provider.as_str(),
            data_source_id = updated.data_source_id,
            "access token refreshed"
        );
        Ok(updated)
    }

    async fn refresh_notion(&self, refresh_token: &str) -> std::result::Result<serde_json::Value, String> {
        let response = self
            .http
            .post(NOTION_TOKEN_URL)
            .basic_auth(&self.notion_app.client_id, Some(&self.notion_app.client_secret))
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(response.text().await.unwrap_or_default());
        }
        response.json().await.map_err(|e| e.to_string())
    }

    async fn refresh_google(&self, refresh_token: &str) -> std::result::Result<serde_json::Value, String> {
        let response = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.google_app.client_id.as_str()),
                ("client_secret", self.google_app.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(response.text().await.unwrap_or_default());
        }
        response.json().await.map_err(|e| e.to_string())
    }

    /// Exchange an authorization code for tokens and persist the credential.
    pub async fn exchange_code(
        &self,
        key: CredentialKey,
        code: &str,
    ) -> Result<OauthCredential> {
        let payload = match key.provider {
            Provider::Notion => {
                let response = self
                    .http
                    .post(NOTION_TOKEN_URL)
                    .basic_auth(&self.notion_app.client_id, Some(&self.notion_app.client_secret))
                    .json(&serde_json::json!({
                        "grant_type": "authorization_code",
                        "code": code,
                        "redirect_uri": self.notion_app.redirect_uri,
                    }))
                    .send()
                    .await
                    .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;
                if !response.status().is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AuthError::RefreshFailed(body).into());
                }
                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| AuthError::RefreshFailed(e.to_string()))?
            }
            Provider::GoogleDrive => {
                let response = self
                    .http
                    .post(GOOGLE_TOKEN_URL)
                    .form(&[
                        ("grant_type", "authorization_code"),
                        ("code", code),
                        ("client_id", self.google_app.client_id.as_str()),
                        ("client_secret", self.google_app.client_secret.as_str()),
                        ("redirect_uri", self.google_app.redirect_uri.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;
                if !response.status().is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AuthError::RefreshFailed(body).into());
                }
                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| AuthError::RefreshFailed(e.to_string()))?
            }
        };

        let mut cred = OauthCredential {
            provider: key.provider,
            user_id: key.user_id,
            data_source_id: key.data_source_id,
            access_token: String::new(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            expires_at: None,
            provider_payload: serde_json::Value::Object(Default::default()),
            updated_at: Utc::now(),
        };
        apply_token_payload(&mut cred, &payload, Utc::now());
        self.store_credential(&cred).await?;
        Ok(cred)
    }

    /// Authorization URL for a provider with the given opaque state.
    pub fn authorize_url(&self, provider: Provider, state: &str) -> String {
        match provider {
            Provider::Notion => format!(
                "{NOTION_AUTH_URL}?owner=user&client_id={}&redirect_uri={}&response_type=code&state={}",
                urlencoding::encode(&self.notion_app.client_id),
                urlencoding::encode(&self.notion_app.redirect_uri),
                urlencoding::encode(state),
            ),
            Provider::GoogleDrive => format!(
                "{GOOGLE_AUTH_URL}?client_id={}&redirect_uri={}&response_type=code\
                 &scope={}&access_type=offline&include_granted_scopes=true&prompt=consent&state={}",
                urlencoding::encode(&self.google_app.client_id),
                urlencoding::encode(&self.google_app.redirect_uri),
                urlencoding::encode("https://www.googleapis.com/auth/drive.readonly openid https://www.googleapis.com/auth/userinfo.email"),
                urlencoding::encode(state),
            ),
        }
    }
}

/// Merge a token-endpoint response into a credential row.
fn apply_token_payload(
    cred: &mut OauthCredential,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) {
    if let Some(token) = payload.get("access_token").and_then(|v| v.as_str()) {
        cred.access_token = token.to_string();
    }
    if let Some(token) = payload.get("refresh_token").and_then(|v| v.as_str()) {
        cred.refresh_token = Some(token.to_string());
    }
    if let Some(token_type) = payload.get("token_type").and_then(|v| v.as_str()) {
        cred.token_type = token_type.to_string();
    }
    if let Some(expires_in) = payload.get("expires_in").and_then(|v| v.as_i64()) {
        cred.expires_at = Some(now + ChronoDuration::seconds(expires_in));
    }

    // Merge rather than replace, so provider fields from the initial grant
    // (workspace ids, user info) survive refreshes.
    if let (serde_json::Value::Object(existing), serde_json::Value::Object(new)) =
        (&mut cred.provider_payload, payload)
    {
        for (key, value) in new {
            existing.insert(key.clone(), value.clone());
        }
    } else {
        cred.provider_payload = payload.clone();
    }
    cred.updated_at = now;
}

// ---- OAuth state nonces ----

/// In-memory, one-time OAuth state store with a TTL.
///
/// Per-process by design; multi-process deployments need an external store.
pub struct StateStore {
    ttl: ChronoDuration,
    entries: std::sync::Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(ChronoDuration::minutes(10))
    }
}

impl StateStore {
    pub fn new(ttl: ChronoDuration) -> Self {
        Self {
            ttl,
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Issue an opaque state carrying the credential key.
    pub fn issue(&self, key: CredentialKey) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .insert(nonce.clone(), Utc::now());

        let payload = serde_json::json!({
            "nonce": nonce,
            "uid": key.user_id,
            "ds": key.data_source_id,
        });
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string())
    }

    /// Verify and consume a state value, returning the embedded ids.
    pub fn verify(&self, state: &str) -> Result<(i64, i64)> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(state)
            .map_err(|_| AuthError::InvalidState)?;
        let payload: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|_| AuthError::InvalidState)?;

        let nonce = payload
            .get("nonce")
            .and_then(|v| v.as_str())
            .ok_or(AuthError::InvalidState)?;
        let user_id = payload
            .get("uid")
            .and_then(|v| v.as_i64())
            .ok_or(AuthError::InvalidState)?;
        let data_source_id = payload
            .get("ds")
            .and_then(|v| v.as_i64())
            .ok_or(AuthError::InvalidState)?;

        let issued = self
            .entries
            .lock()
            .expect("state store lock poisoned")
            .remove(nonce)
            .ok_or(AuthError::InvalidState)?;
        if Utc::now() - issued > self.ttl {
            return Err(AuthError::InvalidState.into());
        }

        Ok((user_id, data_source_id))
    }
}
