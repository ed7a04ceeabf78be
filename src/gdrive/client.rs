//! Google Drive API seam and the reqwest implementation.

use crate::error::{ProviderError, Result};
use crate::oauth::{CredentialKey, TokenProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const PAGE_SIZE: u32 = 200;
const MAX_RETRIES: u32 = 2;

pub const MIME_FOLDER: &str = "application/vnd.google-apps.folder";
pub const MIME_GOOGLE_DOC: &str = "application/vnd.google-apps.document";
pub const MIME_GOOGLE_SHEET: &str = "application/vnd.google-apps.spreadsheet";
pub const MIME_GOOGLE_SLIDES: &str = "application/vnd.google-apps.presentation";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Google-native types that export server-side.
pub fn is_google_native(mime: &str) -> bool {
    matches!(mime, MIME_GOOGLE_DOC | MIME_GOOGLE_SHEET | MIME_GOOGLE_SLIDES)
}

/// Office formats converted via a server-side copy before export.
pub fn is_office(mime: &str) -> bool {
    matches!(mime, MIME_DOCX | MIME_XLSX | MIME_PPTX)
}

/// Whether the sync worker can turn this MIME into records.
pub fn is_supported(mime: &str) -> bool {
    mime == MIME_PDF || is_google_native(mime) || is_office(mime)
}

/// Metadata about one Drive file, in the shape the changes stream reports.
#[derive(Debug, Clone, Default)]
pub struct DriveFileMeta {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub modified_time: Option<DateTime<Utc>>,
    pub md5_checksum: Option<String>,
    pub version: Option<i64>,
    pub web_view_link: Option<String>,
    pub parents: Vec<String>,
    pub trashed: bool,
    pub can_download: bool,
}

/// One entry of the changes stream.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub file_id: String,
    pub removed: bool,
    pub file: Option<DriveFileMeta>,
}

/// One page of the changes stream.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<RawChange>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

/// Drive API capability used by the sync worker.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Current changes-stream start token.
    async fn start_page_token(&self) -> Result<String>;
    /// Every supported file reachable under the root folder (bootstrap walk).
    async fn list_files_under(&self, root_id: &str) -> Result<Vec<DriveFileMeta>>;
    /// One page of the changes stream.
    async fn list_changes(&self, page_token: &str) -> Result<ChangePage>;
    /// Parent folder ids of a file or folder (reachability walk).
    async fn file_parents(&self, file_id: &str) -> Result<Vec<String>>;
    /// Export a Google-native file as PDF.
    async fn export_pdf(&self, file_id: &str) -> Result<Vec<u8>>;
    /// Convert an Office file via a server-side copy, export the copy as
    /// PDF, and clean the copy up.
    async fn copy_export_pdf(&self, file_id: &str, mime_type: &str) -> Result<Vec<u8>>;
    /// Export a Google Doc in DOCX form (for OpenXML retention).
    async fn export_docx(&self, file_id: &str) -> Result<Vec<u8>>;
    /// Raw media download (PDF and Office binaries).
    async fn download(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// reqwest-backed client; a fresh access token is resolved per call.
pub struct HttpDriveClient {
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    credential: CredentialKey,
    base_url: String,
}

const FILE_FIELDS: &str =
    "id, name, mimeType, modifiedTime, md5Checksum, version, webViewLink, parents, trashed, capabilities/canDownload";

impl HttpDriveClient {
    pub fn new(tokens: Arc<TokenProvider>, credential: CredentialKey, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            tokens,
            credential,
            base_url: DRIVE_API_BASE.to_string(),
        }
    }

    async fn send(&self, build: impl Fn(&str) -> reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let token = self.tokens.access_token(self.credential).await?;
            let response = match build(&token).send().await {
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
            return Ok(response);
        }
    }

    async fn get_json(&self, url: String, query: Vec<(String, String)>) -> Result<Value> {
        let response = self
            .send(|token| self.http.get(&url).bearer_auth(token).query(&query))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()).into())
    }

    async fn get_bytes(&self, url: String, query: Vec<(String, String)>) -> Result<Vec<u8>> {
        let response = self
            .send(|token| self.http.get(&url).bearer_auth(token).query(&query))
            .await?;
        Ok(response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?
            .to_vec())
    }

    fn folder_query(folder_id: &str) -> String {
        let mimes = [
            MIME_GOOGLE_DOC,
            MIME_GOOGLE_SHEET,
            MIME_GOOGLE_SLIDES,
            MIME_DOCX,
            MIME_XLSX,
            MIME_PPTX,
            MIME_PDF,
        ];
        let convertible = mimes
            .iter()
            .map(|m| format!("mimeType = '{m}'"))
            .collect::<Vec<_>>()
            .join(" or ");
        format!(
            "trashed=false and 'me' in owners and (({convertible}) or mimeType = '{MIME_FOLDER}') and '{folder_id}' in parents"
        )
    }

    async fn export_as(&self, file_id: &str, mime_type: &str) -> Result<Vec<u8>> {
        self.get_bytes(
            format!("{}/files/{file_id}/export", self.base_url),
            vec![("mimeType".into(), mime_type.into())],
        )
        .await
    }
}

#[async_trait]
impl DriveApi for HttpDriveClient {
    async fn start_page_token(&self) -> Result<String> {
        let payload = self
            .get_json(
                format!("{}/changes/startPageToken", self.base_url),
                vec![("supportsAllDrives".into(), "false".into())],
            )
            .await?;
        payload["startPageToken"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Unavailable("missing startPageToken".into()).into())
    }

    async fn list_files_under(&self, root_id: &str) -> Result<Vec<DriveFileMeta>> {
        let mut files = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([root_id.to_string()]);
        let mut visited = std::collections::HashSet::new();

        while let Some(folder_id) = queue.pop_front() {
            if !visited.insert(folder_id.clone()) {
                continue;
            }

            let mut page_token: Option<String> = None;
            loop {
                let mut query = vec![
                    ("pageSize".to_string(), PAGE_SIZE.to_string()),
                    (
                        "fields".to_string(),
                        format!("nextPageToken, files({FILE_FIELDS})"),
                    ),
                    ("supportsAllDrives".to_string(), "false".to_string()),
                    ("includeItemsFromAllDrives".to_string(), "false".to_string()),
                    ("q".to_string(), Self::folder_query(&folder_id)),
                ];
                if let Some(ref token) = page_token {
                    query.push(("pageToken".to_string(), token.clone()));
                }

                let payload = self
                    .get_json(format!("{}/files", self.base_url), query)
                    .await?;

                for raw in payload["files"].as_array().into_iter().flatten() {
                    let meta = parse_file_meta(raw);
                    if meta.mime_type == MIME_FOLDER {
                        queue.push_back(meta.id);
                        continue;
                    }
                    files.push(meta);
                }

                page_token = payload["nextPageToken"].as_str().map(str::to_string);
                if page_token.is_none() {
                    break;
                }
            }
        }

        tracing::info!(root_id, files = files.len(), "drive bootstrap walk complete");
        Ok(files)
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,changeType,file({FILE_FIELDS}))"
        );
        let payload = self
            .get_json(
                format!("{}/changes", self.base_url),
                vec![
                    ("pageToken".into(), page_token.to_string()),
                    ("pageSize".into(), PAGE_SIZE.to_string()),
                    ("fields".into(), fields),
                    ("includeItemsFromAllDrives".into(), "false".into()),
                    ("supportsAllDrives".into(), "false".into()),
                    ("restrictToMyDrive".into(), "true".into()),
                ],
            )
            .await?;

        let changes = payload["changes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|change| {
                // Non-file change kinds (drive membership etc.) are ignored.
                change["changeType"]
                    .as_str()
                    .map(|t| t == "file")
                    .unwrap_or(true)
            })
            .filter_map(|change| {
                let file_id = change["fileId"].as_str()?.to_string();
                Some(RawChange {
                    file_id,
                    removed: change["removed"].as_bool().unwrap_or(false),
                    file: change.get("file").filter(|f| !f.is_null()).map(parse_file_meta),
                })
            })
            .collect();

        Ok(ChangePage {
            changes,
            next_page_token: payload["nextPageToken"].as_str().map(str::to_string),
            new_start_page_token: payload["newStartPageToken"].as_str().map(str::to_string),
        })
    }

    async fn file_parents(&self, file_id: &str) -> Result<Vec<String>> {
        let payload = self
            .get_json(
                format!("{}/files/{file_id}", self.base_url),
                vec![("fields".into(), "id, parents".into())],
            )
            .await?;
        Ok(payload["parents"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect())
    }

    async fn export_pdf(&self, file_id: &str) -> Result<Vec<u8>> {
        self.export_as(file_id, MIME_PDF).await
    }

    async fn copy_export_pdf(&self, file_id: &str, mime_type: &str) -> Result<Vec<u8>> {
        // Office files cannot export directly; copy into the Google-native
        // counterpart first, export that, then delete the temporary copy.
        let target = match mime_type {
            MIME_DOCX => MIME_GOOGLE_DOC,
            MIME_XLSX => MIME_GOOGLE_SHEET,
            MIME_PPTX => MIME_GOOGLE_SLIDES,
            other => {
                return Err(ProviderError::UnsupportedMime(other.to_string()).into());
            }
        };

        let body = serde_json::json!({
            "name": format!("[export-tmp] {file_id}"),
            "mimeType": target,
            "parents": ["root"],
        });
        let response = self
            .send(|token| {
                self.http
                    .post(format!("{}/files/{file_id}/copy", self.base_url))
                    .bearer_auth(token)
                    .json(&body)
            })
            .await?;
        let copy: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let copy_id = copy["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Unavailable("copy returned no id".into()))?
            .to_string();

        let result = self.export_as(&copy_id, MIME_PDF).await;

        // Best-effort cleanup of the temporary Google-native copy.
        let delete = self
            .send(|token| {
                self.http
                    .delete(format!("{}/files/{copy_id}", self.base_url))
                    .bearer_auth(token)
            })
            .await;
        if let Err(error) = delete {
            tracing::warn!(%error, copy_id, "failed to delete temporary export copy");
        }

        result
    }

    async fn export_docx(&self, file_id: &str) -> Result<Vec<u8>> {
        self.export_as(file_id, MIME_DOCX).await
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        self.get_bytes(
            format!("{}/files/{file_id}", self.base_url),
            vec![("alt".into(), "media".into())],
        )
        .await
    }
}

fn parse_file_meta(raw: &Value) -> DriveFileMeta {
    DriveFileMeta {
        id: raw["id"].as_str().unwrap_or("").to_string(),
        name: raw["name"].as_str().unwrap_or("").to_string(),
        mime_type: raw["mimeType"].as_str().unwrap_or("").to_string(),
        modified_time: raw["modifiedTime"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        md5_checksum: raw["md5Checksum"].as_str().map(str::to_string),
        version: raw["version"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| raw["version"].as_i64()),
        web_view_link: raw["webViewLink"].as_str().map(str::to_string),
        parents: raw["parents"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect(),
        trashed: raw["trashed"].as_bool().unwrap_or(false),
        can_download: raw["capabilities"]["canDownload"].as_bool().unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_classification() {
        assert!(is_google_native(MIME_GOOGLE_DOC));
        assert!(is_office(MIME_DOCX));
        assert!(is_supported(MIME_PDF));
        assert!(!is_supported("application/x-hwp"));
        assert!(!is_supported(MIME_FOLDER));
    }

    #[test]
    fn file_meta_parses_version_string() {
        let raw = serde_json::json!({
            "id": "f1",
            "name": "A.docx",
            "mimeType": MIME_DOCX,
            "version": "42",
            "md5Checksum": "abc",
            "parents": ["root"],
            "capabilities": {"canDownload": true},
        });
        let meta = parse_file_meta(&raw);
        assert_eq!(meta.version, Some(42));
        assert_eq!(meta.md5_checksum.as_deref(), Some("abc"));
        assert!(meta.can_download);
    }
}
