//! Google Drive relay using the resumable upload protocol
//!
//! 1. `POST .../upload/drive/v3/files?uploadType=resumable` opens a session
//!    and answers with the session URI in `Location`.
//! 2. The file is `PUT` to the session in `Content-Range` chunks; `308`
//!    means "continue from the confirmed `Range`", `200`/`201` carries the
//!    created file's id.
//! 3. An `anyone`/`reader` permission makes the object shareable by link.

use crate::error::UploadError;
use crate::relay::{CredentialProvider, StorageRelay};
use async_trait::async_trait;
use linkrelay_types::{DriveSettings, StoredObject};
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Drive requires chunk sizes in multiples of 256 KiB
const CHUNK_GRANULARITY: usize = 256 * 1024;

/// Base delay between chunk retries, multiplied by the attempt number
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for any single request to the storage API
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: Option<String>,
}

/// Where a chunk `PUT` left the session
enum ChunkOutcome {
    /// Server holds bytes `0..offset`
    Incomplete { offset: u64 },
    Done { file_id: String },
}

/// Relay to Google Drive
pub struct DriveRelay {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    settings: DriveSettings,
    chunk_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl DriveRelay {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        settings: DriveSettings,
        chunk_size: usize,
        max_retries: u32,
    ) -> Result<Self, UploadError> {
        // 308 is "resume incomplete" here, never a redirect
        let client = Client::builder()
            .user_agent(concat!("linkrelay/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let chunk_size = (chunk_size / CHUNK_GRANULARITY).max(1) * CHUNK_GRANULARITY;

        Ok(Self {
            client,
            credentials,
            settings,
            chunk_size,
            max_retries,
            retry_delay: RETRY_BASE_DELAY,
        })
    }

    /// Override the delay between chunk retries
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Deterministic share link for an object id
    pub fn share_link(&self, file_id: &str) -> String {
        format!(
            "{}/file/d/{}/view",
            self.settings.share_link_base.trim_end_matches('/'),
            file_id
        )
    }

    async fn open_session(
        &self,
        token: &str,
        artifact_name: &str,
        total: u64,
    ) -> Result<String, UploadError> {
        let url = format!(
            "{}/upload/drive/v3/files?uploadType=resumable&fields=id",
            self.settings.upload_base.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", total.to_string())
            .json(&serde_json::json!({ "name": artifact_name }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Session {
                status: status.as_u16(),
            });
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or(UploadError::Session {
                status: status.as_u16(),
            })
    }

    async fn put_chunk(
        &self,
        session: &str,
        token: &str,
        content_range: String,
        body: Vec<u8>,
    ) -> Result<ChunkOutcome, UploadError> {
        let response = self
            .client
            .put(session)
            .bearer_auth(token)
            .header(CONTENT_RANGE, content_range)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PERMANENT_REDIRECT {
            let offset = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(confirmed_offset)
                .unwrap_or(0);
            return Ok(ChunkOutcome::Incomplete { offset });
        }

        if status.is_success() {
            let created: CreatedFile = response.json().await?;
            return created
                .id
                .map(|file_id| ChunkOutcome::Done { file_id })
                .ok_or(UploadError::MissingObjectId);
        }

        let message = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected {
            status: status.as_u16(),
            message: message.chars().take(200).collect(),
        })
    }

    /// Ask the session how many bytes it already holds
    async fn query_offset(&self, session: &str, token: &str, total: u64) -> Result<ChunkOutcome, UploadError> {
        self.put_chunk(session, token, format!("bytes */{}", total), Vec::new())
            .await
    }

    async fn send_file(
        &self,
        local_path: &Path,
        session: &str,
        token: &str,
        total: u64,
    ) -> Result<String, UploadError> {
        let mut file = File::open(local_path).await?;
        let mut offset: u64 = 0;
        let mut attempt: u32 = 0;

        loop {
            let outcome = if total == 0 {
                self.put_chunk(session, token, "bytes */0".to_string(), Vec::new())
                    .await
            } else {
                let len = (self.chunk_size as u64).min(total - offset) as usize;
                let mut buf = vec![0u8; len];
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buf).await?;

                let range = format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total);
                debug!("Uploading {}", range);
                self.put_chunk(session, token, range, buf).await
            };

            // A 308 that confirms nothing new counts against the retry budget
            let outcome = match outcome {
                Ok(ChunkOutcome::Incomplete { offset: confirmed }) if confirmed.min(total) <= offset => {
                    offset = confirmed.min(total);
                    Err(UploadError::Stalled { offset })
                }
                other => other,
            };

            match outcome {
                Ok(ChunkOutcome::Done { file_id }) => return Ok(file_id),
                Ok(ChunkOutcome::Incomplete { offset: confirmed }) => {
                    offset = confirmed.min(total);
                    attempt = 0;
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(UploadError::RetriesExhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    warn!(
                        "Chunk at offset {} failed (attempt {}/{}): {}. Will retry.",
                        offset, attempt, self.max_retries, e
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;

                    // Resume from whatever the server confirmed
                    match self.query_offset(session, token, total).await {
                        Ok(ChunkOutcome::Incomplete { offset: confirmed }) => {
                            offset = confirmed.min(total);
                        }
                        Ok(ChunkOutcome::Done { file_id }) => return Ok(file_id),
                        Err(e) => debug!("Offset query failed: {}", e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn share(&self, token: &str, file_id: &str) -> Result<(), UploadError> {
        let url = format!(
            "{}/drive/v3/files/{}/permissions",
            self.settings.api_base.trim_end_matches('/'),
            file_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "type": "anyone", "role": "reader" }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Permission {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Best effort; the upload already failed
    async fn discard(&self, token: &str, file_id: &str) {
        let url = format!(
            "{}/drive/v3/files/{}",
            self.settings.api_base.trim_end_matches('/'),
            file_id
        );
        match self.client.delete(&url).bearer_auth(token).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Removed unshared object {}", file_id);
            }
            Ok(response) => warn!(
                "Could not remove unshared object {} (status {})",
                file_id,
                response.status()
            ),
            Err(e) => warn!("Could not remove unshared object {}: {}", file_id, e),
        }
    }
}

#[async_trait]
impl StorageRelay for DriveRelay {
    async fn is_authenticated(&self) -> bool {
        self.credentials.access_token().await.is_some()
    }

    async fn upload(
        &self,
        local_path: &Path,
        artifact_name: &str,
    ) -> Result<StoredObject, UploadError> {
        let token = self
            .credentials
            .access_token()
            .await
            .ok_or(UploadError::NotAuthenticated)?;
        let token = token.secret();

        let total = tokio::fs::metadata(local_path).await?.len();
        info!("Uploading {} ({} bytes)", artifact_name, total);

        let session = self.open_session(token, artifact_name, total).await?;
        let file_id = self.send_file(local_path, &session, token, total).await?;

        if let Err(e) = self.share(token, &file_id).await {
            self.discard(token, &file_id).await;
            return Err(e);
        }

        let share_link = self.share_link(&file_id);
        info!("Uploaded {} as {}", artifact_name, file_id);
        Ok(StoredObject {
            file_id,
            share_link,
        })
    }
}

/// Parse the `Range: bytes=0-N` header of a 308 into the next offset
fn confirmed_offset(range: &str) -> Option<u64> {
    let last = range.trim().strip_prefix("bytes=")?.split('-').nth(1)?;
    last.trim().parse::<u64>().ok().map(|n| n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::StaticCredentials;
    use axum::body::Bytes;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{delete, post, put};
    use axum::{Json, Router};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct DriveState {
        received: Vec<u8>,
        /// Fail this many chunk PUTs with 503 before accepting
        failures_left: u32,
        permission_status: Option<u16>,
        /// Answer every PUT with a bare 308
        stalled: bool,
        puts: usize,
        shared: Vec<String>,
        deleted: Vec<String>,
        base: String,
    }

    type Shared = Arc<Mutex<DriveState>>;

    async fn open(State(state): State<Shared>, headers: HeaderMap) -> Response {
        if headers.get("authorization").is_none() {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        let location = format!("{}/session/1", state.lock().base);
        (AxumStatus::OK, [("location", location)]).into_response()
    }

    async fn chunk(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
        let mut state = state.lock();
        state.puts += 1;
        if state.stalled {
            return AxumStatus::PERMANENT_REDIRECT.into_response();
        }
        let range = headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if range.starts_with("bytes */") {
            let total: usize = range["bytes */".len()..].parse().unwrap();
            if state.received.len() == total {
                return (AxumStatus::OK, Json(serde_json::json!({ "id": "file-1" }))).into_response();
            }
            return resume_incomplete(state.received.len());
        }

        if state.failures_left > 0 {
            state.failures_left -= 1;
            return AxumStatus::SERVICE_UNAVAILABLE.into_response();
        }

        let rest = &range["bytes ".len()..];
        let (span, total) = rest.split_once('/').unwrap();
        let start: usize = span.split('-').next().unwrap().parse().unwrap();
        let total: usize = total.parse().unwrap();
        assert_eq!(start, state.received.len(), "chunk must continue at the confirmed offset");
        state.received.extend_from_slice(&body);

        if state.received.len() == total {
            (AxumStatus::OK, Json(serde_json::json!({ "id": "file-1" }))).into_response()
        } else {
            resume_incomplete(state.received.len())
        }
    }

    fn resume_incomplete(received: usize) -> Response {
        if received == 0 {
            return AxumStatus::PERMANENT_REDIRECT.into_response();
        }
        (
            AxumStatus::PERMANENT_REDIRECT,
            [("range", format!("bytes=0-{}", received - 1))],
        )
            .into_response()
    }

    async fn permission(State(state): State<Shared>, AxumPath(id): AxumPath<String>) -> Response {
        let mut state = state.lock();
        if let Some(status) = state.permission_status {
            return AxumStatus::from_u16(status).unwrap().into_response();
        }
        state.shared.push(id);
        (AxumStatus::OK, Json(serde_json::json!({ "id": "perm" }))).into_response()
    }

    async fn remove(State(state): State<Shared>, AxumPath(id): AxumPath<String>) -> AxumStatus {
        state.lock().deleted.push(id);
        AxumStatus::NO_CONTENT
    }

    async fn serve(state: Shared) -> String {
        let app = Router::new()
            .route("/upload/drive/v3/files", post(open))
            .route("/session/1", put(chunk))
            .route("/drive/v3/files/:id/permissions", post(permission))
            .route("/drive/v3/files/:id", delete(remove))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        state.lock().base = base.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    fn relay(base: &str, credentials: StaticCredentials) -> DriveRelay {
        let settings = DriveSettings {
            upload_base: base.to_string(),
            api_base: base.to_string(),
            share_link_base: "https://drive.example".to_string(),
            token_file: None,
        };
        DriveRelay::new(Arc::new(credentials), settings, CHUNK_GRANULARITY, 3)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    fn artifact(dir: &tempfile::TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join("artifact.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_confirmed_offset() {
        assert_eq!(confirmed_offset("bytes=0-262143"), Some(262144));
        assert_eq!(confirmed_offset("garbage"), None);
    }

    #[tokio::test]
    async fn test_chunked_upload_and_share() {
        let state: Shared = Arc::default();
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, CHUNK_GRANULARITY * 2 + 1000);

        let object = relay(&base, StaticCredentials::new("token"))
            .upload(&path, "artifact.bin")
            .await
            .unwrap();

        assert_eq!(object.file_id, "file-1");
        assert_eq!(object.share_link, "https://drive.example/file/d/file-1/view");
        let state = state.lock();
        assert_eq!(state.received, std::fs::read(&path).unwrap());
        assert_eq!(state.shared, vec!["file-1".to_string()]);
        // The relay leaves the local file alone
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_transient_chunk_failures_are_retried() {
        let state: Shared = Arc::default();
        state.lock().failures_left = 2;
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, CHUNK_GRANULARITY + 10);

        let object = relay(&base, StaticCredentials::new("token"))
            .upload(&path, "artifact.bin")
            .await
            .unwrap();

        assert_eq!(object.file_id, "file-1");
        assert_eq!(state.lock().received.len(), CHUNK_GRANULARITY + 10);
    }

    #[tokio::test]
    async fn test_persistent_failure_surfaces_once() {
        let state: Shared = Arc::default();
        state.lock().failures_left = 100;
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, 1000);

        let err = relay(&base, StaticCredentials::new("token"))
            .upload(&path, "artifact.bin")
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::RetriesExhausted { attempts: 4, .. }));
        assert!(state.lock().shared.is_empty());
    }

    #[tokio::test]
    async fn test_permission_failure_removes_object() {
        let state: Shared = Arc::default();
        state.lock().permission_status = Some(403);
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, 1000);

        let err = relay(&base, StaticCredentials::new("token"))
            .upload(&path, "artifact.bin")
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Permission { status: 403 }));
        assert_eq!(state.lock().deleted, vec!["file-1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_session_fails_without_network() {
        // Nothing listens here; a network attempt would surface as a Network error
        let relay = relay("http://127.0.0.1:9", StaticCredentials::none());
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, 10);

        assert!(!relay.is_authenticated().await);
        let err = relay.upload(&path, "artifact.bin").await.unwrap_err();
        assert!(matches!(err, UploadError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_session_that_never_advances_gives_up() {
        let state: Shared = Arc::default();
        state.lock().stalled = true;
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, CHUNK_GRANULARITY + 10);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            relay(&base, StaticCredentials::new("token")).upload(&path, "artifact.bin"),
        )
        .await
        .expect("upload must reach a terminal result");

        let err = result.unwrap_err();
        assert!(matches!(err, UploadError::RetriesExhausted { attempts: 4, .. }));
        // Four chunk attempts plus three offset queries
        assert_eq!(state.lock().puts, 7);
        assert!(state.lock().shared.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_that_never_completes_gives_up() {
        let state: Shared = Arc::default();
        state.lock().stalled = true;
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, 0);

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            relay(&base, StaticCredentials::new("token")).upload(&path, "empty.bin"),
        )
        .await
        .expect("upload must reach a terminal result")
        .unwrap_err();

        assert!(matches!(err, UploadError::RetriesExhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_empty_file_upload() {
        let state: Shared = Arc::default();
        let base = serve(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, 0);

        let object = relay(&base, StaticCredentials::new("token"))
            .upload(&path, "empty.bin")
            .await
            .unwrap();
        assert_eq!(object.file_id, "file-1");
    }
}
