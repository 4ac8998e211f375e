//! Remote resource fetching
//!
//! The transfer engine only needs a streaming body and the advertised
//! length; [`Fetcher`] is that seam, with [`HttpFetcher`] as the reqwest
//! implementation.

use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Stream of body chunks as they arrive
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// An opened remote resource
pub struct FetchResponse {
    /// `Content-Length`, when the server sent one
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Start a streaming GET. Fails with [`FetchError::Status`] before any
    /// body is consumed when the server reports an error.
    async fn open(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// HTTP(S) fetcher over a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("linkrelay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let total_bytes = response.content_length();
        debug!("Opened {} ({:?} bytes)", url, total_bytes);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();

        Ok(FetchResponse { total_bytes, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_streams_body_with_length() {
        let base = serve(Router::new().route("/file.bin", get(|| async { vec![7u8; 4096] }))).await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();

        let mut response = fetcher.open(&format!("{}/file.bin", base)).await.unwrap();
        assert_eq!(response.total_bytes, Some(4096));

        let mut received = 0;
        while let Some(chunk) = response.body.next().await {
            received += chunk.unwrap().len();
        }
        assert_eq!(received, 4096);
    }

    #[tokio::test]
    async fn test_error_status_fails_before_body() {
        let base = serve(Router::new().route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, "nope") }),
        ))
        .await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();

        let err = fetcher.open(&format!("{}/missing", base)).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404 }));
    }
}
