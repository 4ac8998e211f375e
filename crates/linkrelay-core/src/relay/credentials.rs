//! Storage session source
//!
//! The relay never performs the OAuth exchange itself; it asks a
//! [`CredentialProvider`] for whatever access token is currently valid.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Bearer token for the storage backend
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Currently valid token, or `None` when there is no usable session
    async fn access_token(&self) -> Option<AccessToken>;
}

/// Fixed token, or a permanently missing session
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<AccessToken>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(AccessToken::new(token)),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Option<AccessToken> {
        self.token.clone()
    }
}

/// Tokens within this margin of expiry are treated as expired
const EXPIRY_MARGIN_SECS: i64 = 30;

#[derive(Debug, Deserialize)]
struct StoredToken {
    #[serde(alias = "access_token")]
    token: String,
    #[serde(default)]
    expiry: Option<String>,
}

/// RFC 3339, or the naive UTC form some OAuth libraries write
fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Reads the token file on every call so an external refresher can rotate it
#[derive(Debug, Clone)]
pub struct TokenFileCredentials {
    path: PathBuf,
}

impl TokenFileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for TokenFileCredentials {
    async fn access_token(&self) -> Option<AccessToken> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("No token at {}: {}", self.path.display(), e);
                return None;
            }
        };

        let stored: StoredToken = match serde_json::from_str(&content) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Unreadable token file {}: {}", self.path.display(), e);
                return None;
            }
        };

        if stored.token.trim().is_empty() {
            return None;
        }
        if let Some(raw) = stored.expiry.as_deref() {
            let Some(expiry) = parse_expiry(raw) else {
                warn!("Unparseable token expiry in {}: {}", self.path.display(), raw);
                return None;
            };
            if expiry <= Utc::now() + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) {
                debug!("Token in {} expired at {}", self.path.display(), expiry);
                return None;
            }
        }

        Some(AccessToken::new(stored.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        assert!(StaticCredentials::none().access_token().await.is_none());
        let token = StaticCredentials::new("abc").access_token().await.unwrap();
        assert_eq!(token.secret(), "abc");
        assert_eq!(format!("{:?}", token), "AccessToken(***)");
    }

    #[tokio::test]
    async fn test_token_file_validity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let creds = TokenFileCredentials::new(&path);

        // Missing file
        assert!(creds.access_token().await.is_none());

        let future = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
        std::fs::write(&path, format!(r#"{{"token":"live","expiry":"{}"}}"#, future)).unwrap();
        assert_eq!(creds.access_token().await.unwrap().secret(), "live");

        let past = (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339();
        std::fs::write(&path, format!(r#"{{"token":"old","expiry":"{}"}}"#, past)).unwrap();
        assert!(creds.access_token().await.is_none());

        let naive = (Utc::now() + ChronoDuration::hours(1))
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();
        std::fs::write(&path, format!(r#"{{"token":"naive","expiry":"{}"}}"#, naive)).unwrap();
        assert_eq!(creds.access_token().await.unwrap().secret(), "naive");

        std::fs::write(&path, r#"{"access_token":"no-expiry"}"#).unwrap();
        assert_eq!(creds.access_token().await.unwrap().secret(), "no-expiry");

        std::fs::write(&path, "not json").unwrap();
        assert!(creds.access_token().await.is_none());
    }
}
