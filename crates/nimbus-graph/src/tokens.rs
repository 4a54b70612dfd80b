//! Token source backed by the collaborator-managed token file.
//!
//! OAuth acquisition and refresh are external collaborators: something
//! else (the launcher, a systemd timer) keeps `auth_tokens.json` fresh.
//! This source consumes the file read-only. `refresh()` re-reads it; if
//! the token on disk has not changed, the refresh is reported failed so
//! the caller surfaces an auth error instead of spinning.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use nimbus_core::ports::remote::{RemoteError, TokenSource};
use serde::Deserialize;
use tracing::debug;

/// Shape of `auth_tokens.json`.
#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
    #[allow(dead_code)]
    #[serde(default)]
    refresh_token: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    expires_at: Option<i64>,
}

/// [`TokenSource`] reading the external token file.
pub struct FileTokenSource {
    path: PathBuf,
    last_seen: Mutex<Option<String>>,
}

impl FileTokenSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_seen: Mutex::new(None),
        }
    }

    fn read_file(&self) -> Result<String, RemoteError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            RemoteError::auth(format!(
                "cannot read token file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let parsed: TokenFile = serde_json::from_str(&text)
            .map_err(|e| RemoteError::auth(format!("malformed token file: {e}")))?;
        Ok(parsed.access_token)
    }
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn access_token(&self) -> Result<String, RemoteError> {
        let token = self.read_file()?;
        *self.last_seen.lock().expect("token mutex poisoned") = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<String, RemoteError> {
        let token = self.read_file()?;
        let mut last = self.last_seen.lock().expect("token mutex poisoned");
        if last.as_deref() == Some(token.as_str()) {
            return Err(RemoteError::auth(
                "token rejected and the token file has not been refreshed",
            ));
        }
        debug!("picked up refreshed token from disk");
        *last = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tokens(token: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"access_token": "{token}"}}"#).unwrap();
        file
    }

    #[tokio::test]
    async fn test_reads_access_token() {
        let file = write_tokens("tok-1");
        let source = FileTokenSource::new(file.path().to_path_buf());
        assert_eq!(source.access_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_refresh_fails_when_file_unchanged() {
        let file = write_tokens("tok-1");
        let source = FileTokenSource::new(file.path().to_path_buf());
        source.access_token().await.unwrap();
        assert!(source.refresh().await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_token() {
        let file = write_tokens("tok-1");
        let source = FileTokenSource::new(file.path().to_path_buf());
        source.access_token().await.unwrap();

        std::fs::write(file.path(), r#"{"access_token": "tok-2"}"#).unwrap();
        assert_eq!(source.refresh().await.unwrap(), "tok-2");
    }

    #[tokio::test]
    async fn test_missing_file_is_auth_error() {
        let source = FileTokenSource::new(PathBuf::from("/nonexistent/tokens.json"));
        let err = source.access_token().await.unwrap_err();
        assert_eq!(err.kind(), nimbus_core::ports::remote::RemoteErrorKind::Auth);
    }
}
