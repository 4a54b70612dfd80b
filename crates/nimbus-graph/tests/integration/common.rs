//! Shared helpers for the Graph integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nimbus_core::config::NetworkConfig;
use nimbus_core::ports::remote::{RemoteError, TokenSource};
use nimbus_graph::GraphProvider;
use wiremock::MockServer;

/// Token source handing out a fixed token, counting refresh calls.
pub struct CountingTokens {
    pub token: String,
    pub refreshed: AtomicU32,
    pub refreshed_token: Option<String>,
}

impl CountingTokens {
    pub fn fixed(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            refreshed: AtomicU32::new(0),
            refreshed_token: None,
        })
    }

    /// A source whose refresh produces a different, working token.
    pub fn refreshable(stale: &str, fresh: &str) -> Arc<Self> {
        Arc::new(Self {
            token: stale.to_string(),
            refreshed: AtomicU32::new(0),
            refreshed_token: Some(fresh.to_string()),
        })
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenSource for CountingTokens {
    async fn access_token(&self) -> Result<String, RemoteError> {
        if self.refresh_count() > 0 {
            if let Some(ref fresh) = self.refreshed_token {
                return Ok(fresh.clone());
            }
        }
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String, RemoteError> {
        self.refreshed.fetch_add(1, Ordering::SeqCst);
        match self.refreshed_token {
            Some(ref fresh) => Ok(fresh.clone()),
            None => Err(RemoteError::auth("refresh unavailable")),
        }
    }
}

/// Fast retry policy so failure tests finish quickly.
pub fn test_network_config() -> NetworkConfig {
    NetworkConfig {
        request_timeout_secs: 5,
        max_retries: 3,
        backoff_base_ms: 10,
        backoff_cap_ms: 50,
    }
}

/// Starts a mock server and a provider pointed at it.
pub async fn setup() -> (MockServer, GraphProvider) {
    let server = MockServer::start().await;
    let provider = GraphProvider::with_base_url(
        CountingTokens::fixed("test-token"),
        test_network_config(),
        server.uri(),
    );
    (server, provider)
}

/// A plausible file DriveItem JSON body.
pub fn file_item_json(id: &str, name: &str, parent: &str, size: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "size": size,
        "eTag": format!("\"{{{id}}},1\""),
        "lastModifiedDateTime": "2026-02-15T10:00:00Z",
        "parentReference": { "id": parent },
        "file": { "hashes": { "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=" } }
    })
}

/// A plausible folder DriveItem JSON body.
pub fn folder_item_json(id: &str, name: &str, parent: &str, children: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "parentReference": { "id": parent },
        "folder": { "childCount": children }
    })
}
