//! Validated identifier newtypes.
//!
//! All identifiers handed out by the remote are opaque strings. Items
//! created locally carry a synthetic id prefixed `local-` until the
//! server acknowledges the create, at which point the graph rewrites the
//! id in place (see the alias table in `nimbus-vfs`).

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

/// Prefix marking an id the server has not seen yet.
const LOCAL_PREFIX: &str = "local-";

/// Opaque identifier for a drive item.
///
/// Either a server-assigned id, or a synthetic `local-<uuid>` id for
/// items created on this machine that have not been uploaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidId("empty id".to_string()));
        }
        Ok(Self(id))
    }

    /// Allocates a fresh synthetic id for a locally created item.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_PREFIX, Uuid::new_v4()))
    }

    /// Returns true if this id has not been acknowledged by the server.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    /// Returns the raw string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version tag for optimistic concurrency against the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base64-encoded QuickXorHash of a file body (20 bytes decoded).
///
/// Comparison is exact: the remote always emits canonical Base64, and the
/// local codec in `nimbus-hash` produces the same form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Validates a Base64 QuickXorHash string (28 chars, `=` padded).
    pub fn new(hash: impl Into<String>) -> Result<Self, DomainError> {
        let hash = hash.into();
        if hash.is_empty() || hash.len() > 64 {
            return Err(DomainError::InvalidHash(hash));
        }
        if !hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
        {
            return Err(DomainError::InvalidHash(hash));
        }
        Ok(Self(hash))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque continuation link for the remote change feed.
///
/// Persisted after every successfully applied batch so a restart resumes
/// mid-feed instead of re-walking the whole drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaLink(String);

impl DeltaLink {
    pub fn new(link: impl Into<String>) -> Self {
        Self(link.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
