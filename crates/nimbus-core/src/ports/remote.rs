//! Cloud provider port.
//!
//! `nimbus-graph` implements [`CloudProvider`] against the Microsoft
//! Graph API; everything above the port is provider-independent. Errors
//! carry a [`RemoteErrorKind`] so callers can route them (retry, offline
//! log, surface to FUSE) without string matching.

use std::ops::Range;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::{ContentHash, DeltaLink, ETag, ItemId};

// ============================================================================
// Error taxonomy
// ============================================================================

/// Classification of a failed remote call.
///
/// Kinds, not types: every adapter error is folded into one of these so
/// policy (retry, defer, surface) is decided in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Transient connectivity loss, DNS or TLS failure.
    Network,
    /// Token expired or revoked and the refresh callback failed.
    Auth,
    /// The server asked us to slow down (HTTP 429).
    RateLimit,
    /// The server no longer knows the id.
    NotFound,
    /// The server rejected the request as malformed or forbidden
    /// (bad name, quota exceeded).
    Validation,
    /// The target already exists or the ETag precondition failed.
    Conflict,
    /// The request deadline elapsed.
    Timeout,
    /// HTTP 5xx.
    ServerTransient,
    /// Corruption or an impossible state; never retried.
    Fatal,
}

impl RemoteErrorKind {
    /// Returns true if a call failing with this kind may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Network
                | RemoteErrorKind::RateLimit
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::ServerTransient
        )
    }

    /// Returns true if this kind should flip the connectivity oracle
    /// towards offline.
    pub fn indicates_offline(self) -> bool {
        matches!(self, RemoteErrorKind::Network | RemoteErrorKind::Timeout)
    }
}

/// Error returned by every [`CloudProvider`] verb.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    kind: RemoteErrorKind,
    message: String,
    /// Server-advised delay (Retry-After) for rate-limit errors.
    retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a server-advised retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn kind(&self) -> RemoteErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    // Convenience constructors, one per kind we build often.

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Fatal, message)
    }
}

// ============================================================================
// Port-level DTOs
// ============================================================================

/// Raw item metadata as reported by the remote.
///
/// A port-level DTO, not a domain entity; the inode graph maps these
/// onto [`crate::domain::Inode`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Server-assigned id.
    pub id: ItemId,
    /// Item name.
    pub name: String,
    /// Parent folder id (`None` for the drive root).
    pub parent_id: Option<ItemId>,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Folder facet present.
    pub is_directory: bool,
    /// Deleted facet present (tombstone).
    pub is_deleted: bool,
    /// QuickXorHash of the content; some responses omit it.
    pub hash: Option<ContentHash>,
    /// Version tag.
    pub etag: Option<ETag>,
    /// Last modified time; tombstones omit it.
    pub modified: Option<DateTime<Utc>>,
    /// Child-count hint from the folder facet.
    pub child_count: Option<u64>,
}

/// One page of a children listing.
#[derive(Debug, Clone)]
pub struct ChildrenPage {
    pub items: Vec<RemoteItem>,
    /// Opaque token for the next page, if any.
    pub next_token: Option<String>,
}

/// One batch from the change feed.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub items: Vec<RemoteItem>,
    /// Present while more pages follow in this batch.
    pub next_link: Option<String>,
    /// Present on the final page; persisted for the next poll.
    pub delta_link: Option<DeltaLink>,
}

/// A negotiated resumable upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Absolute URL chunks are PUT against.
    pub upload_url: String,
    /// Server-side expiry of the session.
    pub expires: Option<DateTime<Utc>>,
}

/// Result of uploading one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Intermediate chunk accepted; the server expects this byte next.
    Accepted { next_expected: u64 },
    /// Final chunk acknowledged; the committed item follows.
    Complete(Box<RemoteItem>),
}

/// Fields of a metadata PATCH. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub name: Option<String>,
    pub parent_id: Option<ItemId>,
    /// Preserve this modified time on the server instead of "now".
    pub mtime: Option<DateTime<Utc>>,
}

// ============================================================================
// Port traits
// ============================================================================

/// Source of bearer tokens for the remote client.
///
/// OAuth acquisition is an external collaborator; the core only consumes
/// this callback. `refresh` is invoked exactly once per 401 before the
/// failing call is retried.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the current access token.
    async fn access_token(&self) -> Result<String, RemoteError>;

    /// Forces a refresh and returns the new token.
    async fn refresh(&self) -> Result<String, RemoteError>;
}

/// The remote drive, reduced to the verbs the core needs.
///
/// Implementations own retry/backoff for transient failures and hide the
/// range-GET chunking of large downloads behind [`get_content`].
///
/// [`get_content`]: CloudProvider::get_content
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Fetches item metadata by id.
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, RemoteError>;

    /// Fetches item metadata by drive-root-relative path.
    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, RemoteError>;

    /// Lists one page of a folder's children.
    async fn list_children(
        &self,
        id: &ItemId,
        page_token: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError>;

    /// Downloads content. `range` limits the transfer to a byte window;
    /// `None` fetches the whole body (internally chunked above the
    /// range-GET threshold).
    async fn get_content(
        &self,
        id: &ItemId,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, RemoteError>;

    /// Replaces the content of an existing item in a single PUT.
    async fn put_small(&self, id: &ItemId, bytes: &[u8]) -> Result<RemoteItem, RemoteError>;

    /// Creates a new file under `parent` in a single PUT.
    async fn put_small_new(
        &self,
        parent: &ItemId,
        name: &str,
        bytes: &[u8],
    ) -> Result<RemoteItem, RemoteError>;

    /// Negotiates a resumable upload session replacing an existing item.
    async fn create_upload_session(&self, id: &ItemId) -> Result<SessionHandle, RemoteError>;

    /// Negotiates a resumable upload session for a new file.
    async fn create_upload_session_new(
        &self,
        parent: &ItemId,
        name: &str,
    ) -> Result<SessionHandle, RemoteError>;

    /// Uploads one chunk with a Content-Range header.
    async fn put_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, RemoteError>;

    /// Interrogates a session for the next expected byte (resume point).
    async fn session_status(&self, session: &SessionHandle) -> Result<u64, RemoteError>;

    /// Creates a folder.
    async fn create_folder(&self, parent: &ItemId, name: &str)
        -> Result<RemoteItem, RemoteError>;

    /// Patches name / parent / modified time.
    async fn patch_metadata(
        &self,
        id: &ItemId,
        patch: &MetadataPatch,
    ) -> Result<RemoteItem, RemoteError>;

    /// Deletes an item.
    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError>;

    /// Pulls one batch from the change feed. `None` starts a full
    /// enumeration; a stored [`DeltaLink`] resumes incrementally.
    async fn delta(&self, link: Option<&DeltaLink>) -> Result<DeltaPage, RemoteError>;

    /// The account's principal name (used for the volume-info file).
    async fn principal_name(&self) -> Result<String, RemoteError>;
}
