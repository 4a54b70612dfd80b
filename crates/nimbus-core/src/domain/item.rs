//! The cached item entity and its hydration state machine.
//!
//! An [`Inode`] mirrors one remote drive item. Bodies are fetched on
//! demand, so the entity tracks how much of the item is locally real:
//!
//! ```text
//!     ┌───────┐    access     ┌───────────┐   complete   ┌──────────┐
//!     │ Ghost │ ────────────► │ Hydrating │ ───────────► │ Hydrated │
//!     │(meta) │               │(streaming)│              │ (local)  │
//!     └───────┘               └───────────┘              └──────────┘
//!         ▲                                                   │
//!         │ evict                                    write    │
//!         └───────────────────────────────────────────────────┤
//!                                                             ▼
//!                                                      ┌────────────┐
//!                                  upload committed ◄──│ DirtyLocal │
//!                                                      └────────────┘
//! ```
//!
//! A `DirtyLocal` body is pinned: the content cache may never evict it
//! until the pending upload commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::ids::{ContentHash, ETag, ItemId};

/// What kind of object an inode represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Regular file with a (possibly absent) cached body.
    File,
    /// Directory; children are listed lazily.
    Directory,
    /// Locally generated item whose bytes live in memory and are never
    /// uploaded (e.g. the volume-info file).
    Virtual,
}

/// Hydration state of a cached item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Metadata known, body absent.
    #[default]
    Ghost,
    /// Body currently streaming in from the remote.
    Hydrating,
    /// Body present and identical to the last committed remote content.
    Hydrated,
    /// Body present and modified locally; upload pending.
    DirtyLocal,
    /// Item is unusable until reconciled; reason attached.
    Error(String),
}

impl ItemState {
    /// Returns true if the item's bytes are locally available.
    pub fn is_local(&self) -> bool {
        matches!(self, ItemState::Hydrated | ItemState::DirtyLocal)
    }

    /// Returns the state name without any error detail.
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Ghost => "Ghost",
            ItemState::Hydrating => "Hydrating",
            ItemState::Hydrated => "Hydrated",
            ItemState::DirtyLocal => "DirtyLocal",
            ItemState::Error(_) => "Error",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Ghost => write!(f, "ghost"),
            ItemState::Hydrating => write!(f, "hydrating"),
            ItemState::Hydrated => write!(f, "hydrated"),
            ItemState::DirtyLocal => write!(f, "dirty"),
            ItemState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// The cached representation of one remote drive item.
///
/// Identity is the server-assigned id; until the server has seen a
/// locally created item a synthetic `local-` id stands in (and is
/// rewritten atomically on upload commit, see `InodeGraph::adopt_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    /// Stable item id (server-assigned, or `local-…` until committed).
    id: ItemId,
    /// Parent directory id; `None` only for the drive root.
    parent: Option<ItemId>,
    /// Display name, original case preserved.
    name: String,
    /// File / directory / virtual.
    kind: ItemKind,
    /// Unix mode bits; local-only, never synced.
    mode: u32,
    /// Size in bytes (0 for directories).
    size: u64,
    /// Last modified time.
    mtime: DateTime<Utc>,
    /// Content hash the remote last reported.
    remote_hash: Option<ContentHash>,
    /// Hash of the local body while dirty.
    local_hash: Option<ContentHash>,
    /// Remote version tag.
    etag: Option<ETag>,
    /// Hydration state.
    state: ItemState,
    /// Body differs from the last committed remote content.
    has_changes: bool,
    /// A local operation is awaiting server acknowledgement.
    pending_remote: bool,
    /// True once a children listing for this directory has succeeded.
    children_loaded: bool,
    /// Child-count hint from the remote folder facet.
    child_count: Option<u64>,
    /// In-memory bytes for virtual items; never persisted.
    #[serde(skip)]
    virtual_body: Option<Vec<u8>>,
}

impl Inode {
    /// Creates a file inode from remote metadata.
    pub fn new_file(
        id: ItemId,
        parent: ItemId,
        name: impl Into<String>,
        size: u64,
        mtime: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let name = validated_name(name.into())?;
        Ok(Self {
            id,
            parent: Some(parent),
            name,
            kind: ItemKind::File,
            mode: 0o644,
            size,
            mtime,
            remote_hash: None,
            local_hash: None,
            etag: None,
            state: ItemState::Ghost,
            has_changes: false,
            pending_remote: false,
            children_loaded: false,
            child_count: None,
            virtual_body: None,
        })
    }

    /// Creates a directory inode.
    ///
    /// Directories have no body, so they are born `Hydrated`.
    pub fn new_directory(
        id: ItemId,
        parent: Option<ItemId>,
        name: impl Into<String>,
        mtime: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let name = validated_name(name.into())?;
        Ok(Self {
            id,
            parent,
            name,
            kind: ItemKind::Directory,
            mode: 0o755,
            size: 0,
            mtime,
            remote_hash: None,
            local_hash: None,
            etag: None,
            state: ItemState::Hydrated,
            has_changes: false,
            pending_remote: false,
            children_loaded: false,
            child_count: None,
            virtual_body: None,
        })
    }

    /// Creates a virtual inode whose bytes live in memory.
    ///
    /// Virtual items never enqueue uploads and are regenerated at mount,
    /// so they are not persisted either.
    pub fn new_virtual(
        parent: ItemId,
        name: impl Into<String>,
        body: Vec<u8>,
    ) -> Result<Self, DomainError> {
        let name = validated_name(name.into())?;
        Ok(Self {
            id: ItemId::local(),
            parent: Some(parent),
            name,
            kind: ItemKind::Virtual,
            mode: 0o444,
            size: body.len() as u64,
            mtime: Utc::now(),
            remote_hash: None,
            local_hash: None,
            etag: None,
            state: ItemState::Hydrated,
            has_changes: false,
            pending_remote: false,
            children_loaded: false,
            child_count: None,
            virtual_body: Some(body),
        })
    }

    // --- Accessors ---

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn parent(&self) -> Option<&ItemId> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    pub fn remote_hash(&self) -> Option<&ContentHash> {
        self.remote_hash.as_ref()
    }

    pub fn local_hash(&self) -> Option<&ContentHash> {
        self.local_hash.as_ref()
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    pub fn has_changes(&self) -> bool {
        self.has_changes
    }

    pub fn pending_remote(&self) -> bool {
        self.pending_remote
    }

    pub fn children_loaded(&self) -> bool {
        self.children_loaded
    }

    pub fn child_count(&self) -> Option<u64> {
        self.child_count
    }

    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == ItemKind::Virtual
    }

    /// Bytes of a virtual item.
    pub fn virtual_body(&self) -> Option<&[u8]> {
        self.virtual_body.as_deref()
    }

    /// True if the dirty body must not be evicted.
    pub fn body_pinned(&self) -> bool {
        self.has_changes
    }

    // --- Mutators ---

    pub fn set_parent(&mut self, parent: ItemId) {
        self.parent = Some(parent);
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), DomainError> {
        self.name = validated_name(name.into())?;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode & 0o7777;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_mtime(&mut self, mtime: DateTime<Utc>) {
        self.mtime = mtime;
    }

    pub fn set_remote_hash(&mut self, hash: Option<ContentHash>) {
        self.remote_hash = hash;
    }

    pub fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }

    pub fn set_pending_remote(&mut self, pending: bool) {
        self.pending_remote = pending;
    }

    pub fn set_children_loaded(&mut self, loaded: bool) {
        self.children_loaded = loaded;
    }

    pub fn set_child_count(&mut self, count: Option<u64>) {
        self.child_count = count;
    }

    /// Rewrites the id after the server acknowledged a local create.
    ///
    /// Callers must hold the graph's id-table lock; queued work keyed by
    /// the old id is translated through the alias table.
    pub fn adopt_id(&mut self, id: ItemId) {
        self.id = id;
    }

    /// Records a local body modification.
    ///
    /// Sets `has_changes`, stores the new local hash, and moves the state
    /// to `DirtyLocal`. Virtual items reject this: their bytes are not
    /// upload material.
    pub fn mark_dirty(
        &mut self,
        local_hash: Option<ContentHash>,
        size: u64,
        mtime: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.is_virtual() {
            return Err(DomainError::Validation(
                "virtual items cannot be modified".to_string(),
            ));
        }
        if self.state != ItemState::DirtyLocal {
            self.transition_to(ItemState::DirtyLocal)?;
        }
        self.has_changes = true;
        self.local_hash = local_hash;
        self.size = size;
        self.mtime = mtime;
        Ok(())
    }

    /// Applies a successful upload commit.
    ///
    /// Clears the dirty flags, promotes the local hash to the committed
    /// remote hash, and records the fresh version tag.
    pub fn commit_upload(
        &mut self,
        remote_hash: Option<ContentHash>,
        etag: Option<ETag>,
    ) -> Result<(), DomainError> {
        if self.state == ItemState::DirtyLocal {
            self.transition_to(ItemState::Hydrated)?;
        }
        self.remote_hash = remote_hash.or_else(|| self.local_hash.clone());
        self.local_hash = None;
        self.etag = etag;
        self.has_changes = false;
        self.pending_remote = false;
        Ok(())
    }

    // --- State machine ---

    /// Checks if a state transition is valid.
    ///
    /// - Ghost → Hydrating, DirtyLocal (local create / cached-RW write), Error
    /// - Hydrating → Hydrated, Ghost (aborted), Error
    /// - Hydrated → DirtyLocal, Ghost (evicted), Error
    /// - DirtyLocal → Hydrated (upload committed), Error
    /// - Error → any (retry)
    pub fn can_transition_to(&self, target: &ItemState) -> bool {
        if matches!(self.state, ItemState::Error(_)) {
            return true;
        }
        matches!(
            (&self.state, target),
            (ItemState::Ghost, ItemState::Hydrating)
                | (ItemState::Ghost, ItemState::DirtyLocal)
                | (ItemState::Ghost, ItemState::Error(_))
                | (ItemState::Hydrating, ItemState::Hydrated)
                | (ItemState::Hydrating, ItemState::Ghost)
                | (ItemState::Hydrating, ItemState::Error(_))
                | (ItemState::Hydrated, ItemState::DirtyLocal)
                | (ItemState::Hydrated, ItemState::Ghost)
                | (ItemState::Hydrated, ItemState::Error(_))
                | (ItemState::DirtyLocal, ItemState::Hydrated)
                | (ItemState::DirtyLocal, ItemState::Error(_))
        )
    }

    /// Attempts a state transition, rejecting invalid moves.
    pub fn transition_to(&mut self, target: ItemState) -> Result<(), DomainError> {
        if !self.can_transition_to(&target) {
            return Err(DomainError::InvalidState {
                from: self.state.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.state = target;
        Ok(())
    }

    /// Resets a stale `Hydrating` state left behind by a crash.
    ///
    /// Bypasses transition validation: the partial body has already been
    /// discarded by the caller.
    pub fn reset_after_crash(&mut self) {
        if self.state == ItemState::Hydrating {
            self.state = ItemState::Ghost;
        }
    }
}

/// Validates a single path component.
fn validated_name(name: String) -> Result<String, DomainError> {
    if name.is_empty() || name.len() > 255 {
        return Err(DomainError::InvalidName(name));
    }
    if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
        return Err(DomainError::InvalidName(name));
    }
    Ok(name)
}
