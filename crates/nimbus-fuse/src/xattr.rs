//! Extended attributes.
//!
//! A limited vocabulary in the user namespace:
//!
//! - `user.nimbus.status` — `dirty` | `syncing` | `clean` | `offline` | `error`
//! - `user.nimbus.etag` — the last committed remote version tag
//! - `user.nimbus.id` — the item id
//!
//! The built-in names are read-only; other `user.*` names are accepted
//! and held locally (never synced), everything outside the user
//! namespace is rejected.

use dashmap::DashMap;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::{Inode, ItemState};
use nimbus_vfs::{UploadState, Vfs};

/// Sync-status attribute name.
pub const XATTR_STATUS: &str = "user.nimbus.status";
/// ETag attribute name.
pub const XATTR_ETAG: &str = "user.nimbus.etag";
/// Item-id attribute name.
pub const XATTR_ID: &str = "user.nimbus.id";

/// Built-in names answered from engine state.
pub fn builtin_names() -> &'static [&'static str] {
    &[XATTR_STATUS, XATTR_ETAG, XATTR_ID]
}

/// Locally held user xattrs (never synced).
pub type LocalXattrs = DashMap<(ItemId, String), Vec<u8>>;

/// Computes the sync-status string for an item.
pub fn status_of(vfs: &Vfs, inode: &Inode) -> &'static str {
    if !vfs.oracle.is_online() {
        return "offline";
    }
    if matches!(inode.state(), ItemState::Error(_)) {
        return "error";
    }
    if let Some(state) = vfs.uploads.session_state(inode.id()) {
        if matches!(
            state,
            UploadState::Enqueued
                | UploadState::Running
                | UploadState::Committing
                | UploadState::Retry { .. }
        ) {
            return "syncing";
        }
    }
    if inode.has_changes() || *inode.state() == ItemState::Hydrating {
        if *inode.state() == ItemState::Hydrating {
            return "syncing";
        }
        return "dirty";
    }
    "clean"
}

/// Answers a getxattr for built-in names, or falls back to the local
/// table.
pub fn get(
    vfs: &Vfs,
    local: &LocalXattrs,
    inode: &Inode,
    name: &str,
) -> Option<Vec<u8>> {
    match name {
        XATTR_STATUS => Some(status_of(vfs, inode).as_bytes().to_vec()),
        XATTR_ETAG => inode.etag().map(|e| e.as_str().as_bytes().to_vec()),
        XATTR_ID => Some(inode.id().as_str().as_bytes().to_vec()),
        other => local
            .get(&(inode.id().clone(), other.to_string()))
            .map(|v| v.clone()),
    }
}

/// Full name list for listxattr: built-ins plus local names.
pub fn list(local: &LocalXattrs, inode: &Inode) -> Vec<String> {
    let mut names: Vec<String> = builtin_names().iter().map(|s| s.to_string()).collect();
    for entry in local.iter() {
        if entry.key().0 == *inode.id() {
            names.push(entry.key().1.clone());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_are_user_namespace() {
        for name in builtin_names() {
            assert!(name.starts_with("user."), "{name}");
        }
    }
}
