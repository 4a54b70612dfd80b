//! Kernel inode number ↔ item id mapping.
//!
//! The kernel speaks u64 inode numbers; the engine speaks opaque item
//! ids. This table owns the translation, allocating numbers on first
//! sight. Lock-free via DashMap so every FUSE dispatch thread can
//! translate concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use nimbus_core::domain::ids::ItemId;

/// The root's fixed kernel inode number.
pub const ROOT_INO: u64 = 1;

/// Bidirectional ino ↔ id table.
pub struct InodeMap {
    by_ino: DashMap<u64, ItemId>,
    by_id: DashMap<ItemId, u64>,
    next: AtomicU64,
}

impl InodeMap {
    /// Creates the table with the root pre-registered as ino 1.
    pub fn new(root: ItemId) -> Self {
        let map = Self {
            by_ino: DashMap::new(),
            by_id: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        map.by_ino.insert(ROOT_INO, root.clone());
        map.by_id.insert(root, ROOT_INO);
        map
    }

    /// The inode number for an id, allocating on first sight.
    pub fn ino_for(&self, id: &ItemId) -> u64 {
        if let Some(existing) = self.by_id.get(id) {
            return *existing;
        }
        let ino = self.next.fetch_add(1, Ordering::SeqCst);
        self.by_id.insert(id.clone(), ino);
        self.by_ino.insert(ino, id.clone());
        ino
    }

    /// The id behind an inode number.
    pub fn id_for(&self, ino: u64) -> Option<ItemId> {
        self.by_ino.get(&ino).map(|r| r.clone())
    }

    /// Drops a mapping after an unlink.
    pub fn remove(&self, ino: u64) {
        if let Some((_, id)) = self.by_ino.remove(&ino) {
            self.by_id.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}
