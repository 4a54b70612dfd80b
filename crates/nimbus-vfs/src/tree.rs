//! The in-memory inode graph.
//!
//! Canonical map of item id → inode plus, per directory, an ordered
//! child index keyed by case-folded name. Children are stored as ids,
//! never as owning references, so the directory ↔ child relationship
//! stays acyclic; everything resolves through the owning map.
//!
//! ## Case policy
//!
//! Names are preserved verbatim for display, but uniqueness is enforced
//! case-insensitively to match the remote: creating `readme.md` next to
//! `README.md` is a validation error, and lookups fold the queried name
//! so either spelling reaches the same item.
//!
//! ## Locking
//!
//! Readers go through DashMap's sharded locks only. Structural writers
//! (insert, remove, rename, id adoption) additionally serialize on one
//! coarse mutex, which removes lock-order headaches between the child
//! indexes of two directories during a cross-parent rename. Guards on
//! individual entries are never held across another map operation.
//!
//! ## Local-id aliasing
//!
//! When an upload commits, the synthetic `local-…` id is rewritten to
//! the server id in place and an alias entry is kept, so queued work
//! that still holds the local id resolves to the same inode.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use nimbus_core::domain::errors::DomainError;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::{Inode, ItemState};
use tracing::{debug, warn};

use crate::error::VfsError;
use crate::persist::PersistHandle;

/// The inode graph.
pub struct InodeGraph {
    /// id → inode. The single owning map.
    items: DashMap<ItemId, Inode>,
    /// directory id → (case-folded child name → child id), ordered for
    /// stable readdir output.
    children: DashMap<ItemId, BTreeMap<String, ItemId>>,
    /// local id → server id redirect table.
    aliases: DashMap<ItemId, ItemId>,
    /// Well-known root id.
    root: ItemId,
    /// Serializes structural mutations.
    structure: Mutex<()>,
    /// Write-behind persistence.
    persist: PersistHandle,
}

/// Case-folds a name for uniqueness and lookup.
fn fold(name: &str) -> String {
    name.to_lowercase()
}

impl InodeGraph {
    /// Creates a graph holding only the root directory.
    pub fn new(root_id: ItemId, persist: PersistHandle) -> Self {
        let root_inode = Inode::new_directory(root_id.clone(), None, "root", Utc::now())
            .expect("root inode is statically valid");
        let graph = Self {
            items: DashMap::new(),
            children: DashMap::new(),
            aliases: DashMap::new(),
            root: root_id.clone(),
            structure: Mutex::new(()),
            persist,
        };
        graph.items.insert(root_id.clone(), root_inode);
        graph.children.insert(root_id, BTreeMap::new());
        graph
    }

    pub fn root_id(&self) -> &ItemId {
        &self.root
    }

    /// Chases the alias table; ids with no alias map to themselves.
    pub fn resolve(&self, id: &ItemId) -> ItemId {
        let mut current = id.clone();
        // The chain is at most a handful deep; bound it defensively.
        for _ in 0..8 {
            match self.aliases.get(&current) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        current
    }

    /// Snapshot of one inode.
    pub fn get(&self, id: &ItemId) -> Option<Inode> {
        let id = self.resolve(id);
        self.items.get(&id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(&self.resolve(id))
    }

    /// Number of items in the graph (including the root).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Applies a non-structural mutation and persists the result.
    ///
    /// `f` must not change the inode's id, parent or name; those go
    /// through [`rename`](Self::rename) / [`adopt_server_id`](Self::adopt_server_id).
    pub fn update<R>(
        &self,
        id: &ItemId,
        f: impl FnOnce(&mut Inode) -> Result<R, DomainError>,
    ) -> Result<R, VfsError> {
        let id = self.resolve(id);
        let mut entry = self
            .items
            .get_mut(&id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
        let result = f(entry.value_mut())?;
        let snapshot = entry.clone();
        drop(entry);
        self.persist.save(&snapshot);
        Ok(result)
    }

    /// Inserts a new inode under its parent.
    ///
    /// Fails when the parent is absent or not a directory, or when a
    /// sibling with the same case-folded name exists.
    pub fn insert(&self, inode: Inode) -> Result<(), VfsError> {
        let _guard = self.structure.lock().expect("graph lock poisoned");

        let parent = inode
            .parent()
            .cloned()
            .ok_or_else(|| VfsError::Domain(DomainError::Validation(
                "only the root may have no parent".to_string(),
            )))?;
        let parent = self.resolve(&parent);

        {
            let parent_inode = self
                .items
                .get(&parent)
                .ok_or_else(|| VfsError::NotFound(parent.to_string()))?;
            if !parent_inode.is_directory() {
                return Err(VfsError::Domain(DomainError::Validation(format!(
                    "parent {} is not a directory",
                    parent
                ))));
            }
        }

        let folded = fold(inode.name());
        {
            let mut bucket = self.children.entry(parent.clone()).or_default();
            if bucket.contains_key(&folded) {
                return Err(VfsError::Domain(DomainError::SiblingCollision(
                    inode.name().to_string(),
                )));
            }
            bucket.insert(folded, inode.id().clone());
        }

        if inode.is_directory() {
            self.children.entry(inode.id().clone()).or_default();
        }
        self.persist.save(&inode);
        self.items.insert(inode.id().clone(), inode);
        Ok(())
    }

    /// Looks up a child by name (case-folded) under a directory.
    pub fn lookup_child(&self, parent: &ItemId, name: &str) -> Option<Inode> {
        let parent = self.resolve(parent);
        let child_id = {
            let bucket = self.children.get(&parent)?;
            bucket.get(&fold(name)).cloned()?
        };
        self.items.get(&child_id).map(|r| r.clone())
    }

    /// Snapshot of a directory's children, ordered by folded name.
    pub fn children_of(&self, parent: &ItemId) -> Vec<Inode> {
        let parent = self.resolve(parent);
        let ids: Vec<ItemId> = match self.children.get(&parent) {
            Some(bucket) => bucket.values().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.items.get(id).map(|r| r.clone()))
            .collect()
    }

    /// True if the directory has at least one child in the graph.
    pub fn has_children(&self, parent: &ItemId) -> bool {
        let parent = self.resolve(parent);
        self.children
            .get(&parent)
            .map(|b| !b.is_empty())
            .unwrap_or(false)
    }

    /// Removes an inode. Directories must be empty.
    pub fn remove(&self, id: &ItemId) -> Result<Inode, VfsError> {
        let _guard = self.structure.lock().expect("graph lock poisoned");
        let id = self.resolve(id);

        let inode = self
            .items
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;

        if inode.is_directory() && self.has_children_locked(&id) {
            return Err(VfsError::NotEmpty(inode.name().to_string()));
        }

        if let Some(parent) = inode.parent() {
            let parent = self.resolve(parent);
            if let Some(mut bucket) = self.children.get_mut(&parent) {
                bucket.remove(&fold(inode.name()));
            }
        }
        self.children.remove(&id);
        self.items.remove(&id);
        self.persist.delete(&id);
        debug!(id = %id, name = inode.name(), "inode removed from graph");
        Ok(inode)
    }

    fn has_children_locked(&self, id: &ItemId) -> bool {
        self.children.get(id).map(|b| !b.is_empty()).unwrap_or(false)
    }

    /// Renames and/or moves an inode.
    ///
    /// Within a parent this is metadata-only. A rename onto an existing
    /// sibling with the **same exact name** replaces it atomically in
    /// the child index and returns the displaced inode (the caller
    /// enqueues its server-side delete). A target differing only in
    /// case is a validation error, not a silent overwrite.
    pub fn rename(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<Option<Inode>, VfsError> {
        let _guard = self.structure.lock().expect("graph lock poisoned");
        let id = self.resolve(id);
        let new_parent = self.resolve(new_parent);

        let inode = self
            .items
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
        let old_parent = inode
            .parent()
            .map(|p| self.resolve(p))
            .ok_or_else(|| VfsError::Domain(DomainError::Validation(
                "cannot rename the root".to_string(),
            )))?;

        {
            let target_dir = self
                .items
                .get(&new_parent)
                .ok_or_else(|| VfsError::NotFound(new_parent.to_string()))?;
            if !target_dir.is_directory() {
                return Err(VfsError::Domain(DomainError::Validation(format!(
                    "rename target parent {} is not a directory",
                    new_parent
                ))));
            }
        }

        let folded_new = fold(new_name);

        // Inspect the destination slot first; guard dropped before any
        // further map access.
        let occupant: Option<ItemId> = {
            let bucket = self.children.entry(new_parent.clone()).or_default();
            bucket.get(&folded_new).cloned()
        };

        let mut displaced = None;
        if let Some(occupant_id) = occupant {
            if occupant_id == id {
                // Pure case change of the same item; allowed.
            } else {
                let occupant_inode = self
                    .items
                    .get(&occupant_id)
                    .map(|r| r.clone())
                    .ok_or_else(|| VfsError::Corrupt(format!(
                        "child index references missing inode {occupant_id}"
                    )))?;
                if occupant_inode.name() != new_name {
                    // Case-variant collision with a different item.
                    return Err(VfsError::Domain(DomainError::SiblingCollision(
                        new_name.to_string(),
                    )));
                }
                if occupant_inode.is_directory() && self.has_children_locked(&occupant_id) {
                    return Err(VfsError::NotEmpty(occupant_inode.name().to_string()));
                }
                // Replace: drop the occupant from the graph; the caller
                // commits the server-side delete.
                self.children.remove(&occupant_id);
                self.items.remove(&occupant_id);
                self.persist.delete(&occupant_id);
                displaced = Some(occupant_inode);
            }
        }

        // Detach from the old slot, then claim the new one. The insert
        // below replaces any displaced entry in a single map operation.
        if let Some(mut bucket) = self.children.get_mut(&old_parent) {
            bucket.remove(&fold(inode.name()));
        }
        {
            let mut bucket = self.children.entry(new_parent.clone()).or_default();
            bucket.insert(folded_new, id.clone());
        }

        let snapshot = {
            let mut entry = self
                .items
                .get_mut(&id)
                .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
            entry.set_name(new_name)?;
            entry.set_parent(new_parent.clone());
            entry.clone()
        };
        self.persist.save(&snapshot);

        debug!(id = %id, from = %old_parent, to = %new_parent, name = new_name, "inode renamed");
        Ok(displaced)
    }

    /// Atomically rewrites a local id to its server-issued id.
    ///
    /// The alias entry keeps queued operations holding the local id
    /// valid; persistence rewrites every bucket in one transaction.
    pub fn adopt_server_id(&self, local: &ItemId, server: ItemId) -> Result<(), VfsError> {
        let _guard = self.structure.lock().expect("graph lock poisoned");

        if !local.is_local() {
            return Err(VfsError::Domain(DomainError::Validation(format!(
                "{local} is not a local id"
            ))));
        }
        let (_, mut inode) = self
            .items
            .remove(local)
            .ok_or_else(|| VfsError::NotFound(local.to_string()))?;

        inode.adopt_id(server.clone());

        // Re-point the parent's child index entry.
        if let Some(parent) = inode.parent().cloned() {
            let parent = self.resolve(&parent);
            if let Some(mut bucket) = self.children.get_mut(&parent) {
                bucket.insert(fold(inode.name()), server.clone());
            }
        }

        // Move the child bucket and re-parent the children.
        if let Some((_, bucket)) = self.children.remove(local) {
            let child_ids: Vec<ItemId> = bucket.values().cloned().collect();
            self.children.insert(server.clone(), bucket);
            for child_id in child_ids {
                if let Some(mut child) = self.items.get_mut(&child_id) {
                    child.set_parent(server.clone());
                }
            }
        }

        self.items.insert(server.clone(), inode);
        self.aliases.insert(local.clone(), server.clone());
        self.persist.rewrite_id(local, &server);
        debug!(local = %local, server = %server, "local id adopted");
        Ok(())
    }

    /// Resolves an absolute path by walking from the root.
    pub fn resolve_path(&self, path: &str) -> Option<Inode> {
        let mut current = self.get(&self.root)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.lookup_child(&current.id().clone(), component)?;
        }
        Some(current)
    }

    /// Reconstructs the absolute path of an item.
    pub fn path_of(&self, id: &ItemId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent().cloned() {
            parts.push(current.name().to_string());
            current = self.get(&parent)?;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    /// Ids of every item currently in the graph.
    pub fn all_ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|r| r.key().clone()).collect()
    }

    /// Ids of items with uncommitted local changes.
    pub fn dirty_ids(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|r| r.value().has_changes())
            .map(|r| r.key().clone())
            .collect()
    }

    /// Replays persisted inodes at startup.
    ///
    /// Orphans (parent not yet inserted) are deferred and re-linked
    /// after one full pass; anything still unresolved is dropped with a
    /// diagnostic — the next delta enumeration restores it.
    pub fn replay(&self, inodes: Vec<Inode>) -> usize {
        let mut pending = inodes;
        let mut inserted = 0usize;

        // Stale Hydrating states mean a crash mid-download; the caller
        // already discarded the partial bodies.
        for inode in pending.iter_mut() {
            if *inode.state() == ItemState::Hydrating {
                inode.reset_after_crash();
            }
        }

        loop {
            let mut deferred = Vec::new();
            let mut progressed = false;
            for inode in pending {
                if inode.id() == &self.root {
                    continue;
                }
                let parent_known = inode
                    .parent()
                    .map(|p| self.items.contains_key(&self.resolve(p)))
                    .unwrap_or(false);
                if parent_known {
                    match self.insert(inode) {
                        Ok(()) => {
                            inserted += 1;
                            progressed = true;
                        }
                        Err(e) => warn!(error = %e, "replayed inode rejected"),
                    }
                } else {
                    deferred.push(inode);
                }
            }
            if deferred.is_empty() || !progressed {
                for orphan in &deferred {
                    warn!(id = %orphan.id(), name = orphan.name(), "dropping orphaned inode at replay");
                }
                break;
            }
            pending = deferred;
        }
        inserted
    }
}
