//! In-memory mock drive for engine tests.
//!
//! Behaves like the remote closely enough for the managers: server ids
//! are minted on create, QuickXor hashes and ETags are computed for
//! real, name collisions answer with conflicts, and upload sessions
//! accept ranged chunks. A switch simulates connectivity loss.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use nimbus_core::domain::ids::{ContentHash, DeltaLink, ETag, ItemId};
use nimbus_core::ports::remote::{
    ChildrenPage, ChunkOutcome, CloudProvider, DeltaPage, MetadataPatch, RemoteError,
    RemoteErrorKind, RemoteItem, SessionHandle,
};
use nimbus_hash::quick_xor_base64;

/// The root id every test drive uses.
pub const MOCK_ROOT: &str = "ROOT";

struct MockSession {
    parent: ItemId,
    name: String,
    existing: Option<ItemId>,
    total: u64,
    buf: Vec<u8>,
    next_expected: u64,
}

/// Scriptable in-memory remote drive.
pub struct MockDrive {
    items: Mutex<HashMap<ItemId, RemoteItem>>,
    bodies: Mutex<HashMap<ItemId, Vec<u8>>>,
    sessions: Mutex<HashMap<String, MockSession>>,
    delta_batches: Mutex<Vec<Vec<RemoteItem>>>,
    next_id: AtomicU64,
    next_session: AtomicU64,
    offline: AtomicBool,
}

impl MockDrive {
    pub fn new() -> Self {
        let drive = Self {
            items: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            delta_batches: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            offline: AtomicBool::new(false),
        };
        let root = RemoteItem {
            id: ItemId::new(MOCK_ROOT).unwrap(),
            name: "root".to_string(),
            parent_id: None,
            size: 0,
            is_directory: true,
            is_deleted: false,
            hash: None,
            etag: None,
            modified: Some(Utc::now()),
            child_count: Some(0),
        };
        drive.items.lock().unwrap().insert(root.id.clone(), root);
        drive
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::network("mock drive offline"))
        } else {
            Ok(())
        }
    }

    fn mint_id(&self) -> ItemId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        ItemId::new(format!("srv-{n}")).unwrap()
    }

    /// Registers a remote-side item directly (test arrangement).
    pub fn seed(&self, item: RemoteItem, body: Option<Vec<u8>>) {
        if let Some(body) = body {
            self.bodies.lock().unwrap().insert(item.id.clone(), body);
        }
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    /// Queues a scripted delta batch.
    pub fn push_delta(&self, items: Vec<RemoteItem>) {
        self.delta_batches.lock().unwrap().push(items);
    }

    /// Reads the committed body for assertions.
    pub fn body_of(&self, id: &ItemId) -> Option<Vec<u8>> {
        self.bodies.lock().unwrap().get(id).cloned()
    }

    /// Reads committed item metadata for assertions.
    pub fn item(&self, id: &ItemId) -> Option<RemoteItem> {
        self.items.lock().unwrap().get(id).cloned()
    }

    /// Finds a child by (parent, case-folded name).
    pub fn child_by_name(&self, parent: &ItemId, name: &str) -> Option<RemoteItem> {
        let folded = name.to_lowercase();
        self.items
            .lock()
            .unwrap()
            .values()
            .find(|i| {
                i.parent_id.as_ref() == Some(parent) && i.name.to_lowercase() == folded
            })
            .cloned()
    }

    fn commit_file(
        &self,
        existing: Option<ItemId>,
        parent: &ItemId,
        name: &str,
        bytes: &[u8],
    ) -> Result<RemoteItem, RemoteError> {
        let mut items = self.items.lock().unwrap();
        let id = match existing {
            Some(id) => id,
            None => {
                let folded = name.to_lowercase();
                let collision = items.values().any(|i| {
                    i.parent_id.as_ref() == Some(parent) && i.name.to_lowercase() == folded
                });
                if collision {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Conflict,
                        format!("{name} already exists"),
                    ));
                }
                self.mint_id()
            }
        };

        let version = items
            .get(&id)
            .and_then(|i| i.etag.as_ref())
            .and_then(|e| e.as_str().strip_prefix('v'))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        let item = RemoteItem {
            id: id.clone(),
            name: name.to_string(),
            parent_id: Some(parent.clone()),
            size: bytes.len() as u64,
            is_directory: false,
            is_deleted: false,
            hash: ContentHash::new(quick_xor_base64(bytes)).ok(),
            etag: Some(ETag::new(format!("v{version}"))),
            modified: Some(Utc::now()),
            child_count: None,
        };
        items.insert(id.clone(), item.clone());
        drop(items);
        self.bodies.lock().unwrap().insert(id, bytes.to_vec());
        Ok(item)
    }
}

impl Default for MockDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MockDrive {
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, RemoteError> {
        self.check_online()?;
        self.items
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(id.to_string()))
    }

    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, RemoteError> {
        self.check_online()?;
        let mut current = self
            .items
            .lock()
            .unwrap()
            .get(&ItemId::new(MOCK_ROOT).unwrap())
            .cloned()
            .ok_or_else(|| RemoteError::not_found("root"))?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self
                .child_by_name(&current.id, component)
                .ok_or_else(|| RemoteError::not_found(path.to_string()))?;
        }
        Ok(current)
    }

    async fn list_children(
        &self,
        id: &ItemId,
        _page_token: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError> {
        self.check_online()?;
        let items = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.parent_id.as_ref() == Some(id))
            .cloned()
            .collect();
        Ok(ChildrenPage {
            items,
            next_token: None,
        })
    }

    async fn get_content(
        &self,
        id: &ItemId,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, RemoteError> {
        self.check_online()?;
        let bodies = self.bodies.lock().unwrap();
        let body = bodies
            .get(id)
            .ok_or_else(|| RemoteError::not_found(id.to_string()))?;
        Ok(match range {
            Some(r) => {
                let start = (r.start as usize).min(body.len());
                let end = (r.end as usize).min(body.len());
                body[start..end].to_vec()
            }
            None => body.clone(),
        })
    }

    async fn put_small(&self, id: &ItemId, bytes: &[u8]) -> Result<RemoteItem, RemoteError> {
        self.check_online()?;
        let (parent, name) = {
            let items = self.items.lock().unwrap();
            let item = items
                .get(id)
                .ok_or_else(|| RemoteError::not_found(id.to_string()))?;
            (
                item.parent_id
                    .clone()
                    .ok_or_else(|| RemoteError::validation("cannot put to root"))?,
                item.name.clone(),
            )
        };
        self.commit_file(Some(id.clone()), &parent, &name, bytes)
    }

    async fn put_small_new(
        &self,
        parent: &ItemId,
        name: &str,
        bytes: &[u8],
    ) -> Result<RemoteItem, RemoteError> {
        self.check_online()?;
        self.commit_file(None, parent, name, bytes)
    }

    async fn create_upload_session(&self, id: &ItemId) -> Result<SessionHandle, RemoteError> {
        self.check_online()?;
        let (parent, name, size) = {
            let items = self.items.lock().unwrap();
            let item = items
                .get(id)
                .ok_or_else(|| RemoteError::not_found(id.to_string()))?;
            (
                item.parent_id
                    .clone()
                    .ok_or_else(|| RemoteError::validation("cannot upload to root"))?,
                item.name.clone(),
                item.size,
            )
        };
        let url = format!(
            "mock://session/{}",
            self.next_session.fetch_add(1, Ordering::SeqCst)
        );
        self.sessions.lock().unwrap().insert(
            url.clone(),
            MockSession {
                parent,
                name,
                existing: Some(id.clone()),
                total: size,
                buf: Vec::new(),
                next_expected: 0,
            },
        );
        Ok(SessionHandle {
            upload_url: url,
            expires: None,
        })
    }

    async fn create_upload_session_new(
        &self,
        parent: &ItemId,
        name: &str,
    ) -> Result<SessionHandle, RemoteError> {
        self.check_online()?;
        let url = format!(
            "mock://session/{}",
            self.next_session.fetch_add(1, Ordering::SeqCst)
        );
        self.sessions.lock().unwrap().insert(
            url.clone(),
            MockSession {
                parent: parent.clone(),
                name: name.to_string(),
                existing: None,
                total: 0,
                buf: Vec::new(),
                next_expected: 0,
            },
        );
        Ok(SessionHandle {
            upload_url: url,
            expires: None,
        })
    }

    async fn put_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, RemoteError> {
        self.check_online()?;
        let commit_input = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions
                .get_mut(&session.upload_url)
                .ok_or_else(|| RemoteError::not_found("upload session"))?;
            if offset != state.next_expected {
                return Err(RemoteError::validation(format!(
                    "chunk at {offset}, expected {}",
                    state.next_expected
                )));
            }
            state.total = total;
            state.buf.resize(offset as usize, 0);
            state.buf.extend_from_slice(bytes);
            state.next_expected = offset + bytes.len() as u64;

            if state.next_expected >= total {
                let input = (
                    state.existing.clone(),
                    state.parent.clone(),
                    state.name.clone(),
                    state.buf.clone(),
                );
                sessions.remove(&session.upload_url);
                Some(input)
            } else {
                None
            }
        };

        match commit_input {
            Some((existing, parent, name, buf)) => {
                let item = self.commit_file(existing, &parent, &name, &buf)?;
                Ok(ChunkOutcome::Complete(Box::new(item)))
            }
            None => {
                let next = {
                    let sessions = self.sessions.lock().unwrap();
                    sessions
                        .get(&session.upload_url)
                        .map(|s| s.next_expected)
                        .unwrap_or(0)
                };
                Ok(ChunkOutcome::Accepted {
                    next_expected: next,
                })
            }
        }
    }

    async fn session_status(&self, session: &SessionHandle) -> Result<u64, RemoteError> {
        self.check_online()?;
        self.sessions
            .lock()
            .unwrap()
            .get(&session.upload_url)
            .map(|s| s.next_expected)
            .ok_or_else(|| RemoteError::not_found("upload session"))
    }

    async fn create_folder(
        &self,
        parent: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        self.check_online()?;
        if self.child_by_name(parent, name).is_some() {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("{name} already exists"),
            ));
        }
        let item = RemoteItem {
            id: self.mint_id(),
            name: name.to_string(),
            parent_id: Some(parent.clone()),
            size: 0,
            is_directory: true,
            is_deleted: false,
            hash: None,
            etag: Some(ETag::new("v1")),
            modified: Some(Utc::now()),
            child_count: Some(0),
        };
        self.items
            .lock()
            .unwrap()
            .insert(item.id.clone(), item.clone());
        Ok(item)
    }

    async fn patch_metadata(
        &self,
        id: &ItemId,
        patch: &MetadataPatch,
    ) -> Result<RemoteItem, RemoteError> {
        self.check_online()?;
        let (new_parent, new_name) = {
            let items = self.items.lock().unwrap();
            let item = items
                .get(id)
                .ok_or_else(|| RemoteError::not_found(id.to_string()))?;
            (
                patch
                    .parent_id
                    .clone()
                    .or_else(|| item.parent_id.clone())
                    .ok_or_else(|| RemoteError::validation("cannot move the root"))?,
                patch.name.clone().unwrap_or_else(|| item.name.clone()),
            )
        };

        if let Some(occupant) = self.child_by_name(&new_parent, &new_name) {
            if &occupant.id != id {
                return Err(RemoteError::new(
                    RemoteErrorKind::Conflict,
                    format!("{new_name} already exists"),
                ));
            }
        }

        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(id.to_string()))?;
        item.parent_id = Some(new_parent);
        item.name = new_name;
        if let Some(mtime) = patch.mtime {
            item.modified = Some(mtime);
        }
        Ok(item.clone())
    }

    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError> {
        self.check_online()?;
        let removed = self.items.lock().unwrap().remove(id);
        self.bodies.lock().unwrap().remove(id);
        if removed.is_none() {
            return Err(RemoteError::not_found(id.to_string()));
        }
        Ok(())
    }

    async fn delta(&self, _link: Option<&DeltaLink>) -> Result<DeltaPage, RemoteError> {
        self.check_online()?;
        let mut batches = self.delta_batches.lock().unwrap();
        let items = if batches.is_empty() {
            Vec::new()
        } else {
            batches.remove(0)
        };
        Ok(DeltaPage {
            items,
            next_link: None,
            delta_link: Some(DeltaLink::new("mock://delta")),
        })
    }

    async fn principal_name(&self) -> Result<String, RemoteError> {
        self.check_online()?;
        Ok("tester@example.com".to_string())
    }
}
