//! FUSE filesystem implementation.
//!
//! Implements `fuser::Filesystem` for NimbusFS, translating kernel
//! operations onto the engine: metadata against the inode graph, bytes
//! against the content cache, mutations into the upload manager or the
//! offline log depending on connectivity.
//!
//! The bridge is driven by multiple kernel dispatch threads; every
//! engine call that can suspend crosses into the tokio runtime through
//! a stored handle.

use std::ffi::{c_int, OsStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use nimbus_core::domain::change::ChangeOp;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::{Inode, ItemKind, ItemState};
use nimbus_core::ports::remote::MetadataPatch;
use nimbus_vfs::{DownloadPriority, UploadPriority, Vfs, VfsError};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::errno_for;
use crate::inode_map::{InodeMap, ROOT_INO};
use crate::xattr::{self, LocalXattrs};

/// TTL for kernel attribute caching. Short so remote changes absorbed
/// by the delta loop become visible quickly.
const TTL: Duration = Duration::from_secs(1);

/// Keep-cache flag for open replies on bodies already local.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// POSIX NAME_MAX.
const NAME_MAX: usize = 255;

/// Pseudo-capacity advertised by statfs; the real quota is unknown
/// until requested, and a large value keeps df and installers happy.
const PSEUDO_CAPACITY: u64 = 1 << 40;

const BLOCK_SIZE: u32 = 4096;

/// The FUSE-facing filesystem.
pub struct NimbusFs {
    rt: Handle,
    vfs: Arc<Vfs>,
    inodes: Arc<InodeMap>,
    local_xattrs: LocalXattrs,
    next_fh: AtomicU64,
}

impl NimbusFs {
    pub fn new(rt: Handle, vfs: Arc<Vfs>) -> Self {
        let inodes = Arc::new(InodeMap::new(vfs.graph.root_id().clone()));
        Self {
            rt,
            vfs,
            inodes,
            local_xattrs: LocalXattrs::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn inodes(&self) -> &Arc<InodeMap> {
        &self.inodes
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn id_of(&self, ino: u64) -> Result<ItemId, c_int> {
        self.inodes.id_for(ino).ok_or(libc::ENOENT)
    }

    fn inode_of(&self, ino: u64) -> Result<Inode, c_int> {
        let id = self.id_of(ino)?;
        self.vfs.graph.get(&id).ok_or(libc::ENOENT)
    }

    /// Validates one path component coming from the kernel.
    fn component(name: &OsStr) -> Result<&str, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        if name.len() > NAME_MAX {
            return Err(libc::ENAMETOOLONG);
        }
        Ok(name)
    }

    fn attr_for(&self, inode: &Inode, req: &Request<'_>) -> FileAttr {
        let ino = if inode.parent().is_none() {
            ROOT_INO
        } else {
            self.inodes.ino_for(inode.id())
        };
        let kind = match inode.kind() {
            ItemKind::Directory => FileType::Directory,
            ItemKind::File | ItemKind::Virtual => FileType::RegularFile,
        };
        let mtime = system_time(inode.mtime());
        FileAttr {
            ino,
            size: inode.size(),
            blocks: inode.size().div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: inode.mode() as u16,
            nlink: if inode.is_directory() { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Appends a mutation to the offline log, reporting failures.
    fn log_offline(&self, target: &ItemId, op: ChangeOp) {
        let vfs = Arc::clone(&self.vfs);
        let target = target.clone();
        if let Err(e) = self.rt.block_on(async move { vfs.offline.log(&target, op).await }) {
            warn!(error = %e, "failed to append to offline log");
        }
    }

    /// Commits a metadata mutation remotely, or defers it when the
    /// connectivity oracle (or the error itself) says offline.
    ///
    /// Returns Ok(()) when the mutation is either committed or safely
    /// deferred; validation errors surface.
    fn commit_or_defer(
        &self,
        target: &ItemId,
        op: ChangeOp,
        attempt: impl FnOnce() -> Result<(), VfsError>,
    ) -> Result<(), c_int> {
        if !self.vfs.oracle.is_online() {
            self.log_offline(target, op);
            return Ok(());
        }
        match attempt() {
            Ok(()) => Ok(()),
            Err(e) if e.is_connectivity() => {
                self.log_offline(target, op);
                Ok(())
            }
            Err(e) => {
                warn!(target = %target, error = %e, "remote mutation rejected");
                Err(errno_for(&e))
            }
        }
    }
}

fn system_time(time: DateTime<Utc>) -> SystemTime {
    let secs = time.timestamp();
    let nanos = time.timestamp_subsec_nanos();
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH
    }
}

fn chrono_time(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

impl Filesystem for NimbusFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(items = self.vfs.graph.len(), "NimbusFS mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("NimbusFS unmounting");
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.vfs.activity.poke();
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = match self.id_of(parent) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };

        // Lazy listing: the first lookup in a directory pulls its
        // children from the remote.
        let vfs = Arc::clone(&self.vfs);
        let listing = {
            let parent_id = parent_id.clone();
            self.rt
                .block_on(async move { vfs.ensure_children_loaded(&parent_id).await })
        };
        if let Err(e) = listing {
            // A cold directory is unreachable offline; a loaded one
            // still serves its cached entries.
            if !matches!(e, VfsError::Offline(_)) {
                return reply.error(errno_for(&e));
            }
        }

        match self.vfs.graph.lookup_child(&parent_id, name) {
            Some(inode) => reply.entry(&TTL, &self.attr_for(&inode, _req), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.inode_of(ino) {
            Ok(inode) => reply.attr(&TTL, &self.attr_for(&inode, _req)),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, mode, size))]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.vfs.activity.poke();
        let id = match self.id_of(ino) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };

        // chmod is local-only metadata: no server round-trip, ever.
        if let Some(new_mode) = mode {
            let result = self.vfs.graph.update(&id, |i| {
                i.set_mode(new_mode);
                Ok(())
            });
            if let Err(e) = result {
                return reply.error(errno_for(&e));
            }
            if !self.vfs.oracle.is_online() {
                self.log_offline(&id, ChangeOp::Chmod { mode: new_mode });
            }
        }

        // truncate dirties the body like a write.
        if let Some(new_size) = size {
            if let Err(e) = self.vfs.cache.truncate(&id, new_size) {
                return reply.error(errno_for(&e));
            }
        }

        if let Some(new_mtime) = mtime {
            let when = match new_mtime {
                TimeOrNow::Now => Utc::now(),
                TimeOrNow::SpecificTime(t) => chrono_time(t),
            };
            let result = self.vfs.graph.update(&id, |i| {
                i.set_mtime(when);
                Ok(())
            });
            if let Err(e) = result {
                return reply.error(errno_for(&e));
            }
        }

        match self.inode_of(ino) {
            Ok(inode) => reply.attr(&TTL, &self.attr_for(&inode, _req)),
            Err(errno) => reply.error(errno),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, offset))]
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.vfs.activity.poke();
        let dir = match self.inode_of(ino) {
            Ok(inode) => inode,
            Err(errno) => return reply.error(errno),
        };
        if !dir.is_directory() {
            return reply.error(libc::ENOTDIR);
        }

        let vfs = Arc::clone(&self.vfs);
        let dir_id = dir.id().clone();
        if let Err(e) = self
            .rt
            .block_on(async move { vfs.ensure_children_loaded(&dir_id).await })
        {
            if !matches!(e, VfsError::Offline(_)) {
                return reply.error(errno_for(&e));
            }
        }

        let parent_ino = dir
            .parent()
            .map(|p| self.inodes.ino_for(p))
            .unwrap_or(ROOT_INO);

        let mut current: i64 = 0;

        if offset <= current {
            current += 1;
            if reply.add(ino, current, FileType::Directory, OsStr::new(".")) {
                return reply.ok();
            }
        } else {
            current += 1;
        }

        if offset <= current {
            current += 1;
            if reply.add(parent_ino, current, FileType::Directory, OsStr::new("..")) {
                return reply.ok();
            }
        } else {
            current += 1;
        }

        for child in self.vfs.graph.children_of(dir.id()) {
            if offset <= current {
                current += 1;
                let kind = if child.is_directory() {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                let child_ino = self.inodes.ino_for(child.id());
                if reply.add(child_ino, current, kind, OsStr::new(child.name())) {
                    return reply.ok();
                }
            } else {
                current += 1;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.inode_of(ino) {
            Ok(inode) if inode.is_directory() => {
                reply.opened(self.alloc_fh(), FOPEN_KEEP_CACHE)
            }
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, flags))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.vfs.activity.poke();
        let inode = match self.inode_of(ino) {
            Ok(inode) => inode,
            Err(errno) => return reply.error(errno),
        };
        if inode.is_directory() {
            return reply.error(libc::EISDIR);
        }
        let id = inode.id().clone();

        // Stale or torn bodies from prior runs are discarded here, so a
        // cached body that disagrees with the recorded remote hash is
        // refetched instead of served.
        if let Err(e) = self.vfs.cache.verify_or_evict(&id) {
            warn!(id = %id, error = %e, "body verification failed at open");
        }

        if flags & libc::O_TRUNC != 0 {
            if let Err(e) = self.vfs.cache.truncate(&id, 0) {
                return reply.error(errno_for(&e));
            }
        }

        // Ghost bodies start hydrating at open; the first block gates
        // the reply so an immediately following read has bytes.
        let state = self.vfs.graph.get(&id).map(|i| i.state().clone());
        if matches!(state, Some(ItemState::Ghost)) && self.vfs.oracle.is_online() {
            let vfs = Arc::clone(&self.vfs);
            let fetch_id = id.clone();
            let wait = self.rt.block_on(async move {
                let mut handle =
                    Arc::clone(&vfs.downloads).fetch(&fetch_id, DownloadPriority::Foreground)?;
                handle.wait_first_block().await
            });
            if let Err(e) = wait {
                return reply.error(errno_for(&e));
            }
        }

        let keep_cache = self
            .vfs
            .graph
            .get(&id)
            .map(|i| i.state().is_local())
            .unwrap_or(false);
        let open_flags = if keep_cache { FOPEN_KEEP_CACHE } else { 0 };
        reply.opened(self.alloc_fh(), open_flags);
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, offset, size))]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.vfs.activity.poke();
        let id = match self.id_of(ino) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };

        let vfs = Arc::clone(&self.vfs);
        let result = self.rt.block_on(async move {
            vfs.cache.read(&id, offset.max(0) as u64, size as usize).await
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                debug!(ino, error = %e, "read failed");
                reply.error(errno_for(&e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, data, reply), fields(ino, offset, size = data.len()))]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.vfs.activity.poke();
        let id = match self.id_of(ino) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };

        let vfs = Arc::clone(&self.vfs);
        let buf = data.to_vec();
        let result = self
            .rt
            .block_on(async move { vfs.cache.write(&id, offset.max(0) as u64, &buf).await });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                debug!(ino, error = %e, "write failed");
                reply.error(errno_for(&e));
            }
        }
    }

    /// Called on each close of the file descriptor: this is where a
    /// write burst becomes one upload. Editors writing in many small
    /// chunks therefore upload once per close, not once per write.
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.vfs.activity.poke();
        let inode = match self.inode_of(ino) {
            Ok(inode) => inode,
            Err(errno) => return reply.error(errno),
        };
        if !inode.has_changes() || inode.is_virtual() {
            return reply.ok();
        }
        let id = inode.id().clone();

        if !self.vfs.oracle.is_online() {
            // Deferred: the body stays dirty and pinned, the drain
            // uploads it on reconnect.
            self.log_offline(&id, ChangeOp::Write);
            return reply.ok();
        }

        self.vfs.uploads.enqueue(&id, UploadPriority::Flush);
        let vfs = Arc::clone(&self.vfs);
        let wait_id = id.clone();
        let outcome = self
            .rt
            .block_on(async move { vfs.uploads.wait_for(&wait_id).await });
        match outcome {
            Ok(_) => reply.ok(),
            Err(e) if e.is_connectivity() => {
                self.log_offline(&id, ChangeOp::Write);
                reply.ok()
            }
            Err(e) => {
                warn!(ino, error = %e, "flush upload failed");
                reply.error(errno_for(&e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Safety net: a dirty inode whose flush was skipped still gets
        // its upload, in the background lane.
        if let Ok(inode) = self.inode_of(ino) {
            if inode.has_changes() && !inode.is_virtual() && self.vfs.oracle.is_online() {
                self.vfs.uploads.enqueue(inode.id(), UploadPriority::Background);
            }
        }
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        let id = match self.id_of(ino) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };
        let id = self.vfs.graph.resolve(&id);
        match self.vfs.bodies.sync(&id) {
            Ok(()) => reply.ok(),
            Err(_) => reply.ok(), // nothing on disk yet is fine
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        self.vfs.activity.poke();
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = match self.id_of(parent) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };

        let local = ItemId::local();
        let mut inode = match Inode::new_file(local.clone(), parent_id.clone(), name, 0, Utc::now())
        {
            Ok(inode) => inode,
            Err(e) => return reply.error(errno_for(&VfsError::Domain(e))),
        };
        inode.set_mode(mode);
        // A created file is dirty from birth: it exists locally only
        // until its first flush commits it to the server.
        if let Err(e) = inode.mark_dirty(None, 0, Utc::now()) {
            return reply.error(errno_for(&VfsError::Domain(e)));
        }

        if let Err(e) = self.vfs.graph.insert(inode) {
            return reply.error(errno_for(&e));
        }
        if !self.vfs.oracle.is_online() {
            self.log_offline(
                &local,
                ChangeOp::Create {
                    parent: parent_id,
                    name: name.to_string(),
                },
            );
        }

        match self.vfs.graph.get(&local) {
            Some(created) => {
                let attr = self.attr_for(&created, _req);
                reply.created(&TTL, &attr, 0, self.alloc_fh(), 0);
            }
            None => reply.error(libc::EIO),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.vfs.activity.poke();
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = match self.id_of(parent) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };

        let local = ItemId::local();
        let mut inode = match Inode::new_directory(
            local.clone(),
            Some(parent_id.clone()),
            name,
            Utc::now(),
        ) {
            Ok(inode) => inode,
            Err(e) => return reply.error(errno_for(&VfsError::Domain(e))),
        };
        inode.set_mode(mode);
        inode.set_children_loaded(true);

        if let Err(e) = self.vfs.graph.insert(inode) {
            return reply.error(errno_for(&e));
        }

        // Commit the creation remotely, or defer it.
        let op = ChangeOp::Mkdir {
            parent: parent_id.clone(),
            name: name.to_string(),
        };
        let commit = {
            let vfs = Arc::clone(&self.vfs);
            let rt = self.rt.clone();
            let parent_for_remote = self.vfs.graph.resolve(&parent_id);
            let local = local.clone();
            let name = name.to_string();
            move || -> Result<(), VfsError> {
                if parent_for_remote.is_local() {
                    // Parent chain not on the server yet; the offline
                    // drain creates it in order.
                    return Err(VfsError::Offline("parent not committed".to_string()));
                }
                rt.block_on(async move {
                    match vfs.provider().create_folder(&parent_for_remote, &name).await {
                        Ok(remote) => {
                            vfs.oracle.record_success();
                            vfs.graph.adopt_server_id(&local, remote.id)?;
                            Ok(())
                        }
                        Err(e) => {
                            vfs.oracle.record_failure(e.kind());
                            Err(e.into())
                        }
                    }
                })
            }
        };
        if let Err(errno) = self.commit_or_defer(&local, op, commit) {
            // Roll the local directory back on hard rejection.
            let _ = self.vfs.graph.remove(&local);
            return reply.error(errno);
        }

        match self.vfs.graph.get(&local) {
            Some(created) => reply.entry(&TTL, &self.attr_for(&created, _req), 0),
            None => reply.error(libc::EIO),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.vfs.activity.poke();
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = match self.id_of(parent) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };
        let Some(target) = self.vfs.graph.lookup_child(&parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        if target.is_directory() {
            return reply.error(libc::EISDIR);
        }
        let target_id = target.id().clone();
        let was_local = target_id.is_local();

        if let Err(e) = self.vfs.graph.remove(&target_id) {
            return reply.error(errno_for(&e));
        }
        let _ = self.vfs.bodies.delete(&target_id);

        // Items the server never saw need no remote delete.
        if !was_local && !target.is_virtual() {
            let op = ChangeOp::Delete;
            let commit = {
                let vfs = Arc::clone(&self.vfs);
                let rt = self.rt.clone();
                let target_id = target_id.clone();
                move || -> Result<(), VfsError> {
                    rt.block_on(async move {
                        match vfs.provider().delete_item(&target_id).await {
                            Ok(()) => {
                                vfs.oracle.record_success();
                                Ok(())
                            }
                            Err(e) if e.kind()
                                == nimbus_core::ports::remote::RemoteErrorKind::NotFound =>
                            {
                                Ok(())
                            }
                            Err(e) => {
                                vfs.oracle.record_failure(e.kind());
                                Err(e.into())
                            }
                        }
                    })
                }
            };
            if let Err(errno) = self.commit_or_defer(&target_id, op, commit) {
                return reply.error(errno);
            }
        }
        reply.ok();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.vfs.activity.poke();
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = match self.id_of(parent) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };
        let Some(target) = self.vfs.graph.lookup_child(&parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        if !target.is_directory() {
            return reply.error(libc::ENOTDIR);
        }
        let target_id = target.id().clone();
        let was_local = target_id.is_local();

        // The graph enforces emptiness.
        if let Err(e) = self.vfs.graph.remove(&target_id) {
            return reply.error(errno_for(&e));
        }

        if !was_local {
            let op = ChangeOp::Delete;
            let commit = {
                let vfs = Arc::clone(&self.vfs);
                let rt = self.rt.clone();
                let target_id = target_id.clone();
                move || -> Result<(), VfsError> {
                    rt.block_on(async move {
                        match vfs.provider().delete_item(&target_id).await {
                            Ok(()) => {
                                vfs.oracle.record_success();
                                Ok(())
                            }
                            Err(e) if e.kind()
                                == nimbus_core::ports::remote::RemoteErrorKind::NotFound =>
                            {
                                Ok(())
                            }
                            Err(e) => {
                                vfs.oracle.record_failure(e.kind());
                                Err(e.into())
                            }
                        }
                    })
                }
            };
            if let Err(errno) = self.commit_or_defer(&target_id, op, commit) {
                return reply.error(errno);
            }
        }
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name, newparent, newname = ?newname))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        self.vfs.activity.poke();
        let (name, newname) = match (Self::component(name), Self::component(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        let (parent_id, newparent_id) = match (self.id_of(parent), self.id_of(newparent)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::ENOENT),
        };
        let Some(source) = self.vfs.graph.lookup_child(&parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        let source_id = source.id().clone();

        // Local replace; a displaced exact-name target is marked for
        // server-side delete.
        let displaced = match self.vfs.graph.rename(&source_id, &newparent_id, newname) {
            Ok(displaced) => displaced,
            Err(e) => return reply.error(errno_for(&e)),
        };
        if let Some(displaced) = displaced {
            let displaced_id = displaced.id().clone();
            let _ = self.vfs.bodies.delete(&displaced_id);
            if !displaced_id.is_local() {
                let op = ChangeOp::Delete;
                let commit = {
                    let vfs = Arc::clone(&self.vfs);
                    let rt = self.rt.clone();
                    let displaced_id = displaced_id.clone();
                    move || -> Result<(), VfsError> {
                        rt.block_on(async move {
                            vfs.provider()
                                .delete_item(&displaced_id)
                                .await
                                .map_err(VfsError::from)
                        })
                    }
                };
                let _ = self.commit_or_defer(&displaced_id, op, commit);
            }
        }

        // A local-id source has no server-side object to move yet; its
        // eventual upload lands under the new name.
        if source_id.is_local() {
            return reply.ok();
        }

        let op = ChangeOp::Rename {
            new_parent: newparent_id.clone(),
            new_name: newname.to_string(),
        };
        let commit = {
            let vfs = Arc::clone(&self.vfs);
            let rt = self.rt.clone();
            let source_id = source_id.clone();
            let newparent_remote = self.vfs.graph.resolve(&newparent_id);
            let newname = newname.to_string();
            let mtime = source.mtime();
            move || -> Result<(), VfsError> {
                if newparent_remote.is_local() {
                    return Err(VfsError::Offline(
                        "destination parent not committed".to_string(),
                    ));
                }
                rt.block_on(async move {
                    let patch = MetadataPatch {
                        name: Some(newname),
                        parent_id: Some(newparent_remote),
                        // The move must not bump the server-side mtime.
                        mtime: Some(mtime),
                    };
                    match vfs.provider().patch_metadata(&source_id, &patch).await {
                        Ok(_) => {
                            vfs.oracle.record_success();
                            Ok(())
                        }
                        Err(e) => {
                            vfs.oracle.record_failure(e.kind());
                            Err(e.into())
                        }
                    }
                })
            }
        };
        match self.commit_or_defer(&source_id, op.clone(), commit) {
            Ok(()) => reply.ok(),
            Err(errno) if errno == libc::EEXIST => {
                // Remote raced us; defer and let the drain disambiguate.
                self.log_offline(&source_id, op);
                reply.ok()
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let used = self.vfs.cache.disk_usage().unwrap_or(0);
        let total_blocks = PSEUDO_CAPACITY / BLOCK_SIZE as u64;
        let used_blocks = used / BLOCK_SIZE as u64;
        let free_blocks = total_blocks.saturating_sub(used_blocks);

        reply.statfs(
            total_blocks,
            free_blocks,
            free_blocks,
            self.vfs.graph.len() as u64,
            u64::MAX / 2,
            BLOCK_SIZE,
            NAME_MAX as u32,
            BLOCK_SIZE,
        );
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!(ino, nlookup, "forget");
    }

    #[tracing::instrument(level = "debug", skip(self, _req, value, reply), fields(ino, name = ?name))]
    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        if !name.starts_with("user.") {
            return reply.error(libc::EPERM);
        }
        if xattr::builtin_names().contains(&name) {
            // Engine-derived attributes are read-only.
            return reply.error(libc::EACCES);
        }
        let id = match self.id_of(ino) {
            Ok(id) => id,
            Err(errno) => return reply.error(errno),
        };
        let id = self.vfs.graph.resolve(&id);
        self.local_xattrs
            .insert((id.clone(), name.to_string()), value.to_vec());
        if !self.vfs.oracle.is_online() {
            self.log_offline(
                &id,
                ChangeOp::SetXattr {
                    name: name.to_string(),
                    value: value.to_vec(),
                },
            );
        }
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = match Self::component(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let inode = match self.inode_of(ino) {
            Ok(inode) => inode,
            Err(errno) => return reply.error(errno),
        };
        let Some(value) = xattr::get(&self.vfs, &self.local_xattrs, &inode, name) else {
            return reply.error(libc::ENODATA);
        };
        if size == 0 {
            reply.size(value.len() as u32);
        } else if (value.len() as u32) <= size {
            reply.data(&value);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let inode = match self.inode_of(ino) {
            Ok(inode) => inode,
            Err(errno) => return reply.error(errno),
        };
        let names = xattr::list(&self.local_xattrs, &inode);
        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32);
        } else if (buf.len() as u32) <= size {
            reply.data(&buf);
        } else {
            reply.error(libc::ERANGE);
        }
    }
}
