//! Body store: one file per inode id.
//!
//! Bodies live under `content/<shard>/<digest>` where the digest is the
//! SHA-256 of the item id and the shard its first two hex characters.
//! Sharding keeps directory fan-out bounded on drives with hundreds of
//! thousands of items.
//!
//! Writes during streaming are fsync-free; [`BodyStore::sync`] is called
//! before a body is marked clean so a crash can only lose bytes that
//! were still dirty.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nimbus_core::domain::ids::ItemId;
use sha2::{Digest, Sha256};

use crate::StoreError;

/// Disk-backed body storage keyed by item id.
pub struct BodyStore {
    content_dir: PathBuf,
}

impl BodyStore {
    /// Opens (creating if needed) the body store under `cache_dir`.
    pub fn new(cache_dir: &Path) -> Result<Self, StoreError> {
        let content_dir = cache_dir.join("content");
        fs::create_dir_all(&content_dir)?;
        Ok(Self { content_dir })
    }

    /// The on-disk path for an id.
    pub fn path_for(&self, id: &ItemId) -> PathBuf {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let (shard, rest) = hex.split_at(2);
        self.content_dir.join(shard).join(rest)
    }

    /// Whether a body file is present (complete or partial).
    pub fn exists(&self, id: &ItemId) -> bool {
        self.path_for(id).exists()
    }

    /// Current body length, or `None` when absent.
    pub fn len(&self, id: &ItemId) -> Result<Option<u64>, StoreError> {
        match fs::metadata(self.path_for(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Last modification time of the body file, for TTL eviction.
    pub fn mtime(&self, id: &ItemId) -> Result<Option<SystemTime>, StoreError> {
        match fs::metadata(self.path_for(id)) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads up to `len` bytes at `offset`. Short reads at EOF return
    /// the available prefix; reads past EOF return empty.
    pub fn read_at(&self, id: &ItemId, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let mut file = File::open(self.path_for(id))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        loop {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Writes `data` at `offset`, creating or extending the file.
    pub fn write_at(&self, id: &ItemId, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Truncates (or extends with zeros) the body to `size`.
    pub fn truncate(&self, id: &ItemId, size: u64) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size)?;
        Ok(())
    }

    /// Opens the body read-only for hashing or serving.
    pub fn open_read(&self, id: &ItemId) -> Result<File, StoreError> {
        Ok(File::open(self.path_for(id))?)
    }

    /// Flushes a finished body to stable storage.
    ///
    /// Called before the inode is marked clean; streaming writes before
    /// this point are intentionally fsync-free.
    pub fn sync(&self, id: &ItemId) -> Result<(), StoreError> {
        let file = OpenOptions::new().write(true).open(self.path_for(id))?;
        file.sync_all()?;
        Ok(())
    }

    /// Removes a body. Missing files are fine.
    pub fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a body from a local id to its committed server id.
    pub fn rename_id(&self, old: &ItemId, new: &ItemId) -> Result<(), StoreError> {
        let from = self.path_for(old);
        if !from.exists() {
            return Ok(());
        }
        let to = self.path_for(new);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }

    /// Total bytes on disk across all bodies, for statfs.
    pub fn disk_usage(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        if !self.content_dir.exists() {
            return Ok(0);
        }
        for shard in fs::read_dir(&self.content_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}
