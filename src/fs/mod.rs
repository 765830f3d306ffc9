//! This module is the root of the FUSE filesystem implementation.
//!
//! It defines the main `AnnexFs` state struct, which holds the mount
//! context, the object-store driver, the inode/path maps, the open-file
//! table and the attribute cache, plus the Tokio runtime driving the
//! store subprocesses.
//!
//! The `impl Filesystem` block acts as the primary dispatcher, receiving
//! calls from the FUSE kernel and forwarding them to the appropriate
//! sub-modules (`attr`, `read`, `write`, etc.) for processing. The whole
//! state sits behind one mutex: every callback locks it on entry, which
//! is what serialises mutating operations against each other and against
//! the sync engine.

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::classify::{self, CONTROL_PATH};
use crate::config::{Config, MountContext};
use crate::fs::cache::AttributeCache;
use crate::fs::table::OpenFileTable;
use crate::store::StoreDriver;

pub mod cache;
pub mod guard;
pub mod prelude;
pub mod table;
mod attr;
mod create;
mod delete;
mod read;
mod rename;
mod write;

/// Time-To-Live for FUSE kernel attribute/entry caches. Kept short: the
/// sync engine can rewrite any path behind the kernel's back.
pub const TTL: Duration = Duration::from_secs(1);
/// Inode of the mount root.
pub const ROOT_INO: u64 = 1;
/// Inode reserved for the virtual control file.
pub const CONTROL_INO: u64 = 2;

/// The main state struct for the filesystem.
///
/// An instance is created at mount time and initialises the backing store
/// if needed. All fields are reached through the mount mutex.
pub struct AnnexFs {
    /// Options fixed at mount time (`-o` list).
    pub(crate) ctx: MountContext,
    /// Runtime tunables from `annexfs.toml`.
    pub(crate) config: Config,
    /// The subprocess façade over the object store.
    pub(crate) store: StoreDriver,
    /// The Tokio `Runtime` used to execute store commands (`block_on`).
    pub(crate) runtime: tokio::runtime::Runtime,
    /// Maps an inode number to its path relative to the backing root.
    pub(crate) inode_to_path: HashMap<u64, String>,
    /// Maps a relative path to its inode number.
    pub(crate) path_to_inode: HashMap<String, u64>,
    /// A simple counter to generate new, unique inode numbers.
    pub(crate) next_inode: u64,
    /// Open handles, keyed by file handle (`fh`).
    pub(crate) open_files: OpenFileTable,
    /// A simple counter to generate new, unique file handle numbers.
    pub(crate) next_fh: u64,
    /// The attribute cache (TTL or LRU) for `getattr` calls.
    pub(crate) attribute_cache: AttributeCache,
}

impl AnnexFs {
    /// Creates the filesystem state and initialises the backing store.
    ///
    /// Failure here is fatal: the mount is refused when the store cannot
    /// be brought up.
    pub fn new(ctx: MountContext, config: Config) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let store = StoreDriver::new(config.store_program.clone(), ctx.backing.clone());
        runtime.block_on(store.init(&host_name()))?;

        let mut fs = Self {
            ctx,
            config: config.clone(),
            store,
            runtime,
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: 3, // 1 is root, 2 is the control file
            open_files: OpenFileTable::new(),
            next_fh: 1,
            attribute_cache: AttributeCache::new(&config),
        };

        fs.inode_to_path.insert(ROOT_INO, "".to_string());
        fs.path_to_inode.insert("".to_string(), ROOT_INO);
        fs.inode_to_path.insert(CONTROL_INO, CONTROL_PATH.to_string());
        fs.path_to_inode.insert(CONTROL_PATH.to_string(), CONTROL_INO);
        Ok(fs)
    }

    /// Absolute path in the backing tree for a relative one.
    pub(crate) fn full_path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.ctx.backing.clone()
        } else {
            self.ctx.backing.join(rel)
        }
    }

    pub(crate) fn path_of(&self, ino: u64) -> Option<String> {
        self.inode_to_path.get(&ino).cloned()
    }

    /// Gets or assigns the inode for a path.
    pub(crate) fn inode_for(&mut self, rel: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(rel) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(rel.to_string(), ino);
        self.inode_to_path.insert(ino, rel.to_string());
        ino
    }

    /// Drops the maps and cached attributes for a path that went away.
    pub(crate) fn forget_path(&mut self, rel: &str) {
        if let Some(ino) = self.path_to_inode.remove(rel) {
            self.inode_to_path.remove(&ino);
            self.attribute_cache.remove(&ino);
        }
    }

    /// Moves an inode from one path to another after a rename.
    pub(crate) fn remap_path(&mut self, old_rel: &str, new_rel: &str) {
        self.forget_path(new_rel);
        if let Some(ino) = self.path_to_inode.remove(old_rel) {
            self.attribute_cache.remove(&ino);
            self.path_to_inode.insert(new_rel.to_string(), ino);
            self.inode_to_path.insert(ino, new_rel.to_string());
        }
    }

    pub(crate) fn is_ignored(&self, rel: &str) -> bool {
        classify::is_ignored(rel, &self.store, &self.runtime)
    }

    pub(crate) fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_seconds)
    }
}

/// Joins a parent path and an entry name into a relative path.
pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Identifier handed to the store when initialising a fresh backing tree.
fn host_name() -> String {
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "annexfs".to_string())
}

#[derive(Clone)]
pub struct FsWrapper(pub Arc<Mutex<AnnexFs>>);

/// Main FUSE trait implementation.
///
/// This block acts as a simple "dispatcher" or "router". All FUSE kernel
/// calls land here, take the mount lock, and are forwarded to the
/// appropriate function in one of the sub-modules (e.g., `attr::getattr`).
impl Filesystem for FsWrapper {
    // --- Attribute Operations (attr.rs) ---

    /// Delegates `getattr` to `attr::getattr`.
    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        let mut fs = self.0.lock().unwrap();
        attr::getattr(&mut fs, req, ino, reply);
    }

    /// Delegates `setattr` to `attr::setattr`.
    fn setattr(&mut self, req: &Request<'_>, ino: u64, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>, size: Option<u64>, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>, ctime: Option<SystemTime>, fh: Option<u64>, crtime: Option<SystemTime>, chgtime: Option<SystemTime>, bkuptime: Option<SystemTime>, flags: Option<u32>, reply: ReplyAttr) {
        let mut fs = self.0.lock().unwrap();
        attr::setattr(&mut fs, req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime, flags, reply);
    }

    // --- Read Operations (read.rs) ---

    /// Delegates `lookup` to `read::lookup`.
    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let mut fs = self.0.lock().unwrap();
        read::lookup(&mut fs, req, parent, name, reply);
    }

    /// Delegates `readdir` to `read::readdir`.
    fn readdir(&mut self, req: &Request, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        let mut fs = self.0.lock().unwrap();
        read::readdir(&mut fs, req, ino, fh, offset, reply);
    }

    /// Delegates `access` to `read::access`.
    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        read::access(&mut fs, req, ino, mask, reply);
    }

    /// Delegates `open` to `read::open`.
    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let mut fs = self.0.lock().unwrap();
        read::open(&mut fs, req, ino, flags, reply);
    }

    /// Delegates `read` to `read::read`.
    fn read(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, size: u32, flags: i32, lock_owner: Option<u64>, reply: ReplyData) {
        let mut fs = self.0.lock().unwrap();
        read::read(&mut fs, req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    /// Delegates `readlink` to `read::readlink`.
    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let mut fs = self.0.lock().unwrap();
        read::readlink(&mut fs, req, ino, reply);
    }

    /// Delegates `statfs` to `read::statfs`.
    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let mut fs = self.0.lock().unwrap();
        read::statfs(&mut fs, req, ino, reply);
    }

    // --- Write Operations (write.rs) ---

    /// Delegates `write` to `write::write`.
    fn write(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, data: &[u8], write_flags: u32, flags: i32, lock_owner: Option<u64>, reply: ReplyWrite) {
        let mut fs = self.0.lock().unwrap();
        write::write(&mut fs, req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    /// Delegates `flush` to `write::flush`.
    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        write::flush(&mut fs, req, ino, fh, lock_owner, reply);
    }

    /// Delegates `fsync` to `write::fsync`.
    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        write::fsync(&mut fs, req, ino, fh, datasync, reply);
    }

    /// Delegates `release` to `write::release`.
    fn release(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, lock_owner: Option<u64>, flush: bool, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        write::release(&mut fs, req, ino, fh, flags, lock_owner, flush, reply);
    }

    // --- Create Operations (create.rs) ---

    /// Delegates `create` to `create::create`.
    fn create(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, flags: i32, reply: ReplyCreate) {
        let mut fs = self.0.lock().unwrap();
        create::create(&mut fs, req, parent, name, mode, umask, flags, reply);
    }

    /// Delegates `mkdir` to `create::mkdir`.
    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let mut fs = self.0.lock().unwrap();
        create::mkdir(&mut fs, req, parent, name, mode, umask, reply);
    }

    /// Delegates `symlink` to `create::symlink`.
    fn symlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
        let mut fs = self.0.lock().unwrap();
        create::symlink(&mut fs, req, parent, name, link, reply);
    }

    // --- Delete Operations (delete.rs) ---

    /// Delegates `unlink` to `delete::unlink`.
    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        delete::unlink(&mut fs, req, parent, name, reply);
    }

    /// Delegates `rmdir` to `delete::rmdir`.
    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        delete::rmdir(&mut fs, req, parent, name, reply);
    }

    // --- Rename Operations (rename.rs) ---

    /// Delegates `rename` to `rename::rename`.
    fn rename(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        rename::rename(&mut fs, req, parent, name, newparent, newname, flags, reply);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::DEFAULT_NOTIFY_CMD;
    use crate::store::write_stub_store;
    use tempfile::TempDir;

    /// Builds an `AnnexFs` over a temp backing dir whose store program is
    /// a stub script (see `store::write_stub_store`). `.git`/`.git-annex`
    /// markers are pre-created so `init` spawns nothing.
    pub(crate) fn stub_fs(body: &str) -> (TempDir, AnnexFs) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir(dir.path().join(".git")).expect("Failed to create .git");
        std::fs::create_dir(dir.path().join(".git-annex")).expect("Failed to create .git-annex");
        let program = write_stub_store(dir.path(), body);

        let ctx = MountContext {
            backing: dir.path().to_path_buf(),
            mountpoint: PathBuf::from("/nonexistent-mountpoint"),
            num_versions: 0,
            get_all: false,
            notify_cmd: DEFAULT_NOTIFY_CMD.to_string(),
            log_file: dir.path().join("test.log"),
            foreground: true,
        };
        let config = Config {
            store_program: program.to_string_lossy().into_owned(),
            ..Config::default()
        };
        let fs = AnnexFs::new(ctx, config).expect("Failed to build filesystem state");
        (dir, fs)
    }
}
