use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

use super::prelude::*;

/// Handles the FUSE `create` operation.
///
/// Opens-or-creates the backing file with the caller's mode and registers
/// the handle as a writable copy straight away: a freshly created file
/// has no immutable object to unlock, and `release` will ingest and
/// commit it (unless it lands on an ignored path).
pub fn create(fs: &mut AnnexFs, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, _flags: i32, reply: ReplyCreate) {
    let parent_rel = match fs.path_of(parent) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let name_str = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    if parent == ROOT_INO && name_str == CONTROL_PATH {
        reply.error(EACCES);
        return;
    }
    let rel = child_path(&parent_rel, name_str);

    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(mode)
        .open(fs.full_path(&rel))
    {
        Ok(f) => f,
        Err(e) => {
            reply.error(errno(&e));
            return;
        }
    };

    let fh = fs.next_fh;
    fs.next_fh += 1;
    fs.open_files.insert(
        fh,
        OpenFile {
            path: rel.clone(),
            mode: HandleMode::WritableCopy { file, dirty: false },
        },
    );

    let ino = fs.inode_for(&rel);
    fs.attribute_cache.remove(&parent);
    match super::attr::attr_for_path(fs, ino, &rel, req.uid(), req.gid()) {
        Some(attr) => reply.created(&TTL, &attr, 0, fh, 0),
        None => reply.error(ENOENT),
    }
}

/// Handles the FUSE `mkdir` operation. Plain passthrough: the revision
/// log only tracks files, so an empty directory produces no commit.
pub fn mkdir(fs: &mut AnnexFs, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
    let parent_rel = match fs.path_of(parent) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let name_str = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let rel = child_path(&parent_rel, name_str);

    if let Err(e) = DirBuilder::new().mode(mode).create(fs.full_path(&rel)) {
        reply.error(errno(&e));
        return;
    }

    let ino = fs.inode_for(&rel);
    fs.attribute_cache.remove(&parent);
    match super::attr::attr_for_path(fs, ino, &rel, req.uid(), req.gid()) {
        Some(attr) => reply.entry(&TTL, &attr, 0),
        None => reply.error(ENOENT),
    }
}

/// Handles the FUSE `symlink` operation.
///
/// The link is created in the backing tree and, unless the path is
/// ignored, ingested and committed so peers see it.
pub fn symlink(fs: &mut AnnexFs, req: &Request<'_>, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
    let parent_rel = match fs.path_of(parent) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let name_str = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let rel = child_path(&parent_rel, name_str);

    if let Err(e) = std::os::unix::fs::symlink(link, fs.full_path(&rel)) {
        reply.error(errno(&e));
        return;
    }

    if !fs.is_ignored(&rel) {
        if let Err(e) = fs.runtime.block_on(fs.store.add(&rel)) {
            error!("add of '{}' failed: {:#}", rel, e);
        }
        let message = format!("created symlink {} -> {}", rel, link.display());
        if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
            error!("commit of '{}' failed: {:#}", rel, e);
        }
    }

    let ino = fs.inode_for(&rel);
    fs.attribute_cache.remove(&parent);
    match super::attr::attr_for_path(fs, ino, &rel, req.uid(), req.gid()) {
        Some(attr) => reply.entry(&TTL, &attr, 0),
        None => reply.error(ENOENT),
    }
}
