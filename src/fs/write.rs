use std::os::unix::fs::FileExt;

use super::prelude::*;
use crate::control::{self, ControlMessage};
use crate::sync;

/// Handles the FUSE `write` operation.
///
/// A write on the control file is parsed as newline-delimited commands
/// and dispatched; the kernel is always told the whole buffer was
/// consumed so it never retries. Every other write goes through the
/// copy-on-write guard with `unlock`, which substitutes a writable copy
/// for the immutable object on the first write of an open.
pub fn write(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    if rel == CONTROL_PATH {
        for message in control::parse_commands(data) {
            match message {
                ControlMessage::Sync => sync::run(fs, false),
                ControlMessage::Merge => sync::run(fs, true),
                ControlMessage::Get(pathspec) => {
                    if let Err(e) = fs.runtime.block_on(fs.store.get(&pathspec)) {
                        warn!("content fetch for '{}' failed: {:#}", pathspec, e);
                    }
                }
            }
        }
        reply.written(data.len() as u32);
        return;
    }

    let result = with_copy_on_write(fs, &rel, fh, true, false, |file| {
        file.write_all_at(data, offset as u64).map_err(|e| errno(&e))
    });
    match result {
        Ok(()) => {
            fs.open_files.mark_dirty(fh);
            fs.attribute_cache.remove(&ino);
            reply.written(data.len() as u32);
        }
        Err(err) => reply.error(err),
    }
}

/// Handles the FUSE `flush` operation: the active file is synced but the
/// commit is deferred to `release`.
pub fn flush(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let result = with_copy_on_write(fs, &rel, fh, false, false, |file| {
        file.sync_all().map_err(|e| errno(&e))
    });
    match result {
        Ok(()) => reply.ok(),
        Err(err) => reply.error(err),
    }
}

/// Handles the FUSE `fsync` operation. Same contract as `flush`.
pub fn fsync(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let result = with_copy_on_write(fs, &rel, fh, false, false, |file| {
        if datasync {
            file.sync_data().map_err(|e| errno(&e))
        } else {
            file.sync_all().map_err(|e| errno(&e))
        }
    });
    match result {
        Ok(()) => reply.ok(),
        Err(err) => reply.error(err),
    }
}

/// Handles the FUSE `release` operation.
///
/// Runs the copy-on-write guard with `commit`: a writable copy is closed,
/// re-added to the store and committed. The handle is evicted whatever
/// happened, so a failing store never leaks an entry.
pub fn release(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
    let rel = fs
        .open_files
        .path(fh)
        .map(str::to_string)
        .or_else(|| fs.path_of(ino));
    if let Some(rel) = rel {
        if let Err(err) = with_copy_on_write(fs, &rel, fh, false, true, |_file| Ok(())) {
            debug!("release of '{}' observed errno {}", rel, err);
        }
    }
    fs.open_files.remove(fh);
    fs.attribute_cache.remove(&ino);
    reply.ok();
}
