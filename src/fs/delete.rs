use super::prelude::*;

/// Handles the FUSE `unlink` operation.
///
/// The backing entry is removed first; for a tracked path the removal is
/// then recorded in the revision log. The order matters: the store's
/// `remove` stages a deletion that has already happened.
pub fn unlink(fs: &mut AnnexFs, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
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

    if let Err(e) = std::fs::remove_file(fs.full_path(&rel)) {
        reply.error(errno(&e));
        return;
    }

    if !fs.is_ignored(&rel) {
        if let Err(e) = fs.runtime.block_on(fs.store.remove(&rel)) {
            error!("removal of '{}' failed: {:#}", rel, e);
        }
        let message = format!("removed {}", rel);
        if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
            error!("commit of '{}' failed: {:#}", rel, e);
        }
    }

    fs.forget_path(&rel);
    fs.attribute_cache.remove(&parent);
    reply.ok();
}

/// Handles the FUSE `rmdir` operation. Plain passthrough; the backing
/// filesystem answers `ENOTEMPTY` for a directory with content.
pub fn rmdir(fs: &mut AnnexFs, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
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

    if let Err(e) = std::fs::remove_dir(fs.full_path(&rel)) {
        reply.error(errno(&e));
        return;
    }

    fs.forget_path(&rel);
    fs.attribute_cache.remove(&parent);
    reply.ok();
}
