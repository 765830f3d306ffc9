use super::prelude::*;

/// Moves a backing entry and records what the move means for the
/// revision log:
///
/// - tracked -> tracked: a plain move in the tracked tree.
/// - tracked -> ignored: the entry leaves versioning (`remove` + commit).
/// - ignored -> tracked: the entry enters versioning (`add` + commit).
/// - ignored -> ignored: nothing to record.
///
/// Before the move the source is re-added so pending modifications are
/// captured in the object it travels as. Both ends are classified after
/// the backing rename: the source, even though deleted, is still listed
/// while its removal is unstaged.
fn move_entry(fs: &mut AnnexFs, old_rel: &str, new_rel: &str) -> Result<(), i32> {
    if !fs.is_ignored(old_rel) {
        // Lock the entry (and ingest it if it never was) so pending
        // modifications move with it.
        if let Err(e) = fs.runtime.block_on(fs.store.add(old_rel)) {
            error!("add of '{}' failed: {:#}", old_rel, e);
        }
    }

    std::fs::rename(fs.full_path(old_rel), fs.full_path(new_rel)).map_err(|e| errno(&e))?;

    let old_ignored = fs.is_ignored(old_rel);
    let new_ignored = fs.is_ignored(new_rel);
    if old_ignored || new_ignored {
        if !old_ignored {
            if let Err(e) = fs.runtime.block_on(fs.store.remove(old_rel)) {
                error!("removal of '{}' failed: {:#}", old_rel, e);
            }
            let message = format!("moved {} to ignored file", old_rel);
            if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
                error!("commit of '{}' failed: {:#}", old_rel, e);
            }
        }
        if !new_ignored {
            if let Err(e) = fs.runtime.block_on(fs.store.add(new_rel)) {
                error!("add of '{}' failed: {:#}", new_rel, e);
            }
            let message = format!("moved an ignored file to {}", new_rel);
            if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
                error!("commit of '{}' failed: {:#}", new_rel, e);
            }
        }
    } else {
        if let Err(e) = fs.runtime.block_on(fs.store.rename(old_rel, new_rel)) {
            error!("move of '{}' failed: {:#}", old_rel, e);
        }
        let message = format!("moved {} to {}", old_rel, new_rel);
        if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
            error!("commit of '{}' failed: {:#}", old_rel, e);
        }
    }
    Ok(())
}

/// Handles the FUSE `rename` operation.
///
/// Renaming the control file (in either direction) is refused; renaming a
/// path onto itself is a no-op and yields no commit. The real work is in
/// `move_entry`.
pub fn rename(fs: &mut AnnexFs, _req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, _flags: u32, reply: ReplyEmpty) {
    let old_parent_rel = match fs.path_of(parent) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let new_parent_rel = match fs.path_of(newparent) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let (old_name, new_name) = match (name.to_str(), newname.to_str()) {
        (Some(o), Some(n)) => (o, n),
        _ => {
            reply.error(ENOENT);
            return;
        }
    };
    if (parent == ROOT_INO && old_name == CONTROL_PATH)
        || (newparent == ROOT_INO && new_name == CONTROL_PATH)
    {
        reply.error(EACCES);
        return;
    }

    let old_rel = child_path(&old_parent_rel, old_name);
    let new_rel = child_path(&new_parent_rel, new_name);
    if old_rel == new_rel {
        reply.ok();
        return;
    }

    if let Err(err) = move_entry(fs, &old_rel, &new_rel) {
        reply.error(err);
        return;
    }

    fs.remap_path(&old_rel, &new_rel);
    fs.attribute_cache.remove(&parent);
    fs.attribute_cache.remove(&newparent);
    reply.ok();
}
