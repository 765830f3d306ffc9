use std::ffi::CString;
use std::fs::{Metadata, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;

use super::prelude::*;

/// Handles the FUSE `lookup` operation.
///
/// Resolves a name within a parent directory to an inode. The control
/// file name resolves at the root even though it has no backing entry;
/// everything else must exist in the backing tree (as itself or as a
/// dangling annex link, which `lstat` still sees).
pub fn lookup(fs: &mut AnnexFs, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
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
        match super::attr::attr_for_path(fs, CONTROL_INO, CONTROL_PATH, req.uid(), req.gid()) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(ENOENT),
        }
        return;
    }

    let rel = child_path(&parent_rel, name_str);
    if fs.full_path(&rel).symlink_metadata().is_err() {
        reply.error(ENOENT);
        return;
    }

    let ino = fs.inode_for(&rel);
    match super::attr::attr_for_path(fs, ino, &rel, req.uid(), req.gid()) {
        Some(attr) => reply.entry(&TTL, &attr, 0),
        None => reply.error(ENOENT),
    }
}

/// Handles the FUSE `readdir` operation.
///
/// Lists the backing directory, plus the control file at the root only.
/// Annexed links are presented as regular files here too, so directory
/// listings agree with `getattr`.
pub fn readdir(fs: &mut AnnexFs, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
    let dir_rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let full = fs.full_path(&dir_rel);

    let mut entries: Vec<(u64, FileType, String)> = Vec::new();
    entries.push((ino, FileType::Directory, ".".to_string()));
    let parent_ino = if ino == ROOT_INO {
        ROOT_INO
    } else {
        let parent_rel = dir_rel.rsplit_once('/').map_or("", |(p, _)| p);
        *fs.path_to_inode.get(parent_rel).unwrap_or(&ROOT_INO)
    };
    entries.push((parent_ino, FileType::Directory, "..".to_string()));
    if ino == ROOT_INO {
        entries.push((CONTROL_INO, FileType::RegularFile, CONTROL_PATH.to_string()));
    }

    let dir = match std::fs::read_dir(&full) {
        Ok(dir) => dir,
        Err(e) => {
            reply.error(errno(&e));
            return;
        }
    };
    for entry in dir.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = child_path(&dir_rel, &name);
        let entry_ino = fs.inode_for(&rel);
        let kind = match entry.file_type() {
            Ok(ft) if ft.is_dir() => FileType::Directory,
            Ok(ft) if ft.is_symlink() => {
                if annexed(&fs.full_path(&rel)) {
                    FileType::RegularFile
                } else {
                    FileType::Symlink
                }
            }
            _ => FileType::RegularFile,
        };
        entries.push((entry_ino, kind, name));
    }

    for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
        if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
            // Buffer is full
            break;
        }
    }
    reply.ok();
}

/// Classic POSIX permission-bit check against the caller's identity.
fn check_access(md: &Metadata, uid: u32, gid: u32, mask: i32) -> bool {
    if mask == libc::F_OK {
        return true;
    }
    let mode = md.mode();
    let mut allowed = (mode & 0o7) as i32;
    if md.uid() == uid {
        allowed |= ((mode >> 6) & 0o7) as i32;
    }
    if md.gid() == gid {
        allowed |= ((mode >> 3) & 0o7) as i32;
    }
    if uid == 0 {
        allowed |= libc::R_OK | libc::W_OK;
        if mode & 0o111 != 0 {
            allowed |= libc::X_OK;
        }
    }
    mask & !allowed == 0
}

/// Handles the FUSE `access` operation.
///
/// The control file refuses read requests. An annexed entry is accessible
/// iff its object is materialised (the presented mode is faked, so the
/// host bits would mislead). Everything else gets the host's answer.
pub fn access(fs: &mut AnnexFs, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    if rel == CONTROL_PATH {
        if mask & libc::R_OK != 0 {
            reply.error(EACCES);
        } else {
            reply.ok();
        }
        return;
    }

    let full = fs.full_path(&rel);
    if annexed(&full) {
        if full.metadata().is_err() {
            reply.error(EACCES);
        } else {
            reply.ok();
        }
        return;
    }

    match full.metadata() {
        Ok(md) if check_access(&md, req.uid(), req.gid(), mask) => reply.ok(),
        Ok(_) => reply.error(EACCES),
        Err(e) => reply.error(errno(&e)),
    }
}

fn open_with_flags(full: &Path, flags: i32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    options.open(full)
}

/// Handles the FUSE `open` operation.
///
/// The control file opens onto `/dev/null` (its writes never reach a
/// backing file). A missing annexed object is requested from the store on
/// the fly and the open is refused only if it is still missing. A present
/// annexed object opens read-only whatever the caller asked for: writes
/// go through the copy-on-write substitution, never the immutable object.
/// Every handle is registered in the open-file table as the original
/// read-only view; the write path upgrades it at most once.
pub fn open(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    let full = fs.full_path(&rel);

    let file = match classify::classify(&rel, &fs.ctx.backing, &fs.store, &fs.runtime) {
        PathState::Control => {
            match OpenOptions::new().read(true).write(true).open("/dev/null") {
                Ok(f) => f,
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            }
        }
        PathState::Annexed { present } => {
            if !present {
                if let Err(e) = fs.runtime.block_on(fs.store.get(&rel)) {
                    warn!("content fetch for '{}' failed: {:#}", rel, e);
                }
                if full.metadata().is_err() {
                    reply.error(EACCES);
                    return;
                }
            }
            match File::open(&full) {
                Ok(f) => f,
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            }
        }
        PathState::Ignored | PathState::Tracked => match open_with_flags(&full, flags) {
            Ok(f) => f,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        },
    };

    let fh = fs.next_fh;
    fs.next_fh += 1;
    fs.open_files.insert(
        fh,
        OpenFile {
            path: rel,
            mode: HandleMode::ReadOnlyView(file),
        },
    );
    reply.opened(fh, 0);
}

/// Handles the FUSE `read` operation.
///
/// Reads through the copy-on-write guard with neither unlock nor commit,
/// so a handle that was upgraded by an earlier write reads its own
/// pending bytes while an untouched handle reads the immutable object.
pub fn read(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    if rel == CONTROL_PATH {
        reply.error(EACCES);
        return;
    }

    let result = with_copy_on_write(fs, &rel, fh, false, false, |file| {
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file
                .read_at(&mut buf[filled..], offset as u64 + filled as u64)
                .map_err(|e| errno(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    });
    match result {
        Ok(buf) => reply.data(&buf),
        Err(err) => reply.error(err),
    }
}

/// Handles the FUSE `readlink` operation. Plain passthrough; the kernel
/// only asks for entries that `getattr` reported as symlinks, which
/// excludes annexed links.
pub fn readlink(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, reply: ReplyData) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    match std::fs::read_link(fs.full_path(&rel)) {
        Ok(target) => reply.data(target.as_os_str().as_bytes()),
        Err(e) => reply.error(errno(&e)),
    }
}

/// Handles the FUSE `statfs` operation: passthrough to the backing
/// filesystem.
pub fn statfs(fs: &mut AnnexFs, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
    let rel = fs.path_of(ino).unwrap_or_default();
    let full = fs.full_path(&rel);
    let c_path = match CString::new(full.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => {
            reply.error(EIO);
            return;
        }
    };

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if res != 0 {
        reply.error(errno(&io::Error::last_os_error()));
        return;
    }
    reply.statfs(
        stat.f_blocks as u64,
        stat.f_bfree as u64,
        stat.f_bavail as u64,
        stat.f_files as u64,
        stat.f_ffree as u64,
        stat.f_bsize as u32,
        stat.f_namemax as u32,
        stat.f_frsize as u32,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_check_access_owner_bits() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, "x").expect("Failed to write");
        let md = path.metadata().expect("Failed to stat");
        let uid = md.uid();
        let gid = md.gid();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .expect("Failed to chmod");
        let md = path.metadata().expect("Failed to stat");
        assert!(check_access(&md, uid, gid, libc::R_OK | libc::W_OK));
        assert!(!check_access(&md, uid, gid, libc::X_OK));
        // A different (non-root) user only gets the "other" bits.
        if uid != 0 {
            assert!(!check_access(&md, uid + 1, gid + 1, libc::R_OK));
        }
        assert!(check_access(&md, uid + 1, gid + 1, libc::F_OK));
    }

    #[test]
    fn test_open_with_flags_truncates() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, "hello").expect("Failed to write");

        open_with_flags(&path, libc::O_WRONLY | libc::O_TRUNC).expect("Failed to open");
        let md = path.metadata().expect("Failed to stat");
        assert_eq!(md.len(), 0);
    }
}
