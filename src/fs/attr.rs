use std::fs::{FileTimes, Metadata, OpenOptions, Permissions};
use std::os::unix::fs::PermissionsExt;

use super::prelude::*;

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs.max(0) as u64, nsecs.max(0) as u32)
}

/// Write bits OR-ed into the presented mode of an annexed file. The rest
/// of the real mode is preserved, so executables keep their x bits.
fn writable_mode(perm: u16) -> u16 {
    perm | 0o222
}

/// Builds a kernel attribute struct straight from backing metadata.
fn file_attr(ino: u64, md: &Metadata) -> FileAttr {
    let kind = if md.is_dir() {
        FileType::Directory
    } else if md.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: md.size(),
        blocks: md.blocks(),
        atime: timestamp(md.atime(), md.atime_nsec()),
        mtime: timestamp(md.mtime(), md.mtime_nsec()),
        ctime: timestamp(md.ctime(), md.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind,
        perm: (md.mode() & 0o7777) as u16,
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        flags: 0,
        blksize: md.blksize() as u32,
    }
}

/// Synthetic attributes of the control file: a write-only regular file of
/// size zero whose timestamps are always "now".
fn control_attr(uid: u32, gid: u32) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino: CONTROL_INO,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::RegularFile,
        perm: 0o200,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

/// Fetches attributes for a path, using the cache if available.
///
/// Annexed entries are presented as regular files: when the object is
/// materialised the link target's metadata is used with write bits OR-ed
/// into the mode; when it is missing, the link's own metadata is used
/// with the size forced to zero. Everything else is an `lstat`
/// passthrough. The control file never touches the cache because its
/// timestamps are synthetic.
pub fn attr_for_path(fs: &mut AnnexFs, ino: u64, rel: &str, uid: u32, gid: u32) -> Option<FileAttr> {
    if rel == CONTROL_PATH {
        return Some(control_attr(uid, gid));
    }

    if let Some(attr) = fs.attribute_cache.get(&ino) {
        return Some(attr);
    }

    let full = fs.full_path(rel);
    let attr = if annexed(&full) {
        match full.metadata() {
            Ok(md) => {
                // Present: stat the target, present it as writable.
                let mut attr = file_attr(ino, &md);
                attr.kind = FileType::RegularFile;
                attr.perm = writable_mode(attr.perm);
                attr
            }
            Err(_) => {
                // Missing content: the link itself, sized zero.
                let md = full.symlink_metadata().ok()?;
                let mut attr = file_attr(ino, &md);
                attr.kind = FileType::RegularFile;
                attr.size = 0;
                attr.blocks = 0;
                attr.perm = writable_mode(0o644);
                attr
            }
        }
    } else {
        file_attr(ino, &full.symlink_metadata().ok()?)
    };

    let ttl = fs.attr_ttl();
    fs.attribute_cache.put(ino, attr, ttl);
    Some(attr)
}

/// FUSE `getattr` implementation.
pub fn getattr(fs: &mut AnnexFs, req: &Request, ino: u64, reply: ReplyAttr) {
    let rel = match fs.path_of(ino) {
        Some(p) => p,
        None => {
            reply.error(ENOENT);
            return;
        }
    };
    match attr_for_path(fs, ino, &rel, req.uid(), req.gid()) {
        Some(attr) => reply.attr(&TTL, &attr),
        None => reply.error(ENOENT),
    }
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// FUSE `setattr` implementation.
///
/// Attribute mutations on the control file are refused. Everything else
/// runs inside the unlock guard: an annexed entry is unlocked first and
/// re-added (with a commit) afterwards.
///
/// Handled requests: chmod (`mode`), chown (`uid`/`gid`), truncate
/// (`size`) and utimens (`atime`/`mtime`).
pub fn setattr(fs: &mut AnnexFs, req: &Request<'_>, ino: u64, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>, size: Option<u64>, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>, _ctime: Option<SystemTime>, _fh: Option<u64>, _crtime: Option<SystemTime>, _chgtime: Option<SystemTime>, _bkuptime: Option<SystemTime>, _flags: Option<u32>, reply: ReplyAttr) {
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

    let result = with_unlock(fs, &rel, |full| {
        if let Some(new_mode) = mode {
            std::fs::set_permissions(full, Permissions::from_mode(new_mode))
                .map_err(|e| errno(&e))?;
        }
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::chown(full, uid, gid).map_err(|e| errno(&e))?;
        }
        if let Some(new_size) = size {
            let file = OpenOptions::new()
                .write(true)
                .open(full)
                .map_err(|e| errno(&e))?;
            file.set_len(new_size).map_err(|e| errno(&e))?;
        }
        if atime.is_some() || mtime.is_some() {
            let file = OpenOptions::new()
                .write(true)
                .open(full)
                .map_err(|e| errno(&e))?;
            let mut times = FileTimes::new();
            if let Some(t) = atime {
                times = times.set_accessed(system_time(t));
            }
            if let Some(t) = mtime {
                times = times.set_modified(system_time(t));
            }
            file.set_times(times).map_err(|e| errno(&e))?;
        }
        Ok(())
    });

    if let Err(err) = result {
        reply.error(err);
        return;
    }

    fs.attribute_cache.remove(&ino);
    match attr_for_path(fs, ino, &rel, req.uid(), req.gid()) {
        Some(attr) => reply.attr(&TTL, &attr),
        None => reply.error(ENOENT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::stub_fs;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_writable_mode_preserves_exec_bits() {
        assert_eq!(writable_mode(0o444), 0o666);
        assert_eq!(writable_mode(0o555), 0o777);
        assert_eq!(writable_mode(0o644), 0o666);
    }

    #[test]
    fn test_control_attr_is_write_only() {
        let attr = control_attr(1000, 1000);
        assert_eq!(attr.perm, 0o200);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn test_present_annexed_entry_reads_as_regular_file() {
        let (dir, mut fs) = stub_fs("exit 0");
        std::fs::create_dir_all(dir.path().join(".git/annex/objects")).expect("Failed to mkdir");
        std::fs::write(dir.path().join(".git/annex/objects/obj"), "abcde")
            .expect("Failed to write object");
        symlink(".git/annex/objects/obj", fs.full_path("big.bin")).expect("Failed to symlink");

        let ino = fs.inode_for("big.bin");
        let attr =
            attr_for_path(&mut fs, ino, "big.bin", 0, 0).expect("Failed to derive attributes");
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.perm & 0o222, 0o222);
    }

    #[test]
    fn test_missing_annexed_entry_is_empty_regular_file() {
        let (_dir, mut fs) = stub_fs("exit 0");
        symlink(".git/annex/objects/xx/gone", fs.full_path("gone.bin"))
            .expect("Failed to symlink");

        let ino = fs.inode_for("gone.bin");
        let attr =
            attr_for_path(&mut fs, ino, "gone.bin", 0, 0).expect("Failed to derive attributes");
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.perm & 0o222, 0o222);
    }

    #[test]
    fn test_plain_symlink_keeps_its_kind() {
        let (_dir, mut fs) = stub_fs("exit 0");
        std::fs::write(fs.full_path("target.txt"), "x").expect("Failed to write");
        symlink("target.txt", fs.full_path("alias")).expect("Failed to symlink");

        let ino = fs.inode_for("alias");
        let attr = attr_for_path(&mut fs, ino, "alias", 0, 0).expect("Failed to derive attributes");
        assert_eq!(attr.kind, FileType::Symlink);
    }
}
