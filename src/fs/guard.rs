//! Scoped unlock/commit operations.
//!
//! Three places need the same shape of work — substitute a writable copy
//! for an immutable object link before an operation, and fold the result
//! back into the store after it — differing only in two flags. They are
//! modelled as a single pair of helpers:
//!
//! - `with_copy_on_write` operates through the open-file table and backs
//!   `read`/`write`/`flush`/`fsync`/`release`.
//! - `with_unlock` is the table-free variant for attribute mutations
//!   (chmod/chown/truncate).
//!
//! The exit half always runs, whatever the wrapped operation returned:
//! a writable copy is never leaked, and a failed store command only
//! leaves the revision log behind the working tree (the next operation
//! re-adds the path).

use std::fs::OpenOptions;

use super::prelude::*;

/// Runs `op` on the file behind `fh`, substituting and/or committing a
/// writable copy around it.
///
/// With `unlock`, a writable copy is installed on entry unless one is
/// already present: annexed paths are unlocked in the store first, then
/// the path is reopened read-write and upgraded in the table. At most one
/// substitution happens per open.
///
/// With `commit`, the writable copy (if any) is closed and evicted on
/// exit, and the path is re-added and committed unless it is ignored or
/// the control file. The path's state is the one observed at exit.
///
/// `read`/`flush`/`fsync` pass `(false, false)`, `write` passes
/// `(true, false)` and `release` passes `(false, true)`, which is what
/// makes reads never unlock, writes unlock at most once, and commits
/// happen exactly once per modifying open.
pub fn with_copy_on_write<T>(
    fs: &mut AnnexFs,
    path: &str,
    fh: u64,
    unlock: bool,
    commit: bool,
    op: impl FnOnce(&File) -> Result<T, i32>,
) -> Result<T, i32> {
    if unlock && fs.open_files.contains(fh) && !fs.open_files.has_writable(fh) {
        let full = fs.full_path(path);
        if annexed(&full) {
            if let Err(e) = fs.runtime.block_on(fs.store.unlock(path)) {
                error!("unlock of '{}' failed: {:#}", path, e);
            }
        }
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&full)
        {
            Ok(file) => fs.open_files.upgrade(fh, file),
            Err(e) => return Err(errno(&e)),
        }
    }

    let result = match fs.open_files.file(fh) {
        Some(file) => op(file),
        None => Err(EBADF),
    };

    if commit && fs.open_files.has_writable(fh) {
        // Close the copy before re-adding it; the store relinks the path.
        fs.open_files.remove(fh);
        if path != CONTROL_PATH && !fs.is_ignored(path) {
            commit_path(fs, path);
        }
    }

    result
}

/// Runs `op` on the backing path, unlocking an annexed entry around it.
///
/// Used by attribute-level mutations, which need the path writable but
/// never substitute file handles. When the entry was annexed, the result
/// is re-added and committed on exit.
pub fn with_unlock<T>(
    fs: &mut AnnexFs,
    path: &str,
    op: impl FnOnce(&Path) -> Result<T, i32>,
) -> Result<T, i32> {
    let full = fs.full_path(path);
    let unlocked = annexed(&full);
    if unlocked {
        if let Err(e) = fs.runtime.block_on(fs.store.unlock(path)) {
            error!("unlock of '{}' failed: {:#}", path, e);
        }
    }

    let result = op(&full);

    if unlocked {
        commit_path(fs, path);
    }
    result
}

/// Ingest `path` and record a revision for it. Failures are logged and
/// swallowed: the revision log diverges from the working tree until the
/// next operation re-adds the path.
pub(crate) fn commit_path(fs: &mut AnnexFs, path: &str) {
    if let Err(e) = fs.runtime.block_on(fs.store.add(path)) {
        error!("add of '{}' failed: {:#}", path, e);
    }
    let message = format!("changed {}", path);
    if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
        error!("commit of '{}' failed: {:#}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::stub_fs;
    use crate::store::read_invocations;
    use std::io::Write as _;
    use std::os::unix::fs::symlink;

    // Stub store: `annex unlock` actually replaces the link with a
    // writable file, `ls-files` claims a.txt is tracked.
    const STUB: &str = r#"
if [ "$1" = "annex" ] && [ "$2" = "unlock" ]; then
  rm -f -- "$3"
  echo unlocked > "$3"
fi
if [ "$1" = "ls-files" ]; then
  echo "a.txt"
fi
exit 0
"#;

    fn open_read_only(fs: &mut AnnexFs, name: &str) -> u64 {
        let file = File::open(fs.full_path(name)).expect("Failed to open file");
        let fh = fs.next_fh;
        fs.next_fh += 1;
        fs.open_files.insert(
            fh,
            OpenFile {
                path: name.to_string(),
                mode: HandleMode::ReadOnlyView(file),
            },
        );
        fh
    }

    #[test]
    fn test_read_guard_spawns_nothing() {
        let (dir, mut fs) = stub_fs(STUB);
        std::fs::write(fs.full_path("a.txt"), "abc").expect("Failed to write");
        let fh = open_read_only(&mut fs, "a.txt");

        with_copy_on_write(&mut fs, "a.txt", fh, false, false, |_f| Ok(()))
            .expect("read guard failed");
        assert!(fs.open_files.contains(fh));
        assert!(!fs.open_files.has_writable(fh));
        assert_eq!(read_invocations(dir.path()), "");
    }

    #[test]
    fn test_write_guard_unlocks_annexed_path_once() {
        let (dir, mut fs) = stub_fs(STUB);
        let full = fs.full_path("a.txt");
        std::fs::create_dir_all(dir.path().join(".git/annex/objects")).expect("Failed to mkdir");
        std::fs::write(dir.path().join(".git/annex/objects/object"), "abc")
            .expect("Failed to write object");
        symlink(".git/annex/objects/object", &full).expect("Failed to symlink");

        let fh = open_read_only(&mut fs, "a.txt");
        with_copy_on_write(&mut fs, "a.txt", fh, true, false, |mut f| {
            f.write_all(b"xyz").map_err(|e| errno(&e))
        })
        .expect("write guard failed");
        assert!(fs.open_files.has_writable(fh));

        with_copy_on_write(&mut fs, "a.txt", fh, true, false, |_f| Ok(()))
            .expect("second write guard failed");

        let log = read_invocations(dir.path());
        assert_eq!(log.matches("annex unlock a.txt").count(), 1);
        assert!(!log.contains("commit"));
    }

    #[test]
    fn test_release_guard_commits_and_evicts() {
        let (dir, mut fs) = stub_fs(STUB);
        std::fs::write(fs.full_path("a.txt"), "abc").expect("Failed to write");
        let fh = open_read_only(&mut fs, "a.txt");
        let copy = File::create(fs.full_path("a.txt")).expect("Failed to open copy");
        fs.open_files.upgrade(fh, copy);

        with_copy_on_write(&mut fs, "a.txt", fh, false, true, |_f| Ok(()))
            .expect("release guard failed");
        assert!(!fs.open_files.contains(fh));

        let log = read_invocations(dir.path());
        assert!(log.contains("annex add a.txt"));
        assert!(log.contains("commit -m changed a.txt"));
    }

    #[test]
    fn test_release_guard_skips_ignored_paths() {
        // This stub's ls-files lists nothing, so every path is ignored.
        let (dir, mut fs) = stub_fs("exit 0");
        std::fs::write(fs.full_path("c.log"), "x").expect("Failed to write");
        let fh = open_read_only(&mut fs, "c.log");
        let copy = File::create(fs.full_path("c.log")).expect("Failed to open copy");
        fs.open_files.upgrade(fh, copy);

        with_copy_on_write(&mut fs, "c.log", fh, false, true, |_f| Ok(()))
            .expect("release guard failed");
        assert!(!fs.open_files.contains(fh));

        let log = read_invocations(dir.path());
        assert!(!log.contains("annex add"));
        assert!(!log.contains("commit"));
    }

    #[test]
    fn test_missing_handle_is_ebadf() {
        let (_dir, mut fs) = stub_fs(STUB);
        let err = with_copy_on_write(&mut fs, "a.txt", 99, false, false, |_f| Ok(()))
            .expect_err("guard should fail on an unknown handle");
        assert_eq!(err, EBADF);
    }

    #[test]
    fn test_unlock_guard_round_trips_annexed_path() {
        let (dir, mut fs) = stub_fs(STUB);
        let full = fs.full_path("a.txt");
        symlink(".git/annex/objects/xx/object", &full).expect("Failed to symlink");

        with_unlock(&mut fs, "a.txt", |_p| Ok(())).expect("unlock guard failed");

        let log = read_invocations(dir.path());
        assert!(log.contains("annex unlock a.txt"));
        assert!(log.contains("annex add a.txt"));
        assert!(log.contains("commit -m changed a.txt"));
    }

    #[test]
    fn test_unlock_guard_leaves_regular_files_alone() {
        let (dir, mut fs) = stub_fs(STUB);
        std::fs::write(fs.full_path("a.txt"), "abc").expect("Failed to write");

        with_unlock(&mut fs, "a.txt", |_p| Ok(())).expect("unlock guard failed");
        assert_eq!(read_invocations(dir.path()), "");
    }
}
