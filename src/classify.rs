//! Path classification.
//!
//! Every kernel callback starts by deciding what kind of path it is
//! looking at: the virtual control file, an ignored path, an annexed
//! object link, or an ordinary tracked entry. The classification is
//! derived on every call and never persisted; it must tolerate paths
//! that do not exist (rename looks at both ends of the move).

use std::path::Path;
use tokio::runtime::Runtime;

use crate::store::StoreDriver;

/// The single virtual file at the mount root accepting commands.
pub const CONTROL_PATH: &str = ".command";

/// Marker embedded in the target of every object-store symlink.
pub const ANNEX_OBJECTS_MARKER: &str = ".git/annex/objects";

/// What a path is, as seen by the filesystem core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathState {
    /// The virtual control file; no backing entry.
    Control,
    /// Exists in the backing tree but does not participate in commits.
    Ignored,
    /// A symlink into the object store, presented as a regular file.
    /// `present` is false when the linked object is not materialised.
    Annexed { present: bool },
    /// An ordinary tracked file or directory.
    Tracked,
}

/// Returns true if the entry at `full` is a symlink into the object store.
pub fn annexed(full: &Path) -> bool {
    match std::fs::read_link(full) {
        Ok(target) => target.to_string_lossy().contains(ANNEX_OBJECTS_MARKER),
        Err(_) => false,
    }
}

/// Store-metadata paths and the reserved attributes file never take part
/// in versioning, whatever the ignore rules say.
fn reserved(rel: &str) -> bool {
    rel == ".git"
        || rel == ".git-annex"
        || rel == ".gitattributes"
        || rel.starts_with(".git/")
        || rel.starts_with(".git-annex/")
}

/// Returns true if `rel` should be left out of commits.
///
/// A path is ignored when it lives under the store's metadata directories,
/// is the reserved attributes file, or is absent from the driver's tracked
/// listing (which applies the standard ignore rules).
pub fn is_ignored(rel: &str, store: &StoreDriver, runtime: &Runtime) -> bool {
    if rel.is_empty() {
        return false;
    }
    if reserved(rel) {
        return true;
    }
    match runtime.block_on(store.list_tracked(rel)) {
        Ok(considered) => !considered.iter().any(|p| p == rel),
        Err(e) => {
            log::warn!("tracked listing for '{}' failed: {:#}", rel, e);
            // Without a listing the safe answer is "not versioned".
            true
        }
    }
}

/// Full classification of `rel` (relative to the backing root).
pub fn classify(rel: &str, backing: &Path, store: &StoreDriver, runtime: &Runtime) -> PathState {
    if rel == CONTROL_PATH {
        return PathState::Control;
    }
    if is_ignored(rel, store, runtime) {
        return PathState::Ignored;
    }
    let full = backing.join(rel);
    if annexed(&full) {
        return PathState::Annexed {
            present: full.metadata().is_ok(),
        };
    }
    PathState::Tracked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_stub_store;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to build runtime")
    }

    fn stub_driver(dir: &TempDir, body: &str) -> StoreDriver {
        let program = write_stub_store(dir.path(), body);
        StoreDriver::new(program.to_str().unwrap(), dir.path())
    }

    #[test]
    fn test_annexed_link_is_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let link = dir.path().join("big.iso");
        symlink(".git/annex/objects/xx/yy/SHA256-abc", &link).expect("Failed to symlink");
        assert!(annexed(&link));
    }

    #[test]
    fn test_plain_symlink_is_not_annexed() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let link = dir.path().join("latest");
        symlink("notes.txt", &link).expect("Failed to symlink");
        assert!(!annexed(&link));
        assert!(!annexed(&dir.path().join("missing")));
    }

    #[test]
    fn test_store_metadata_is_ignored() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let driver = stub_driver(&dir, "exit 0");
        let rt = runtime();
        assert!(is_ignored(".git/config", &driver, &rt));
        assert!(is_ignored(".git-annex/uuid.log", &driver, &rt));
        assert!(is_ignored(".gitattributes", &driver, &rt));
    }

    #[test]
    fn test_listed_path_is_considered() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let driver = stub_driver(&dir, "echo notes.txt\nexit 0");
        let rt = runtime();
        assert!(!is_ignored("notes.txt", &driver, &rt));
        // The stub always answers notes.txt, so anything else is ignored.
        assert!(is_ignored("build.log", &driver, &rt));
    }

    #[test]
    fn test_classify_control_and_annexed() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let driver = stub_driver(&dir, "echo big.iso\nexit 0");
        let rt = runtime();
        assert_eq!(
            classify(CONTROL_PATH, dir.path(), &driver, &rt),
            PathState::Control
        );

        let link = dir.path().join("big.iso");
        symlink(".git/annex/objects/xx/yy/SHA256-abc", &link).expect("Failed to symlink");
        assert_eq!(
            classify("big.iso", dir.path(), &driver, &rt),
            PathState::Annexed { present: false }
        );
    }

    #[test]
    fn test_classify_tolerates_missing_path() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let driver = stub_driver(&dir, "echo gone.txt\nexit 0");
        let rt = runtime();
        // Deleted-but-tracked paths still classify as tracked.
        assert_eq!(
            classify("gone.txt", dir.path(), &driver, &rt),
            PathState::Tracked
        );
    }
}
