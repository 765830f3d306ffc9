//! This prelude module re-exports the common types and functions used
//! across the `fs` module's sub-files (e.g., `read.rs`, `write.rs`).
//!
//! This avoids repetitive imports in every file and provides a single
//! location to manage shared dependencies for the FUSE implementation.

// --- FUSE Types ---
pub use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};

// --- LibC Error Codes ---
pub use libc::{
    EACCES, // control-file misuse, unavailable annexed content
    EBADF,  // bad file descriptor
    EIO,    // I/O error
    ENOENT, // file or directory not found
};

// --- Standard Library Types ---
pub use std::ffi::OsStr;
pub use std::fs::File;
pub use std::os::unix::fs::MetadataExt;
pub use std::path::Path;
pub use std::time::{Duration, SystemTime, UNIX_EPOCH};

// --- Logging ---
pub use log::{debug, error, info, warn};

// --- Internal Project Modules ---
pub(crate) use crate::classify::{self, CONTROL_PATH, PathState, annexed};
pub use crate::fs::guard::{with_copy_on_write, with_unlock};
pub use crate::fs::table::{HandleMode, OpenFile};

// --- Internal `fs` Module Types ---
pub(crate) use super::{AnnexFs, CONTROL_INO, ROOT_INO, TTL, child_path};

/// Maps an I/O error onto the errno handed back to the kernel.
pub fn errno(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(EIO)
}
