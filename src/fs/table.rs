//! The open-file table: maps kernel file handles to their backing files.
//!
//! Entries are inserted on `create`/`open`, upgraded at most once when a
//! writable copy is substituted, and removed on `release`. The table is a
//! plain map because the whole filesystem state sits behind the mount
//! mutex; it does not synchronise on its own.

use std::collections::HashMap;
use std::fs::File;

/// The backing handle for an open file.
#[derive(Debug)]
pub enum HandleMode {
    /// The file as opened by the kernel's flags; for annexed paths this is
    /// a read-only view of the immutable object.
    ReadOnlyView(File),
    /// A writable copy substituted for the original view. `dirty` is set
    /// once a write has landed on it.
    WritableCopy { file: File, dirty: bool },
}

#[derive(Debug)]
pub struct OpenFile {
    /// Path relative to the backing root.
    pub path: String,
    pub mode: HandleMode,
}

#[derive(Debug, Default)]
pub struct OpenFileTable {
    handles: HashMap<u64, OpenFile>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    pub fn insert(&mut self, fh: u64, entry: OpenFile) {
        self.handles.insert(fh, entry);
    }

    pub fn path(&self, fh: u64) -> Option<&str> {
        self.handles.get(&fh).map(|e| e.path.as_str())
    }

    /// The currently active file for `fh`: the writable copy when one has
    /// been substituted, the original view otherwise.
    pub fn file(&self, fh: u64) -> Option<&File> {
        self.handles.get(&fh).map(|e| match &e.mode {
            HandleMode::ReadOnlyView(file) => file,
            HandleMode::WritableCopy { file, .. } => file,
        })
    }

    pub fn has_writable(&self, fh: u64) -> bool {
        matches!(
            self.handles.get(&fh).map(|e| &e.mode),
            Some(HandleMode::WritableCopy { .. })
        )
    }

    /// Substitutes a writable copy for the original view. The read-only
    /// view is closed here; the transition happens at most once per open,
    /// so an already-writable handle is left alone.
    pub fn upgrade(&mut self, fh: u64, file: File) {
        if let Some(entry) = self.handles.get_mut(&fh) {
            if let HandleMode::ReadOnlyView(_) = entry.mode {
                entry.mode = HandleMode::WritableCopy { file, dirty: false };
            }
        }
    }

    pub fn mark_dirty(&mut self, fh: u64) {
        if let Some(entry) = self.handles.get_mut(&fh) {
            if let HandleMode::WritableCopy { dirty, .. } = &mut entry.mode {
                *dirty = true;
            }
        }
    }

    pub fn remove(&mut self, fh: u64) -> Option<OpenFile> {
        self.handles.remove(&fh)
    }

    pub fn contains(&self, fh: u64) -> bool {
        self.handles.contains_key(&fh)
    }
}
