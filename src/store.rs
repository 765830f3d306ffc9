//! This module defines the asynchronous driver for the external
//! content-addressed object store (`git` + `git annex`).
//!
//! All functions here spawn the configured store program and are intended
//! to be called from within the Tokio runtime (e.g., using
//! `runtime.block_on` in the synchronous FUSE implementation). Every
//! command runs with `current_dir` set to the backing root; the process
//! working directory is never changed.

use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

/// A generic `Result` type for store driver functions.
pub type StoreResult<T = ()> = anyhow::Result<T>;

/// Thin façade over the store's command surface.
///
/// Each method spawns a subprocess, waits for it, and succeeds iff the
/// process exits zero (with the documented tolerance for `commit`). The
/// program name is a constructor argument so tests can substitute a stub.
pub struct StoreDriver {
    program: String,
    backing: PathBuf,
}

impl StoreDriver {
    pub fn new(program: impl Into<String>, backing: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            backing: backing.into(),
        }
    }

    pub fn backing(&self) -> &Path {
        &self.backing
    }

    /// Spawns the store program with the given arguments and returns its
    /// output. Does not inspect the exit status; callers decide what a
    /// non-zero exit means for their operation.
    async fn run(&self, args: &[&str]) -> StoreResult<Output> {
        log::debug!("store: {} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(args)
            .current_dir(&self.backing)
            .output()
            .await
            .with_context(|| format!("failed to spawn '{} {}'", self.program, args.join(" ")))
    }

    /// Like `run`, but fails unless the command exited zero.
    async fn run_checked(&self, args: &[&str]) -> StoreResult<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            bail!(
                "'{} {}' exited with {}:\n{}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(output)
    }

    /// Initialises the backing store with a host identifier, unless it is
    /// already initialised.
    pub async fn init(&self, name: &str) -> StoreResult {
        if !self.backing.join(".git").exists() {
            self.run_checked(&["init"]).await?;
        }
        if !self.backing.join(".git-annex").exists() {
            self.run_checked(&["annex", "init", name]).await?;
        }
        Ok(())
    }

    /// Replaces the immutable object link at `path` with a writable copy.
    pub async fn unlock(&self, path: &str) -> StoreResult {
        self.run_checked(&["annex", "unlock", path]).await?;
        Ok(())
    }

    /// Ingests the file at `path` into the store, leaving a link in its stead.
    pub async fn add(&self, path: &str) -> StoreResult {
        self.run_checked(&["annex", "add", path]).await?;
        Ok(())
    }

    /// Records the staging area as a new revision.
    ///
    /// A commit with nothing staged is not an error: the revision log is
    /// simply unchanged.
    pub async fn commit(&self, message: &str) -> StoreResult {
        let output = self.run(&["commit", "-m", message]).await?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("nothing to commit") || stdout.contains("nothing added to commit") {
                return Ok(());
            }
            bail!(
                "'{} commit' exited with {}:\n{}{}",
                self.program,
                output.status,
                stdout,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Removes `path` from the tracked tree.
    pub async fn remove(&self, path: &str) -> StoreResult {
        self.run_checked(&["rm", path]).await?;
        Ok(())
    }

    /// Moves `old` to `new` in the tracked tree.
    pub async fn rename(&self, old: &str, new: &str) -> StoreResult {
        self.run_checked(&["mv", old, new]).await?;
        Ok(())
    }

    /// Pulls the revision logs of every configured remote.
    pub async fn fetch_all(&self) -> StoreResult {
        self.run_checked(&["fetch", "--all"]).await?;
        Ok(())
    }

    /// Lists the configured remotes.
    pub async fn list_remotes(&self) -> StoreResult<Vec<String>> {
        let output = self.run_checked(&["remote"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Attempts to merge `reference` into the local revision line.
    ///
    /// A refused merge is an expected outcome, not a driver failure, so it
    /// is reported as `Ok(false)`.
    pub async fn merge(&self, reference: &str) -> StoreResult<bool> {
        let output = self.run(&["merge", reference]).await?;
        Ok(output.status.success())
    }

    /// Discards every uncommitted change to tracked files.
    pub async fn reset_hard(&self) -> StoreResult {
        self.run_checked(&["reset", "--hard"]).await?;
        Ok(())
    }

    /// Removes untracked leftovers (e.g. conflict markers files).
    pub async fn clean(&self) -> StoreResult {
        self.run_checked(&["clean", "-f", "-d"]).await?;
        Ok(())
    }

    /// Ensures the object linked from `pathspec` is materialised locally.
    pub async fn get(&self, pathspec: &str) -> StoreResult {
        self.run_checked(&["annex", "get", pathspec]).await?;
        Ok(())
    }

    /// Lists the paths the store considers part of the tree for `pathspec`:
    /// cached, untracked, deleted and modified entries, with the standard
    /// ignore rules applied.
    pub async fn list_tracked(&self, pathspec: &str) -> StoreResult<Vec<String>> {
        let output = self
            .run_checked(&[
                "ls-files",
                "-c",
                "-o",
                "-d",
                "-m",
                "--full-name",
                "--exclude-standard",
                "--",
                pathspec,
            ])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Writes an executable `sh` stub into `dir` that appends its arguments to
/// `<dir>/invocations.log` and then runs the given script body. Used by
/// tests across modules to stand in for the real store program.
#[cfg(test)]
pub(crate) fn write_stub_store(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("invocations.log");
    let program = dir.join("stub-store");
    let script = format!("#!/bin/sh\necho \"$@\" >> \"{}\"\n{}\n", log.display(), body);
    std::fs::write(&program, script).expect("Failed to write stub store");
    let mut perm = std::fs::metadata(&program)
        .expect("Failed to stat stub store")
        .permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(&program, perm).expect("Failed to chmod stub store");
    program
}

#[cfg(test)]
pub(crate) fn read_invocations(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("invocations.log")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver_with_body(body: &str) -> (TempDir, StoreDriver) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let program = write_stub_store(dir.path(), body);
        let driver = StoreDriver::new(program.to_str().unwrap(), dir.path());
        (dir, driver)
    }

    #[tokio::test]
    async fn test_add_records_invocation() {
        let (dir, driver) = driver_with_body("exit 0");
        driver.add("a.txt").await.expect("Failed to add");
        assert!(read_invocations(dir.path()).contains("annex add a.txt"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let (_dir, driver) = driver_with_body("exit 3");
        let err = driver.add("a.txt").await.expect_err("add should fail");
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn test_commit_tolerates_nothing_staged() {
        let (_dir, driver) = driver_with_body("echo 'nothing to commit, working tree clean'\nexit 1");
        driver
            .commit("changed a.txt")
            .await
            .expect("empty commit should be treated as success");
    }

    #[tokio::test]
    async fn test_refused_merge_is_ok_false() {
        let (_dir, driver) = driver_with_body("case \"$1\" in merge) exit 1;; esac\nexit 0");
        let merged = driver.merge("peer/master").await.expect("Failed to merge");
        assert!(!merged);
        let merged = driver.fetch_all().await;
        assert!(merged.is_ok());
    }

    #[tokio::test]
    async fn test_list_remotes_splits_lines() {
        let (_dir, driver) = driver_with_body("echo alice\necho bob\nexit 0");
        let remotes = driver.list_remotes().await.expect("Failed to list remotes");
        assert_eq!(remotes, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_list_tracked_filters_empty_lines() {
        let (_dir, driver) = driver_with_body("echo a.txt\necho\necho dir/b.txt\nexit 0");
        let tracked = driver.list_tracked("a.txt").await.expect("Failed to list");
        assert_eq!(tracked, vec!["a.txt".to_string(), "dir/b.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_commands_run_in_backing_dir() {
        let (dir, driver) = driver_with_body("pwd >> invocations.log\nexit 0");
        driver.reset_hard().await.expect("Failed to reset");
        let canonical = dir.path().canonicalize().expect("Failed to canonicalize");
        assert!(read_invocations(dir.path()).contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_init_skips_existing_repository() {
        let (dir, driver) = driver_with_body("exit 0");
        std::fs::create_dir(dir.path().join(".git")).expect("Failed to create .git");
        std::fs::create_dir(dir.path().join(".git-annex")).expect("Failed to create .git-annex");
        driver.init("testhost").await.expect("Failed to init");
        assert!(!dir.path().join("invocations.log").exists());
    }
}
