//! The sync engine: pull peer mirrors, merge what merges, and back out of
//! everything else.
//!
//! Merging is best-effort. A refused merge always reverts the working
//! tree to the pre-sync state (`reset_hard` + `clean`) so that no
//! half-merged tree is ever exposed through the mount; the need for human
//! resolution is surfaced through the notifier instead.

use std::process::Command;

use crate::fs::AnnexFs;

/// Runs one full sync pass. The caller holds the mount lock for the
/// whole run, exactly like any kernel callback.
pub fn run(fs: &mut AnnexFs, manual_merge: bool) {
    log::info!("sync started (manual_merge={})", manual_merge);

    if let Err(e) = fs.runtime.block_on(fs.store.fetch_all()) {
        log::warn!("fetch failed: {:#}", e);
    }

    let remotes = match fs.runtime.block_on(fs.store.list_remotes()) {
        Ok(remotes) => remotes,
        Err(e) => {
            log::error!("could not list remotes: {:#}", e);
            return;
        }
    };

    for remote in remotes {
        let reference = format!("{}/{}", remote, fs.config.default_branch);
        match fs.runtime.block_on(fs.store.merge(&reference)) {
            Ok(true) => {
                log::info!("merged with {}", remote);
                if fs.ctx.get_all {
                    if let Err(e) = fs.runtime.block_on(fs.store.get(".")) {
                        log::warn!("content fetch after merge failed: {:#}", e);
                    }
                }
                let message = format!("merged with {}", remote);
                if let Err(e) = fs.runtime.block_on(fs.store.commit(&message)) {
                    log::error!("commit after merge failed: {:#}", e);
                }
            }
            Ok(false) => {
                log::warn!("merge with {} refused, reverting", remote);
                if let Err(e) = fs.runtime.block_on(fs.store.reset_hard()) {
                    log::error!("reset failed: {:#}", e);
                }
                if let Err(e) = fs.runtime.block_on(fs.store.clean()) {
                    log::error!("clean failed: {:#}", e);
                }
                let message = if manual_merge {
                    "manual merge invoked".to_string()
                } else {
                    format!(
                        "manual merge required: changes from {} were not applied",
                        remote
                    )
                };
                notify(&fs.ctx.notify_cmd, &message);
            }
            Err(e) => log::error!("merge with {} failed: {:#}", remote, e),
        }
    }

    // Merges can rewrite any path behind the kernel's back.
    fs.attribute_cache.clear();
    log::info!("sync finished");
}

/// Substitutes `message` into the configured template and runs it through
/// the shell, waiting for completion.
pub fn notify(template: &str, message: &str) {
    let command = template.replace("%s", message);
    log::info!("notify: {}", command);
    match Command::new("sh").arg("-c").arg(&command).status() {
        Ok(status) if !status.success() => {
            log::warn!("notify command exited with {}", status);
        }
        Ok(_) => {}
        Err(e) => log::warn!("notify command failed to start: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::stub_fs;
    use crate::store::read_invocations;

    // Two remotes: `alice` merges cleanly, `bob` conflicts.
    const STUB: &str = r#"
if [ "$1" = "remote" ]; then
  echo alice
  echo bob
fi
if [ "$1" = "merge" ] && [ "$2" = "bob/master" ]; then
  exit 1
fi
exit 0
"#;

    fn notify_into(fs: &mut AnnexFs, dir: &std::path::Path) -> std::path::PathBuf {
        let sink = dir.join("notifications.log");
        fs.ctx.notify_cmd = format!("echo %s >> {}", sink.display());
        sink
    }

    #[test]
    fn test_clean_merge_is_committed() {
        let (dir, mut fs) = stub_fs(STUB);
        notify_into(&mut fs, dir.path());
        run(&mut fs, false);

        let log = read_invocations(dir.path());
        assert!(log.contains("fetch --all"));
        assert!(log.contains("merge alice/master"));
        assert!(log.contains("commit -m merged with alice"));
    }

    #[test]
    fn test_refused_merge_reverts_and_notifies() {
        let (dir, mut fs) = stub_fs(STUB);
        let sink = notify_into(&mut fs, dir.path());
        run(&mut fs, false);

        let log = read_invocations(dir.path());
        assert!(log.contains("merge bob/master"));
        assert!(log.contains("reset --hard"));
        assert!(log.contains("clean -f -d"));
        // No commit was recorded for the refused merge.
        assert!(!log.contains("commit -m merged with bob"));

        let notes = std::fs::read_to_string(&sink).expect("Failed to read notifications");
        assert!(notes.contains("manual merge required"));
        assert!(notes.contains("bob"));
    }

    #[test]
    fn test_manual_merge_notification_payload() {
        let (dir, mut fs) = stub_fs(STUB);
        let sink = notify_into(&mut fs, dir.path());
        run(&mut fs, true);

        let notes = std::fs::read_to_string(&sink).expect("Failed to read notifications");
        assert!(notes.contains("manual merge invoked"));
    }

    #[test]
    fn test_get_all_fetches_content_after_merge() {
        let (dir, mut fs) = stub_fs(STUB);
        notify_into(&mut fs, dir.path());
        fs.ctx.get_all = true;
        run(&mut fs, false);

        assert!(read_invocations(dir.path()).contains("annex get ."));
    }

    #[test]
    fn test_notify_runs_the_template() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sink = dir.path().join("out");
        notify(&format!("echo %s > {}", sink.display()), "hello there");
        let out = std::fs::read_to_string(&sink).expect("Failed to read notification");
        assert_eq!(out.trim(), "hello there");
    }
}
