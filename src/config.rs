//! Mount-time and runtime configuration.
//!
//! Two layers are kept apart: `MountContext` is built from the `-o` mount
//! options and is immutable for the lifetime of the mount, while `Config`
//! comes from an optional `annexfs.toml` and tunes runtime behaviour
//! (attribute caching, periodic sync, store command).

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default notification template; `%s` is replaced by the message.
pub const DEFAULT_NOTIFY_CMD: &str = "notify-send \"annexfs\" \"%s\"";

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Ttl,
    Lru,
    None,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub cache_strategy: CacheStrategy,
    pub cache_ttl_seconds: u64,
    pub cache_lru_capacity: usize,
    /// Seconds between automatic sync runs; 0 disables the sync thread.
    pub sync_interval_seconds: u64,
    /// Branch merged from each remote during sync.
    pub default_branch: String,
    /// Program spawned for every object-store operation.
    pub store_program: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_strategy: CacheStrategy::Ttl,
            cache_ttl_seconds: 5,
            cache_lru_capacity: 1000,
            sync_interval_seconds: 0,
            default_branch: "master".to_string(),
            store_program: "git".to_string(),
        }
    }
}

/// Loads `annexfs.toml` from the current directory, falling back to the
/// defaults when the file is missing or malformed.
pub fn load_config() -> Config {
    let path = Path::new("annexfs.toml");
    if !path.exists() {
        return Config::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("could not read 'annexfs.toml': {}. Using defaults.", e);
            return Config::default();
        }
    };

    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("could not parse 'annexfs.toml': {}. Using defaults.", e);
            Config::default()
        }
    }
}

/// Everything fixed at mount time, parsed from the `-o` option list.
#[derive(Debug, Clone)]
pub struct MountContext {
    /// Absolute path of the backing working tree.
    pub backing: PathBuf,
    /// Absolute path of the mountpoint.
    pub mountpoint: PathBuf,
    /// Revisions to retain per file; <= 0 means retain all.
    pub num_versions: i64,
    /// After a successful merge, eagerly fetch object contents.
    pub get_all: bool,
    /// Notification command template containing `%s`.
    pub notify_cmd: String,
    /// Log file path.
    pub log_file: PathBuf,
    pub foreground: bool,
}

/// Parses the `-o` mount options into a `MountContext`.
///
/// Recognised options: `gitdir=<path>` (required), `numversions=<int>`,
/// `notifycmd=<template>` (must contain `%s`), `logfile=<path>`, `getall`,
/// `foreground`. Unknown options are rejected so that a typo does not
/// silently mount with defaults.
pub fn parse_mount_options(mountpoint: &Path, options: &[String]) -> Result<MountContext, String> {
    let mut gitdir: Option<PathBuf> = None;
    let mut num_versions: i64 = 0;
    let mut get_all = false;
    let mut notify_cmd = DEFAULT_NOTIFY_CMD.to_string();
    let mut log_file = PathBuf::from("annexfs.log");
    let mut foreground = false;

    for opt in options {
        match opt.split_once('=') {
            Some(("gitdir", value)) => gitdir = Some(PathBuf::from(value)),
            Some(("numversions", value)) => {
                num_versions = value
                    .parse()
                    .map_err(|_| format!("invalid numversions value '{}'", value))?;
            }
            Some(("notifycmd", value)) => notify_cmd = value.to_string(),
            Some(("logfile", value)) => log_file = PathBuf::from(value),
            Some((key, _)) => return Err(format!("unknown option '{}'", key)),
            None => match opt.as_str() {
                "getall" => get_all = true,
                "foreground" => foreground = true,
                other => return Err(format!("unknown option '{}'", other)),
            },
        }
    }

    let backing = gitdir.ok_or_else(|| "missing the gitdir option".to_string())?;
    if !notify_cmd.contains("%s") {
        return Err("notifycmd template must contain %s".to_string());
    }

    Ok(MountContext {
        backing,
        mountpoint: mountpoint.to_path_buf(),
        num_versions,
        get_all,
        notify_cmd,
        log_file,
        foreground,
    })
}
