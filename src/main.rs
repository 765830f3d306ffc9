//! annexfs mounts a content-addressed, versioned working tree as an
//! ordinary read/write directory.
//!
//! Underneath, every regular file is a symlink into the store's immutable
//! object directory; the filesystem hides the indirection, turning writes
//! into unlock/copy/commit cycles and pulling peer mirrors on demand.
//!
//! Two modes share the binary: `annexfs <mountpoint> -o gitdir=<path> …`
//! mounts, `annexfs -c <command> <mountpoint>` talks to a running mount
//! through its control file.

mod classify;
mod config;
mod control;
mod fs;
mod store;
mod sync;

use clap::Parser;
use daemonize::Daemonize;
use fuser::MountOption;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::MountContext;

#[derive(Parser, Debug)]
#[command(name = "annexfs")]
struct Cli {
    /// Where to mount (or, with -c, the running mount to command).
    mountpoint: PathBuf,
    /// Mount options: gitdir=<path> (required), numversions=<int>,
    /// notifycmd=<template>, logfile=<path>, getall, foreground.
    #[arg(short = 'o', value_name = "OPTION")]
    options: Vec<String>,
    /// Send a command (sync, merge, get <pathspec>) to a running mount
    /// instead of mounting.
    #[arg(short = 'c', value_name = "COMMAND")]
    command: Option<String>,
}

fn init_logging(ctx: &MountContext) -> anyhow::Result<()> {
    use log4rs::append::console::ConsoleAppender;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let pattern = "{d(%Y-%m-%d %H:%M:%S)} {l} {m}{n}";
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(&ctx.log_file)?;
    let mut builder = log4rs::config::Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)));
    let mut root = Root::builder().appender("logfile");
    if ctx.foreground {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }
    let log_config = builder.build(root.build(log::LevelFilter::Info))?;
    log4rs::init_config(log_config)?;
    Ok(())
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("annexfs: {}", message);
    std::process::exit(1);
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    // Command mode: deliver one line to a running mount and exit.
    if let Some(command) = cli.command.as_deref() {
        if let Err(e) = control::send_command(&cli.mountpoint, command) {
            fail(format!("{:#}", e));
        }
        return;
    }

    let ctx = match config::parse_mount_options(&cli.mountpoint, &cli.options) {
        Ok(ctx) => ctx,
        Err(e) => fail(e),
    };
    let backing = match ctx.backing.canonicalize() {
        Ok(p) => p,
        Err(e) => fail(format!("invalid gitdir '{}': {}", ctx.backing.display(), e)),
    };
    let mountpoint = match ctx.mountpoint.canonicalize() {
        Ok(p) => p,
        Err(e) => fail(format!(
            "invalid mountpoint '{}': {}",
            ctx.mountpoint.display(),
            e
        )),
    };
    // Detaching moves the working directory to `/`; pin the log file to
    // where the user invoked us.
    let log_file = if ctx.log_file.is_absolute() {
        ctx.log_file.clone()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(&ctx.log_file),
            Err(e) => fail(format!("cannot resolve the log file path: {}", e)),
        }
    };
    let ctx = MountContext {
        backing,
        mountpoint,
        log_file,
        ..ctx
    };

    // The runtime config is read before detaching, for the same reason.
    let runtime_config = config::load_config();

    if !ctx.foreground {
        if let Err(e) = Daemonize::new().start() {
            fail(format!("could not detach: {}", e));
        }
    }
    if let Err(e) = init_logging(&ctx) {
        fail(format!("could not set up logging: {:#}", e));
    }

    log::info!(
        "mounting '{}' over '{}'",
        ctx.backing.display(),
        ctx.mountpoint.display()
    );
    if ctx.num_versions > 0 {
        log::info!(
            "numversions={} recorded; the mount itself does not prune old versions",
            ctx.num_versions
        );
    }

    let annex_fs = match fs::AnnexFs::new(ctx.clone(), runtime_config.clone()) {
        Ok(fs) => fs,
        Err(e) => {
            log::error!("store initialisation failed: {:#}", e);
            fail(format!("store initialisation failed: {:#}", e));
        }
    };
    let wrapper = fs::FsWrapper(Arc::new(Mutex::new(annex_fs)));

    if runtime_config.sync_interval_seconds > 0 {
        let shared = wrapper.clone();
        let interval = Duration::from_secs(runtime_config.sync_interval_seconds);
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(interval);
                let mut fs = shared.0.lock().unwrap();
                sync::run(&mut fs, false);
            }
        });
    }

    let options = vec![
        MountOption::FSName("annexfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if let Err(e) = fuser::mount2(wrapper, &ctx.mountpoint, &options) {
        log::error!("mount failed: {}", e);
        fail(format!("mount failed: {}", e));
    }
}
