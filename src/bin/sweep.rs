#![forbid(unsafe_code)]

//! One-shot eviction pass, for cron or manual cleanup.

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use anyhow::Result;
use clap::Parser;
use redstream::{
    config::{ServiceConfig, load_service_config},
    index::SessionIndex,
    lifecycle::SessionManager,
    logging::init_logging,
    security::ensure_not_root,
};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(author, version, about = "Delete expired download sessions.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", help = "TOML config file (default /etc/redstream.toml if present)")]
    config: Option<PathBuf>,
    #[arg(long = "download-root", value_name = "DIR", help = "Directory holding session folders")]
    download_root: Option<PathBuf>,
    #[arg(long = "dry-run", help = "List expired sessions without deleting them")]
    dry_run: bool,
    #[arg(long = "allow-root", help = "Run even when started as root")]
    allow_root: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging("warn");
    ensure_not_root("sweep", args.allow_root)?;

    let mut config = load_service_config(args.config.as_deref())?;
    if let Some(root) = args.download_root {
        config.download_root = root;
    }
    config.validate()?;

    let sessions = build_manager(&config);
    let now = SystemTime::now();

    if args.dry_run {
        let expired = sessions.expired_sessions(now);
        for session in &expired {
            println!(
                "would remove {} (age {} min)",
                session.path.display(),
                session.age.as_secs() / 60
            );
        }
        println!("{} expired session(s)", expired.len());
        return Ok(());
    }

    let report = sessions.sweep(now);
    println!(
        "removed {} session(s), kept {}, failed {}, purged {} staged",
        report.removed.len(),
        report.retained,
        report.failed,
        report.purged_staging
    );
    Ok(())
}

/// The index only sharpens age computation; without it sessions still age
/// by directory mtime.
fn build_manager(config: &ServiceConfig) -> SessionManager {
    let manager = SessionManager::new(&config.download_root, config.file_expiry());
    let index_path = config.index_path();
    if !index_path.exists() {
        return manager;
    }
    match SessionIndex::open(&index_path) {
        Ok(index) => manager.with_index(Arc::new(index)),
        Err(err) => {
            warn!(path = %index_path.display(), error = %err, "ignoring unreadable session index");
            manager
        }
    }
}
