//! Pholio daemon: indexes the library and writes queued metadata edits.
//!
//! ## Usage
//!
//! ```bash
//! pholio-daemon              # Run in foreground until interrupted
//! pholio-daemon --once       # Work until the queue is empty, then exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use pholio::app::Library;
use pholio::config::Config;
use pholio::events::{LogNotifier, Notifier};
use pholio::exif::ExifTool;
use pholio::indexing::{FolderWatcher, NotifyFolderWatcher, NullFolderWatcher};
use pholio::logging;

const WATCH_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct DaemonArgs {
    /// Work until idle and exit
    once: bool,
    config_path: Option<PathBuf>,
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = DaemonArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                parsed.once = true;
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--version" | "-V" => {
                println!("pholio-daemon {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"pholio-daemon - background indexing and metadata writer for pholio

USAGE:
    pholio-daemon [OPTIONS]

OPTIONS:
    --once, -1          Process all pending work once and exit
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOLIO_CONFIG       Path to config file (overrides default location)
    PHOLIO_LOG          Log filter (trace, debug, info, warn, error)

The daemon keeps the library database in step with the photo tree,
extracts metadata, renders thumbnails and writes queued edits to the
image files with exiftool."#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    logging::init(None)?;
    info!("Pholio daemon starting...");

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(db = %config.db_path.display(), root = %config.library.root.display(), "Config loaded");

    ExifTool::new(config.exif.exiftool_path.clone()).check().await;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    if args.once {
        let library = Library::open(config, notifier, Arc::new(NullFolderWatcher))?;
        info!("Running in single-shot mode");
        let last = library.work().run_until_idle().await;
        info!(last = ?last, "Work queue drained");
        return Ok(());
    }

    let (watcher, changes) =
        NotifyFolderWatcher::new(WATCH_DEBOUNCE).context("Failed to start folder watcher")?;
    let watcher: Arc<dyn FolderWatcher> = Arc::new(watcher);
    let library = Library::open(config, notifier, watcher)?;
    let forwarder = library.forward_watch_events(changes);

    let work = Arc::clone(library.work());
    tokio::select! {
        _ = work.run() => {
            error!("Work service stopped unexpectedly");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    forwarder.abort();
    info!("Pholio daemon stopped");
    Ok(())
}
