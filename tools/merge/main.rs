//! Offline merge tool for captured spool pairs.
//!
//! Takes the file prefix a capture instance wrote
//! (`<prefix>.ordered` / `<prefix>.orphans`) and produces
//! `<prefix>.merged`, fully sorted by sequence number. Designed to be run
//! per prefix, xargs-friendly, after the capture process has exited.
//!
//! Exit status is zero on success, including a voluntary Ctrl+C stop, and
//! non-zero on any format or I/O error.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wavespool::logging::{self, OutputFormat};
use wavespool::merge::merge_spools;
use wavespool::wire;

#[derive(Parser)]
#[command(name = "wavespool-merge")]
#[command(
    about = "Merge a capture's ordered and orphan spools into one sequence-sorted file",
    long_about = None
)]
struct Cli {
    /// File prefix shared by the .ordered and .orphans spools
    prefix: PathBuf,

    /// Largest fragment width (in samples) the capture was configured for
    #[arg(long, default_value_t = wire::DEFAULT_MAX_FRAGMENT_SAMPLES)]
    max_samples: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::parse_level(&cli.log_level)?, OutputFormat::Compact)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping at the next record");
                cancel.cancel();
            }
        });
    }

    info!(prefix = %cli.prefix.display(), max_samples = cli.max_samples, "merging spools");

    // The merge itself is synchronous single-threaded work; keep it off
    // the runtime threads.
    let prefix = cli.prefix.clone();
    let max_samples = cli.max_samples;
    let merge_cancel = cancel.clone();
    let report =
        tokio::task::spawn_blocking(move || merge_spools(&prefix, max_samples, &merge_cancel))
            .await??;

    match &report.merged_path {
        Some(path) => {
            if report.trailing_orphans > 0 {
                warn!(
                    count = report.trailing_orphans,
                    "orphans past the last ordered record were appended at the end"
                );
            }
            info!(
                merged = %path.display(),
                ordered_records = report.ordered_records,
                orphans_merged = report.orphans_merged,
                trailing_orphans = report.trailing_orphans,
                bytes_written = report.bytes_written,
                cancelled = report.cancelled,
                "merge complete"
            );
        }
        None => {
            info!("orphan spool was empty; everything arrived in order, nothing to merge");
        }
    }

    Ok(())
}
