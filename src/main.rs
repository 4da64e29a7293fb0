//! CLI entry point for the wavespool capture daemon.
//!
//! Spawns one independent listener instance per configured port, each with
//! its own spool file pair and watermark, plus a throughput reporter.
//! Ctrl+C requests a cooperative stop; every instance finishes its current
//! batch and flushes before the process exits.
//!
//! # Usage
//!
//! Capture with the stock configuration file:
//! ```bash
//! wavespool
//! ```
//!
//! Four listeners from port 2000, stopping after 10000 events each:
//! ```bash
//! wavespool --instances 4 --port 2000 --events 10000
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wavespool::classify::ProcessorKind;
use wavespool::config::Config;
use wavespool::listener::Listener;
use wavespool::{logging, stats};

#[derive(Parser)]
#[command(name = "wavespool")]
#[command(about = "UDP capture for waveform digitizer fragment streams", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "wavespool.toml")]
    config: PathBuf,

    /// Override the bind address
    #[arg(long)]
    addr: Option<String>,

    /// Override the base UDP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the number of listener instances
    #[arg(short = 't', long)]
    instances: Option<u16>,

    /// Override the output file prefix
    #[arg(short = 'f', long)]
    prefix: Option<String>,

    /// Stop each instance after this many events
    #[arg(short = 'n', long)]
    events: Option<u64>,

    /// Override the batch processor
    #[arg(short = 'd', long, value_enum)]
    processor: Option<ProcessorKind>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = &self.addr {
            config.listener.bind_addr = addr.clone();
        }
        if let Some(port) = self.port {
            config.listener.base_port = port;
        }
        if let Some(instances) = self.instances {
            config.listener.instances = instances;
        }
        if let Some(prefix) = &self.prefix {
            config.capture.file_prefix = Some(prefix.clone());
        }
        if let Some(events) = self.events {
            config.capture.event_limit = Some(events);
        }
        if let Some(processor) = self.processor {
            config.capture.processor = processor;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;
    logging::init_from_config(&config.application)?;

    let prefix = config.capture.resolved_prefix();
    info!(
        name = %config.application.name,
        instances = config.listener.instances,
        base_port = config.listener.base_port,
        prefix = %prefix,
        processor = ?config.capture.processor,
        "starting capture"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let mut handles = Vec::new();
    let mut all_counters = Vec::new();
    for instance in 0..config.listener.instances {
        let listener = Listener::bind(&config, instance, &prefix).await?;
        all_counters.push(listener.counters());
        handles.push(tokio::spawn(listener.run(cancel.clone())));
    }

    let reporter = tokio::spawn(stats::report_loop(
        all_counters,
        Duration::from_secs(1),
        cancel.clone(),
    ));

    let mut failed = false;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "listener aborted");
                failed = true;
            }
            Err(e) => {
                error!(error = %e, "listener task panicked");
                failed = true;
            }
        }
    }

    // All listeners are done; stop the reporter even if no interrupt came.
    cancel.cancel();
    let _ = reporter.await;

    if failed {
        anyhow::bail!("one or more listener instances aborted");
    }
    info!("capture complete");
    Ok(())
}
