//! One UDP capture instance.
//!
//! Each instance binds its own port, owns its own spool pair and watermark,
//! and shares nothing mutable with its siblings, so any number of instances
//! can run in one process without coordination. The receive path mimics a
//! bulk `recvmmsg`: await the first datagram of a batch, then drain the
//! socket without blocking until the batch is full or the queue is empty,
//! and only then hand the whole batch to the processor.
//!
//! Classification is synchronous and sequential; one batch is fully
//! processed before the next receive. A failed spool write aborts the
//! instance. Cancellation is observed between batches, never inside one.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::classify::{Processor, Watermark};
use crate::config::Config;
use crate::error::Result;
use crate::spool::SpoolPair;
use crate::stats::InstanceCounters;
use crate::wire::Slot;

/// A bound capture instance, ready to run.
pub struct Listener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    spool: SpoolPair,
    processor: Box<dyn Processor>,
    watermark: Watermark,
    slots: Vec<Slot>,
    counters: Arc<InstanceCounters>,
    event_limit: Option<u64>,
}

impl Listener {
    /// Bind instance number `instance` and create its spool pair.
    pub async fn bind(config: &Config, instance: u16, prefix: &str) -> Result<Self> {
        let port = config.listener.base_port + instance;
        let addr = format!("{}:{}", config.listener.bind_addr, port);
        let socket = UdpSocket::bind(&addr).await?;
        let local_addr = socket.local_addr()?;

        let base = format!("{}_{}_{}", prefix, config.listener.bind_addr, local_addr.port());
        let spool = SpoolPair::create(&config.capture.output_dir, &base)?;

        let slot_len = config.listener.slot_len();
        let batch_size = config.listener.effective_batch_size();
        let slots = (0..batch_size).map(|_| Slot::new(slot_len)).collect();

        let processor = config.capture.processor.build(
            config.capture.fault_fraction,
            config.capture.reorder_warn_gap,
        );

        info!(
            addr = %local_addr,
            ordered = %spool.ordered_path().display(),
            orphans = %spool.orphans_path().display(),
            batch_size,
            slot_len,
            "listener bound"
        );

        Ok(Self {
            socket,
            local_addr,
            spool,
            processor,
            watermark: Watermark::new(),
            slots,
            counters: Arc::new(InstanceCounters::new(local_addr.to_string())),
            event_limit: config.capture.event_limit,
        })
    }

    /// The address this instance actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to this instance's counters.
    pub fn counters(&self) -> Arc<InstanceCounters> {
        Arc::clone(&self.counters)
    }

    /// Receive and classify until cancelled, the event limit is reached,
    /// or a fatal error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut events_seen: u64 = 0;

        loop {
            let filled = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(addr = %self.local_addr, "shutdown requested, finishing up");
                    break;
                }
                result = fill_batch(&self.socket, &mut self.slots) => match result {
                    Ok(filled) => filled,
                    Err(e) => {
                        error!(addr = %self.local_addr, error = %e, "receive failed");
                        return Err(e);
                    }
                },
            };

            let bytes_received: u64 = self.slots[..filled]
                .iter()
                .map(|slot| slot.datagram_len() as u64)
                .sum();
            let event_before = self.watermark.event_num();

            let output = match self.processor.process_batch(
                &self.slots[..filled],
                &mut self.watermark,
                &mut self.spool,
            ) {
                Ok(output) => output,
                Err(e) => {
                    error!(addr = %self.local_addr, error = %e, "classification failed, aborting instance");
                    return Err(e);
                }
            };
            self.counters.record_batch(filled as u64, bytes_received, &output);

            if let Some(limit) = self.event_limit {
                if self.watermark.event_num() != event_before {
                    events_seen += 1;
                }
                if events_seen >= limit {
                    info!(addr = %self.local_addr, events = events_seen, "event limit reached");
                    break;
                }
            }
        }

        let snapshot = self.counters.snapshot();
        let (ordered, orphans) = self.spool.finish()?;
        info!(
            addr = %self.local_addr,
            packets = snapshot.packets,
            bytes_written = snapshot.bytes_written(),
            ordered = %ordered.display(),
            orphans = %orphans.display(),
            "capture finished"
        );
        Ok(())
    }
}

/// Fill as many slots as the socket will give without blocking past the
/// first datagram; returns the number filled.
async fn fill_batch(socket: &UdpSocket, slots: &mut [Slot]) -> Result<usize> {
    let first = socket.recv(slots[0].raw_mut()).await?;
    slots[0].set_datagram_len(first);

    let mut filled = 1;
    while filled < slots.len() {
        match socket.try_recv(slots[filled].raw_mut()) {
            Ok(n) => {
                slots[filled].set_datagram_len(n);
                filled += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
