//! Real-time sequence classification of received fragments.
//!
//! A capture instance holds one [`Watermark`], the highest sequence number
//! it has accepted so far. Fragments at or below the watermark arrived too
//! late to keep the ordered stream append-only, so each one is routed to
//! exactly one of three destinations:
//!
//! - **accept**: sequence number above the watermark (or nothing accepted
//!   yet) — the stripped record goes to the ordered stream and the
//!   watermark advances;
//! - **late**: sequence number below the watermark — the whole raw slot
//!   goes to the orphan stream for offline reconciliation;
//! - **duplicate**: sequence number equal to the watermark — dropped.
//!
//! The classifier is greedy and lookahead-free: a single scalar of state,
//! batches processed strictly in delivery order, no reordering within or
//! across calls, and nothing suspends mid-batch. Behavior variants are
//! selected once at startup through [`ProcessorKind`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::spool::SpoolPair;
use crate::wire::{ChannelMap, FragmentView, Slot};

/// Last-accepted position of one capture instance.
///
/// Freshly constructed at instance start and discarded at shutdown; every
/// run rebuilds ordering state from the first fragment it sees. Unset means
/// nothing has been accepted yet, so the first fragment is always taken,
/// whatever its sequence number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    accepted: Option<(u64, u32)>,
}

impl Watermark {
    /// A watermark that has accepted nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last accepted fragment, if any.
    pub fn seqnum(&self) -> Option<u64> {
        self.accepted.map(|(seq, _)| seq)
    }

    /// Event number of the last accepted fragment, if any.
    pub fn event_num(&self) -> Option<u32> {
        self.accepted.map(|(_, event)| event)
    }

    fn advance(&mut self, seqnum: u64, event_num: u32) {
        self.accepted = Some((seqnum, event_num));
    }
}

/// Where one fragment ends up relative to the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accept,
    Late,
    Duplicate,
}

fn disposition(watermark: &Watermark, seqnum: u64) -> Disposition {
    match watermark.seqnum() {
        None => Disposition::Accept,
        Some(mark) if seqnum > mark => Disposition::Accept,
        Some(mark) if seqnum < mark => Disposition::Late,
        Some(_) => Disposition::Duplicate,
    }
}

/// Byte and fragment totals for one classified batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutput {
    /// Bytes appended to the ordered stream.
    pub bytes_ordered: u64,
    /// Bytes appended to the orphan stream.
    pub bytes_orphaned: u64,
    /// Fragments accepted in order.
    pub accepted: u64,
    /// Fragments routed to the orphan stream.
    pub orphaned: u64,
    /// Duplicate fragments dropped outright.
    pub dropped: u64,
}

impl BatchOutput {
    /// Total bytes this batch put on disk.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_ordered + self.bytes_orphaned
    }
}

/// One batch-processing behavior, chosen once at startup.
///
/// Implementations must process the batch strictly in delivery order and
/// treat any sink write failure as fatal to the instance.
pub trait Processor: Send {
    /// Classify `batch`, appending to `out` and advancing `watermark`.
    fn process_batch(
        &mut self,
        batch: &[Slot],
        watermark: &mut Watermark,
        out: &mut SpoolPair,
    ) -> Result<BatchOutput>;
}

/// Processor selection, as it appears in configuration and on the CLI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorKind {
    /// Real classification into ordered and orphan streams.
    #[default]
    Order,
    /// Classification with a random fraction of accepts forced late.
    FaultInject,
    /// Human-readable header dump instead of binary output.
    DebugDump,
    /// Discard everything; receive-path throughput testing only.
    Nop,
}

impl ProcessorKind {
    /// Build the processor this kind names.
    pub fn build(self, fault_fraction: f64, reorder_warn_gap: u64) -> Box<dyn Processor> {
        match self {
            Self::Order => Box::new(OrderProcessor::new(reorder_warn_gap)),
            Self::FaultInject => {
                Box::new(FaultInjectProcessor::new(fault_fraction, reorder_warn_gap))
            }
            Self::DebugDump => Box::new(DebugDumpProcessor),
            Self::Nop => Box::new(NopProcessor),
        }
    }
}

/// Route one decoded fragment, optionally forcing an otherwise-acceptable
/// fragment down the late path. Forcing never applies while the watermark
/// is unset, so the first fragment of a run is always accepted.
fn route(
    view: &FragmentView<'_>,
    slot: &Slot,
    watermark: &mut Watermark,
    out: &mut SpoolPair,
    totals: &mut BatchOutput,
    reorder_warn_gap: u64,
    force_late: bool,
) -> Result<()> {
    let header = view.header();
    let wire_len = header.wire_len();
    if wire_len > slot.datagram_len() {
        warn!(
            seqnum = header.seqnum,
            declared = wire_len,
            received = slot.datagram_len(),
            "datagram shorter than its declared fragment length"
        );
    }

    let mut routed = disposition(watermark, header.seqnum);
    if force_late && routed == Disposition::Accept && watermark.seqnum().is_some() {
        routed = Disposition::Late;
    }

    match routed {
        Disposition::Accept => {
            if reorder_warn_gap > 0 {
                if let Some(mark) = watermark.seqnum() {
                    let gap = header.seqnum - mark;
                    if gap > reorder_warn_gap {
                        warn!(
                            seqnum = header.seqnum,
                            gap,
                            "accepted fragment jumped the watermark by a large gap"
                        );
                    }
                }
            }
            out.write_ordered(view.wire_bytes())?;
            totals.bytes_ordered += wire_len as u64;
            totals.accepted += 1;
            watermark.advance(header.seqnum, header.event_num);
        }
        Disposition::Late => {
            // The raw slot, padding included, so the offline sort can walk
            // the file in fixed strides.
            out.write_orphan(slot.raw())?;
            totals.bytes_orphaned += slot.raw().len() as u64;
            totals.orphaned += 1;
        }
        Disposition::Duplicate => {
            debug!(seqnum = header.seqnum, "duplicate fragment dropped");
            totals.dropped += 1;
        }
    }
    Ok(())
}

/// The production classifier.
pub struct OrderProcessor {
    reorder_warn_gap: u64,
}

impl OrderProcessor {
    /// Warn when an accepted fragment jumps the watermark by more than
    /// `reorder_warn_gap` (0 disables the warning).
    pub fn new(reorder_warn_gap: u64) -> Self {
        Self { reorder_warn_gap }
    }
}

impl Processor for OrderProcessor {
    fn process_batch(
        &mut self,
        batch: &[Slot],
        watermark: &mut Watermark,
        out: &mut SpoolPair,
    ) -> Result<BatchOutput> {
        let mut totals = BatchOutput::default();
        for slot in batch {
            let view = FragmentView::parse(slot.raw())?;
            route(
                &view,
                slot,
                watermark,
                out,
                &mut totals,
                self.reorder_warn_gap,
                false,
            )?;
        }
        Ok(totals)
    }
}

/// Identical accept/late logic, but a configurable random fraction of
/// otherwise-acceptable fragments is forced into the orphan stream to
/// exercise offline reconciliation.
pub struct FaultInjectProcessor {
    fraction: f64,
    reorder_warn_gap: u64,
    rng: StdRng,
}

impl FaultInjectProcessor {
    /// Abandon roughly `fraction` of acceptable fragments, seeded from
    /// system entropy.
    pub fn new(fraction: f64, reorder_warn_gap: u64) -> Self {
        Self {
            fraction,
            reorder_warn_gap,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(fraction: f64, reorder_warn_gap: u64, seed: u64) -> Self {
        Self {
            fraction,
            reorder_warn_gap,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Processor for FaultInjectProcessor {
    fn process_batch(
        &mut self,
        batch: &[Slot],
        watermark: &mut Watermark,
        out: &mut SpoolPair,
    ) -> Result<BatchOutput> {
        let mut totals = BatchOutput::default();
        for slot in batch {
            let view = FragmentView::parse(slot.raw())?;
            let abandon = self.fraction > 0.0 && self.rng.gen::<f64>() < self.fraction;
            route(
                &view,
                slot,
                watermark,
                out,
                &mut totals,
                self.reorder_warn_gap,
                abandon,
            )?;
        }
        Ok(totals)
    }
}

/// Dumps each fragment header as text through the ordered sink.
pub struct DebugDumpProcessor;

impl Processor for DebugDumpProcessor {
    fn process_batch(
        &mut self,
        batch: &[Slot],
        watermark: &mut Watermark,
        out: &mut SpoolPair,
    ) -> Result<BatchOutput> {
        for slot in batch {
            let view = FragmentView::parse(slot.raw())?;
            let header = view.header();
            let map = ChannelMap::from_mask(header.channel_mask);
            let id = header.board_id;
            let text = format!(
                "Fragment header:\n\
                 ---------------------------\n\
                 Board id:                      {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}\n\
                 Relative offset:               {}\n\
                 Sequence number:               {}\n\
                 Event number:                  {}\n\
                 Trigger timestamp (low):       {}\n\
                 Channel mask:                  {:#018x}\n\
                 Active channels:               {}\n\
                 Samples (this fragment):       {}\n\
                 Channel number:                {}\n\
                 Total samples (all fragments): {}\n\
                 DRS4 stop:                     {}\n\
                 Payload length (bytes):        {}\n\n",
                id[0],
                id[1],
                id[2],
                id[3],
                id[4],
                id[5],
                header.rel_offset,
                header.seqnum,
                header.event_num,
                header.trigger_low,
                header.channel_mask,
                map.active_channels(),
                header.num_samples,
                header.channel,
                header.total_samples,
                header.drs4_stop,
                header.payload_len(),
            );
            out.write_ordered(text.as_bytes())?;
            watermark.advance(header.seqnum, header.event_num);
        }
        Ok(BatchOutput::default())
    }
}

/// Consumes batches without decoding or writing anything.
pub struct NopProcessor;

impl Processor for NopProcessor {
    fn process_batch(
        &mut self,
        _batch: &[Slot],
        _watermark: &mut Watermark,
        _out: &mut SpoolPair,
    ) -> Result<BatchOutput> {
        Ok(BatchOutput::default())
    }
}
