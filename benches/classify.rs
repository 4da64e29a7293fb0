//! Criterion benchmarks for the receive-path hot loop.
//!
//! The capture daemon decodes and classifies every datagram the digitizer
//! sends, so these two stages bound sustainable ingest rate. Batches are
//! sized like the receive loop sizes them (cache-budget slots).
//!
//! Run with: cargo bench --bench classify

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use wavespool::classify::{OrderProcessor, Processor, Watermark};
use wavespool::spool::SpoolPair;
use wavespool::wire::{encode_frame, slot_len, FragmentHeader, FragmentView, Slot};

const MAX_SAMPLES: u16 = 512;
const BATCH: usize = 240;

fn build_batch(first_seqnum: u64) -> Vec<Slot> {
    (0..BATCH as u64)
        .map(|i| {
            let seqnum = first_seqnum + i;
            let header = FragmentHeader {
                board_id: [0x02, 0x42, 0xac, 0x11, 0x00, 0x02],
                rel_offset: 0,
                seqnum,
                event_num: (seqnum / 4) as u32,
                trigger_low: seqnum as u32,
                channel_mask: 0b1111,
                num_samples: MAX_SAMPLES,
                channel: (seqnum % 4) as u16,
                total_samples: MAX_SAMPLES,
                drs4_stop: 0,
            };
            let samples: Vec<u16> = (0..MAX_SAMPLES).collect();
            let frame = encode_frame(&header, &samples);
            let mut slot = Slot::new(slot_len(MAX_SAMPLES));
            slot.raw_mut().copy_from_slice(&frame);
            slot.set_datagram_len(frame.len());
            slot
        })
        .collect()
}

/// Decode-only throughput: header parse plus payload bounds check.
fn decode_throughput(c: &mut Criterion) {
    let batch = build_batch(1);
    let bytes = (BATCH * slot_len(MAX_SAMPLES)) as u64;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(bytes));
    group.bench_function("batch", |b| {
        b.iter(|| {
            for slot in &batch {
                let view = FragmentView::parse(black_box(slot.raw())).unwrap();
                black_box(view.header().seqnum);
            }
        });
    });
    group.finish();
}

/// Full classification of an in-order batch, spool writes included.
fn classify_throughput(c: &mut Criterion) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut spool = SpoolPair::create(temp_dir.path(), "bench").unwrap();
    let mut processor = OrderProcessor::new(0);
    let mut watermark = Watermark::new();
    let bytes = (BATCH * slot_len(MAX_SAMPLES)) as u64;
    let mut next_seqnum = 1u64;

    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Bytes(bytes));
    group.bench_function("in_order_batch", |b| {
        b.iter(|| {
            // Fresh, still-ascending sequence numbers so every fragment
            // takes the accept path, like a healthy capture.
            let batch = build_batch(next_seqnum);
            next_seqnum += BATCH as u64;
            processor
                .process_batch(black_box(&batch), &mut watermark, &mut spool)
                .unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, decode_throughput, classify_throughput);
criterion_main!(benches);
