//! Offline reconciliation of one capture's ordered and orphan spools.
//!
//! The ordered file is already sorted by construction and the orphan file,
//! once sorted in memory, is too, so combining them is a single-pass
//! merge-join: before each ordered record is emitted, every sorted orphan
//! with a smaller sequence number is stripped of its slot padding and
//! emitted first. Duplicates cannot occur; the capture stage dropped them.
//!
//! The engine operates only on the completed, closed file pair of exactly
//! one capture instance. Orphans are held in memory for the sort, which
//! bounds a run to deployments whose orphan volume fits in RAM; a
//! deployment expecting more must swap in an external sort while keeping
//! the same join semantics.
//!
//! Failure behavior is deliberately blunt: a malformed orphan file aborts
//! before any output exists, and an I/O failure mid-merge aborts leaving
//! the already-written prefix on disk. Nothing is rolled back and nothing
//! is repaired by guesswork. Cancellation is checked once per record and
//! resolves at a record boundary, never mid-record.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::spool::{self, prefixed_path, RecordReader};
use crate::wire::{self, FragmentView};

/// Counts and outcome of one merge run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Records copied through from the ordered stream.
    pub ordered_records: u64,
    /// Orphans interleaved before ordered records.
    pub orphans_merged: u64,
    /// Orphans emitted after the ordered stream ran out.
    pub trailing_orphans: u64,
    /// Total bytes written to the merged file.
    pub bytes_written: u64,
    /// True when the run stopped early at a record boundary on request.
    pub cancelled: bool,
    /// Path of the merged file, when one was produced.
    pub merged_path: Option<PathBuf>,
}

/// The `.ordered`, `.orphans`, and `.merged` paths for a capture prefix.
pub fn spool_paths(prefix: &Path) -> (PathBuf, PathBuf, PathBuf) {
    (
        prefixed_path(prefix, "ordered"),
        prefixed_path(prefix, "orphans"),
        prefixed_path(prefix, "merged"),
    )
}

/// Merge `<prefix>.ordered` and `<prefix>.orphans` into `<prefix>.merged`.
///
/// An empty orphan file means everything arrived in order; the run
/// succeeds immediately and produces no merged file at all.
pub fn merge_spools(
    prefix: &Path,
    max_fragment_samples: u16,
    cancel: &CancellationToken,
) -> Result<MergeReport> {
    let slot_len = wire::slot_len(max_fragment_samples);
    let (ordered_path, orphans_path, merged_path) = spool_paths(prefix);

    let orphans = spool::load_orphans(&orphans_path, slot_len)?;
    if orphans.is_empty() {
        info!(
            orphans = %orphans_path.display(),
            "orphan spool is empty; the stream was received fully in order"
        );
        return Ok(MergeReport::default());
    }

    let mut slots: Vec<&[u8]> = orphans.chunks_exact(slot_len).collect();
    info!(count = slots.len(), "sorting orphan slots by sequence number");
    slots.sort_unstable_by_key(|slot| slot_seqnum(slot));

    let mut reader = RecordReader::open(&ordered_path, max_fragment_samples)?;
    let mut writer = BufWriter::new(File::create(&merged_path)?);
    let mut report = MergeReport {
        merged_path: Some(merged_path),
        ..MergeReport::default()
    };
    let mut cursor = 0;

    loop {
        if cancel.is_cancelled() {
            report.cancelled = true;
            info!("merge cancelled; stopping at a record boundary");
            break;
        }

        let Some(record) = reader.next_record()? else {
            break;
        };

        // Catch up: everything the capture stage filed late that belongs
        // before this record.
        while cursor < slots.len() && slot_seqnum(slots[cursor]) < record.header.seqnum {
            debug!(seqnum = slot_seqnum(slots[cursor]), "placing orphan");
            report.bytes_written += emit_stripped(&mut writer, slots[cursor])?;
            report.orphans_merged += 1;
            cursor += 1;
        }

        writer.write_all(record.as_bytes())?;
        report.bytes_written += record.as_bytes().len() as u64;
        report.ordered_records += 1;
    }

    if !report.cancelled && cursor < slots.len() {
        // Only fault injection or a pathological loss pattern leaves
        // orphans above the last ordered sequence number.
        warn!(
            count = slots.len() - cursor,
            "orphans with sequence numbers beyond the last ordered record"
        );
        while cursor < slots.len() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.bytes_written += emit_stripped(&mut writer, slots[cursor])?;
            report.trailing_orphans += 1;
            cursor += 1;
        }
    }

    writer.flush()?;
    Ok(report)
}

/// Sequence number at its fixed header offset inside a raw slot.
fn slot_seqnum(slot: &[u8]) -> u64 {
    u64::from_le_bytes([
        slot[8], slot[9], slot[10], slot[11], slot[12], slot[13], slot[14], slot[15],
    ])
}

/// Write one orphan slot stripped back to header plus declared payload,
/// re-validating the declaration against the slot on the way.
fn emit_stripped(writer: &mut impl Write, slot: &[u8]) -> Result<u64> {
    let view = FragmentView::parse(slot)?;
    writer.write_all(view.wire_bytes())?;
    Ok(view.wire_bytes().len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpoolError;
    use crate::wire::{encode_frame, FragmentHeader};
    use std::fs;
    use tempfile::tempdir;

    const MAX_SAMPLES: u16 = 8;

    fn frame_bytes(seqnum: u64) -> Vec<u8> {
        let header = FragmentHeader {
            board_id: [2; 6],
            rel_offset: 0,
            seqnum,
            event_num: seqnum as u32,
            trigger_low: 0,
            channel_mask: 1,
            num_samples: 2,
            channel: 0,
            total_samples: 2,
            drs4_stop: 0,
        };
        encode_frame(&header, &[seqnum as u16, 1]).to_vec()
    }

    fn raw_slot(seqnum: u64) -> Vec<u8> {
        let mut slot = frame_bytes(seqnum);
        slot.resize(wire::slot_len(MAX_SAMPLES), 0);
        slot
    }

    fn write_pair(dir: &Path, name: &str, ordered: &[u64], orphans: &[u64]) -> PathBuf {
        let prefix = dir.join(name);
        let (ordered_path, orphans_path, _) = spool_paths(&prefix);
        let mut ordered_bytes = Vec::new();
        for &seq in ordered {
            ordered_bytes.extend_from_slice(&frame_bytes(seq));
        }
        let mut orphan_bytes = Vec::new();
        for &seq in orphans {
            orphan_bytes.extend_from_slice(&raw_slot(seq));
        }
        fs::write(ordered_path, ordered_bytes).unwrap();
        fs::write(orphans_path, orphan_bytes).unwrap();
        prefix
    }

    fn merged_seqnums(prefix: &Path) -> Vec<u64> {
        let (_, _, merged) = spool_paths(prefix);
        let mut reader = RecordReader::open(&merged, MAX_SAMPLES).unwrap();
        let mut seqs = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            seqs.push(record.header.seqnum);
        }
        seqs
    }

    #[test]
    fn interleaves_orphans_into_sequence_order() {
        let dir = tempdir().unwrap();
        // Orphans deliberately unsorted on disk.
        let prefix = write_pair(dir.path(), "run", &[1, 2, 5, 6], &[4, 3]);

        let report = merge_spools(&prefix, MAX_SAMPLES, &CancellationToken::new()).unwrap();

        assert_eq!(merged_seqnums(&prefix), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(report.ordered_records, 4);
        assert_eq!(report.orphans_merged, 2);
        assert_eq!(report.trailing_orphans, 0);
        assert!(!report.cancelled);
    }

    #[test]
    fn empty_orphans_produce_no_merged_file() {
        let dir = tempdir().unwrap();
        let prefix = write_pair(dir.path(), "clean", &[1, 2, 3], &[]);

        let report = merge_spools(&prefix, MAX_SAMPLES, &CancellationToken::new()).unwrap();

        assert_eq!(report, MergeReport::default());
        let (_, _, merged) = spool_paths(&prefix);
        assert!(!merged.exists());
    }

    #[test]
    fn misaligned_orphan_file_aborts_without_output() {
        let dir = tempdir().unwrap();
        let prefix = write_pair(dir.path(), "corrupt", &[1, 2], &[3]);
        let (_, orphans_path, merged) = spool_paths(&prefix);

        // Shave a byte off the orphan file.
        let mut bytes = fs::read(&orphans_path).unwrap();
        bytes.pop();
        fs::write(&orphans_path, bytes).unwrap();

        let result = merge_spools(&prefix, MAX_SAMPLES, &CancellationToken::new());
        assert!(matches!(result, Err(SpoolError::OrphanFileCorrupt { .. })));
        assert!(!merged.exists());
    }

    #[test]
    fn trailing_orphans_are_appended_after_ordered_exhaustion() {
        let dir = tempdir().unwrap();
        let prefix = write_pair(dir.path(), "trailing", &[1, 2], &[9, 4]);

        let report = merge_spools(&prefix, MAX_SAMPLES, &CancellationToken::new()).unwrap();

        assert_eq!(merged_seqnums(&prefix), vec![1, 2, 4, 9]);
        assert_eq!(report.orphans_merged, 0);
        assert_eq!(report.trailing_orphans, 2);
    }

    #[test]
    fn cancellation_stops_cleanly_before_the_first_record() {
        let dir = tempdir().unwrap();
        let prefix = write_pair(dir.path(), "cancelled", &[1, 2, 3], &[4]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = merge_spools(&prefix, MAX_SAMPLES, &cancel).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.ordered_records, 0);
        // The merged file exists but holds only complete records (none).
        let (_, _, merged) = spool_paths(&prefix);
        assert_eq!(fs::metadata(&merged).unwrap().len(), 0);
    }

    #[test]
    fn corrupt_orphan_slot_aborts_mid_merge() {
        let dir = tempdir().unwrap();
        let prefix = write_pair(dir.path(), "badslot", &[5], &[]);
        let (_, orphans_path, _) = spool_paths(&prefix);

        // A full-width slot whose header declares more samples than a slot
        // can carry.
        let mut slot = raw_slot(1);
        slot[32..34].copy_from_slice(&(MAX_SAMPLES + 1).to_le_bytes());
        fs::write(&orphans_path, slot).unwrap();

        let result = merge_spools(&prefix, MAX_SAMPLES, &CancellationToken::new());
        assert!(matches!(result, Err(SpoolError::Wire(_))));
    }
}
