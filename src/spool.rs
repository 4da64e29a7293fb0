//! On-disk spool files: the ordered/orphan pair and record streaming.
//!
//! Each capture instance owns exactly one [`SpoolPair`]: an append-only
//! `.ordered` file of stripped records (header plus payload, no padding)
//! and an append-only `.orphans` file of raw fixed-width slots in arrival
//! order. The offline merge reads both back, the ordered side through a
//! [`RecordReader`] and the orphan side through [`load_orphans`].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SpoolError};
use crate::wire::{FragmentHeader, WireError, HEADER_LEN};

/// Append a dotted extension to a path prefix without touching any
/// extension already in the prefix itself.
pub fn prefixed_path(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// The ordered/orphan output pair of one capture instance.
///
/// Writes are buffered and strictly sequential. Any write failure is fatal
/// to the owning instance; there is no partial-write recovery.
pub struct SpoolPair {
    ordered: BufWriter<File>,
    orphans: BufWriter<File>,
    ordered_path: PathBuf,
    orphans_path: PathBuf,
}

impl SpoolPair {
    /// Create `<dir>/<base>.ordered` and `<dir>/<base>.orphans`, making
    /// `dir` if needed. Existing files are truncated.
    pub fn create(dir: &Path, base: &str) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let ordered_path = prefixed_path(&dir.join(base), "ordered");
        let orphans_path = prefixed_path(&dir.join(base), "orphans");
        let ordered = BufWriter::new(File::create(&ordered_path)?);
        let orphans = BufWriter::new(File::create(&orphans_path)?);
        Ok(Self {
            ordered,
            orphans,
            ordered_path,
            orphans_path,
        })
    }

    /// Append a stripped record (or debug text) to the ordered stream.
    pub fn write_ordered(&mut self, bytes: &[u8]) -> Result<()> {
        self.ordered.write_all(bytes)?;
        Ok(())
    }

    /// Append one raw fixed-width slot to the orphan stream.
    pub fn write_orphan(&mut self, bytes: &[u8]) -> Result<()> {
        self.orphans.write_all(bytes)?;
        Ok(())
    }

    /// Path of the ordered stream.
    pub fn ordered_path(&self) -> &Path {
        &self.ordered_path
    }

    /// Path of the orphan stream.
    pub fn orphans_path(&self) -> &Path {
        &self.orphans_path
    }

    /// Flush both streams and hand back their paths.
    pub fn finish(mut self) -> Result<(PathBuf, PathBuf)> {
        self.ordered.flush()?;
        self.orphans.flush()?;
        Ok((self.ordered_path, self.orphans_path))
    }
}

/// One stripped record, owned, as stored in an ordered or merged file.
#[derive(Debug, Clone)]
pub struct Record {
    /// The decoded header.
    pub header: FragmentHeader,
    bytes: Vec<u8>,
}

impl Record {
    /// Header plus payload, exactly as stored.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Streams stripped records back from an ordered or merged file.
///
/// Each record is read header-first so its payload length is known before
/// the payload is consumed. A record cut short mid-header or mid-payload
/// is a format error, not an EOF.
pub struct RecordReader {
    reader: BufReader<File>,
    path: PathBuf,
    max_samples: u16,
}

impl RecordReader {
    /// Open `path` for streaming, bounding records to the deployment's
    /// maximum fragment width.
    pub fn open(path: &Path, max_samples: u16) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            path: path.to_path_buf(),
            max_samples,
        })
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let mut header_buf = [0u8; HEADER_LEN];
        let got = read_until_full(&mut self.reader, &mut header_buf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(SpoolError::TruncatedRecord {
                path: self.path.clone(),
                expected: HEADER_LEN,
                found: got,
            });
        }

        let header = FragmentHeader::parse(&header_buf)?;
        if header.num_samples > self.max_samples {
            return Err(WireError::OversizedRecord {
                num_samples: header.num_samples,
                max_samples: self.max_samples,
            }
            .into());
        }

        let wire_len = header.wire_len();
        let mut bytes = vec![0u8; wire_len];
        bytes[..HEADER_LEN].copy_from_slice(&header_buf);
        let got = read_until_full(&mut self.reader, &mut bytes[HEADER_LEN..])?;
        if got < wire_len - HEADER_LEN {
            return Err(SpoolError::TruncatedRecord {
                path: self.path.clone(),
                expected: wire_len,
                found: HEADER_LEN + got,
            });
        }

        Ok(Some(Record { header, bytes }))
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read.
fn read_until_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Load a completed orphan file into memory for sorting.
///
/// An empty file yields an empty vector. Any other length must be an exact
/// multiple of `slot_len`; a remainder means upstream corruption and the
/// caller must not attempt to walk the data. Allocation goes through
/// `try_reserve` so an oversized orphan spool surfaces as a structured
/// error instead of an abort.
pub fn load_orphans(path: &Path, slot_len: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    if len % slot_len as u64 != 0 {
        return Err(SpoolError::OrphanFileCorrupt { len, slot_len });
    }

    let size = len as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|source| SpoolError::OrphanAllocation {
            bytes: size,
            source,
        })?;
    file.read_to_end(&mut buf)?;

    // A writer racing the merge could leave a fresh remainder.
    if buf.len() % slot_len != 0 {
        return Err(SpoolError::OrphanFileCorrupt {
            len: buf.len() as u64,
            slot_len,
        });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_frame;
    use tempfile::tempdir;

    fn test_header(seqnum: u64, num_samples: u16) -> FragmentHeader {
        FragmentHeader {
            board_id: [1, 2, 3, 4, 5, 6],
            rel_offset: 0,
            seqnum,
            event_num: 1,
            trigger_low: 0,
            channel_mask: 1,
            num_samples,
            channel: 0,
            total_samples: num_samples,
            drs4_stop: 0,
        }
    }

    #[test]
    fn pair_creates_named_files() {
        let dir = tempdir().unwrap();
        let pair = SpoolPair::create(dir.path(), "run_127.0.0.1_1338").unwrap();
        assert!(pair.ordered_path().ends_with("run_127.0.0.1_1338.ordered"));
        assert!(pair.orphans_path().ends_with("run_127.0.0.1_1338.orphans"));
        let (ordered, orphans) = pair.finish().unwrap();
        assert!(ordered.exists());
        assert!(orphans.exists());
    }

    #[test]
    fn records_roundtrip_through_reader() {
        let dir = tempdir().unwrap();
        let mut pair = SpoolPair::create(dir.path(), "rt").unwrap();
        for seq in [3u64, 9, 27] {
            let frame = encode_frame(&test_header(seq, 2), &[seq as u16, 0xFFFF]);
            pair.write_ordered(&frame).unwrap();
        }
        let (ordered, _) = pair.finish().unwrap();

        let mut reader = RecordReader::open(&ordered, 512).unwrap();
        let mut seqs = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(record.as_bytes().len(), record.header.wire_len());
            seqs.push(record.header.seqnum);
        }
        assert_eq!(seqs, vec![3, 9, 27]);
    }

    #[test]
    fn zero_sample_records_are_legal() {
        let dir = tempdir().unwrap();
        let mut pair = SpoolPair::create(dir.path(), "empty").unwrap();
        pair.write_ordered(&encode_frame(&test_header(5, 0), &[]))
            .unwrap();
        let (ordered, _) = pair.finish().unwrap();

        let mut reader = RecordReader::open(&ordered, 512).unwrap();
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.header.seqnum, 5);
        assert_eq!(record.as_bytes().len(), HEADER_LEN);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.ordered");
        let frame = encode_frame(&test_header(1, 4), &[1, 2, 3, 4]);
        fs::write(&path, &frame[..frame.len() - 3]).unwrap();

        let mut reader = RecordReader::open(&path, 512).unwrap();
        match reader.next_record() {
            Err(SpoolError::TruncatedRecord { expected, found, .. }) => {
                assert_eq!(expected, frame.len());
                assert_eq!(found, frame.len() - 3);
            }
            other => panic!("expected TruncatedRecord, got {other:?}"),
        }
    }

    #[test]
    fn oversized_record_declaration_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.ordered");
        let frame = encode_frame(&test_header(1, 8), &[0; 8]);
        fs::write(&path, &frame).unwrap();

        let mut reader = RecordReader::open(&path, 4).unwrap();
        assert!(matches!(
            reader.next_record(),
            Err(SpoolError::Wire(WireError::OversizedRecord {
                num_samples: 8,
                max_samples: 4,
            }))
        ));
    }

    #[test]
    fn orphan_loader_enforces_slot_multiple() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.orphans");
        fs::write(&path, vec![0u8; 130]).unwrap();
        assert!(matches!(
            load_orphans(&path, 64),
            Err(SpoolError::OrphanFileCorrupt { len: 130, slot_len: 64 })
        ));
    }

    #[test]
    fn orphan_loader_accepts_empty_and_exact_files() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.orphans");
        fs::write(&empty, b"").unwrap();
        assert!(load_orphans(&empty, 64).unwrap().is_empty());

        let exact = dir.path().join("exact.orphans");
        fs::write(&exact, vec![7u8; 192]).unwrap();
        assert_eq!(load_orphans(&exact, 64).unwrap().len(), 192);
    }
}
