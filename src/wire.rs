//! Wire format for digitizer fragment frames.
//!
//! Each UDP datagram carries one fragment: a fixed 40-byte header followed
//! by a run of 16-bit samples. The digitizer writes every multi-byte field
//! little-endian and the receiver consumes them the same way, with no
//! byte-order conversion step.
//!
//! # Frame Layout
//! ```text
//! [40-byte header] [samples: u16 x num_samples]
//!
//! Header:
//!   board_id: [u8; 6]     board MAC address
//!   rel_offset: u16       sample offset relative to the stop pointer
//!   seqnum: u64           monotonically increases per packet
//!   event_num: u32        event number (used during assembly)
//!   trigger_low: u32      trigger timestamp, low word
//!   channel_mask: u64     channels present in this event
//!   num_samples: u16      samples in this fragment
//!   channel: u16          channel identifier
//!   total_samples: u16    samples across all fragments of the channel
//!   drs4_stop: u16        digitizer stop-sample pointer
//! ```
//!
//! Datagrams are received into fixed-size [`Slot`]s sized for the largest
//! legal fragment, so bytes past the on-wire length are padding. A
//! [`FragmentView`] is the validated window onto one slot: the declared
//! payload is bounds-checked against the slot before any sample data is
//! exposed.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 40;

/// Bytes per sample (12-bit ADC shipped as u16).
pub const SAMPLE_WIDTH: usize = 2;

/// Channel masks are encoded in a 64-bit word.
pub const NUM_CHANNELS: usize = 64;

/// Largest fragment width (in samples) a stock deployment configures.
pub const DEFAULT_MAX_FRAGMENT_SAMPLES: u16 = 512;

/// Receive slot width for a deployment's maximum fragment width.
pub fn slot_len(max_fragment_samples: u16) -> usize {
    HEADER_LEN + SAMPLE_WIDTH * max_fragment_samples as usize
}

/// Errors raised while decoding received fragment data.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer cannot hold a complete fragment header.
    #[error("buffer too short for fragment header: {len} bytes, need {HEADER_LEN}")]
    Truncated {
        /// Bytes actually available.
        len: usize,
    },

    /// The declared payload would run past the end of the slot.
    #[error(
        "fragment payload overruns slot: {num_samples} samples need \
         {needed} bytes, slot holds {available}"
    )]
    PayloadOverrun {
        /// Sample count the header declares.
        num_samples: u16,
        /// On-wire length implied by the header.
        needed: usize,
        /// Bytes the slot can hold.
        available: usize,
    },

    /// A stored record declares more samples than the deployment allows.
    #[error("record declares {num_samples} samples, deployment maximum is {max_samples}")]
    OversizedRecord {
        /// Sample count the record declares.
        num_samples: u16,
        /// Configured maximum fragment width.
        max_samples: u16,
    },
}

/// Decoded fragment header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Board MAC address.
    pub board_id: [u8; 6],
    /// Sample offset relative to the digitizer stop pointer.
    pub rel_offset: u16,
    /// Globally monotonic sequence number for this source.
    pub seqnum: u64,
    /// Event number.
    pub event_num: u32,
    /// Trigger timestamp, low word.
    pub trigger_low: u32,
    /// Bit i set means channel i is present in this event.
    pub channel_mask: u64,
    /// Samples carried by this fragment.
    pub num_samples: u16,
    /// Channel identifier.
    pub channel: u16,
    /// Samples across all fragments of this channel.
    pub total_samples: u16,
    /// Digitizer stop-sample pointer.
    pub drs4_stop: u16,
}

impl FragmentHeader {
    /// Decode a header from the first [`HEADER_LEN`] bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated { len: data.len() });
        }

        let mut board_id = [0u8; 6];
        board_id.copy_from_slice(&data[0..6]);

        Ok(Self {
            board_id,
            rel_offset: u16::from_le_bytes([data[6], data[7]]),
            seqnum: u64::from_le_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]),
            event_num: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
            trigger_low: u32::from_le_bytes([data[20], data[21], data[22], data[23]]),
            channel_mask: u64::from_le_bytes([
                data[24], data[25], data[26], data[27], data[28], data[29], data[30], data[31],
            ]),
            num_samples: u16::from_le_bytes([data[32], data[33]]),
            channel: u16::from_le_bytes([data[34], data[35]]),
            total_samples: u16::from_le_bytes([data[36], data[37]]),
            drs4_stop: u16::from_le_bytes([data[38], data[39]]),
        })
    }

    /// Payload length in bytes implied by `num_samples`.
    pub fn payload_len(&self) -> usize {
        SAMPLE_WIDTH * self.num_samples as usize
    }

    /// On-wire length of the fragment this header describes.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Encode just the header.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.board_id);
        buf.put_u16_le(self.rel_offset);
        buf.put_u64_le(self.seqnum);
        buf.put_u32_le(self.event_num);
        buf.put_u32_le(self.trigger_low);
        buf.put_u64_le(self.channel_mask);
        buf.put_u16_le(self.num_samples);
        buf.put_u16_le(self.channel);
        buf.put_u16_le(self.total_samples);
        buf.put_u16_le(self.drs4_stop);
    }
}

/// Encode a complete frame (header plus samples) as it travels on the wire.
///
/// `header.num_samples` must match `samples.len()`; this is the producer
/// side of the protocol, used by test fixtures and benchmarks.
pub fn encode_frame(header: &FragmentHeader, samples: &[u16]) -> BytesMut {
    debug_assert_eq!(header.num_samples as usize, samples.len());
    let mut buf = BytesMut::with_capacity(HEADER_LEN + SAMPLE_WIDTH * samples.len());
    header.encode_into(&mut buf);
    for sample in samples {
        buf.put_u16_le(*sample);
    }
    buf
}

/// A validated view of one fragment at the head of a receive slot.
///
/// Construction checks that the payload the header declares fits inside the
/// slot, so every accessor is bounds-safe by the time it can be called.
#[derive(Debug)]
pub struct FragmentView<'a> {
    header: FragmentHeader,
    wire: &'a [u8],
}

impl<'a> FragmentView<'a> {
    /// Decode and validate the fragment at the head of `slot`.
    pub fn parse(slot: &'a [u8]) -> Result<Self, WireError> {
        let header = FragmentHeader::parse(slot)?;
        let wire_len = header.wire_len();
        if wire_len > slot.len() {
            return Err(WireError::PayloadOverrun {
                num_samples: header.num_samples,
                needed: wire_len,
                available: slot.len(),
            });
        }
        Ok(Self {
            header,
            wire: &slot[..wire_len],
        })
    }

    /// The decoded header.
    pub fn header(&self) -> &FragmentHeader {
        &self.header
    }

    /// Header plus payload, with slot padding excluded.
    pub fn wire_bytes(&self) -> &'a [u8] {
        self.wire
    }

    /// Raw sample payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        &self.wire[HEADER_LEN..]
    }

    /// Iterate the samples in wire order.
    pub fn samples(&self) -> impl Iterator<Item = u16> + 'a {
        self.wire[HEADER_LEN..]
            .chunks_exact(SAMPLE_WIDTH)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// 1-based storage indices for the channels present in one event.
///
/// Scanning the activity mask from the low bit, each set bit receives the
/// next ascending index. This is a convenience for downstream storage
/// layout; classification never consults it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    index: [u8; NUM_CHANNELS],
    active: u8,
}

impl ChannelMap {
    /// Build the index map for `mask`.
    pub fn from_mask(mask: u64) -> Self {
        let mut index = [0u8; NUM_CHANNELS];
        let mut active = 0u8;
        for channel in 0..NUM_CHANNELS {
            if mask & (1u64 << channel) != 0 {
                active += 1;
                index[channel] = active;
            }
        }
        Self { index, active }
    }

    /// Storage index for `channel`, if it is present in the event.
    pub fn index_of(&self, channel: u16) -> Option<u8> {
        self.index
            .get(channel as usize)
            .copied()
            .filter(|&idx| idx != 0)
    }

    /// Number of channels present in the event.
    pub fn active_channels(&self) -> u8 {
        self.active
    }
}

/// One fixed-size receive slot plus the length of the datagram it holds.
#[derive(Debug, Clone)]
pub struct Slot {
    buf: Box<[u8]>,
    len: usize,
}

impl Slot {
    /// Allocate an empty slot of `slot_len` bytes.
    pub fn new(slot_len: usize) -> Self {
        Self {
            buf: vec![0u8; slot_len].into_boxed_slice(),
            len: 0,
        }
    }

    /// The full fixed-width buffer, padding included.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access for the receive path.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Length of the datagram most recently received into this slot.
    pub fn datagram_len(&self) -> usize {
        self.len
    }

    /// Record the length of a freshly received datagram.
    pub fn set_datagram_len(&mut self, len: usize) {
        self.len = len;
    }
}
