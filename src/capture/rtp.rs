//! RTP packet parser for SDR I/Q multicast streams.
//!
//! The upstream SDR daemon publishes narrowband I/Q as RTP v2 with 16-bit
//! big-endian integer pairs. The pair layout on the wire is (Q, I): the
//! complex sample at index k is `payload[2k+1] + j*payload[2k]`.

use byteorder::{BigEndian, ByteOrder};
use num_complex::Complex32;

/// RTP packet header (12 bytes minimum)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// RTP version (always 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number (wraps at 65535)
    pub sequence: u16,
    /// Timestamp (sample count at the channel rate, wraps at 2^32)
    pub timestamp: u32,
    /// Synchronization source ID
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header from bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        let first = data[0];
        let second = data[1];

        let version = (first >> 6) & 0x03;
        if version != 2 {
            return None;
        }

        Some(Self {
            version,
            padding: (first & 0x20) != 0,
            extension: (first & 0x10) != 0,
            csrc_count: first & 0x0F,
            marker: (second & 0x80) != 0,
            payload_type: second & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Total header size including CSRC list and extension header.
    /// The payload offset must come from here; streams that carry CSRCs
    /// or extensions are corrupted by a hardcoded 12.
    pub fn header_size(&self, data: &[u8]) -> Option<usize> {
        let mut size = 12 + self.csrc_count as usize * 4;

        if self.extension {
            if data.len() < size + 4 {
                return None;
            }
            let ext_words = u16::from_be_bytes([data[size + 2], data[size + 3]]) as usize;
            size += 4 + ext_words * 4;
        }

        if size > data.len() {
            return None;
        }
        Some(size)
    }
}

/// Parsed RTP packet with header and raw I/Q payload
#[derive(Debug)]
pub struct RtpPacket<'a> {
    pub header: RtpHeader,
    /// Raw payload: big-endian i16 (Q, I) pairs
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse a complete packet, skipping CSRC/extension and trimming padding
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let header = RtpHeader::parse(data)?;
        let header_size = header.header_size(data)?;

        let payload_end = if header.padding {
            let padding_len = *data.last()? as usize;
            if padding_len == 0 || padding_len > data.len() - header_size {
                return None;
            }
            data.len() - padding_len
        } else {
            data.len()
        };

        if payload_end < header_size {
            return None;
        }

        Some(Self {
            header,
            payload: &data[header_size..payload_end],
        })
    }

    /// Complex samples carried by this packet (4 bytes each)
    pub fn sample_count(&self) -> usize {
        self.payload.len() / 4
    }
}

/// Decode a raw payload of big-endian (Q, I) i16 pairs into complex
/// samples `I + jQ`, scaled to [-1.0, 1.0).
pub fn decode_iq(payload: &[u8]) -> Vec<Complex32> {
    const SCALE: f32 = 1.0 / 32768.0;
    let n = payload.len() / 4;
    let mut out = Vec::with_capacity(n);
    for k in 0..n {
        let q = BigEndian::read_i16(&payload[4 * k..]);
        let i = BigEndian::read_i16(&payload[4 * k + 2..]);
        out.push(Complex32::new(i as f32 * SCALE, q as f32 * SCALE));
    }
    out
}
