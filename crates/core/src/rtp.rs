//! RTP packet model (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        CSRC list (0..15 items)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The core never interprets payloads; it parses headers for dispatch and
//! RTCP bookkeeping, and re-serializes packets written by applications and
//! the re-publish bridge. Parse failures on the media path are logged and
//! dropped by callers, never fatal.

use crate::error::{Result, RtspError};

const HEADER_LEN: usize = 12;

/// Parsed RTP fixed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        RtpHeader {
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence: 0,
            timestamp: 0,
            ssrc,
            csrc: Vec::new(),
        }
    }
}

/// A complete RTP packet: fixed header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Parse a packet from wire bytes.
    ///
    /// Extension headers are skipped; padding is stripped from the
    /// payload per the trailing pad-length octet.
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < HEADER_LEN {
            return Err(RtspError::protocol(format!(
                "RTP packet too short: {} bytes",
                data.len()
            )));
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(RtspError::protocol(format!("RTP version {version}")));
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = HEADER_LEN + csrc_count * 4;
        if data.len() < offset {
            return Err(RtspError::protocol("RTP packet truncated in CSRC list"));
        }
        let csrc = (0..csrc_count)
            .map(|i| {
                let base = HEADER_LEN + i * 4;
                u32::from_be_bytes([data[base], data[base + 1], data[base + 2], data[base + 3]])
            })
            .collect();

        if extension {
            if data.len() < offset + 4 {
                return Err(RtspError::protocol("RTP packet truncated in extension"));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(RtspError::protocol("RTP packet truncated in extension"));
            }
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || pad > end - offset {
                return Err(RtspError::protocol("invalid RTP padding"));
            }
            end -= pad;
        }

        Ok(RtpPacket {
            header: RtpHeader {
                padding: false,
                extension: false,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                csrc,
            },
            payload: data[offset..end].to_vec(),
        })
    }

    /// Serialize to wire bytes. Version is always 2; padding and
    /// extension are never emitted (they were stripped at parse time).
    pub fn serialize(&self) -> Vec<u8> {
        let header = &self.header;
        let mut out = Vec::with_capacity(HEADER_LEN + header.csrc.len() * 4 + self.payload.len());
        out.push((2 << 6) | (header.csrc.len() as u8 & 0x0f));
        out.push(((header.marker as u8) << 7) | (header.payload_type & 0x7f));
        out.extend_from_slice(&header.sequence.to_be_bytes());
        out.extend_from_slice(&header.timestamp.to_be_bytes());
        out.extend_from_slice(&header.ssrc.to_be_bytes());
        for csrc in &header.csrc {
            out.extend_from_slice(&csrc.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RtpPacket {
        let mut header = RtpHeader::new(96, 0xAABBCCDD);
        header.marker = true;
        header.sequence = 4660;
        header.timestamp = 90000;
        RtpPacket {
            header,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn round_trip() {
        let pkt = sample();
        let bytes = pkt.serialize();
        assert_eq!(bytes[0] >> 6, 2);
        assert_eq!(bytes[1] & 0x80, 0x80);
        assert_eq!(bytes[1] & 0x7f, 96);
        assert_eq!(RtpPacket::parse(&bytes).unwrap(), pkt);
    }

    #[test]
    fn parse_fields() {
        let bytes = sample().serialize();
        let pkt = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(pkt.header.sequence, 4660);
        assert_eq!(pkt.header.timestamp, 90000);
        assert_eq!(pkt.header.ssrc, 0xAABBCCDD);
        assert_eq!(pkt.payload, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn parse_strips_padding() {
        let mut bytes = sample().serialize();
        bytes[0] |= 0x20; // padding flag
        bytes.extend_from_slice(&[0, 0, 3]); // two pad bytes + count
        let pkt = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(pkt.payload, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(!pkt.header.padding);
    }

    #[test]
    fn parse_skips_extension() {
        let sample = sample();
        let mut bytes = Vec::new();
        bytes.push((2 << 6) | 0x10); // version 2, extension
        bytes.push(96);
        bytes.extend_from_slice(&sample.header.sequence.to_be_bytes());
        bytes.extend_from_slice(&sample.header.timestamp.to_be_bytes());
        bytes.extend_from_slice(&sample.header.ssrc.to_be_bytes());
        bytes.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01]); // profile + 1 word
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        bytes.extend_from_slice(&sample.payload);

        let pkt = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(pkt.payload, sample.payload);
    }

    #[test]
    fn reject_short_and_bad_version() {
        assert!(RtpPacket::parse(&[0x80, 96, 0]).is_err());
        let mut bytes = sample().serialize();
        bytes[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&bytes).is_err());
    }
}
