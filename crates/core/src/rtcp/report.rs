//! Sender Report / Receiver Report wire format (RFC 3550 §6.4).

use crate::error::{Result, RtspError};

/// RTCP packet type: Sender Report.
pub const PT_SENDER_REPORT: u8 = 200;
/// RTCP packet type: Receiver Report.
pub const PT_RECEIVER_REPORT: u8 = 201;

/// Reception report block, shared by SR and RR (RFC 3550 §6.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of the source this block reports on.
    pub ssrc: u32,
    /// Fraction of packets lost since the previous report, as a fixed
    /// point number with the binary point at the left edge.
    pub fraction_lost: u8,
    /// Cumulative packets lost, 24-bit signed on the wire.
    pub cumulative_lost: i32,
    /// Extended highest sequence number: cycle count in the high 16 bits.
    pub highest_sequence: u32,
    /// Interarrival jitter in timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp of the last received SR.
    pub last_sr: u32,
    /// Delay since that SR, in units of 1/65536 seconds.
    pub delay_last_sr: u32,
}

impl ReceptionReport {
    const LEN: usize = 24;

    fn marshal_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        // Clamp cumulative loss to the 24-bit signed wire range.
        let lost = self.cumulative_lost.clamp(-(1 << 23), (1 << 23) - 1);
        out.push(self.fraction_lost);
        out.extend_from_slice(&(lost as u32).to_be_bytes()[1..4]);
        out.extend_from_slice(&self.highest_sequence.to_be_bytes());
        out.extend_from_slice(&self.jitter.to_be_bytes());
        out.extend_from_slice(&self.last_sr.to_be_bytes());
        out.extend_from_slice(&self.delay_last_sr.to_be_bytes());
    }

    fn parse(data: &[u8]) -> ReceptionReport {
        let raw_lost = u32::from_be_bytes([0, data[5], data[6], data[7]]);
        // Sign-extend the 24-bit loss counter.
        let cumulative_lost = if raw_lost & 0x0080_0000 != 0 {
            (raw_lost | 0xff00_0000) as i32
        } else {
            raw_lost as i32
        };
        ReceptionReport {
            ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            fraction_lost: data[4],
            cumulative_lost,
            highest_sequence: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            jitter: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            last_sr: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            delay_last_sr: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        }
    }
}

/// Sender Report (RFC 3550 §6.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

impl SenderReport {
    pub fn marshal(&self) -> Vec<u8> {
        let words = 6 + self.reports.len() * 6;
        let mut out = Vec::with_capacity(4 + words * 4);
        out.push(0x80 | (self.reports.len() as u8 & 0x1f));
        out.push(PT_SENDER_REPORT);
        out.extend_from_slice(&(words as u16).to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.ntp_sec.to_be_bytes());
        out.extend_from_slice(&self.ntp_frac.to_be_bytes());
        out.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        out.extend_from_slice(&self.packet_count.to_be_bytes());
        out.extend_from_slice(&self.octet_count.to_be_bytes());
        for report in &self.reports {
            report.marshal_into(&mut out);
        }
        out
    }

    fn parse(count: usize, body: &[u8]) -> Result<SenderReport> {
        if body.len() < 24 + count * ReceptionReport::LEN {
            return Err(RtspError::protocol("truncated sender report"));
        }
        let reports = (0..count)
            .map(|i| ReceptionReport::parse(&body[24 + i * ReceptionReport::LEN..]))
            .collect();
        Ok(SenderReport {
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            ntp_sec: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            ntp_frac: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
            rtp_timestamp: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
            packet_count: u32::from_be_bytes([body[16], body[17], body[18], body[19]]),
            octet_count: u32::from_be_bytes([body[20], body[21], body[22], body[23]]),
            reports,
        })
    }
}

/// Receiver Report (RFC 3550 §6.4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn marshal(&self) -> Vec<u8> {
        let words = 1 + self.reports.len() * 6;
        let mut out = Vec::with_capacity(4 + words * 4);
        out.push(0x80 | (self.reports.len() as u8 & 0x1f));
        out.push(PT_RECEIVER_REPORT);
        out.extend_from_slice(&(words as u16).to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for report in &self.reports {
            report.marshal_into(&mut out);
        }
        out
    }

    fn parse(count: usize, body: &[u8]) -> Result<ReceiverReport> {
        if body.len() < 4 + count * ReceptionReport::LEN {
            return Err(RtspError::protocol("truncated receiver report"));
        }
        let reports = (0..count)
            .map(|i| ReceptionReport::parse(&body[4 + i * ReceptionReport::LEN..]))
            .collect();
        Ok(ReceiverReport {
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            reports,
        })
    }
}

/// One packet of a compound RTCP datagram. Types the core does not
/// interpret (SDES, BYE, APP, feedback) are surfaced as [`Other`](Self::Other)
/// so callers can skip them without failing the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Other { packet_type: u8 },
}

/// Parse a compound RTCP datagram into its packets.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(RtspError::protocol("truncated RTCP header"));
        }
        let version = rest[0] >> 6;
        if version != 2 {
            return Err(RtspError::protocol(format!("RTCP version {version}")));
        }
        let count = (rest[0] & 0x1f) as usize;
        let packet_type = rest[1];
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if rest.len() < len {
            return Err(RtspError::protocol("truncated RTCP packet"));
        }
        let body = &rest[4..len];

        packets.push(match packet_type {
            PT_SENDER_REPORT => RtcpPacket::SenderReport(SenderReport::parse(count, body)?),
            PT_RECEIVER_REPORT => RtcpPacket::ReceiverReport(ReceiverReport::parse(count, body)?),
            other => RtcpPacket::Other { packet_type: other },
        });
        rest = &rest[len..];
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> ReceptionReport {
        ReceptionReport {
            ssrc: 0x01020304,
            fraction_lost: 12,
            cumulative_lost: -5,
            highest_sequence: 0x0001_ffff,
            jitter: 42,
            last_sr: 0xAABBCCDD,
            delay_last_sr: 65536,
        }
    }

    #[test]
    fn sender_report_round_trip() {
        let sr = SenderReport {
            ssrc: 0xDEADBEEF,
            ntp_sec: 0x11223344,
            ntp_frac: 0x55667788,
            rtp_timestamp: 90000,
            packet_count: 100,
            octet_count: 14000,
            reports: vec![sample_block()],
        };
        let bytes = sr.marshal();
        assert_eq!(bytes[1], PT_SENDER_REPORT);
        assert_eq!(bytes.len(), (u16::from_be_bytes([bytes[2], bytes[3]]) as usize + 1) * 4);

        let parsed = parse_compound(&bytes).unwrap();
        assert_eq!(parsed, vec![RtcpPacket::SenderReport(sr)]);
    }

    #[test]
    fn receiver_report_round_trip() {
        let rr = ReceiverReport {
            ssrc: 0xCAFEBABE,
            reports: vec![sample_block()],
        };
        let parsed = parse_compound(&rr.marshal()).unwrap();
        assert_eq!(parsed, vec![RtcpPacket::ReceiverReport(rr)]);
    }

    #[test]
    fn negative_loss_survives_24_bit_encoding() {
        let rr = ReceiverReport {
            ssrc: 1,
            reports: vec![ReceptionReport {
                cumulative_lost: -1,
                ..sample_block()
            }],
        };
        let RtcpPacket::ReceiverReport(parsed) = &parse_compound(&rr.marshal()).unwrap()[0] else {
            panic!("expected RR");
        };
        assert_eq!(parsed.reports[0].cumulative_lost, -1);
    }

    #[test]
    fn compound_with_unknown_type() {
        let mut data = SenderReport {
            ssrc: 7,
            ntp_sec: 0,
            ntp_frac: 0,
            rtp_timestamp: 0,
            packet_count: 0,
            octet_count: 0,
            reports: vec![],
        }
        .marshal();
        // Append a minimal SDES packet (type 202).
        data.extend_from_slice(&[0x80, 202, 0x00, 0x01, 0, 0, 0, 0]);

        let packets = parse_compound(&data).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[1], RtcpPacket::Other { packet_type: 202 }));
    }

    #[test]
    fn truncated_is_error() {
        let bytes = ReceiverReport {
            ssrc: 1,
            reports: vec![],
        }
        .marshal();
        assert!(parse_compound(&bytes[..bytes.len() - 1]).is_err());
    }
}
