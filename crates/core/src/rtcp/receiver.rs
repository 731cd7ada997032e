//! Per-inbound-stream Receiver Report bookkeeping (RFC 3550 §6.4, A.1).

use std::time::SystemTime;

use crate::rtcp::report::{ReceiverReport, ReceptionReport, SenderReport};
use crate::rtcp::ntp_middle_32;
use crate::rtp::RtpHeader;

const RTP_SEQ_MOD: u32 = 1 << 16;
/// Forward jump beyond which the sequence is treated as a restart
/// candidate (RFC 3550 A.1).
const MAX_DROPOUT: u32 = 3000;
/// Backward jump tolerated as reordering.
const MAX_MISORDER: u32 = 100;
/// Sequential packets required to declare a source valid.
const MIN_SEQUENTIAL: u32 = 2;

/// Tracks reception quality of one incoming RTP stream and produces
/// Receiver Reports.
///
/// Sequence validation follows the RFC 3550 appendix A.1 algorithm: a new
/// source sits in probation until [`MIN_SEQUENTIAL`] in-order packets
/// arrive, large forward gaps reset the sequence state once confirmed by
/// a second packet, and wraparounds extend the sequence with a cycle
/// counter.
pub struct RtcpReceiver {
    /// SSRC identifying this receiver in emitted reports.
    receiver_ssrc: u32,
    sender_ssrc: Option<u32>,
    clock_rate: f64,

    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    probation: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,

    transit: Option<f64>,
    jitter: f64,

    last_sr: u32,
    last_sr_received: Option<SystemTime>,
}

impl RtcpReceiver {
    pub fn new(receiver_ssrc: u32, clock_rate: u32) -> Self {
        RtcpReceiver {
            receiver_ssrc,
            sender_ssrc: None,
            clock_rate: clock_rate as f64,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            bad_seq: RTP_SEQ_MOD + 1,
            probation: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            transit: None,
            jitter: 0.0,
            last_sr: 0,
            last_sr_received: None,
        }
    }

    /// Record one incoming packet.
    pub fn process_packet(&mut self, header: &RtpHeader, now: SystemTime) {
        if self.sender_ssrc != Some(header.ssrc) {
            // New source: restart validation.
            self.sender_ssrc = Some(header.ssrc);
            self.init_seq(header.sequence);
            self.max_seq = header.sequence.wrapping_sub(1);
            self.probation = MIN_SEQUENTIAL;
            self.transit = None;
            self.jitter = 0.0;
        }
        self.update_seq(header.sequence);
        self.update_jitter(header.timestamp, now);
    }

    /// Record a received Sender Report, echoed back as LSR/DLSR.
    pub fn process_sender_report(&mut self, sr: &SenderReport, now: SystemTime) {
        if Some(sr.ssrc) != self.sender_ssrc {
            return;
        }
        self.last_sr = ntp_middle_32(sr.ntp_sec, sr.ntp_frac);
        self.last_sr_received = Some(now);
    }

    /// Build a Receiver Report for the current instant, or `None` while
    /// the source is still unvalidated.
    pub fn report(&mut self, now: SystemTime) -> Option<ReceiverReport> {
        let sender_ssrc = self.sender_ssrc?;
        if self.received == 0 {
            return None;
        }

        let extended_max = self.cycles + self.max_seq as u32;
        let expected = extended_max.wrapping_sub(self.base_seq).wrapping_add(1);
        let lost = expected as i64 - self.received as i64;

        // Fraction lost over the interval since the previous report
        // (RFC 3550 A.3).
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        };

        let delay_last_sr = match self.last_sr_received {
            Some(received_at) => {
                let delay = now.duration_since(received_at).unwrap_or_default();
                (delay.as_secs_f64() * 65536.0) as u32
            }
            None => 0,
        };

        Some(ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![ReceptionReport {
                ssrc: sender_ssrc,
                fraction_lost,
                cumulative_lost: lost.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
                highest_sequence: extended_max,
                jitter: self.jitter as u32,
                last_sr: self.last_sr,
                delay_last_sr,
            }],
        })
    }

    /// Interarrival jitter estimate in timestamp units.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = seq as u32;
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
    }

    fn update_seq(&mut self, seq: u16) {
        let udelta = seq.wrapping_sub(self.max_seq) as u32;

        if self.probation > 0 {
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq);
                    self.received += 1;
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            return;
        }

        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles += RTP_SEQ_MOD;
            }
            self.max_seq = seq;
        } else if udelta <= RTP_SEQ_MOD - MAX_MISORDER {
            // Large jump: accept only two packets in a row at the new
            // position, then restart.
            if seq as u32 == self.bad_seq {
                self.init_seq(seq);
            } else {
                self.bad_seq = seq.wrapping_add(1) as u32;
                return;
            }
        } else {
            // Duplicate or reordered packet inside the misorder window.
        }
        self.received += 1;
    }

    /// `J += (|D| − J) / 16` (RFC 3550 §6.4.1).
    fn update_jitter(&mut self, rtp_timestamp: u32, now: SystemTime) {
        let arrival = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            * self.clock_rate;
        let transit = arrival - rtp_timestamp as f64;
        if let Some(previous) = self.transit {
            let d = (transit - previous).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::ntp_timestamp;
    use std::time::Duration;

    fn header(sequence: u16, timestamp: u32) -> RtpHeader {
        let mut h = RtpHeader::new(96, 0xCAFE_F00D);
        h.sequence = sequence;
        h.timestamp = timestamp;
        h
    }

    fn feed_sequential(receiver: &mut RtcpReceiver, start: u16, count: u16, t0: SystemTime) {
        for i in 0..count {
            receiver.process_packet(
                &header(start.wrapping_add(i), i as u32 * 3000),
                t0 + Duration::from_millis(i as u64 * 33),
            );
        }
    }

    #[test]
    fn no_report_before_validation() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        assert!(receiver.report(t0).is_none());
        receiver.process_packet(&header(10, 0), t0);
        // One packet is still in probation.
        assert!(receiver.report(t0).is_none());
    }

    #[test]
    fn clean_stream_reports_no_loss() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        feed_sequential(&mut receiver, 100, 20, t0);

        let rr = receiver.report(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(rr.ssrc, 1);
        let block = &rr.reports[0];
        assert_eq!(block.ssrc, 0xCAFE_F00D);
        assert_eq!(block.cumulative_lost, 0);
        assert_eq!(block.fraction_lost, 0);
        // Probation consumed the first packet; the highest stands.
        assert_eq!(block.highest_sequence, 119);
    }

    #[test]
    fn gap_counts_as_loss() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        feed_sequential(&mut receiver, 0, 10, t0);
        // Skip 10..20, continue at 20.
        feed_sequential(&mut receiver, 20, 5, t0 + Duration::from_secs(1));

        let rr = receiver.report(t0 + Duration::from_secs(2)).unwrap();
        let block = &rr.reports[0];
        assert_eq!(block.cumulative_lost, 10);
        assert!(block.fraction_lost > 0);
    }

    #[test]
    fn wraparound_extends_sequence() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        feed_sequential(&mut receiver, 65533, 6, t0); // wraps to 2

        let rr = receiver.report(t0 + Duration::from_secs(1)).unwrap();
        let block = &rr.reports[0];
        assert_eq!(block.highest_sequence, RTP_SEQ_MOD + 2);
        assert_eq!(block.cumulative_lost, 0);
    }

    #[test]
    fn big_jump_resets_after_confirmation() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        feed_sequential(&mut receiver, 0, 5, t0);

        // A jump beyond MAX_DROPOUT is ignored once, accepted when the
        // next packet confirms the new position.
        receiver.process_packet(&header(40000, 0), t0 + Duration::from_secs(2));
        receiver.process_packet(&header(40001, 3000), t0 + Duration::from_secs(2));
        feed_sequential(&mut receiver, 40002, 3, t0 + Duration::from_secs(3));

        let rr = receiver.report(t0 + Duration::from_secs(4)).unwrap();
        let block = &rr.reports[0];
        assert_eq!(block.highest_sequence, 40004);
        assert_eq!(block.cumulative_lost, 0);
    }

    #[test]
    fn jitter_converges_on_steady_stream() {
        let mut receiver = RtcpReceiver::new(1, 8000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        // Perfectly paced stream: 20 ms packets at 8 kHz, zero jitter.
        for i in 0..50u32 {
            receiver.process_packet(
                &header(i as u16, i * 160),
                t0 + Duration::from_millis(i as u64 * 20),
            );
        }
        assert!(receiver.jitter() < 1.0);
    }

    #[test]
    fn last_sr_echo() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        feed_sequential(&mut receiver, 0, 5, t0);

        let sr_time = t0 + Duration::from_secs(1);
        let (ntp_sec, ntp_frac) = ntp_timestamp(sr_time);
        receiver.process_sender_report(
            &SenderReport {
                ssrc: 0xCAFE_F00D,
                ntp_sec,
                ntp_frac,
                rtp_timestamp: 0,
                packet_count: 5,
                octet_count: 500,
                reports: vec![],
            },
            sr_time,
        );

        let rr = receiver.report(sr_time + Duration::from_secs(1)).unwrap();
        let block = &rr.reports[0];
        assert_eq!(block.last_sr, ntp_middle_32(ntp_sec, ntp_frac));
        // One second in 1/65536 units, within rounding.
        assert!(block.delay_last_sr.abs_diff(65536) <= 1);
    }

    #[test]
    fn foreign_sender_report_ignored() {
        let mut receiver = RtcpReceiver::new(1, 90000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(5000);
        feed_sequential(&mut receiver, 0, 5, t0);
        receiver.process_sender_report(
            &SenderReport {
                ssrc: 0xBAD,
                ntp_sec: 9,
                ntp_frac: 9,
                rtp_timestamp: 0,
                packet_count: 0,
                octet_count: 0,
                reports: vec![],
            },
            t0,
        );
        let rr = receiver.report(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(rr.reports[0].last_sr, 0);
    }
}
