//! Per-outbound-stream Sender Report bookkeeping (RFC 3550 §6.4.1).

use std::time::{Duration, SystemTime};

use crate::rtcp::report::SenderReport;
use crate::rtcp::{ntp_timestamp, randomized_interval};
use crate::rtp::RtpHeader;

/// Default Sender Report period. Randomized ±50% per interval, staying
/// inside the 1–5 s window.
pub const DEFAULT_REPORT_PERIOD: Duration = Duration::from_secs(3);

/// Snapshot of the sender counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderStats {
    pub packet_count: u32,
    pub octet_count: u32,
}

/// Aggregates statistics of one outgoing RTP stream and produces Sender
/// Reports mapping the stream's RTP timeline onto the wall clock.
///
/// The mapping anchor is the (RTP timestamp, wall clock) pair of an
/// observed packet. The anchor is refreshed when it is older than one
/// report period, so clock drift between the media source and the wall
/// clock stays bounded.
pub struct RtcpSender {
    clock_rate: f64,
    report_period: Duration,
    ssrc: Option<u32>,
    anchor_rtp_timestamp: Option<u32>,
    anchor_wallclock: Option<SystemTime>,
    last_sequence: Option<u16>,
    packet_count: u32,
    octet_count: u32,
}

impl RtcpSender {
    pub fn new(clock_rate: u32, report_period: Duration) -> Self {
        RtcpSender {
            clock_rate: clock_rate as f64,
            report_period,
            ssrc: None,
            anchor_rtp_timestamp: None,
            anchor_wallclock: None,
            last_sequence: None,
            packet_count: 0,
            octet_count: 0,
        }
    }

    /// Record one outgoing packet.
    pub fn process_packet(&mut self, header: &RtpHeader, payload_len: usize, now: SystemTime) {
        self.ssrc = Some(header.ssrc);
        self.last_sequence = Some(header.sequence);
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);

        let stale = match self.anchor_wallclock {
            Some(anchor) => now
                .duration_since(anchor)
                .map(|age| age > self.report_period)
                .unwrap_or(true),
            None => true,
        };
        if stale {
            self.anchor_rtp_timestamp = Some(header.timestamp);
            self.anchor_wallclock = Some(now);
        }
    }

    /// Build a Sender Report for the current instant, or `None` before
    /// any packet has been observed.
    pub fn report(&self, now: SystemTime) -> Option<SenderReport> {
        let ssrc = self.ssrc?;
        let anchor_rtp = self.anchor_rtp_timestamp?;
        let anchor_wallclock = self.anchor_wallclock?;

        let elapsed = now
            .duration_since(anchor_wallclock)
            .unwrap_or_default()
            .as_secs_f64();
        let rtp_timestamp = anchor_rtp.wrapping_add((elapsed * self.clock_rate) as u32);
        let (ntp_sec, ntp_frac) = ntp_timestamp(now);

        Some(SenderReport {
            ssrc,
            ntp_sec,
            ntp_frac,
            rtp_timestamp,
            packet_count: self.packet_count,
            octet_count: self.octet_count,
            reports: Vec::new(),
        })
    }

    /// Interval until the next report: the period randomized ±50% so
    /// concurrent streams do not synchronize (RFC 3550 §6.2).
    pub fn next_interval(&self) -> Duration {
        randomized_interval(self.report_period)
    }

    /// Highest sequence number observed, for RTP-Info synthesis.
    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }

    /// RTP timestamp of the anchor packet, for RTP-Info synthesis.
    pub fn last_rtp_timestamp(&self) -> Option<u32> {
        self.anchor_rtp_timestamp
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            packet_count: self.packet_count,
            octet_count: self.octet_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u16, timestamp: u32) -> RtpHeader {
        let mut h = RtpHeader::new(96, 0x1111_2222);
        h.sequence = sequence;
        h.timestamp = timestamp;
        h
    }

    #[test]
    fn no_report_before_first_packet() {
        let sender = RtcpSender::new(90000, DEFAULT_REPORT_PERIOD);
        assert!(sender.report(SystemTime::now()).is_none());
    }

    #[test]
    fn counters_accumulate() {
        let mut sender = RtcpSender::new(90000, DEFAULT_REPORT_PERIOD);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        sender.process_packet(&header(1, 0), 100, t0);
        sender.process_packet(&header(2, 3000), 200, t0 + Duration::from_millis(33));

        let sr = sender.report(t0 + Duration::from_millis(40)).unwrap();
        assert_eq!(sr.ssrc, 0x1111_2222);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 300);
    }

    #[test]
    fn rtp_timestamp_extrapolates_from_anchor() {
        let mut sender = RtcpSender::new(90000, DEFAULT_REPORT_PERIOD);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        sender.process_packet(&header(1, 90000), 100, t0);

        // One second later the RTP clock has advanced by one clock rate.
        let sr = sender.report(t0 + Duration::from_secs(1)).unwrap();
        let expected = 90000u32 + 90000;
        assert!(sr.rtp_timestamp.abs_diff(expected) <= 1);
    }

    #[test]
    fn ntp_monotonic_across_reports() {
        let mut sender = RtcpSender::new(90000, DEFAULT_REPORT_PERIOD);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        sender.process_packet(&header(1, 0), 10, t0);

        let a = sender.report(t0 + Duration::from_millis(100)).unwrap();
        let b = sender.report(t0 + Duration::from_millis(2100)).unwrap();
        assert!((b.ntp_sec, b.ntp_frac) >= (a.ntp_sec, a.ntp_frac));
    }

    #[test]
    fn anchor_refreshes_when_stale() {
        let mut sender = RtcpSender::new(90000, Duration::from_secs(1));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        sender.process_packet(&header(1, 0), 10, t0);

        // Within the period the anchor holds.
        sender.process_packet(&header(2, 3000), 10, t0 + Duration::from_millis(500));
        assert_eq!(sender.last_rtp_timestamp(), Some(0));

        // Past the period the anchor moves to the newest packet.
        let t1 = t0 + Duration::from_secs(2);
        sender.process_packet(&header(3, 180000), 10, t1);
        assert_eq!(sender.last_rtp_timestamp(), Some(180000));
        let sr = sender.report(t1).unwrap();
        assert!(sr.rtp_timestamp.abs_diff(180000) <= 1);
    }

    #[test]
    fn interval_randomized_within_half_period() {
        let sender = RtcpSender::new(90000, Duration::from_secs(2));
        for _ in 0..50 {
            let interval = sender.next_interval();
            assert!(interval >= Duration::from_secs(1));
            assert!(interval <= Duration::from_secs(3));
        }
    }
}
