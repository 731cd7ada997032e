//! RTCP reports and per-stream statistics (RFC 3550 §6).
//!
//! Three pieces:
//!
//! - [`report`] — Sender Report / Receiver Report wire format.
//! - [`sender`] — per-outbound-stream aggregator that turns observed RTP
//!   packets into periodic Sender Reports.
//! - [`receiver`] — per-inbound-stream aggregator tracking sequence
//!   cycles, loss, and interarrival jitter, emitting Receiver Reports.
//!
//! Report scheduling is the caller's job (the client and server own the
//! timer threads); the aggregators expose randomized intervals so
//! independent streams do not synchronize their reports (RFC 3550 §6.2).

pub mod receiver;
pub mod report;
pub mod sender;

pub use receiver::RtcpReceiver;
pub use report::{ReceiverReport, ReceptionReport, RtcpPacket, SenderReport};
pub use sender::RtcpSender;

use std::time::{Duration, SystemTime};

use rand::RngExt;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// A report period randomized ±50%, so concurrent streams do not
/// synchronize their reports (RFC 3550 §6.2).
pub fn randomized_interval(period: Duration) -> Duration {
    let factor = 0.5 + rand::rng().random::<f64>();
    Duration::from_secs_f64(period.as_secs_f64() * factor)
}

/// Wall clock as a 64-bit NTP timestamp: seconds since 1900 in 32.32
/// fixed point.
pub fn ntp_timestamp(t: SystemTime) -> (u32, u32) {
    let since_unix = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = (since_unix.as_secs() + NTP_UNIX_OFFSET_SECS) as u32;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs, frac as u32)
}

/// Middle 32 bits of an NTP timestamp, as used by the LSR field
/// (RFC 3550 §6.4.1).
pub fn ntp_middle_32(ntp_sec: u32, ntp_frac: u32) -> u32 {
    (ntp_sec << 16) | (ntp_frac >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ntp_is_monotonic() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let t1 = t0 + Duration::from_millis(1500);
        let a = ntp_timestamp(t0);
        let b = ntp_timestamp(t1);
        assert!((b.0, b.1) > (a.0, a.1));
        assert_eq!(b.0, a.0 + 1);
    }

    #[test]
    fn ntp_epoch_offset() {
        let (sec, frac) = ntp_timestamp(SystemTime::UNIX_EPOCH);
        assert_eq!(sec as u64, NTP_UNIX_OFFSET_SECS);
        assert_eq!(frac, 0);
    }

    #[test]
    fn middle_bits() {
        assert_eq!(ntp_middle_32(0x11223344, 0xAABBCCDD), 0x3344AABB);
    }
}
