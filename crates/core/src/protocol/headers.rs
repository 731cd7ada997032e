//! Typed RTSP headers (RFC 2326 §12).
//!
//! Each type parses from the raw header value and serializes back to its
//! canonical form. Multi-valued headers (Transport offers, RTP-Info
//! entries) accept comma-separated lists.

use std::net::IpAddr;

use crate::error::{Result, RtspError};

/// Lower transport requested by a `Transport` header (RFC 2326 §12.39).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// `RTP/AVP` or `RTP/AVP/UDP`.
    Udp,
    /// `RTP/AVP/TCP` — interleaved into the control connection.
    Tcp,
}

/// Delivery mode for UDP transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

/// Value of the `mode=` transport parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Play,
    Record,
}

/// Parsed `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=1234ABCD
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransportHeader {
    pub protocol: Option<TransportProtocol>,
    pub delivery: Option<Delivery>,
    /// Client RTP/RTCP port pair.
    pub client_port: Option<(u16, u16)>,
    /// Server RTP/RTCP port pair (set in the response).
    pub server_port: Option<(u16, u16)>,
    /// TCP interleaved channel pair (RTP on the even channel).
    pub interleaved: Option<(u8, u8)>,
    /// Multicast group or unicast destination address.
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub mode: Option<TransportMode>,
    /// Sender SSRC, transmitted as 8 hex digits.
    pub ssrc: Option<u32>,
}

impl TransportHeader {
    /// Parse a single transport specification (one element of the
    /// comma-separated offer list).
    pub fn parse(spec: &str) -> Result<TransportHeader> {
        let mut transport = TransportHeader::default();
        for param in spec.split(';') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param {
                "RTP/AVP" | "RTP/AVP/UDP" => transport.protocol = Some(TransportProtocol::Udp),
                "RTP/AVP/TCP" => transport.protocol = Some(TransportProtocol::Tcp),
                "unicast" => transport.delivery = Some(Delivery::Unicast),
                "multicast" => transport.delivery = Some(Delivery::Multicast),
                _ => {
                    let Some((key, value)) = param.split_once('=') else {
                        continue; // tolerate unknown flag parameters
                    };
                    match key.trim() {
                        "client_port" => transport.client_port = Some(parse_port_pair(value)?),
                        "server_port" => transport.server_port = Some(parse_port_pair(value)?),
                        "port" => transport.server_port = Some(parse_port_pair(value)?),
                        "interleaved" => transport.interleaved = Some(parse_channel_pair(value)?),
                        "destination" => {
                            transport.destination = Some(value.trim().parse().map_err(|_| {
                                RtspError::protocol(format!("invalid destination: {value}"))
                            })?);
                        }
                        "ttl" => {
                            transport.ttl = Some(value.trim().parse().map_err(|_| {
                                RtspError::protocol(format!("invalid ttl: {value}"))
                            })?);
                        }
                        "mode" => {
                            let mode = value.trim().trim_matches('"');
                            transport.mode = Some(if mode.eq_ignore_ascii_case("record") {
                                TransportMode::Record
                            } else {
                                TransportMode::Play
                            });
                        }
                        "ssrc" => {
                            transport.ssrc =
                                Some(u32::from_str_radix(value.trim(), 16).map_err(|_| {
                                    RtspError::protocol(format!("invalid ssrc: {value}"))
                                })?);
                        }
                        _ => {} // unknown parameters are ignored
                    }
                }
            }
        }
        if transport.protocol.is_none() {
            return Err(RtspError::protocol(format!("invalid transport: {spec}")));
        }
        Ok(transport)
    }

    /// Parse every offer in a comma-separated `Transport` value, dropping
    /// offers that do not parse.
    pub fn parse_offers(value: &str) -> Vec<TransportHeader> {
        value
            .split(',')
            .filter_map(|spec| TransportHeader::parse(spec).ok())
            .collect()
    }

    /// Serialize to the canonical parameter order.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(match self.protocol {
            Some(TransportProtocol::Tcp) => "RTP/AVP/TCP",
            _ => "RTP/AVP",
        });
        match self.delivery {
            Some(Delivery::Unicast) => out.push_str(";unicast"),
            Some(Delivery::Multicast) => out.push_str(";multicast"),
            None => {}
        }
        if let Some(destination) = self.destination {
            out.push_str(&format!(";destination={destination}"));
        }
        if let Some(ttl) = self.ttl {
            out.push_str(&format!(";ttl={ttl}"));
        }
        if let Some((rtp, rtcp)) = self.client_port {
            out.push_str(&format!(";client_port={rtp}-{rtcp}"));
        }
        if let Some((rtp, rtcp)) = self.server_port {
            out.push_str(&format!(";server_port={rtp}-{rtcp}"));
        }
        if let Some((rtp, rtcp)) = self.interleaved {
            out.push_str(&format!(";interleaved={rtp}-{rtcp}"));
        }
        if let Some(TransportMode::Record) = self.mode {
            out.push_str(";mode=record");
        }
        if let Some(ssrc) = self.ssrc {
            out.push_str(&format!(";ssrc={ssrc:08X}"));
        }
        out
    }
}

fn parse_port_pair(value: &str) -> Result<(u16, u16)> {
    let value = value.trim();
    // A single port is accepted and treated as an RTP/RTCP pair.
    let (rtp, rtcp) = match value.split_once('-') {
        Some((a, b)) => (a, b),
        None => {
            let port: u16 = value
                .parse()
                .map_err(|_| RtspError::protocol(format!("invalid port: {value}")))?;
            return Ok((port, port.wrapping_add(1)));
        }
    };
    let rtp = rtp
        .trim()
        .parse()
        .map_err(|_| RtspError::protocol(format!("invalid port pair: {value}")))?;
    let rtcp = rtcp
        .trim()
        .parse()
        .map_err(|_| RtspError::protocol(format!("invalid port pair: {value}")))?;
    Ok((rtp, rtcp))
}

fn parse_channel_pair(value: &str) -> Result<(u8, u8)> {
    let value = value.trim();
    let (rtp, rtcp) = match value.split_once('-') {
        Some((a, b)) => (a, b),
        None => {
            let ch: u8 = value
                .parse()
                .map_err(|_| RtspError::protocol(format!("invalid channel: {value}")))?;
            return Ok((ch, ch.wrapping_add(1)));
        }
    };
    let rtp = rtp
        .trim()
        .parse()
        .map_err(|_| RtspError::protocol(format!("invalid channel pair: {value}")))?;
    let rtcp = rtcp
        .trim()
        .parse()
        .map_err(|_| RtspError::protocol(format!("invalid channel pair: {value}")))?;
    Ok((rtp, rtcp))
}

/// Parsed `Session` header: `id[;timeout=N]` (RFC 2326 §12.37).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    /// Timeout in seconds, when advertised.
    pub timeout: Option<u64>,
}

impl SessionHeader {
    pub fn parse(value: &str) -> Result<SessionHeader> {
        let mut parts = value.split(';');
        let id = parts
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RtspError::protocol("empty Session header"))?
            .to_string();

        let mut timeout = None;
        for param in parts {
            if let Some(value) = param.trim().strip_prefix("timeout=") {
                timeout = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| RtspError::protocol(format!("invalid timeout: {value}")))?,
                );
            }
        }
        Ok(SessionHeader { id, timeout })
    }

    pub fn serialize(&self) -> String {
        match self.timeout {
            Some(timeout) => format!("{};timeout={timeout}", self.id),
            None => self.id.clone(),
        }
    }
}

/// Parsed `Range` header, npt format only (RFC 2326 §12.29).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeHeader {
    /// `npt=now-`
    NptNow,
    /// `npt=N-`
    NptFrom(f64),
    /// `npt=N-M`
    NptInterval(f64, f64),
}

impl RangeHeader {
    pub fn parse(value: &str) -> Result<RangeHeader> {
        let npt = value
            .trim()
            .strip_prefix("npt=")
            .ok_or_else(|| RtspError::Unsupported(format!("range format: {value}")))?;
        let (start, end) = npt
            .split_once('-')
            .ok_or_else(|| RtspError::protocol(format!("invalid range: {value}")))?;

        if start.trim() == "now" {
            return Ok(RangeHeader::NptNow);
        }
        let start: f64 = start
            .trim()
            .parse()
            .map_err(|_| RtspError::protocol(format!("invalid range start: {value}")))?;
        let end = end.trim();
        if end.is_empty() {
            return Ok(RangeHeader::NptFrom(start));
        }
        let end: f64 = end
            .parse()
            .map_err(|_| RtspError::protocol(format!("invalid range end: {value}")))?;
        Ok(RangeHeader::NptInterval(start, end))
    }

    pub fn serialize(&self) -> String {
        match self {
            RangeHeader::NptNow => "npt=now-".to_string(),
            RangeHeader::NptFrom(start) => format!("npt={start:.3}-"),
            RangeHeader::NptInterval(start, end) => format!("npt={start:.3}-{end:.3}"),
        }
    }
}

/// One entry of the `RTP-Info` header (RFC 2326 §12.33):
/// `url=…;seq=…;rtptime=…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: String,
    pub seq: Option<u16>,
    pub rtptime: Option<u32>,
}

impl RtpInfoEntry {
    /// Parse the full comma-separated RTP-Info value.
    pub fn parse_list(value: &str) -> Result<Vec<RtpInfoEntry>> {
        value.split(',').map(|e| RtpInfoEntry::parse(e.trim())).collect()
    }

    fn parse(entry: &str) -> Result<RtpInfoEntry> {
        let mut url = None;
        let mut seq = None;
        let mut rtptime = None;
        for param in entry.split(';') {
            let Some((key, value)) = param.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                "url" => url = Some(value.trim().to_string()),
                "seq" => {
                    seq = Some(value.trim().parse().map_err(|_| {
                        RtspError::protocol(format!("invalid RTP-Info seq: {value}"))
                    })?);
                }
                "rtptime" => {
                    rtptime = Some(value.trim().parse().map_err(|_| {
                        RtspError::protocol(format!("invalid RTP-Info rtptime: {value}"))
                    })?);
                }
                _ => {}
            }
        }
        Ok(RtpInfoEntry {
            url: url.ok_or_else(|| RtspError::protocol("RTP-Info entry without url"))?,
            seq,
            rtptime,
        })
    }

    pub fn serialize_list(entries: &[RtpInfoEntry]) -> String {
        entries
            .iter()
            .map(|e| {
                let mut out = format!("url={}", e.url);
                if let Some(seq) = e.seq {
                    out.push_str(&format!(";seq={seq}"));
                }
                if let Some(rtptime) = e.rtptime {
                    out.push_str(&format!(";rtptime={rtptime}"));
                }
                out
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_transport() {
        let t = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
        assert_eq!(t.protocol, Some(TransportProtocol::Udp));
        assert_eq!(t.delivery, Some(Delivery::Unicast));
        assert_eq!(t.client_port, Some((8000, 8001)));
        assert_eq!(t.interleaved, None);
    }

    #[test]
    fn parse_tcp_transport() {
        let t = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(t.protocol, Some(TransportProtocol::Tcp));
        assert_eq!(t.interleaved, Some((0, 1)));
    }

    #[test]
    fn parse_multicast_response() {
        let t = TransportHeader::parse("RTP/AVP;multicast;destination=224.2.0.1;ttl=16;port=9000-9001")
            .unwrap();
        assert_eq!(t.delivery, Some(Delivery::Multicast));
        assert_eq!(t.destination, Some("224.2.0.1".parse().unwrap()));
        assert_eq!(t.ttl, Some(16));
        assert_eq!(t.server_port, Some((9000, 9001)));
    }

    #[test]
    fn parse_mode_and_ssrc() {
        let t = TransportHeader::parse("RTP/AVP;unicast;mode=record;ssrc=1234ABCD").unwrap();
        assert_eq!(t.mode, Some(TransportMode::Record));
        assert_eq!(t.ssrc, Some(0x1234ABCD));
    }

    #[test]
    fn parse_offers_picks_valid() {
        let offers =
            TransportHeader::parse_offers("RTP/AVP/TCP;unicast;interleaved=0-1,RTP/AVP;unicast");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].protocol, Some(TransportProtocol::Tcp));
        assert_eq!(offers[1].protocol, Some(TransportProtocol::Udp));
    }

    #[test]
    fn transport_round_trip() {
        let value = "RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001";
        let t = TransportHeader::parse(value).unwrap();
        assert_eq!(t.serialize(), value);
    }

    #[test]
    fn missing_protocol_is_error() {
        assert!(TransportHeader::parse("unicast;client_port=8000-8001").is_err());
    }

    #[test]
    fn session_with_timeout() {
        let s = SessionHeader::parse("ABCD1234;timeout=30").unwrap();
        assert_eq!(s.id, "ABCD1234");
        assert_eq!(s.timeout, Some(30));
        assert_eq!(s.serialize(), "ABCD1234;timeout=30");
    }

    #[test]
    fn session_without_timeout() {
        let s = SessionHeader::parse("ABCD1234").unwrap();
        assert_eq!(s.timeout, None);
        assert_eq!(s.serialize(), "ABCD1234");
    }

    #[test]
    fn range_now() {
        assert_eq!(RangeHeader::parse("npt=now-").unwrap(), RangeHeader::NptNow);
    }

    #[test]
    fn range_from() {
        assert_eq!(
            RangeHeader::parse("npt=2.5-").unwrap(),
            RangeHeader::NptFrom(2.5)
        );
        assert_eq!(RangeHeader::NptFrom(2.5).serialize(), "npt=2.500-");
    }

    #[test]
    fn range_interval() {
        assert_eq!(
            RangeHeader::parse("npt=0-7.74").unwrap(),
            RangeHeader::NptInterval(0.0, 7.74)
        );
    }

    #[test]
    fn range_smpte_unsupported() {
        assert!(matches!(
            RangeHeader::parse("smpte=0:10:20-"),
            Err(RtspError::Unsupported(_))
        ));
    }

    #[test]
    fn rtp_info_list() {
        let entries = RtpInfoEntry::parse_list(
            "url=rtsp://host/stream/trackID=0;seq=100;rtptime=9000,url=rtsp://host/stream/trackID=1;seq=5",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, Some(100));
        assert_eq!(entries[0].rtptime, Some(9000));
        assert_eq!(entries[1].seq, Some(5));
        assert_eq!(entries[1].rtptime, None);

        let out = RtpInfoEntry::serialize_list(&entries);
        assert_eq!(RtpInfoEntry::parse_list(&out).unwrap(), entries);
    }
}
