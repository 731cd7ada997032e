//! SDP session descriptions (RFC 4566 / RFC 8866).
//!
//! Only the fields the core consumes are understood: `v=`, `o=`, `s=`,
//! `c=`, `m=`, `a=rtpmap`, `a=fmtp`, `a=control`. Everything else is
//! carried past without interpretation.
//!
//! ## Generated format
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1                ← codec parameters
//! a=control:trackID=0                           ← track control URL
//! ```

use crate::error::{Result, RtspError};
use crate::media::{Format, Media, MediaKind};

/// Parse an SDP body into its media description list.
///
/// Media sections without a control attribute keep an empty control; the
/// session-level `a=control` (when present) is returned separately so
/// callers can resolve it against the base URL.
pub fn parse(body: &[u8]) -> Result<Vec<Media>> {
    let text = std::str::from_utf8(body)
        .map_err(|_| RtspError::protocol("SDP body is not UTF-8"))?;

    let mut medias = Vec::new();
    let mut current: Option<MediaBuilder> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((kind, value)) = line.split_once('=') else {
            continue;
        };
        match kind {
            "m" => {
                if let Some(builder) = current.take() {
                    medias.push(builder.finish());
                }
                current = Some(MediaBuilder::parse(value)?);
            }
            "a" => {
                let Some(builder) = current.as_mut() else {
                    continue; // session-level attribute
                };
                builder.attribute(value);
            }
            _ => {}
        }
    }
    if let Some(builder) = current.take() {
        medias.push(builder.finish());
    }

    if medias.is_empty() {
        return Err(RtspError::protocol("SDP without media sections"));
    }
    Ok(medias)
}

struct MediaBuilder {
    kind: MediaKind,
    control: String,
    payload_types: Vec<u8>,
    rtpmaps: Vec<(u8, String)>,
    fmtps: Vec<(u8, String)>,
}

impl MediaBuilder {
    /// Parse an `m=` value: `<media> <port> <proto> <fmt list>`.
    fn parse(value: &str) -> Result<MediaBuilder> {
        let mut parts = value.split_whitespace();
        let kind = parts
            .next()
            .and_then(MediaKind::from_token)
            .ok_or_else(|| RtspError::protocol(format!("invalid m= line: {value}")))?;
        let _port = parts.next();
        let _proto = parts.next();
        let payload_types = parts.filter_map(|pt| pt.parse().ok()).collect();
        Ok(MediaBuilder {
            kind,
            control: String::new(),
            payload_types,
            rtpmaps: Vec::new(),
            fmtps: Vec::new(),
        })
    }

    fn attribute(&mut self, value: &str) {
        if let Some(control) = value.strip_prefix("control:") {
            self.control = control.trim().to_string();
        } else if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
            if let Some((pt, map)) = split_payload_attr(rtpmap) {
                self.rtpmaps.push((pt, map));
            }
        } else if let Some(fmtp) = value.strip_prefix("fmtp:") {
            if let Some((pt, params)) = split_payload_attr(fmtp) {
                self.fmtps.push((pt, params));
            }
        }
    }

    fn finish(self) -> Media {
        let formats = self
            .payload_types
            .iter()
            .map(|&pt| {
                let rtpmap = self.rtpmaps.iter().find(|(p, _)| *p == pt);
                let fmtp = self.fmtps.iter().find(|(p, _)| *p == pt);
                Format::from_description(
                    pt,
                    rtpmap.map(|(_, v)| v.as_str()),
                    fmtp.map(|(_, v)| v.as_str()),
                )
            })
            .collect();
        Media {
            kind: self.kind,
            control: self.control,
            formats,
        }
    }
}

/// Split `"96 H264/90000"` into `(96, "H264/90000")`.
fn split_payload_attr(value: &str) -> Option<(u8, String)> {
    let (pt, rest) = value.trim().split_once(' ')?;
    Some((pt.trim().parse().ok()?, rest.trim().to_string()))
}

/// Origin and session naming fields for generated descriptions.
#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub session_name: String,
}

impl Default for SdpOrigin {
    fn default() -> Self {
        SdpOrigin {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            session_name: "Stream".to_string(),
        }
    }
}

/// Generate an SDP session description for the given media list.
///
/// Media controls must already be assigned (the server assigns
/// `trackID=N` at stream registration).
pub fn generate(medias: &[Media], ip: &str, origin: &SdpOrigin) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        origin.username, origin.session_id, origin.session_version, ip
    ));
    sdp.push(format!("s={}", origin.session_name));
    sdp.push(format!("c=IN IP4 {ip}"));
    sdp.push("t=0 0".to_string());

    for media in medias {
        let pts: Vec<String> = media
            .formats
            .iter()
            .map(|f| f.payload_type().to_string())
            .collect();
        sdp.push(format!(
            "m={} 0 RTP/AVP {}",
            media.kind.as_str(),
            pts.join(" ")
        ));
        for format in &media.formats {
            sdp.push(format!("a=rtpmap:{}", format.rtpmap()));
            if let Some(fmtp) = format.fmtp() {
                sdp.push(format!("a=fmtp:{fmtp}"));
            }
        }
        if !media.control.is_empty() {
            sdp.push(format!("a=control:{}", media.control));
        }
    }

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_video() {
        let body = b"v=0\r\n\
                     o=- 0 0 IN IP4 192.168.1.10\r\n\
                     s=Stream\r\n\
                     c=IN IP4 192.168.1.10\r\n\
                     t=0 0\r\n\
                     m=video 0 RTP/AVP 96\r\n\
                     a=rtpmap:96 H264/90000\r\n\
                     a=fmtp:96 packetization-mode=1\r\n\
                     a=control:trackID=0\r\n";
        let medias = parse(body).unwrap();
        assert_eq!(medias.len(), 1);
        assert_eq!(medias[0].kind, MediaKind::Video);
        assert_eq!(medias[0].control, "trackID=0");
        assert_eq!(medias[0].formats.len(), 1);
        assert_eq!(medias[0].formats[0].payload_type(), 96);
        assert!(matches!(medias[0].formats[0], Format::H264 { .. }));
    }

    #[test]
    fn parse_audio_video() {
        let body = b"v=0\r\n\
                     s=-\r\n\
                     m=video 0 RTP/AVP 96\r\n\
                     a=rtpmap:96 VP9/90000\r\n\
                     a=control:trackID=0\r\n\
                     m=audio 0 RTP/AVP 111 0\r\n\
                     a=rtpmap:111 opus/48000/2\r\n\
                     a=control:trackID=1\r\n";
        let medias = parse(body).unwrap();
        assert_eq!(medias.len(), 2);
        assert!(matches!(medias[0].formats[0], Format::Vp9 { .. }));
        assert_eq!(medias[1].formats.len(), 2);
        assert!(matches!(
            medias[1].formats[0],
            Format::Opus {
                payload_type: 111,
                channels: 2
            }
        ));
        assert_eq!(medias[1].formats[1], Format::G711 { mu_law: true });
    }

    #[test]
    fn parse_without_media_is_error() {
        assert!(parse(b"v=0\r\ns=Nothing\r\n").is_err());
    }

    #[test]
    fn generate_round_trips_through_parse() {
        let medias = vec![
            Media::new(MediaKind::Video, vec![Format::h264(96)]).with_control("trackID=0"),
            Media::new(
                MediaKind::Audio,
                vec![Format::Opus {
                    payload_type: 111,
                    channels: 2,
                }],
            )
            .with_control("trackID=1"),
        ];
        let sdp = generate(&medias, "10.0.0.1", &SdpOrigin::default());

        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=- 0 0 IN IP4 10.0.0.1\r\n"));
        assert!(sdp.contains("c=IN IP4 10.0.0.1\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("m=audio 0 RTP/AVP 111\r\n"));
        assert!(sdp.ends_with("\r\n"));

        // rtpmap precedes fmtp within the media section
        let rtpmap_idx = sdp.find("a=rtpmap:96").unwrap();
        let fmtp_idx = sdp.find("a=fmtp:96").unwrap();
        assert!(rtpmap_idx < fmtp_idx);

        let parsed = parse(sdp.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].control, "trackID=0");
        assert_eq!(parsed[1].formats[0].clock_rate(), 48000);
    }
}
