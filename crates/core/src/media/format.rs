//! RTP payload format descriptors.

use base64::prelude::{BASE64_STANDARD, Engine as _};

/// A payload format: everything the core needs to know about a codec
/// without understanding its bitstream.
///
/// Static payload types (RFC 3551 §6) have fixed clock rates and may omit
/// `a=rtpmap`; dynamic types (96–127) are described by rtpmap/fmtp
/// attributes. Unrecognized encodings fall back to [`Generic`](Self::Generic)
/// so a session can still be set up and forwarded packet-for-packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    H264 {
        payload_type: u8,
        /// Decoded `sprop-parameter-sets` (SPS), when the SDP carried it.
        sps: Option<Vec<u8>>,
        /// Decoded `sprop-parameter-sets` (PPS), when the SDP carried it.
        pps: Option<Vec<u8>>,
        packetization_mode: u8,
    },
    H265 {
        payload_type: u8,
        vps: Option<Vec<u8>>,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
    },
    Vp8 {
        payload_type: u8,
    },
    Vp9 {
        payload_type: u8,
    },
    Opus {
        payload_type: u8,
        channels: u8,
    },
    G722,
    /// G.711 µ-law (PCMU, static PT 0) or A-law (PCMA, static PT 8).
    G711 {
        mu_law: bool,
    },
    Mpeg4Audio {
        payload_type: u8,
        clock_rate: u32,
        channels: u8,
        /// LATM framing (`MP4A-LATM`) vs `mpeg4-generic`.
        latm: bool,
    },
    Lpcm {
        payload_type: u8,
        bit_depth: u8,
        sample_rate: u32,
        channels: u8,
    },
    /// Any other encoding: carried opaquely so packets can still flow.
    Generic {
        payload_type: u8,
        clock_rate: u32,
        encoding: String,
        fmtp: Option<String>,
    },
}

impl Format {
    /// H.264 with the conventional dynamic payload type defaults.
    pub fn h264(payload_type: u8) -> Format {
        Format::H264 {
            payload_type,
            sps: None,
            pps: None,
            packetization_mode: 1,
        }
    }

    /// RTP payload type byte.
    pub fn payload_type(&self) -> u8 {
        match self {
            Format::H264 { payload_type, .. }
            | Format::H265 { payload_type, .. }
            | Format::Vp8 { payload_type }
            | Format::Vp9 { payload_type }
            | Format::Opus { payload_type, .. }
            | Format::Mpeg4Audio { payload_type, .. }
            | Format::Lpcm { payload_type, .. }
            | Format::Generic { payload_type, .. } => *payload_type,
            Format::G722 => 9,
            Format::G711 { mu_law: true } => 0,
            Format::G711 { mu_law: false } => 8,
        }
    }

    /// RTP clock rate in Hz, which drives RTCP timestamp arithmetic.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::H264 { .. }
            | Format::H265 { .. }
            | Format::Vp8 { .. }
            | Format::Vp9 { .. } => 90000,
            Format::Opus { .. } => 48000,
            // G.722's rtpmap says 8000 even though it samples at 16 kHz
            // (RFC 3551 §4.5.2).
            Format::G722 => 8000,
            Format::G711 { .. } => 8000,
            Format::Mpeg4Audio { clock_rate, .. } => *clock_rate,
            Format::Lpcm { sample_rate, .. } => *sample_rate,
            Format::Generic { clock_rate, .. } => *clock_rate,
        }
    }

    /// Encoding name as it appears in `a=rtpmap`.
    pub fn encoding_name(&self) -> String {
        match self {
            Format::H264 { .. } => "H264".into(),
            Format::H265 { .. } => "H265".into(),
            Format::Vp8 { .. } => "VP8".into(),
            Format::Vp9 { .. } => "VP9".into(),
            Format::Opus { .. } => "opus".into(),
            Format::G722 => "G722".into(),
            Format::G711 { mu_law: true } => "PCMU".into(),
            Format::G711 { mu_law: false } => "PCMA".into(),
            Format::Mpeg4Audio { latm: true, .. } => "MP4A-LATM".into(),
            Format::Mpeg4Audio { latm: false, .. } => "mpeg4-generic".into(),
            Format::Lpcm { bit_depth, .. } => format!("L{bit_depth}"),
            Format::Generic { encoding, .. } => encoding.clone(),
        }
    }

    /// Opaque codec identifier for wiring user-side encoders/decoders.
    pub fn codec_id(&self) -> &'static str {
        match self {
            Format::H264 { .. } => "h264",
            Format::H265 { .. } => "h265",
            Format::Vp8 { .. } => "vp8",
            Format::Vp9 { .. } => "vp9",
            Format::Opus { .. } => "opus",
            Format::G722 => "g722",
            Format::G711 { .. } => "g711",
            Format::Mpeg4Audio { .. } => "mpeg4-audio",
            Format::Lpcm { .. } => "lpcm",
            Format::Generic { .. } => "generic",
        }
    }

    /// `a=rtpmap` attribute value, e.g. `96 H264/90000`.
    pub fn rtpmap(&self) -> String {
        let channels = match self {
            Format::Opus { channels, .. } | Format::Mpeg4Audio { channels, .. } => Some(*channels),
            Format::Lpcm { channels, .. } => Some(*channels),
            _ => None,
        };
        match channels {
            Some(channels) => format!(
                "{} {}/{}/{}",
                self.payload_type(),
                self.encoding_name(),
                self.clock_rate(),
                channels
            ),
            None => format!(
                "{} {}/{}",
                self.payload_type(),
                self.encoding_name(),
                self.clock_rate()
            ),
        }
    }

    /// `a=fmtp` attribute value, when the format has codec parameters.
    pub fn fmtp(&self) -> Option<String> {
        match self {
            Format::H264 {
                payload_type,
                sps,
                pps,
                packetization_mode,
            } => {
                let mut out = format!("{payload_type} packetization-mode={packetization_mode}");
                if let (Some(sps), Some(pps)) = (sps, pps) {
                    out.push_str(&format!(
                        ";sprop-parameter-sets={},{}",
                        BASE64_STANDARD.encode(sps),
                        BASE64_STANDARD.encode(pps)
                    ));
                }
                Some(out)
            }
            Format::Generic {
                payload_type,
                fmtp: Some(fmtp),
                ..
            } => Some(format!("{payload_type} {fmtp}")),
            _ => None,
        }
    }

    /// Build a format from SDP media description attributes.
    ///
    /// `rtpmap`/`fmtp` are the attribute values with the payload type
    /// prefix already stripped. Unknown encodings land on
    /// [`Generic`](Self::Generic); a missing rtpmap on a dynamic payload
    /// type produces a Generic with clock rate 90000.
    pub fn from_description(payload_type: u8, rtpmap: Option<&str>, fmtp: Option<&str>) -> Format {
        // Static payload types carry implicit encodings (RFC 3551 §6).
        if rtpmap.is_none() {
            match payload_type {
                0 => return Format::G711 { mu_law: true },
                8 => return Format::G711 { mu_law: false },
                9 => return Format::G722,
                _ => {}
            }
        }

        let rtpmap = rtpmap.unwrap_or("");
        let mut parts = rtpmap.trim().split('/');
        let encoding = parts.next().unwrap_or("").trim();
        let clock_rate: u32 = parts
            .next()
            .and_then(|r| r.trim().parse().ok())
            .unwrap_or(90000);
        let channels: u8 = parts
            .next()
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(1);

        if encoding.eq_ignore_ascii_case("H264") {
            let (sps, pps) = fmtp.map(parse_h264_sprop).unwrap_or((None, None));
            let packetization_mode = fmtp
                .and_then(|f| fmtp_param(f, "packetization-mode"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return Format::H264 {
                payload_type,
                sps,
                pps,
                packetization_mode,
            };
        }
        if encoding.eq_ignore_ascii_case("H265") {
            let sprop = |name| {
                fmtp.and_then(|f| fmtp_param(f, name))
                    .and_then(|v| BASE64_STANDARD.decode(v).ok())
            };
            return Format::H265 {
                payload_type,
                vps: sprop("sprop-vps"),
                sps: sprop("sprop-sps"),
                pps: sprop("sprop-pps"),
            };
        }
        if encoding.eq_ignore_ascii_case("VP8") {
            return Format::Vp8 { payload_type };
        }
        if encoding.eq_ignore_ascii_case("VP9") {
            return Format::Vp9 { payload_type };
        }
        if encoding.eq_ignore_ascii_case("opus") {
            return Format::Opus {
                payload_type,
                channels,
            };
        }
        if encoding.eq_ignore_ascii_case("G722") {
            return Format::G722;
        }
        if encoding.eq_ignore_ascii_case("PCMU") {
            return Format::G711 { mu_law: true };
        }
        if encoding.eq_ignore_ascii_case("PCMA") {
            return Format::G711 { mu_law: false };
        }
        if encoding.eq_ignore_ascii_case("mpeg4-generic") || encoding.eq_ignore_ascii_case("MP4A-LATM")
        {
            return Format::Mpeg4Audio {
                payload_type,
                clock_rate,
                channels,
                latm: encoding.eq_ignore_ascii_case("MP4A-LATM"),
            };
        }
        if let Some(bit_depth) = encoding
            .strip_prefix('L')
            .and_then(|d| d.parse::<u8>().ok())
            .filter(|d| matches!(d, 8 | 16 | 24))
        {
            return Format::Lpcm {
                payload_type,
                bit_depth,
                sample_rate: clock_rate,
                channels,
            };
        }

        Format::Generic {
            payload_type,
            clock_rate,
            encoding: encoding.to_string(),
            fmtp: fmtp.map(str::to_string),
        }
    }
}

/// Extract a `key=value` parameter from a semicolon-separated fmtp value.
fn fmtp_param<'a>(fmtp: &'a str, key: &str) -> Option<&'a str> {
    fmtp.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn parse_h264_sprop(fmtp: &str) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let Some(sets) = fmtp_param(fmtp, "sprop-parameter-sets") else {
        return (None, None);
    };
    let mut parts = sets.split(',');
    let sps = parts.next().and_then(|s| BASE64_STANDARD.decode(s).ok());
    let pps = parts.next().and_then(|s| BASE64_STANDARD.decode(s).ok());
    (sps, pps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_from_description() {
        let f = Format::from_description(
            96,
            Some("H264/90000"),
            Some("packetization-mode=1;sprop-parameter-sets=Z2QAKq2EAQwgCGEAQwgCGEAQwgCEK1A=,aO48sA=="),
        );
        let Format::H264 {
            payload_type,
            sps,
            pps,
            packetization_mode,
        } = &f
        else {
            panic!("expected H264, got {f:?}");
        };
        assert_eq!(*payload_type, 96);
        assert_eq!(*packetization_mode, 1);
        assert!(sps.is_some());
        assert!(pps.is_some());
        assert_eq!(f.clock_rate(), 90000);
    }

    #[test]
    fn static_payload_types() {
        assert_eq!(
            Format::from_description(0, None, None),
            Format::G711 { mu_law: true }
        );
        assert_eq!(
            Format::from_description(8, None, None),
            Format::G711 { mu_law: false }
        );
        assert_eq!(Format::from_description(9, None, None), Format::G722);
        assert_eq!(Format::G711 { mu_law: true }.payload_type(), 0);
        assert_eq!(Format::G722.clock_rate(), 8000);
    }

    #[test]
    fn opus_channels() {
        let f = Format::from_description(111, Some("opus/48000/2"), None);
        assert_eq!(
            f,
            Format::Opus {
                payload_type: 111,
                channels: 2
            }
        );
        assert_eq!(f.rtpmap(), "111 opus/48000/2");
    }

    #[test]
    fn lpcm_from_rtpmap() {
        let f = Format::from_description(97, Some("L16/44100/2"), None);
        assert_eq!(
            f,
            Format::Lpcm {
                payload_type: 97,
                bit_depth: 16,
                sample_rate: 44100,
                channels: 2
            }
        );
    }

    #[test]
    fn unknown_encoding_is_generic() {
        let f = Format::from_description(98, Some("speex/16000"), Some("vbr=on"));
        let Format::Generic {
            encoding,
            clock_rate,
            fmtp,
            ..
        } = &f
        else {
            panic!("expected generic, got {f:?}");
        };
        assert_eq!(encoding, "speex");
        assert_eq!(*clock_rate, 16000);
        assert_eq!(fmtp.as_deref(), Some("vbr=on"));
    }

    #[test]
    fn h264_fmtp_emission() {
        let f = Format::h264(96);
        assert_eq!(f.fmtp().as_deref(), Some("96 packetization-mode=1"));
        assert_eq!(f.rtpmap(), "96 H264/90000");
    }
}
