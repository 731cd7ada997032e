//! Media descriptions and RTP payload formats.
//!
//! A [`Media`] is one `m=` section of an SDP description: a kind
//! (audio/video/application), a control attribute used to build SETUP
//! targets, and one or more payload [`Format`]s.
//!
//! [`Format`] is a closed sum over the payload formats this library can
//! describe. Only each format's identity on the wire matters here —
//! payload type, clock rate, SDP attribute lines; packetizers and
//! depacketizers consume these descriptors but live outside this crate.

mod format;

pub use format::Format;

/// Media type from the SDP `m=` line (RFC 4566 §5.14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Application => "application",
        }
    }

    pub fn from_token(token: &str) -> Option<MediaKind> {
        Some(match token {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "application" => MediaKind::Application,
            _ => return None,
        })
    }
}

/// One media stream of a presentation.
#[derive(Debug, Clone)]
pub struct Media {
    pub kind: MediaKind,
    /// `a=control` attribute: absolute URL or fragment relative to the
    /// presentation base URL. Empty when the description carried none.
    pub control: String,
    pub formats: Vec<Format>,
}

impl Media {
    pub fn new(kind: MediaKind, formats: Vec<Format>) -> Self {
        Media {
            kind,
            control: String::new(),
            formats,
        }
    }

    pub fn with_control(mut self, control: impl Into<String>) -> Self {
        self.control = control.into();
        self
    }

    /// Format with the given payload type, if the media carries it.
    pub fn format_by_payload_type(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type() == payload_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_lookup_by_payload_type() {
        let media = Media::new(
            MediaKind::Video,
            vec![Format::h264(96), Format::Vp8 { payload_type: 97 }],
        );
        assert!(matches!(
            media.format_by_payload_type(97),
            Some(Format::Vp8 { .. })
        ));
        assert!(media.format_by_payload_type(98).is_none());
    }
}
