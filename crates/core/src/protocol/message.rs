//! RTSP message codec: requests, responses, and interleaved frames on a
//! shared byte stream (RFC 2326 §4, §10.12).

use std::io::BufRead;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Maximum accepted header/start line length in bytes.
pub const MAX_LINE_LEN: usize = 4096;
/// Maximum accepted header count per message.
pub const MAX_HEADERS: usize = 255;
/// Maximum interleaved frame payload (the length field is 16-bit).
pub const MAX_FRAME_PAYLOAD: usize = 65535;

/// Marker byte introducing an interleaved frame (RFC 2326 §10.12).
const FRAME_MARKER: u8 = b'$';

const RTSP_VERSION: &str = "RTSP/1.0";

/// RTSP method (RFC 2326 §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Record,
    Teardown,
    GetParameter,
    SetParameter,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Record => "RECORD",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Options => "OPTIONS",
        }
    }

    pub fn from_token(token: &str) -> Option<Method> {
        Some(match token {
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "RECORD" => Method::Record,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "OPTIONS" => Method::Options,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header collection.
///
/// Names are stored as received and serialized back unchanged; lookups are
/// case-insensitive per RFC 2326 §4.2. A name may appear multiple times —
/// [`values`](Self::values) returns every occurrence in order.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing occurrences.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed CSeq value (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<u32> {
        self.get("CSeq").and_then(|v| v.trim().parse().ok())
    }
}

/// A parsed RTSP request (RFC 2326 §6).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request-URI as received (`rtsp://…` or `*`).
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Request {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Serialize to the RTSP wire format.
    ///
    /// Header order per convention: CSeq first, Session second (when
    /// present), remaining headers in insertion order, Content-Length last
    /// when a body is present.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method.as_str(), self.uri, RTSP_VERSION).as_bytes(),
        );
        write_headers_and_body(&mut out, &self.headers, &self.body);
        out
    }
}

/// An RTSP response (RFC 2326 §7).
///
/// Built with chained [`with_header`](Self::with_header) /
/// [`with_body`](Self::with_body) calls, then serialized.
/// `Content-Length` is computed at serialization time. The CSeq header
/// must echo the request's CSeq.
#[must_use]
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &str) -> Self {
        Response {
            status,
            reason: reason.to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// 200 OK (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 404 Not Found.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 400 Bad Request.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 401 Unauthorized.
    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    /// 454 Session Not Found.
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 455 Method Not Valid in This State.
    pub fn method_not_valid() -> Self {
        Self::new(455, "Method Not Valid in This State")
    }

    /// 461 Unsupported Transport.
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body;
        self
    }

    /// Serialize to the RTSP wire format. Same header ordering rules as
    /// [`Request::serialize`].
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", RTSP_VERSION, self.status, self.reason).as_bytes(),
        );
        write_headers_and_body(&mut out, &self.headers, &self.body);
        out
    }
}

/// An RTP or RTCP packet framed inside the RTSP TCP connection
/// (RFC 2326 §10.12).
///
/// ```text
/// +---------+---------+-------------+-------------------+
/// | "$" (1) | channel | length (2)  | payload           |
/// +---------+---------+-------------+-------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl InterleavedFrame {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(FRAME_MARKER);
        out.push(self.channel);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// One token from the control stream: a text message or a binary frame.
#[derive(Debug)]
pub enum ControlMessage {
    Request(Request),
    Response(Response),
    Frame(InterleavedFrame),
}

/// Read the next message or interleaved frame from the control stream.
///
/// The reader makes no alignment assumption: at every position the next
/// byte is either `$` (frame) or the start of a text message. Requests and
/// responses are told apart by the start line (`RTSP/` prefix means
/// response). Returns [`RtspError::Closed`] on a clean EOF at a message
/// boundary; anything else that prevents a complete parse is a fatal
/// [`RtspError::Protocol`].
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<ControlMessage> {
    let first = loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Err(RtspError::Closed);
        }
        break buf[0];
    };

    if first == FRAME_MARKER {
        return read_frame(reader).map(ControlMessage::Frame);
    }

    let start_line = read_line(reader)?.ok_or(RtspError::Protocol {
        kind: ParseErrorKind::UnexpectedEof,
    })?;
    let headers = read_headers(reader)?;
    let body = read_body(reader, &headers)?;

    if let Some(rest) = start_line.strip_prefix("RTSP/") {
        // Response: RTSP/1.0 SP status SP reason
        let mut parts = rest.splitn(3, ' ');
        let _version = parts.next();
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(RtspError::Protocol {
                kind: ParseErrorKind::InvalidStartLine,
            })?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(ControlMessage::Response(Response {
            status,
            reason,
            headers,
            body,
        }));
    }

    // Request: method SP uri SP version
    let mut parts = start_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => {
            return Err(RtspError::Protocol {
                kind: ParseErrorKind::InvalidStartLine,
            });
        }
    };
    if !version.starts_with("RTSP/") {
        return Err(RtspError::Protocol {
            kind: ParseErrorKind::InvalidStartLine,
        });
    }
    if version != RTSP_VERSION {
        tracing::warn!(version, "peer sent non-RTSP/1.0 version");
    }

    // The message is fully consumed at this point, so an unknown method
    // leaves the stream aligned and the caller free to answer 501.
    let method = Method::from_token(method)
        .ok_or_else(|| RtspError::Unsupported(format!("method {method}")))?;

    Ok(ControlMessage::Request(Request {
        method,
        uri: uri.to_string(),
        headers,
        body,
    }))
}

fn read_frame<R: BufRead>(reader: &mut R) -> Result<InterleavedFrame> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head)?;
    let channel = head[1];
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(InterleavedFrame { channel, payload })
}

/// Read one CRLF-terminated line, enforcing [`MAX_LINE_LEN`].
/// Returns `None` on EOF before any byte.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut raw = Vec::with_capacity(64);
    let mut limited = <&mut R as std::io::Read>::take(reader, MAX_LINE_LEN as u64 + 1);
    let n = limited.read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Ok(None);
    }
    if raw.len() > MAX_LINE_LEN {
        return Err(RtspError::Protocol {
            kind: ParseErrorKind::LineTooLong,
        });
    }
    if raw.last() != Some(&b'\n') {
        return Err(RtspError::Protocol {
            kind: ParseErrorKind::UnexpectedEof,
        });
    }
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8(raw).map(Some).map_err(|_| RtspError::Protocol {
        kind: ParseErrorKind::Invalid("non-UTF-8 header line".into()),
    })
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader)?.ok_or(RtspError::Protocol {
            kind: ParseErrorKind::UnexpectedEof,
        })?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(RtspError::Protocol {
                kind: ParseErrorKind::TooManyHeaders,
            });
        }

        // Continuation line (leading SP/HT) extends the previous value.
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.entries.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => {
                    return Err(RtspError::Protocol {
                        kind: ParseErrorKind::InvalidHeader,
                    });
                }
            }
        }

        let colon = line.find(':').ok_or(RtspError::Protocol {
            kind: ParseErrorKind::InvalidHeader,
        })?;
        let name = line[..colon].trim().to_string();
        let value = line[colon + 1..].trim().to_string();
        headers.add(name, value);
    }
}

fn read_body<R: BufRead>(reader: &mut R, headers: &HeaderMap) -> Result<Vec<u8>> {
    // Absent Content-Length means no body: the connection is persistent,
    // so body-to-EOF framing is never used.
    let len: usize = match headers.get("Content-Length") {
        Some(v) => v.trim().parse().map_err(|_| RtspError::Protocol {
            kind: ParseErrorKind::Invalid("invalid Content-Length".into()),
        })?,
        None => return Ok(Vec::new()),
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

fn write_headers_and_body(out: &mut Vec<u8>, headers: &HeaderMap, body: &[u8]) {
    // CSeq first, Session second, others in insertion order,
    // Content-Length last.
    if let Some(cseq) = headers.get("CSeq") {
        out.extend_from_slice(format!("CSeq: {cseq}\r\n").as_bytes());
    }
    if let Some(session) = headers.get("Session") {
        out.extend_from_slice(format!("Session: {session}\r\n").as_bytes());
    }
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("CSeq")
            || name.eq_ignore_ascii_case("Session")
            || name.eq_ignore_ascii_case("Content-Length")
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn read_all(bytes: &[u8]) -> Vec<ControlMessage> {
        let mut reader = BufReader::new(bytes);
        let mut out = Vec::new();
        loop {
            match read_message(&mut reader) {
                Ok(msg) => out.push(msg),
                Err(RtspError::Closed) => return out,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn parse_options_request() {
        let raw = b"OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let msgs = read_all(raw);
        assert_eq!(msgs.len(), 1);
        let ControlMessage::Request(req) = &msgs[0] else {
            panic!("expected request");
        };
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.uri, "rtsp://localhost:8554/test");
        assert_eq!(req.headers.cseq(), Some(1));
    }

    #[test]
    fn parse_response_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: 5\r\n\r\nv=0\r\n";
        let msgs = read_all(raw);
        let ControlMessage::Response(resp) = &msgs[0] else {
            panic!("expected response");
        };
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body, b"v=0\r\n");
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = b"OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let msgs = read_all(raw);
        let ControlMessage::Request(req) = &msgs[0] else {
            panic!("expected request");
        };
        assert_eq!(req.headers.get("CSeq"), Some("42"));
        assert_eq!(req.headers.get("CSEQ"), Some("42"));
    }

    #[test]
    fn header_continuation_line() {
        let raw =
            b"OPTIONS rtsp://localhost RTSP/1.0\r\nCSeq: 1\r\nX-Long: first\r\n second\r\n\r\n";
        let msgs = read_all(raw);
        let ControlMessage::Request(req) = &msgs[0] else {
            panic!("expected request");
        };
        assert_eq!(req.headers.get("X-Long"), Some("first second"));
    }

    #[test]
    fn unknown_method_is_unsupported_and_consumed() {
        let raw = b"FLY rtsp://localhost RTSP/1.0\r\nCSeq: 1\r\n\r\nOPTIONS rtsp://localhost RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_message(&mut reader),
            Err(RtspError::Unsupported(_))
        ));
        // The stream stays aligned: the next message parses cleanly.
        let ControlMessage::Request(req) = read_message(&mut reader).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.headers.cseq(), Some(2));
    }

    #[test]
    fn interleaved_frames_mixed_with_messages_in_order() {
        let mut raw = Vec::new();
        raw.extend_from_slice(
            &InterleavedFrame {
                channel: 0,
                payload: vec![1, 2, 3],
            }
            .serialize(),
        );
        raw.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 9\r\n\r\n");
        raw.extend_from_slice(
            &InterleavedFrame {
                channel: 1,
                payload: vec![0x24, 0x24],
            }
            .serialize(),
        );

        let msgs = read_all(&raw);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(
            &msgs[0],
            ControlMessage::Frame(f) if f.channel == 0 && f.payload == vec![1, 2, 3]
        ));
        assert!(matches!(&msgs[1], ControlMessage::Response(r) if r.headers.cseq() == Some(9)));
        assert!(matches!(
            &msgs[2],
            ControlMessage::Frame(f) if f.channel == 1 && f.payload == vec![0x24, 0x24]
        ));
    }

    #[test]
    fn frame_round_trip() {
        let frame = InterleavedFrame {
            channel: 4,
            payload: (0..=255u8).collect(),
        };
        let bytes = frame.serialize();
        assert_eq!(bytes[0], b'$');
        assert_eq!(bytes[1], 4);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 256);

        let msgs = read_all(&bytes);
        assert!(matches!(&msgs[0], ControlMessage::Frame(f) if *f == frame));
    }

    #[test]
    fn request_serialize_header_order() {
        let mut req = Request::new(Method::Setup, "rtsp://host/stream");
        req.headers.add("Transport", "RTP/AVP;unicast");
        req.headers.add("CSeq", "3");
        req.headers.add("Session", "ABCD1234");
        let text = String::from_utf8(req.serialize()).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "SETUP rtsp://host/stream RTSP/1.0");
        assert_eq!(lines[1], "CSeq: 3");
        assert_eq!(lines[2], "Session: ABCD1234");
        assert_eq!(lines[3], "Transport: RTP/AVP;unicast");
    }

    #[test]
    fn serialize_parse_round_trip_is_byte_equal() {
        let mut req = Request::new(Method::Describe, "rtsp://host/stream");
        req.headers.add("CSeq", "7");
        req.headers.add("Accept", "application/sdp");
        let bytes = req.serialize();

        let mut reader = BufReader::new(&bytes[..]);
        let ControlMessage::Request(parsed) = read_message(&mut reader).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(parsed.serialize(), bytes);

        let resp = Response::ok()
            .with_header("CSeq", "7")
            .with_body("application/sdp", b"v=0\r\n".to_vec());
        let bytes = resp.serialize();
        let mut reader = BufReader::new(&bytes[..]);
        let ControlMessage::Response(parsed) = read_message(&mut reader).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn line_limit_is_fatal() {
        let mut raw = b"OPTIONS rtsp://localhost RTSP/1.0\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_LINE_LEN + 1));
        raw.extend_from_slice(b"\r\n\r\n");
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_message(&mut reader),
            Err(RtspError::Protocol {
                kind: ParseErrorKind::LineTooLong
            })
        ));
    }

    #[test]
    fn header_limit_is_fatal() {
        let mut raw = b"OPTIONS rtsp://localhost RTSP/1.0\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_message(&mut reader),
            Err(RtspError::Protocol {
                kind: ParseErrorKind::TooManyHeaders
            })
        ));
    }

    #[test]
    fn eof_at_boundary_is_closed() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(matches!(read_message(&mut reader), Err(RtspError::Closed)));
    }

    #[test]
    fn truncated_body_is_error() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 10\r\n\r\nshort";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_message(&mut reader).is_err());
    }
}
