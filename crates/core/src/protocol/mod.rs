//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol — message
//! framing and parsing, typed headers, and SDP bodies.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Both peers may send requests on the same connection.
//! - Binary RTP/RTCP frames are interleaved into the control stream,
//!   introduced by a `$` byte (RFC 2326 §10.12). A reader must expect a
//!   frame or a text message at any position.
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery / keepalive |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | ANNOUNCE | §10.3 | Publish an SDP session description |
//! | SETUP | §10.4 | Negotiate per-media transport |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive / parameter query |
//! | SET_PARAMETER | §10.9 | Parameter update |
//! | RECORD | §10.11 | Start media ingestion |

pub mod headers;
pub mod message;
pub mod sdp;

pub use headers::{RangeHeader, RtpInfoEntry, SessionHeader, TransportHeader};
pub use message::{ControlMessage, InterleavedFrame, Method, Request, Response, read_message};
