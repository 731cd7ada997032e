//! # rtsp — RTSP client/server library over RTP/RTCP
//!
//! A Rust library for consuming, serving, and re-publishing live media
//! streams over the Real-Time Streaming Protocol (RTSP), with RTP
//! transport and RTCP statistics.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Message framing, session lifecycle, transport negotiation, interleaving |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Packet model, Sender/Receiver Reports, jitter and loss statistics |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Media descriptions for DESCRIBE/ANNOUNCE bodies |
//! | [RFC 2617](https://tools.ietf.org/html/rfc2617) | HTTP auth | Basic and Digest (MD5) challenge/response |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Client        — DESCRIBE/SETUP/PLAY/RECORD   │
//! │  Server        — sessions, streams, dispatch  │
//! │  Bridge        — client → client re-publish   │
//! ├───────────────────────────────────────────────┤
//! │  Protocol      — messages, headers, SDP       │
//! │  Auth          — Basic/Digest both sides      │
//! ├───────────────────────────────────────────────┤
//! │  Transport     — UDP, multicast, interleaved  │
//! │  RTP / RTCP    — packets, SR/RR bookkeeping   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Each connection owns a reader thread and a writer thread; media
//! endpoints own their socket threads; everything else communicates
//! through bounded queues and snapshots. User callbacks run on the
//! receiving thread and must not block.
//!
//! ## Crate layout
//!
//! - [`client`] — [`Client`] state machine and transaction layer.
//! - [`server`] — [`Server`], [`ServerStream`] registry, sessions.
//! - [`bridge`] — [`Bridge`] connecting a reader to a publisher.
//! - [`protocol`] — message codec, typed headers, SDP.
//! - [`auth`] — credential generation and validation.
//! - [`media`] — [`Media`] descriptions and payload [`Format`]s.
//! - [`rtp`] / [`rtcp`] — packet model and report bookkeeping.
//! - [`transport`] — UDP/multicast/TCP-interleaved endpoints,
//!   [`PortAllocator`].
//! - [`url`] — [`RtspUrl`] parsing and control resolution.
//! - [`error`] — [`RtspError`] enum and [`Result`] alias.

pub mod auth;
pub mod bridge;
pub mod client;
pub mod error;
pub mod media;
pub mod protocol;
pub mod rtcp;
pub mod rtp;
pub mod server;
pub mod transport;
pub mod url;

pub use bridge::{Bridge, BridgeConfig};
pub use client::{Client, ClientConfig};
pub use error::{Result, RtspError};
pub use media::{Format, Media, MediaKind};
pub use rtp::RtpPacket;
pub use server::{Server, ServerConfig, ServerStream};
pub use transport::{PortAllocator, TransportKind};
pub use url::RtspUrl;
