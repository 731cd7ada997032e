//! Media transport endpoints.
//!
//! Three variants carry RTP/RTCP for a set-up media:
//!
//! - **UDP unicast** ([`udp::UdpEndpoint`]): an even/odd socket pair with
//!   symmetric-RTP peer learning.
//! - **UDP multicast**: the same endpoint bound to a server-chosen group.
//! - **TCP interleaved** ([`tcp::TcpEndpoint`]): an even/odd channel pair
//!   multiplexed onto the RTSP control connection.
//!
//! All variants share one surface: `send_rtp`/`send_rtcp` enqueue onto a
//! bounded queue drained by a writer thread, inbound packets arrive on a
//! handler callback, and `close` tears the endpoint down. Senders never
//! block a receiver thread; when the queue overflows, the oldest RTP
//! packet is dropped and RTCP is preserved ([`queue::SendQueue`]).

pub mod queue;
pub mod tcp;
pub mod udp;

pub use queue::SendQueue;
pub use tcp::{ChannelAllocator, ConnWriter, TcpEndpoint};
pub use udp::{PortAllocator, UdpEndpoint};

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;

/// Which half of the RTP/RTCP pair a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpChannel {
    Rtp,
    Rtcp,
}

/// Transport variant, in the order clients try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Multicast,
    Tcp,
}

/// Inbound packet callback: `(channel, payload, source address)`.
///
/// The payload reference is valid only for the duration of the call;
/// handlers that retain packets must copy.
pub type PacketHandler = Arc<dyn Fn(RtpChannel, &[u8], SocketAddr) + Send + Sync>;

/// A media transport bound to one set-up media.
pub enum Endpoint {
    Udp(UdpEndpoint),
    Tcp(TcpEndpoint),
    /// A multicast sender shared by every multicast session of a stream;
    /// the owning stream tears it down.
    Multicast(Arc<UdpEndpoint>),
}

impl Endpoint {
    pub fn send_rtp(&self, payload: Vec<u8>) -> Result<()> {
        match self {
            Endpoint::Udp(endpoint) => endpoint.send_rtp(payload),
            Endpoint::Tcp(endpoint) => endpoint.send_rtp(payload),
            Endpoint::Multicast(endpoint) => endpoint.send_rtp(payload),
        }
    }

    pub fn send_rtcp(&self, payload: Vec<u8>) -> Result<()> {
        match self {
            Endpoint::Udp(endpoint) => endpoint.send_rtcp(payload),
            Endpoint::Tcp(endpoint) => endpoint.send_rtcp(payload),
            Endpoint::Multicast(endpoint) => endpoint.send_rtcp(payload),
        }
    }

    /// Interleaved channel pair, when this is a TCP endpoint.
    pub fn interleaved_channels(&self) -> Option<(u8, u8)> {
        match self {
            Endpoint::Tcp(endpoint) => Some(endpoint.channels()),
            _ => None,
        }
    }

    pub fn close(&self) {
        match self {
            Endpoint::Udp(endpoint) => endpoint.close(),
            // The interleaved channel shares the control connection and a
            // multicast endpoint is owned by its stream; neither has
            // per-session teardown.
            Endpoint::Tcp(_) | Endpoint::Multicast(_) => {}
        }
    }
}
