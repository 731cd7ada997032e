//! UDP transport: port allocation, unicast pairs, multicast groups.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::transport::queue::{QueueItem, SendQueue};
use crate::transport::{PacketHandler, RtpChannel};

/// Default RTP port range (RFC 3551 convention, even RTP / odd RTCP).
pub const DEFAULT_PORT_RANGE: (u16, u16) = (8000, 65000);

/// Multicast TTL default.
pub const DEFAULT_MULTICAST_TTL: u32 = 16;

/// Poll interval for reader threads so `close` is observed promptly.
const READ_POLL: Duration = Duration::from_millis(200);

const RECV_BUF_LEN: usize = 65536;

/// Process-scoped allocator of even/odd UDP port pairs.
///
/// Constructed once by the application and shared between clients and
/// servers; it is the only process-wide resource in the library. Ports
/// are claimed by actually binding both sockets, so concurrent users of
/// the same range cannot race on a pair.
pub struct PortAllocator {
    range: (u16, u16),
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        let start = range.0 + (range.0 & 1); // first even port in range
        PortAllocator {
            range: (start, range.1),
            next: Mutex::new(start),
        }
    }

    /// Bind an even/odd socket pair somewhere in the range.
    ///
    /// Scans at most the full range once, starting after the previous
    /// allocation, and wraps around.
    pub fn allocate_pair(&self) -> Result<(UdpSocket, UdpSocket)> {
        let mut next = self.next.lock();
        let (start, end) = self.range;
        let span = ((end - start) / 2 + 1) as u32;

        let mut port = *next;
        for _ in 0..span {
            if port > end || port.checked_add(1).is_none() {
                port = start;
            }
            let rtp = UdpSocket::bind(("0.0.0.0", port));
            let rtcp = UdpSocket::bind(("0.0.0.0", port + 1));
            match (rtp, rtcp) {
                (Ok(rtp), Ok(rtcp)) => {
                    *next = if port.saturating_add(2) > end {
                        start
                    } else {
                        port + 2
                    };
                    tracing::trace!(rtp_port = port, "allocated UDP port pair");
                    return Ok((rtp, rtcp));
                }
                _ => port = port.saturating_add(2),
            }
        }
        Err(RtspError::PortRangeExhausted)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        PortAllocator::new(DEFAULT_PORT_RANGE)
    }
}

/// A bound RTP/RTCP socket pair with reader and writer threads.
///
/// Outbound packets flow through the bounded [`SendQueue`]; inbound
/// packets are delivered to the handler installed by
/// [`start`](Self::start). When no peer address is configured the first
/// inbound packet sets it (symmetric RTP) and packets from any other
/// source are rejected afterwards.
pub struct UdpEndpoint {
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Arc<UdpSocket>,
    queue: Arc<SendQueue>,
    peer_rtp: Arc<Mutex<Option<SocketAddr>>>,
    peer_rtcp: Arc<Mutex<Option<SocketAddr>>>,
    closed: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// Bind a unicast pair from the allocator's range.
    pub fn bind(allocator: &PortAllocator) -> Result<Self> {
        let (rtp, rtcp) = allocator.allocate_pair()?;
        Self::from_sockets(rtp, rtcp)
    }

    /// Sending half of a multicast transport: an ephemeral socket pair
    /// with the group as peer and the given TTL.
    pub fn multicast_sender(group: Ipv4Addr, rtp_port: u16, ttl: u32) -> Result<Self> {
        let rtp = UdpSocket::bind(("0.0.0.0", 0))?;
        let rtcp = UdpSocket::bind(("0.0.0.0", 0))?;
        rtp.set_multicast_ttl_v4(ttl)?;
        rtcp.set_multicast_ttl_v4(ttl)?;
        let endpoint = Self::from_sockets(rtp, rtcp)?;
        endpoint.set_peer(
            SocketAddr::new(IpAddr::V4(group), rtp_port),
            SocketAddr::new(IpAddr::V4(group), rtp_port + 1),
        );
        Ok(endpoint)
    }

    /// Receiving half of a multicast transport: bind the group ports and
    /// join the group on both sockets.
    pub fn multicast_receiver(group: Ipv4Addr, rtp_port: u16) -> Result<Self> {
        let rtp = UdpSocket::bind(("0.0.0.0", rtp_port))?;
        let rtcp = UdpSocket::bind(("0.0.0.0", rtp_port + 1))?;
        rtp.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        rtcp.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        let endpoint = Self::from_sockets(rtp, rtcp)?;
        // Multicast sources are not symmetric; accept any sender.
        endpoint.set_peer(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        );
        Ok(endpoint)
    }

    /// Wrap an already-bound socket pair (port hints from the caller).
    pub fn from_socket_pair(rtp: UdpSocket, rtcp: UdpSocket) -> Result<Self> {
        Self::from_sockets(rtp, rtcp)
    }

    fn from_sockets(rtp: UdpSocket, rtcp: UdpSocket) -> Result<Self> {
        rtp.set_read_timeout(Some(READ_POLL))?;
        rtcp.set_read_timeout(Some(READ_POLL))?;
        Ok(UdpEndpoint {
            rtp_socket: Arc::new(rtp),
            rtcp_socket: Arc::new(rtcp),
            queue: Arc::new(SendQueue::default()),
            peer_rtp: Arc::new(Mutex::new(None)),
            peer_rtcp: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Locally bound (RTP, RTCP) ports.
    pub fn local_ports(&self) -> (u16, u16) {
        let rtp = self.rtp_socket.local_addr().map(|a| a.port()).unwrap_or(0);
        let rtcp = self.rtcp_socket.local_addr().map(|a| a.port()).unwrap_or(0);
        (rtp, rtcp)
    }

    /// Fix the remote addresses (skips symmetric-RTP learning).
    pub fn set_peer(&self, rtp: SocketAddr, rtcp: SocketAddr) {
        *self.peer_rtp.lock() = Some(rtp);
        *self.peer_rtcp.lock() = Some(rtcp);
    }

    /// Spawn the reader threads and the queue writer thread.
    pub fn start(&self, handler: PacketHandler) {
        let mut threads = self.threads.lock();
        threads.push(self.spawn_reader(
            self.rtp_socket.clone(),
            RtpChannel::Rtp,
            self.peer_rtp.clone(),
            handler.clone(),
        ));
        threads.push(self.spawn_reader(
            self.rtcp_socket.clone(),
            RtpChannel::Rtcp,
            self.peer_rtcp.clone(),
            handler,
        ));
        threads.push(self.spawn_writer());
    }

    /// Spawn only the queue writer thread, for send-only endpoints
    /// (multicast senders have no inbound traffic).
    pub fn start_sender(&self) {
        self.threads.lock().push(self.spawn_writer());
    }

    fn spawn_reader(
        &self,
        socket: Arc<UdpSocket>,
        channel: RtpChannel,
        peer: Arc<Mutex<Option<SocketAddr>>>,
        handler: PacketHandler,
    ) -> thread::JoinHandle<()> {
        let closed = self.closed.clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; RECV_BUF_LEN];
            while !closed.load(Ordering::SeqCst) {
                let (len, source) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        if !closed.load(Ordering::SeqCst) {
                            tracing::debug!(error = %e, "UDP receive error");
                        }
                        break;
                    }
                };

                {
                    let mut peer = peer.lock();
                    match *peer {
                        None => {
                            // Symmetric RTP: the first source wins.
                            tracing::debug!(%source, ?channel, "learned peer address");
                            *peer = Some(source);
                        }
                        Some(expected) => {
                            // Port 0 means "accept any source" (multicast).
                            if expected.port() != 0 && expected != source {
                                tracing::trace!(%source, %expected, "rejected packet from unexpected source");
                                continue;
                            }
                        }
                    }
                }

                handler(channel, &buf[..len], source);
            }
        })
    }

    fn spawn_writer(&self) -> thread::JoinHandle<()> {
        let queue = self.queue.clone();
        let rtp_socket = self.rtp_socket.clone();
        let rtcp_socket = self.rtcp_socket.clone();
        let peer_rtp = self.peer_rtp.clone();
        let peer_rtcp = self.peer_rtcp.clone();
        thread::spawn(move || {
            while let Some(item) = queue.pop() {
                let (socket, peer) = match &item {
                    QueueItem::Rtcp(_) => (&rtcp_socket, *peer_rtcp.lock()),
                    _ => (&rtp_socket, *peer_rtp.lock()),
                };
                let Some(peer) = peer.filter(|p| p.port() != 0) else {
                    tracing::trace!("dropping outbound packet: peer not learned yet");
                    continue;
                };
                if let Err(e) = socket.send_to(&item.into_bytes(), peer) {
                    tracing::debug!(error = %e, %peer, "UDP send error");
                }
            }
        })
    }

    pub fn send_rtp(&self, payload: Vec<u8>) -> Result<()> {
        self.queue.push(QueueItem::Rtp(payload))
    }

    pub fn send_rtcp(&self, payload: Vec<u8>) -> Result<()> {
        self.queue.push(QueueItem::Rtcp(payload))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.close();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn allocator_returns_even_odd_pairs() {
        let allocator = PortAllocator::new((20000, 20100));
        let (rtp_a, rtcp_a) = allocator.allocate_pair().unwrap();
        let (rtp_b, _rtcp_b) = allocator.allocate_pair().unwrap();

        let port_a = rtp_a.local_addr().unwrap().port();
        assert_eq!(port_a % 2, 0);
        assert_eq!(rtcp_a.local_addr().unwrap().port(), port_a + 1);
        assert_ne!(rtp_b.local_addr().unwrap().port(), port_a);
    }

    #[test]
    fn allocator_skips_occupied_pairs() {
        let allocator = PortAllocator::new((21000, 21010));
        let (_rtp_hold, _rtcp_hold) = allocator.allocate_pair().unwrap();
        // A second allocation must find a different pair.
        let (rtp, _rtcp) = allocator.allocate_pair().unwrap();
        assert_ne!(rtp.local_addr().unwrap().port(), 21000);
    }

    #[test]
    fn allocator_exhaustion() {
        let allocator = PortAllocator::new((21500, 21503));
        let _a = allocator.allocate_pair().unwrap();
        let _b = allocator.allocate_pair().unwrap();
        assert!(matches!(
            allocator.allocate_pair(),
            Err(RtspError::PortRangeExhausted)
        ));
    }

    #[test]
    fn round_trip_and_symmetric_learning() {
        let allocator = PortAllocator::new((22000, 22500));
        let server = UdpEndpoint::bind(&allocator).unwrap();
        let client = UdpEndpoint::bind(&allocator).unwrap();

        let (server_rtp, server_rtcp) = server.local_ports();
        let (client_rtp, client_rtcp) = client.local_ports();

        // Client knows the server; server learns the client from the
        // first packet.
        client.set_peer(
            format!("127.0.0.1:{server_rtp}").parse().unwrap(),
            format!("127.0.0.1:{server_rtcp}").parse().unwrap(),
        );

        let (tx, rx) = mpsc::channel();
        server.start(Arc::new(move |channel, payload, source| {
            tx.send((channel, payload.to_vec(), source)).unwrap();
        }));
        let (client_tx, client_rx) = mpsc::channel();
        client.start(Arc::new(move |channel, payload, _| {
            client_tx.send((channel, payload.to_vec())).unwrap();
        }));

        client.send_rtp(vec![1, 2, 3]).unwrap();
        let (channel, payload, source) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(channel, RtpChannel::Rtp);
        assert_eq!(payload, vec![1, 2, 3]);
        assert_eq!(source.port(), client_rtp);

        // After learning, the server can answer.
        server
            .set_peer(
                format!("127.0.0.1:{client_rtp}").parse().unwrap(),
                format!("127.0.0.1:{client_rtcp}").parse().unwrap(),
            );
        server.send_rtcp(vec![9, 9]).unwrap();
        let (channel, payload) = client_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(channel, RtpChannel::Rtcp);
        assert_eq!(payload, vec![9, 9]);

        client.close();
        server.close();
    }

    #[test]
    fn foreign_source_rejected_after_learning() {
        let allocator = PortAllocator::new((23000, 23500));
        let endpoint = UdpEndpoint::bind(&allocator).unwrap();
        let (rtp_port, _) = endpoint.local_ports();

        let (tx, rx) = mpsc::channel();
        endpoint.start(Arc::new(move |_, payload, _| {
            tx.send(payload.to_vec()).unwrap();
        }));

        let first = UdpSocket::bind("127.0.0.1:0").unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = format!("127.0.0.1:{rtp_port}");

        first.send_to(&[1], &target).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![1]);

        second.send_to(&[2], &target).unwrap();
        first.send_to(&[3], &target).unwrap();
        // The foreign packet [2] never arrives.
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![3]);

        endpoint.close();
    }
}
