//! RTSP server: accept loop, per-connection state machines, stream
//! delivery, and session maintenance.
//!
//! ## Task model
//!
//! - One accept thread polls the listener and spawns a thread per
//!   connection.
//! - Each connection thread is the sole owner of the read half; a
//!   [`ConnWriter`] thread is the sole owner of the write half, fed
//!   through a bounded queue.
//! - One maintenance thread drives session expiry and the RTCP report
//!   schedules (Sender Reports for playing streams, Receiver Reports for
//!   recording sessions).
//!
//! User callbacks run on the thread that received the packet; long work
//! must be handed off by the user.

pub mod handler;
pub mod session;
pub mod stream;

pub use session::{ServerSession, SessionManager, SessionState};
pub use stream::{MulticastAllocator, ServerStream, ServerStreamFormat, StreamRegistry};

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

use crate::auth::Credentials;
use crate::error::{Result, RtspError};
use crate::media::Media;
use crate::protocol::message::{ControlMessage, InterleavedFrame, Method, Request, Response, read_message};
use crate::protocol::sdp::SdpOrigin;
use crate::rtcp;
use crate::rtcp::report::RtcpPacket;
use crate::rtcp::sender::DEFAULT_REPORT_PERIOD;
use crate::rtp::RtpPacket;
use crate::server::handler::{ChannelBinding, MethodHandler};
use crate::server::session::SessionMedia;
use crate::transport::{ConnWriter, PortAllocator, RtpChannel, TransportKind};

/// Server identification string included in every response
/// (RFC 2326 §12.36).
pub const SERVER_AGENT: &str = "rtsp-net/0.1";

/// Accept poll interval, so `stop` is observed promptly.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Maintenance tick driving expiry and report schedules.
const MAINTENANCE_TICK: Duration = Duration::from_millis(200);

/// Callback for RTP packets received from recording sessions:
/// `(stream path, media index, packet)`. The packet reference is valid
/// only for the duration of the call.
pub type RecordPacketCallback = Box<dyn Fn(&str, usize, &RtpPacket) + Send + Sync>;

/// Callback answering GET_PARAMETER / SET_PARAMETER; returning `None`
/// produces an empty 200.
pub type ParameterCallback = Box<dyn Fn(Method, &Request) -> Option<Vec<u8>> + Send + Sync>;

/// Server-level configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub write_timeout: Duration,
    /// Destroyed sessions' idle limit; advertised in the Session header.
    pub session_timeout: Duration,
    /// RTP packets larger than this are not sent over UDP transports.
    pub udp_max_payload_size: usize,
    /// Transport variants the server accepts in SETUP offers.
    pub allowed_transports: Vec<TransportKind>,
    pub multicast_range: (Ipv4Addr, Ipv4Addr),
    pub multicast_ttl: u32,
    /// When set, every non-OPTIONS request requires authorization.
    pub credentials: Option<Credentials>,
    pub auth_realm: String,
    /// Public host advertised in SDP `o=` and `c=` lines. When `None`,
    /// the host is inferred from the request URI or the client address.
    pub public_host: Option<String>,
    pub origin: SdpOrigin,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            write_timeout: Duration::from_secs(10),
            session_timeout: session::DEFAULT_SESSION_TIMEOUT,
            udp_max_payload_size: 1472,
            allowed_transports: vec![
                TransportKind::Udp,
                TransportKind::Multicast,
                TransportKind::Tcp,
            ],
            multicast_range: (Ipv4Addr::new(224, 1, 0, 0), Ipv4Addr::new(224, 255, 255, 255)),
            multicast_ttl: 16,
            credentials: None,
            auth_realm: crate::auth::DEFAULT_REALM.to_string(),
            public_host: None,
            origin: SdpOrigin::default(),
        }
    }
}

/// State shared between the server, its connections, and its threads.
pub struct ServerShared {
    pub config: ServerConfig,
    pub sessions: SessionManager,
    pub registry: StreamRegistry,
    pub allocator: Arc<PortAllocator>,
    pub multicast: MulticastAllocator,
    pub record_callback: RwLock<Option<RecordPacketCallback>>,
    pub parameter_callback: RwLock<Option<ParameterCallback>>,
}

/// High-level RTSP server orchestrator.
///
/// Owns the session manager and stream registry, delegates connection
/// handling to per-connection threads, and RTP delivery to
/// [`ServerStream::write_packet_rtp`].
pub struct Server {
    bind_addr: String,
    shared: Arc<ServerShared>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Server {
    /// Create a server with the default configuration. The port
    /// allocator is the application's process-scoped instance, shared
    /// with any clients.
    pub fn new(bind_addr: &str, allocator: Arc<PortAllocator>) -> Self {
        Self::with_config(bind_addr, ServerConfig::default(), allocator)
    }

    pub fn with_config(
        bind_addr: &str,
        config: ServerConfig,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        let multicast = MulticastAllocator::new(config.multicast_range);
        Server {
            bind_addr: bind_addr.to_string(),
            shared: Arc::new(ServerShared {
                config,
                sessions: SessionManager::new(),
                registry: StreamRegistry::new(),
                allocator,
                multicast,
                record_callback: RwLock::new(None),
                parameter_callback: RwLock::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            threads: Vec::new(),
        }
    }

    /// Publish a stream at a path; DESCRIBE serves its SDP and playing
    /// sessions receive what the application writes to it.
    pub fn add_stream(&self, path: &str, medias: Vec<Media>) -> Arc<ServerStream> {
        let stream = ServerStream::new(medias, self.shared.config.udp_max_payload_size);
        self.shared.registry.add(path, stream.clone());
        stream
    }

    pub fn stream(&self, path: &str) -> Option<Arc<ServerStream>> {
        self.shared.registry.get(path)
    }

    pub fn remove_stream(&self, path: &str) {
        if let Some(stream) = self.shared.registry.remove(path) {
            stream.close();
        }
    }

    /// Install the callback receiving RTP from recording sessions.
    pub fn on_record_packet(
        &self,
        callback: impl Fn(&str, usize, &RtpPacket) + Send + Sync + 'static,
    ) {
        *self.shared.record_callback.write() = Some(Box::new(callback));
    }

    /// Install the GET_PARAMETER / SET_PARAMETER handler.
    pub fn on_parameter(
        &self,
        callback: impl Fn(Method, &Request) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        *self.shared.parameter_callback.write() = Some(Box::new(callback));
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        self.local_addr = Some(listener.local_addr()?);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        let shared = self.shared.clone();
        let running = self.running.clone();
        self.threads.push(thread::spawn(move || {
            accept_loop(listener, shared, running);
        }));

        let shared = self.shared.clone();
        let running = self.running.clone();
        self.threads.push(thread::spawn(move || {
            maintenance_loop(shared, running);
        }));
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        for session in self.shared.sessions.all() {
            self.shared.sessions.remove(&session.id);
            session.close_endpoints();
        }
        for (_, stream) in self.shared.registry.all() {
            stream.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, available after `start` (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.shared.sessions
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Non-blocking TCP accept loop, polling the `running` flag between
/// accepts.
fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, running: Arc<AtomicBool>) {
    static CONN_IDS: AtomicU64 = AtomicU64::new(1);

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let shared = shared.clone();
                let running = running.clone();
                let conn_id = CONN_IDS.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    Connection::handle(stream, shared, running, conn_id);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Expires idle sessions and drives the RTCP report schedules.
fn maintenance_loop(shared: Arc<ServerShared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        thread::sleep(MAINTENANCE_TICK);
        let now = Instant::now();

        for session in shared.sessions.remove_expired(now) {
            tracing::info!(session_id = %session.id, "session expired");
            shared.registry.unsubscribe_session(&session.id);
            session.close_endpoints();
        }

        for (_, stream) in shared.registry.all() {
            stream.emit_due_reports(now);
        }

        // Receiver Reports for recording sessions.
        for session in shared.sessions.all() {
            if session.state() != SessionState::Recording {
                continue;
            }
            for setup in session.setups() {
                let Some(receiver) = &setup.rtcp_receiver else {
                    continue;
                };
                {
                    let mut due = setup.next_report.lock();
                    if *due > now {
                        continue;
                    }
                    *due = now + rtcp::randomized_interval(DEFAULT_REPORT_PERIOD);
                }
                if let Some(report) = receiver.lock().report(SystemTime::now()) {
                    let _ = setup.endpoint.send_rtcp(report.marshal());
                }
            }
        }
    }
}

/// Feed one inbound media packet into the record path: RTCP receiver
/// statistics plus the user's record callback. Malformed packets are
/// logged and dropped, never fatal.
pub(crate) fn dispatch_inbound_media(
    shared: &ServerShared,
    path: &str,
    setup: &SessionMedia,
    channel: RtpChannel,
    payload: &[u8],
) {
    match channel {
        RtpChannel::Rtp => match RtpPacket::parse(payload) {
            Ok(packet) => {
                if let Some(receiver) = &setup.rtcp_receiver {
                    receiver
                        .lock()
                        .process_packet(&packet.header, SystemTime::now());
                }
                if let Some(callback) = shared.record_callback.read().as_ref() {
                    callback(path, setup.media_index, &packet);
                }
            }
            Err(e) => tracing::debug!(error = %e, "dropped malformed RTP packet"),
        },
        RtpChannel::Rtcp => match rtcp::report::parse_compound(payload) {
            Ok(packets) => {
                if let Some(receiver) = &setup.rtcp_receiver {
                    let mut receiver = receiver.lock();
                    for packet in packets {
                        if let RtcpPacket::SenderReport(sr) = packet {
                            receiver.process_sender_report(&sr, SystemTime::now());
                        }
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "dropped malformed RTCP packet"),
        },
    }
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: Arc<ConnWriter>,
    handler: MethodHandler,
    channel_map: Arc<RwLock<HashMap<u8, ChannelBinding>>>,
    shared: Arc<ServerShared>,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, shared: Arc<ServerShared>, running: Arc<AtomicBool>, id: u64) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        tracing::info!(%peer_addr, "client connected");

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let writer = ConnWriter::start(
            stream,
            shared.config.write_timeout,
            Box::new(move |e| tracing::debug!(error = %e, "connection writer failed")),
        );
        let channel_map: Arc<RwLock<HashMap<u8, ChannelBinding>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let handler = MethodHandler::new(
            id,
            peer_addr,
            shared.clone(),
            writer.clone(),
            channel_map.clone(),
        );

        let mut conn = Connection {
            id,
            peer_addr,
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            channel_map,
            shared,
        };

        let reason = conn.run(&running);
        conn.cleanup();
        conn.writer.close();
        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/frame loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            match read_message(&mut self.reader) {
                Ok(ControlMessage::Request(request)) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );
                    let outcome = self.handler.handle(&request);
                    tracing::debug!(peer = %self.peer_addr, status = outcome.response.status, "response");

                    if self
                        .writer
                        .send_control(outcome.response.serialize())
                        .is_err()
                    {
                        return "write error";
                    }
                    if outcome.close_connection {
                        return "teardown";
                    }
                }
                Ok(ControlMessage::Response(response)) => {
                    tracing::trace!(peer = %self.peer_addr, status = response.status, "unsolicited response");
                }
                Ok(ControlMessage::Frame(frame)) => self.dispatch_frame(frame),
                Err(RtspError::Closed) => return "connection closed by client",
                Err(RtspError::Unsupported(what)) => {
                    // The message was consumed; answer 501 and go on.
                    tracing::warn!(peer = %self.peer_addr, what, "unsupported method");
                    let response = Response::new(501, "Not Implemented")
                        .with_header("Server", SERVER_AGENT);
                    if self.writer.send_control(response.serialize()).is_err() {
                        return "write error";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "fatal protocol error");
                    return "protocol error";
                }
            }
        }
        "server shutting down"
    }

    /// Route an interleaved frame to its recording session.
    fn dispatch_frame(&self, frame: InterleavedFrame) {
        let binding = self.channel_map.read().get(&frame.channel).cloned();
        let Some(binding) = binding else {
            tracing::trace!(channel = frame.channel, "frame on unbound channel dropped");
            return;
        };
        let Some(session) = self.shared.sessions.get(&binding.session_id) else {
            return;
        };
        let Some(setup) = session
            .setups()
            .into_iter()
            .find(|setup| setup.media_index == binding.media_index)
        else {
            return;
        };
        let channel = if binding.is_rtcp {
            RtpChannel::Rtcp
        } else {
            RtpChannel::Rtp
        };
        dispatch_inbound_media(&self.shared, &binding.path, &setup, channel, &frame.payload);
    }

    /// Destroy sessions owned by this connection and unpublish streams it
    /// announced.
    fn cleanup(&self) {
        let removed = self.shared.sessions.remove_for_connection(self.id);
        if !removed.is_empty() {
            for session in &removed {
                self.shared.registry.unsubscribe_session(&session.id);
                session.close_endpoints();
            }
            tracing::info!(peer = %self.peer_addr, removed = removed.len(), "cleaned up sessions on disconnect");
        }
        for path in self.handler.announced_paths() {
            if let Some(stream) = self.shared.registry.remove(path) {
                stream.close();
            }
        }
    }
}
