//! RTSP client: connection lifecycle, transaction layer, transport
//! negotiation, and media reception/publication.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected → start() → TcpConnected → options() → Initial
//!   → describe() → Described → setup()/setup_all() → Prepared
//!   → play() → Playing      (receive RTP, emit Receiver Reports)
//!   → record() → Recording  (send RTP,    emit Sender Reports)
//!   → pause() → Prepared; close() → Disconnected
//! ```
//!
//! ## Task model
//!
//! A started client owns a reader thread (sole owner of the read half)
//! and a writer thread behind a bounded queue ([`ConnWriter`]). `play`
//! and `record` add a keepalive timer thread and an RTCP report thread.
//! Packet callbacks run on the thread that received the packet; at most
//! one RTSP request is outstanding at a time, and responses are matched
//! to requests by CSeq.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::RngExt;

use crate::auth::{Challenge, Credentials, Sender as AuthSender};
use crate::error::{Result, RtspError};
use crate::media::{Format, Media};
use crate::protocol::headers::{
    Delivery, RangeHeader, SessionHeader, TransportHeader, TransportMode, TransportProtocol,
};
use crate::protocol::message::{ControlMessage, InterleavedFrame, Method, Request, Response, read_message};
use crate::protocol::sdp;
use crate::rtcp;
use crate::rtcp::report::RtcpPacket;
use crate::rtcp::sender::DEFAULT_REPORT_PERIOD;
use crate::rtcp::{RtcpReceiver, RtcpSender};
use crate::rtp::RtpPacket;
use crate::transport::tcp::ChannelAllocator;
use crate::transport::{ConnWriter, Endpoint, PortAllocator, RtpChannel, TransportKind, UdpEndpoint};
use crate::url::{RtspUrl, Scheme};

/// User-Agent default.
const USER_AGENT: &str = "rtsp-net/0.1";

/// Timeout for the best-effort TEARDOWN issued by [`Client::close`].
const CLOSE_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Timer thread poll interval.
const TIMER_POLL: Duration = Duration::from_millis(200);

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Per-request response timeout.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Transport variants tried for SETUP, in order, falling forward on
    /// 461 or on port allocation failure.
    pub transport_preference: Vec<TransportKind>,
    /// RTP packets larger than this are not written to UDP transports.
    pub udp_max_payload_size: usize,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            transport_preference: vec![
                TransportKind::Udp,
                TransportKind::Multicast,
                TransportKind::Tcp,
            ],
            udp_max_payload_size: 1472,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Client state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    TcpConnected,
    Initial,
    Described,
    Prepared,
    Playing,
    Recording,
}

/// RTP packet callback: `(media index, packet)`. The reference is valid
/// only for the duration of the call.
pub type PacketRtpCallback = Box<dyn Fn(usize, &RtpPacket) + Send + Sync>;
/// RTCP packet callback: `(media index, raw compound packet)`.
pub type PacketRtcpCallback = Box<dyn Fn(usize, &[u8]) + Send + Sync>;

/// One set-up media with its transport and RTCP bookkeeping.
struct SetupEntry {
    media: Media,
    format: Format,
    control_url: RtspUrl,
    endpoint: Endpoint,
    /// Present while playing: reception statistics.
    rtcp_receiver: Option<Mutex<RtcpReceiver>>,
    /// Present while recording: sent-stream statistics.
    rtcp_sender: Option<Mutex<RtcpSender>>,
    next_report: Mutex<Instant>,
}

struct ConnState {
    writer: Arc<ConnWriter>,
    /// Kept to force the reader thread out of its blocking read.
    stream: TcpStream,
}

/// First fatal error of the session; `wait` blocks on it.
struct FatalCell {
    error: Mutex<Option<RtspError>>,
    happened: AtomicBool,
    cond: Condvar,
}

impl FatalCell {
    fn new() -> Self {
        FatalCell {
            error: Mutex::new(None),
            happened: AtomicBool::new(false),
            cond: Condvar::new(),
        }
    }

    /// First error wins; later ones are logged and discarded.
    fn set(&self, error: RtspError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            tracing::debug!(%error, "fatal session error");
            *slot = Some(error);
            self.happened.store(true, Ordering::SeqCst);
            self.cond.notify_all();
        }
    }

    fn is_set(&self) -> bool {
        self.happened.load(Ordering::SeqCst)
    }

    fn wait(&self) -> RtspError {
        let mut slot = self.error.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.take().unwrap_or(RtspError::Closed)
    }
}

struct ClientShared {
    config: ClientConfig,
    state: Mutex<ClientState>,
    conn: RwLock<Option<ConnState>>,
    /// Rendezvous for the single outstanding request.
    pending: Mutex<Option<mpsc::SyncSender<Response>>>,
    /// Serializes transactions: at most one outstanding request.
    request_lock: Mutex<()>,
    cseq: AtomicU32,
    session: RwLock<Option<SessionHeader>>,
    auth: Mutex<Option<AuthSender>>,
    credentials: Mutex<Option<Credentials>>,
    base_url: RwLock<Option<RtspUrl>>,
    setups: RwLock<Vec<Arc<SetupEntry>>>,
    channel_bindings: RwLock<HashMap<u8, (usize, bool)>>,
    channels: Mutex<ChannelAllocator>,
    current_transport: Mutex<Option<TransportKind>>,
    keepalive_method: Mutex<Method>,
    last_request: Mutex<Instant>,
    on_rtp: RwLock<Option<PacketRtpCallback>>,
    on_rtcp: RwLock<Option<PacketRtcpCallback>>,
    fatal: FatalCell,
    closed: AtomicBool,
}

/// RTSP client.
///
/// Typical read path, mirroring the lifecycle diagram above:
///
/// ```no_run
/// use std::sync::Arc;
/// use rtsp::client::Client;
/// use rtsp::transport::PortAllocator;
/// use rtsp::url::RtspUrl;
///
/// let allocator = Arc::new(PortAllocator::default());
/// let mut client = Client::new(allocator);
///
/// let url = RtspUrl::parse("rtsp://localhost:8554/stream").unwrap();
/// client.start(url.scheme, &url.host_port()).unwrap();
/// let (medias, base_url, _) = client.describe(&url).unwrap();
///
/// client.on_packet_rtp(|media_index, packet| {
///     println!("media {media_index}: seq {}", packet.header.sequence);
/// });
///
/// client.setup_all(&medias, &base_url).unwrap();
/// client.play(None).unwrap();
/// let error = client.wait();
/// println!("session ended: {error}");
/// ```
pub struct Client {
    shared: Arc<ClientShared>,
    allocator: Arc<PortAllocator>,
    reader_handle: Option<thread::JoinHandle<()>>,
    timer_handles: Vec<thread::JoinHandle<()>>,
}

impl Client {
    pub fn new(allocator: Arc<PortAllocator>) -> Self {
        Self::with_config(ClientConfig::default(), allocator)
    }

    pub fn with_config(config: ClientConfig, allocator: Arc<PortAllocator>) -> Self {
        Client {
            shared: Arc::new(ClientShared {
                config,
                state: Mutex::new(ClientState::Disconnected),
                conn: RwLock::new(None),
                pending: Mutex::new(None),
                request_lock: Mutex::new(()),
                cseq: AtomicU32::new(0),
                session: RwLock::new(None),
                auth: Mutex::new(None),
                credentials: Mutex::new(None),
                base_url: RwLock::new(None),
                setups: RwLock::new(Vec::new()),
                channel_bindings: RwLock::new(HashMap::new()),
                channels: Mutex::new(ChannelAllocator::new()),
                current_transport: Mutex::new(None),
                keepalive_method: Mutex::new(Method::Options),
                last_request: Mutex::new(Instant::now()),
                on_rtp: RwLock::new(None),
                on_rtcp: RwLock::new(None),
                fatal: FatalCell::new(),
                closed: AtomicBool::new(false),
            }),
            allocator,
            reader_handle: None,
            timer_handles: Vec::new(),
        }
    }

    /// Install the RTP packet callback. Must be set before `play`.
    pub fn on_packet_rtp(&self, callback: impl Fn(usize, &RtpPacket) + Send + Sync + 'static) {
        *self.shared.on_rtp.write() = Some(Box::new(callback));
    }

    /// Install the RTCP packet callback.
    pub fn on_packet_rtcp(&self, callback: impl Fn(usize, &[u8]) + Send + Sync + 'static) {
        *self.shared.on_rtcp.write() = Some(Box::new(callback));
    }

    /// Open the control connection. No RTSP traffic is exchanged yet.
    pub fn start(&mut self, scheme: Scheme, host_port: &str) -> Result<()> {
        if *self.shared.state.lock() != ClientState::Disconnected {
            return Err(RtspError::InvalidState("already started".to_string()));
        }
        if scheme == Scheme::Rtsps {
            return Err(RtspError::Unsupported("rtsps (TLS) transport".to_string()));
        }

        let stream = TcpStream::connect(host_port)?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        let shared = self.shared.clone();
        let writer = ConnWriter::start(
            writer_stream,
            self.shared.config.write_timeout,
            Box::new(move |e| shared.fatal.set(e)),
        );
        *self.shared.conn.write() = Some(ConnState { writer, stream });

        let shared = self.shared.clone();
        self.reader_handle = Some(thread::spawn(move || reader_loop(shared, reader_stream)));

        *self.shared.state.lock() = ClientState::TcpConnected;
        tracing::debug!(host_port, "control connection open");
        Ok(())
    }

    /// OPTIONS: discover the server's methods. Sets the keepalive verb to
    /// GET_PARAMETER when advertised.
    pub fn options(&mut self, url: &RtspUrl) -> Result<Response> {
        self.remember_credentials(url);
        let response = self.transaction(Method::Options, url, &[], Vec::new())?;
        let response = expect_ok(response)?;

        if let Some(public) = response.headers.get("Public")
            && public.contains(Method::GetParameter.as_str())
        {
            *self.shared.keepalive_method.lock() = Method::GetParameter;
        }
        let mut state = self.shared.state.lock();
        if *state == ClientState::TcpConnected {
            *state = ClientState::Initial;
        }
        Ok(response)
    }

    /// OPTIONS + DESCRIBE. Returns the media list, the presentation base
    /// URL, and the DESCRIBE response.
    pub fn describe(&mut self, url: &RtspUrl) -> Result<(Vec<Media>, RtspUrl, Response)> {
        if *self.shared.state.lock() == ClientState::TcpConnected {
            self.options(url)?;
        }
        self.remember_credentials(url);

        let headers = [("Accept".to_string(), "application/sdp".to_string())];
        let response = self.transaction(Method::Describe, url, &headers, Vec::new())?;
        let response = expect_ok(response)?;

        // Base URL: Content-Base, else Content-Location, else the
        // request URL.
        let base_url = response
            .headers
            .get("Content-Base")
            .or_else(|| response.headers.get("Content-Location"))
            .and_then(|value| RtspUrl::parse(value.trim_end_matches('/')).ok())
            .unwrap_or_else(|| url.without_credentials());

        let medias = sdp::parse(&response.body)?;
        tracing::info!(medias = medias.len(), base = %base_url, "presentation described");

        *self.shared.base_url.write() = Some(base_url.clone());
        *self.shared.state.lock() = ClientState::Described;
        Ok((medias, base_url, response))
    }

    /// SETUP one media for playback. Returns the media's index for the
    /// packet callbacks. Port hints, when given, are tried before the
    /// allocator's range.
    pub fn setup(
        &mut self,
        media: &Media,
        base_url: &RtspUrl,
        port_hint: Option<(u16, u16)>,
    ) -> Result<usize> {
        self.setup_inner(media, base_url, port_hint, TransportMode::Play)
    }

    /// SETUP every media in order, stopping on the first error.
    pub fn setup_all(&mut self, medias: &[Media], base_url: &RtspUrl) -> Result<()> {
        for media in medias {
            self.setup_inner(media, base_url, None, TransportMode::Play)?;
        }
        Ok(())
    }

    /// PLAY. Starts the keepalive and the Receiver Report schedule.
    pub fn play(&mut self, range: Option<RangeHeader>) -> Result<Response> {
        self.require_state(ClientState::Prepared, "play")?;
        let base_url = self.base_url()?;

        let mut headers = Vec::new();
        if let Some(range) = range {
            headers.push(("Range".to_string(), range.serialize()));
        }
        let response = self.transaction(Method::Play, &base_url, &headers, Vec::new())?;
        let response = expect_ok(response)?;

        *self.shared.state.lock() = ClientState::Playing;
        tracing::info!("playing");
        self.start_timers();
        Ok(response)
    }

    /// PAUSE: back to Prepared; delivery stops until the next PLAY or
    /// RECORD.
    pub fn pause(&mut self) -> Result<Response> {
        {
            let state = self.shared.state.lock();
            if !matches!(*state, ClientState::Playing | ClientState::Recording) {
                return Err(RtspError::InvalidState(format!(
                    "pause requires Playing or Recording, state is {state:?}"
                )));
            }
        }
        let base_url = self.base_url()?;
        let response = self.transaction(Method::Pause, &base_url, &[], Vec::new())?;
        let response = expect_ok(response)?;
        *self.shared.state.lock() = ClientState::Prepared;
        tracing::info!("paused");
        Ok(response)
    }

    /// ANNOUNCE a presentation to publish. Media without control
    /// attributes get `trackID=N` assigned.
    pub fn announce(&mut self, url: &RtspUrl, medias: &[Media]) -> Result<(Vec<Media>, Response)> {
        self.remember_credentials(url);
        if *self.shared.state.lock() == ClientState::TcpConnected {
            self.options(url)?;
        }

        let mut medias = medias.to_vec();
        for (index, media) in medias.iter_mut().enumerate() {
            if media.control.is_empty() {
                media.control = format!("trackID={index}");
            }
        }
        let body = sdp::generate(&medias, &url.host, &sdp::SdpOrigin::default());

        let headers = [("Content-Type".to_string(), "application/sdp".to_string())];
        let response =
            self.transaction(Method::Announce, url, &headers, body.into_bytes())?;
        let response = expect_ok(response)?;

        *self.shared.base_url.write() = Some(url.without_credentials());
        *self.shared.state.lock() = ClientState::Described;
        tracing::info!(url = %url.without_credentials(), medias = medias.len(), "announced");
        Ok((medias, response))
    }

    /// RECORD. Starts the keepalive and the Sender Report schedule;
    /// packets are then written with [`write_packet_rtp`](Self::write_packet_rtp).
    pub fn record(&mut self) -> Result<Response> {
        self.require_state(ClientState::Prepared, "record")?;
        let base_url = self.base_url()?;
        let response = self.transaction(Method::Record, &base_url, &[], Vec::new())?;
        let response = expect_ok(response)?;

        *self.shared.state.lock() = ClientState::Recording;
        tracing::info!("recording");
        self.start_timers();
        Ok(response)
    }

    /// Connect, ANNOUNCE, SETUP each media with `mode=record`, RECORD.
    pub fn start_recording(&mut self, url: &RtspUrl, medias: &[Media]) -> Result<()> {
        self.start(url.scheme, &url.host_port())?;
        let (medias, _) = self.announce(url, medias)?;
        let base = url.without_credentials();
        for media in &medias {
            self.setup_inner(media, &base, None, TransportMode::Record)?;
        }
        self.record()?;
        Ok(())
    }

    /// Write one RTP packet of a recording session's media.
    pub fn write_packet_rtp(&self, media_index: usize, packet: &RtpPacket) -> Result<()> {
        self.shared.write_packet_rtp(media_index, packet)
    }

    /// Detached write handle for forwarding packets from another
    /// session's callback (used by the re-publish bridge).
    pub fn packet_writer(&self) -> PacketWriter {
        PacketWriter {
            shared: self.shared.clone(),
        }
    }

    /// Whether a fatal error already ended the session.
    pub fn is_ended(&self) -> bool {
        self.shared.fatal.is_set()
    }

    /// Block until a fatal error ends the session: connection loss,
    /// missed keepalive, protocol error, or server TEARDOWN.
    pub fn wait(&self) -> RtspError {
        self.shared.fatal.wait()
    }

    /// Best-effort TEARDOWN (1 s timeout), then tear down transports and
    /// threads.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing client");

        let has_session = self.shared.session.read().is_some();
        if has_session && !self.shared.fatal.is_set()
            && let Ok(base_url) = self.base_url()
        {
            let _ = self.transaction_with_timeout(
                Method::Teardown,
                &base_url,
                &[],
                Vec::new(),
                CLOSE_TEARDOWN_TIMEOUT,
            );
        }

        self.shared.fatal.set(RtspError::Closed);
        for entry in self.shared.setups.read().iter() {
            entry.endpoint.close();
        }
        if let Some(conn) = self.shared.conn.write().take() {
            conn.writer.close();
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        for handle in self.timer_handles.drain(..) {
            let _ = handle.join();
        }
        *self.shared.state.lock() = ClientState::Disconnected;
    }

    // ---- internals ----

    fn remember_credentials(&self, url: &RtspUrl) {
        if let (Some(user), Some(pass)) = (&url.user, &url.pass) {
            *self.shared.credentials.lock() = Some(Credentials::new(user.clone(), pass.clone()));
        }
    }

    fn base_url(&self) -> Result<RtspUrl> {
        self.shared
            .base_url
            .read()
            .clone()
            .ok_or_else(|| RtspError::InvalidState("no presentation URL yet".to_string()))
    }

    fn require_state(&self, expected: ClientState, operation: &str) -> Result<()> {
        let state = *self.shared.state.lock();
        if state != expected {
            return Err(RtspError::InvalidState(format!(
                "{operation} requires {expected:?}, state is {state:?}"
            )));
        }
        Ok(())
    }

    fn transaction(
        &self,
        method: Method,
        url: &RtspUrl,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<Response> {
        self.transaction_with_timeout(method, url, headers, body, self.shared.config.read_timeout)
    }

    /// One request/response exchange with a single auth retry on 401.
    fn transaction_with_timeout(
        &self,
        method: Method,
        url: &RtspUrl,
        headers: &[(String, String)],
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Response> {
        let _guard = self.shared.request_lock.lock();

        let response = self.shared.roundtrip(method, url, headers, &body, timeout)?;
        if response.status != 401 {
            return Ok(response);
        }

        // One retry per challenge; a repeated 401 surfaces as AuthError.
        // Stale nonces arrive as a fresh challenge and take the same path.
        let credentials = self
            .shared
            .credentials
            .lock()
            .clone()
            .ok_or_else(|| RtspError::Auth("server requires credentials".to_string()))?;
        let challenges = Challenge::parse_all(response.headers.values("WWW-Authenticate"));
        let sender = AuthSender::new(&challenges, credentials)?;
        *self.shared.auth.lock() = Some(sender);

        let retried = self.shared.roundtrip(method, url, headers, &body, timeout)?;
        if retried.status == 401 {
            return Err(RtspError::Auth("credentials rejected".to_string()));
        }
        Ok(retried)
    }

    fn setup_inner(
        &mut self,
        media: &Media,
        base_url: &RtspUrl,
        port_hint: Option<(u16, u16)>,
        mode: TransportMode,
    ) -> Result<usize> {
        {
            let state = *self.shared.state.lock();
            if !matches!(state, ClientState::Described | ClientState::Prepared) {
                return Err(RtspError::InvalidState(format!(
                    "setup requires Described or Prepared, state is {state:?}"
                )));
            }
        }
        let format = media
            .formats
            .first()
            .cloned()
            .ok_or_else(|| RtspError::protocol("media without formats"))?;
        let control_url = base_url.join(&media.control)?;

        // Once a transport is negotiated, later SETUPs stick with it.
        let kinds: Vec<TransportKind> = match *self.shared.current_transport.lock() {
            Some(kind) => vec![kind],
            None => self.shared.config.transport_preference.clone(),
        };

        let mut last_error = RtspError::Unsupported("no transport accepted".to_string());
        for kind in kinds {
            match self.try_setup(media, &format, &control_url, port_hint, mode, kind) {
                Ok(media_index) => return Ok(media_index),
                Err(RtspError::BadStatus { status: 461, .. }) | Err(RtspError::PortRangeExhausted) => {
                    tracing::debug!(?kind, "transport rejected, trying next preference");
                    last_error = RtspError::Unsupported(format!("transport {kind:?} rejected"));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    fn try_setup(
        &mut self,
        media: &Media,
        format: &Format,
        control_url: &RtspUrl,
        port_hint: Option<(u16, u16)>,
        mode: TransportMode,
        kind: TransportKind,
    ) -> Result<usize> {
        let record = mode == TransportMode::Record;
        let mut offer = TransportHeader {
            mode: record.then_some(TransportMode::Record),
            ..TransportHeader::default()
        };

        // Resources prepared before the request, bound after the 200.
        let mut udp_endpoint = None;
        let mut channels = None;

        match kind {
            TransportKind::Udp => {
                let endpoint = self.bind_udp(port_hint)?;
                let (rtp_port, rtcp_port) = endpoint.local_ports();
                offer.protocol = Some(TransportProtocol::Udp);
                offer.delivery = Some(Delivery::Unicast);
                offer.client_port = Some((rtp_port, rtcp_port));
                udp_endpoint = Some(endpoint);
            }
            TransportKind::Multicast => {
                offer.protocol = Some(TransportProtocol::Udp);
                offer.delivery = Some(Delivery::Multicast);
            }
            TransportKind::Tcp => {
                let pair = self.shared.channels.lock().allocate_pair()?;
                offer.protocol = Some(TransportProtocol::Tcp);
                offer.delivery = Some(Delivery::Unicast);
                offer.interleaved = Some(pair);
                channels = Some(pair);
            }
        }

        let headers = [("Transport".to_string(), offer.serialize())];
        let response = self.transaction(Method::Setup, control_url, &headers, Vec::new())?;
        let response = expect_ok(response)?;

        // Session id, assigned on the first SETUP.
        if let Some(value) = response.headers.get("Session") {
            let header = SessionHeader::parse(value)?;
            *self.shared.session.write() = Some(header);
        }

        let answer = response
            .headers
            .get("Transport")
            .map(TransportHeader::parse)
            .transpose()?
            .unwrap_or_default();

        let media_index = self.shared.setups.read().len();
        let endpoint = match kind {
            TransportKind::Udp => {
                let endpoint = udp_endpoint.ok_or(RtspError::PortRangeExhausted)?;
                let (server_rtp, server_rtcp) = answer
                    .server_port
                    .ok_or_else(|| RtspError::protocol("SETUP response without server_port"))?;
                let host = answer
                    .destination
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| control_url.host.clone());
                endpoint.set_peer(
                    resolve_addr(&host, server_rtp)?,
                    resolve_addr(&host, server_rtcp)?,
                );
                endpoint.start(self.shared.clone().media_handler(media_index));
                Endpoint::Udp(endpoint)
            }
            TransportKind::Multicast => {
                let group = match answer.destination {
                    Some(std::net::IpAddr::V4(group)) => group,
                    _ => return Err(RtspError::protocol("multicast SETUP without destination")),
                };
                let (rtp_port, _) = answer
                    .server_port
                    .ok_or_else(|| RtspError::protocol("multicast SETUP without port"))?;
                let endpoint = if record {
                    let ttl = answer.ttl.unwrap_or(16) as u32;
                    UdpEndpoint::multicast_sender(group, rtp_port, ttl)?
                } else {
                    UdpEndpoint::multicast_receiver(group, rtp_port)?
                };
                if record {
                    endpoint.start_sender();
                } else {
                    endpoint.start(self.shared.clone().media_handler(media_index));
                }
                Endpoint::Udp(endpoint)
            }
            TransportKind::Tcp => {
                let (rtp_channel, rtcp_channel) = answer
                    .interleaved
                    .or(channels)
                    .ok_or_else(|| RtspError::protocol("interleaved SETUP without channels"))?;
                self.shared.channels.lock().reserve(rtp_channel);
                let writer = self
                    .shared
                    .conn
                    .read()
                    .as_ref()
                    .map(|conn| conn.writer.clone())
                    .ok_or(RtspError::Closed)?;
                let mut bindings = self.shared.channel_bindings.write();
                bindings.insert(rtp_channel, (media_index, false));
                bindings.insert(rtcp_channel, (media_index, true));
                Endpoint::Tcp(crate::transport::TcpEndpoint::new(
                    writer,
                    rtp_channel,
                    rtcp_channel,
                ))
            }
        };

        // The per-SETUP Location header overrides the control attribute.
        let control_url = match response.headers.get("Location") {
            Some(location) => RtspUrl::parse(location).unwrap_or_else(|_| control_url.clone()),
            None => control_url.clone(),
        };

        let (rtcp_receiver, rtcp_sender) = if record {
            (
                None,
                Some(Mutex::new(RtcpSender::new(
                    format.clock_rate(),
                    DEFAULT_REPORT_PERIOD,
                ))),
            )
        } else {
            (
                Some(Mutex::new(RtcpReceiver::new(
                    rand::rng().random::<u32>(),
                    format.clock_rate(),
                ))),
                None,
            )
        };

        self.shared.setups.write().push(Arc::new(SetupEntry {
            media: media.clone(),
            format: format.clone(),
            control_url,
            endpoint,
            rtcp_receiver,
            rtcp_sender,
            next_report: Mutex::new(Instant::now()),
        }));
        *self.shared.current_transport.lock() = Some(kind);
        *self.shared.state.lock() = ClientState::Prepared;

        tracing::info!(media_index, transport = ?kind, record, "media set up");
        Ok(media_index)
    }

    fn bind_udp(&self, port_hint: Option<(u16, u16)>) -> Result<UdpEndpoint> {
        if let Some((rtp_port, rtcp_port)) = port_hint {
            let rtp = UdpSocket::bind(("0.0.0.0", rtp_port));
            let rtcp = UdpSocket::bind(("0.0.0.0", rtcp_port));
            if let (Ok(rtp), Ok(rtcp)) = (rtp, rtcp) {
                return UdpEndpoint::from_socket_pair(rtp, rtcp);
            }
            tracing::debug!(rtp_port, "hinted ports unavailable, using allocator range");
        }
        UdpEndpoint::bind(&self.allocator)
    }

    /// Spawn the keepalive and RTCP report threads, once.
    fn start_timers(&mut self) {
        if !self.timer_handles.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        self.timer_handles
            .push(thread::spawn(move || keepalive_loop(shared)));
        let shared = self.shared.clone();
        self.timer_handles
            .push(thread::spawn(move || rtcp_report_loop(shared)));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write-only handle onto a recording client, cheap to clone into
/// packet callbacks.
#[derive(Clone)]
pub struct PacketWriter {
    shared: Arc<ClientShared>,
}

impl PacketWriter {
    pub fn write_packet_rtp(&self, media_index: usize, packet: &RtpPacket) -> Result<()> {
        self.shared.write_packet_rtp(media_index, packet)
    }
}

impl ClientShared {
    fn write_packet_rtp(&self, media_index: usize, packet: &RtpPacket) -> Result<()> {
        if *self.state.lock() != ClientState::Recording {
            return Err(RtspError::InvalidState(
                "write_packet_rtp requires Recording".to_string(),
            ));
        }
        let entry = self
            .setups
            .read()
            .get(media_index)
            .cloned()
            .ok_or_else(|| RtspError::StreamNotFound(format!("media {media_index}")))?;

        let bytes = packet.serialize();
        if matches!(entry.endpoint, Endpoint::Udp(_))
            && bytes.len() > self.config.udp_max_payload_size
        {
            tracing::warn!(len = bytes.len(), "RTP packet exceeds UDP payload limit, dropped");
            return Ok(());
        }
        if let Some(sender) = &entry.rtcp_sender {
            sender
                .lock()
                .process_packet(&packet.header, packet.payload.len(), SystemTime::now());
        }
        entry.endpoint.send_rtp(bytes)
    }

    /// Send one request and wait for its response, matching by CSeq.
    fn roundtrip(
        &self,
        method: Method,
        url: &RtspUrl,
        headers: &[(String, String)],
        body: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        if self.fatal.is_set() {
            return Err(RtspError::Closed);
        }
        let writer = self
            .conn
            .read()
            .as_ref()
            .map(|conn| conn.writer.clone())
            .ok_or_else(|| RtspError::InvalidState("not connected".to_string()))?;

        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut request = Request::new(method, url.without_credentials().to_string());
        request.headers.add("CSeq", cseq.to_string());
        if let Some(session) = self.session.read().as_ref() {
            request.headers.add("Session", session.id.clone());
        }
        request.headers.add("User-Agent", self.config.user_agent.clone());
        if let Some(auth) = self.auth.lock().as_ref() {
            request.headers.add(
                "Authorization",
                auth.authorization(method, &url.without_credentials().to_string()),
            );
        }
        for (name, value) in headers {
            request.headers.add(name.clone(), value.clone());
        }
        request.body = body.to_vec();

        let (tx, rx) = mpsc::sync_channel(1);
        *self.pending.lock() = Some(tx);
        writer.send_control(request.serialize())?;
        *self.last_request.lock() = Instant::now();

        let response = rx.recv_timeout(timeout).map_err(|_| {
            *self.pending.lock() = None;
            RtspError::Timeout(format!("no response to {method} within {timeout:?}"))
        })?;

        // CSeq echo is an invariant; a mismatch means the transaction
        // layer lost sync.
        if response.headers.cseq() != Some(cseq) {
            return Err(RtspError::protocol(format!(
                "CSeq mismatch: sent {cseq}, got {:?}",
                response.headers.cseq()
            )));
        }
        Ok(response)
    }

    /// Handler for UDP endpoints of one media.
    fn media_handler(self: Arc<Self>, media_index: usize) -> crate::transport::PacketHandler {
        Arc::new(move |channel, payload, _source| {
            let entry = self.setups.read().get(media_index).cloned();
            if let Some(entry) = entry {
                self.dispatch_media(&entry, media_index, channel, payload);
            }
        })
    }

    /// Per-media packet path shared by UDP and interleaved reception.
    fn dispatch_media(&self, entry: &SetupEntry, media_index: usize, channel: RtpChannel, payload: &[u8]) {
        match channel {
            RtpChannel::Rtp => match RtpPacket::parse(payload) {
                Ok(packet) => {
                    if let Some(receiver) = &entry.rtcp_receiver {
                        receiver
                            .lock()
                            .process_packet(&packet.header, SystemTime::now());
                    }
                    if let Some(callback) = self.on_rtp.read().as_ref() {
                        callback(media_index, &packet);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "dropped malformed RTP packet"),
            },
            RtpChannel::Rtcp => {
                match rtcp::report::parse_compound(payload) {
                    Ok(packets) => {
                        if let Some(receiver) = &entry.rtcp_receiver {
                            let mut receiver = receiver.lock();
                            for packet in packets {
                                if let RtcpPacket::SenderReport(sr) = packet {
                                    receiver.process_sender_report(&sr, SystemTime::now());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "dropped malformed RTCP packet");
                        return;
                    }
                }
                if let Some(callback) = self.on_rtcp.read().as_ref() {
                    callback(media_index, payload);
                }
            }
        }
    }

    /// Answer requests the server initiates on the control connection.
    fn handle_server_request(&self, request: &Request) {
        let cseq = request
            .headers
            .cseq()
            .map(|value| value.to_string())
            .unwrap_or_else(|| "0".to_string());
        let response = Response::ok().with_header("CSeq", &cseq);

        let writer = self.conn.read().as_ref().map(|conn| conn.writer.clone());
        if let Some(writer) = writer {
            let _ = writer.send_control(response.serialize());
        }

        if request.method == Method::Teardown {
            tracing::info!("session terminated by server");
            self.fatal.set(RtspError::Closed);
        }
    }
}

fn reader_loop(shared: Arc<ClientShared>, stream: TcpStream) {
    let mut reader = BufReader::new(stream);
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        match read_message(&mut reader) {
            Ok(ControlMessage::Response(response)) => {
                let pending = shared.pending.lock().take();
                match pending {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::trace!(status = response.status, "response with no outstanding request")
                    }
                }
            }
            Ok(ControlMessage::Request(request)) => shared.handle_server_request(&request),
            Ok(ControlMessage::Frame(frame)) => dispatch_frame(&shared, frame),
            Err(RtspError::Closed) => {
                if !shared.closed.load(Ordering::SeqCst) {
                    shared.fatal.set(RtspError::Closed);
                }
                break;
            }
            Err(e) => {
                if !shared.closed.load(Ordering::SeqCst) {
                    shared.fatal.set(e);
                }
                break;
            }
        }
    }
    tracing::debug!("reader loop exited");
}

fn dispatch_frame(shared: &Arc<ClientShared>, frame: InterleavedFrame) {
    let binding = shared.channel_bindings.read().get(&frame.channel).copied();
    let Some((media_index, is_rtcp)) = binding else {
        tracing::trace!(channel = frame.channel, "frame on unbound channel dropped");
        return;
    };
    let entry = shared.setups.read().get(media_index).cloned();
    if let Some(entry) = entry {
        let channel = if is_rtcp {
            RtpChannel::Rtcp
        } else {
            RtpChannel::Rtp
        };
        shared.dispatch_media(&entry, media_index, channel, &frame.payload);
    }
}

/// Keepalive: when no request has been sent for half the session
/// timeout, issue GET_PARAMETER (or OPTIONS). A keepalive that gets no
/// answer ends the session.
fn keepalive_loop(shared: Arc<ClientShared>) {
    loop {
        thread::sleep(TIMER_POLL);
        if shared.closed.load(Ordering::SeqCst) || shared.fatal.is_set() {
            break;
        }

        let timeout = shared
            .session
            .read()
            .as_ref()
            .and_then(|session| session.timeout)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));
        let idle = shared.last_request.lock().elapsed();
        if idle < timeout / 2 {
            continue;
        }

        let Some(base_url) = shared.base_url.read().clone() else {
            continue;
        };
        let method = *shared.keepalive_method.lock();
        let result = {
            let _guard = shared.request_lock.lock();
            shared.roundtrip(method, &base_url, &[], &[], shared.config.read_timeout)
        };
        match result {
            Ok(response) if response.status == 200 => {
                tracing::trace!(%method, "keepalive answered");
            }
            Ok(response) => {
                tracing::warn!(status = response.status, "keepalive rejected");
                shared.fatal.set(RtspError::BadStatus {
                    status: response.status,
                    reason: response.reason,
                });
                break;
            }
            Err(_) if shared.closed.load(Ordering::SeqCst) => break,
            Err(e) => {
                tracing::warn!(error = %e, "keepalive failed");
                shared
                    .fatal
                    .set(RtspError::Timeout("keepalive failed".to_string()));
                break;
            }
        }
    }
}

/// Emit due Receiver Reports (playing) or Sender Reports (recording).
fn rtcp_report_loop(shared: Arc<ClientShared>) {
    loop {
        thread::sleep(TIMER_POLL);
        if shared.closed.load(Ordering::SeqCst) || shared.fatal.is_set() {
            break;
        }
        let now = Instant::now();
        for entry in shared.setups.read().iter() {
            {
                let mut due = entry.next_report.lock();
                if *due > now {
                    continue;
                }
                *due = now + rtcp::randomized_interval(DEFAULT_REPORT_PERIOD);
            }
            if let Some(receiver) = &entry.rtcp_receiver
                && let Some(report) = receiver.lock().report(SystemTime::now())
            {
                let _ = entry.endpoint.send_rtcp(report.marshal());
            }
            if let Some(sender) = &entry.rtcp_sender
                && let Some(report) = sender.lock().report(SystemTime::now())
            {
                let _ = entry.endpoint.send_rtcp(report.marshal());
            }
        }
    }
}

fn expect_ok(response: Response) -> Result<Response> {
    if response.status == 200 {
        Ok(response)
    } else {
        Err(RtspError::BadStatus {
            status: response.status,
            reason: response.reason,
        })
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| RtspError::InvalidUrl(format!("unresolvable host: {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(
            config.transport_preference,
            vec![
                TransportKind::Udp,
                TransportKind::Multicast,
                TransportKind::Tcp
            ]
        );
    }

    #[test]
    fn lifecycle_guards() {
        let allocator = Arc::new(PortAllocator::new((24000, 24100)));
        let mut client = Client::new(allocator);

        // Nothing is connected yet.
        assert!(matches!(
            client.play(None),
            Err(RtspError::InvalidState(_))
        ));
        assert!(matches!(
            client.record(),
            Err(RtspError::InvalidState(_))
        ));
        let packet = RtpPacket {
            header: crate::rtp::RtpHeader::new(96, 1),
            payload: vec![],
        };
        assert!(matches!(
            client.write_packet_rtp(0, &packet),
            Err(RtspError::InvalidState(_))
        ));
    }

    #[test]
    fn rtsps_is_refused() {
        let allocator = Arc::new(PortAllocator::new((24200, 24300)));
        let mut client = Client::new(allocator);
        assert!(matches!(
            client.start(Scheme::Rtsps, "localhost:322"),
            Err(RtspError::Unsupported(_))
        ));
    }

    #[test]
    fn fatal_cell_first_error_wins() {
        let cell = FatalCell::new();
        cell.set(RtspError::Closed);
        cell.set(RtspError::PortRangeExhausted);
        assert!(matches!(cell.wait(), RtspError::Closed));
    }
}
