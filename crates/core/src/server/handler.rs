//! Per-connection RTSP request dispatch.
//!
//! One handler exists per TCP connection. It owns the connection's
//! interleaved channel allocator and auth validator, resolves sessions
//! and streams, and applies the method/state table:
//!
//! | Method | Allowed session states |
//! |--------|------------------------|
//! | OPTIONS, DESCRIBE, ANNOUNCE, GET/SET_PARAMETER | any |
//! | SETUP | none yet, Initial, Prepared, PreparedRecord |
//! | PLAY | Prepared |
//! | RECORD | PreparedRecord |
//! | PAUSE | Playing, Recording |
//! | TEARDOWN | any with a session |
//!
//! A request outside the table gets 455; an unknown session gets 454;
//! a transport offer the server cannot satisfy gets 461.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::auth::Validator;
use crate::protocol::headers::{
    Delivery, RangeHeader, RtpInfoEntry, SessionHeader, TransportHeader, TransportMode,
    TransportProtocol,
};
use crate::protocol::message::{Method, Request, Response};
use crate::protocol::sdp;
use crate::rtcp::RtcpReceiver;
use crate::server::session::{ServerSession, SessionManager, SessionMedia, SessionState};
use crate::server::stream::{ServerStream, StreamRegistry};
use crate::server::{SERVER_AGENT, ServerShared, dispatch_inbound_media};
use crate::transport::tcp::ChannelAllocator;
use crate::transport::{ConnWriter, Endpoint, TcpEndpoint, TransportKind, UdpEndpoint};
use crate::url::RtspUrl;

/// Where an inbound interleaved frame belongs.
#[derive(Clone)]
pub struct ChannelBinding {
    pub session_id: String,
    pub path: String,
    pub media_index: usize,
    pub is_rtcp: bool,
}

/// Outcome of one request: the response plus whether the connection
/// should close afterwards (TEARDOWN).
pub struct HandlerOutcome {
    pub response: Response,
    pub close_connection: bool,
}

impl From<Response> for HandlerOutcome {
    fn from(response: Response) -> Self {
        HandlerOutcome {
            response,
            close_connection: false,
        }
    }
}

/// Handles RTSP method requests for a single TCP connection.
pub struct MethodHandler {
    conn_id: u64,
    peer_addr: SocketAddr,
    shared: Arc<ServerShared>,
    writer: Arc<ConnWriter>,
    /// Interleaved channel dispatch table, shared with the reader loop.
    channel_map: Arc<RwLock<HashMap<u8, ChannelBinding>>>,
    channels: ChannelAllocator,
    validator: Option<Validator>,
    /// Streams published through ANNOUNCE on this connection, removed on
    /// disconnect.
    announced_paths: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        conn_id: u64,
        peer_addr: SocketAddr,
        shared: Arc<ServerShared>,
        writer: Arc<ConnWriter>,
        channel_map: Arc<RwLock<HashMap<u8, ChannelBinding>>>,
    ) -> Self {
        MethodHandler {
            conn_id,
            peer_addr,
            shared,
            writer,
            channel_map,
            channels: ChannelAllocator::new(),
            validator: None,
            announced_paths: Vec::new(),
        }
    }

    pub fn announced_paths(&self) -> &[String] {
        &self.announced_paths
    }

    fn sessions(&self) -> &SessionManager {
        &self.shared.sessions
    }

    fn registry(&self) -> &StreamRegistry {
        &self.shared.registry
    }

    pub fn handle(&mut self, request: &Request) -> HandlerOutcome {
        let cseq = request
            .headers
            .cseq()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "0".to_string());

        // Any request naming a live session counts as activity.
        if let Some(session) = self.request_session(request) {
            session.touch();
        }

        if request.method != Method::Options
            && let Some(response) = self.check_auth(request, &cseq)
        {
            return response.into();
        }

        match request.method {
            Method::Options => self.handle_options(&cseq).into(),
            Method::Describe => self.handle_describe(&cseq, &request.uri).into(),
            Method::Announce => self.handle_announce(&cseq, request).into(),
            Method::Setup => self.handle_setup(&cseq, request).into(),
            Method::Play => self.handle_play(&cseq, request).into(),
            Method::Record => self.handle_record(&cseq, request).into(),
            Method::Pause => self.handle_pause(&cseq, request).into(),
            Method::Teardown => self.handle_teardown(&cseq, request),
            Method::GetParameter | Method::SetParameter => {
                self.handle_parameter(&cseq, request).into()
            }
        }
    }

    fn base(&self, response: Response, cseq: &str) -> Response {
        response
            .with_header("CSeq", cseq)
            .with_header("Server", SERVER_AGENT)
    }

    /// 401 with the connection's challenge when credentials fail.
    fn check_auth(&mut self, request: &Request, cseq: &str) -> Option<Response> {
        let credentials = self.shared.config.credentials.clone()?;
        let realm = self.shared.config.auth_realm.clone();
        let base_url = self
            .request_session(request)
            .and_then(|session| session.base_url.lock().clone());

        let validator = self
            .validator
            .get_or_insert_with(|| Validator::new(&credentials, None, &realm));

        let error = match validator.validate(request, base_url.as_ref()) {
            Ok(()) => return None,
            Err(e) => e,
        };
        let challenges = validator.header();

        tracing::debug!(peer = %self.peer_addr, error = %error, "authentication failed");
        let mut response = self.base(Response::unauthorized(), cseq);
        for challenge in &challenges {
            response = response.with_header("WWW-Authenticate", challenge);
        }
        Some(response)
    }

    fn handle_options(&self, cseq: &str) -> Response {
        tracing::debug!(%cseq, "OPTIONS");
        self.base(Response::ok(), cseq).with_header(
            "Public",
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, GET_PARAMETER, SET_PARAMETER, TEARDOWN",
        )
    }

    /// Host for SDP `o=`/`c=` lines: configured public host, else the
    /// host of the request URI, else the peer address.
    fn sdp_host(&self, uri: &str) -> String {
        if let Some(host) = &self.shared.config.public_host {
            return host.clone();
        }
        if let Ok(url) = RtspUrl::parse(uri)
            && !url.host.is_empty()
        {
            return url.host;
        }
        self.peer_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> Response {
        tracing::debug!(%cseq, uri, "DESCRIBE");
        let Some((path, stream)) = self.registry().resolve(uri) else {
            tracing::warn!(uri, "DESCRIBE for unknown stream");
            return self.base(Response::not_found(), cseq);
        };

        let host = self.sdp_host(uri);
        let body = sdp::generate(stream.medias(), &host, &self.shared.config.origin);
        tracing::trace!(path, "generated SDP");

        self.base(Response::ok(), cseq)
            .with_header("Content-Base", uri)
            .with_body("application/sdp", body.into_bytes())
    }

    fn handle_announce(&mut self, cseq: &str, request: &Request) -> Response {
        let path = match RtspUrl::parse(&request.uri) {
            Ok(url) => url.path,
            Err(_) => return self.base(Response::bad_request(), cseq),
        };
        let medias = match sdp::parse(&request.body) {
            Ok(medias) => medias,
            Err(e) => {
                tracing::warn!(%cseq, error = %e, "ANNOUNCE with unparsable SDP");
                return self.base(Response::bad_request(), cseq);
            }
        };

        tracing::info!(path, medias = medias.len(), "stream announced");
        let stream = ServerStream::new(medias, self.shared.config.udp_max_payload_size);
        self.registry().add(&path, stream);
        self.announced_paths.push(path);
        self.base(Response::ok(), cseq)
    }

    fn handle_setup(&mut self, cseq: &str, request: &Request) -> Response {
        let Some((path, stream)) = self.registry().resolve(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown stream");
            return self.base(Response::not_found(), cseq);
        };
        let Some(media_index) = stream.find_media_by_control(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP target matches no media control");
            return self.base(Response::not_found(), cseq);
        };

        let Some(transport_value) = request.headers.get("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return self.base(Response::bad_request(), cseq);
        };
        let offers = TransportHeader::parse_offers(transport_value);
        let Some((kind, offer)) = self.pick_transport(&offers) else {
            tracing::warn!(%cseq, transport = %transport_value, "no acceptable transport offer");
            return self.base(Response::unsupported_transport(), cseq);
        };

        // Locate or create the session.
        let session = match self.request_session_id(request) {
            Some(id) => match self.sessions().get(&id) {
                Some(session) => {
                    if !matches!(
                        session.state(),
                        SessionState::Initial | SessionState::Prepared | SessionState::PreparedRecord
                    ) {
                        return self.base(Response::method_not_valid(), cseq);
                    }
                    session
                }
                None => {
                    tracing::warn!(session_id = %id, "SETUP for unknown session");
                    return self.base(Response::session_not_found(), cseq);
                }
            },
            None => self.sessions().create(
                &path,
                self.conn_id,
                self.shared.config.session_timeout,
            ),
        };

        // All media of a session ride one transport variant.
        if let Some(existing) = session.transport_kind()
            && existing != kind
        {
            return self.base(Response::unsupported_transport(), cseq);
        }

        let record = offer.mode == Some(TransportMode::Record);
        if let Ok(mut url) = RtspUrl::parse(&request.uri) {
            url.path = path.clone();
            url.user = None;
            url.pass = None;
            *session.base_url.lock() = Some(url);
        }

        let mut transport_response = TransportHeader {
            protocol: Some(match kind {
                TransportKind::Tcp => TransportProtocol::Tcp,
                _ => TransportProtocol::Udp,
            }),
            mode: record.then_some(TransportMode::Record),
            ..TransportHeader::default()
        };

        let endpoint = match kind {
            TransportKind::Udp => {
                let Some((client_rtp, client_rtcp)) = offer.client_port else {
                    return self.base(Response::bad_request(), cseq);
                };
                let udp = match UdpEndpoint::bind(&self.shared.allocator) {
                    Ok(udp) => udp,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to allocate server ports");
                        return self.base(Response::new(500, "Internal Server Error"), cseq);
                    }
                };
                let client_ip = self.peer_addr.ip();
                udp.set_peer(
                    SocketAddr::new(client_ip, client_rtp),
                    SocketAddr::new(client_ip, client_rtcp),
                );
                udp.start(self.shared.clone().inbound_media_handler(
                    session.id.clone(),
                    path.clone(),
                    media_index,
                ));
                let server_port = udp.local_ports();
                transport_response.delivery = Some(Delivery::Unicast);
                transport_response.client_port = Some((client_rtp, client_rtcp));
                transport_response.server_port = Some(server_port);
                Endpoint::Udp(udp)
            }
            TransportKind::Multicast => {
                let (shared_endpoint, group, port) = match stream.multicast_endpoint(
                    media_index,
                    &self.shared.multicast,
                    self.shared.config.multicast_ttl,
                ) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to open multicast endpoint");
                        return self.base(Response::new(500, "Internal Server Error"), cseq);
                    }
                };
                transport_response.delivery = Some(Delivery::Multicast);
                transport_response.destination = Some(group.into());
                transport_response.ttl = Some(self.shared.config.multicast_ttl as u8);
                transport_response.server_port = Some((port, port + 1));
                Endpoint::Multicast(shared_endpoint)
            }
            TransportKind::Tcp => {
                let (rtp_channel, rtcp_channel) = match offer.interleaved {
                    Some((rtp, rtcp)) => {
                        self.channels.reserve(rtp);
                        (rtp, rtcp)
                    }
                    None => match self.channels.allocate_pair() {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "interleaved channels exhausted");
                            return self.base(Response::unsupported_transport(), cseq);
                        }
                    },
                };
                let mut map = self.channel_map.write();
                map.insert(
                    rtp_channel,
                    ChannelBinding {
                        session_id: session.id.clone(),
                        path: path.clone(),
                        media_index,
                        is_rtcp: false,
                    },
                );
                map.insert(
                    rtcp_channel,
                    ChannelBinding {
                        session_id: session.id.clone(),
                        path: path.clone(),
                        media_index,
                        is_rtcp: true,
                    },
                );
                transport_response.delivery = Some(Delivery::Unicast);
                transport_response.interleaved = Some((rtp_channel, rtcp_channel));
                Endpoint::Tcp(TcpEndpoint::new(self.writer.clone(), rtp_channel, rtcp_channel))
            }
        };

        let rtcp_receiver = record.then(|| {
            let clock_rate = stream
                .primary_format(media_index)
                .map(|f| f.format.clock_rate())
                .unwrap_or(90000);
            Mutex::new(RtcpReceiver::new(rand::rng().random::<u32>(), clock_rate))
        });

        session.set_transport_kind(kind);
        session.add_setup(SessionMedia {
            media_index,
            endpoint: Arc::new(endpoint),
            rtcp_receiver,
            next_report: Mutex::new(Instant::now()),
        });
        session.set_state(if record {
            SessionState::PreparedRecord
        } else {
            SessionState::Prepared
        });

        tracing::info!(
            session_id = %session.id,
            path,
            media_index,
            transport = ?kind,
            record,
            "media set up"
        );

        self.base(Response::ok(), cseq)
            .with_header("Transport", &transport_response.serialize())
            .with_header("Session", &session.header_value())
    }

    /// First offer the server can satisfy, in the client's order.
    fn pick_transport(
        &self,
        offers: &[TransportHeader],
    ) -> Option<(TransportKind, TransportHeader)> {
        let allowed = &self.shared.config.allowed_transports;
        offers.iter().find_map(|offer| match offer.protocol {
            Some(TransportProtocol::Tcp) if allowed.contains(&TransportKind::Tcp) => {
                Some((TransportKind::Tcp, offer.clone()))
            }
            Some(TransportProtocol::Udp) => {
                if offer.delivery == Some(Delivery::Multicast) {
                    allowed
                        .contains(&TransportKind::Multicast)
                        .then(|| (TransportKind::Multicast, offer.clone()))
                } else {
                    (allowed.contains(&TransportKind::Udp) && offer.client_port.is_some())
                        .then(|| (TransportKind::Udp, offer.clone()))
                }
            }
            _ => None,
        })
    }

    fn handle_play(&mut self, cseq: &str, request: &Request) -> Response {
        let Some(session) = self.request_session(request) else {
            tracing::warn!(%cseq, "PLAY without valid session");
            return self.base(Response::session_not_found(), cseq);
        };
        if session.state() != SessionState::Prepared {
            tracing::warn!(session_id = %session.id, state = ?session.state(), "PLAY in wrong state");
            return self.base(Response::method_not_valid(), cseq)
                .with_header("Session", &session.header_value());
        }
        let Some(stream) = self.registry().get(&session.path) else {
            return self.base(Response::not_found(), cseq);
        };

        for setup in session.setups() {
            // Multicast delivery flows through the stream's shared
            // endpoint; only unicast endpoints subscribe.
            if !matches!(*setup.endpoint, Endpoint::Multicast(_)) {
                stream.subscribe(&session.id, setup.media_index, setup.endpoint.clone());
            }
        }
        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, "session playing");

        let range = request
            .headers
            .get("Range")
            .and_then(|value| RangeHeader::parse(value).ok())
            .map(|range| range.serialize())
            .unwrap_or_else(|| "npt=0.000-".to_string());

        let mut response = self
            .base(Response::ok(), cseq)
            .with_header("Session", &session.header_value())
            .with_header("Range", &range);

        if let Some(rtp_info) = self.rtp_info_for(&session, &stream) {
            response = response.with_header("RTP-Info", &rtp_info);
        }
        response
    }

    /// `RTP-Info` entries for media that have already carried packets.
    fn rtp_info_for(&self, session: &ServerSession, stream: &ServerStream) -> Option<String> {
        let base_url = session.base_url.lock().clone()?;
        let mut entries = Vec::new();
        for setup in session.setups() {
            let Some(format) = stream.primary_format(setup.media_index) else {
                continue;
            };
            let control = &stream.medias()[setup.media_index].control;
            let url = base_url.join(control).ok()?;
            let sender = format.rtcp_sender.lock();
            if let (Some(seq), Some(rtptime)) = (sender.last_sequence(), sender.last_rtp_timestamp())
            {
                entries.push(RtpInfoEntry {
                    url: url.to_string(),
                    seq: Some(seq.wrapping_add(1)),
                    rtptime: Some(rtptime),
                });
            }
        }
        (!entries.is_empty()).then(|| RtpInfoEntry::serialize_list(&entries))
    }

    fn handle_record(&mut self, cseq: &str, request: &Request) -> Response {
        let Some(session) = self.request_session(request) else {
            tracing::warn!(%cseq, "RECORD without valid session");
            return self.base(Response::session_not_found(), cseq);
        };
        if session.state() != SessionState::PreparedRecord {
            tracing::warn!(session_id = %session.id, state = ?session.state(), "RECORD in wrong state");
            return self.base(Response::method_not_valid(), cseq)
                .with_header("Session", &session.header_value());
        }
        session.set_state(SessionState::Recording);
        tracing::info!(session_id = %session.id, "session recording");
        self.base(Response::ok(), cseq)
            .with_header("Session", &session.header_value())
    }

    fn handle_pause(&mut self, cseq: &str, request: &Request) -> Response {
        let Some(session) = self.request_session(request) else {
            tracing::warn!(%cseq, "PAUSE without valid session");
            return self.base(Response::session_not_found(), cseq);
        };
        match session.state() {
            SessionState::Playing => {
                self.registry().unsubscribe_session(&session.id);
                session.set_state(SessionState::Prepared);
            }
            SessionState::Recording => session.set_state(SessionState::PreparedRecord),
            state => {
                tracing::warn!(session_id = %session.id, ?state, "PAUSE in wrong state");
                return self.base(Response::method_not_valid(), cseq)
                    .with_header("Session", &session.header_value());
            }
        }
        tracing::info!(session_id = %session.id, "session paused");
        self.base(Response::ok(), cseq)
            .with_header("Session", &session.header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &Request) -> HandlerOutcome {
        let Some(session) = self.request_session(request) else {
            tracing::warn!(%cseq, "TEARDOWN without valid session");
            return self.base(Response::session_not_found(), cseq).into();
        };

        self.sessions().remove(&session.id);
        self.registry().unsubscribe_session(&session.id);
        session.close_endpoints();
        self.channel_map
            .write()
            .retain(|_, binding| binding.session_id != session.id);
        tracing::info!(session_id = %session.id, "session torn down");

        HandlerOutcome {
            response: self.base(Response::ok(), cseq),
            close_connection: true,
        }
    }

    /// GET_PARAMETER doubles as the keepalive; SET_PARAMETER mirrors it.
    fn handle_parameter(&self, cseq: &str, request: &Request) -> Response {
        tracing::trace!(%cseq, method = %request.method, "parameter request");
        let body = self
            .shared
            .parameter_callback
            .read()
            .as_ref()
            .and_then(|callback| callback(request.method, request));

        let mut response = self.base(Response::ok(), cseq);
        if let Some(session) = self.request_session(request) {
            response = response.with_header("Session", &session.header_value());
        }
        match body {
            Some(body) => response.with_body("text/parameters", body),
            None => response,
        }
    }

    fn request_session_id(&self, request: &Request) -> Option<String> {
        let value = request.headers.get("Session")?;
        SessionHeader::parse(value).ok().map(|header| header.id)
    }

    fn request_session(&self, request: &Request) -> Option<Arc<ServerSession>> {
        self.sessions().get(&self.request_session_id(request)?)
    }
}

/// Inbound media dispatch for UDP endpoints, late-bound through the
/// session manager so a torn-down session stops the flow.
impl ServerShared {
    pub(crate) fn inbound_media_handler(
        self: Arc<Self>,
        session_id: String,
        path: String,
        media_index: usize,
    ) -> crate::transport::PacketHandler {
        Arc::new(move |channel, payload, _source| {
            let Some(session) = self.sessions.get(&session_id) else {
                return;
            };
            let Some(setup) = session
                .setups()
                .into_iter()
                .find(|setup| setup.media_index == media_index)
            else {
                return;
            };
            dispatch_inbound_media(&self, &path, &setup, channel, payload);
        })
    }
}
