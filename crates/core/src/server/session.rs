//! Server-side RTSP session state (RFC 2326 §3, §12.37).
//!
//! A session is created by the first SETUP on a connection and destroyed
//! by TEARDOWN, client disconnect, or timeout expiry. It tracks:
//!
//! - A unique random ID (16 hex chars, never reused for the lifetime of
//!   the server).
//! - The state machine: Initial → Prepared → Playing, or
//!   Initial → PreparedRecord → Recording; PAUSE returns to the prepared
//!   state; TEARDOWN is terminal.
//! - Per-media transport endpoints and, for recording sessions, the RTCP
//!   receivers feeding Receiver Reports.
//! - A last-activity instant; any request on the session refreshes it.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::RngExt;
use std::sync::Arc;

use crate::rtcp::RtcpReceiver;
use crate::transport::{Endpoint, TransportKind};
use crate::url::RtspUrl;

/// Default session timeout (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no media set up yet.
    Initial,
    /// At least one media set up for playback.
    Prepared,
    /// At least one media set up with `mode=record`.
    PreparedRecord,
    Playing,
    Recording,
}

/// One set-up media within a session.
pub struct SessionMedia {
    pub media_index: usize,
    pub endpoint: Arc<Endpoint>,
    /// Present on recording sessions: reception statistics for the
    /// incoming stream.
    pub rtcp_receiver: Option<Mutex<RtcpReceiver>>,
    /// When the next Receiver Report is due.
    pub next_report: Mutex<Instant>,
}

/// A single RTSP session.
pub struct ServerSession {
    pub id: String,
    /// Stream path this session was set up against.
    pub path: String,
    /// Presentation base URL, kept for RTP-Info synthesis and the Digest
    /// URI fallback.
    pub base_url: Mutex<Option<RtspUrl>>,
    /// Connection that created the session.
    pub conn_id: u64,
    pub timeout: Duration,
    state: Mutex<SessionState>,
    transport_kind: Mutex<Option<TransportKind>>,
    setups: Mutex<Vec<Arc<SessionMedia>>>,
    last_activity: Mutex<Instant>,
}

impl ServerSession {
    fn new(id: String, path: &str, conn_id: u64, timeout: Duration) -> Self {
        ServerSession {
            id,
            path: path.to_string(),
            base_url: Mutex::new(None),
            conn_id,
            timeout,
            state: Mutex::new(SessionState::Initial),
            transport_kind: Mutex::new(None),
            setups: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    /// Negotiated transport variant; all media of a session share one.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        *self.transport_kind.lock()
    }

    pub fn set_transport_kind(&self, kind: TransportKind) {
        *self.transport_kind.lock() = Some(kind);
    }

    pub fn add_setup(&self, setup: SessionMedia) -> Arc<SessionMedia> {
        let setup = Arc::new(setup);
        self.setups.lock().push(setup.clone());
        setup
    }

    pub fn setups(&self) -> Vec<Arc<SessionMedia>> {
        self.setups.lock().clone()
    }

    /// Refresh the activity clock; called on every request naming the
    /// session.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(*self.last_activity.lock()) > self.timeout
    }

    /// `Session` response header value, e.g. `"6D4A2F918C3B07E5;timeout=60"`.
    pub fn header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs())
    }

    /// Close every endpoint of the session.
    pub fn close_endpoints(&self) {
        for setup in self.setups.lock().iter() {
            setup.endpoint.close();
        }
    }
}

/// Thread-safe registry of active sessions.
///
/// Issued IDs are remembered for the whole server lifetime so an ID can
/// never be reused, even after its session is destroyed.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<ServerSession>>>>,
    issued_ids: Arc<Mutex<HashSet<String>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            issued_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a session with a fresh random ID and register it.
    pub fn create(&self, path: &str, conn_id: u64, timeout: Duration) -> Arc<ServerSession> {
        let id = self.fresh_id();
        let session = Arc::new(ServerSession::new(id.clone(), path, conn_id, timeout));
        self.sessions.write().insert(id.clone(), session.clone());

        let total = self.sessions.read().len();
        tracing::debug!(session_id = %id, path, total_sessions = total, "session created");
        session
    }

    fn fresh_id(&self) -> String {
        let mut issued = self.issued_ids.lock();
        loop {
            let id = format!("{:016X}", rand::rng().random::<u64>());
            if issued.insert(id.clone()) {
                return id;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session (TEARDOWN, disconnect, expiry).
    pub fn remove(&self, id: &str) -> Option<Arc<ServerSession>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            let total = self.sessions.read().len();
            tracing::debug!(session_id = %id, total_sessions = total, "session removed");
        }
        removed
    }

    /// Remove every session owned by a connection (disconnect cleanup).
    pub fn remove_for_connection(&self, conn_id: u64) -> Vec<Arc<ServerSession>> {
        let mut sessions = self.sessions.write();
        let ids: Vec<String> = sessions
            .values()
            .filter(|s| s.conn_id == conn_id)
            .map(|s| s.id.clone())
            .collect();
        let removed: Vec<_> = ids.iter().filter_map(|id| sessions.remove(id)).collect();
        if !removed.is_empty() {
            tracing::debug!(
                removed = removed.len(),
                remaining = sessions.len(),
                "connection session cleanup"
            );
        }
        removed
    }

    /// Remove every session idle past its timeout.
    pub fn remove_expired(&self, now: Instant) -> Vec<Arc<ServerSession>> {
        let mut sessions = self.sessions.write();
        let ids: Vec<String> = sessions
            .values()
            .filter(|s| s.expired(now))
            .map(|s| s.id.clone())
            .collect();
        ids.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    /// Snapshot of all sessions, for report scheduling.
    pub fn all(&self) -> Vec<Arc<ServerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_long_and_unique() {
        let manager = SessionManager::new();
        let a = manager.create("/stream", 1, DEFAULT_SESSION_TIMEOUT);
        let b = manager.create("/stream", 1, DEFAULT_SESSION_TIMEOUT);
        assert!(a.id.len() >= 8);
        assert_ne!(a.id, b.id);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn id_not_reused_after_removal() {
        let manager = SessionManager::new();
        let session = manager.create("/stream", 1, DEFAULT_SESSION_TIMEOUT);
        let id = session.id.clone();
        manager.remove(&id);
        assert!(manager.issued_ids.lock().contains(&id));
    }

    #[test]
    fn lookup_and_remove() {
        let manager = SessionManager::new();
        let session = manager.create("/stream", 7, DEFAULT_SESSION_TIMEOUT);
        assert!(manager.get(&session.id).is_some());
        assert!(manager.remove(&session.id).is_some());
        assert!(manager.get(&session.id).is_none());
    }

    #[test]
    fn connection_cleanup_targets_owner() {
        let manager = SessionManager::new();
        manager.create("/a", 1, DEFAULT_SESSION_TIMEOUT);
        manager.create("/b", 1, DEFAULT_SESSION_TIMEOUT);
        let other = manager.create("/c", 2, DEFAULT_SESSION_TIMEOUT);

        let removed = manager.remove_for_connection(1);
        assert_eq!(removed.len(), 2);
        assert!(manager.get(&other.id).is_some());
    }

    #[test]
    fn expiry() {
        let manager = SessionManager::new();
        let session = manager.create("/stream", 1, Duration::from_millis(10));
        assert!(!session.expired(Instant::now()));
        std::thread::sleep(Duration::from_millis(30));
        let removed = manager.remove_expired(Instant::now());
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn touch_defers_expiry() {
        let manager = SessionManager::new();
        let session = manager.create("/stream", 1, Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(30));
        session.touch();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!session.expired(Instant::now()));
    }

    #[test]
    fn state_transitions() {
        let manager = SessionManager::new();
        let session = manager.create("/stream", 1, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(session.state(), SessionState::Initial);
        session.set_state(SessionState::Prepared);
        session.set_state(SessionState::Playing);
        assert_eq!(session.state(), SessionState::Playing);
        assert!(session.header_value().contains(";timeout=60"));
    }
}
