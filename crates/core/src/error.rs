//! Error types for the RTSP library.

use std::fmt;

/// Errors that can occur across the RTSP stack.
///
/// Variants map to specific failure modes:
///
/// - **Network**: [`Network`](Self::Network) — socket connect/read/write
///   failures.
/// - **Protocol**: [`Protocol`](Self::Protocol),
///   [`BadStatus`](Self::BadStatus) — malformed messages, unexpected
///   status codes, violated invariants.
/// - **Auth**: [`Auth`](Self::Auth) — missing challenge or rejected
///   credentials.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`StreamNotFound`](Self::StreamNotFound).
/// - **Lifecycle**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning), [`Closed`](Self::Closed),
///   [`InvalidState`](Self::InvalidState).
/// - **Transport**: [`Unsupported`](Self::Unsupported),
///   [`PortRangeExhausted`](Self::PortRangeExhausted),
///   [`Timeout`](Self::Timeout).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Malformed RTSP message or violated protocol invariant.
    #[error("protocol error: {kind}")]
    Protocol { kind: ParseErrorKind },

    /// The peer answered with a status code the operation cannot recover from.
    #[error("bad status: {status} {reason}")]
    BadStatus { status: u16, reason: String },

    /// Feature or transport the library does not provide.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Authentication failed: missing challenge or wrong credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection or session was closed.
    #[error("closed")]
    Closed,

    /// A URL could not be parsed as an RTSP URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// No session with the given ID exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No stream registered at the requested path.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The operation is not valid in the current state machine state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// UDP port allocation exhausted the configured range.
    #[error("port range exhausted")]
    PortRangeExhausted,
}

impl RtspError {
    /// Shorthand for a [`Protocol`](Self::Protocol) error with a free-form
    /// context string.
    pub fn protocol(context: impl Into<String>) -> Self {
        RtspError::Protocol {
            kind: ParseErrorKind::Invalid(context.into()),
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input ended before a complete message was read.
    UnexpectedEof,
    /// The first line did not have the expected request/response format.
    InvalidStartLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A line exceeded the 4 KiB limit.
    LineTooLong,
    /// A message carried more than 255 headers.
    TooManyHeaders,
    /// Free-form parse failure with context.
    Invalid(String),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of stream"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::Invalid(context) => write!(f, "{context}"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
