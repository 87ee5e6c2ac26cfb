//! Error types for the connection core.
//!
//! Every fallible operation returns `Result<T, IoError>`. Errors fall into
//! four groups: consumer misuse (returned synchronously, never changes state),
//! connect-phase failures (reported through the `Error` event and retried),
//! runtime I/O failures on an established link (retried), and process-level
//! faults the event loop cannot continue after.

use thiserror::Error;

/// The canonical error type for the connection core.
#[derive(Debug, Error)]
pub enum IoError {
    // ── Connect-phase errors ─────────────────────────────────────
    /// Host name resolution failed or produced no usable address.
    #[error("error resolving host: {0}")]
    Resolution(String),

    /// No resolved candidate address accepted a TCP connection.
    #[error("error connecting: {0}")]
    Connect(String),

    /// The TLS handshake failed for a reason other than certificate checks.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Certificate verification failed under the `required` policy.
    #[error("TLS certificate verification failed: {0}")]
    TlsVerification(String),

    /// The connect attempt was cancelled before it completed.
    #[error("connection attempt cancelled")]
    Cancelled,

    // ── Consumer misuse ──────────────────────────────────────────
    /// `connect` called on a connection that is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// `connect` called while a connect attempt is in progress.
    #[error("connection in progress")]
    AlreadyConnecting,

    /// The connection is not connected.
    #[error("not connected")]
    NotConnected,

    /// The registry is at capacity.
    #[error("connection limit reached ({capacity})")]
    ConnectionLimitReached { capacity: usize },

    /// The handle does not refer to a live connection.
    #[error("unknown connection")]
    UnknownConnection,

    /// The constructor flags contradict each other.
    #[error("invalid connection flags: {0}")]
    InvalidFlags(&'static str),

    // ── Runtime I/O ──────────────────────────────────────────────
    /// Writing to an established connection failed.
    #[error("write error: {0}")]
    Write(String),

    /// Reading from an established connection failed.
    #[error("read error: {0}")]
    Read(String),

    // ── Process-level faults ─────────────────────────────────────
    /// Registering a signal handler failed.
    #[error("signal registration failed: {0}")]
    Signal(#[source] std::io::Error),

    /// The runtime driving the event loop could not be built.
    #[error("runtime error: {0}")]
    Runtime(#[source] std::io::Error),

    /// Configuration could not be parsed or written.
    #[error("configuration error: {0}")]
    Config(String),
}

// ── ErrorKind ─────────────────────────────────────────────────────

/// Field-less discriminant of [`IoError`], usable as an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Resolution,
    Connect,
    TlsHandshake,
    TlsVerification,
    Cancelled,
    AlreadyConnected,
    AlreadyConnecting,
    NotConnected,
    ConnectionLimitReached,
    UnknownConnection,
    InvalidFlags,
    Write,
    Read,
    Signal,
    Runtime,
    Config,
}

impl ErrorKind {
    /// Static description of the error code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolution => "host resolution failed",
            Self::Connect => "connection failed",
            Self::TlsHandshake => "TLS handshake failed",
            Self::TlsVerification => "TLS certificate verification failed",
            Self::Cancelled => "connection attempt cancelled",
            Self::AlreadyConnected => "already connected",
            Self::AlreadyConnecting => "connection in progress",
            Self::NotConnected => "not connected",
            Self::ConnectionLimitReached => "connection limit reached",
            Self::UnknownConnection => "unknown connection",
            Self::InvalidFlags => "invalid connection flags",
            Self::Write => "write error",
            Self::Read => "read error",
            Self::Signal => "signal registration failed",
            Self::Runtime => "runtime error",
            Self::Config => "configuration error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up the description of an error code.
pub fn error_string(kind: ErrorKind) -> &'static str {
    kind.as_str()
}

impl IoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Connect(_) => ErrorKind::Connect,
            Self::TlsHandshake(_) => ErrorKind::TlsHandshake,
            Self::TlsVerification(_) => ErrorKind::TlsVerification,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::AlreadyConnected => ErrorKind::AlreadyConnected,
            Self::AlreadyConnecting => ErrorKind::AlreadyConnecting,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::ConnectionLimitReached { .. } => ErrorKind::ConnectionLimitReached,
            Self::UnknownConnection => ErrorKind::UnknownConnection,
            Self::InvalidFlags(_) => ErrorKind::InvalidFlags,
            Self::Write(_) => ErrorKind::Write,
            Self::Read(_) => ErrorKind::Read,
            Self::Signal(_) => ErrorKind::Signal,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns `true` for errors caused by calling the API in the wrong state.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyConnected
                | Self::AlreadyConnecting
                | Self::NotConnected
                | Self::ConnectionLimitReached { .. }
                | Self::UnknownConnection
                | Self::InvalidFlags(_)
        )
    }

    /// Returns `true` for faults the event loop cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Signal(_) | Self::Runtime(_))
    }
}

impl From<toml::de::Error> for IoError {
    fn from(e: toml::de::Error) -> Self {
        IoError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for IoError {
    fn from(e: toml::ser::Error) -> Self {
        IoError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = IoError::Resolution("Name or service not known".into());
        assert!(e.to_string().contains("resolving"));
        assert!(e.to_string().contains("Name or service"));

        let e = IoError::ConnectionLimitReached { capacity: 8 };
        assert!(e.to_string().contains('8'));
    }

    #[test]
    fn kind_and_error_string_agree() {
        let e = IoError::AlreadyConnecting;
        assert_eq!(e.kind(), ErrorKind::AlreadyConnecting);
        assert_eq!(error_string(e.kind()), "connection in progress");
        assert_eq!(ErrorKind::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn misuse_and_fatal_classification() {
        assert!(IoError::NotConnected.is_misuse());
        assert!(IoError::UnknownConnection.is_misuse());
        assert!(!IoError::Connect("refused".into()).is_misuse());

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "no handler");
        assert!(IoError::Signal(io_err).is_fatal());
        assert!(!IoError::Write("broken pipe".into()).is_fatal());
    }

    #[test]
    fn from_toml_error() {
        let err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let e: IoError = err.into();
        assert!(matches!(e, IoError::Config(_)));
    }
}
