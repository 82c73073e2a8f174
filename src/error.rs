use serde::Serialize;
use std::fmt;

pub const TIMEOUT_ERROR: &str = "Could not connect (timeout)";
pub const REJECTED_ERROR: &str = "Connection rejected";
pub const HANDSHAKE_ERROR: &str = "Could not complete an SSL handshake";

/// Why a target was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedTarget,
    Ipv6Unsupported,
    NameResolutionFailure,
    ConnectionTimeout,
    ConnectionRejected,
    ProtocolUpgradeFailure,
    ProxyFailure,
    HandshakeNegotiationFailure,
    InvalidConfiguration,
    UnclassifiedFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedTarget => "malformed_target",
            ErrorKind::Ipv6Unsupported => "ipv6_unsupported",
            ErrorKind::NameResolutionFailure => "name_resolution_failure",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::ConnectionRejected => "connection_rejected",
            ErrorKind::ProtocolUpgradeFailure => "protocol_upgrade_failure",
            ErrorKind::ProxyFailure => "proxy_failure",
            ErrorKind::HandshakeNegotiationFailure => "handshake_negotiation_failure",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::UnclassifiedFailure => "unclassified_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure attributed to one target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{target} => {detail}")]
pub struct ProbeError {
    target: String,
    kind: ErrorKind,
    detail: String,
}

impl ProbeError {
    pub fn new(target: impl Into<String>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind,
            detail: detail.into(),
        }
    }

    /// Classifies a failure raised while reaching the target.
    pub fn from_connection(target: impl Into<String>, hostname: &str, err: ConnectionError) -> Self {
        let kind = err.kind();
        let detail = match err {
            ConnectionError::Timeout => TIMEOUT_ERROR.to_string(),
            ConnectionError::NameResolution(_) => format!("Could not resolve {hostname}"),
            ConnectionError::Rejected(_) => REJECTED_ERROR.to_string(),
            ConnectionError::StartTls(message) | ConnectionError::Proxy(message) => message,
            ConnectionError::Handshake(message) => format!("Handshake: {message}"),
            ConnectionError::Other { category, message } => format!("{category}: {message}"),
        };
        Self::new(target, kind, detail)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

/// Failure reported by a [`crate::connection::TlsConnection`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("timed out")]
    Timeout,
    #[error("could not resolve {0}")]
    NameResolution(String),
    #[error("connection rejected: {0}")]
    Rejected(#[source] std::io::Error),
    #[error("{0}")]
    StartTls(String),
    #[error("{0}")]
    Proxy(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("{category}: {message}")]
    Other { category: String, message: String },
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Timeout => ErrorKind::ConnectionTimeout,
            ConnectionError::NameResolution(_) => ErrorKind::NameResolutionFailure,
            ConnectionError::Rejected(_) => ErrorKind::ConnectionRejected,
            ConnectionError::StartTls(_) => ErrorKind::ProtocolUpgradeFailure,
            ConnectionError::Proxy(_) => ErrorKind::ProxyFailure,
            ConnectionError::Handshake(_) => ErrorKind::HandshakeNegotiationFailure,
            ConnectionError::Other { .. } => ErrorKind::UnclassifiedFailure,
        }
    }

    /// Whether the failure happened on the transport, before any
    /// application bytes were exchanged.
    pub fn is_transport(&self) -> bool {
        matches!(self, ConnectionError::Timeout | ConnectionError::Rejected(_))
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ConnectionError::Timeout
            }
            _ => ConnectionError::Rejected(err),
        }
    }
}

/// A worker pool job that panicked instead of returning.
#[derive(Debug, Clone, thiserror::Error)]
#[error("job panicked: {message}")]
pub struct JobPanic {
    pub message: String,
}

impl From<JobPanic> for ProbeError {
    fn from(panic: JobPanic) -> Self {
        ProbeError::new(
            String::new(),
            ErrorKind::UnclassifiedFailure,
            format!("Panic: {}", panic.message),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_failures() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = ProbeError::from_connection("a:443", "a", refused.into());
        assert_eq!(err.kind(), ErrorKind::ConnectionRejected);
        assert_eq!(err.detail(), REJECTED_ERROR);

        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        let err = ProbeError::from_connection("a:443", "a", timed_out.into());
        assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
        assert_eq!(err.detail(), TIMEOUT_ERROR);
    }

    #[test]
    fn keeps_upgrade_and_proxy_messages() {
        let err = ProbeError::from_connection(
            "mx:25",
            "mx",
            ConnectionError::StartTls("SMTP STARTTLS not supported".into()),
        );
        assert_eq!(err.kind(), ErrorKind::ProtocolUpgradeFailure);
        assert_eq!(err.detail(), "SMTP STARTTLS not supported");

        let err = ProbeError::from_connection(
            "mx:25",
            "mx",
            ConnectionError::NameResolution("proxy.local".into()),
        );
        assert_eq!(err.kind(), ErrorKind::NameResolutionFailure);
        assert_eq!(err.detail(), "Could not resolve mx");
    }

    #[test]
    fn wraps_unknown_failures_with_their_category() {
        let err = ProbeError::from_connection(
            "h:1",
            "h",
            ConnectionError::Other {
                category: "ValueError".into(),
                message: "bad state".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::UnclassifiedFailure);
        assert_eq!(err.detail(), "ValueError: bad state");
        assert_eq!(err.to_string(), "h:1 => ValueError: bad state");
    }
}
