//! Error types for skein

use std::fmt;

/// Disconnect reason codes (RFC 4253 Section 11.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Reason code not known to this implementation
    Unknown = 0,
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire reason code into a `DisconnectReason`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MacError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => Self::Unknown,
        }
    }

    /// Wire value of this reason.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::HostNotAllowedToConnect => "HOST_NOT_ALLOWED_TO_CONNECT",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::KeyExchangeFailed => "KEY_EXCHANGE_FAILED",
            Self::Reserved => "RESERVED",
            Self::MacError => "MAC_ERROR",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            Self::ProtocolVersionNotSupported => "PROTOCOL_VERSION_NOT_SUPPORTED",
            Self::HostKeyNotVerifiable => "HOST_KEY_NOT_VERIFIABLE",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::ByApplication => "BY_APPLICATION",
            Self::TooManyConnections => "TOO_MANY_CONNECTIONS",
            Self::AuthCancelledByUser => "AUTH_CANCELLED_BY_USER",
            Self::NoMoreAuthMethodsAvailable => "NO_MORE_AUTH_METHODS_AVAILABLE",
            Self::IllegalUserName => "ILLEGAL_USER_NAME",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Unified error type for all skein operations
#[derive(Debug)]
pub enum SkeinError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed frame, bad length, unexpected message)
    Protocol(String),

    /// Transport-level failure carrying an explicit disconnect reason
    Transport {
        /// Reason code sent to (or implied for) the peer
        reason: DisconnectReason,
        /// Human-readable detail
        message: String,
    },

    /// No common algorithm during negotiation
    Negotiation(String),

    /// No registered verifier accepted the server host key
    HostKeyNotVerifiable {
        /// Host key algorithm name
        algorithm: String,
        /// `SHA256:` fingerprint of the key
        fingerprint: String,
        /// Host the transport connected to
        host: String,
        /// Port the transport connected to
        port: u16,
    },

    /// Security error (bad signature, failed integrity check)
    Security(String),

    /// Channel-level error, fatal only to the named channel
    Channel {
        /// Local channel id
        id: u32,
        /// Human-readable detail
        message: String,
    },

    /// A blocking wait exceeded its timeout
    Timeout(String),

    /// The peer (or the local side) disconnected
    Disconnected {
        /// Disconnect reason
        reason: DisconnectReason,
        /// Description sent with the disconnect
        message: String,
    },
}

impl SkeinError {
    /// Shorthand for a transport error with a reason code.
    pub fn transport(reason: DisconnectReason, message: impl Into<String>) -> Self {
        SkeinError::Transport {
            reason,
            message: message.into(),
        }
    }

    /// Shorthand for a channel error.
    pub fn channel(id: u32, message: impl Into<String>) -> Self {
        SkeinError::Channel {
            id,
            message: message.into(),
        }
    }

    /// Reason code to report when this error terminates a transport.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            SkeinError::Io(_) => DisconnectReason::ConnectionLost,
            SkeinError::Config(_) => DisconnectReason::ByApplication,
            SkeinError::Protocol(_) => DisconnectReason::ProtocolError,
            SkeinError::Transport { reason, .. } => *reason,
            SkeinError::Negotiation(_) => DisconnectReason::KeyExchangeFailed,
            SkeinError::HostKeyNotVerifiable { .. } => DisconnectReason::HostKeyNotVerifiable,
            SkeinError::Security(_) => DisconnectReason::KeyExchangeFailed,
            SkeinError::Channel { .. } => DisconnectReason::ProtocolError,
            SkeinError::Timeout(_) => DisconnectReason::ByApplication,
            SkeinError::Disconnected { reason, .. } => *reason,
        }
    }
}

impl Clone for SkeinError {
    fn clone(&self) -> Self {
        match self {
            SkeinError::Io(e) => SkeinError::Io(std::io::Error::new(e.kind(), e.to_string())),
            SkeinError::Config(m) => SkeinError::Config(m.clone()),
            SkeinError::Protocol(m) => SkeinError::Protocol(m.clone()),
            SkeinError::Transport { reason, message } => SkeinError::Transport {
                reason: *reason,
                message: message.clone(),
            },
            SkeinError::Negotiation(m) => SkeinError::Negotiation(m.clone()),
            SkeinError::HostKeyNotVerifiable {
                algorithm,
                fingerprint,
                host,
                port,
            } => SkeinError::HostKeyNotVerifiable {
                algorithm: algorithm.clone(),
                fingerprint: fingerprint.clone(),
                host: host.clone(),
                port: *port,
            },
            SkeinError::Security(m) => SkeinError::Security(m.clone()),
            SkeinError::Channel { id, message } => SkeinError::Channel {
                id: *id,
                message: message.clone(),
            },
            SkeinError::Timeout(m) => SkeinError::Timeout(m.clone()),
            SkeinError::Disconnected { reason, message } => SkeinError::Disconnected {
                reason: *reason,
                message: message.clone(),
            },
        }
    }
}

impl fmt::Display for SkeinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkeinError::Io(e) => write!(f, "IO error: {}", e),
            SkeinError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkeinError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkeinError::Transport { reason, message } => {
                write!(f, "Transport error [{}]: {}", reason, message)
            }
            SkeinError::Negotiation(msg) => write!(f, "Negotiation failed: {}", msg),
            SkeinError::HostKeyNotVerifiable {
                algorithm,
                fingerprint,
                host,
                port,
            } => write!(
                f,
                "Could not verify `{}` host key with fingerprint `{}` for `{}` on port {}",
                algorithm, fingerprint, host, port
            ),
            SkeinError::Security(msg) => write!(f, "Security error: {}", msg),
            SkeinError::Channel { id, message } => write!(f, "Channel {} error: {}", id, message),
            SkeinError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            SkeinError::Disconnected { reason, message } => {
                write!(f, "Disconnected [{}]: {}", reason, message)
            }
        }
    }
}

impl std::error::Error for SkeinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkeinError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkeinError {
    fn from(err: std::io::Error) -> Self {
        SkeinError::Io(err)
    }
}

/// Result type for skein operations
pub type SkeinResult<T> = Result<T, SkeinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkeinError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SkeinError = io_err.into();
        assert!(matches!(err, SkeinError::Io(_)));
        assert_eq!(err.disconnect_reason(), DisconnectReason::ConnectionLost);
    }

    #[test]
    fn test_clone_preserves_io_kind() {
        let err = SkeinError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        match err.clone() {
            SkeinError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            SkeinError::Protocol("bad".into()).disconnect_reason(),
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            SkeinError::Negotiation("none".into()).disconnect_reason(),
            DisconnectReason::KeyExchangeFailed
        );
        let hk = SkeinError::HostKeyNotVerifiable {
            algorithm: "ssh-ed25519".into(),
            fingerprint: "SHA256:abc".into(),
            host: "example.com".into(),
            port: 22,
        };
        assert_eq!(hk.disconnect_reason(), DisconnectReason::HostKeyNotVerifiable);
        assert!(hk.to_string().contains("example.com"));
        assert!(hk.to_string().contains("SHA256:abc"));
    }

    #[test]
    fn test_reason_codes() {
        for code in 1..=15 {
            assert_eq!(DisconnectReason::from_u32(code).code(), code);
        }
        assert_eq!(DisconnectReason::from_u32(99), DisconnectReason::Unknown);
        assert_eq!(
            DisconnectReason::MacError.to_string(),
            "MAC_ERROR(5)"
        );
    }
}
