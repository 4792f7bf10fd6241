//! Error types for Capstan.
//!
//! The taxonomy mirrors the protocol layering: [`TransportError`] for the
//! transport layer (fatal for the whole connection), [`ConnectionError`] for
//! the channel multiplexer, [`UserAuthError`] for the authentication service,
//! and [`CapstanError`] as the umbrella the public facade returns.
//!
//! Every error is `Clone` so a single fatal transport failure can be fanned
//! out to every outstanding waiter; `std::io::Error` is carried behind an
//! `Arc` for that reason.

use std::fmt;
use std::sync::Arc;

/// Disconnect reason codes (RFC 4250 Section 4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_HOST_AUTHENTICATION_FAILED
    HostAuthenticationFailed = 4,
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
    /// Converts a wire code to a reason, if it is one of the assigned values.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::HostAuthenticationFailed),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),
            _ => None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u32)
    }
}

/// Channel open failure reason codes (RFC 4250 Section 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Converts a wire code to a reason, if it is one of the assigned values.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u32)
    }
}

/// Fatal transport-layer error.
///
/// Any of these terminates the whole connection: the transport fans the error
/// out to every outstanding waiter, sends a best-effort SSH_MSG_DISCONNECT
/// and releases its resources. Further public calls fail with
/// [`TransportError::Stopped`].
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Protocol violation, carrying the disconnect reason we will report.
    Protocol {
        /// Reason code for our SSH_MSG_DISCONNECT.
        reason: DisconnectReason,
        /// Human-readable description.
        message: String,
    },

    /// MAC verification failed on an incoming packet.
    MacMismatch,

    /// No registered verifier accepted the server's host key.
    HostKeyNotVerifiable(String),

    /// A packet arrived that the current state cannot accept.
    UnexpectedMessage {
        /// What the state machine was expecting.
        expected: String,
        /// What actually arrived.
        got: String,
    },

    /// Key exchange failed (negotiation, followup, or signature).
    KexFailed(String),

    /// A wait expired.
    Timeout,

    /// Socket-level I/O error.
    Io(Arc<std::io::Error>),

    /// The transport was stopped explicitly.
    Stopped,

    /// The peer sent SSH_MSG_DISCONNECT.
    Disconnected {
        /// Reason code from the peer (raw, may be unassigned).
        reason: u32,
        /// Message from the peer.
        message: String,
    },
}

impl TransportError {
    /// Shorthand for a [`TransportError::Protocol`] with reason PROTOCOL_ERROR.
    pub fn protocol(message: impl Into<String>) -> Self {
        TransportError::Protocol {
            reason: DisconnectReason::ProtocolError,
            message: message.into(),
        }
    }

    /// The reason code to put in the SSH_MSG_DISCONNECT sent for this error.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            TransportError::Protocol { reason, .. } => *reason,
            TransportError::MacMismatch => DisconnectReason::MacError,
            TransportError::HostKeyNotVerifiable(_) => DisconnectReason::HostKeyNotVerifiable,
            TransportError::UnexpectedMessage { .. } => DisconnectReason::ProtocolError,
            TransportError::KexFailed(_) => DisconnectReason::KeyExchangeFailed,
            TransportError::Io(_) => DisconnectReason::ConnectionLost,
            _ => DisconnectReason::ByApplication,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Protocol { reason, message } => {
                write!(f, "protocol error ({}): {}", reason, message)
            }
            TransportError::MacMismatch => write!(f, "MAC verification failed"),
            TransportError::HostKeyNotVerifiable(msg) => {
                write!(f, "host key not verifiable: {}", msg)
            }
            TransportError::UnexpectedMessage { expected, got } => {
                write!(f, "was expecting {}, got {}", expected, got)
            }
            TransportError::KexFailed(msg) => write!(f, "key exchange failed: {}", msg),
            TransportError::Timeout => write!(f, "timeout expired"),
            TransportError::Io(e) => write!(f, "IO error: {}", e),
            TransportError::Stopped => write!(f, "transport stopped"),
            TransportError::Disconnected { reason, message } => {
                write!(f, "disconnected by peer (reason={}): {}", reason, message)
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

/// Connection-protocol error.
///
/// These stay local to one channel or one request; only a wrapped
/// [`TransportError`] is fatal for the whole connection.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// The peer rejected our CHANNEL_OPEN.
    OpenRejected {
        /// Failure reason code (raw, may be unassigned).
        code: u32,
        /// Description from the peer.
        message: String,
    },

    /// A channel or global request was answered with a failure reply.
    RequestFailed,

    /// The channel was closed while the operation was outstanding.
    ChannelClosed,

    /// Underlying transport failure.
    Transport(TransportError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::OpenRejected { code, message } => {
                write!(f, "channel open rejected (code={}): {}", code, message)
            }
            ConnectionError::RequestFailed => write!(f, "request failed"),
            ConnectionError::ChannelClosed => write!(f, "channel closed"),
            ConnectionError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        ConnectionError::Transport(err)
    }
}

/// Authentication error.
#[derive(Debug, Clone)]
pub enum UserAuthError {
    /// One method was rejected outright; others may still succeed.
    MethodFailed {
        /// The method that failed.
        method: String,
    },

    /// The method succeeded partially; one of `remaining` is also required.
    PartialSuccess {
        /// Methods the server will still accept.
        remaining: Vec<String>,
    },

    /// All configured methods were tried and rejected.
    Exhausted,

    /// Underlying transport failure.
    Transport(TransportError),
}

impl fmt::Display for UserAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserAuthError::MethodFailed { method } => {
                write!(f, "authentication method `{}` failed", method)
            }
            UserAuthError::PartialSuccess { remaining } => {
                write!(f, "partial success; continue with [{}]", remaining.join(","))
            }
            UserAuthError::Exhausted => write!(f, "exhausted all authentication methods"),
            UserAuthError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for UserAuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UserAuthError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for UserAuthError {
    fn from(err: TransportError) -> Self {
        UserAuthError::Transport(err)
    }
}

/// Umbrella error returned by the public facade.
#[derive(Debug, Clone)]
pub enum CapstanError {
    /// Transport layer failure.
    Transport(TransportError),
    /// Connection protocol failure.
    Connection(ConnectionError),
    /// Authentication failure.
    UserAuth(UserAuthError),
}

impl fmt::Display for CapstanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapstanError::Transport(e) => write!(f, "{}", e),
            CapstanError::Connection(e) => write!(f, "{}", e),
            CapstanError::UserAuth(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CapstanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CapstanError::Transport(e) => Some(e),
            CapstanError::Connection(e) => Some(e),
            CapstanError::UserAuth(e) => Some(e),
        }
    }
}

impl From<TransportError> for CapstanError {
    fn from(err: TransportError) -> Self {
        CapstanError::Transport(err)
    }
}

impl From<ConnectionError> for CapstanError {
    fn from(err: ConnectionError) -> Self {
        CapstanError::Connection(err)
    }
}

impl From<UserAuthError> for CapstanError {
    fn from(err: UserAuthError) -> Self {
        CapstanError::UserAuth(err)
    }
}

/// Result alias for transport-layer operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result alias for connection-layer operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result alias for authentication operations.
pub type UserAuthResult<T> = Result<T, UserAuthError>;

/// Result alias for facade operations.
pub type CapstanResult<T> = Result<T, CapstanError>;
