//! SSH message identifiers (RFC 4253 Section 12, RFC 4254 Section 9).
//!
//! # Message Ranges
//!
//! - **Transport generic** (1-19): disconnect, ignore, debug, service request
//! - **Algorithm negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key exchange method** (30-49): method-specific rounds
//! - **User authentication** (50-79)
//! - **Connection protocol** (80-127)
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::message::{MessageType, Route};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(Route::of(31), Route::KeyExchange);
//! assert_eq!(Route::of(94), Route::Service);
//! ```

/// SSH message types used by the client core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Terminates the connection.
    Disconnect = 1,
    /// Ignored by the receiver; used for keep-alive.
    Ignore = 2,
    /// Reply to a message the receiver does not understand.
    Unimplemented = 3,
    /// Debugging information.
    Debug = 4,
    /// Request a service (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Algorithm proposal.
    KexInit = 20,
    /// Activate newly derived keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// ECDH / DH init (client ephemeral public value).
    KexdhInit = 30,
    /// ECDH / DH reply (host key, server public value, signature).
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Global request succeeded.
    RequestSuccess = 81,
    /// Global request failed.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use skein_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the RFC name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Formats a raw message id for logging, including unknown ids.
pub fn describe(id: u8) -> String {
    match MessageType::from_u8(id) {
        Some(t) => t.to_string(),
        None => format!("UNKNOWN({})", id),
    }
}

/// Which component owns an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handled by the transport itself (or answered with UNIMPLEMENTED).
    Transport,
    /// Fed to the key exchange state machine (20, 21, 30-49).
    KeyExchange,
    /// Delivered to the active service (50 and above).
    Service,
}

impl Route {
    /// Routing rule for a message id.
    pub fn of(id: u8) -> Self {
        match id {
            20 | 21 | 30..=49 => Route::KeyExchange,
            50..=255 => Route::Service,
            _ => Route::Transport,
        }
    }
}

/// Whether an outbound message may be sent while a key exchange is in flight.
pub fn allowed_during_kex(id: u8) -> bool {
    id < 50
}
