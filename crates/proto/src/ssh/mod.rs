//! SSH2 client core (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Identification** ([`version`]) - Version line exchange (RFC 4253 Section 4.2)
//! 2. **Packet codec** ([`codec`]) - Binary packet protocol (RFC 4253 Section 6)
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`proposal`]) - Negotiation, DH and key derivation
//! 4. **Transport** ([`transport`]) - Reader task, write path, rekeying, disconnect
//! 5. **Connection** ([`connection`]) - Channels, windows and requests (RFC 4254)
//!
//! Algorithms are pluggable through [`crypto::NamedFactory`] lists in
//! [`Config`]; host keys are accepted by [`hostkey::HostKeyVerifier`]s.
//!
//! # Example
//!
//! ```rust,no_run
//! use skein_proto::ssh::{Config, PromiscuousVerifier, Transport};
//! use std::sync::Arc;
//!
//! # async fn run() -> skein_platform::SkeinResult<()> {
//! let config = Arc::new(Config::default().with_verifier(PromiscuousVerifier));
//! let transport = Transport::connect("localhost", 22, config).await?;
//! println!("negotiated {}", transport.negotiated().await.unwrap());
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod keepalive;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod proposal;
pub mod service;
pub mod transport;
pub mod version;

// Re-export main types
pub use self::buffer::Buffer;
pub use self::codec::{CodecState, Decoder, Encoder, Inbound};
pub use self::config::Config;
pub use self::connection::{
    Channel, ChannelOpenFailureReason, ChannelOpener, ChannelState, ConnectionService,
    ExitSignal, GlobalReply, OpenRequest, PtyRequest,
};
pub use self::crypto::{Cipher, Compression, Mac, NamedFactory, Signature};
pub use self::hostkey::{FingerprintVerifier, HostKeyVerifier, PromiscuousVerifier};
pub use self::kex::{KexMachine, KexPhase};
pub use self::kex_dh::{derive_key, exchange_hash, KeyExchange};
pub use self::message::{MessageType, Route};
pub use self::proposal::{NegotiatedAlgorithms, Proposal};
pub use self::service::{ActiveService, PacketWriter, Service};
pub use self::transport::Transport;
pub use self::version::Version;
