//! SSH2 client protocol core for the skein toolkit.
//!
//! This crate implements the client side of the SSH2 protocol:
//!
//! - **Transport** - identification, binary packet codec, key exchange,
//!   rekeying and disconnect handling (RFC 4253)
//! - **Connection** - channel multiplexing with flow control, channel and
//!   global requests (RFC 4254)
//!
//! User authentication is left to a [`ssh::Service`] plugged into the
//! transport.
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::{CodecState, Decoder, Encoder};
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let authenticated = Arc::new(AtomicBool::new(false));
//! let mut encoder = Encoder::new(authenticated.clone());
//! let mut decoder = Decoder::new(authenticated);
//!
//! let (frame, seq) = encoder.encode(b"\x02hello").unwrap();
//! decoder.received(&frame);
//! let packet = decoder.next_packet().unwrap().unwrap();
//! assert_eq!(packet.seq, seq);
//! assert_eq!(packet.payload.as_slice(), b"\x02hello");
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted libraries (`ring`, RustCrypto, `dalek`)
//! - MAC tags are compared in constant time
//! - Derived keys and shared secrets are zeroized on drop
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
