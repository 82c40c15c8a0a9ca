//! Transport configuration.
//!
//! [`Config`] is built once, wrapped in an `Arc`, and threaded through every
//! component that needs algorithms or limits. It carries the named-factory
//! registries used for negotiation, so there is no process-wide provider state.
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::config::Config;
//! use skein_proto::ssh::hostkey::PromiscuousVerifier;
//! use std::time::Duration;
//!
//! let config = Config {
//!     keepalive_interval: Duration::from_secs(30),
//!     ..Config::default()
//! }
//! .with_verifier(PromiscuousVerifier);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.ciphers[0].name(), "aes128-ctr");
//! ```

use crate::ssh::crypto::{self, Cipher, Compression, Mac, NamedFactory, Signature};
use crate::ssh::hostkey::HostKeyVerifier;
use crate::ssh::kex_dh::{self, KeyExchange};
use skein_platform::{SkeinError, SkeinResult};
use std::sync::Arc;
use std::time::Duration;

/// Default local channel window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default local maximum packet size (32 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Default ceiling on the peer's advertised maximum packet size (1 MiB).
pub const DEFAULT_REMOTE_MAX_PACKET_CEILING: u32 = 1024 * 1024;

/// Client transport configuration.
pub struct Config {
    /// Software version announced as `SSH-2.0-<version>`.
    pub version: String,
    /// Key exchange methods in preference order.
    pub kex: Vec<NamedFactory<dyn KeyExchange>>,
    /// Host key signature algorithms in preference order.
    pub host_key: Vec<NamedFactory<dyn Signature>>,
    /// Ciphers in preference order (offered for both directions).
    pub ciphers: Vec<NamedFactory<dyn Cipher>>,
    /// MACs in preference order (offered for both directions).
    pub macs: Vec<NamedFactory<dyn Mac>>,
    /// Compression algorithms in preference order.
    pub compression: Vec<NamedFactory<dyn Compression>>,
    /// Host key verifiers, asked in order.
    pub host_key_verifiers: Vec<Arc<dyn HostKeyVerifier>>,
    /// Keep-alive interval; `Duration::ZERO` disables keep-alives.
    pub keepalive_interval: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed for a key exchange to finish.
    pub kex_timeout: Duration,
    /// Time allowed for a service request to be accepted.
    pub service_timeout: Duration,
    /// Time allowed for channel open, close and request replies.
    pub channel_timeout: Duration,
    /// Initial local window for new channels.
    pub local_window_size: u32,
    /// Largest data packet we accept on a channel.
    pub local_max_packet_size: u32,
    /// Upper bound applied to the peer's advertised maximum packet size.
    pub remote_max_packet_ceiling: u32,
    /// Rekey once the send sequence number is this close to wrapping.
    pub rekey_sequence_margin: u32,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("version", &self.version)
            .field("kex", &crypto::names(&self.kex))
            .field("host_key", &crypto::names(&self.host_key))
            .field("ciphers", &crypto::names(&self.ciphers))
            .field("macs", &crypto::names(&self.macs))
            .field("compression", &crypto::names(&self.compression))
            .field("host_key_verifiers", &self.host_key_verifiers.len())
            .field("keepalive_interval", &self.keepalive_interval)
            .field("local_window_size", &self.local_window_size)
            .field("local_max_packet_size", &self.local_max_packet_size)
            .field("remote_max_packet_ceiling", &self.remote_max_packet_ceiling)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: format!("skein_{}", env!("CARGO_PKG_VERSION")),
            kex: kex_dh::default_factories(),
            host_key: crypto::signature::default_factories(),
            ciphers: crypto::cipher::default_factories(),
            macs: crypto::mac::default_factories(),
            compression: crypto::compression::default_factories(),
            host_key_verifiers: Vec::new(),
            keepalive_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            kex_timeout: Duration::from_secs(60),
            service_timeout: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(30),
            local_window_size: DEFAULT_WINDOW_SIZE,
            local_max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            remote_max_packet_ceiling: DEFAULT_REMOTE_MAX_PACKET_CEILING,
            rekey_sequence_margin: 1 << 31,
        }
    }
}

impl Config {
    /// Appends a host key verifier.
    pub fn with_verifier(mut self, verifier: impl HostKeyVerifier + 'static) -> Self {
        self.host_key_verifiers.push(Arc::new(verifier));
        self
    }

    /// Checks that every registry is populated and limits are non-zero.
    pub fn validate(&self) -> SkeinResult<()> {
        let empty = |what: &str| Err(SkeinError::Config(format!("no {} configured", what)));
        if self.kex.is_empty() {
            return empty("key exchange methods");
        }
        if self.host_key.is_empty() {
            return empty("host key algorithms");
        }
        if self.ciphers.is_empty() {
            return empty("ciphers");
        }
        if self.macs.is_empty() {
            return empty("MACs");
        }
        if self.compression.is_empty() {
            return empty("compression algorithms");
        }
        if self.local_window_size == 0 || self.local_max_packet_size == 0 {
            return Err(SkeinError::Config(
                "window and packet sizes must be non-zero".to_string(),
            ));
        }
        if self.remote_max_packet_ceiling == 0 {
            return Err(SkeinError::Config(
                "remote max packet ceiling must be non-zero".to_string(),
            ));
        }
        if self.version.contains(['\r', '\n', ' ']) {
            return Err(SkeinError::Config(format!(
                "invalid version string {:?}",
                self.version
            )));
        }
        Ok(())
    }

    /// Full identification line sent to the server, without CR LF.
    pub fn identification(&self) -> String {
        format!("SSH-2.0-{}", self.version)
    }
}
