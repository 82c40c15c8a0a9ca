//! Algorithm proposals and negotiation (RFC 4253 Section 7.1).
//!
//! A [`Proposal`] is one side's SSH_MSG_KEXINIT: a random cookie, eight
//! ordered algorithm lists, two language lists and the
//! `first_kex_packet_follows` flag. The serialized payload is kept verbatim
//! because it is an input to the exchange hash.
//!
//! [`negotiate`] walks each category in the client's preference order and
//! picks the first name the server also lists. A category with no common
//! name fails the whole negotiation.
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::proposal::negotiate_algorithm;
//!
//! let client = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! let server = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes128-ctr");
//! ```

use crate::ssh::buffer::Buffer;
use crate::ssh::config::Config;
use crate::ssh::crypto;
use crate::ssh::message::MessageType;
use rand::RngCore;
use skein_platform::{SkeinError, SkeinResult};
use std::fmt;

/// Index of each algorithm category within a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Key exchange method
    Kex = 0,
    /// Server host key (signature) algorithm
    HostKey = 1,
    /// Cipher, client to server
    CipherClientToServer = 2,
    /// Cipher, server to client
    CipherServerToClient = 3,
    /// MAC, client to server
    MacClientToServer = 4,
    /// MAC, server to client
    MacServerToClient = 5,
    /// Compression, client to server
    CompressionClientToServer = 6,
    /// Compression, server to client
    CompressionServerToClient = 7,
}

impl Category {
    /// All negotiated categories in wire order.
    pub const ALL: [Category; 8] = [
        Category::Kex,
        Category::HostKey,
        Category::CipherClientToServer,
        Category::CipherServerToClient,
        Category::MacClientToServer,
        Category::MacServerToClient,
        Category::CompressionClientToServer,
        Category::CompressionServerToClient,
    ];

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Kex => "kex algorithms",
            Category::HostKey => "server host key algorithms",
            Category::CipherClientToServer => "encryption algorithms (client to server)",
            Category::CipherServerToClient => "encryption algorithms (server to client)",
            Category::MacClientToServer => "mac algorithms (client to server)",
            Category::MacServerToClient => "mac algorithms (server to client)",
            Category::CompressionClientToServer => "compression algorithms (client to server)",
            Category::CompressionServerToClient => "compression algorithms (server to client)",
        }
    }
}

/// One side's algorithm offer.
#[derive(Clone, PartialEq, Eq)]
pub struct Proposal {
    cookie: [u8; 16],
    lists: [Vec<String>; 8],
    languages: [Vec<String>; 2],
    first_kex_packet_follows: bool,
    packet: Vec<u8>,
}

impl fmt::Debug for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proposal")
            .field("kex", &self.lists[0])
            .field("host_key", &self.lists[1])
            .field("ciphers", &self.lists[2])
            .field("macs", &self.lists[4])
            .field("compression", &self.lists[6])
            .field("first_kex_packet_follows", &self.first_kex_packet_follows)
            .finish()
    }
}

impl Proposal {
    /// Builds a proposal with a fresh random cookie.
    ///
    /// `lists` follow [`Category::ALL`] order.
    pub fn new(lists: [Vec<String>; 8]) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self::with_cookie(cookie, lists, false)
    }

    /// Builds the client's proposal from the configured registries.
    pub fn from_config(config: &Config) -> Self {
        let ciphers = crypto::names(&config.ciphers);
        let macs = crypto::names(&config.macs);
        let compression = crypto::names(&config.compression);
        Self::new([
            crypto::names(&config.kex),
            crypto::names(&config.host_key),
            ciphers.clone(),
            ciphers,
            macs.clone(),
            macs,
            compression.clone(),
            compression,
        ])
    }

    /// Builds a proposal with an explicit cookie and guess flag.
    pub fn with_cookie(
        cookie: [u8; 16],
        lists: [Vec<String>; 8],
        first_kex_packet_follows: bool,
    ) -> Self {
        let mut proposal = Self {
            cookie,
            lists,
            languages: [Vec::new(), Vec::new()],
            first_kex_packet_follows,
            packet: Vec::new(),
        };
        proposal.packet = proposal.serialize();
        proposal
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Buffer::with_capacity(1024);
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_raw(&self.cookie);
        for list in self.lists.iter().chain(self.languages.iter()) {
            buf.put_name_list(list);
        }
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.as_slice().to_vec()
    }

    /// Parses a received SSH_MSG_KEXINIT payload, message id included.
    pub fn parse(payload: &[u8]) -> SkeinResult<Self> {
        let mut buf = Buffer::from_slice(payload);
        let msg_type = buf.read_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(SkeinError::Protocol(format!(
                "Expected SSH_MSG_KEXINIT (20), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&buf.read_raw(16)?);

        let mut lists: [Vec<String>; 8] = Default::default();
        for list in lists.iter_mut() {
            *list = buf.read_name_list()?;
        }
        let languages = [buf.read_name_list()?, buf.read_name_list()?];
        let first_kex_packet_follows = buf.read_bool()?;
        let _reserved = buf.read_u32()?;

        Ok(Self {
            cookie,
            lists,
            languages,
            first_kex_packet_follows,
            packet: payload.to_vec(),
        })
    }

    /// Random cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Names offered for one category, in preference order.
    pub fn list(&self, category: Category) -> &[String] {
        &self.lists[category as usize]
    }

    /// Whether a guessed key exchange packet follows this proposal.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// The serialized KEXINIT payload (I_C / I_S in the exchange hash).
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }
}

/// The agreed algorithm for every category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Host key signature algorithm
    pub host_key: String,
    /// Cipher, client to server
    pub cipher_c2s: String,
    /// Cipher, server to client
    pub cipher_s2c: String,
    /// MAC, client to server
    pub mac_c2s: String,
    /// MAC, server to client
    pub mac_s2c: String,
    /// Compression, client to server
    pub compression_c2s: String,
    /// Compression, server to client
    pub compression_s2c: String,
}

impl fmt::Display for NegotiatedAlgorithms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kex={} hostkey={} c2s=[{}, {}, {}] s2c=[{}, {}, {}]",
            self.kex,
            self.host_key,
            self.cipher_c2s,
            self.mac_c2s,
            self.compression_c2s,
            self.cipher_s2c,
            self.mac_s2c,
            self.compression_s2c
        )
    }
}

/// Picks the first entry of `client_list` that also appears in `server_list`.
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> SkeinResult<String> {
    for client_alg in client_list {
        if server_list.contains(client_alg) {
            return Ok(client_alg.clone());
        }
    }

    Err(SkeinError::Negotiation(format!(
        "No common {}: client={:?}, server={:?}",
        category, client_list, server_list
    )))
}

/// Negotiates every category; fails on the first category without a match.
pub fn negotiate(client: &Proposal, server: &Proposal) -> SkeinResult<NegotiatedAlgorithms> {
    let pick = |c: Category| negotiate_algorithm(c.label(), client.list(c), server.list(c));
    Ok(NegotiatedAlgorithms {
        kex: pick(Category::Kex)?,
        host_key: pick(Category::HostKey)?,
        cipher_c2s: pick(Category::CipherClientToServer)?,
        cipher_s2c: pick(Category::CipherServerToClient)?,
        mac_c2s: pick(Category::MacClientToServer)?,
        mac_s2c: pick(Category::MacServerToClient)?,
        compression_c2s: pick(Category::CompressionClientToServer)?,
        compression_s2c: pick(Category::CompressionServerToClient)?,
    })
}

/// Whether the peer's guessed packet must be discarded
/// (RFC 4253 Section 7: the guess is wrong when either the kex method or the
/// host key algorithm is not the first entry of the sender's list).
pub fn guess_is_wrong(server: &Proposal, negotiated: &NegotiatedAlgorithms) -> bool {
    let first = |c: Category| server.list(c).first().map(String::as_str);
    first(Category::Kex) != Some(negotiated.kex.as_str())
        || first(Category::HostKey) != Some(negotiated.host_key.as_str())
}
