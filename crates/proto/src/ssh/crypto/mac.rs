//! Message authentication codes (RFC 4253 Section 6.4, RFC 6668).
//!
//! The codec feeds `uint32 sequence_number || unencrypted_packet` through
//! [`Mac::update`] and collects the tag with [`Mac::do_final`], which also
//! rewinds the instance to its freshly keyed state for the next packet.

use super::NamedFactory;
use hmac::{Hmac, Mac as _};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use skein_platform::{SkeinError, SkeinResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Capability interface for a packet MAC.
pub trait Mac: Send {
    /// Wire name.
    fn name(&self) -> &'static str;
    /// Tag length in bytes.
    fn size(&self) -> usize;
    /// Key length consumed by `init`.
    fn key_size(&self) -> usize;
    /// Keys the MAC. Bytes beyond `key_size` are ignored.
    fn init(&mut self, key: &[u8]) -> SkeinResult<()>;
    /// Absorbs data.
    fn update(&mut self, data: &[u8]);
    /// Absorbs a big-endian `uint32`.
    fn update_u32(&mut self, value: u32) {
        self.update(&value.to_be_bytes());
    }
    /// Produces the tag and resets for the next message.
    fn do_final(&mut self) -> SkeinResult<Vec<u8>>;
}

/// HMAC variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
    /// hmac-sha1
    Sha1,
    /// hmac-sha2-256
    Sha256,
    /// hmac-sha2-512
    Sha512,
}

impl HmacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HmacAlgorithm::Sha1 => "hmac-sha1",
            HmacAlgorithm::Sha256 => "hmac-sha2-256",
            HmacAlgorithm::Sha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            HmacAlgorithm::Sha1 => 20,
            HmacAlgorithm::Sha256 => 32,
            HmacAlgorithm::Sha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses an algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(HmacAlgorithm::Sha1),
            "hmac-sha2-256" => Some(HmacAlgorithm::Sha256),
            "hmac-sha2-512" => Some(HmacAlgorithm::Sha512),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum HmacState {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

impl HmacState {
    fn update(&mut self, data: &[u8]) {
        match self {
            HmacState::Sha1(m) => m.update(data),
            HmacState::Sha256(m) => m.update(data),
            HmacState::Sha512(m) => m.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            HmacState::Sha1(m) => m.finalize().into_bytes().to_vec(),
            HmacState::Sha256(m) => m.finalize().into_bytes().to_vec(),
            HmacState::Sha512(m) => m.finalize().into_bytes().to_vec(),
        }
    }
}

/// HMAC keyed for one direction of a connection.
pub struct HmacMac {
    algorithm: HmacAlgorithm,
    key: Vec<u8>,
    keyed: Option<HmacState>,
    running: Option<HmacState>,
}

impl std::fmt::Debug for HmacMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacMac")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl HmacMac {
    /// Creates an unkeyed MAC.
    pub fn new(algorithm: HmacAlgorithm) -> Self {
        Self {
            algorithm,
            key: Vec::new(),
            keyed: None,
            running: None,
        }
    }
}

impl Mac for HmacMac {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn size(&self) -> usize {
        self.algorithm.mac_size()
    }

    fn key_size(&self) -> usize {
        self.algorithm.key_size()
    }

    fn init(&mut self, key_material: &[u8]) -> SkeinResult<()> {
        let key_size = self.algorithm.key_size();
        if key_material.len() < key_size {
            return Err(SkeinError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                key_size,
                key_material.len()
            )));
        }
        self.key.zeroize();
        self.key = key_material[..key_size].to_vec();

        let invalid = |_| SkeinError::Security("Invalid HMAC key".to_string());
        let state = match self.algorithm {
            HmacAlgorithm::Sha1 => {
                HmacState::Sha1(Hmac::<Sha1>::new_from_slice(&self.key).map_err(invalid)?)
            }
            HmacAlgorithm::Sha256 => {
                HmacState::Sha256(Hmac::<Sha256>::new_from_slice(&self.key).map_err(invalid)?)
            }
            HmacAlgorithm::Sha512 => {
                HmacState::Sha512(Hmac::<Sha512>::new_from_slice(&self.key).map_err(invalid)?)
            }
        };
        self.running = Some(state.clone());
        self.keyed = Some(state);
        Ok(())
    }

    fn update(&mut self, data: &[u8]) {
        if let Some(state) = self.running.as_mut() {
            state.update(data);
        }
    }

    fn do_final(&mut self) -> SkeinResult<Vec<u8>> {
        let keyed = self
            .keyed
            .as_ref()
            .ok_or_else(|| SkeinError::Protocol(format!("{} used before init", self.name())))?;
        let finished = self.running.replace(keyed.clone());
        match finished {
            Some(state) => Ok(state.finalize()),
            None => Err(SkeinError::Protocol(format!(
                "{} used before init",
                self.name()
            ))),
        }
    }
}

impl Drop for HmacMac {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Constant-time tag comparison.
pub fn tags_equal(computed: &[u8], received: &[u8]) -> bool {
    computed.len() == received.len() && bool::from(computed.ct_eq(received))
}

/// MACs this crate can instantiate, in preference order.
pub fn default_factories() -> Vec<NamedFactory<dyn Mac>> {
    vec![
        NamedFactory::new("hmac-sha2-256", || {
            Box::new(HmacMac::new(HmacAlgorithm::Sha256))
        }),
        NamedFactory::new("hmac-sha2-512", || {
            Box::new(HmacMac::new(HmacAlgorithm::Sha512))
        }),
        NamedFactory::new("hmac-sha1", || Box::new(HmacMac::new(HmacAlgorithm::Sha1))),
    ]
}
