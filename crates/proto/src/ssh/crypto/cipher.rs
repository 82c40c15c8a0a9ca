//! Packet ciphers (RFC 4253 Section 6.3, RFC 4344).
//!
//! - `none` (pre-kex only)
//! - `aes128-ctr`, `aes192-ctr`, `aes256-ctr`
//! - `aes128-cbc`, `aes256-cbc`
//!
//! Ciphers transform data in place. Block ciphers keep their chaining state
//! between calls, so a whole connection direction is one continuous stream.

use super::{Mode, NamedFactory};
use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use skein_platform::{SkeinError, SkeinResult};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Capability interface for a packet cipher.
pub trait Cipher: Send {
    /// Wire name.
    fn name(&self) -> &'static str;
    /// Block size in bytes; framing pads to a multiple of this.
    fn block_size(&self) -> usize;
    /// Initial IV length required by `init`.
    fn iv_size(&self) -> usize;
    /// Key length required by `init`.
    fn key_size(&self) -> usize;
    /// Keys the cipher. Extra key or IV bytes are ignored.
    fn init(&mut self, mode: Mode, key: &[u8], iv: &[u8]) -> SkeinResult<()>;
    /// Encrypts or decrypts `data` in place.
    fn update(&mut self, data: &mut [u8]) -> SkeinResult<()>;
}

fn check_material(name: &str, what: &str, got: usize, want: usize) -> SkeinResult<()> {
    if got < want {
        return Err(SkeinError::Security(format!(
            "Insufficient {} for {}: expected {}, got {}",
            what, name, want, got
        )));
    }
    Ok(())
}

/// The identity cipher used before the first key exchange.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn iv_size(&self) -> usize {
        8
    }

    fn key_size(&self) -> usize {
        16
    }

    fn init(&mut self, _mode: Mode, _key: &[u8], _iv: &[u8]) -> SkeinResult<()> {
        Ok(())
    }

    fn update(&mut self, _data: &mut [u8]) -> SkeinResult<()> {
        Ok(())
    }
}

enum CtrState {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

/// AES in counter mode (RFC 4344).
pub struct AesCtr {
    name: &'static str,
    key_size: usize,
    state: Option<CtrState>,
}

impl AesCtr {
    /// `aes128-ctr`
    pub fn aes128() -> Self {
        Self {
            name: "aes128-ctr",
            key_size: 16,
            state: None,
        }
    }

    /// `aes192-ctr`
    pub fn aes192() -> Self {
        Self {
            name: "aes192-ctr",
            key_size: 24,
            state: None,
        }
    }

    /// `aes256-ctr`
    pub fn aes256() -> Self {
        Self {
            name: "aes256-ctr",
            key_size: 32,
            state: None,
        }
    }
}

impl std::fmt::Debug for AesCtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtr")
            .field("name", &self.name)
            .field("initialised", &self.state.is_some())
            .finish()
    }
}

impl Cipher for AesCtr {
    fn name(&self) -> &'static str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn iv_size(&self) -> usize {
        16
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn init(&mut self, _mode: Mode, key: &[u8], iv: &[u8]) -> SkeinResult<()> {
        check_material(self.name, "key material", key.len(), self.key_size)?;
        check_material(self.name, "IV material", iv.len(), 16)?;
        let key = &key[..self.key_size];
        let iv = &iv[..16];
        let bad = |_| SkeinError::Security(format!("Invalid key length for {}", self.name));

        self.state = Some(match self.key_size {
            16 => CtrState::Aes128(Aes128Ctr::new_from_slices(key, iv).map_err(bad)?),
            24 => CtrState::Aes192(Aes192Ctr::new_from_slices(key, iv).map_err(bad)?),
            _ => CtrState::Aes256(Aes256Ctr::new_from_slices(key, iv).map_err(bad)?),
        });
        Ok(())
    }

    fn update(&mut self, data: &mut [u8]) -> SkeinResult<()> {
        match self.state.as_mut() {
            Some(CtrState::Aes128(c)) => c.apply_keystream(data),
            Some(CtrState::Aes192(c)) => c.apply_keystream(data),
            Some(CtrState::Aes256(c)) => c.apply_keystream(data),
            None => {
                return Err(SkeinError::Protocol(format!(
                    "{} used before init",
                    self.name
                )))
            }
        }
        Ok(())
    }
}

enum CbcState {
    Enc128(cbc::Encryptor<Aes128>),
    Dec128(cbc::Decryptor<Aes128>),
    Enc256(cbc::Encryptor<Aes256>),
    Dec256(cbc::Decryptor<Aes256>),
}

/// AES in cipher block chaining mode (RFC 4253 Section 6.3).
pub struct AesCbc {
    name: &'static str,
    key_size: usize,
    state: Option<CbcState>,
}

impl AesCbc {
    /// `aes128-cbc`
    pub fn aes128() -> Self {
        Self {
            name: "aes128-cbc",
            key_size: 16,
            state: None,
        }
    }

    /// `aes256-cbc`
    pub fn aes256() -> Self {
        Self {
            name: "aes256-cbc",
            key_size: 32,
            state: None,
        }
    }
}

impl std::fmt::Debug for AesCbc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCbc")
            .field("name", &self.name)
            .field("initialised", &self.state.is_some())
            .finish()
    }
}

impl Cipher for AesCbc {
    fn name(&self) -> &'static str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn iv_size(&self) -> usize {
        16
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn init(&mut self, mode: Mode, key: &[u8], iv: &[u8]) -> SkeinResult<()> {
        check_material(self.name, "key material", key.len(), self.key_size)?;
        check_material(self.name, "IV material", iv.len(), 16)?;
        let key = &key[..self.key_size];
        let iv = &iv[..16];
        let bad = |_| SkeinError::Security(format!("Invalid key length for {}", self.name));

        self.state = Some(match (self.key_size, mode) {
            (16, Mode::Encrypt) => {
                CbcState::Enc128(cbc::Encryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            (16, Mode::Decrypt) => {
                CbcState::Dec128(cbc::Decryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            (_, Mode::Encrypt) => {
                CbcState::Enc256(cbc::Encryptor::new_from_slices(key, iv).map_err(bad)?)
            }
            (_, Mode::Decrypt) => {
                CbcState::Dec256(cbc::Decryptor::new_from_slices(key, iv).map_err(bad)?)
            }
        });
        Ok(())
    }

    fn update(&mut self, data: &mut [u8]) -> SkeinResult<()> {
        if data.len() % 16 != 0 {
            return Err(SkeinError::Protocol(format!(
                "{} input of {} bytes is not block aligned",
                self.name,
                data.len()
            )));
        }
        let state = self.state.as_mut().ok_or_else(|| {
            SkeinError::Protocol(format!("{} used before init", self.name))
        })?;

        for block in data.chunks_exact_mut(16) {
            let block = GenericArray::from_mut_slice(block);
            match state {
                CbcState::Enc128(c) => c.encrypt_block_mut(block),
                CbcState::Dec128(c) => c.decrypt_block_mut(block),
                CbcState::Enc256(c) => c.encrypt_block_mut(block),
                CbcState::Dec256(c) => c.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

/// Ciphers this crate can instantiate, strongest first.
pub fn default_factories() -> Vec<NamedFactory<dyn Cipher>> {
    vec![
        NamedFactory::new("aes128-ctr", || Box::new(AesCtr::aes128())),
        NamedFactory::new("aes192-ctr", || Box::new(AesCtr::aes192())),
        NamedFactory::new("aes256-ctr", || Box::new(AesCtr::aes256())),
        NamedFactory::new("aes128-cbc", || Box::new(AesCbc::aes128())),
        NamedFactory::new("aes256-cbc", || Box::new(AesCbc::aes256())),
    ]
}

/// Factory for the `none` cipher, used only for the initial codec state.
pub fn none_factory() -> NamedFactory<dyn Cipher> {
    NamedFactory::new("none", || Box::new(NoneCipher))
}
