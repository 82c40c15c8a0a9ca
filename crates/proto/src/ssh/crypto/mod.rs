//! Algorithm families used by the transport.
//!
//! Each family is a capability trait ([`Cipher`], [`Mac`], [`Compression`],
//! [`Signature`]) plus concrete adapters over RustCrypto and `ring`. Families are
//! selected at runtime by name through [`NamedFactory`] registries held in the
//! transport [`Config`](crate::ssh::config::Config); negotiation only ever looks at
//! names, and instances are built after agreement.

pub mod cipher;
pub mod compression;
pub mod mac;
pub mod signature;

pub use self::cipher::{AesCbc, AesCtr, Cipher, NoneCipher};
pub use self::compression::{Compression, NoCompression, ZlibCompression};
pub use self::mac::{HmacAlgorithm, HmacMac, Mac};
pub use self::signature::{EcdsaP256, Ed25519, RsaSha2, Signature};

/// Direction a stateful primitive is initialised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Outbound (encrypt / deflate).
    Encrypt,
    /// Inbound (decrypt / inflate).
    Decrypt,
}

/// A name bound to a constructor.
pub struct NamedFactory<T: ?Sized> {
    name: &'static str,
    create: fn() -> Box<T>,
}

impl<T: ?Sized> NamedFactory<T> {
    /// Registers `create` under `name`.
    pub const fn new(name: &'static str, create: fn() -> Box<T>) -> Self {
        Self { name, create }
    }

    /// Wire name of the algorithm.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Builds a fresh, uninitialised instance.
    pub fn create(&self) -> Box<T> {
        (self.create)()
    }
}

impl<T: ?Sized> Clone for NamedFactory<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            create: self.create,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for NamedFactory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NamedFactory({})", self.name)
    }
}

/// Names of a registry, in preference order.
pub fn names<T: ?Sized>(factories: &[NamedFactory<T>]) -> Vec<String> {
    factories.iter().map(|f| f.name().to_string()).collect()
}

/// Builds the instance registered under `name`.
pub fn create<T: ?Sized>(factories: &[NamedFactory<T>], name: &str) -> Option<Box<T>> {
    factories.iter().find(|f| f.name() == name).map(|f| f.create())
}
