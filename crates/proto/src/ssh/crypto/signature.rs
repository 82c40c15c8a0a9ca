//! Host key signature verification (RFC 4253 Section 6.6, RFC 8332, RFC 5656, RFC 8709).
//!
//! Only verification is needed on the client side. Each implementation parses the
//! server's public key blob (`string name || key fields`) and the signature blob
//! (`string name || string signature`) and checks the signature over the
//! exchange hash.

use super::NamedFactory;
use crate::ssh::buffer::Buffer;
use ed25519_dalek::Verifier as _;
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512};
use signature::Verifier as _;
use skein_platform::{SkeinError, SkeinResult};

/// Capability interface for a host key signature algorithm.
pub trait Signature: Send + Sync {
    /// Wire name of the signature algorithm.
    fn name(&self) -> &'static str;
    /// Key type expected in the public key blob.
    fn key_type(&self) -> &'static str;
    /// Verifies `signature_blob` over `data` with the key in `key_blob`.
    fn verify(&self, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkeinResult<()>;
}

fn bad_signature(name: &str) -> SkeinError {
    SkeinError::Security(format!("{} signature verification failed", name))
}

/// Reads the key type and returns the buffer positioned after it.
fn open_key_blob(expected: &str, key_blob: &[u8]) -> SkeinResult<Buffer> {
    let mut buf = Buffer::from_slice(key_blob);
    let key_type = buf.read_utf8()?;
    if key_type != expected {
        return Err(SkeinError::Security(format!(
            "Host key type mismatch: expected {}, got {}",
            expected, key_type
        )));
    }
    Ok(buf)
}

/// Extracts the raw signature from `string name || string sig`.
fn signature_bytes(expected: &str, signature_blob: &[u8]) -> SkeinResult<Vec<u8>> {
    let mut buf = Buffer::from_slice(signature_blob);
    let name = buf.read_utf8()?;
    if name != expected {
        return Err(SkeinError::Security(format!(
            "Signature algorithm mismatch: expected {}, got {}",
            expected, name
        )));
    }
    buf.read_string()
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Returns the key type named at the start of a public key blob.
pub fn key_type_of(key_blob: &[u8]) -> SkeinResult<String> {
    Buffer::from_slice(key_blob).read_utf8()
}

/// `ssh-ed25519`
#[derive(Debug, Default)]
pub struct Ed25519;

impl Signature for Ed25519 {
    fn name(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn key_type(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn verify(&self, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkeinResult<()> {
        let mut key = open_key_blob(self.key_type(), key_blob)?;
        let public: [u8; 32] = key.read_string()?.try_into().map_err(|_| {
            SkeinError::Security("Ed25519 public key must be 32 bytes".to_string())
        })?;
        let sig: [u8; 64] = signature_bytes(self.name(), signature_blob)?
            .try_into()
            .map_err(|_| SkeinError::Security("Ed25519 signature must be 64 bytes".to_string()))?;

        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public)
            .map_err(|e| SkeinError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig);

        verifying_key
            .verify(data, &signature)
            .map_err(|_| bad_signature(self.name()))
    }
}

/// `rsa-sha2-256` / `rsa-sha2-512` over an `ssh-rsa` key.
#[derive(Debug)]
pub struct RsaSha2 {
    name: &'static str,
}

impl RsaSha2 {
    /// `rsa-sha2-256`
    pub fn sha256() -> Self {
        Self {
            name: "rsa-sha2-256",
        }
    }

    /// `rsa-sha2-512`
    pub fn sha512() -> Self {
        Self {
            name: "rsa-sha2-512",
        }
    }
}

impl Signature for RsaSha2 {
    fn name(&self) -> &'static str {
        self.name
    }

    fn key_type(&self) -> &'static str {
        "ssh-rsa"
    }

    fn verify(&self, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkeinResult<()> {
        let mut key = open_key_blob(self.key_type(), key_blob)?;
        let e = key.read_mpint()?;
        let n = key.read_mpint()?;
        let sig = signature_bytes(self.name, signature_blob)?;

        let components = RsaPublicKeyComponents {
            n: strip_leading_zeros(&n),
            e: strip_leading_zeros(&e),
        };
        let params = if self.name == "rsa-sha2-512" {
            &RSA_PKCS1_2048_8192_SHA512
        } else {
            &RSA_PKCS1_2048_8192_SHA256
        };
        components
            .verify(params, data, &sig)
            .map_err(|_| bad_signature(self.name))
    }
}

/// `ecdsa-sha2-nistp256`
#[derive(Debug, Default)]
pub struct EcdsaP256;

impl Signature for EcdsaP256 {
    fn name(&self) -> &'static str {
        "ecdsa-sha2-nistp256"
    }

    fn key_type(&self) -> &'static str {
        "ecdsa-sha2-nistp256"
    }

    fn verify(&self, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkeinResult<()> {
        let mut key = open_key_blob(self.key_type(), key_blob)?;
        let curve = key.read_utf8()?;
        if curve != "nistp256" {
            return Err(SkeinError::Security(format!(
                "Unexpected ECDSA curve {}",
                curve
            )));
        }
        let point = key.read_string()?;
        let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&point)
            .map_err(|e| SkeinError::Security(format!("Invalid P-256 public key: {}", e)))?;

        let mut inner = Buffer::from_slice(&signature_bytes(self.name(), signature_blob)?);
        let r = inner.read_mpint()?;
        let s = inner.read_mpint()?;
        let (r, s) = (strip_leading_zeros(&r), strip_leading_zeros(&s));
        if r.len() > 32 || s.len() > 32 {
            return Err(SkeinError::Security(
                "ECDSA signature component too large".to_string(),
            ));
        }
        let mut rs = [0u8; 64];
        rs[32 - r.len()..32].copy_from_slice(r);
        rs[64 - s.len()..].copy_from_slice(s);

        let signature = p256::ecdsa::Signature::from_slice(&rs)
            .map_err(|e| SkeinError::Security(format!("Invalid ECDSA signature: {}", e)))?;
        verifying_key
            .verify(data, &signature)
            .map_err(|_| bad_signature(self.name()))
    }
}

/// Host key algorithms offered by default, in preference order.
pub fn default_factories() -> Vec<NamedFactory<dyn Signature>> {
    vec![
        NamedFactory::new("ssh-ed25519", || Box::new(Ed25519)),
        NamedFactory::new("ecdsa-sha2-nistp256", || Box::new(EcdsaP256)),
        NamedFactory::new("rsa-sha2-512", || Box::new(RsaSha2::sha512())),
        NamedFactory::new("rsa-sha2-256", || Box::new(RsaSha2::sha256())),
    ]
}
