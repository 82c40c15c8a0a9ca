//! Host key verification hooks.
//!
//! Policy lives outside the transport: callers register one or more
//! [`HostKeyVerifier`]s in the [`Config`](crate::ssh::config::Config). During
//! key exchange they are asked in order, and the first one that accepts the
//! key wins. If none accept, the connection is dropped with
//! `HOST_KEY_NOT_VERIFIABLE`.

use base64::Engine;
use sha2::{Digest, Sha256};

/// Decides whether a server host key is trusted.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns `true` to accept `key` (the raw public key blob) for `host:port`.
    fn verify(&self, host: &str, port: u16, key: &[u8]) -> bool;
}

impl<F> HostKeyVerifier for F
where
    F: Fn(&str, u16, &[u8]) -> bool + Send + Sync,
{
    fn verify(&self, host: &str, port: u16, key: &[u8]) -> bool {
        self(host, port, key)
    }
}

/// Accepts every key. Only suitable for tests and trusted networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromiscuousVerifier;

impl HostKeyVerifier for PromiscuousVerifier {
    fn verify(&self, _host: &str, _port: u16, _key: &[u8]) -> bool {
        true
    }
}

/// Accepts keys whose `SHA256:` fingerprint matches one of a fixed set.
#[derive(Debug, Default, Clone)]
pub struct FingerprintVerifier {
    fingerprints: Vec<String>,
}

impl FingerprintVerifier {
    /// Creates a verifier trusting the given fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, _host: &str, _port: u16, key: &[u8]) -> bool {
        let fp = fingerprint(key);
        self.fingerprints.iter().any(|f| *f == fp)
    }
}

/// OpenSSH style fingerprint: `SHA256:` followed by unpadded base64.
pub fn fingerprint(key: &[u8]) -> String {
    let hash = Sha256::digest(key);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}
