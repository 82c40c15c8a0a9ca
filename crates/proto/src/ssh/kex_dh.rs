//! Key exchange methods (RFC 4253 Section 8, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - `curve25519-sha256` and `curve25519-sha256@libssh.org`
//! - `diffie-hellman-group14-sha256`
//!
//! plus the session key derivation of RFC 4253 Section 7.2. Each method is a
//! [`KeyExchange`] driven by the key exchange state machine in [`kex`]: `init`
//! yields the client's first message and `next` consumes the server's replies
//! until the method reports the host key, shared secret and exchange hash.
//!
//! [`kex`]: crate::ssh::kex

use crate::ssh::buffer::Buffer;
use crate::ssh::crypto::NamedFactory;
use crate::ssh::message::{self, MessageType};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256, Sha512};
use skein_platform::{DisconnectReason, SkeinError, SkeinResult};
use zeroize::Zeroize;

/// Diffie-Hellman Group 14 parameters (RFC 3526).
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
        29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
        EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
        E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
        EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
        C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
        83655D23DCA3AD961C62F356208552BB9ED529077096966D\
        670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
        E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
        DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
        15728E5A8AACAA68FFFFFFFFFFFFFFFF";

    /// 2048-bit MODP prime
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        // The literal is valid hex, so parsing cannot fail.
        BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).unwrap_or_default()
    });

    /// Generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            KexHash::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            KexHash::Sha512 => {
                let mut h = Sha512::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// Transcript inputs shared by every method.
#[derive(Debug, Clone, Default)]
pub struct KexContext {
    /// V_C without CR LF
    pub client_version: String,
    /// V_S without CR LF
    pub server_version: String,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: Vec<u8>,
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: Vec<u8>,
}

/// Result of a completed method.
#[derive(Clone)]
pub struct KexOutput {
    /// K_S, the server host key blob
    pub host_key: Vec<u8>,
    /// K as an unsigned big-endian magnitude
    pub shared_secret: Vec<u8>,
    /// H
    pub exchange_hash: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("host_key_len", &self.host_key.len())
            .field("shared_secret", &"<redacted>")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .finish()
    }
}

impl Drop for KexOutput {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Outcome of feeding one message to a method.
#[derive(Debug)]
pub enum KexStep {
    /// More rounds follow; send the payload if present.
    Continue(Option<Buffer>),
    /// The method finished.
    Done(KexOutput),
}

/// A key exchange method's sub-protocol.
pub trait KeyExchange: Send {
    /// Wire name.
    fn name(&self) -> &'static str;
    /// Hash used for H and key derivation.
    fn hash(&self) -> KexHash;
    /// Starts the method, returning the first message to send.
    fn init(&mut self, ctx: KexContext) -> SkeinResult<Buffer>;
    /// Consumes a message in the 30-49 range.
    fn next(&mut self, msg_id: u8, payload: &mut Buffer) -> SkeinResult<KexStep>;
}

fn unexpected(method: &str, msg_id: u8) -> SkeinError {
    SkeinError::transport(
        DisconnectReason::ProtocolError,
        format!("{} got unexpected {}", method, message::describe(msg_id)),
    )
}

/// Computes H for an exchange (RFC 4253 Section 8, RFC 5656 Section 4).
///
/// `client_public` and `server_public` must already be wire encoded
/// (`string` for ECDH, `mpint` for finite-field DH).
pub fn exchange_hash(
    hash: KexHash,
    ctx: &KexContext,
    host_key: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::with_capacity(2048);
    buf.put_str(&ctx.client_version);
    buf.put_str(&ctx.server_version);
    buf.put_string(&ctx.client_kexinit);
    buf.put_string(&ctx.server_kexinit);
    buf.put_string(host_key);
    buf.put_raw(client_public);
    buf.put_raw(server_public);
    buf.put_mpint(shared_secret);
    hash.digest(&[buf.as_slice()])
}

/// Diffie-Hellman Group 14 key pair.
pub struct DhGroup14Exchange {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates an ephemeral key pair.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};

        let mut rng = rand::thread_rng();
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Public value `e = g^x mod p`.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes `K = f^x mod p`, rejecting `f` outside `(1, p-1)`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SkeinResult<Vec<u8>> {
        use num_bigint::BigUint;

        let f = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;
        if f <= BigUint::from(1u32) || f >= p_minus_one {
            return Err(SkeinError::transport(
                DisconnectReason::KeyExchangeFailed,
                "Invalid peer public key: out of range",
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(f.modpow(&x, &dh_group14::P).to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 ephemeral key pair.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates an ephemeral key pair.
    pub fn new() -> SkeinResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SkeinError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            SkeinError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Public value Q.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Consumes the key pair and computes the shared secret.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> SkeinResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(SkeinError::transport(
                DisconnectReason::KeyExchangeFailed,
                format!("Curve25519 public key must be 32 bytes, got {}", peer_public.len()),
            ));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| SkeinError::Security("Curve25519 key agreement failed".to_string()))
    }
}

/// `curve25519-sha256` client driver.
pub struct Curve25519Sha256 {
    name: &'static str,
    exchange: Option<Curve25519Exchange>,
    ctx: KexContext,
}

impl Curve25519Sha256 {
    /// Driver registered under `name` (both names describe the same method).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            exchange: None,
            ctx: KexContext::default(),
        }
    }
}

impl KeyExchange for Curve25519Sha256 {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn init(&mut self, ctx: KexContext) -> SkeinResult<Buffer> {
        let exchange = Curve25519Exchange::new()?;
        let mut msg = Buffer::new();
        msg.put_u8(MessageType::KexdhInit as u8);
        msg.put_string(exchange.public_key());
        self.exchange = Some(exchange);
        self.ctx = ctx;
        Ok(msg)
    }

    fn next(&mut self, msg_id: u8, payload: &mut Buffer) -> SkeinResult<KexStep> {
        if msg_id != MessageType::KexdhReply as u8 {
            return Err(unexpected(self.name, msg_id));
        }
        let exchange = self
            .exchange
            .take()
            .ok_or_else(|| unexpected(self.name, msg_id))?;

        let host_key = payload.read_string()?;
        let server_public = payload.read_string()?;
        let signature = payload.read_string()?;

        let client_public = *exchange.public_key();
        let shared_secret = exchange.compute_shared_secret(&server_public)?;

        let mut q_c = Buffer::new();
        q_c.put_string(&client_public);
        let mut q_s = Buffer::new();
        q_s.put_string(&server_public);

        let h = exchange_hash(
            self.hash(),
            &self.ctx,
            &host_key,
            q_c.as_slice(),
            q_s.as_slice(),
            &shared_secret,
        );

        Ok(KexStep::Done(KexOutput {
            host_key,
            shared_secret,
            exchange_hash: h,
            signature,
        }))
    }
}

/// `diffie-hellman-group14-sha256` client driver.
#[derive(Default)]
pub struct DhGroup14Sha256 {
    exchange: Option<DhGroup14Exchange>,
    ctx: KexContext,
}

impl KeyExchange for DhGroup14Sha256 {
    fn name(&self) -> &'static str {
        "diffie-hellman-group14-sha256"
    }

    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn init(&mut self, ctx: KexContext) -> SkeinResult<Buffer> {
        let exchange = DhGroup14Exchange::new();
        let mut msg = Buffer::with_capacity(512);
        msg.put_u8(MessageType::KexdhInit as u8);
        msg.put_mpint(exchange.public_key());
        self.exchange = Some(exchange);
        self.ctx = ctx;
        Ok(msg)
    }

    fn next(&mut self, msg_id: u8, payload: &mut Buffer) -> SkeinResult<KexStep> {
        if msg_id != MessageType::KexdhReply as u8 {
            return Err(unexpected(self.name(), msg_id));
        }
        let exchange = self
            .exchange
            .take()
            .ok_or_else(|| unexpected(self.name(), msg_id))?;

        let host_key = payload.read_string()?;
        let f = payload.read_mpint()?;
        let signature = payload.read_string()?;

        let shared_secret = exchange.compute_shared_secret(&f)?;

        let mut e_enc = Buffer::with_capacity(512);
        e_enc.put_mpint(exchange.public_key());
        let mut f_enc = Buffer::with_capacity(512);
        f_enc.put_mpint(&f);

        let h = exchange_hash(
            self.hash(),
            &self.ctx,
            &host_key,
            e_enc.as_slice(),
            f_enc.as_slice(),
            &shared_secret,
        );

        Ok(KexStep::Done(KexOutput {
            host_key,
            shared_secret,
            exchange_hash: h,
            signature,
        }))
    }
}

/// Key exchange methods offered by default, in preference order.
pub fn default_factories() -> Vec<NamedFactory<dyn KeyExchange>> {
    vec![
        NamedFactory::new("curve25519-sha256", || {
            Box::new(Curve25519Sha256::new("curve25519-sha256"))
        }),
        NamedFactory::new("curve25519-sha256@libssh.org", || {
            Box::new(Curve25519Sha256::new("curve25519-sha256@libssh.org"))
        }),
        NamedFactory::new("diffie-hellman-group14-sha256", || {
            Box::new(DhGroup14Sha256::default())
        }),
    ]
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || key_type || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// K is hashed in its `mpint` encoding. The result is exactly `key_length`
/// bytes long.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k = Buffer::new();
    k.put_mpint(shared_secret);

    let mut key = hash.digest(&[k.as_slice(), exchange_hash, &[key_type], session_id]);
    while key.len() < key_length {
        let block = hash.digest(&[k.as_slice(), exchange_hash, &key]);
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> KexContext {
        KexContext {
            client_version: "SSH-2.0-test_0.1".to_string(),
            server_version: "SSH-2.0-OpenSSH_x".to_string(),
            client_kexinit: vec![20, 1, 2, 3],
            server_kexinit: vec![20, 4, 5, 6],
        }
    }

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(client_secret, server_secret);
        assert!(!client_secret.is_empty());
    }

    #[test]
    fn test_dh_group14_invalid_peer_key() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange.compute_shared_secret(&[]).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_driver_matches_server_side() {
        let mut driver = Curve25519Sha256::new("curve25519-sha256");
        let mut init = driver.init(context()).unwrap();
        assert_eq!(init.read_u8().unwrap(), MessageType::KexdhInit as u8);
        let client_public = init.read_string().unwrap();

        // Play the server.
        let server = Curve25519Exchange::new().unwrap();
        let server_public = *server.public_key();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();
        let host_key = b"host key blob".to_vec();

        let mut reply = Buffer::new();
        reply.put_string(&host_key);
        reply.put_string(&server_public);
        reply.put_string(b"sig");

        let output = match driver.next(MessageType::KexdhReply as u8, &mut reply).unwrap() {
            KexStep::Done(output) => output,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(output.shared_secret, server_secret);
        assert_eq!(output.host_key, host_key);
        assert_eq!(output.signature, b"sig");

        let mut q_c = Buffer::new();
        q_c.put_string(&client_public);
        let mut q_s = Buffer::new();
        q_s.put_string(&server_public);
        let expected = exchange_hash(
            KexHash::Sha256,
            &context(),
            &host_key,
            q_c.as_slice(),
            q_s.as_slice(),
            &server_secret,
        );
        assert_eq!(output.exchange_hash, expected);
        assert_eq!(output.exchange_hash.len(), 32);
    }

    #[test]
    fn test_driver_rejects_wrong_message() {
        let mut driver = DhGroup14Sha256::default();
        driver.init(context()).unwrap();
        let mut empty = Buffer::new();
        let result = driver.next(MessageType::KexdhInit as u8, &mut empty);
        assert!(matches!(result, Err(SkeinError::Transport { .. })));
    }

    #[test]
    fn test_derive_key() {
        let shared_secret = vec![0x42; 32];
        let exchange_hash = vec![0x01; 32];
        let session_id = vec![0x02; 32];

        let key = derive_key(KexHash::Sha256, &shared_secret, &exchange_hash, &session_id, b'C', 32);
        assert_eq!(key.len(), 32);

        let key_a = derive_key(KexHash::Sha256, &shared_secret, &exchange_hash, &session_id, b'A', 32);
        assert_ne!(key_a, key);
    }

    #[test]
    fn test_derive_key_extension_hashes_accumulated_key() {
        let shared_secret = vec![0x42; 32];
        let exchange_hash = vec![0x01; 32];
        let session_id = vec![0x02; 32];

        let key = derive_key(KexHash::Sha256, &shared_secret, &exchange_hash, &session_id, b'C', 80);
        assert_eq!(key.len(), 80);

        let mut k = Buffer::new();
        k.put_mpint(&shared_secret);
        let k1 = KexHash::Sha256.digest(&[k.as_slice(), &exchange_hash, b"C", &session_id]);
        let k2 = KexHash::Sha256.digest(&[k.as_slice(), &exchange_hash, &k1]);
        let k12 = [k1.clone(), k2.clone()].concat();
        let k3 = KexHash::Sha256.digest(&[k.as_slice(), &exchange_hash, &k12]);

        assert_eq!(&key[..32], &k1[..]);
        assert_eq!(&key[32..64], &k2[..]);
        assert_eq!(&key[64..], &k3[..16]);
    }

    #[test]
    fn test_derive_key_satisfies_every_cipher() {
        for needed in [16usize, 24, 32, 64, 100] {
            let key = derive_key(KexHash::Sha256, &[7u8; 32], &[1u8; 32], &[2u8; 32], b'C', needed);
            assert!(key.len() >= needed);
        }
    }
}
