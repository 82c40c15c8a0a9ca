//! A scripted SSH server for driving the client over an in-memory stream.
//!
//! The server is built from the crate's own primitives (codec, proposal,
//! exchange hash and key derivation) plus `ring` for its X25519 and Ed25519
//! halves. Tests script it message by message.

#![allow(dead_code)]

use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use skein_proto::ssh::buffer::Buffer;
use skein_proto::ssh::codec::{CodecState, Decoder, Encoder};
use skein_proto::ssh::crypto::{self, Mode};
use skein_proto::ssh::kex_dh::{derive_key, exchange_hash, KexContext, KexHash};
use skein_proto::ssh::message::MessageType;
use skein_proto::ssh::proposal::{negotiate, NegotiatedAlgorithms, Proposal};
use skein_proto::ssh::version::{read_identification, send_identification, Version};
use skein_proto::ssh::{Config, PromiscuousVerifier, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// Software version the server announces.
pub const SERVER_SOFTWARE: &str = "ScriptedServer_1.0";

/// Offset between a client channel id and the server's id for it.
pub const SERVER_CHANNEL_OFFSET: u32 = 100;

/// Upper bound for any single test step.
pub const STEP: Duration = Duration::from_secs(5);

/// Client config accepting any host key, with short timeouts.
pub fn client_config() -> Config {
    Config {
        kex_timeout: STEP,
        service_timeout: STEP,
        channel_timeout: STEP,
        ..Config::default()
    }
    .with_verifier(PromiscuousVerifier)
}

/// Connects a client transport to a fresh scripted server and runs the
/// first key exchange on both ends.
pub async fn connect(config: Config) -> (Transport, ScriptedServer) {
    connect_using(config, "aes128-ctr", "hmac-sha2-256").await
}

/// [`connect`] with the server offering only `cipher` and `mac`.
pub async fn connect_using(
    config: Config,
    cipher: &'static str,
    mac: &'static str,
) -> (Transport, ScriptedServer) {
    connect_with(config, move |server| {
        server.cipher = cipher;
        server.mac = mac;
    })
    .await
}

/// [`connect`] with `setup` applied to the server before the first exchange.
pub async fn connect_with(
    config: Config,
    setup: impl FnOnce(&mut ScriptedServer) + Send + 'static,
) -> (Transport, ScriptedServer) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::accept(server).await;
        setup(&mut server);
        server.kex().await;
        server
    });
    let transport = tokio::time::timeout(
        STEP,
        Transport::start(client, "scripted", 22, Arc::new(config)),
    )
    .await
    .expect("handshake timed out")
    .expect("handshake failed");
    let server = server.await.expect("server task panicked");
    (transport, server)
}

/// Reads the message id and returns the buffer positioned after it.
pub fn body(mut payload: Buffer) -> Buffer {
    payload.read_u8().unwrap();
    payload
}

/// Server end of one connection.
pub struct ScriptedServer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    encoder: Encoder,
    decoder: Decoder,
    host_key: Ed25519KeyPair,
    client_version: String,
    server_version: Version,
    session_id: Option<Vec<u8>>,
    authenticated: Arc<AtomicBool>,
    /// Cipher offered in both directions.
    pub cipher: &'static str,
    /// MAC offered in both directions.
    pub mac: &'static str,
    /// Compression offered in both directions.
    pub compression: &'static str,
    /// Number of completed key exchanges.
    pub exchanges: u32,
}

impl ScriptedServer {
    /// Exchanges identification lines.
    pub async fn accept(stream: DuplexStream) -> Self {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let server_version = Version::new(SERVER_SOFTWARE);
        send_identification(&mut writer, &server_version)
            .await
            .unwrap();
        let client_version = read_identification(&mut reader).await.unwrap();

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let host_key = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let authenticated = Arc::new(AtomicBool::new(false));

        Self {
            reader,
            writer,
            encoder: Encoder::new(authenticated.clone()),
            decoder: Decoder::new(authenticated.clone()),
            host_key,
            client_version: client_version.as_str().to_string(),
            server_version,
            session_id: None,
            authenticated,
            cipher: "aes128-ctr",
            mac: "hmac-sha2-256",
            compression: "none",
            exchanges: 0,
        }
    }

    /// The client's identification line.
    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    /// Switches on delayed compression for packets encoded or decoded from
    /// now on.
    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    /// H of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The server's host key blob.
    pub fn host_key_blob(&self) -> Vec<u8> {
        let mut key = Buffer::new();
        key.put_str("ssh-ed25519");
        key.put_string(self.host_key.public_key().as_ref());
        key.as_slice().to_vec()
    }

    /// Sends one payload; returns its sequence number.
    pub async fn send(&mut self, payload: &[u8]) -> u32 {
        let (frame, seq) = self.encoder.encode(payload).unwrap();
        self.writer.write_all(&frame).await.unwrap();
        seq
    }

    /// Sends a payload whose last wire byte (inside the MAC) is flipped.
    pub async fn send_corrupted(&mut self, payload: &[u8]) {
        let (mut frame, _) = self.encoder.encode(payload).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        self.writer.write_all(&frame).await.unwrap();
    }

    /// Sends a payload built in a buffer.
    pub async fn send_buffer(&mut self, payload: Buffer) -> u32 {
        self.send(payload.as_slice()).await
    }

    /// Next payload from the client, or `None` once the stream ends.
    pub async fn next(&mut self) -> Option<Buffer> {
        loop {
            if let Some(packet) = self.decoder.next_packet().unwrap() {
                return Some(packet.payload);
            }
            let mut chunk = vec![0u8; self.decoder.bytes_needed()];
            if self.reader.read_exact(&mut chunk).await.is_err() {
                return None;
            }
            self.decoder.received(&chunk);
        }
    }

    /// Next payload, failing the test after [`STEP`].
    pub async fn recv(&mut self) -> Buffer {
        tokio::time::timeout(STEP, self.next())
            .await
            .expect("timed out waiting for the client")
            .expect("client closed the stream")
    }

    /// Receives a payload and checks its message id.
    pub async fn expect(&mut self, id: MessageType) -> Buffer {
        let payload = self.recv().await;
        assert_eq!(
            payload.as_slice()[0],
            id as u8,
            "expected {}, got message {}",
            id.name(),
            payload.as_slice()[0]
        );
        payload
    }

    /// Waits for the client to close the stream, skipping anything else.
    pub async fn drain(&mut self) -> Vec<u8> {
        let mut ids = Vec::new();
        while let Ok(Some(payload)) = tokio::time::timeout(STEP, self.next()).await {
            ids.push(payload.as_slice()[0]);
        }
        ids
    }

    fn proposal(&self) -> Proposal {
        let one = |name: &str| vec![name.to_string()];
        Proposal::new([
            one("curve25519-sha256"),
            one("ssh-ed25519"),
            one(self.cipher),
            one(self.cipher),
            one(self.mac),
            one(self.mac),
            one(self.compression),
            one(self.compression),
        ])
    }

    /// Server-initiated key exchange.
    pub async fn kex(&mut self) {
        let server = self.send_kexinit().await;
        let client_init = self.expect(MessageType::KexInit).await;
        self.finish_kex(server, client_init).await;
    }

    /// Sends the server's KEXINIT; pair with [`ScriptedServer::finish_kex`].
    pub async fn send_kexinit(&mut self) -> Proposal {
        let server = self.proposal();
        self.send(server.packet()).await;
        server
    }

    /// Key exchange started by the client's KEXINIT.
    pub async fn kex_after(&mut self, client_init: Buffer) {
        let server = self.proposal();
        self.send(server.packet()).await;
        self.finish_kex(server, client_init).await;
    }

    /// Runs a key exchange up to and including KEXDH_REPLY, then stops.
    pub async fn kex_until_reply(&mut self) {
        let server = self.proposal();
        self.send(server.packet()).await;
        let client_init = self.expect(MessageType::KexInit).await;
        self.kex_reply(server, client_init).await;
    }

    /// Completes a key exchange once both KEXINITs have been exchanged.
    pub async fn finish_kex(&mut self, server: Proposal, client_init: Buffer) {
        let (negotiated, k, h, session_id) = self.kex_reply(server, client_init).await;
        self.send(&[MessageType::NewKeys as u8]).await;
        self.expect(MessageType::NewKeys).await;

        let outbound = self.codec_state(&negotiated, &k, &h, &session_id, Mode::Encrypt);
        let inbound = self.codec_state(&negotiated, &k, &h, &session_id, Mode::Decrypt);
        self.encoder.install(outbound);
        self.decoder.install(inbound);
        self.exchanges += 1;
    }

    async fn kex_reply(
        &mut self,
        server: Proposal,
        client_init: Buffer,
    ) -> (NegotiatedAlgorithms, Vec<u8>, Vec<u8>, Vec<u8>) {
        let client = Proposal::parse(client_init.as_slice()).unwrap();
        let negotiated = negotiate(&client, &server).unwrap();

        let mut init = body(self.expect(MessageType::KexdhInit).await);
        let q_c = init.read_string().unwrap();

        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng).unwrap();
        let q_s = private.compute_public_key().unwrap().as_ref().to_vec();
        let k = agree_ephemeral(private, &UnparsedPublicKey::new(&X25519, &q_c), |m| {
            m.to_vec()
        })
        .unwrap();

        let host_key = self.host_key_blob();
        let ctx = KexContext {
            client_version: self.client_version.clone(),
            server_version: self.server_version.as_str().to_string(),
            client_kexinit: client.packet().to_vec(),
            server_kexinit: server.packet().to_vec(),
        };
        let mut qc = Buffer::new();
        qc.put_string(&q_c);
        let mut qs = Buffer::new();
        qs.put_string(&q_s);
        let h = exchange_hash(
            KexHash::Sha256,
            &ctx,
            &host_key,
            qc.as_slice(),
            qs.as_slice(),
            &k,
        );
        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();

        let mut sig = Buffer::new();
        sig.put_str("ssh-ed25519");
        sig.put_string(self.host_key.sign(&h).as_ref());

        let mut reply = Buffer::new();
        reply.put_u8(MessageType::KexdhReply as u8);
        reply.put_string(&host_key);
        reply.put_string(&q_s);
        reply.put_string(sig.as_slice());
        self.send_buffer(reply).await;
        (negotiated, k, h, session_id)
    }

    fn codec_state(
        &self,
        negotiated: &NegotiatedAlgorithms,
        k: &[u8],
        h: &[u8],
        session_id: &[u8],
        mode: Mode,
    ) -> CodecState {
        // The server encrypts with the server-to-client keys.
        let (cipher_name, mac_name, letters) = match mode {
            Mode::Encrypt => (&negotiated.cipher_s2c, &negotiated.mac_s2c, [b'B', b'D', b'F']),
            Mode::Decrypt => (&negotiated.cipher_c2s, &negotiated.mac_c2s, [b'A', b'C', b'E']),
        };
        let derive = |letter: u8, len: usize| derive_key(KexHash::Sha256, k, h, session_id, letter, len);

        let mut cipher =
            crypto::create(&crypto::cipher::default_factories(), cipher_name).unwrap();
        let iv = derive(letters[0], cipher.iv_size());
        let key = derive(letters[1], cipher.key_size());
        cipher.init(mode, &key, &iv).unwrap();

        let mut mac = crypto::create(&crypto::mac::default_factories(), mac_name).unwrap();
        mac.init(&derive(letters[2], mac.key_size())).unwrap();

        let compression = match self.compression {
            "none" => None,
            name => {
                let mut c =
                    crypto::create(&crypto::compression::default_factories(), name).unwrap();
                c.init(mode);
                Some(c)
            }
        };

        CodecState::new(cipher, Some(mac), compression)
    }

    /// Answers a SERVICE_REQUEST with SERVICE_ACCEPT.
    pub async fn accept_service(&mut self) -> String {
        let mut request = body(self.expect(MessageType::ServiceRequest).await);
        let name = request.read_utf8().unwrap();
        let mut accept = Buffer::new();
        accept.put_u8(MessageType::ServiceAccept as u8);
        accept.put_str(&name);
        self.send_buffer(accept).await;
        name
    }

    /// Confirms the next CHANNEL_OPEN; returns the client's channel id.
    pub async fn confirm_channel(&mut self, window: u32, max_packet: u32) -> u32 {
        let mut open = body(self.expect(MessageType::ChannelOpen).await);
        assert_eq!(open.read_utf8().unwrap(), "session");
        let sender = open.read_u32().unwrap();

        let mut msg = Buffer::new();
        msg.put_u8(MessageType::ChannelOpenConfirmation as u8);
        msg.put_u32(sender);
        msg.put_u32(sender + SERVER_CHANNEL_OFFSET);
        msg.put_u32(window);
        msg.put_u32(max_packet);
        self.send_buffer(msg).await;
        sender
    }

    /// Receives a CHANNEL_REQUEST named `name`; returns (want_reply, rest).
    pub async fn expect_request(&mut self, name: &str) -> (bool, Buffer) {
        let mut req = body(self.expect(MessageType::ChannelRequest).await);
        let _recipient = req.read_u32().unwrap();
        assert_eq!(req.read_utf8().unwrap(), name);
        let want_reply = req.read_bool().unwrap();
        (want_reply, req)
    }

    /// Sends a message addressed to client channel `channel`.
    pub async fn channel_msg(&mut self, id: MessageType, channel: u32, build: impl FnOnce(&mut Buffer)) {
        let mut msg = Buffer::new();
        msg.put_u8(id as u8);
        msg.put_u32(channel);
        build(&mut msg);
        self.send_buffer(msg).await;
    }
}
