//! Transport tests against the scripted server: handshake, rekeying, message
//! routing and disconnects.

mod common;

use async_trait::async_trait;
use common::{
    body, client_config, connect, connect_using, connect_with, ScriptedServer, SERVER_SOFTWARE,
    STEP,
};
use skein_platform::{DisconnectReason, SkeinError, SkeinResult};
use skein_proto::ssh::buffer::Buffer;
use skein_proto::ssh::message::MessageType;
use skein_proto::ssh::{ActiveService, Config, PacketWriter, Service, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const USERAUTH_SUCCESS: u8 = 52;
const USERAUTH_BANNER: u8 = 53;

fn disconnect(reason: DisconnectReason, text: &str) -> Buffer {
    let mut msg = Buffer::new();
    msg.put_u8(MessageType::Disconnect as u8);
    msg.put_u32(reason.code());
    msg.put_str(text);
    msg.put_str("");
    msg
}

/// Checks the transport still works by provoking an UNIMPLEMENTED reply.
async fn assert_round_trip(server: &mut ScriptedServer) {
    let seq = server.send(&[60, 0, 1, 2]).await;
    let mut reply = body(server.expect(MessageType::Unimplemented).await);
    assert_eq!(reply.read_u32().unwrap(), seq);
}

#[tokio::test]
async fn test_handshake_establishes_session() {
    let (transport, server) = connect(client_config()).await;

    assert_eq!(transport.session_id().as_deref(), server.session_id());
    assert_eq!(transport.server_version().software(), SERVER_SOFTWARE);
    assert!(server.client_version().starts_with("SSH-2.0-skein_"));

    let negotiated = transport.negotiated().await.unwrap();
    assert_eq!(negotiated.kex, "curve25519-sha256");
    assert_eq!(negotiated.host_key, "ssh-ed25519");
    assert_eq!(negotiated.cipher_c2s, "aes128-ctr");
    assert_eq!(negotiated.mac_s2c, "hmac-sha2-256");
    assert_eq!(negotiated.compression_c2s, "none");
    assert!(transport.is_open());
}

#[tokio::test]
async fn test_cbc_and_sha512() {
    let (_transport, mut server) = connect_using(client_config(), "aes256-cbc", "hmac-sha2-512").await;
    assert_round_trip(&mut server).await;
}

#[tokio::test]
async fn test_service_request() {
    let (transport, mut server) = connect(client_config()).await;
    let script = tokio::spawn(async move {
        let name = server.accept_service().await;
        (server, name)
    });
    transport.request_service("ssh-userauth").await.unwrap();
    let (_server, name) = script.await.unwrap();
    assert_eq!(name, "ssh-userauth");
}

#[tokio::test]
async fn test_unhandled_messages_get_unimplemented() {
    let (_transport, mut server) = connect(client_config()).await;

    // Ignored and debug messages produce no reply.
    let mut ignore = Buffer::new();
    ignore.put_u8(MessageType::Ignore as u8);
    ignore.put_string(b"padding");
    server.send_buffer(ignore).await;
    let mut debug = Buffer::new();
    debug.put_u8(MessageType::Debug as u8);
    debug.put_bool(false);
    debug.put_str("hello");
    debug.put_str("");
    server.send_buffer(debug).await;

    // Unknown transport-range id.
    let seq = server.send(&[7, 0, 0, 0, 0]).await;
    let mut reply = body(server.expect(MessageType::Unimplemented).await);
    assert_eq!(reply.read_u32().unwrap(), seq);

    // Service-range id with no service active.
    assert_round_trip(&mut server).await;
}

#[tokio::test]
async fn test_host_key_rejected() {
    let config = Config {
        kex_timeout: STEP,
        ..Config::default()
    }
    .with_verifier(|_: &str, _: u16, _: &[u8]| false);

    let (client, server) = tokio::io::duplex(1 << 16);
    let script = tokio::spawn(async move {
        let mut server = ScriptedServer::accept(server).await;
        server.kex_until_reply().await;
        let mut msg = body(server.expect(MessageType::Disconnect).await);
        msg.read_u32().unwrap()
    });

    let err = Transport::start(client, "scripted", 2222, Arc::new(config))
        .await
        .unwrap_err();
    match err {
        SkeinError::HostKeyNotVerifiable {
            algorithm,
            fingerprint,
            host,
            port,
        } => {
            assert_eq!(algorithm, "ssh-ed25519");
            assert!(fingerprint.starts_with("SHA256:"));
            assert_eq!(host, "scripted");
            assert_eq!(port, 2222);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(
        script.await.unwrap(),
        DisconnectReason::HostKeyNotVerifiable.code()
    );
}

#[tokio::test]
async fn test_client_rekey_keeps_session_id() {
    let (transport, mut server) = connect(client_config()).await;
    let session_id = transport.session_id().unwrap();

    let script = tokio::spawn(async move {
        let init = server.expect(MessageType::KexInit).await;
        server.kex_after(init).await;
        server
    });
    transport.rekey().await.unwrap();
    let mut server = script.await.unwrap();

    assert_eq!(server.exchanges, 2);
    assert_eq!(transport.session_id().unwrap(), session_id);
    assert_eq!(server.session_id(), Some(session_id.as_slice()));
    assert_round_trip(&mut server).await;
}

#[tokio::test]
async fn test_server_rekey() {
    let (transport, mut server) = connect(client_config()).await;
    server.kex().await;
    assert_eq!(server.exchanges, 2);
    assert_round_trip(&mut server).await;
    assert!(transport.is_open());
}

#[tokio::test]
async fn test_keepalive_sends_ignore() {
    let config = Config {
        keepalive_interval: Duration::from_millis(50),
        ..client_config()
    };
    let (_transport, mut server) = connect(config).await;
    server.expect(MessageType::Ignore).await;
    server.expect(MessageType::Ignore).await;
}

#[tokio::test]
async fn test_client_disconnect() {
    let (transport, mut server) = connect(client_config()).await;
    transport
        .disconnect(DisconnectReason::ByApplication, "bye")
        .await;
    assert!(!transport.is_open());

    let mut msg = body(server.expect(MessageType::Disconnect).await);
    assert_eq!(msg.read_u32().unwrap(), DisconnectReason::ByApplication.code());
    assert_eq!(msg.read_utf8().unwrap(), "bye");
    assert!(server.next().await.is_none());

    // Idempotent.
    transport
        .disconnect(DisconnectReason::ByApplication, "again")
        .await;
    assert!(matches!(
        transport.request_service("ssh-userauth").await,
        Err(SkeinError::Disconnected { .. })
    ));
}

#[tokio::test]
async fn test_peer_disconnect() {
    let (transport, mut server) = connect(client_config()).await;
    server
        .send_buffer(disconnect(DisconnectReason::ByApplication, "going down"))
        .await;

    let err = tokio::time::timeout(STEP, transport.wait_closed())
        .await
        .unwrap();
    match err {
        SkeinError::Disconnected { reason, message } => {
            assert_eq!(reason, DisconnectReason::ByApplication);
            assert_eq!(message, "going down");
        }
        other => panic!("unexpected error: {}", other),
    }
    // No DISCONNECT is sent back.
    assert!(server.drain().await.is_empty());
}

#[tokio::test]
async fn test_mac_failure_disconnects() {
    let (transport, mut server) = connect(client_config()).await;
    server.send_corrupted(&[MessageType::Ignore as u8, 0, 0, 0, 0]).await;

    let mut msg = body(server.expect(MessageType::Disconnect).await);
    assert_eq!(msg.read_u32().unwrap(), DisconnectReason::MacError.code());

    let err = tokio::time::timeout(STEP, transport.wait_closed())
        .await
        .unwrap();
    assert_eq!(err.disconnect_reason(), DisconnectReason::MacError);
}

#[tokio::test]
async fn test_eof_closes_transport() {
    let (transport, server) = connect(client_config()).await;
    drop(server);
    let err = tokio::time::timeout(STEP, transport.wait_closed())
        .await
        .unwrap();
    assert_eq!(err.disconnect_reason(), DisconnectReason::ConnectionLost);
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_sequence_wrap_triggers_rekey() {
    // The threshold falls on our NEWKEYS, which bypasses the service write
    // path; the next ordinary packet must still start the rekey.
    let config = Config {
        rekey_sequence_margin: u32::MAX - 2,
        ..client_config()
    };
    let (transport, mut server) = connect(config).await;

    let mut ignore = Buffer::new();
    ignore.put_u8(MessageType::Ignore as u8);
    ignore.put_string(b"");
    assert_eq!(transport.write_packet(ignore.clone()).await.unwrap(), 3);

    server.expect(MessageType::Ignore).await;
    let init = server.expect(MessageType::KexInit).await;
    server.kex_after(init).await;
    assert_eq!(server.exchanges, 2);

    // One rekey per wrap cycle.
    transport.write_packet(ignore).await.unwrap();
    server.expect(MessageType::Ignore).await;
    assert_round_trip(&mut server).await;
    assert_eq!(server.exchanges, 2);
}

/// Records service messages and reports authentication on USERAUTH_SUCCESS.
struct AuthService {
    writer: Arc<dyn PacketWriter>,
    seen: mpsc::UnboundedSender<(u8, Buffer)>,
}

#[async_trait]
impl Service for AuthService {
    fn name(&self) -> &str {
        "ssh-userauth"
    }

    async fn handle(&self, id: u8, payload: Buffer) -> SkeinResult<()> {
        if id == USERAUTH_SUCCESS {
            self.writer.authenticated();
        }
        let _ = self.seen.send((id, payload));
        Ok(())
    }

    fn notify_error(&self, _err: &SkeinError) {}
}

#[tokio::test]
async fn test_delayed_compression_starts_after_auth_success() {
    let (transport, mut server) =
        connect_with(client_config(), |server| server.compression = "zlib@openssh.com").await;
    let negotiated = transport.negotiated().await.unwrap();
    assert_eq!(negotiated.compression_s2c, "zlib@openssh.com");
    assert_eq!(negotiated.compression_c2s, "zlib@openssh.com");

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .set_service(ActiveService::External(Arc::new(AuthService {
            writer: transport.packet_writer(),
            seen: tx,
        })))
        .await;

    // The banner is compressed and written right behind the success message.
    server.send(&[USERAUTH_SUCCESS]).await;
    server.set_authenticated();
    let mut banner = Buffer::new();
    banner.put_u8(USERAUTH_BANNER);
    banner.put_str("welcome");
    banner.put_str("");
    server.send_buffer(banner).await;

    let (id, _) = rx.recv().await.unwrap();
    assert_eq!(id, USERAUTH_SUCCESS);
    let (id, mut payload) = rx.recv().await.unwrap();
    assert_eq!(id, USERAUTH_BANNER);
    assert_eq!(payload.read_utf8().unwrap(), "welcome");
    assert!(transport.is_authenticated());

    // Client to server is compressed too.
    assert_round_trip(&mut server).await;
}

#[tokio::test]
async fn test_service_request_fails_when_closed_meanwhile() {
    let config = Config {
        service_timeout: Duration::from_secs(60),
        ..client_config()
    };
    let (transport, mut server) = connect(config).await;
    let request = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.request_service("ssh-userauth").await })
    };
    server.expect(MessageType::ServiceRequest).await;
    server
        .send_buffer(disconnect(DisconnectReason::ServiceNotAvailable, "no"))
        .await;

    let result = tokio::time::timeout(STEP, request).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SkeinError::Disconnected {
            reason: DisconnectReason::ServiceNotAvailable,
            ..
        })
    ));
}
