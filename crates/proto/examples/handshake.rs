//! SSH Handshake Example
//!
//! This example demonstrates how to:
//! - Connect to an SSH server and run the key exchange
//! - Check the server host key against an expected fingerprint
//! - Request the user authentication service
//! - Disconnect cleanly
//!
//! Usage:
//!   cargo run --example handshake <host> <port> [SHA256:fingerprint]
//!
//! Without a fingerprint every host key is accepted and printed.
//! Set `RUST_LOG=skein_proto=debug` to watch the protocol.

use skein_platform::DisconnectReason;
use skein_proto::ssh::hostkey::fingerprint;
use skein_proto::ssh::{Config, FingerprintVerifier, Transport};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <host> <port> [SHA256:fingerprint]", args[0]);
        std::process::exit(1);
    }
    let host = &args[1];
    let port: u16 = args[2].parse()?;

    let config = match args.get(3) {
        Some(expected) => Config::default().with_verifier(FingerprintVerifier::new([expected.clone()])),
        None => Config::default().with_verifier(|host: &str, port: u16, key: &[u8]| {
            println!("Accepting host key for {}:{}: {}", host, port, fingerprint(key));
            true
        }),
    };

    println!("Connecting to {}:{}...", host, port);
    let transport = Transport::connect(host, port, Arc::new(config)).await?;

    println!("Server: {}", transport.server_version());
    if let Some(negotiated) = transport.negotiated().await {
        println!("Negotiated: {}", negotiated);
    }
    if let Some(session_id) = transport.session_id() {
        println!("Session id: {}", hex::encode(session_id));
    }

    transport.request_service("ssh-userauth").await?;
    println!("ssh-userauth accepted");

    transport
        .disconnect(DisconnectReason::ByApplication, "handshake example done")
        .await;
    Ok(())
}
