//! Key exchange state machine (RFC 4253 Sections 7-9).
//!
//! ```text
//! AwaitingKexInit --(KEXINIT exchanged)--> AwaitingFollowup
//! AwaitingFollowup --(method done, host key accepted, NEWKEYS sent)--> AwaitingNewKeys
//! AwaitingNewKeys --(peer NEWKEYS)--> AwaitingKexInit
//! ```
//!
//! The machine is driven from two sides: [`KexMachine::start`] is called by
//! whoever wants a (re)key, and [`KexMachine::handle`] is called by the
//! transport's reader for every message in the key exchange range.
//!
//! Only one exchange runs at a time; `start` is a no-op while one is in
//! flight. While an exchange runs, the transport holds back every outbound
//! message with an id of 50 or above until [`KexMachine::wait_done`] returns.
//!
//! New outbound keys are installed into the encoder under the write lock right
//! after NEWKEYS is written, so the very next packet uses them. Inbound keys
//! are handed back to the reader when the peer's NEWKEYS arrives.

use crate::ssh::buffer::Buffer;
use crate::ssh::codec::CodecState;
use crate::ssh::config::Config;
use crate::ssh::crypto::{self, Compression, Mode};
use crate::ssh::hostkey;
use crate::ssh::kex_dh::{derive_key, KexContext, KexHash, KexOutput, KexStep, KeyExchange};
use crate::ssh::message::{self, MessageType};
use crate::ssh::proposal::{self, NegotiatedAlgorithms, Proposal};
use crate::ssh::transport::Writer;
use once_cell::sync::OnceCell;
use skein_platform::{DisconnectReason, Event, SkeinError, SkeinResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use zeroize::Zeroizing;

/// Position in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexPhase {
    /// Idle, or our KEXINIT is out and the peer's has not arrived yet.
    AwaitingKexInit,
    /// Negotiated; the method's own messages are flowing.
    AwaitingFollowup,
    /// Our NEWKEYS is sent; waiting for the peer's.
    AwaitingNewKeys,
}

/// Transcript and host identity inputs fixed for the whole connection.
#[derive(Debug, Clone)]
pub struct KexPeer {
    /// Host name used for verification and diagnostics.
    pub host: String,
    /// Port used for verification and diagnostics.
    pub port: u16,
    /// Our identification line, without CR LF.
    pub client_version: String,
    /// The server identification line, without CR LF.
    pub server_version: String,
}

struct KexState {
    phase: KexPhase,
    client_proposal: Option<Proposal>,
    negotiated: Option<NegotiatedAlgorithms>,
    method: Option<Box<dyn KeyExchange>>,
    skip_guess: bool,
    pending_inbound: Option<CodecState>,
}

/// Drives key exchanges for one transport.
pub struct KexMachine {
    config: Arc<Config>,
    peer: KexPeer,
    ongoing: AtomicBool,
    kexinit_sent: Event<()>,
    done: Event<()>,
    failure: OnceCell<SkeinError>,
    session_id: OnceCell<Vec<u8>>,
    state: Mutex<KexState>,
}

impl std::fmt::Debug for KexMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexMachine")
            .field("host", &self.peer.host)
            .field("port", &self.peer.port)
            .field("ongoing", &self.is_ongoing())
            .field("session_id", &self.session_id.get().map(hex::encode))
            .finish()
    }
}

fn kex_failed(msg: impl Into<String>) -> SkeinError {
    SkeinError::transport(DisconnectReason::KeyExchangeFailed, msg)
}

fn out_of_order(id: u8, phase: KexPhase) -> SkeinError {
    SkeinError::transport(
        DisconnectReason::ProtocolError,
        format!("Unexpected {} in {:?}", message::describe(id), phase),
    )
}

impl KexMachine {
    /// Creates an idle machine.
    pub fn new(config: Arc<Config>, peer: KexPeer) -> Self {
        Self {
            config,
            peer,
            ongoing: AtomicBool::new(false),
            kexinit_sent: Event::new("kexinit sent"),
            done: Event::new("kex done"),
            failure: OnceCell::new(),
            session_id: OnceCell::new(),
            state: Mutex::new(KexState {
                phase: KexPhase::AwaitingKexInit,
                client_proposal: None,
                negotiated: None,
                method: None,
                skip_guess: false,
                pending_inbound: None,
            }),
        }
    }

    /// Whether an exchange is in flight.
    pub fn is_ongoing(&self) -> bool {
        self.ongoing.load(Ordering::Acquire)
    }

    /// H of the first exchange, once it has completed.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.get().map(Vec::as_slice)
    }

    /// Current phase.
    pub async fn phase(&self) -> KexPhase {
        self.state.lock().await.phase
    }

    /// Algorithms agreed in the most recent exchange.
    pub async fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        self.state.lock().await.negotiated.clone()
    }

    /// Sends our KEXINIT unless an exchange is already running.
    pub(crate) async fn start(&self, writer: &Mutex<Writer>) -> SkeinResult<()> {
        if let Some(err) = self.failure.get() {
            return Err(err.clone());
        }

        let proposal = Proposal::from_config(&self.config);
        let mut w = writer.lock().await;
        if self.ongoing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.done.clear();
        self.state.lock().await.client_proposal = Some(proposal.clone());

        debug!("Sending KEXINIT to {}:{}", self.peer.host, self.peer.port);
        w.send(proposal.packet()).await?;
        drop(w);

        self.kexinit_sent.set(());
        Ok(())
    }

    /// Waits for the running exchange (if any) to finish.
    pub async fn wait_done(&self) -> SkeinResult<()> {
        if let Some(err) = self.failure.get() {
            return Err(err.clone());
        }
        if !self.is_ongoing() {
            return Ok(());
        }
        self.done.wait(self.config.kex_timeout).await
    }

    /// Fails the machine; every waiter receives `err`.
    pub(crate) fn deliver_error(&self, err: &SkeinError) {
        let _ = self.failure.set(err.clone());
        self.kexinit_sent.deliver_error(err.clone());
        self.done.deliver_error(err.clone());
    }

    /// Feeds one inbound message in the 20, 21, 30-49 range.
    ///
    /// `payload` is positioned after the message id. Returns the inbound codec
    /// state to install once the peer's NEWKEYS has been read.
    pub(crate) async fn handle(
        &self,
        writer: &Mutex<Writer>,
        id: u8,
        payload: Buffer,
    ) -> SkeinResult<Option<CodecState>> {
        match MessageType::from_u8(id) {
            Some(MessageType::KexInit) => {
                self.got_kexinit(writer, payload).await?;
                Ok(None)
            }
            Some(MessageType::NewKeys) => self.got_newkeys().await.map(Some),
            _ => {
                self.got_followup(writer, id, payload).await?;
                Ok(None)
            }
        }
    }

    async fn got_kexinit(&self, writer: &Mutex<Writer>, payload: Buffer) -> SkeinResult<()> {
        if !self.is_ongoing() {
            debug!("Peer initiated key exchange");
            self.start(writer).await?;
        }
        self.kexinit_sent.wait(self.config.kex_timeout).await?;

        let server = Proposal::parse(payload.written(0))?;
        debug!("Received KEXINIT");

        let first_message = {
            let mut st = self.state.lock().await;
            if st.phase != KexPhase::AwaitingKexInit {
                return Err(out_of_order(MessageType::KexInit as u8, st.phase));
            }
            let client = st
                .client_proposal
                .as_ref()
                .ok_or_else(|| kex_failed("KEXINIT received before ours was built"))?;

            let negotiated = proposal::negotiate(client, &server)?;
            info!("Negotiated algorithms: {}", negotiated);

            let mut method = crypto::create(&self.config.kex, &negotiated.kex).ok_or_else(|| {
                SkeinError::Negotiation(format!("No factory for {}", negotiated.kex))
            })?;
            let first = method.init(KexContext {
                client_version: self.peer.client_version.clone(),
                server_version: self.peer.server_version.clone(),
                client_kexinit: client.packet().to_vec(),
                server_kexinit: server.packet().to_vec(),
            })?;

            st.skip_guess =
                server.first_kex_packet_follows() && proposal::guess_is_wrong(&server, &negotiated);
            if st.skip_guess {
                debug!("Peer guessed wrong; discarding its first kex packet");
            }
            st.negotiated = Some(negotiated);
            st.method = Some(method);
            st.phase = KexPhase::AwaitingFollowup;
            first
        };

        writer.lock().await.send(first_message.as_slice()).await?;
        Ok(())
    }

    async fn got_followup(
        &self,
        writer: &Mutex<Writer>,
        id: u8,
        mut payload: Buffer,
    ) -> SkeinResult<()> {
        let (output, hash, negotiated) = {
            let mut st = self.state.lock().await;
            if st.phase != KexPhase::AwaitingFollowup {
                return Err(out_of_order(id, st.phase));
            }
            if st.skip_guess {
                st.skip_guess = false;
                trace!("Discarded guessed {}", message::describe(id));
                return Ok(());
            }
            let method = st
                .method
                .as_mut()
                .ok_or_else(|| out_of_order(id, KexPhase::AwaitingFollowup))?;
            let hash = method.hash();
            match method.next(id, &mut payload)? {
                KexStep::Continue(reply) => {
                    drop(st);
                    if let Some(reply) = reply {
                        writer.lock().await.send(reply.as_slice()).await?;
                    }
                    return Ok(());
                }
                KexStep::Done(output) => {
                    st.method = None;
                    let negotiated = st
                        .negotiated
                        .clone()
                        .ok_or_else(|| kex_failed("method finished before negotiation"))?;
                    (output, hash, negotiated)
                }
            }
        };

        self.verify_host(&negotiated, &output)?;

        let session_id = self.session_id.get_or_init(|| {
            debug!("Session id {}", hex::encode(&output.exchange_hash));
            output.exchange_hash.clone()
        });

        let outbound = self.build_state(hash, &output, session_id, &negotiated, Direction::Outbound)?;
        let inbound = self.build_state(hash, &output, session_id, &negotiated, Direction::Inbound)?;

        {
            let mut w = writer.lock().await;
            w.send(&[MessageType::NewKeys as u8]).await?;
            w.encoder.install(outbound);
        }
        debug!("Sent NEWKEYS; outbound keys active");

        let mut st = self.state.lock().await;
        st.pending_inbound = Some(inbound);
        st.phase = KexPhase::AwaitingNewKeys;
        Ok(())
    }

    async fn got_newkeys(&self) -> SkeinResult<CodecState> {
        let mut st = self.state.lock().await;
        if st.phase != KexPhase::AwaitingNewKeys {
            return Err(out_of_order(MessageType::NewKeys as u8, st.phase));
        }
        let inbound = st
            .pending_inbound
            .take()
            .ok_or_else(|| kex_failed("NEWKEYS without derived keys"))?;
        st.phase = KexPhase::AwaitingKexInit;
        st.client_proposal = None;
        drop(st);

        debug!("Received NEWKEYS; inbound keys active");
        self.kexinit_sent.clear();
        self.ongoing.store(false, Ordering::Release);
        self.done.set(());
        Ok(inbound)
    }

    /// Checks the exchange hash signature, then asks the verifiers in order.
    fn verify_host(&self, negotiated: &NegotiatedAlgorithms, output: &KexOutput) -> SkeinResult<()> {
        let signature = crypto::create(&self.config.host_key, &negotiated.host_key)
            .ok_or_else(|| {
                SkeinError::Negotiation(format!("No factory for {}", negotiated.host_key))
            })?;
        signature
            .verify(&output.host_key, &output.exchange_hash, &output.signature)
            .map_err(|e| kex_failed(format!("Exchange hash signature rejected: {}", e)))?;

        let accepted = self
            .config
            .host_key_verifiers
            .iter()
            .any(|v| v.verify(&self.peer.host, self.peer.port, &output.host_key));
        if !accepted {
            return Err(SkeinError::HostKeyNotVerifiable {
                algorithm: negotiated.host_key.clone(),
                fingerprint: hostkey::fingerprint(&output.host_key),
                host: self.peer.host.clone(),
                port: self.peer.port,
            });
        }
        debug!(
            "Host key {} accepted for {}:{}",
            hostkey::fingerprint(&output.host_key),
            self.peer.host,
            self.peer.port
        );
        Ok(())
    }

    fn build_state(
        &self,
        hash: KexHash,
        output: &KexOutput,
        session_id: &[u8],
        negotiated: &NegotiatedAlgorithms,
        direction: Direction,
    ) -> SkeinResult<CodecState> {
        let (cipher_name, mac_name, compression_name, letters, mode) = match direction {
            Direction::Outbound => (
                &negotiated.cipher_c2s,
                &negotiated.mac_c2s,
                &negotiated.compression_c2s,
                [b'A', b'C', b'E'],
                Mode::Encrypt,
            ),
            Direction::Inbound => (
                &negotiated.cipher_s2c,
                &negotiated.mac_s2c,
                &negotiated.compression_s2c,
                [b'B', b'D', b'F'],
                Mode::Decrypt,
            ),
        };
        let derive = |letter: u8, len: usize| {
            Zeroizing::new(derive_key(
                hash,
                &output.shared_secret,
                &output.exchange_hash,
                session_id,
                letter,
                len,
            ))
        };
        let missing = |what: &str, name: &str| {
            SkeinError::Negotiation(format!("No {} factory for {}", what, name))
        };

        let mut cipher = crypto::create(&self.config.ciphers, cipher_name)
            .ok_or_else(|| missing("cipher", cipher_name))?;
        let iv = derive(letters[0], cipher.iv_size());
        let key = derive(letters[1], cipher.key_size());
        cipher.init(mode, &key, &iv)?;

        let mut mac = crypto::create(&self.config.macs, mac_name)
            .ok_or_else(|| missing("MAC", mac_name))?;
        let mac_key = derive(letters[2], mac.key_size());
        mac.init(&mac_key)?;

        let compression: Option<Box<dyn Compression>> = if compression_name == "none" {
            None
        } else {
            let mut c = crypto::create(&self.config.compression, compression_name)
                .ok_or_else(|| missing("compression", compression_name))?;
            c.init(mode);
            Some(c)
        };

        Ok(CodecState::new(cipher, Some(mac), compression))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Outbound,
    Inbound,
}
