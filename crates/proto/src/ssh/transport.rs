//! SSH transport layer (RFC 4253).
//!
//! A [`Transport`] owns one connection to a server:
//!
//! 1. **Identification** - exchange `SSH-2.0-...` lines ([`version`](crate::ssh::version))
//! 2. **Key exchange** - first exchange runs inside [`Transport::start`]
//! 3. **Running** - a background reader decodes packets and routes them by
//!    message id; writers share one lock around the encoder and socket
//!
//! # Routing
//!
//! | Message id        | Owner                                  |
//! |-------------------|----------------------------------------|
//! | 20, 21, 30-49     | key exchange state machine             |
//! | 50 and above      | the active service                     |
//! | anything else     | the transport, or UNIMPLEMENTED        |
//!
//! # Rekeying
//!
//! A key exchange starts when [`Transport::rekey`] is called, when the server
//! sends KEXINIT, or when the send sequence number gets within
//! `rekey_sequence_margin` of wrapping. While it runs, outbound messages with
//! an id of 50 or above wait for it to finish.
//!
//! # Teardown
//!
//! Any fatal error (I/O, MAC failure, protocol violation, peer DISCONNECT)
//! closes the transport exactly once: the active service and every waiter are
//! handed the error, a DISCONNECT is sent if the peer did not send one, and the
//! background tasks stop.
//!
//! # Example
//!
//! ```rust,no_run
//! use skein_proto::ssh::config::Config;
//! use skein_proto::ssh::hostkey::PromiscuousVerifier;
//! use skein_proto::ssh::transport::Transport;
//! use std::sync::Arc;
//!
//! # async fn example() -> skein_platform::SkeinResult<()> {
//! let config = Arc::new(Config::default().with_verifier(PromiscuousVerifier));
//! let transport = Transport::connect("example.com", 22, config).await?;
//! println!("connected to {}", transport.server_version());
//! transport.request_service("ssh-userauth").await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::buffer::Buffer;
use crate::ssh::codec::{CodecState, Decoder, Encoder, Inbound};
use crate::ssh::config::Config;
use crate::ssh::connection::ConnectionService;
use crate::ssh::keepalive::{ignore_message, KeepaliveTask};
use crate::ssh::kex::{KexMachine, KexPeer};
use crate::ssh::message::{self, MessageType, Route};
use crate::ssh::proposal::NegotiatedAlgorithms;
use crate::ssh::service::{ActiveService, PacketWriter};
use crate::ssh::version::{read_identification, send_identification, Version};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use skein_platform::{DisconnectReason, Event, SkeinError, SkeinResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long teardown may spend sending DISCONNECT.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The socket's write half and the encoder, always used together under one lock.
pub(crate) struct Writer {
    stream: BoxedWrite,
    pub(crate) encoder: Encoder,
}

impl Writer {
    /// Encodes and writes one payload; returns its sequence number.
    pub(crate) async fn send(&mut self, payload: &[u8]) -> SkeinResult<u32> {
        let (frame, seq) = self.encoder.encode(payload)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        trace!(
            "Sent {} (seq {}, {} bytes)",
            message::describe(payload.first().copied().unwrap_or(0)),
            seq,
            frame.len()
        );
        Ok(seq)
    }
}

fn disconnect_message(reason: DisconnectReason, description: &str) -> Buffer {
    let mut msg = Buffer::new();
    msg.put_u8(MessageType::Disconnect as u8);
    msg.put_u32(reason.code());
    msg.put_str(description);
    msg.put_str("");
    msg
}

/// An entry in the deferred outbound queue.
enum Queued {
    Packet(Buffer),
    /// Signalled once every earlier entry has been written.
    Marker(oneshot::Sender<()>),
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    keepalive: KeepaliveTask,
}

struct Inner {
    config: Arc<Config>,
    host: String,
    port: u16,
    client_version: Version,
    server_version: Version,
    writer: Mutex<Writer>,
    kex: KexMachine,
    authenticated: Arc<AtomicBool>,
    service: Mutex<ActiveService>,
    service_accept: Event<()>,
    terminal: OnceCell<SkeinError>,
    closed: Event<SkeinError>,
    peer_disconnected: AtomicBool,
    wrap_rekey_started: AtomicBool,
    outbound: mpsc::UnboundedSender<Queued>,
    tasks: Mutex<Tasks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(reader) = tasks.reader.take() {
            reader.abort();
        }
        if let Some(pump) = tasks.pump.take() {
            pump.abort();
        }
        tasks.keepalive.stop();
    }
}

impl Inner {
    fn ensure_open(&self) -> SkeinResult<()> {
        match self.terminal.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn write_packet(&self, payload: Buffer) -> SkeinResult<u32> {
        let id = payload
            .as_slice()
            .first()
            .copied()
            .ok_or_else(|| SkeinError::Protocol("Refusing to send an empty payload".to_string()))?;

        let seq = loop {
            self.ensure_open()?;
            let mut writer = self.writer.lock().await;
            if !message::allowed_during_kex(id) && self.kex.is_ongoing() {
                drop(writer);
                trace!("Holding {} until key exchange completes", message::describe(id));
                self.kex.wait_done().await?;
                continue;
            }
            let result = writer.send(payload.as_slice()).await;
            drop(writer);
            match result {
                Ok(seq) => break seq,
                Err(e) => {
                    self.close(e.clone()).await;
                    return Err(e);
                }
            }
        };

        self.check_sequence_wrap(seq).await?;
        Ok(seq)
    }

    /// Starts one rekey per wrap cycle once `seq` is past the threshold.
    ///
    /// Kex packets bypass this path, so the check is a range rather than an
    /// exact match on the threshold.
    async fn check_sequence_wrap(&self, seq: u32) -> SkeinResult<()> {
        if seq < rekey_threshold(&self.config) {
            self.wrap_rekey_started.store(false, Ordering::Release);
            return Ok(());
        }
        if self.wrap_rekey_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Send sequence number {} nearing wrap; rekeying", seq);
        if let Err(e) = self.kex.start(&self.writer).await {
            self.close(e.clone()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_unimplemented(&self, seq: u32) -> SkeinResult<()> {
        let mut msg = Buffer::new();
        msg.put_u8(MessageType::Unimplemented as u8);
        msg.put_u32(seq);
        self.write_packet(msg).await.map(|_| ())
    }

    async fn dispatch(&self, packet: Inbound) -> SkeinResult<Option<CodecState>> {
        let Inbound { seq, mut payload } = packet;
        let id = payload.read_u8()?;
        trace!("Received {} (seq {})", message::describe(id), seq);

        match Route::of(id) {
            Route::KeyExchange => self.kex.handle(&self.writer, id, payload).await,
            Route::Service => {
                let service = self.service.lock().await.clone();
                if !service.handle(id, payload).await? {
                    debug!("No active service for {}", message::describe(id));
                    self.send_unimplemented(seq).await?;
                }
                Ok(None)
            }
            Route::Transport => {
                self.handle_transport(id, seq, payload).await?;
                Ok(None)
            }
        }
    }

    async fn handle_transport(&self, id: u8, seq: u32, mut payload: Buffer) -> SkeinResult<()> {
        match MessageType::from_u8(id) {
            Some(MessageType::Disconnect) => {
                let reason = DisconnectReason::from_u32(payload.read_u32()?);
                let message = String::from_utf8_lossy(&payload.read_string()?).into_owned();
                self.peer_disconnected.store(true, Ordering::Release);
                Err(SkeinError::Disconnected { reason, message })
            }
            Some(MessageType::Ignore) => Ok(()),
            Some(MessageType::Unimplemented) => {
                warn!("Peer reported packet {} as unimplemented", payload.read_u32()?);
                Ok(())
            }
            Some(MessageType::Debug) => {
                let always_display = payload.read_bool()?;
                let text = String::from_utf8_lossy(&payload.read_string()?).into_owned();
                if always_display {
                    info!("Peer debug message: {}", text);
                } else {
                    debug!("Peer debug message: {}", text);
                }
                Ok(())
            }
            Some(MessageType::ServiceAccept) => {
                let name = payload.read_utf8()?;
                debug!("Service {} accepted", name);
                self.service_accept.set(());
                Ok(())
            }
            _ => {
                debug!("Unhandled {}; replying UNIMPLEMENTED", message::describe(id));
                self.send_unimplemented(seq).await
            }
        }
    }

    /// Terminates the transport. Only the first call has any effect.
    async fn close(&self, err: SkeinError) {
        if self.terminal.set(err.clone()).is_err() {
            return;
        }
        let peer_disconnected = self.peer_disconnected.load(Ordering::Acquire);
        if peer_disconnected {
            info!("Disconnected by {}:{}: {}", self.host, self.port, err);
        } else {
            warn!("Closing transport to {}:{}: {}", self.host, self.port, err);
        }

        let service = std::mem::take(&mut *self.service.lock().await);
        service.notify_error(&err).await;
        self.kex.deliver_error(&err);
        self.service_accept.deliver_error(err.clone());

        let farewell = async {
            let mut writer = self.writer.lock().await;
            if !peer_disconnected {
                let description = match &err {
                    SkeinError::Disconnected { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                let msg = disconnect_message(err.disconnect_reason(), &description);
                if let Err(e) = writer.send(msg.as_slice()).await {
                    trace!("DISCONNECT not sent: {}", e);
                }
            }
            let _ = writer.stream.shutdown().await;
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, farewell).await.is_err() {
            debug!("Timed out sending DISCONNECT");
        }

        let mut tasks = self.tasks.lock().await;
        tasks.keepalive.stop();
        self.closed.set(err);
        if let Some(pump) = tasks.pump.take() {
            pump.abort();
        }
        // Last: close may be running on the reader itself.
        if let Some(reader) = tasks.reader.take() {
            reader.abort();
        }
    }

    fn mark_authenticated(&self) {
        if !self.authenticated.swap(true, Ordering::AcqRel) {
            debug!("User authenticated; delayed compression enabled");
        }
    }

    async fn set_keepalive(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let mut tasks = self.tasks.lock().await;
        tasks.keepalive.start(interval, move || {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or_else(dropped)?;
                inner.write_packet(ignore_message(0)).await.map(|_| ())
            }
        });
    }
}

fn rekey_threshold(config: &Config) -> u32 {
    u32::MAX - config.rekey_sequence_margin
}

fn dropped() -> SkeinError {
    SkeinError::transport(DisconnectReason::ConnectionLost, "transport dropped")
}

async fn read_packets(
    weak: &Weak<Inner>,
    reader: &mut BoxedRead,
    decoder: &mut Decoder,
) -> SkeinResult<()> {
    let mut chunk = Vec::new();
    loop {
        while let Some(packet) = decoder.next_packet()? {
            let inner = weak.upgrade().ok_or_else(dropped)?;
            if let Some(state) = inner.dispatch(packet).await? {
                decoder.install(state);
            }
        }
        chunk.resize(decoder.bytes_needed(), 0);
        reader.read_exact(&mut chunk).await?;
        decoder.received(&chunk);
    }
}

async fn reader_task(weak: Weak<Inner>, mut reader: BoxedRead, mut decoder: Decoder) {
    debug!("Reader started");
    let result = read_packets(&weak, &mut reader, &mut decoder).await;
    if let (Err(err), Some(inner)) = (result, weak.upgrade()) {
        inner.close(err).await;
    }
    debug!("Reader stopped");
}

async fn pump_task(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Queued>) {
    while let Some(entry) = rx.recv().await {
        match entry {
            Queued::Packet(payload) => {
                let Some(inner) = weak.upgrade() else { break };
                if inner.write_packet(payload).await.is_err() {
                    break;
                }
            }
            Queued::Marker(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// [`PacketWriter`] handed to services. Holds the transport weakly.
struct TransportWriter(Weak<Inner>);

#[async_trait]
impl PacketWriter for TransportWriter {
    async fn write_packet(&self, payload: Buffer) -> SkeinResult<u32> {
        let inner = self.0.upgrade().ok_or_else(dropped)?;
        inner.write_packet(payload).await
    }

    fn enqueue_packet(&self, payload: Buffer) -> SkeinResult<()> {
        let inner = self.0.upgrade().ok_or_else(dropped)?;
        inner.ensure_open()?;
        inner
            .outbound
            .send(Queued::Packet(payload))
            .map_err(|_| dropped())
    }

    async fn flush_queue(&self) -> SkeinResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let inner = self.0.upgrade().ok_or_else(dropped)?;
            inner.ensure_open()?;
            inner.outbound.send(Queued::Marker(tx)).map_err(|_| dropped())?;
        }
        if rx.await.is_ok() {
            return Ok(());
        }
        // The pump stopped; report why.
        match self.0.upgrade() {
            Some(inner) => inner.ensure_open().and(Err(dropped())),
            None => Err(dropped()),
        }
    }

    fn authenticated(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.mark_authenticated();
        }
    }

    fn is_open(&self) -> bool {
        self.0
            .upgrade()
            .map(|inner| inner.terminal.get().is_none())
            .unwrap_or(false)
    }
}

/// A client SSH transport.
///
/// Cheap to clone; all clones share one connection. Dropping the last clone
/// stops the background tasks without sending DISCONNECT; call
/// [`Transport::disconnect`] for an orderly shutdown.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("server_version", &self.inner.server_version.as_str())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Transport {
    /// Opens a TCP connection and runs [`Transport::start`] over it.
    pub async fn connect(host: &str, port: u16, config: Arc<Config>) -> SkeinResult<Self> {
        config.validate()?;
        debug!("Connecting to {}:{}", host, port);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                SkeinError::Timeout(format!("connecting to {}:{} ({:?})", host, port, config.connect_timeout))
            })??;
        stream.set_nodelay(true)?;
        Self::start(stream, host, port, config).await
    }

    /// Runs the identification exchange and the first key exchange over
    /// `stream`, then returns a transport ready for service requests.
    ///
    /// `host` and `port` are only used for host key verification and logs.
    pub async fn start<S>(stream: S, host: &str, port: u16, config: Arc<Config>) -> SkeinResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxedRead = Box::new(read_half);
        let mut stream: BoxedWrite = Box::new(write_half);

        let client_version = Version::new(&config.version);
        send_identification(&mut stream, &client_version).await?;
        let server_version =
            match tokio::time::timeout(config.kex_timeout, read_identification(&mut reader)).await {
                Ok(Ok(version)) => version,
                Ok(Err(err)) => {
                    reject_identification(&mut stream, &err).await;
                    return Err(err);
                }
                Err(_) => {
                    return Err(SkeinError::Timeout(
                        "waiting for server identification".to_string(),
                    ))
                }
            };

        let authenticated = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let kex = KexMachine::new(
            config.clone(),
            KexPeer {
                host: host.to_string(),
                port,
                client_version: client_version.as_str().to_string(),
                server_version: server_version.as_str().to_string(),
            },
        );

        let inner = Arc::new(Inner {
            config: config.clone(),
            host: host.to_string(),
            port,
            client_version,
            server_version,
            writer: Mutex::new(Writer {
                stream,
                encoder: Encoder::new(authenticated.clone()),
            }),
            kex,
            authenticated: authenticated.clone(),
            service: Mutex::new(ActiveService::None),
            service_accept: Event::new("service accept"),
            terminal: OnceCell::new(),
            closed: Event::new("transport close"),
            peer_disconnected: AtomicBool::new(false),
            wrap_rekey_started: AtomicBool::new(false),
            outbound,
            tasks: Mutex::new(Tasks::default()),
        });

        {
            let weak = Arc::downgrade(&inner);
            let mut tasks = inner.tasks.lock().await;
            tasks.reader = Some(tokio::spawn(reader_task(
                weak.clone(),
                reader,
                Decoder::new(authenticated),
            )));
            tasks.pump = Some(tokio::spawn(pump_task(weak, outbound_rx)));
        }
        inner.set_keepalive(config.keepalive_interval).await;

        let transport = Self { inner };
        transport.rekey().await?;
        info!(
            "Transport to {}:{} established",
            transport.inner.host, transport.inner.port
        );
        Ok(transport)
    }

    /// Runs a key exchange (or joins the one in progress) and waits for it.
    pub async fn rekey(&self) -> SkeinResult<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if let Err(e) = inner.kex.start(&inner.writer).await {
            inner.close(e.clone()).await;
            return Err(e);
        }
        match inner.kex.wait_done().await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.close(e.clone()).await;
                Err(e)
            }
        }
    }

    /// Sends SSH_MSG_SERVICE_REQUEST and waits for SSH_MSG_SERVICE_ACCEPT.
    pub async fn request_service(&self, name: &str) -> SkeinResult<()> {
        let inner = &self.inner;
        // Cleared before the open check so a concurrent close is never lost.
        inner.service_accept.clear();
        inner.ensure_open()?;

        let mut msg = Buffer::new();
        msg.put_u8(MessageType::ServiceRequest as u8);
        msg.put_str(name);
        debug!("Requesting service {}", name);
        inner.write_packet(msg).await?;

        inner
            .service_accept
            .wait(inner.config.service_timeout)
            .await
    }

    /// Makes `service` the owner of message ids 50 and above.
    pub async fn set_service(&self, service: ActiveService) {
        debug!("Active service: {:?}", service);
        *self.inner.service.lock().await = service;
    }

    /// Installs a [`ConnectionService`] as the active service and returns it.
    ///
    /// Call this once user authentication (which itself requests
    /// `ssh-connection`) has succeeded.
    pub async fn start_connection(&self) -> Arc<ConnectionService> {
        let connection = Arc::new(ConnectionService::new(
            self.packet_writer(),
            self.inner.config.clone(),
        ));
        self.set_service(ActiveService::Connection(connection.clone()))
            .await;
        connection
    }

    /// Records successful user authentication, activating delayed compression.
    ///
    /// A service handling USERAUTH_SUCCESS on the reader should call
    /// [`PacketWriter::authenticated`] instead, so the very next inbound
    /// packet is already decompressed.
    pub fn set_authenticated(&self) {
        self.inner.mark_authenticated();
    }

    /// Whether [`Transport::set_authenticated`] has been called.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// Sends a payload; see [`PacketWriter::write_packet`].
    pub async fn write_packet(&self, payload: Buffer) -> SkeinResult<u32> {
        self.inner.write_packet(payload).await
    }

    /// Sender handed to services.
    pub fn packet_writer(&self) -> Arc<dyn PacketWriter> {
        Arc::new(TransportWriter(Arc::downgrade(&self.inner)))
    }

    /// The session identifier (H of the first key exchange).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.kex.session_id().map(<[u8]>::to_vec)
    }

    /// Algorithms agreed in the most recent key exchange.
    pub async fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        self.inner.kex.negotiated().await
    }

    /// Our identification.
    pub fn client_version(&self) -> &Version {
        &self.inner.client_version
    }

    /// The server's identification.
    pub fn server_version(&self) -> &Version {
        &self.inner.server_version
    }

    /// Remote host name.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Configuration in use.
    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Changes the keep-alive interval; zero disables keep-alives.
    pub async fn set_keepalive_interval(&self, interval: Duration) {
        self.inner.set_keepalive(interval).await;
    }

    /// Whether the transport is still usable.
    pub fn is_open(&self) -> bool {
        self.inner.terminal.get().is_none()
    }

    /// Sends DISCONNECT with `reason` and tears the transport down.
    pub async fn disconnect(&self, reason: DisconnectReason, message: &str) {
        self.inner
            .close(SkeinError::Disconnected {
                reason,
                message: message.to_string(),
            })
            .await;
    }

    /// Waits until the transport is closed and returns the error that closed it.
    pub async fn wait_closed(&self) -> SkeinError {
        match self.inner.closed.resolved().await {
            Ok(err) | Err(err) => err,
        }
    }
}

/// Best-effort plaintext DISCONNECT after a failed identification exchange.
async fn reject_identification(stream: &mut BoxedWrite, err: &SkeinError) {
    let mut encoder = Encoder::new(Arc::new(AtomicBool::new(false)));
    let msg = disconnect_message(err.disconnect_reason(), &err.to_string());
    if let Ok((frame, _)) = encoder.encode(msg.as_slice()) {
        let _ = stream.write_all(&frame).await;
        let _ = stream.shutdown().await;
    }
}
