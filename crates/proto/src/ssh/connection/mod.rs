//! The `ssh-connection` service (RFC 4254).
//!
//! Multiplexes [`Channel`]s and global requests over one transport. All
//! inbound messages arrive through [`ConnectionService::handle`], called from
//! the transport's reader; anything the reader has to answer is queued rather
//! than written directly.

pub mod channel;
pub mod window;

pub use self::channel::{Channel, ChannelState, ExitSignal, PtyRequest};
pub use self::window::{LocalWindow, RemoteWindow, MAX_WINDOW};

use crate::ssh::buffer::Buffer;
use crate::ssh::config::Config;
use crate::ssh::message::{self, MessageType};
use crate::ssh::service::PacketWriter;
use once_cell::sync::OnceCell;
use skein_platform::{Event, SkeinError, SkeinResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Service name requested after authentication.
pub const SERVICE_NAME: &str = "ssh-connection";

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// A channel the peer wants to open.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Requested channel type.
    pub channel_type: String,
    /// The peer's channel number.
    pub sender: u32,
    /// The peer's initial window.
    pub window: u32,
    /// The peer's maximum packet size.
    pub max_packet: u32,
    /// Type-specific data following the common fields.
    pub data: Vec<u8>,
}

/// Accepts channels opened by the peer, for one channel type.
pub trait ChannelOpener: Send + Sync {
    /// Decides whether to accept. Called on the transport's reader; must not
    /// block.
    fn accept(&self, request: &OpenRequest) -> Result<(), (ChannelOpenFailureReason, String)>;

    /// Receives the channel once the confirmation has been sent.
    fn opened(&self, channel: Arc<Channel>);
}

/// Outcome of a global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReply {
    /// SSH_MSG_REQUEST_SUCCESS with its request-specific data.
    Success(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE.
    Failure,
    /// Sent without `want_reply`.
    NotRequested,
}

/// Channel multiplexer.
pub struct ConnectionService {
    writer: Arc<dyn PacketWriter>,
    config: Arc<Config>,
    next_id: AtomicU32,
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
    openers: Mutex<HashMap<String, Arc<dyn ChannelOpener>>>,
    global_send: Mutex<()>,
    global_replies: Mutex<VecDeque<Arc<Event<GlobalReply>>>>,
    error: OnceCell<SkeinError>,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("next_id", &self.next_id)
            .field("error", &self.error.get())
            .finish()
    }
}

impl ConnectionService {
    /// Creates the service on top of `writer`.
    pub fn new(writer: Arc<dyn PacketWriter>, config: Arc<Config>) -> Self {
        Self {
            writer,
            config,
            next_id: AtomicU32::new(0),
            channels: Mutex::new(HashMap::new()),
            openers: Mutex::new(HashMap::new()),
            global_send: Mutex::new(()),
            global_replies: Mutex::new(VecDeque::new()),
            error: OnceCell::new(),
        }
    }

    fn ensure_open(&self) -> SkeinResult<()> {
        if let Some(err) = self.error.get() {
            return Err(err.clone());
        }
        if !self.writer.is_open() {
            return Err(SkeinError::Protocol("Transport is closed".to_string()));
        }
        Ok(())
    }

    /// Number of channels in the registry.
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Looks up a channel by local id.
    pub async fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.lock().await.get(&id).cloned()
    }

    /// Accepts peer-initiated channels of `channel_type` with `opener`.
    pub async fn register_opener(&self, channel_type: &str, opener: Arc<dyn ChannelOpener>) {
        self.openers
            .lock()
            .await
            .insert(channel_type.to_string(), opener);
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> SkeinResult<Arc<Channel>> {
        self.open_channel("session", &[]).await
    }

    /// Opens a channel of `channel_type`; `extra` is appended to the open
    /// message. Waits for confirmation up to the channel timeout.
    pub async fn open_channel(&self, channel_type: &str, extra: &[u8]) -> SkeinResult<Arc<Channel>> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let channel = Arc::new(Channel::new(
            id,
            channel_type,
            self.writer.clone(),
            &self.config,
        ));
        self.channels.lock().await.insert(id, channel.clone());

        let mut msg = Buffer::new();
        msg.put_u8(MessageType::ChannelOpen as u8);
        msg.put_str(channel_type);
        msg.put_u32(id);
        msg.put_u32(channel.local_window().initial_size());
        msg.put_u32(channel.local_window().max_packet_size());
        msg.put_raw(extra);
        debug!("Opening {} channel {}", channel_type, id);

        let result = match self.writer.write_packet(msg).await {
            Ok(_) => channel.wait_open().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(channel),
            Err(e) => {
                self.channels.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    /// Sends a global request.
    ///
    /// With `want_reply`, waits for the reply; replies are matched to
    /// requests in order.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> SkeinResult<GlobalReply> {
        let guard = self.global_send.lock().await;
        self.ensure_open()?;

        let reply = want_reply.then(|| Arc::new(Event::new(format!("global {} reply", name))));
        if let Some(reply) = &reply {
            self.global_replies.lock().await.push_back(reply.clone());
        }

        let mut msg = Buffer::new();
        msg.put_u8(MessageType::GlobalRequest as u8);
        msg.put_str(name);
        msg.put_bool(want_reply);
        msg.put_raw(data);
        debug!("Global request {} (want_reply={})", name, want_reply);
        self.writer.write_packet(msg).await?;
        drop(guard);

        match reply {
            Some(reply) => reply.wait(self.config.channel_timeout).await,
            None => Ok(GlobalReply::NotRequested),
        }
    }

    /// Handles one message with id 80-100. An error is fatal to the transport.
    pub async fn handle(&self, id: u8, mut payload: Buffer) -> SkeinResult<()> {
        match MessageType::from_u8(id) {
            Some(MessageType::GlobalRequest) => {
                let name = payload.read_utf8()?;
                let want_reply = payload.read_bool()?;
                debug!("Declining global request {}", name);
                if want_reply {
                    let mut msg = Buffer::new();
                    msg.put_u8(MessageType::RequestFailure as u8);
                    self.writer.enqueue_packet(msg)?;
                }
                Ok(())
            }
            Some(MessageType::RequestSuccess) => {
                let data = payload.as_slice().to_vec();
                self.got_global_reply(GlobalReply::Success(data)).await
            }
            Some(MessageType::RequestFailure) => self.got_global_reply(GlobalReply::Failure).await,
            Some(MessageType::ChannelOpen) => self.got_open(payload).await,
            Some(MessageType::ChannelOpenConfirmation) => {
                let recipient = payload.read_u32()?;
                let sender = payload.read_u32()?;
                let window = payload.read_u32()?;
                let max_packet = payload.read_u32()?;
                let channel = self.lookup(recipient).await?;
                channel.confirm(sender, window, max_packet).await;
                Ok(())
            }
            Some(MessageType::ChannelOpenFailure) => {
                let recipient = payload.read_u32()?;
                let code = payload.read_u32()?;
                let description = payload.read_utf8()?;
                let channel = self.lookup(recipient).await?;
                self.channels.lock().await.remove(&recipient);
                let reason = ChannelOpenFailureReason::from_u32(code)
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| format!("reason {}", code));
                debug!("Channel {} open failed: {} ({})", recipient, description, reason);
                channel
                    .reject(SkeinError::channel(
                        recipient,
                        format!("open failed: {} ({})", description, reason),
                    ))
                    .await;
                Ok(())
            }
            Some(
                MessageType::ChannelWindowAdjust
                | MessageType::ChannelData
                | MessageType::ChannelExtendedData
                | MessageType::ChannelEof
                | MessageType::ChannelClose
                | MessageType::ChannelRequest
                | MessageType::ChannelSuccess
                | MessageType::ChannelFailure,
            ) => {
                let recipient = payload.read_u32()?;
                let channel = self.lookup(recipient).await?;
                if let Err(e) = channel.handle(id, payload).await {
                    channel.abort(e).await;
                }
                if channel.peer_closed().await {
                    self.channels.lock().await.remove(&recipient);
                }
                Ok(())
            }
            _ => Err(SkeinError::Protocol(format!(
                "Unexpected {} for {}",
                message::describe(id),
                SERVICE_NAME
            ))),
        }
    }

    async fn lookup(&self, recipient: u32) -> SkeinResult<Arc<Channel>> {
        self.channel(recipient)
            .await
            .ok_or_else(|| SkeinError::Protocol(format!("Message for unknown channel {}", recipient)))
    }

    async fn got_global_reply(&self, reply: GlobalReply) -> SkeinResult<()> {
        let pending = self.global_replies.lock().await.pop_front();
        match pending {
            Some(event) => {
                event.set(reply);
                Ok(())
            }
            None => Err(SkeinError::Protocol(
                "Global request reply with no request pending".to_string(),
            )),
        }
    }

    async fn got_open(&self, mut payload: Buffer) -> SkeinResult<()> {
        let channel_type = payload.read_utf8()?;
        let request = OpenRequest {
            channel_type,
            sender: payload.read_u32()?,
            window: payload.read_u32()?,
            max_packet: payload.read_u32()?,
            data: payload.as_slice().to_vec(),
        };
        debug!(
            "Peer opening {} channel (sender {})",
            request.channel_type, request.sender
        );

        let opener = self.openers.lock().await.get(&request.channel_type).cloned();
        let decision = match opener {
            Some(opener) => opener.accept(&request).map(|()| opener),
            None => Err((
                ChannelOpenFailureReason::UnknownChannelType,
                format!("{} channels are not accepted", request.channel_type),
            )),
        };
        let opener = match decision {
            Ok(opener) => opener,
            Err((reason, description)) => {
                debug!("Refusing {} channel: {}", request.channel_type, description);
                let mut msg = Buffer::new();
                msg.put_u8(MessageType::ChannelOpenFailure as u8);
                msg.put_u32(request.sender);
                msg.put_u32(reason as u32);
                msg.put_str(&description);
                msg.put_str("");
                return self.writer.enqueue_packet(msg);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let channel = Arc::new(Channel::new(
            id,
            &request.channel_type,
            self.writer.clone(),
            &self.config,
        ));
        channel
            .confirm(request.sender, request.window, request.max_packet)
            .await;
        self.channels.lock().await.insert(id, channel.clone());

        let mut msg = Buffer::new();
        msg.put_u8(MessageType::ChannelOpenConfirmation as u8);
        msg.put_u32(request.sender);
        msg.put_u32(id);
        msg.put_u32(channel.local_window().initial_size());
        msg.put_u32(channel.local_window().max_packet_size());

        // Queued behind earlier replies; the opener only sees the channel
        // once the confirmation is on the wire.
        self.writer.enqueue_packet(msg)?;
        let writer = self.writer.clone();
        tokio::spawn(async move {
            match writer.flush_queue().await {
                Ok(()) => opener.opened(channel),
                Err(e) => channel.fail(e).await,
            }
        });
        Ok(())
    }

    /// Fails every channel and pending global request with `err`.
    pub async fn notify_error(&self, err: &SkeinError) {
        if self.error.set(err.clone()).is_err() {
            return;
        }
        let channels: Vec<_> = self.channels.lock().await.drain().map(|(_, c)| c).collect();
        if !channels.is_empty() {
            warn!("Failing {} open channel(s): {}", channels.len(), err);
        }
        for channel in channels {
            channel.fail(err.clone()).await;
        }
        for pending in self.global_replies.lock().await.drain(..) {
            pending.deliver_error(err.clone());
        }
    }
}
