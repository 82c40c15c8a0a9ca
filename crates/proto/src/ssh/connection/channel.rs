//! A single multiplexed channel (RFC 4254 Sections 5-6).
//!
//! ```text
//! Opening -> Open -> (EOF sent | EOF received)* -> Closing -> Closed
//! ```
//!
//! A [`Channel`] is shared between the application (reads, writes, requests)
//! and the transport's reader, which feeds it inbound messages through the
//! [`ConnectionService`](super::ConnectionService). The reader never waits on
//! anything the application controls: replies it has to send are queued with
//! [`PacketWriter::enqueue_packet`].

use super::window::{LocalWindow, RemoteWindow};
use crate::ssh::buffer::Buffer;
use crate::ssh::config::Config;
use crate::ssh::message::{self, MessageType};
use crate::ssh::service::PacketWriter;
use bytes::{Buf, BytesMut};
use once_cell::sync::OnceCell;
use skein_platform::{Event, SkeinError, SkeinResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// SSH_EXTENDED_DATA_STDERR
const EXTENDED_DATA_STDERR: u32 = 1;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open requested, no answer yet.
    Opening,
    /// Open; data may flow (subject to EOF).
    Open,
    /// CLOSE sent, waiting for the peer's.
    Closing,
    /// Both sides closed.
    Closed,
}

/// Terminal settings for a `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// TERM value, e.g. "xterm".
    pub term: String,
    /// Width in characters.
    pub cols: u32,
    /// Height in rows.
    pub rows: u32,
    /// Width in pixels.
    pub width_px: u32,
    /// Height in pixels.
    pub height_px: u32,
    /// Encoded terminal modes (RFC 4254 Section 8).
    pub modes: Vec<u8>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "vt100".to_string(),
            cols: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
            // TTY_OP_END
            modes: vec![0],
        }
    }
}

/// Reported by the peer when the remote process died from a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix.
    pub signal: String,
    /// Whether a core was dumped.
    pub core_dumped: bool,
    /// Error message.
    pub message: String,
    /// Language tag.
    pub language: String,
}

#[derive(Debug)]
struct ChannelInner {
    state: ChannelState,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
    error: Option<SkeinError>,
    data: BytesMut,
    stderr: BytesMut,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
    /// Extended data of a type nobody reads; consumed and dropped.
    Discard,
}

/// One logical channel over the transport.
pub struct Channel {
    id: u32,
    channel_type: String,
    recipient: AtomicU32,
    writer: Arc<dyn PacketWriter>,
    timeout: Duration,
    remote_max_packet_ceiling: u32,
    local: LocalWindow,
    remote: RemoteWindow,
    inner: Mutex<ChannelInner>,
    changed: watch::Sender<u64>,
    outbound: Mutex<BytesMut>,
    request_send: Mutex<()>,
    pending_requests: Mutex<VecDeque<Arc<Event<bool>>>>,
    opened: Event<()>,
    closed: Event<()>,
    expand_on_read: AtomicBool,
    exit_status: OnceCell<u32>,
    exit_signal: OnceCell<ExitSignal>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("type", &self.channel_type)
            .field("recipient", &self.recipient())
            .field("local_window", &self.local.size())
            .field("remote_window", &self.remote.size())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        channel_type: &str,
        writer: Arc<dyn PacketWriter>,
        config: &Config,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            id,
            channel_type: channel_type.to_string(),
            recipient: AtomicU32::new(0),
            writer,
            timeout: config.channel_timeout,
            remote_max_packet_ceiling: config.remote_max_packet_ceiling,
            local: LocalWindow::new(config.local_window_size, config.local_max_packet_size),
            remote: RemoteWindow::default(),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Opening,
                eof_sent: false,
                eof_received: false,
                close_sent: false,
                close_received: false,
                error: None,
                data: BytesMut::new(),
                stderr: BytesMut::new(),
            }),
            changed,
            outbound: Mutex::new(BytesMut::new()),
            request_send: Mutex::new(()),
            pending_requests: Mutex::new(VecDeque::new()),
            opened: Event::new(format!("channel {} open", id)),
            closed: Event::new(format!("channel {} close", id)),
            expand_on_read: AtomicBool::new(false),
            exit_status: OnceCell::new(),
            exit_signal: OnceCell::new(),
        }
    }

    /// Local channel number.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The peer's channel number.
    pub fn recipient(&self) -> u32 {
        self.recipient.load(Ordering::Acquire)
    }

    /// Channel type, e.g. "session".
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Receive window.
    pub fn local_window(&self) -> &LocalWindow {
        &self.local
    }

    /// Send window.
    pub fn remote_window(&self) -> &RemoteWindow {
        &self.remote
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// Whether the channel is open and has not failed.
    pub async fn is_open(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state == ChannelState::Open && inner.error.is_none()
    }

    /// Whether the channel has been closed in both directions.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == ChannelState::Closed
    }

    /// Whether the peer has sent CLOSE; its id may then be reused.
    pub(crate) async fn peer_closed(&self) -> bool {
        self.inner.lock().await.close_received
    }

    /// Whether the peer has sent EOF.
    pub async fn is_eof(&self) -> bool {
        self.inner.lock().await.eof_received
    }

    /// Replenish the receive window only as the application reads, instead of
    /// as soon as data arrives. Bounds buffered data to one window.
    pub fn set_expand_on_read(&self, enabled: bool) {
        self.expand_on_read.store(enabled, Ordering::Release);
    }

    /// Exit status reported by the remote command, if any.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status.get().copied()
    }

    /// Exit signal reported by the remote command, if any.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.exit_signal.get().cloned()
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn channel_error(&self, msg: impl Into<String>) -> SkeinError {
        SkeinError::channel(self.id, msg)
    }

    fn header(&self, id: MessageType) -> Buffer {
        let mut msg = Buffer::new();
        msg.put_u8(id as u8);
        msg.put_u32(self.recipient());
        msg
    }

    // ---- Reader side -------------------------------------------------

    /// Peer accepted our open.
    pub(crate) async fn confirm(&self, recipient: u32, window: u32, max_packet: u32) {
        self.recipient.store(recipient, Ordering::Release);
        let max_packet = max_packet.min(self.remote_max_packet_ceiling);
        self.remote.init(window, max_packet);
        self.inner.lock().await.state = ChannelState::Open;
        debug!(
            "Channel {} open (recipient {}, window {}, max packet {})",
            self.id, recipient, window, max_packet
        );
        self.opened.set(());
    }

    /// Peer refused our open.
    pub(crate) async fn reject(&self, err: SkeinError) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = ChannelState::Closed;
            inner.error = Some(err.clone());
        }
        self.opened.deliver_error(err.clone());
        self.closed.deliver_error(err);
    }

    /// Waits for the peer's answer to our open.
    pub(crate) async fn wait_open(&self) -> SkeinResult<()> {
        self.opened.wait(self.timeout).await
    }

    /// Handles messages 93-100 addressed to this channel.
    ///
    /// Errors are channel-level; the caller fails this channel only.
    pub(crate) async fn handle(&self, id: u8, mut payload: Buffer) -> SkeinResult<()> {
        match MessageType::from_u8(id) {
            Some(MessageType::ChannelWindowAdjust) => {
                let add = payload.read_u32()?;
                let size = self
                    .remote
                    .expand(add)
                    .map_err(|e| self.channel_error(e.to_string()))?;
                trace!("Channel {} remote window +{} = {}", self.id, add, size);
                Ok(())
            }
            Some(MessageType::ChannelData) => {
                let data = payload.read_string()?;
                self.receive(&data, Stream::Stdout).await
            }
            Some(MessageType::ChannelExtendedData) => {
                let code = payload.read_u32()?;
                let data = payload.read_string()?;
                if code == EXTENDED_DATA_STDERR {
                    self.receive(&data, Stream::Stderr).await
                } else {
                    debug!("Channel {} ignoring extended data type {}", self.id, code);
                    self.receive(&data, Stream::Discard).await
                }
            }
            Some(MessageType::ChannelEof) => {
                self.inner.lock().await.eof_received = true;
                debug!("Channel {} got EOF", self.id);
                self.notify();
                Ok(())
            }
            Some(MessageType::ChannelClose) => {
                self.got_close().await;
                Ok(())
            }
            Some(MessageType::ChannelRequest) => self.got_request(payload).await,
            Some(MessageType::ChannelSuccess) => self.got_reply(true).await,
            Some(MessageType::ChannelFailure) => self.got_reply(false).await,
            _ => Err(self.channel_error(format!(
                "unexpected {}",
                message::describe(id)
            ))),
        }
    }

    async fn receive(&self, data: &[u8], stream: Stream) -> SkeinResult<()> {
        let len = data.len() as u32;
        if len > self.local.max_packet_size() {
            return Err(self.channel_error(format!(
                "data packet of {} bytes exceeds maximum {}",
                len,
                self.local.max_packet_size()
            )));
        }
        {
            let mut inner = self.inner.lock().await;
            if inner.eof_received || inner.close_received {
                return Err(self.channel_error("data after EOF"));
            }
            self.local
                .consume(len)
                .map_err(|e| self.channel_error(e.to_string()))?;
            match stream {
                Stream::Stdout => inner.data.extend_from_slice(data),
                Stream::Stderr => inner.stderr.extend_from_slice(data),
                Stream::Discard => {}
            }
        }
        trace!("Channel {} received {} bytes ({:?})", self.id, len, stream);
        self.notify();

        // Discarded bytes are never read, so they cannot wait for read().
        if matches!(stream, Stream::Discard) || !self.expand_on_read.load(Ordering::Acquire) {
            if let Some(add) = self.local.take_adjustment() {
                self.writer.enqueue_packet(self.window_adjust(add))?;
            }
        }
        Ok(())
    }

    fn window_adjust(&self, add: u32) -> Buffer {
        debug!("Channel {} sending window adjust +{}", self.id, add);
        let mut msg = self.header(MessageType::ChannelWindowAdjust);
        msg.put_u32(add);
        msg
    }

    async fn got_close(&self) {
        let reply = {
            let mut inner = self.inner.lock().await;
            inner.close_received = true;
            inner.eof_received = true;
            inner.state = ChannelState::Closed;
            let reply = !inner.close_sent;
            inner.close_sent = true;
            reply
        };
        debug!("Channel {} closed by peer", self.id);
        if reply {
            if let Err(e) = self.writer.enqueue_packet(self.header(MessageType::ChannelClose)) {
                trace!("Channel {} close reply not queued: {}", self.id, e);
            }
        }
        let err = self.channel_error("channel closed");
        self.remote.fail(err.clone());
        for pending in self.pending_requests.lock().await.drain(..) {
            pending.deliver_error(err.clone());
        }
        self.notify();
        self.closed.set(());
    }

    async fn got_request(&self, mut payload: Buffer) -> SkeinResult<()> {
        let name = payload.read_utf8()?;
        let want_reply = payload.read_bool()?;
        let handled = match name.as_str() {
            "exit-status" => {
                let status = payload.read_u32()?;
                debug!("Channel {} exit status {}", self.id, status);
                let _ = self.exit_status.set(status);
                true
            }
            "exit-signal" => {
                let signal = ExitSignal {
                    signal: payload.read_utf8()?,
                    core_dumped: payload.read_bool()?,
                    message: payload.read_utf8()?,
                    language: payload.read_utf8()?,
                };
                debug!("Channel {} exit signal {}", self.id, signal.signal);
                let _ = self.exit_signal.set(signal);
                true
            }
            _ => {
                debug!("Channel {} declining request {}", self.id, name);
                false
            }
        };
        if want_reply {
            let id = if handled {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            self.writer.enqueue_packet(self.header(id))?;
        }
        Ok(())
    }

    async fn got_reply(&self, success: bool) -> SkeinResult<()> {
        let pending = self.pending_requests.lock().await.pop_front();
        match pending {
            Some(event) => {
                event.set(success);
                Ok(())
            }
            None => Err(self.channel_error("request reply with no request pending")),
        }
    }

    /// Fails the channel; every waiter and stream sees `err`.
    pub(crate) async fn fail(&self, err: SkeinError) {
        {
            let mut inner = self.inner.lock().await;
            if inner.error.is_none() {
                inner.error = Some(err.clone());
            }
            inner.state = ChannelState::Closed;
        }
        self.remote.fail(err.clone());
        for pending in self.pending_requests.lock().await.drain(..) {
            pending.deliver_error(err.clone());
        }
        self.opened.deliver_error(err.clone());
        self.closed.deliver_error(err);
        self.notify();
    }

    /// Fails the channel after a channel-level protocol error and asks the
    /// peer to close it.
    pub(crate) async fn abort(&self, err: SkeinError) {
        debug!("Channel {} failed: {}", self.id, err);
        let send_close = {
            let mut inner = self.inner.lock().await;
            let send = !inner.close_sent;
            inner.close_sent = true;
            send
        };
        if send_close {
            let _ = self.writer.enqueue_packet(self.header(MessageType::ChannelClose));
        }
        self.fail(err).await;
    }

    // ---- Application side --------------------------------------------

    async fn read_stream(&self, buf: &mut [u8], stream: Stream) -> SkeinResult<usize> {
        let mut changes = self.changed.subscribe();
        loop {
            {
                let mut inner = self.inner.lock().await;
                let pending = match stream {
                    Stream::Stdout => &mut inner.data,
                    Stream::Stderr => &mut inner.stderr,
                    // Only `read` and `read_stderr` call this; discarded data is never read.
                    Stream::Discard => unreachable!("Stream::Discard is not readable"),
                };
                if !pending.is_empty() {
                    let n = pending.len().min(buf.len());
                    buf[..n].copy_from_slice(&pending[..n]);
                    pending.advance(n);
                    drop(inner);
                    self.after_read().await?;
                    return Ok(n);
                }
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if inner.eof_received {
                    return Ok(0);
                }
            }
            changes
                .changed()
                .await
                .map_err(|_| self.channel_error("channel dropped"))?;
        }
    }

    async fn after_read(&self) -> SkeinResult<()> {
        if self.expand_on_read.load(Ordering::Acquire) {
            if let Some(add) = self.local.take_adjustment() {
                self.writer.write_packet(self.window_adjust(add)).await?;
            }
        }
        Ok(())
    }

    /// Reads channel data into `buf`. Returns 0 at EOF.
    pub async fn read(&self, buf: &mut [u8]) -> SkeinResult<usize> {
        self.read_stream(buf, Stream::Stdout).await
    }

    /// Reads extended (stderr) data into `buf`. Returns 0 at EOF.
    pub async fn read_stderr(&self, buf: &mut [u8]) -> SkeinResult<usize> {
        self.read_stream(buf, Stream::Stderr).await
    }

    /// Reads until EOF.
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> SkeinResult<usize> {
        let mut chunk = vec![0u8; 8192];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    async fn ensure_writable(&self) -> SkeinResult<()> {
        let inner = self.inner.lock().await;
        if let Some(err) = &inner.error {
            return Err(err.clone());
        }
        if inner.state != ChannelState::Open {
            return Err(self.channel_error(format!("channel is {:?}", inner.state)));
        }
        if inner.eof_sent || inner.close_sent {
            return Err(self.channel_error("channel output already closed"));
        }
        Ok(())
    }

    /// Buffers `data`, sending full packets as the remote window allows.
    pub async fn write(&self, data: &[u8]) -> SkeinResult<()> {
        let mut out = self.outbound.lock().await;
        self.ensure_writable().await?;
        let mut rest = data;
        while !rest.is_empty() {
            let max_packet = self.remote.max_packet_size().max(1) as usize;
            let n = max_packet.saturating_sub(out.len()).min(rest.len());
            out.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if out.len() >= max_packet {
                self.flush_locked(&mut out).await?;
            }
        }
        Ok(())
    }

    /// Sends everything buffered, waiting for window space as needed.
    pub async fn flush(&self) -> SkeinResult<()> {
        let mut out = self.outbound.lock().await;
        self.flush_locked(&mut out).await
    }

    async fn flush_locked(&self, out: &mut BytesMut) -> SkeinResult<()> {
        while !out.is_empty() {
            let available = self.remote.wait_available().await? as usize;
            let max_packet = self.remote.max_packet_size().max(1) as usize;
            let n = out.len().min(max_packet).min(available);
            self.remote.consume(n as u32)?;

            let chunk = out.split_to(n);
            let mut msg = self.header(MessageType::ChannelData);
            msg.put_string(&chunk);
            self.writer.write_packet(msg).await?;
            trace!("Channel {} sent {} bytes", self.id, n);
        }
        Ok(())
    }

    /// Flushes and sends EOF. Further writes fail.
    pub async fn send_eof(&self) -> SkeinResult<()> {
        self.flush().await?;
        {
            let mut inner = self.inner.lock().await;
            if inner.eof_sent || inner.close_sent {
                return Ok(());
            }
            inner.eof_sent = true;
        }
        debug!("Channel {} sending EOF", self.id);
        self.writer
            .write_packet(self.header(MessageType::ChannelEof))
            .await
            .map(|_| ())
    }

    /// Flushes, sends CLOSE (unless already sent) and waits for the peer's.
    pub async fn close(&self) -> SkeinResult<()> {
        let send = {
            let inner = self.inner.lock().await;
            inner.state == ChannelState::Open && !inner.close_sent && inner.error.is_none()
        };
        if send {
            if let Err(e) = self.flush().await {
                debug!("Channel {} flush before close failed: {}", self.id, e);
            }
            let mut inner = self.inner.lock().await;
            let send = !inner.close_sent;
            inner.close_sent = true;
            if inner.state == ChannelState::Open {
                inner.state = ChannelState::Closing;
            }
            drop(inner);
            if send {
                debug!("Channel {} sending CLOSE", self.id);
                self.writer
                    .write_packet(self.header(MessageType::ChannelClose))
                    .await?;
            }
        }
        self.closed.wait(self.timeout).await
    }

    /// Waits until both sides have closed the channel.
    pub async fn wait_closed(&self) -> SkeinResult<()> {
        self.closed.resolved().await
    }

    /// Sends a channel request.
    ///
    /// With `want_reply`, waits for the reply and returns whether it was
    /// SSH_MSG_CHANNEL_SUCCESS. Replies are matched to requests in order.
    pub async fn request(&self, name: &str, want_reply: bool, data: &[u8]) -> SkeinResult<bool> {
        let guard = self.request_send.lock().await;
        self.ensure_writable_or_eof().await?;

        let reply = want_reply
            .then(|| Arc::new(Event::new(format!("channel {} {} reply", self.id, name))));
        if let Some(reply) = &reply {
            self.pending_requests.lock().await.push_back(reply.clone());
        }

        let mut msg = self.header(MessageType::ChannelRequest);
        msg.put_str(name);
        msg.put_bool(want_reply);
        msg.put_raw(data);
        debug!("Channel {} request {} (want_reply={})", self.id, name, want_reply);
        self.writer.write_packet(msg).await?;
        drop(guard);

        match reply {
            Some(reply) => reply.wait(self.timeout).await,
            None => Ok(true),
        }
    }

    async fn ensure_writable_or_eof(&self) -> SkeinResult<()> {
        let inner = self.inner.lock().await;
        if let Some(err) = &inner.error {
            return Err(err.clone());
        }
        if inner.state != ChannelState::Open || inner.close_sent {
            return Err(self.channel_error(format!("channel is {:?}", inner.state)));
        }
        Ok(())
    }

    async fn required(&self, name: &str, data: &[u8]) -> SkeinResult<()> {
        if self.request(name, true, data).await? {
            Ok(())
        } else {
            Err(self.channel_error(format!("{} request refused", name)))
        }
    }

    /// Runs `command` (`exec` request).
    pub async fn exec(&self, command: &str) -> SkeinResult<()> {
        let mut data = Buffer::new();
        data.put_str(command);
        self.required("exec", data.as_slice()).await
    }

    /// Starts the user's shell.
    pub async fn shell(&self) -> SkeinResult<()> {
        self.required("shell", &[]).await
    }

    /// Starts a subsystem such as "sftp".
    pub async fn subsystem(&self, name: &str) -> SkeinResult<()> {
        let mut data = Buffer::new();
        data.put_str(name);
        self.required("subsystem", data.as_slice()).await
    }

    /// Allocates a pseudo-terminal.
    pub async fn pty(&self, pty: &PtyRequest) -> SkeinResult<()> {
        let mut data = Buffer::new();
        data.put_str(&pty.term);
        data.put_u32(pty.cols);
        data.put_u32(pty.rows);
        data.put_u32(pty.width_px);
        data.put_u32(pty.height_px);
        data.put_string(&pty.modes);
        self.required("pty-req", data.as_slice()).await
    }

    /// Sets an environment variable for the next command.
    pub async fn env(&self, name: &str, value: &str) -> SkeinResult<()> {
        let mut data = Buffer::new();
        data.put_str(name);
        data.put_str(value);
        self.required("env", data.as_slice()).await
    }

    /// Delivers a signal (name without "SIG") to the remote process.
    pub async fn signal(&self, name: &str) -> SkeinResult<()> {
        let mut data = Buffer::new();
        data.put_str(name);
        self.request("signal", false, data.as_slice()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records every payload instead of sending it.
    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<Vec<u8>>>,
        queued: StdMutex<Vec<Vec<u8>>>,
    }

    impl Recorder {
        fn sent_ids(&self) -> Vec<u8> {
            self.sent.lock().unwrap().iter().map(|p| p[0]).collect()
        }
        fn queued_ids(&self) -> Vec<u8> {
            self.queued.lock().unwrap().iter().map(|p| p[0]).collect()
        }
    }

    #[async_trait]
    impl PacketWriter for Recorder {
        async fn write_packet(&self, payload: Buffer) -> SkeinResult<u32> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(payload.as_slice().to_vec());
            Ok(sent.len() as u32)
        }
        fn enqueue_packet(&self, payload: Buffer) -> SkeinResult<()> {
            self.queued.lock().unwrap().push(payload.as_slice().to_vec());
            Ok(())
        }
        async fn flush_queue(&self) -> SkeinResult<()> {
            Ok(())
        }
        fn authenticated(&self) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn config(window: u32, max_packet: u32) -> Config {
        Config {
            local_window_size: window,
            local_max_packet_size: max_packet,
            channel_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    async fn open_channel(config: &Config, remote_window: u32) -> (Arc<Channel>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let channel = Arc::new(Channel::new(0, "session", recorder.clone(), config));
        channel.confirm(7, remote_window, 32768).await;
        (channel, recorder)
    }

    fn data_msg(payload: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.put_string(payload);
        buf
    }

    #[tokio::test]
    async fn test_window_adjust_on_receive() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 0).await;
        assert_eq!(channel.local_window().threshold(), 250);

        channel
            .handle(MessageType::ChannelData as u8, data_msg(&[1; 700]))
            .await
            .unwrap();
        assert!(recorder.queued_ids().is_empty());

        channel
            .handle(MessageType::ChannelData as u8, data_msg(&[2; 100]))
            .await
            .unwrap();
        let queued = recorder.queued.lock().unwrap().clone();
        assert_eq!(queued.len(), 1);
        let mut adjust = Buffer::from_slice(&queued[0]);
        assert_eq!(adjust.read_u8().unwrap(), MessageType::ChannelWindowAdjust as u8);
        assert_eq!(adjust.read_u32().unwrap(), 7);
        assert_eq!(adjust.read_u32().unwrap(), 800);
        assert_eq!(channel.local_window().size(), 1000);
    }

    #[tokio::test]
    async fn test_expand_on_read() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 0).await;
        channel.set_expand_on_read(true);
        channel
            .handle(MessageType::ChannelData as u8, data_msg(&[1; 800]))
            .await
            .unwrap();
        assert!(recorder.queued_ids().is_empty());

        let mut buf = [0u8; 1000];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 800);
        assert_eq!(recorder.sent_ids(), vec![MessageType::ChannelWindowAdjust as u8]);
    }

    #[tokio::test]
    async fn test_unread_extended_data_is_adjusted() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 0).await;
        channel.set_expand_on_read(true);
        for _ in 0..2 {
            let mut msg = Buffer::new();
            msg.put_u32(2);
            msg.put_string(&[9; 400]);
            channel
                .handle(MessageType::ChannelExtendedData as u8, msg)
                .await
                .unwrap();
        }
        let queued = recorder.queued.lock().unwrap().clone();
        assert_eq!(queued.len(), 1);
        let mut adjust = Buffer::from_slice(&queued[0]);
        assert_eq!(adjust.read_u8().unwrap(), MessageType::ChannelWindowAdjust as u8);
        assert_eq!(adjust.read_u32().unwrap(), 7);
        assert_eq!(adjust.read_u32().unwrap(), 800);
        assert_eq!(channel.local_window().size(), 1000);
    }

    #[tokio::test]
    async fn test_window_adjust_overflow_is_channel_error() {
        let (channel, _) = open_channel(&config(1000, 32768), u32::MAX - 10).await;
        let mut msg = Buffer::new();
        msg.put_u32(11);
        let err = channel
            .handle(MessageType::ChannelWindowAdjust as u8, msg)
            .await
            .unwrap_err();
        assert!(matches!(err, SkeinError::Channel { id: 0, .. }));
    }

    #[tokio::test]
    async fn test_overflowing_window_is_channel_error() {
        let (channel, _) = open_channel(&config(100, 32768), 0).await;
        let err = channel
            .handle(MessageType::ChannelData as u8, data_msg(&[0; 101]))
            .await
            .unwrap_err();
        assert!(matches!(err, SkeinError::Channel { id: 0, .. }));
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let (channel, _) = open_channel(&config(1 << 20, 16), 0).await;
        assert!(channel
            .handle(MessageType::ChannelData as u8, data_msg(&[0; 17]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_read_after_eof() {
        let (channel, _) = open_channel(&config(1000, 32768), 0).await;
        channel
            .handle(MessageType::ChannelData as u8, data_msg(b"hello"))
            .await
            .unwrap();
        channel
            .handle(MessageType::ChannelEof as u8, Buffer::new())
            .await
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(channel.read_to_end(&mut out).await.unwrap(), 5);
        assert_eq!(out, b"hello");
        assert!(channel.is_eof().await);
    }

    #[tokio::test]
    async fn test_stderr_is_separate() {
        let (channel, _) = open_channel(&config(1000, 32768), 0).await;
        let mut ext = Buffer::new();
        ext.put_u32(EXTENDED_DATA_STDERR);
        ext.put_string(b"oops");
        channel
            .handle(MessageType::ChannelExtendedData as u8, ext)
            .await
            .unwrap();
        channel
            .handle(MessageType::ChannelEof as u8, Buffer::new())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
        assert_eq!(channel.read_stderr(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"oops");
    }

    #[tokio::test]
    async fn test_write_waits_for_remote_window() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 0).await;
        channel.write(b"hello").await.unwrap();

        let flusher = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flusher.is_finished());
        assert!(recorder.sent_ids().is_empty());

        let mut adjust = Buffer::new();
        adjust.put_u32(5);
        channel
            .handle(MessageType::ChannelWindowAdjust as u8, adjust)
            .await
            .unwrap();
        flusher.await.unwrap().unwrap();

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let mut msg = Buffer::from_slice(&sent[0]);
        assert_eq!(msg.read_u8().unwrap(), MessageType::ChannelData as u8);
        assert_eq!(msg.read_u32().unwrap(), 7);
        assert_eq!(msg.read_string().unwrap(), b"hello");
        assert_eq!(channel.remote_window().size(), 0);
    }

    #[tokio::test]
    async fn test_write_splits_by_window_and_packet() {
        let recorder = Arc::new(Recorder::default());
        let channel = Channel::new(0, "session", recorder.clone(), &config(1000, 32768));
        channel.confirm(7, 10, 4).await;

        channel.write(b"abcdefghij").await.unwrap();
        channel.flush().await.unwrap();
        let lens: Vec<usize> = recorder
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.len() - 9)
            .collect();
        assert_eq!(lens, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_remote_max_packet_ceiling() {
        let recorder = Arc::new(Recorder::default());
        let config = Config {
            remote_max_packet_ceiling: 1024,
            ..config(1000, 32768)
        };
        let channel = Channel::new(0, "session", recorder, &config);
        channel.confirm(1, 1 << 20, 1 << 24).await;
        assert_eq!(channel.remote_window().max_packet_size(), 1024);
    }

    #[tokio::test]
    async fn test_request_replies_are_fifo() {
        let (channel, _) = open_channel(&config(1000, 32768), 0).await;

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request("env", true, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request("exec", true, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        channel
            .handle(MessageType::ChannelFailure as u8, Buffer::new())
            .await
            .unwrap();
        channel
            .handle(MessageType::ChannelSuccess as u8, Buffer::new())
            .await
            .unwrap();

        assert!(!first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_reply_without_request() {
        let (channel, _) = open_channel(&config(1000, 32768), 0).await;
        assert!(matches!(
            channel
                .handle(MessageType::ChannelSuccess as u8, Buffer::new())
                .await,
            Err(SkeinError::Channel { .. })
        ));
    }

    #[tokio::test]
    async fn test_exit_status_and_signal() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 0).await;

        let mut req = Buffer::new();
        req.put_str("exit-status");
        req.put_bool(false);
        req.put_u32(3);
        channel
            .handle(MessageType::ChannelRequest as u8, req)
            .await
            .unwrap();
        assert_eq!(channel.exit_status(), Some(3));

        let mut req = Buffer::new();
        req.put_str("exit-signal");
        req.put_bool(false);
        req.put_str("TERM");
        req.put_bool(false);
        req.put_str("terminated");
        req.put_str("");
        channel
            .handle(MessageType::ChannelRequest as u8, req)
            .await
            .unwrap();
        assert_eq!(channel.exit_signal().unwrap().signal, "TERM");

        let mut req = Buffer::new();
        req.put_str("keepalive@openssh.com");
        req.put_bool(true);
        channel
            .handle(MessageType::ChannelRequest as u8, req)
            .await
            .unwrap();
        assert_eq!(recorder.queued_ids(), vec![MessageType::ChannelFailure as u8]);
    }

    #[tokio::test]
    async fn test_peer_close_is_answered() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 0).await;
        channel
            .handle(MessageType::ChannelClose as u8, Buffer::new())
            .await
            .unwrap();
        assert_eq!(recorder.queued_ids(), vec![MessageType::ChannelClose as u8]);
        assert!(channel.is_closed().await);
        channel.wait_closed().await.unwrap();
        assert!(channel.write(b"late").await.is_err());

        // Our own close after the peer's is a no-op.
        channel.close().await.unwrap();
        assert!(recorder.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_waits_for_peer() {
        let (channel, recorder) = open_channel(&config(1000, 32768), 100).await;
        let closer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.close().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(channel.state().await, ChannelState::Closing);
        assert_eq!(recorder.sent_ids(), vec![MessageType::ChannelClose as u8]);

        channel
            .handle(MessageType::ChannelClose as u8, Buffer::new())
            .await
            .unwrap();
        closer.await.unwrap().unwrap();
        assert!(recorder.queued_ids().is_empty());
    }

    #[tokio::test]
    async fn test_fail_wakes_reader() {
        let (channel, _) = open_channel(&config(1000, 32768), 0).await;
        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                channel.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        channel
            .fail(SkeinError::Protocol("transport died".to_string()))
            .await;
        assert!(matches!(
            reader.await.unwrap(),
            Err(SkeinError::Protocol(_))
        ));
    }
}
