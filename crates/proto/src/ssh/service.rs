//! Seams between the transport and the layers above it.
//!
//! [`PacketWriter`] is what a service sees of the transport: a way to send
//! payloads. [`Service`] is what the transport sees of a service that is not
//! built into this crate (for example a user authentication client).
//!
//! The transport routes message ids 50 and above to its
//! [`ActiveService`], a closed set of variants rather than a trait object
//! hierarchy, so the connection layer is dispatched statically.

use crate::ssh::buffer::Buffer;
use crate::ssh::connection::ConnectionService;
use async_trait::async_trait;
use skein_platform::{SkeinError, SkeinResult};
use std::sync::Arc;

/// Outbound half of the transport, as used by services.
#[async_trait]
pub trait PacketWriter: Send + Sync {
    /// Sends a payload, waiting out any key exchange in progress.
    ///
    /// Returns the sequence number the packet was sent with.
    async fn write_packet(&self, payload: Buffer) -> SkeinResult<u32>;

    /// Queues a payload to be sent in order by a background task.
    ///
    /// Used from the transport's own reader, which must never wait for a
    /// key exchange to finish.
    fn enqueue_packet(&self, payload: Buffer) -> SkeinResult<()>;

    /// Waits until everything queued so far with
    /// [`PacketWriter::enqueue_packet`] has been written.
    async fn flush_queue(&self) -> SkeinResult<()>;

    /// Reports user authentication success, activating delayed compression
    /// in both directions.
    ///
    /// Called from [`Service::handle`] while processing USERAUTH_SUCCESS, it
    /// takes effect before the reader decodes the next packet.
    fn authenticated(&self);

    /// Whether the transport can still send.
    fn is_open(&self) -> bool;
}

/// A service implemented outside this crate.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name as requested with SSH_MSG_SERVICE_REQUEST.
    fn name(&self) -> &str;

    /// Handles one message; `payload` is positioned after the message id.
    ///
    /// An error here is fatal to the transport.
    async fn handle(&self, id: u8, payload: Buffer) -> SkeinResult<()>;

    /// Called once when the transport terminates.
    fn notify_error(&self, err: &SkeinError);
}

/// The service that currently owns message ids 50 and above.
#[derive(Clone, Default)]
pub enum ActiveService {
    /// No service yet; such messages are answered with UNIMPLEMENTED.
    #[default]
    None,
    /// The built-in `ssh-connection` channel multiplexer.
    Connection(Arc<ConnectionService>),
    /// Any other service.
    External(Arc<dyn Service>),
}

impl std::fmt::Debug for ActiveService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActiveService({})", self.name().unwrap_or("none"))
    }
}

impl ActiveService {
    /// Name of the active service.
    pub fn name(&self) -> Option<&str> {
        match self {
            ActiveService::None => None,
            ActiveService::Connection(_) => Some(crate::ssh::connection::SERVICE_NAME),
            ActiveService::External(s) => Some(s.name()),
        }
    }

    /// Routes a message; returns `false` if there is no service to take it.
    pub async fn handle(&self, id: u8, payload: Buffer) -> SkeinResult<bool> {
        match self {
            ActiveService::None => Ok(false),
            ActiveService::Connection(conn) => conn.handle(id, payload).await.map(|_| true),
            ActiveService::External(s) => s.handle(id, payload).await.map(|_| true),
        }
    }

    /// Forwards a terminal transport error.
    pub async fn notify_error(&self, err: &SkeinError) {
        match self {
            ActiveService::None => {}
            ActiveService::Connection(conn) => conn.notify_error(err).await,
            ActiveService::External(s) => s.notify_error(err),
        }
    }
}
