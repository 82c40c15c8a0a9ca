//! Keep-alive heartbeat using SSH_MSG_IGNORE.
//!
//! The task only builds the message; sending goes through the transport's
//! normal write path, so keep-alives are serialized with every other writer
//! and never disturb sequence numbers.

use crate::ssh::buffer::Buffer;
use crate::ssh::message::MessageType;
use rand::RngCore;
use skein_platform::SkeinResult;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Periodic keep-alive sender.
///
/// An interval of zero means disabled. [`KeepaliveTask::start`] replaces any
/// running task, so the interval can be changed at any time.
#[derive(Debug)]
pub struct KeepaliveTask {
    interval: Duration,
    task_handle: Option<JoinHandle<()>>,
}

impl Default for KeepaliveTask {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl KeepaliveTask {
    /// Creates a stopped task.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task_handle: None,
        }
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// (Re)starts the task with `interval`. Zero only stops it.
    ///
    /// `send_fn` is called once per tick; the task ends on its first error.
    pub fn start<F, Fut>(&mut self, interval: Duration, send_fn: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = SkeinResult<()>> + Send + 'static,
    {
        self.stop();
        self.interval = interval;
        if interval.is_zero() {
            return;
        }

        let handle = tokio::spawn(async move {
            debug!("Keep-alive task started with interval: {:?}", interval);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if let Err(e) = send_fn().await {
                    warn!("Keep-alive failed: {} - stopping task", e);
                    break;
                }
            }
            debug!("Keep-alive task stopped");
        });
        self.task_handle = Some(handle);
    }

    /// Stops the task if it is running.
    pub fn stop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE carrying `data_len` random bytes.
///
/// ```rust
/// use skein_proto::ssh::keepalive::ignore_message;
///
/// let msg = ignore_message(8);
/// assert_eq!(msg.as_slice()[0], 2);
/// assert_eq!(msg.as_slice().len(), 1 + 4 + 8);
/// ```
pub fn ignore_message(data_len: usize) -> Buffer {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);

    let mut msg = Buffer::with_capacity(5 + data_len);
    msg.put_u8(MessageType::Ignore as u8);
    msg.put_string(&data);
    msg
}
