//! Channel flow control windows (RFC 4254 Section 5.2).
//!
//! Each channel has two windows:
//!
//! - [`LocalWindow`]: how much the peer may still send us. Consumed as data
//!   arrives and replenished with SSH_MSG_CHANNEL_WINDOW_ADJUST once it drops
//!   to the threshold `min(max_packet * 20, initial / 4)`.
//! - [`RemoteWindow`]: how much we may still send. Consumed as we send and
//!   expanded only by the peer's window adjusts. Writers wait here when it is
//!   exhausted.
//!
//! Neither window ever goes below zero.

use skein_platform::{SkeinError, SkeinResult};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::watch;
use tracing::trace;

/// Largest window size representable on the wire.
pub const MAX_WINDOW: i64 = u32::MAX as i64;

/// Receive side window.
#[derive(Debug)]
pub struct LocalWindow {
    size: AtomicI64,
    initial: u32,
    max_packet_size: u32,
}

impl LocalWindow {
    /// Creates a full window.
    pub fn new(initial: u32, max_packet_size: u32) -> Self {
        Self {
            size: AtomicI64::new(initial as i64),
            initial,
            max_packet_size,
        }
    }

    /// Bytes the peer may still send.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    /// Size the window is restored to.
    pub fn initial_size(&self) -> u32 {
        self.initial
    }

    /// Largest data packet we accept.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// Level at or below which the window is replenished.
    pub fn threshold(&self) -> i64 {
        (self.max_packet_size as i64 * 20).min(self.initial as i64 / 4)
    }

    /// Records `len` received bytes.
    ///
    /// Fails if the peer sent more than it was allowed to.
    pub fn consume(&self, len: u32) -> SkeinResult<()> {
        let len = len as i64;
        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (len <= size).then(|| size - len)
            })
            .map(|_| ())
            .map_err(|size| {
                SkeinError::Protocol(format!(
                    "Peer sent {} bytes with only {} left in the window",
                    len, size
                ))
            })
    }

    /// If the window is at or below the threshold, restores it to the initial
    /// size and returns the number of bytes to advertise.
    pub fn take_adjustment(&self) -> Option<u32> {
        let threshold = self.threshold();
        let initial = self.initial as i64;
        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size <= threshold).then_some(initial)
            })
            .ok()
            .map(|previous| {
                let add = (initial - previous) as u32;
                trace!("Local window {} -> {} (+{})", previous, initial, add);
                add
            })
            .filter(|&add| add > 0)
    }
}

#[derive(Debug, Clone)]
struct RemoteState {
    size: i64,
    max_packet_size: u32,
    error: Option<SkeinError>,
}

/// Send side window.
#[derive(Debug)]
pub struct RemoteWindow {
    state: watch::Sender<RemoteState>,
}

impl Default for RemoteWindow {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl RemoteWindow {
    /// Creates a window with the peer's advertised values.
    pub fn new(initial: u32, max_packet_size: u32) -> Self {
        let (state, _) = watch::channel(RemoteState {
            size: initial as i64,
            max_packet_size,
            error: None,
        });
        Self { state }
    }

    /// Replaces size and maximum packet size (at open confirmation).
    pub fn init(&self, size: u32, max_packet_size: u32) {
        self.state.send_modify(|s| {
            s.size = size as i64;
            s.max_packet_size = max_packet_size;
        });
    }

    /// Bytes we may still send.
    pub fn size(&self) -> i64 {
        self.state.borrow().size
    }

    /// Largest data packet the peer accepts.
    pub fn max_packet_size(&self) -> u32 {
        self.state.borrow().max_packet_size
    }

    /// Applies a window adjust; the window may not grow past 2^32 - 1.
    pub fn expand(&self, add: u32) -> SkeinResult<i64> {
        let mut result = Ok(0);
        self.state.send_if_modified(|s| {
            let after = s.size + add as i64;
            if after > MAX_WINDOW {
                result = Err(SkeinError::Protocol(format!(
                    "Window adjust of {} overflows the remote window ({} left)",
                    add, s.size
                )));
                return false;
            }
            s.size = after;
            result = Ok(after);
            true
        });
        result
    }

    /// Records `len` sent bytes; fails if that exceeds the window.
    pub fn consume(&self, len: u32) -> SkeinResult<()> {
        let len = len as i64;
        let mut result = Ok(());
        self.state.send_if_modified(|s| {
            if len > s.size {
                result = Err(SkeinError::Protocol(format!(
                    "Cannot send {} bytes with {} left in the remote window",
                    len, s.size
                )));
                return false;
            }
            s.size -= len;
            true
        });
        result
    }

    /// Waits until the window is non-empty and returns its size.
    pub async fn wait_available(&self) -> SkeinResult<u32> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.size > 0 || s.error.is_some())
            .await
            .map_err(|_| SkeinError::Protocol("remote window dropped".to_string()))?;
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(state.size.min(MAX_WINDOW) as u32),
        }
    }

    /// Releases every waiter with `err`; later waits fail immediately.
    pub fn fail(&self, err: SkeinError) {
        self.state.send_modify(|s| {
            if s.error.is_none() {
                s.error = Some(err);
            }
        });
    }
}
