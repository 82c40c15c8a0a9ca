//! Single-assignment completion cell shared between tasks.
//!
//! An [`Event`] is resolved at most once with either a value or an error; every
//! waiter (current and future) observes the same outcome. It can be [`cleared`]
//! for reuse across protocol rounds such as repeated key exchanges.
//!
//! [`cleared`]: Event::clear

use crate::error::{SkeinError, SkeinResult};
use std::time::Duration;
use tokio::sync::watch;

/// One-shot signal carrying a result.
#[derive(Debug)]
pub struct Event<T> {
    name: String,
    tx: watch::Sender<Option<SkeinResult<T>>>,
}

impl<T: Clone> Event<T> {
    /// Creates an unresolved event. The name is used in timeout errors.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Resolves the event with a value. Returns `false` if already resolved.
    pub fn set(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolves the event with an error. Returns `false` if already resolved.
    pub fn deliver_error(&self, error: SkeinError) -> bool {
        self.resolve(Err(error))
    }

    fn resolve(&self, result: SkeinResult<T>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        })
    }

    /// Resets the event to the unresolved state.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Whether the event has been resolved.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current outcome, if resolved.
    pub fn try_get(&self) -> Option<SkeinResult<T>> {
        self.tx.borrow().clone()
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until the event is resolved, with no deadline.
    pub async fn resolved(&self) -> SkeinResult<T> {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(SkeinError::Protocol(format!(
                    "{} abandoned before completion",
                    self.name
                )));
            }
        }
    }

    /// Waits until the event is resolved or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> SkeinResult<T> {
        match tokio::time::timeout(timeout, self.resolved()).await {
            Ok(result) => result,
            Err(_) => Err(SkeinError::Timeout(format!(
                "waiting for {} ({:?})",
                self.name, timeout
            ))),
        }
    }
}
