// SPDX-License-Identifier: MIT OR Apache-2.0

//! Strategies to learn about new emails: a server-sent event stream or adaptive polling.
mod poll;
mod push;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub use poll::PollStrategy;
pub use push::PushStrategy;

use crate::sync::InboxState;
use crate::transport::ServerInfo;

/// Which strategy the client uses to learn about new emails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Push when the server supports it, polling otherwise.
    #[default]
    Auto,
    Push,
    Poll,
}

impl DeliveryMode {
    /// Resolves `Auto` against the capabilities of the server.
    pub fn resolve(self, server_info: &ServerInfo) -> DeliveryMode {
        match self {
            DeliveryMode::Auto if server_info.supports_push => DeliveryMode::Push,
            DeliveryMode::Auto => DeliveryMode::Poll,
            mode => mode,
        }
    }
}

/// Keeps the subscribed inboxes of a client up to date.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Spawns the background tasks.
    fn start(&self);

    /// Stops all background tasks and closes the fanouts of all managed inboxes.
    async fn stop(&self);

    /// Starts watching the inbox. After [`DeliveryStrategy::stop`] the inbox is closed right away.
    fn add(&self, inbox: Arc<InboxState>);

    /// Stops watching the inbox with the given hash.
    fn remove(&self, inbox_hash: &str) -> Option<Arc<InboxState>>;
}

/// Inboxes managed by a strategy, keyed by inbox hash.
#[derive(Debug)]
struct Inboxes<V> {
    map: RwLock<HashMap<String, V>>,
}

impl<V> Default for Inboxes<V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Inboxes<V> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, V>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background tasks of a strategy and their shutdown.
#[derive(Debug)]
struct Tasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    grace_period: Duration,
}

impl Tasks {
    fn new(cancel: CancellationToken, grace_period: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            grace_period,
        }
    }

    /// Returns true only for the first call.
    fn mark_started(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.started.swap(true, Ordering::AcqRel)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Cancels all tasks and waits for them to finish, at most for the grace period.
    ///
    /// Returns false if it was stopped before.
    async fn shutdown(&self, name: &str) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.grace_period, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                strategy = name,
                tasks = self.tracker.len(),
                "tasks did not stop within grace period"
            );
        } else {
            debug!(strategy = name, "all tasks stopped");
        }

        true
    }
}
