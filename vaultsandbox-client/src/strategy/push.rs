// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::join_all;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backoff::{self, Backoff};
use crate::sse::{self, EMAIL_EVENT, PushEvent, SseEvent};
use crate::strategy::{DeliveryStrategy, Inboxes, Tasks};
use crate::sync::{InboxState, SyncEngine};
use crate::transport::EventStream;

/// Listens to the server-sent event stream of all managed inboxes.
///
/// Every (re)connect is followed by a catch-up sync of all inboxes, so emails which arrived while
/// the stream was down are delivered as well. Adding or removing an inbox reopens the stream with
/// the new set of inbox hashes.
#[derive(Debug)]
pub struct PushStrategy {
    inner: Arc<PushInner>,
}

#[derive(Debug)]
struct PushInner {
    engine: SyncEngine,
    reconnect: backoff::Config,
    inboxes: Inboxes<Arc<InboxState>>,
    membership: watch::Sender<u64>,
    tasks: Tasks,
    rng: Mutex<Option<ChaCha20Rng>>,
}

/// Why reading from the event stream stopped.
enum StreamEnd {
    Cancelled,
    MembershipChanged,
    Disconnected,
}

impl PushStrategy {
    pub fn new(
        engine: SyncEngine,
        reconnect: backoff::Config,
        cancel: CancellationToken,
        grace_period: Duration,
    ) -> Self {
        Self::with_rng(
            engine,
            reconnect,
            cancel,
            grace_period,
            ChaCha20Rng::from_os_rng(),
        )
    }

    /// Uses the given random number generator for the reconnect jitter.
    pub fn with_rng(
        engine: SyncEngine,
        reconnect: backoff::Config,
        cancel: CancellationToken,
        grace_period: Duration,
        rng: ChaCha20Rng,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                engine,
                reconnect,
                inboxes: Inboxes::default(),
                membership: watch::Sender::new(0),
                tasks: Tasks::new(cancel, grace_period),
                rng: Mutex::new(Some(rng)),
            }),
        }
    }
}

impl PushInner {
    fn inbox_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.inboxes.read().keys().cloned().collect();
        hashes.sort();
        hashes
    }

    async fn run(self: Arc<Self>) {
        let rng = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(ChaCha20Rng::from_os_rng);
        let mut backoff = Backoff::new(self.reconnect.clone(), rng);
        let cancel = self.tasks.cancel.clone();
        let mut membership = self.membership.subscribe();

        loop {
            membership.borrow_and_update();
            let hashes = self.inbox_hashes();
            if hashes.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = membership.changed() => continue,
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.engine.transport().open_event_stream(hashes.clone()) => result,
            };
            let stream = match result {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("could not open event stream: {err}");
                    if !sleep_or_cancel(&mut backoff, &mut membership, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            debug!(inboxes = hashes.len(), "event stream open");
            backoff.reset();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.catch_up() => (),
            }

            match self.read_events(stream, &mut membership, &cancel).await {
                StreamEnd::Cancelled => break,
                StreamEnd::MembershipChanged => {
                    debug!("inboxes changed, reopen event stream");
                }
                StreamEnd::Disconnected => {
                    if !sleep_or_cancel(&mut backoff, &mut membership, &cancel).await {
                        break;
                    }
                }
            }
        }

        debug!("push delivery stopped");
    }

    /// Syncs all inboxes, emails which arrived while the stream was down are delivered here.
    async fn catch_up(&self) {
        let inboxes: Vec<Arc<InboxState>> = self.inboxes.read().values().cloned().collect();
        let results = join_all(inboxes.iter().map(|inbox| self.engine.sync(inbox))).await;
        for (inbox, result) in inboxes.iter().zip(results) {
            if let Err(err) = result {
                warn!(inbox = %inbox.email_address(), "catch-up sync failed: {err}");
            }
        }
    }

    async fn read_events(
        &self,
        stream: EventStream,
        membership: &mut watch::Receiver<u64>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut events = sse::decode_events(stream);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = membership.changed() => return StreamEnd::MembershipChanged,
                event = events.next() => match event {
                    Some(Ok(event)) => self.dispatch(event),
                    Some(Err(err)) => {
                        warn!("event stream failed: {err}");
                        return StreamEnd::Disconnected;
                    }
                    None => {
                        debug!("event stream closed by server");
                        return StreamEnd::Disconnected;
                    }
                },
            }
        }
    }

    fn dispatch(&self, event: SseEvent) {
        if event.event != EMAIL_EVENT {
            trace!(event = %event.event, "ignore event");
            return;
        }

        let push = match PushEvent::try_from(&event) {
            Ok(push) => push,
            Err(err) => {
                warn!("ignore malformed email event: {err}");
                return;
            }
        };

        let Some(inbox) = self.inboxes.read().get(&push.inbox_id).cloned() else {
            trace!(inbox_hash = %push.inbox_id, "ignore event for unknown inbox");
            return;
        };

        trace!(inbox = %inbox.email_address(), email_id = %push.email_id, "received push event");
        let engine = self.engine.clone();
        let cancel = self.tasks.cancel.clone();
        self.tasks.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => (),
                result = engine.handle_push(&inbox, &push) => {
                    if let Err(err) = result {
                        warn!(
                            inbox = %inbox.email_address(),
                            email_id = %push.email_id,
                            "could not handle push event: {err}"
                        );
                    }
                }
            }
        });
    }
}

/// Waits for the next reconnect attempt, cut short when the set of inboxes changes.
///
/// Returns false if cancelled in the meantime.
async fn sleep_or_cancel(
    backoff: &mut Backoff,
    membership: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
) -> bool {
    let cancelled = tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = membership.changed() => false,
        _ = backoff.sleep() => false,
    };
    backoff.increment();
    !cancelled
}

#[async_trait]
impl DeliveryStrategy for PushStrategy {
    fn name(&self) -> &'static str {
        "push"
    }

    fn start(&self) {
        if !self.inner.tasks.mark_started() {
            return;
        }

        let inner = self.inner.clone();
        self.inner.tasks.tracker.spawn(inner.run());
    }

    async fn stop(&self) {
        if !self.inner.tasks.shutdown(self.name()).await {
            return;
        }

        let inboxes: Vec<_> = self.inner.inboxes.write().drain().collect();
        for (_, inbox) in inboxes {
            inbox.close();
        }
    }

    fn add(&self, inbox: Arc<InboxState>) {
        if self.inner.tasks.is_stopped() {
            inbox.close();
            return;
        }

        self.inner
            .inboxes
            .write()
            .insert(inbox.inbox_hash().to_string(), inbox.clone());

        // Stopped while inserting, the drain might have missed this inbox.
        if self.inner.tasks.is_stopped() {
            self.inner.inboxes.write().remove(inbox.inbox_hash());
            inbox.close();
            return;
        }
        self.inner.membership.send_modify(|version| *version += 1);
    }

    fn remove(&self, inbox_hash: &str) -> Option<Arc<InboxState>> {
        let inbox = self.inner.inboxes.write().remove(inbox_hash)?;
        self.inner.membership.send_modify(|version| *version += 1);
        Some(inbox)
    }
}
