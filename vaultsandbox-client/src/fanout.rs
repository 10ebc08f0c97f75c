// SPDX-License-Identifier: MIT OR Apache-2.0

//! Non-blocking broadcast of delivered emails to independent subscribers.
//!
//! Every subscriber owns a bounded channel. Publishing never waits: when the channel of a
//! subscriber is full the item is dropped for that subscriber only and counted, so a slow consumer
//! can not stall delivery for everyone else.
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::trace;

/// Buffer size of every subscriber channel.
pub const SUBSCRIBER_CAPACITY: usize = 16;

type SubscriberId = u64;

/// Ordered list of subscribers, each receiving a clone of every published item.
pub struct Fanout<T> {
    inner: Arc<FanoutInner<T>>,
}

struct FanoutInner<T> {
    state: Mutex<FanoutState<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

struct FanoutState<T> {
    next_id: SubscriberId,
    subscribers: Vec<(SubscriberId, mpsc::Sender<T>)>,
    closed: bool,
}

impl<T> FanoutInner<T> {
    fn state(&self) -> MutexGuard<'_, FanoutState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriberId) {
        self.state().subscribers.retain(|(other, _)| *other != id);
    }
}

impl<T> Fanout<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                state: Mutex::new(FanoutState {
                    next_id: 0,
                    subscribers: Vec::new(),
                    closed: false,
                }),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new subscriber. After [`Fanout::close`] the returned subscription is closed
    /// already.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut state = self.inner.state();
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.push((id, tx));
        }

        Subscription {
            rx,
            handle: CancelHandle {
                id,
                fanout: Arc::downgrade(&self.inner),
            },
        }
    }

    /// Sends the item to every subscriber without waiting.
    pub fn publish(&self, item: T) {
        // Send outside of the lock.
        let senders: Vec<(SubscriberId, mpsc::Sender<T>)> = self.inner.state().subscribers.clone();

        let mut closed = Vec::new();
        for (id, tx) in senders {
            match tx.try_send(item.clone()) {
                Ok(()) => (),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = id, "subscriber is lagging, dropped item");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            self.inner
                .state()
                .subscribers
                .retain(|(id, _)| !closed.contains(id));
        }
    }

    /// Removes and closes all subscribers. Later subscriptions are closed right away.
    pub fn close(&self) {
        let subscribers = {
            let mut state = self.inner.state();
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        trace!(count = subscribers.len(), "close fanout");
        drop(subscribers);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state().subscribers.len()
    }

    /// Number of items dropped because a subscriber channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Default for Fanout<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Fanout<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Fanout")
            .field("subscribers", &state.subscribers.len())
            .field("closed", &state.closed)
            .field("dropped", &self.inner.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Cancels a subscription from anywhere, can be cloned and outlive the subscription.
pub struct CancelHandle<T> {
    id: SubscriberId,
    fanout: Weak<FanoutInner<T>>,
}

impl<T> CancelHandle<T> {
    /// Unregisters the subscriber. Its stream ends after the already buffered items.
    pub fn cancel(&self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.remove(self.id);
        }
    }
}

impl<T> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            fanout: self.fanout.clone(),
        }
    }
}

impl<T> std::fmt::Debug for CancelHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").field("id", &self.id).finish()
    }
}

/// Receiving end of a fanout subscriber, unregisters itself when dropped.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    handle: CancelHandle<T>,
}

impl<T> Subscription<T> {
    /// Receives the next item, `None` once the subscription was cancelled or the fanout closed
    /// and all buffered items were consumed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns a buffered item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn cancel_handle(&self) -> CancelHandle<T> {
        self.handle.clone()
    }

    pub fn cancel(&mut self) {
        self.handle.cancel();
        self.rx.close();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.handle.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::{Fanout, SUBSCRIBER_CAPACITY};

    #[tokio::test]
    async fn every_subscriber_receives_in_order() {
        let fanout = Fanout::new();
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        for i in 0..5 {
            fanout.publish(i);
        }

        for subscription in [&mut a, &mut b] {
            for i in 0..5 {
                assert_eq!(subscription.recv().await, Some(i));
            }
        }
        assert_eq!(fanout.dropped_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block() {
        let fanout = Fanout::new();
        let mut fast = fanout.subscribe();
        let mut slow = fanout.subscribe();

        let mut received = Vec::new();
        for i in 0..100 {
            fanout.publish(i);
            received.push(fast.recv().await.unwrap());
        }

        // Fast subscriber got everything, in order.
        assert_eq!(received, (0..100).collect::<Vec<_>>());

        // Slow subscriber kept the first items which fit into its buffer.
        let mut buffered = Vec::new();
        while let Some(item) = slow.try_recv() {
            buffered.push(item);
        }
        assert_eq!(buffered, (0..SUBSCRIBER_CAPACITY as i32).collect::<Vec<_>>());
        assert_eq!(fanout.dropped_count(), (100 - SUBSCRIBER_CAPACITY) as u64);
    }

    #[tokio::test]
    async fn cancel_ends_stream_after_buffered_items() {
        let fanout = Fanout::new();
        let mut subscription = fanout.subscribe();
        let handle = subscription.cancel_handle();

        fanout.publish("a");
        handle.cancel();
        fanout.publish("b");

        assert_eq!(subscription.next().await, Some("a"));
        assert_eq!(subscription.next().await, None);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let fanout: Fanout<u8> = Fanout::new();
        let subscription = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close() {
        let fanout = Fanout::new();
        let mut before = fanout.subscribe();
        fanout.publish(1);
        fanout.close();
        fanout.publish(2);

        assert_eq!(before.recv().await, Some(1));
        assert_eq!(before.recv().await, None);

        let mut after = fanout.subscribe();
        assert_eq!(after.recv().await, None);
        assert!(fanout.is_closed());
    }
}
