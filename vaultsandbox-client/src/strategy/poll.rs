// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backoff::{self, Backoff};
use crate::strategy::{DeliveryStrategy, Inboxes, Tasks};
use crate::sync::{InboxState, SyncEngine, SyncOutcome};

/// Polls every inbox on its own timer.
///
/// The interval starts at the configured initial value and doubles after every tick which did not
/// bring new emails, up to the configured maximum. Any new email resets it.
#[derive(Debug)]
pub struct PollStrategy {
    engine: SyncEngine,
    config: backoff::Config,
    inboxes: Inboxes<(Arc<InboxState>, CancellationToken)>,
    tasks: Tasks,
    rng: Mutex<ChaCha20Rng>,
}

impl PollStrategy {
    pub fn new(
        engine: SyncEngine,
        config: backoff::Config,
        cancel: CancellationToken,
        grace_period: Duration,
    ) -> Self {
        Self::with_rng(
            engine,
            config,
            cancel,
            grace_period,
            ChaCha20Rng::from_os_rng(),
        )
    }

    /// Uses the given random number generator to derive the jitter of all timers.
    pub fn with_rng(
        engine: SyncEngine,
        config: backoff::Config,
        cancel: CancellationToken,
        grace_period: Duration,
        rng: ChaCha20Rng,
    ) -> Self {
        Self {
            engine,
            config,
            inboxes: Inboxes::default(),
            tasks: Tasks::new(cancel, grace_period),
            rng: Mutex::new(rng),
        }
    }

    fn spawn_poller(&self, inbox: Arc<InboxState>, cancel: CancellationToken) {
        let rng = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            ChaCha20Rng::from_rng(&mut *rng)
        };
        let backoff = Backoff::new(self.config.clone(), rng);
        let engine = self.engine.clone();

        self.tasks
            .tracker
            .spawn(poll_inbox(engine, inbox, backoff, cancel));
    }
}

async fn poll_inbox(
    engine: SyncEngine,
    inbox: Arc<InboxState>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    debug!(inbox = %inbox.email_address(), "start polling");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = backoff.sleep() => (),
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = engine.sync(&inbox) => result,
        };
        match result {
            Ok(SyncOutcome::Synced { delivered, .. }) if delivered > 0 => backoff.reset(),
            Ok(outcome) => {
                trace!(inbox = %inbox.email_address(), ?outcome, "no new emails");
                backoff.increment();
            }
            Err(err) => {
                warn!(inbox = %inbox.email_address(), "polling failed: {err}");
                backoff.increment();
            }
        }
    }

    debug!(inbox = %inbox.email_address(), "stop polling");
}

#[async_trait]
impl DeliveryStrategy for PollStrategy {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn start(&self) {
        if !self.tasks.mark_started() {
            return;
        }

        let inboxes: Vec<_> = self.inboxes.read().values().cloned().collect();
        for (inbox, cancel) in inboxes {
            self.spawn_poller(inbox, cancel);
        }
    }

    async fn stop(&self) {
        if !self.tasks.shutdown(self.name()).await {
            return;
        }

        let inboxes: Vec<_> = self.inboxes.write().drain().collect();
        for (_, (inbox, _)) in inboxes {
            inbox.close();
        }
    }

    fn add(&self, inbox: Arc<InboxState>) {
        if self.tasks.is_stopped() {
            inbox.close();
            return;
        }

        let cancel = self.tasks.cancel.child_token();
        let previous = self.inboxes.write().insert(
            inbox.inbox_hash().to_string(),
            (inbox.clone(), cancel.clone()),
        );
        if let Some((_, previous_cancel)) = previous {
            previous_cancel.cancel();
        }

        // Stopped while inserting, the drain might have missed this inbox.
        if self.tasks.is_stopped() {
            self.inboxes.write().remove(inbox.inbox_hash());
            inbox.close();
            return;
        }

        if self.tasks.is_started() {
            self.spawn_poller(inbox, cancel);
        }
    }

    fn remove(&self, inbox_hash: &str) -> Option<Arc<InboxState>> {
        let (inbox, cancel) = self.inboxes.write().remove(inbox_hash)?;
        cancel.cancel();
        Some(inbox)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::backoff;
    use crate::fanout::Fanout;
    use crate::strategy::DeliveryStrategy;
    use crate::sync::{InboxState, SyncEngine};
    use crate::test_utils::{MockServer, TestEmail};

    use super::PollStrategy;

    fn fast_config() -> backoff::Config {
        backoff::Config {
            initial: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.1,
            max: Duration::from_millis(40),
        }
    }

    fn setup(server: &MockServer) -> PollStrategy {
        let engine = SyncEngine::new(Arc::new(server.clone()), Fanout::new(), false);
        PollStrategy::with_rng(
            engine,
            fast_config(),
            CancellationToken::new(),
            Duration::from_secs(1),
            ChaCha20Rng::from_seed([0; 32]),
        )
    }

    #[tokio::test]
    async fn polls_new_emails() {
        let server = MockServer::new();
        let strategy = setup(&server);
        let inbox = Arc::new(InboxState::new(server.create_test_inbox("a@vaultsandbox.test")));
        let mut subscription = inbox.fanout().subscribe();

        strategy.add(inbox.clone());
        strategy.start();

        server.deliver(inbox.email_address(), TestEmail::new("first"));
        let email = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(email.subject, "first");

        strategy.stop().await;
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn polling_errors_are_not_fatal() {
        let server = MockServer::new();
        let strategy = setup(&server);
        let inbox = Arc::new(InboxState::new(server.create_test_inbox("a@vaultsandbox.test")));
        let mut subscription = inbox.fanout().subscribe();

        server.fail_next("get_inbox_sync");
        server.fail_next("get_inbox_sync");
        strategy.start();
        strategy.add(inbox.clone());
        server.deliver(inbox.email_address(), TestEmail::new("after errors"));

        let email = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(email.subject, "after errors");
        assert!(server.calls("get_inbox_sync") >= 3);

        strategy.stop().await;
    }

    #[tokio::test]
    async fn remove_stops_polling() {
        let server = MockServer::new();
        let strategy = setup(&server);
        let inbox = Arc::new(InboxState::new(server.create_test_inbox("a@vaultsandbox.test")));

        strategy.add(inbox.clone());
        strategy.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(strategy.remove(inbox.inbox_hash()).is_some());
        // Let the poller observe the cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = server.calls("get_inbox_sync");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.calls("get_inbox_sync"), calls);

        strategy.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_running_sync() {
        let server = MockServer::new();
        server.set_latency("get_inbox_sync", Duration::from_secs(3));
        let engine = SyncEngine::new(Arc::new(server.clone()), Fanout::new(), false);
        let strategy = PollStrategy::with_rng(
            engine,
            fast_config(),
            CancellationToken::new(),
            Duration::from_millis(500),
            ChaCha20Rng::from_seed([0; 32]),
        );
        let inbox = Arc::new(InboxState::new(server.create_test_inbox("a@vaultsandbox.test")));

        strategy.add(inbox.clone());
        strategy.start();
        // First tick after about 10ms, the sync then hangs in the transport.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        strategy.stop().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(strategy.tasks.tracker.len(), 0);
        assert!(strategy.inboxes.read().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn add_racing_stop_closes_inbox() {
        let server = MockServer::new();
        let strategy = Arc::new(setup(&server));
        strategy.start();

        let inboxes: Vec<_> = (0..16)
            .map(|i| {
                let address = format!("{i}@vaultsandbox.test");
                Arc::new(InboxState::new(server.create_test_inbox(&address)))
            })
            .collect();
        let mut subscriptions: Vec<_> = inboxes
            .iter()
            .map(|inbox| inbox.fanout().subscribe())
            .collect();

        let adds: Vec<_> = inboxes
            .into_iter()
            .map(|inbox| {
                let strategy = strategy.clone();
                tokio::spawn(async move { strategy.add(inbox) })
            })
            .collect();
        strategy.stop().await;
        for add in adds {
            add.await.unwrap();
        }

        for subscription in subscriptions.iter_mut() {
            let next = tokio::time::timeout(Duration::from_secs(2), subscription.recv()).await;
            assert_eq!(next.unwrap(), None);
        }
        assert!(strategy.inboxes.read().is_empty());
    }

    #[tokio::test]
    async fn add_after_stop_closes_inbox() {
        let server = MockServer::new();
        let strategy = setup(&server);
        strategy.start();
        strategy.stop().await;

        let inbox = Arc::new(InboxState::new(server.create_test_inbox("a@vaultsandbox.test")));
        let mut subscription = inbox.fanout().subscribe();
        strategy.add(inbox.clone());
        assert_eq!(subscription.recv().await, None);
    }
}
