// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drift detection and catch-up of inbox contents.
//!
//! The server exposes a hash over the email IDs of every inbox. The engine compares it with the
//! hash it observed last and only when they differ lists the inbox, fetches the emails it has not
//! delivered yet, opens them and publishes them to the subscribers of the inbox.
//!
//! Syncs of one inbox never overlap: while one is in flight at most one more is queued, every
//! further trigger is coalesced into the queued one.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};
use vaultsandbox_core::{DecryptedEmail, InboxDescriptor, envelope};

use crate::error::Error;
use crate::fanout::Fanout;
use crate::seen::SeenSet;
use crate::sse::PushEvent;
use crate::transport::{ApiTransport, EncryptedEmail};

/// Email delivered to the client-wide event stream.
#[derive(Clone, Debug)]
pub struct EmailEvent {
    /// Address of the inbox which received the email.
    pub inbox: String,
    pub email: Arc<DecryptedEmail>,
}

/// Local state of one subscribed inbox.
#[derive(Debug)]
pub struct InboxState {
    descriptor: InboxDescriptor,
    seen: Mutex<SeenSet>,
    gate: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    fanout: Fanout<Arc<DecryptedEmail>>,
}

impl InboxState {
    pub fn new(descriptor: InboxDescriptor) -> Self {
        Self {
            descriptor,
            seen: Mutex::new(SeenSet::default()),
            gate: tokio::sync::Mutex::new(()),
            pending: AtomicBool::new(false),
            fanout: Fanout::new(),
        }
    }

    pub fn descriptor(&self) -> &InboxDescriptor {
        &self.descriptor
    }

    pub fn email_address(&self) -> &str {
        &self.descriptor.email_address
    }

    pub fn inbox_hash(&self) -> &str {
        &self.descriptor.inbox_hash
    }

    pub fn fanout(&self) -> &Fanout<Arc<DecryptedEmail>> {
        &self.fanout
    }

    pub fn seen(&self) -> MutexGuard<'_, SeenSet> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ends the streams of all subscribers of this inbox.
    pub fn close(&self) {
        self.fanout.close();
    }
}

/// Outcome of one sync trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Emails-hash did not change since the last sync.
    Unchanged,

    /// Inbox was listed, `delivered` new emails were published and `failed` could not be opened.
    Synced { delivered: usize, failed: usize },

    /// Another sync is queued already and will pick up this trigger.
    Coalesced,
}

impl SyncOutcome {
    pub fn delivered(&self) -> usize {
        match self {
            SyncOutcome::Synced { delivered, .. } => *delivered,
            _ => 0,
        }
    }
}

/// Marks a queued sync, released once the sync got its turn or gave up waiting for it.
struct PendingSlot<'a>(&'a AtomicBool);

impl<'a> PendingSlot<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    transport: Arc<dyn ApiTransport>,
    events: Fanout<EmailEvent>,
    push_fast_path: bool,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        events: Fanout<EmailEvent>,
        push_fast_path: bool,
    ) -> Self {
        Self {
            transport,
            events,
            push_fast_path,
        }
    }

    pub fn transport(&self) -> &Arc<dyn ApiTransport> {
        &self.transport
    }

    /// Brings the local view of the inbox up to date and delivers all new emails.
    ///
    /// A transport error while reading the sync status or the email list aborts the sync and
    /// leaves the local state untouched. Emails which can not be fetched or opened are skipped
    /// and retried on the next trigger.
    pub async fn sync(&self, inbox: &InboxState) -> Result<SyncOutcome, Error> {
        let Some(slot) = PendingSlot::acquire(&inbox.pending) else {
            trace!(inbox = %inbox.email_address(), "sync already queued");
            return Ok(SyncOutcome::Coalesced);
        };
        let _gate = inbox.gate.lock().await;
        // This sync is in flight now, the next trigger may queue up again.
        drop(slot);

        self.run_sync(inbox).await
    }

    async fn run_sync(&self, inbox: &InboxState) -> Result<SyncOutcome, Error> {
        let address = inbox.email_address();

        let status = self.transport.get_inbox_sync(address).await?;
        if inbox.seen().emails_hash() == Some(status.emails_hash.as_str()) {
            trace!(inbox = %address, "emails hash unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let mut remote = self.transport.list_emails_metadata_only(address).await?;
        remote.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let known: HashSet<String> = inbox.seen().ids().clone();
        let remote_ids: HashSet<&str> = remote.iter().map(|email| email.id.as_str()).collect();

        let mut delivered = 0;
        let mut failed = 0;
        for metadata in remote.iter().filter(|email| !known.contains(&email.id)) {
            match self.fetch_and_open(inbox, &metadata.id).await {
                Ok(email) => {
                    if self.deliver(inbox, email) {
                        delivered += 1;
                    }
                }
                Err(err) => {
                    warn!(inbox = %address, email_id = %metadata.id, "skip email: {err}");
                    failed += 1;
                }
            }
        }

        {
            let mut seen = inbox.seen();
            seen.forget(known.iter().filter(|id| !remote_ids.contains(id.as_str())));
            // Keep the old hash when something failed, the next trigger retries.
            if failed == 0 {
                seen.set_emails_hash(status.emails_hash);
            }
        }

        debug!(inbox = %address, delivered, failed, "synced inbox");
        Ok(SyncOutcome::Synced { delivered, failed })
    }

    /// Handles a push notification for the inbox.
    ///
    /// With the fast path enabled and inline metadata present the notification is authenticated
    /// by opening the metadata and the announced email is delivered as soon as no sync of the
    /// inbox is in flight. Otherwise the notification triggers a regular sync.
    pub async fn handle_push(
        &self,
        inbox: &InboxState,
        event: &PushEvent,
    ) -> Result<SyncOutcome, Error> {
        let Some(metadata) = event.encrypted_metadata.as_ref().filter(|_| self.push_fast_path)
        else {
            return self.sync(inbox).await;
        };

        let descriptor = inbox.descriptor();
        envelope::open(metadata, &descriptor.server_sig_pk, &descriptor.keypair)?;

        // Serialized with syncs and other pushes of this inbox.
        let _gate = inbox.gate.lock().await;
        if inbox.seen().contains(&event.email_id) {
            return Ok(SyncOutcome::Unchanged);
        }

        let email = self.fetch_and_open(inbox, &event.email_id).await?;
        let delivered = usize::from(self.deliver(inbox, email));
        Ok(SyncOutcome::Synced {
            delivered,
            failed: 0,
        })
    }

    /// Lists all emails of the inbox and returns the ones which could be opened, oldest first.
    pub async fn current_emails(&self, inbox: &InboxState) -> Result<Vec<DecryptedEmail>, Error> {
        let address = inbox.email_address();
        let encrypted = self.transport.list_emails(address).await?;

        let mut emails: Vec<DecryptedEmail> = encrypted
            .iter()
            .filter_map(|email| match open_email(inbox.descriptor(), email) {
                Ok(email) => Some(email),
                Err(err) => {
                    warn!(inbox = %address, email_id = %email.id, "skip email: {err}");
                    None
                }
            })
            .collect();
        emails.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(emails)
    }

    async fn fetch_and_open(&self, inbox: &InboxState, id: &str) -> Result<DecryptedEmail, Error> {
        let encrypted = self.transport.get_email(inbox.email_address(), id).await?;
        open_email(inbox.descriptor(), &encrypted)
    }

    /// Publishes the email unless it was delivered before.
    fn deliver(&self, inbox: &InboxState, email: DecryptedEmail) -> bool {
        // Claim right before publishing so no path can deliver the same email twice.
        if !inbox.seen().claim(&email.id) {
            trace!(inbox = %inbox.email_address(), email_id = %email.id, "already delivered");
            return false;
        }

        trace!(inbox = %inbox.email_address(), email_id = %email.id, "deliver email");
        let email = Arc::new(email);
        inbox.fanout.publish(email.clone());
        self.events.publish(EmailEvent {
            inbox: inbox.email_address().to_string(),
            email,
        });
        true
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("push_fast_path", &self.push_fast_path)
            .finish_non_exhaustive()
    }
}

/// Verifies and decrypts a stored email with the keys of its inbox.
pub fn open_email(
    descriptor: &InboxDescriptor,
    encrypted: &EncryptedEmail,
) -> Result<DecryptedEmail, Error> {
    let metadata = envelope::open(
        &encrypted.encrypted_metadata,
        &descriptor.server_sig_pk,
        &descriptor.keypair,
    )?;
    let parsed = encrypted
        .encrypted_parsed
        .as_ref()
        .map(|payload| envelope::open(payload, &descriptor.server_sig_pk, &descriptor.keypair))
        .transpose()?;

    Ok(DecryptedEmail::from_plaintexts(
        encrypted.id.clone(),
        encrypted.received_at,
        encrypted.is_read,
        &metadata,
        parsed.as_deref(),
    )?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::error::Error;
    use crate::fanout::Fanout;
    use crate::sse::PushEvent;
    use crate::test_utils::{MockServer, TestEmail};
    use crate::transport::ApiTransport;

    use super::{InboxState, SyncEngine, SyncOutcome};

    fn setup(fast_path: bool) -> (MockServer, SyncEngine, Arc<InboxState>) {
        let server = MockServer::new();
        let descriptor = server.create_test_inbox("inbox@vaultsandbox.test");
        let engine = SyncEngine::new(Arc::new(server.clone()), Fanout::new(), fast_path);
        let inbox = Arc::new(InboxState::new(descriptor));
        (server, engine, inbox)
    }

    #[tokio::test]
    async fn drift_catch_up() {
        let (server, engine, inbox) = setup(false);
        let mut subscription = inbox.fanout().subscribe();

        server.deliver(inbox.email_address(), TestEmail::new("A"));
        server.deliver(inbox.email_address(), TestEmail::new("B"));

        let outcome = engine.sync(&inbox).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Synced { delivered: 2, failed: 0 });
        assert_eq!(subscription.recv().await.unwrap().subject, "A");
        assert_eq!(subscription.recv().await.unwrap().subject, "B");

        let status = server.get_inbox_sync(inbox.email_address()).await.unwrap();
        assert_eq!(inbox.seen().emails_hash(), Some(status.emails_hash.as_str()));

        // Nothing changed, the hash check short-circuits.
        let list_calls = server.calls("list_emails_metadata_only");
        assert_eq!(engine.sync(&inbox).await.unwrap(), SyncOutcome::Unchanged);
        assert_eq!(server.calls("list_emails_metadata_only"), list_calls);

        server.deliver(inbox.email_address(), TestEmail::new("C"));
        assert_eq!(engine.sync(&inbox).await.unwrap().delivered(), 1);
        assert_eq!(subscription.recv().await.unwrap().subject, "C");
        assert_eq!(server.calls("get_email"), 3);
    }

    #[tokio::test]
    async fn failed_email_is_retried() {
        let (server, engine, inbox) = setup(false);
        let mut subscription = inbox.fanout().subscribe();

        server.deliver(inbox.email_address(), TestEmail::new("good"));
        let forged = server.deliver_forged(inbox.email_address(), TestEmail::new("forged"));

        let outcome = engine.sync(&inbox).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Synced { delivered: 1, failed: 1 });
        assert_eq!(subscription.recv().await.unwrap().subject, "good");

        // Hash was not stored, so the next trigger lists again but only refetches the failure.
        assert_eq!(
            engine.sync(&inbox).await.unwrap(),
            SyncOutcome::Synced { delivered: 0, failed: 1 }
        );
        assert!(!inbox.seen().contains(&forged));
    }

    #[tokio::test]
    async fn transport_error_aborts_sync() {
        let (server, engine, inbox) = setup(false);
        server.deliver(inbox.email_address(), TestEmail::new("A"));
        server.fail_next("list_emails_metadata_only");

        assert_matches!(engine.sync(&inbox).await, Err(Error::Network(_)));
        assert!(inbox.seen().is_empty());
        assert_eq!(inbox.seen().emails_hash(), None);

        assert_eq!(engine.sync(&inbox).await.unwrap().delivered(), 1);
    }

    #[tokio::test]
    async fn deleted_emails_are_forgotten() {
        let (server, engine, inbox) = setup(false);
        let id = server.deliver(inbox.email_address(), TestEmail::new("A"));
        engine.sync(&inbox).await.unwrap();
        assert!(inbox.seen().contains(&id));

        server.remove_email(inbox.email_address(), &id);
        engine.sync(&inbox).await.unwrap();
        assert!(!inbox.seen().contains(&id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_deliver_once() {
        let (server, engine, inbox) = setup(false);
        let mut subscription = inbox.fanout().subscribe();
        for i in 0..5 {
            server.deliver(inbox.email_address(), TestEmail::new(&format!("{i}")));
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = engine.clone();
            let inbox = inbox.clone();
            handles.push(tokio::spawn(async move { engine.sync(&inbox).await }));
        }

        let mut delivered = 0;
        for handle in handles {
            delivered += handle.await.unwrap().unwrap().delivered();
        }
        assert_eq!(delivered, 5);

        for i in 0..5 {
            assert_eq!(subscription.recv().await.unwrap().subject, format!("{i}"));
        }
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn push_fast_path() {
        let (server, engine, inbox) = setup(true);
        let mut subscription = inbox.fanout().subscribe();

        let id = server.deliver(inbox.email_address(), TestEmail::new("pushed"));
        let event = server.push_event(inbox.email_address(), &id);
        assert!(event.encrypted_metadata.is_some());

        let outcome = engine.handle_push(&inbox, &event).await.unwrap();
        assert_eq!(outcome.delivered(), 1);
        assert_eq!(server.calls("get_inbox_sync"), 0);
        assert_eq!(subscription.recv().await.unwrap().subject, "pushed");

        // Replayed notification is not delivered again.
        assert_eq!(
            engine.handle_push(&inbox, &event).await.unwrap(),
            SyncOutcome::Unchanged
        );

        // A sync afterwards does not deliver it a second time.
        assert_eq!(engine.sync(&inbox).await.unwrap().delivered(), 0);
    }

    #[tokio::test]
    async fn push_fast_path_waits_for_running_sync() {
        let (server, engine, inbox) = setup(true);
        let mut subscription = inbox.fanout().subscribe();

        let id = server.deliver(inbox.email_address(), TestEmail::new("pushed"));
        let event = server.push_event(inbox.email_address(), &id);

        // Stands in for a sync which is in flight.
        let gate = inbox.gate.lock().await;
        let handle = {
            let engine = engine.clone();
            let inbox = inbox.clone();
            tokio::spawn(async move { engine.handle_push(&inbox, &event).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(!inbox.seen().contains(&id));
        assert!(subscription.try_recv().is_none());

        drop(gate);
        assert_eq!(handle.await.unwrap().unwrap().delivered(), 1);
        assert_eq!(subscription.recv().await.unwrap().subject, "pushed");
    }

    #[tokio::test]
    async fn push_fast_path_rejects_forged_metadata() {
        let (server, engine, inbox) = setup(true);
        let id = server.deliver_forged(inbox.email_address(), TestEmail::new("forged"));
        let event = server.push_event(inbox.email_address(), &id);

        assert_matches!(
            engine.handle_push(&inbox, &event).await,
            Err(Error::ServerKeyMismatch)
        );
        assert_eq!(server.calls("get_email"), 0);
    }

    #[tokio::test]
    async fn push_without_fast_path_syncs() {
        let (server, engine, inbox) = setup(false);
        let id = server.deliver(inbox.email_address(), TestEmail::new("pushed"));
        let event = PushEvent {
            inbox_id: inbox.inbox_hash().to_string(),
            email_id: id,
            encrypted_metadata: None,
        };

        assert_eq!(engine.handle_push(&inbox, &event).await.unwrap().delivered(), 1);
        assert_eq!(server.calls("get_inbox_sync"), 1);
    }

    #[tokio::test]
    async fn current_emails_skips_failures() {
        let (server, engine, inbox) = setup(false);
        server.deliver(inbox.email_address(), TestEmail::new("first"));
        server.deliver_forged(inbox.email_address(), TestEmail::new("forged"));
        server.deliver(inbox.email_address(), TestEmail::new("second"));

        let emails = engine.current_emails(&inbox).await.unwrap();
        let subjects: Vec<_> = emails.iter().map(|email| email.subject.as_str()).collect();
        assert_eq!(subjects, vec!["first", "second"]);
    }
}
