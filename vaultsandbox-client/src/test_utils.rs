// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory server and fixtures for tests.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use vaultsandbox_core::codec;
use vaultsandbox_core::crypto::ml_kem::{self, PublicKeyBytes};
use vaultsandbox_core::crypto::sha2::sha2_256;
use vaultsandbox_core::email::{AttachmentPlaintext, MetadataPlaintext, ParsedPlaintext, Recipients};
use vaultsandbox_core::envelope::{AlgorithmSuite, CONTEXT, EncryptedPayload};
use vaultsandbox_core::test_utils::ServerSigner;
use vaultsandbox_core::{InboxDescriptor, Keypair};

use crate::sse::{EMAIL_EVENT, PushEvent};
use crate::transport::{
    ApiTransport, CreateInboxRequest, CreateInboxResponse, EmailMetadata, EncryptedEmail,
    EncryptedRaw, EventStream, ServerInfo, SyncStatus, TransportError,
};

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Email content to be delivered into a [`MockServer`] inbox.
#[derive(Clone, Debug)]
pub struct TestEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentPlaintext>,
    pub links: Vec<String>,
    pub auth_results: Option<serde_json::Value>,
}

impl TestEmail {
    pub fn new(subject: &str) -> Self {
        Self {
            from: "sender@example.com".to_string(),
            to: Vec::new(),
            subject: subject.to_string(),
            text: Some(format!("Body of {subject}")),
            html: None,
            attachments: Vec::new(),
            links: Vec::new(),
            auth_results: None,
        }
    }

    pub fn sender(mut self, from: &str) -> Self {
        self.from = from.to_string();
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn link(mut self, link: &str) -> Self {
        self.links.push(link.to_string());
        self
    }

    pub fn attachment(mut self, filename: &str, content: &[u8]) -> Self {
        self.attachments.push(AttachmentPlaintext {
            filename: filename.to_string(),
            content_type: "application/octet-stream".to_string(),
            size: Some(content.len() as u64),
            content: Some(codec::encode_std(content)),
            ..Default::default()
        });
        self
    }

    pub fn auth_results(mut self, value: serde_json::Value) -> Self {
        self.auth_results = Some(value);
        self
    }

    fn raw(&self, to: &str) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}",
            self.from,
            to,
            self.subject,
            self.text.as_deref().unwrap_or_default()
        )
    }
}

/// In-memory implementation of the VaultSandbox API.
///
/// Seals every email with its own ML-DSA key like the real server does, computes emails-hashes,
/// serves server-sent event streams and records how often each endpoint was called. Failures can
/// be injected per endpoint.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<MockInner>,
}

struct MockInner {
    signer: ServerSigner,
    forger: ServerSigner,
    state: Mutex<MockState>,
}

struct MockState {
    server_info: ServerInfo,
    api_key_valid: bool,
    streams_available: bool,
    inboxes: HashMap<String, MockInbox>,
    raw: HashMap<String, EncryptedPayload>,
    streams: Vec<MockStream>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, usize>,
    latency: HashMap<&'static str, Duration>,
    next_id: u64,
    clock: DateTime<Utc>,
}

struct MockInbox {
    inbox_hash: String,
    public_key: PublicKeyBytes,
    emails: Vec<EncryptedEmail>,
}

struct MockStream {
    inbox_hashes: Vec<String>,
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl MockServer {
    pub fn new() -> Self {
        let signer = ServerSigner::generate();
        let server_info = ServerInfo {
            server_sig_pk: signer.public_key_b64(),
            algs: AlgorithmSuite::supported(),
            context: CONTEXT.to_string(),
            max_ttl: 7 * 24 * 60 * 60,
            default_ttl: 60 * 60,
            supports_push: true,
            allowed_domains: vec!["vaultsandbox.test".to_string()],
        };

        Self {
            inner: Arc::new(MockInner {
                signer,
                forger: ServerSigner::generate(),
                state: Mutex::new(MockState {
                    server_info,
                    api_key_valid: true,
                    streams_available: true,
                    inboxes: HashMap::new(),
                    raw: HashMap::new(),
                    streams: Vec::new(),
                    calls: HashMap::new(),
                    failures: HashMap::new(),
                    latency: HashMap::new(),
                    next_id: 0,
                    clock: Utc
                        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                        .single()
                        .expect("valid timestamp"),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signer(&self) -> &ServerSigner {
        &self.inner.signer
    }

    pub fn server_info(&self) -> ServerInfo {
        self.state().server_info.clone()
    }

    pub fn set_server_info(&self, server_info: ServerInfo) {
        self.state().server_info = server_info;
    }

    pub fn set_supports_push(&self, supports_push: bool) {
        self.state().server_info.supports_push = supports_push;
    }

    pub fn set_api_key_valid(&self, valid: bool) {
        self.state().api_key_valid = valid;
    }

    /// When disabled, opening an event stream fails with a network error.
    pub fn set_streams_available(&self, available: bool) {
        self.state().streams_available = available;
    }

    /// Registers an inbox directly on the server and returns its descriptor.
    pub fn create_test_inbox(&self, email_address: &str) -> InboxDescriptor {
        let keypair = Keypair::generate().expect("ml-kem key generation");
        let mut state = self.state();
        let inbox_hash = format!("hash-{}", state.next_id());
        state.inboxes.insert(
            email_address.to_string(),
            MockInbox {
                inbox_hash: inbox_hash.clone(),
                public_key: *keypair.public_key(),
                emails: Vec::new(),
            },
        );
        let expires_at = state.clock + chrono::Duration::hours(1);

        InboxDescriptor::new(
            email_address,
            inbox_hash,
            expires_at,
            keypair,
            *self.inner.signer.public_key(),
        )
    }

    /// Stores a new email sealed by the server key and notifies open event streams.
    pub fn deliver(&self, email_address: &str, email: TestEmail) -> String {
        self.store(email_address, email, false)
    }

    /// Stores a new email signed by a key the client never pinned.
    pub fn deliver_forged(&self, email_address: &str, email: TestEmail) -> String {
        self.store(email_address, email, true)
    }

    fn store(&self, email_address: &str, email: TestEmail, forged: bool) -> String {
        let signer = if forged {
            &self.inner.forger
        } else {
            &self.inner.signer
        };

        let mut state = self.state();
        let id = format!("email-{}", state.next_id());
        state.clock += chrono::Duration::seconds(1);
        let received_at = state.clock;

        let inbox = state
            .inboxes
            .get_mut(email_address)
            .expect("inbox exists on mock server");

        let to = if email.to.is_empty() {
            vec![email_address.to_string()]
        } else {
            email.to.clone()
        };
        let metadata = MetadataPlaintext {
            from: email.from.clone(),
            to: Recipients::Many(to),
            subject: email.subject.clone(),
            received_at: Some(received_at),
        };
        let parsed = ParsedPlaintext {
            text: email.text.clone(),
            html: email.html.clone(),
            headers: [("Subject".to_string(), email.subject.clone())].into(),
            attachments: email.attachments.clone(),
            links: email.links.clone(),
            auth_results: email.auth_results.clone(),
        };

        let seal = |plaintext: &[u8], aad: &[u8]| signer.seal(plaintext, &inbox.public_key, aad);
        let encrypted_metadata = seal(&json_bytes(&metadata), b"metadata");
        let encrypted_parsed = seal(&json_bytes(&parsed), b"parsed");
        let encrypted_raw = seal(email.raw(email_address).as_bytes(), b"raw");

        let encrypted = EncryptedEmail {
            id: id.clone(),
            inbox_id: inbox.inbox_hash.clone(),
            received_at,
            is_read: false,
            encrypted_metadata,
            encrypted_parsed: Some(encrypted_parsed),
        };
        let event = PushEvent {
            inbox_id: inbox.inbox_hash.clone(),
            email_id: id.clone(),
            encrypted_metadata: Some(encrypted.encrypted_metadata.clone()),
        };
        inbox.emails.push(encrypted);
        state.raw.insert(id.clone(), encrypted_raw);

        state.notify(&event);
        id
    }

    /// Removes an email without going through the API.
    pub fn remove_email(&self, email_address: &str, email_id: &str) {
        if let Some(inbox) = self.state().inboxes.get_mut(email_address) {
            inbox.emails.retain(|email| email.id != email_id);
        }
    }

    /// Push notification the server sends for a stored email.
    pub fn push_event(&self, email_address: &str, email_id: &str) -> PushEvent {
        let state = self.state();
        let inbox = state
            .inboxes
            .get(email_address)
            .expect("inbox exists on mock server");
        let email = inbox
            .emails
            .iter()
            .find(|email| email.id == email_id)
            .expect("email exists on mock server");

        PushEvent {
            inbox_id: inbox.inbox_hash.clone(),
            email_id: email.id.clone(),
            encrypted_metadata: Some(email.encrypted_metadata.clone()),
        }
    }

    /// Sends raw bytes to every open event stream.
    pub fn send_raw_event(&self, bytes: &'static [u8]) {
        self.state()
            .streams
            .retain(|stream| stream.tx.send(Ok(Bytes::from_static(bytes))).is_ok());
    }

    /// Terminates all open event streams.
    pub fn drop_streams(&self) {
        self.state().streams.clear();
    }

    /// Terminates all open event streams with an error.
    pub fn fail_streams(&self) {
        let streams = std::mem::take(&mut self.state().streams);
        for stream in streams {
            let _ = stream
                .tx
                .send(Err(TransportError::Network("connection reset".into())));
        }
    }

    pub fn open_streams(&self) -> usize {
        let mut state = self.state();
        state.streams.retain(|stream| !stream.tx.is_closed());
        state.streams.len()
    }

    /// Inbox hashes of the most recently opened event stream.
    pub fn stream_hashes(&self) -> Option<Vec<String>> {
        self.state()
            .streams
            .last()
            .map(|stream| stream.inbox_hashes.clone())
    }

    /// Waits until at least the given number of event streams is open.
    pub async fn wait_for_streams(&self, count: usize) {
        while self.open_streams() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn has_inbox(&self, email_address: &str) -> bool {
        self.state().inboxes.contains_key(email_address)
    }

    /// Number of calls to the given endpoint, named like the [`ApiTransport`] method.
    pub fn calls(&self, endpoint: &str) -> usize {
        self.state().calls.get(endpoint).copied().unwrap_or_default()
    }

    /// Lets the next call to the given endpoint fail with a network error.
    pub fn fail_next(&self, endpoint: &'static str) {
        *self.state().failures.entry(endpoint).or_default() += 1;
    }

    /// Delays every following call to the given endpoint.
    pub fn set_latency(&self, endpoint: &'static str, latency: Duration) {
        self.state().latency.insert(endpoint, latency);
    }

    async fn delay(&self, endpoint: &'static str) {
        let latency = self.state().latency.get(endpoint).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn record(&self, endpoint: &'static str) -> Result<MutexGuard<'_, MockState>, TransportError> {
        let mut state = self.state();
        *state.calls.entry(endpoint).or_default() += 1;

        if let Some(remaining) = state.failures.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Network(format!("injected failure in {endpoint}")));
            }
        }

        if !state.api_key_valid {
            return Err(TransportError::Unauthorized);
        }

        Ok(state)
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer").finish_non_exhaustive()
    }
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn inbox(&self, email_address: &str) -> Result<&MockInbox, TransportError> {
        self.inboxes
            .get(email_address)
            .ok_or(TransportError::InboxNotFound)
    }

    fn inbox_mut(&mut self, email_address: &str) -> Result<&mut MockInbox, TransportError> {
        self.inboxes
            .get_mut(email_address)
            .ok_or(TransportError::InboxNotFound)
    }

    fn notify(&mut self, event: &PushEvent) {
        let data = serde_json::to_string(event).expect("serializable event");
        let frame = Bytes::from(format!("event: {EMAIL_EVENT}\ndata: {data}\n\n"));
        self.streams.retain(|stream| {
            if !stream.inbox_hashes.contains(&event.inbox_id) {
                return !stream.tx.is_closed();
            }
            stream.tx.send(Ok(frame.clone())).is_ok()
        });
    }
}

impl MockInbox {
    fn emails_hash(&self) -> String {
        let mut ids: Vec<&str> = self.emails.iter().map(|email| email.id.as_str()).collect();
        ids.sort_unstable();
        codec::encode_url(sha2_256(&[ids.join(",").as_bytes()]))
    }

    fn email(&self, email_id: &str) -> Result<&EncryptedEmail, TransportError> {
        self.emails
            .iter()
            .find(|email| email.id == email_id)
            .ok_or(TransportError::EmailNotFound)
    }
}

fn json_bytes<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("serializable plaintext")
}

#[async_trait]
impl ApiTransport for MockServer {
    async fn check_key(&self) -> Result<(), TransportError> {
        self.record("check_key")?;
        Ok(())
    }

    async fn get_server_info(&self) -> Result<ServerInfo, TransportError> {
        let state = self.record("get_server_info")?;
        Ok(state.server_info.clone())
    }

    async fn create_inbox(
        &self,
        request: CreateInboxRequest,
    ) -> Result<CreateInboxResponse, TransportError> {
        let mut state = self.record("create_inbox")?;

        let public_key = codec::decode_url_fixed::<{ ml_kem::PUBLIC_KEY_SIZE }>(
            &request.client_kem_pk,
        )
        .map_err(|err| TransportError::Permanent {
            status: 400,
            message: err.to_string(),
        })?;

        let id = state.next_id();
        let email_address = request
            .email_address
            .unwrap_or_else(|| format!("inbox-{id}@vaultsandbox.test"));
        if state.inboxes.contains_key(&email_address) {
            return Err(TransportError::Conflict);
        }

        let inbox_hash = format!("hash-{id}");
        state.inboxes.insert(
            email_address.clone(),
            MockInbox {
                inbox_hash: inbox_hash.clone(),
                public_key,
                emails: Vec::new(),
            },
        );

        let ttl = i64::try_from(request.ttl).unwrap_or(i64::MAX);
        Ok(CreateInboxResponse {
            email_address,
            expires_at: state.clock + chrono::Duration::seconds(ttl),
            inbox_hash,
            server_sig_pk: self.inner.signer.public_key_b64(),
        })
    }

    async fn delete_inbox(&self, email_address: &str) -> Result<(), TransportError> {
        let mut state = self.record("delete_inbox")?;
        state
            .inboxes
            .remove(email_address)
            .map(|_| ())
            .ok_or(TransportError::InboxNotFound)
    }

    async fn delete_all_inboxes(&self) -> Result<u64, TransportError> {
        let mut state = self.record("delete_all_inboxes")?;
        let count = state.inboxes.len() as u64;
        state.inboxes.clear();
        Ok(count)
    }

    async fn get_inbox_sync(&self, email_address: &str) -> Result<SyncStatus, TransportError> {
        self.delay("get_inbox_sync").await;
        let state = self.record("get_inbox_sync")?;
        let inbox = state.inbox(email_address)?;
        Ok(SyncStatus {
            email_count: inbox.emails.len() as u64,
            emails_hash: inbox.emails_hash(),
        })
    }

    async fn list_emails(
        &self,
        email_address: &str,
    ) -> Result<Vec<EncryptedEmail>, TransportError> {
        let state = self.record("list_emails")?;
        Ok(state.inbox(email_address)?.emails.clone())
    }

    async fn list_emails_metadata_only(
        &self,
        email_address: &str,
    ) -> Result<Vec<EmailMetadata>, TransportError> {
        self.delay("list_emails_metadata_only").await;
        let state = self.record("list_emails_metadata_only")?;
        Ok(state
            .inbox(email_address)?
            .emails
            .iter()
            .map(EmailMetadata::from)
            .collect())
    }

    async fn get_email(
        &self,
        email_address: &str,
        email_id: &str,
    ) -> Result<EncryptedEmail, TransportError> {
        self.delay("get_email").await;
        let state = self.record("get_email")?;
        Ok(state.inbox(email_address)?.email(email_id)?.clone())
    }

    async fn get_email_raw(
        &self,
        email_address: &str,
        email_id: &str,
    ) -> Result<EncryptedRaw, TransportError> {
        let state = self.record("get_email_raw")?;
        state.inbox(email_address)?.email(email_id)?;
        let encrypted_raw = state
            .raw
            .get(email_id)
            .cloned()
            .ok_or(TransportError::EmailNotFound)?;
        Ok(EncryptedRaw {
            id: email_id.to_string(),
            encrypted_raw,
        })
    }

    async fn mark_email_read(
        &self,
        email_address: &str,
        email_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.record("mark_email_read")?;
        let email = state
            .inbox_mut(email_address)?
            .emails
            .iter_mut()
            .find(|email| email.id == email_id)
            .ok_or(TransportError::EmailNotFound)?;
        email.is_read = true;
        Ok(())
    }

    async fn delete_email(&self, email_address: &str, email_id: &str) -> Result<(), TransportError> {
        let mut state = self.record("delete_email")?;
        let inbox = state.inbox_mut(email_address)?;
        let before = inbox.emails.len();
        inbox.emails.retain(|email| email.id != email_id);
        if inbox.emails.len() == before {
            return Err(TransportError::EmailNotFound);
        }
        Ok(())
    }

    async fn open_event_stream(
        &self,
        inbox_hashes: Vec<String>,
    ) -> Result<EventStream, TransportError> {
        let mut state = self.record("open_event_stream")?;
        if !state.streams_available {
            return Err(TransportError::Network("event stream unavailable".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.push(MockStream { inbox_hashes, tx });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
