// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand_chacha::ChaCha20Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vaultsandbox_core::codec::{self, CodecError};
use vaultsandbox_core::crypto::ml_dsa;
use vaultsandbox_core::envelope::CONTEXT;
use vaultsandbox_core::{ExportedInbox, InboxDescriptor, Keypair, ServerKey};

use crate::backoff;
use crate::builder::ClientBuilder;
use crate::error::Error;
use crate::fanout::{Fanout, Subscription};
use crate::inbox::Inbox;
use crate::strategy::{DeliveryMode, DeliveryStrategy, PollStrategy, PushStrategy};
use crate::sync::{EmailEvent, InboxState, SyncEngine};
use crate::transport::{ApiTransport, CreateInboxRequest, ServerInfo};

/// Client of a VaultSandbox server.
///
/// Manages a set of inboxes, keeps them up to date in the background and delivers new emails to
/// subscribers. Cloning is cheap, all clones share the same state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn ApiTransport>,
    pub(crate) engine: SyncEngine,
    pub(crate) config: Config,
    server_info: ServerInfo,
    server_key: ServerKey,
    mode: DeliveryMode,
    strategy: Box<dyn DeliveryStrategy>,
    events: Fanout<EmailEvent>,
    inboxes: RwLock<HashMap<String, Arc<InboxState>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    fn read_inboxes(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<InboxState>>> {
        self.inboxes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inboxes(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<InboxState>>> {
        self.inboxes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Options to create an inbox with.
#[derive(Clone, Debug, Default)]
pub struct CreateInboxOptions {
    /// Lifetime of the inbox, the server default is used when not set.
    pub ttl: Option<Duration>,

    /// Requested address, the server picks a random one when not set.
    pub email_address: Option<String>,
}

impl CreateInboxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn email_address(mut self, email_address: impl Into<String>) -> Self {
        self.email_address = Some(email_address.into());
        self
    }
}

impl Client {
    pub fn builder<T: ApiTransport>(transport: T) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    pub(crate) async fn open_inner(
        transport: Arc<dyn ApiTransport>,
        config: Config,
        rng: Option<ChaCha20Rng>,
    ) -> Result<Self, Error> {
        config.validate()?;
        if config.check_key {
            transport.check_key().await?;
        }

        let server_info = transport.get_server_info().await?;
        if !server_info.algs.is_supported() {
            let algs = &server_info.algs;
            return Err(Error::AlgorithmMismatch(format!(
                "{}, {}, {}, {}",
                algs.kem, algs.sig, algs.aead, algs.kdf
            )));
        }
        if server_info.context != CONTEXT {
            return Err(Error::AlgorithmMismatch(format!(
                "context {}",
                server_info.context
            )));
        }
        let server_key = decode_server_key(&server_info.server_sig_pk)?;

        let mode = config.delivery.resolve(&server_info);
        let cancel = CancellationToken::new();
        let events = Fanout::new();
        let engine = SyncEngine::new(transport.clone(), events.clone(), config.push_fast_path);

        let strategy: Box<dyn DeliveryStrategy> = match (mode, rng) {
            (DeliveryMode::Push, None) => Box::new(PushStrategy::new(
                engine.clone(),
                config.reconnect.clone(),
                cancel.child_token(),
                config.shutdown_grace,
            )),
            (DeliveryMode::Push, Some(rng)) => Box::new(PushStrategy::with_rng(
                engine.clone(),
                config.reconnect.clone(),
                cancel.child_token(),
                config.shutdown_grace,
                rng,
            )),
            (DeliveryMode::Poll | DeliveryMode::Auto, None) => Box::new(PollStrategy::new(
                engine.clone(),
                config.poll.clone(),
                cancel.child_token(),
                config.shutdown_grace,
            )),
            (DeliveryMode::Poll | DeliveryMode::Auto, Some(rng)) => {
                Box::new(PollStrategy::with_rng(
                    engine.clone(),
                    config.poll.clone(),
                    cancel.child_token(),
                    config.shutdown_grace,
                    rng,
                ))
            }
        };
        strategy.start();

        debug!(strategy = strategy.name(), "client ready");

        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                engine,
                config,
                server_info,
                server_key,
                mode,
                strategy,
                events,
                inboxes: RwLock::new(HashMap::new()),
                cancel,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a new inbox on the server and starts watching it.
    pub async fn create_inbox(&self, options: CreateInboxOptions) -> Result<Inbox, Error> {
        self.inner.ensure_open()?;

        let info = &self.inner.server_info;
        let ttl = options
            .ttl
            .map(|ttl| ttl.as_secs())
            .unwrap_or(info.default_ttl);
        if ttl == 0 || ttl > info.max_ttl {
            return Err(Error::InvalidTtl {
                ttl,
                max: info.max_ttl,
            });
        }

        let keypair = Keypair::generate()?;
        let response = self
            .inner
            .transport
            .create_inbox(CreateInboxRequest {
                client_kem_pk: codec::encode_url(keypair.public_key()),
                ttl,
                email_address: options.email_address,
            })
            .await?;

        let server_key = decode_server_key(&response.server_sig_pk)?;
        if server_key != self.inner.server_key {
            warn!(
                inbox = %response.email_address,
                "inbox pinned to a server key which differs from the advertised one"
            );
        }

        let descriptor = InboxDescriptor::new(
            response.email_address,
            response.inbox_hash,
            response.expires_at,
            keypair,
            server_key,
        );
        self.register(descriptor)
    }

    /// Restores an exported inbox and starts watching it.
    ///
    /// The inbox must still exist on the server.
    pub async fn import_inbox(&self, exported: ExportedInbox) -> Result<Inbox, Error> {
        self.inner.ensure_open()?;

        let descriptor = InboxDescriptor::import(&exported)?;
        if self
            .inner
            .read_inboxes()
            .contains_key(&descriptor.email_address)
        {
            return Err(Error::InboxAlreadyExists);
        }

        if descriptor.server_sig_pk != self.inner.server_key {
            warn!(
                inbox = %descriptor.email_address,
                "server key changed since the inbox was exported, its emails can not be verified"
            );
        }

        self.inner
            .transport
            .get_inbox_sync(&descriptor.email_address)
            .await?;

        self.register(descriptor)
    }

    /// Returns the export blob of a managed inbox, including its secret key.
    pub fn export_inbox(&self, email_address: &str) -> Result<ExportedInbox, Error> {
        self.inbox(email_address)?.export()
    }

    /// Deletes the inbox on the server and stops watching it.
    pub async fn delete_inbox(&self, email_address: &str) -> Result<(), Error> {
        self.inner.ensure_open()?;
        self.inner.transport.delete_inbox(email_address).await?;
        self.unregister(email_address);
        Ok(())
    }

    /// Deletes all inboxes of this api key on the server, returns how many were deleted.
    pub async fn delete_all_inboxes(&self) -> Result<u64, Error> {
        self.inner.ensure_open()?;
        let count = self.inner.transport.delete_all_inboxes().await?;

        let addresses: Vec<String> = self.inner.read_inboxes().keys().cloned().collect();
        for address in addresses {
            self.unregister(&address);
        }

        Ok(count)
    }

    pub fn inbox(&self, email_address: &str) -> Result<Inbox, Error> {
        self.inner.ensure_open()?;
        let state = self
            .inner
            .read_inboxes()
            .get(email_address)
            .cloned()
            .ok_or(Error::InboxNotFound)?;
        Ok(Inbox::new(state, self.inner.clone()))
    }

    /// All managed inboxes, in no particular order.
    pub fn inboxes(&self) -> Result<Vec<Inbox>, Error> {
        self.inner.ensure_open()?;
        Ok(self
            .inner
            .read_inboxes()
            .values()
            .map(|state| Inbox::new(state.clone(), self.inner.clone()))
            .collect())
    }

    pub fn server_info(&self) -> Result<ServerInfo, Error> {
        self.inner.ensure_open()?;
        Ok(self.inner.server_info.clone())
    }

    /// Strategy the client uses to learn about new emails.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.inner.mode
    }

    /// Subscribes to the emails of all managed inboxes.
    pub fn subscribe_all(&self) -> Result<Subscription<EmailEvent>, Error> {
        self.inner.ensure_open()?;
        Ok(self.inner.events.subscribe())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops all background tasks and ends every subscription.
    ///
    /// Every operation fails with [`Error::ClientClosed`] afterwards. Calling it again does
    /// nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.cancel.cancel();
        self.inner.strategy.stop().await;

        let inboxes: Vec<_> = self.inner.write_inboxes().drain().collect();
        for (_, inbox) in inboxes {
            inbox.close();
        }
        self.inner.events.close();

        debug!("client closed");
    }

    fn register(&self, descriptor: InboxDescriptor) -> Result<Inbox, Error> {
        let mut inboxes = self.inner.write_inboxes();
        // Checked again under the lock, `close` might have run in the meantime.
        self.inner.ensure_open()?;
        if inboxes.contains_key(&descriptor.email_address) {
            return Err(Error::InboxAlreadyExists);
        }

        let state = Arc::new(InboxState::new(descriptor));
        inboxes.insert(state.email_address().to_string(), state.clone());
        self.inner.strategy.add(state.clone());

        debug!(inbox = %state.email_address(), "added inbox");
        Ok(Inbox::new(state, self.inner.clone()))
    }

    fn unregister(&self, email_address: &str) {
        let mut inboxes = self.inner.write_inboxes();
        let Some(state) = inboxes.remove(email_address) else {
            return;
        };
        self.inner.strategy.remove(state.inbox_hash());
        state.close();

        debug!(inbox = %email_address, "removed inbox");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mode", &self.inner.mode)
            .field("strategy", &self.inner.strategy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn decode_server_key(value: &str) -> Result<ServerKey, Error> {
    codec::decode_url_fixed::<{ ml_dsa::PUBLIC_KEY_SIZE }>(value).map_err(|err| match err {
        CodecError::InvalidBase64(message) => Error::BadEncoding(message),
        CodecError::InvalidLength { expected, actual } => Error::SizeMismatch {
            field: "server_sig_pk",
            expected,
            actual,
        },
    })
}

#[derive(Clone, Debug)]
pub struct Config {
    pub delivery: DeliveryMode,

    /// Validate the api key when opening the client.
    pub check_key: bool,

    /// Interval of the poll strategy.
    pub poll: backoff::Config,

    /// Delay between reconnects of the push strategy.
    pub reconnect: backoff::Config,

    pub push_fast_path: bool,

    /// How long to wait for background tasks when closing.
    pub shutdown_grace: Duration,

    /// Used by waiters which do not set their own timeout.
    pub default_wait_timeout: Duration,
}

impl Config {
    /// Rejects backoff settings which could not produce valid delays.
    pub fn validate(&self) -> Result<(), Error> {
        self.poll
            .validate()
            .map_err(|source| Error::InvalidConfig {
                field: "poll",
                source,
            })?;
        self.reconnect
            .validate()
            .map_err(|source| Error::InvalidConfig {
                field: "reconnect",
                source,
            })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Auto,
            check_key: true,
            poll: backoff::Config::poll(),
            reconnect: backoff::Config::reconnect(),
            push_fast_path: false,
            shutdown_grace: Duration::from_secs(5),
            default_wait_timeout: Duration::from_secs(30),
        }
    }
}
