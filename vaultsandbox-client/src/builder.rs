// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use rand_chacha::ChaCha20Rng;

use crate::backoff;
use crate::client::{Client, Config};
use crate::error::Error;
use crate::strategy::DeliveryMode;
use crate::transport::ApiTransport;

/// Configures and opens a [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn ApiTransport>,
    config: Config,
    rng: Option<ChaCha20Rng>,
}

impl ClientBuilder {
    pub fn new<T: ApiTransport>(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn ApiTransport>) -> Self {
        Self {
            transport,
            config: Config::default(),
            rng: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn delivery(mut self, mode: DeliveryMode) -> Self {
        self.config.delivery = mode;
        self
    }

    /// Validate the api key before anything else when opening the client.
    pub fn check_key(mut self, value: bool) -> Self {
        self.config.check_key = value;
        self
    }

    pub fn poll(mut self, config: backoff::Config) -> Self {
        self.config.poll = config;
        self
    }

    pub fn reconnect(mut self, config: backoff::Config) -> Self {
        self.config.reconnect = config;
        self
    }

    /// Deliver pushed emails directly after authenticating the metadata of the notification,
    /// instead of syncing the whole inbox.
    pub fn push_fast_path(mut self, value: bool) -> Self {
        self.config.push_fast_path = value;
        self
    }

    pub fn shutdown_grace(mut self, duration: Duration) -> Self {
        self.config.shutdown_grace = duration;
        self
    }

    pub fn default_wait_timeout(mut self, duration: Duration) -> Self {
        self.config.default_wait_timeout = duration;
        self
    }

    /// Seeds the jitter of all timers, mostly useful for tests.
    pub fn rng(mut self, rng: ChaCha20Rng) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Checks the server, starts the delivery strategy and returns the ready client.
    pub async fn open(self) -> Result<Client, Error> {
        Client::open_inner(self.transport, self.config, self.rng).await
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
