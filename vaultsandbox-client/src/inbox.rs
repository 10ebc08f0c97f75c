// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use chrono::{DateTime, Utc};
use vaultsandbox_core::{DecryptedEmail, ExportedInbox, envelope};

use crate::client::ClientInner;
use crate::error::Error;
use crate::fanout::Subscription;
use crate::sync::{InboxState, SyncOutcome, open_email};
use crate::transport::SyncStatus;
use crate::waiter::{self, EmailFilter, WaitOptions};

/// Handle to one inbox managed by a [`Client`](crate::Client).
///
/// Every operation fails with [`Error::ClientClosed`] once the client was closed.
#[derive(Clone)]
pub struct Inbox {
    state: Arc<InboxState>,
    client: Arc<ClientInner>,
}

impl Inbox {
    pub(crate) fn new(state: Arc<InboxState>, client: Arc<ClientInner>) -> Self {
        Self { state, client }
    }

    pub fn email_address(&self) -> &str {
        self.state.email_address()
    }

    pub fn inbox_hash(&self) -> &str {
        self.state.inbox_hash()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.state.descriptor().expires_at
    }

    /// Emails-hash stored by the last sync in which every email could be opened.
    pub fn emails_hash(&self) -> Option<String> {
        self.state.seen().emails_hash().map(str::to_owned)
    }

    /// All emails currently in the inbox which could be verified and decrypted, oldest first.
    pub async fn emails(&self) -> Result<Vec<DecryptedEmail>, Error> {
        self.client.ensure_open()?;
        self.client.engine.current_emails(&self.state).await
    }

    /// Fetches and opens a single email.
    ///
    /// Unlike [`Inbox::emails`] verification and decryption errors are returned as they are.
    pub async fn email(&self, email_id: &str) -> Result<DecryptedEmail, Error> {
        self.client.ensure_open()?;
        let encrypted = self
            .client
            .transport
            .get_email(self.email_address(), email_id)
            .await?;
        open_email(self.state.descriptor(), &encrypted)
    }

    /// Fetches the original RFC 5322 source of an email.
    pub async fn raw_email(&self, email_id: &str) -> Result<String, Error> {
        self.client.ensure_open()?;
        let raw = self
            .client
            .transport
            .get_email_raw(self.email_address(), email_id)
            .await?;

        let descriptor = self.state.descriptor();
        let plaintext = envelope::open(
            &raw.encrypted_raw,
            &descriptor.server_sig_pk,
            &descriptor.keypair,
        )?;
        String::from_utf8(plaintext)
            .map_err(|err| Error::BadEncoding(format!("raw email is not utf-8: {err}")))
    }

    pub async fn mark_read(&self, email_id: &str) -> Result<(), Error> {
        self.client.ensure_open()?;
        Ok(self
            .client
            .transport
            .mark_email_read(self.email_address(), email_id)
            .await?)
    }

    pub async fn delete_email(&self, email_id: &str) -> Result<(), Error> {
        self.client.ensure_open()?;
        Ok(self
            .client
            .transport
            .delete_email(self.email_address(), email_id)
            .await?)
    }

    /// Number of emails and emails-hash as reported by the server.
    pub async fn sync_status(&self) -> Result<SyncStatus, Error> {
        self.client.ensure_open()?;
        Ok(self
            .client
            .transport
            .get_inbox_sync(self.email_address())
            .await?)
    }

    /// Syncs the inbox right away instead of waiting for the delivery strategy.
    pub async fn sync(&self) -> Result<SyncOutcome, Error> {
        self.client.ensure_open()?;
        self.client.engine.sync(&self.state).await
    }

    /// Subscribes to emails delivered to this inbox from now on.
    pub fn subscribe(&self) -> Result<Subscription<Arc<DecryptedEmail>>, Error> {
        self.client.ensure_open()?;
        Ok(self.state.fanout().subscribe())
    }

    /// Waits for the first email matching the filter, including emails received before.
    pub async fn wait_for_email(
        &self,
        filter: &EmailFilter,
        options: WaitOptions,
    ) -> Result<Arc<DecryptedEmail>, Error> {
        self.client.ensure_open()?;
        waiter::wait_first(
            &self.client.engine,
            &self.state,
            filter,
            self.timeout(&options),
            &options.cancel,
        )
        .await
    }

    /// Waits until `count` distinct emails match the filter.
    pub async fn wait_for_email_count(
        &self,
        count: usize,
        filter: &EmailFilter,
        options: WaitOptions,
    ) -> Result<Vec<Arc<DecryptedEmail>>, Error> {
        self.client.ensure_open()?;
        waiter::wait_n(
            &self.client.engine,
            &self.state,
            count,
            filter,
            self.timeout(&options),
            &options.cancel,
        )
        .await
    }

    /// Serializes the inbox including its secret key.
    pub fn export(&self) -> Result<ExportedInbox, Error> {
        self.client.ensure_open()?;
        Ok(self.state.descriptor().export())
    }

    fn timeout(&self, options: &WaitOptions) -> std::time::Duration {
        options
            .timeout
            .unwrap_or(self.client.config.default_wait_timeout)
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("email_address", &self.email_address())
            .field("inbox_hash", &self.inbox_hash())
            .field("expires_at", &self.expires_at())
            .finish()
    }
}
