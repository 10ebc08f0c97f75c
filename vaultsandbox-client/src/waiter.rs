// SPDX-License-Identifier: MIT OR Apache-2.0

//! Waiting for emails matching a filter.
//!
//! A waiter subscribes to the inbox before it scans the current contents, so an email arriving
//! between the scan and the subscription can not be missed. Emails seen in both the scan and
//! the subscription count once.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use vaultsandbox_core::DecryptedEmail;

use crate::error::Error;
use crate::sync::{InboxState, SyncEngine};

type Predicate = Arc<dyn Fn(&DecryptedEmail) -> bool + Send + Sync>;

/// Conditions an email has to meet. All configured conditions must hold, an empty filter
/// matches every email.
#[derive(Clone, Default)]
pub struct EmailFilter {
    subject: Option<String>,
    subject_pattern: Option<Regex>,
    from: Option<String>,
    from_pattern: Option<Regex>,
    predicate: Option<Predicate>,
}

impl EmailFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subject equals the given string.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Subject matches the given regular expression.
    pub fn subject_matches(mut self, pattern: Regex) -> Self {
        self.subject_pattern = Some(pattern);
        self
    }

    /// Sender equals the given string.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sender matches the given regular expression.
    pub fn from_matches(mut self, pattern: Regex) -> Self {
        self.from_pattern = Some(pattern);
        self
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DecryptedEmail) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, email: &DecryptedEmail) -> bool {
        self.subject
            .as_ref()
            .is_none_or(|subject| email.subject == *subject)
            && self
                .subject_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(&email.subject))
            && self.from.as_ref().is_none_or(|from| email.from == *from)
            && self
                .from_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(&email.from))
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(email))
    }
}

impl std::fmt::Debug for EmailFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailFilter")
            .field("subject", &self.subject)
            .field("subject_pattern", &self.subject_pattern)
            .field("from", &self.from)
            .field("from_pattern", &self.from_pattern)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// How long to wait and how to give up early.
#[derive(Clone, Debug, Default)]
pub struct WaitOptions {
    /// Falls back to the default wait timeout of the client when not set.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Waits for the first email of the inbox matching the filter, including emails received before.
pub async fn wait_first(
    engine: &SyncEngine,
    inbox: &InboxState,
    filter: &EmailFilter,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Arc<DecryptedEmail>, Error> {
    let mut emails = wait_n(engine, inbox, 1, filter, timeout, cancel).await?;
    emails.pop().ok_or(Error::ClientClosed)
}

/// Waits until `count` distinct emails of the inbox match the filter.
///
/// Emails are returned in the order they were found: first the already received ones, oldest
/// first, then new ones as they are delivered.
pub async fn wait_n(
    engine: &SyncEngine,
    inbox: &InboxState,
    count: usize,
    filter: &EmailFilter,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<DecryptedEmail>>, Error> {
    let mut found = Found::new(count, filter);
    if found.is_complete() {
        return Ok(found.emails);
    }

    let deadline = Instant::now() + timeout;
    let mut subscription = inbox.fanout().subscribe();

    let current = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        _ = tokio::time::sleep_until(deadline) => return Err(Error::DeadlineExceeded),
        result = engine.current_emails(inbox) => result?,
    };
    for email in current {
        if found.push(Arc::new(email)) {
            trace!(inbox = %inbox.email_address(), "found matching emails in inbox");
            return Ok(found.emails);
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(Error::DeadlineExceeded),
            email = subscription.recv() => {
                let Some(email) = email else {
                    return Err(Error::ClientClosed);
                };
                if found.push(email) {
                    return Ok(found.emails);
                }
            }
        }
    }
}

struct Found<'a> {
    count: usize,
    filter: &'a EmailFilter,
    ids: HashSet<String>,
    emails: Vec<Arc<DecryptedEmail>>,
}

impl<'a> Found<'a> {
    fn new(count: usize, filter: &'a EmailFilter) -> Self {
        Self {
            count,
            filter,
            ids: HashSet::new(),
            emails: Vec::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.emails.len() >= self.count
    }

    /// Returns true once enough emails were found.
    fn push(&mut self, email: Arc<DecryptedEmail>) -> bool {
        if self.filter.matches(&email) && self.ids.insert(email.id.clone()) {
            self.emails.push(email);
        }
        self.is_complete()
    }
}
