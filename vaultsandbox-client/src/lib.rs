// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery engine and client for end-to-end encrypted VaultSandbox inboxes.
//!
//! A [`Client`] talks to the server through an [`ApiTransport`] implementation, manages a set of
//! inboxes and keeps them up to date in the background, either by listening to a server-sent
//! event stream or by polling. New emails are verified against the pinned server key, decrypted
//! and delivered exactly once to every subscriber of their inbox.
//!
//! ```ignore
//! let client = Client::builder(transport).open().await?;
//! let inbox = client.create_inbox(CreateInboxOptions::default()).await?;
//!
//! let email = inbox
//!     .wait_for_email(&EmailFilter::new().subject("Welcome"), WaitOptions::default())
//!     .await?;
//!
//! client.close().await;
//! ```
pub mod backoff;
mod builder;
mod client;
pub mod error;
pub mod fanout;
mod inbox;
pub mod seen;
pub mod sse;
pub mod strategy;
pub mod sync;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod transport;
pub mod waiter;

pub use builder::ClientBuilder;
pub use client::{Client, Config, CreateInboxOptions};
pub use error::{Error, ErrorKind};
pub use fanout::{CancelHandle, Fanout, Subscription};
pub use inbox::Inbox;
pub use strategy::DeliveryMode;
pub use sync::{EmailEvent, SyncOutcome};
pub use transport::{ApiTransport, ServerInfo, SyncStatus, TransportError};
pub use waiter::{EmailFilter, WaitOptions};
