// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interface to the VaultSandbox REST API and the data it exchanges.
//!
//! The client does not build HTTP requests itself. Any implementation of [`ApiTransport`] can be
//! plugged in, it is responsible for authentication, retries and mapping HTTP status codes onto
//! [`TransportError`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::bytes::Bytes;
use vaultsandbox_core::{AlgorithmSuite, EncryptedPayload};

/// Raw bytes of the server-sent event stream.
pub type EventStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[async_trait]
pub trait ApiTransport: Send + Sync + 'static {
    /// Checks that the configured api key is accepted.
    async fn check_key(&self) -> Result<(), TransportError>;

    async fn get_server_info(&self) -> Result<ServerInfo, TransportError>;

    async fn create_inbox(
        &self,
        request: CreateInboxRequest,
    ) -> Result<CreateInboxResponse, TransportError>;

    async fn delete_inbox(&self, email_address: &str) -> Result<(), TransportError>;

    /// Deletes every inbox of the api key and returns how many were removed.
    async fn delete_all_inboxes(&self) -> Result<u64, TransportError>;

    async fn get_inbox_sync(&self, email_address: &str) -> Result<SyncStatus, TransportError>;

    async fn list_emails(&self, email_address: &str)
    -> Result<Vec<EncryptedEmail>, TransportError>;

    async fn list_emails_metadata_only(
        &self,
        email_address: &str,
    ) -> Result<Vec<EmailMetadata>, TransportError>;

    async fn get_email(
        &self,
        email_address: &str,
        email_id: &str,
    ) -> Result<EncryptedEmail, TransportError>;

    async fn get_email_raw(
        &self,
        email_address: &str,
        email_id: &str,
    ) -> Result<EncryptedRaw, TransportError>;

    async fn mark_email_read(
        &self,
        email_address: &str,
        email_id: &str,
    ) -> Result<(), TransportError>;

    async fn delete_email(&self, email_address: &str, email_id: &str)
    -> Result<(), TransportError>;

    /// Opens the server-sent event stream for the given inbox hashes.
    async fn open_event_stream(
        &self,
        inbox_hashes: Vec<String>,
    ) -> Result<EventStream, TransportError>;
}

/// Capabilities and keys advertised by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_sig_pk: String,
    pub algs: AlgorithmSuite,
    pub context: String,
    /// Longest accepted inbox lifetime in seconds.
    pub max_ttl: u64,
    /// Inbox lifetime in seconds used when none is requested.
    pub default_ttl: u64,
    #[serde(default)]
    pub supports_push: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInboxRequest {
    /// ML-KEM-768 public key of the inbox, base64url.
    pub client_kem_pk: String,
    /// Inbox lifetime in seconds.
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInboxResponse {
    pub email_address: String,
    pub expires_at: DateTime<Utc>,
    pub inbox_hash: String,
    pub server_sig_pk: String,
}

/// Number of stored emails and a hash over their IDs, changes whenever an email arrives or gets
/// deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub email_count: u64,
    pub emails_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEmail {
    pub id: String,
    pub inbox_id: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    pub encrypted_metadata: EncryptedPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_parsed: Option<EncryptedPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMetadata {
    pub id: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl From<&EncryptedEmail> for EmailMetadata {
    fn from(value: &EncryptedEmail) -> Self {
        Self {
            id: value.id.clone(),
            received_at: value.received_at,
            is_read: value.is_read,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRaw {
    pub id: String,
    pub encrypted_raw: EncryptedPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("api key was rejected")]
    Unauthorized,

    #[error("no api key configured")]
    MissingCredentials,

    #[error("inbox not found")]
    InboxNotFound,

    #[error("email not found")]
    EmailNotFound,

    #[error("resource already exists")]
    Conflict,

    #[error("temporary server error {status}: {message}")]
    Transient { status: u16, message: String },

    #[error("server error {status}: {message}")]
    Permanent { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode response: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EncryptedEmail, ServerInfo};

    #[test]
    fn server_info_json() {
        let info: ServerInfo = serde_json::from_value(json!({
            "serverSigPk": "abc",
            "algs": {
                "kem": "ML-KEM-768",
                "sig": "ML-DSA-65",
                "aead": "AES-256-GCM",
                "kdf": "HKDF-SHA-512",
            },
            "context": "vaultsandbox:email:v1",
            "maxTtl": 604800,
            "defaultTtl": 3600,
        }))
        .unwrap();

        assert_eq!(info.max_ttl, 604_800);
        assert!(!info.supports_push);
        assert!(info.allowed_domains.is_empty());
    }

    #[test]
    fn encrypted_email_json() {
        let payload = json!({
            "v": 1,
            "algs": { "kem": "a", "sig": "b", "aead": "c", "kdf": "d" },
            "ctKem": "",
            "nonce": "",
            "aad": "",
            "ciphertext": "",
            "sig": "",
            "serverSigPk": "",
        });
        let email: EncryptedEmail = serde_json::from_value(json!({
            "id": "msg-1",
            "inboxId": "hash",
            "receivedAt": "2024-01-01T10:00:00Z",
            "encryptedMetadata": payload,
        }))
        .unwrap();

        assert_eq!(email.id, "msg-1");
        assert!(!email.is_read);
        assert!(email.encrypted_parsed.is_none());
    }
}
