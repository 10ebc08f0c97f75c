// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inbox descriptors and the portable export format.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::codec::{self, CodecError};
use crate::crypto::ml_dsa;
use crate::envelope::ServerKey;
use crate::keystore::{KeyError, Keypair};

/// Version of the export format.
pub const EXPORT_VERSION: u32 = 1;

/// Everything needed to receive and open the emails of one inbox.
///
/// Created when an inbox gets created or imported and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxDescriptor {
    pub email_address: String,
    pub inbox_hash: String,
    pub expires_at: DateTime<Utc>,
    pub keypair: Keypair,
    pub server_sig_pk: ServerKey,
    pub version: u32,
}

impl InboxDescriptor {
    pub fn new(
        email_address: impl Into<String>,
        inbox_hash: impl Into<String>,
        expires_at: DateTime<Utc>,
        keypair: Keypair,
        server_sig_pk: ServerKey,
    ) -> Self {
        Self {
            email_address: email_address.into(),
            inbox_hash: inbox_hash.into(),
            expires_at,
            keypair,
            server_sig_pk,
            version: EXPORT_VERSION,
        }
    }

    /// Returns true if the inbox expired at the given point in time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Serializes the descriptor into the portable export format, including the secret key.
    pub fn export(&self) -> ExportedInbox {
        ExportedInbox {
            version: self.version,
            email_address: self.email_address.clone(),
            expires_at: self.expires_at,
            inbox_hash: self.inbox_hash.clone(),
            server_sig_pk: codec::encode_url(self.server_sig_pk),
            public_key_b64: codec::encode_url(self.keypair.public_key()),
            secret_key_b64: codec::encode_url(self.keypair.secret_key()),
            exported_at: Utc::now(),
        }
    }

    /// Validates an export blob and restores the descriptor from it.
    pub fn import(exported: &ExportedInbox) -> Result<Self, ExportError> {
        if exported.version != EXPORT_VERSION {
            return Err(ExportError::UnsupportedVersion(exported.version));
        }

        if exported.email_address.trim().is_empty() {
            return Err(ExportError::MissingField("emailAddress"));
        }

        if exported.inbox_hash.trim().is_empty() {
            return Err(ExportError::MissingField("inboxHash"));
        }

        let public_key = decode_field(&exported.public_key_b64, "publicKeyB64")?;
        let secret_key = decode_field(&exported.secret_key_b64, "secretKeyB64")?;
        let keypair = Keypair::from_parts(&public_key, &secret_key)?;

        let server_sig_pk: ServerKey =
            codec::decode_url_fixed::<{ ml_dsa::PUBLIC_KEY_SIZE }>(&exported.server_sig_pk)
                .map_err(|source| ExportError::Encoding {
                    field: "serverSigPk",
                    source,
                })?;

        trace!(inbox = %exported.email_address, "restored inbox from export");

        Ok(Self {
            email_address: exported.email_address.clone(),
            inbox_hash: exported.inbox_hash.clone(),
            expires_at: exported.expires_at,
            keypair,
            server_sig_pk,
            version: exported.version,
        })
    }
}

impl TryFrom<&ExportedInbox> for InboxDescriptor {
    type Error = ExportError;

    fn try_from(value: &ExportedInbox) -> Result<Self, Self::Error> {
        Self::import(value)
    }
}

fn decode_field(value: &str, field: &'static str) -> Result<Vec<u8>, ExportError> {
    codec::decode_url(value).map_err(|source| ExportError::Encoding { field, source })
}

/// Portable, self-contained representation of an inbox.
///
/// Contains the inbox secret key, treat it like a password.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedInbox {
    pub version: u32,
    pub email_address: String,
    pub expires_at: DateTime<Utc>,
    pub inbox_hash: String,
    pub server_sig_pk: String,
    pub public_key_b64: String,
    pub secret_key_b64: String,
    pub exported_at: DateTime<Utc>,
}

impl ExportedInbox {
    pub fn to_json(&self) -> Result<String, ExportError> {
        serde_json::to_string_pretty(self).map_err(ExportError::Json)
    }

    pub fn from_json(value: &str) -> Result<Self, ExportError> {
        serde_json::from_str(value).map_err(ExportError::Json)
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unsupported export version {0}")]
    UnsupportedVersion(u32),

    #[error("export is missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid encoding of {field}: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("invalid export document: {0}")]
    Json(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone, Utc};

    use crate::codec;
    use crate::keystore::{KeyError, Keypair};
    use crate::test_utils::ServerSigner;

    use super::{ExportError, ExportedInbox, InboxDescriptor};

    fn descriptor() -> InboxDescriptor {
        let signer = ServerSigner::generate();
        let expires_at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);
        InboxDescriptor::new(
            "abc@vaultsandbox.test",
            "inbox-hash",
            expires_at,
            Keypair::generate().unwrap(),
            *signer.public_key(),
        )
    }

    #[test]
    fn export_import_round_trip() {
        let descriptor = descriptor();
        let exported = descriptor.export();

        let json = exported.to_json().unwrap();
        for key in [
            "version",
            "emailAddress",
            "expiresAt",
            "inboxHash",
            "serverSigPk",
            "publicKeyB64",
            "secretKeyB64",
            "exportedAt",
        ] {
            assert!(json.contains(&format!("\"{key}\"")), "missing {key}");
        }

        let restored = InboxDescriptor::import(&ExportedInbox::from_json(&json).unwrap()).unwrap();
        assert_eq!(restored, descriptor);
        assert_eq!(
            restored.expires_at.timestamp_subsec_nanos(),
            descriptor.expires_at.timestamp_subsec_nanos()
        );
    }

    #[test]
    fn import_validation() {
        let exported = descriptor().export();

        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                version: 2,
                ..exported.clone()
            }),
            Err(ExportError::UnsupportedVersion(2))
        );

        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                email_address: " ".into(),
                ..exported.clone()
            }),
            Err(ExportError::MissingField("emailAddress"))
        );

        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                inbox_hash: String::new(),
                ..exported.clone()
            }),
            Err(ExportError::MissingField("inboxHash"))
        );

        let other = Keypair::generate().unwrap();
        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                public_key_b64: codec::encode_url(other.public_key()),
                ..exported.clone()
            }),
            Err(ExportError::Key(KeyError::PublicKeyMismatch))
        );

        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                secret_key_b64: codec::encode_url([0u8; 100]),
                ..exported.clone()
            }),
            Err(ExportError::Key(KeyError::InvalidSecretKeyLength { actual: 100, .. }))
        );

        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                server_sig_pk: codec::encode_url([0u8; 32]),
                ..exported.clone()
            }),
            Err(ExportError::Encoding {
                field: "serverSigPk",
                ..
            })
        );

        assert_matches!(
            InboxDescriptor::import(&ExportedInbox {
                secret_key_b64: "***".into(),
                ..exported
            }),
            Err(ExportError::Encoding {
                field: "secretKeyB64",
                ..
            })
        );
    }

    #[test]
    fn expiry() {
        let descriptor = descriptor();
        assert!(!descriptor.is_expired_at(descriptor.expires_at - Duration::seconds(1)));
        assert!(descriptor.is_expired_at(descriptor.expires_at));
    }
}
