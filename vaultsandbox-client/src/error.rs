// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors surfaced by the client.
use thiserror::Error;
use vaultsandbox_core::crypto::ml_kem::MlKemError;
use vaultsandbox_core::{EmailError, EnvelopeError, ExportError, KeyError};

use crate::backoff::ConfigError;
use crate::transport::TransportError;

/// Error returned by every public operation of the client.
///
/// Use [`Error::kind`] to match on the category without caring about the attached context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("client is closed")]
    ClientClosed,

    #[error("no api key configured")]
    MissingCredentials,

    #[error("api key was rejected by the server")]
    Unauthorized,

    #[error("inbox not found")]
    InboxNotFound,

    #[error("email not found")]
    EmailNotFound,

    #[error("inbox already exists")]
    InboxAlreadyExists,

    #[error("invalid ttl of {ttl} seconds, must be between 1 and {max}")]
    InvalidTtl { ttl: u64, max: u64 },

    #[error("invalid inbox export: {0}")]
    InvalidExport(#[source] ExportError),

    #[error("network error: {0}")]
    Network(String),

    #[error("temporary server error {status}: {message}")]
    TransientHttp { status: u16, message: String },

    #[error("server error {status}: {message}")]
    PermanentHttp { status: u16, message: String },

    #[error("server signature is invalid")]
    SignatureInvalid,

    #[error("server signing key does not match the pinned key")]
    ServerKeyMismatch,

    #[error("unsupported algorithms: {0}")]
    AlgorithmMismatch(String),

    #[error("invalid size of {field}, expected {expected} bytes, got {actual}")]
    SizeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid encoding: {0}")]
    BadEncoding(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid {field} config: {source}")]
    InvalidConfig {
        field: &'static str,
        #[source]
        source: ConfigError,
    },

    #[error("inbox key generation failed: {0}")]
    KeyGeneration(String),
}

/// Category of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClientClosed,
    MissingCredentials,
    Unauthorized,
    InboxNotFound,
    EmailNotFound,
    InboxAlreadyExists,
    InvalidTtl,
    InvalidExport,
    Network,
    TransientHttp,
    PermanentHttp,
    SignatureInvalid,
    ServerKeyMismatch,
    AlgorithmMismatch,
    SizeMismatch,
    DecryptionFailed,
    BadEncoding,
    DeadlineExceeded,
    Cancelled,
    InvalidConfig,
    KeyGeneration,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ClientClosed => ErrorKind::ClientClosed,
            Error::MissingCredentials => ErrorKind::MissingCredentials,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::InboxNotFound => ErrorKind::InboxNotFound,
            Error::EmailNotFound => ErrorKind::EmailNotFound,
            Error::InboxAlreadyExists => ErrorKind::InboxAlreadyExists,
            Error::InvalidTtl { .. } => ErrorKind::InvalidTtl,
            Error::InvalidExport(_) => ErrorKind::InvalidExport,
            Error::Network(_) => ErrorKind::Network,
            Error::TransientHttp { .. } => ErrorKind::TransientHttp,
            Error::PermanentHttp { .. } => ErrorKind::PermanentHttp,
            Error::SignatureInvalid => ErrorKind::SignatureInvalid,
            Error::ServerKeyMismatch => ErrorKind::ServerKeyMismatch,
            Error::AlgorithmMismatch(_) => ErrorKind::AlgorithmMismatch,
            Error::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Error::DecryptionFailed => ErrorKind::DecryptionFailed,
            Error::BadEncoding(_) => ErrorKind::BadEncoding,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Error::KeyGeneration(_) => ErrorKind::KeyGeneration,
        }
    }

    /// Returns true for errors caused by a payload which failed verification or decryption.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SignatureInvalid
                | ErrorKind::ServerKeyMismatch
                | ErrorKind::AlgorithmMismatch
                | ErrorKind::SizeMismatch
                | ErrorKind::DecryptionFailed
                | ErrorKind::BadEncoding
        )
    }
}

impl From<EnvelopeError> for Error {
    fn from(value: EnvelopeError) -> Self {
        match value {
            EnvelopeError::KeyMismatch => Error::ServerKeyMismatch,
            EnvelopeError::VersionMismatch(version) => {
                Error::AlgorithmMismatch(format!("protocol version {version}"))
            }
            EnvelopeError::AlgMismatch(suite) => Error::AlgorithmMismatch(suite),
            EnvelopeError::SizeMismatch {
                field,
                expected,
                actual,
            } => Error::SizeMismatch {
                field,
                expected,
                actual,
            },
            err @ (EnvelopeError::BadBase64 { .. } | EnvelopeError::BadKeyFormat) => {
                Error::BadEncoding(err.to_string())
            }
            EnvelopeError::BadSignature => Error::SignatureInvalid,
            EnvelopeError::BadPrivateKey | EnvelopeError::AeadFailure => Error::DecryptionFailed,
        }
    }
}

impl From<EmailError> for Error {
    fn from(value: EmailError) -> Self {
        Error::BadEncoding(value.to_string())
    }
}

impl From<ExportError> for Error {
    fn from(value: ExportError) -> Self {
        Error::InvalidExport(value)
    }
}

impl From<KeyError> for Error {
    fn from(value: KeyError) -> Self {
        match value {
            KeyError::InvalidPublicKeyLength { expected, actual } => Error::SizeMismatch {
                field: "public_key",
                expected,
                actual,
            },
            KeyError::InvalidSecretKeyLength { expected, actual } => Error::SizeMismatch {
                field: "secret_key",
                expected,
                actual,
            },
            err @ KeyError::PublicKeyMismatch => Error::InvalidExport(ExportError::Key(err)),
            KeyError::MlKem(err @ MlKemError::KeyGeneration(_)) => {
                Error::KeyGeneration(err.to_string())
            }
            KeyError::MlKem(_) => Error::DecryptionFailed,
        }
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Unauthorized => Error::Unauthorized,
            TransportError::MissingCredentials => Error::MissingCredentials,
            TransportError::InboxNotFound => Error::InboxNotFound,
            TransportError::EmailNotFound => Error::EmailNotFound,
            TransportError::Conflict => Error::InboxAlreadyExists,
            TransportError::Transient { status, message } => {
                Error::TransientHttp { status, message }
            }
            TransportError::Permanent { status, message } => {
                Error::PermanentHttp { status, message }
            }
            TransportError::Network(message) => Error::Network(message),
            TransportError::Decode(message) => Error::Network(format!("invalid response: {message}")),
        }
    }
}
