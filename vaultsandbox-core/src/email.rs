// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decrypted emails and the plaintext formats they are assembled from.
//!
//! Every stored email consists of two encrypted payloads: the metadata (sender, recipients,
//! subject, time of arrival) and, when the server finished processing the message, the parsed
//! body (text, html, headers, attachments, links and the results of the authentication checks).
//! Both decrypt to JSON documents which are combined into one [`DecryptedEmail`].
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::codec::{self, CodecError};

/// Email after verification and decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedEmail {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
    pub links: Vec<String>,
    pub auth_results: Option<serde_json::Value>,
    pub is_read: bool,
}

impl DecryptedEmail {
    /// Assembles an email from the decrypted metadata and the optional decrypted parsed body.
    ///
    /// `received_at` is used when the metadata itself does not carry a timestamp.
    pub fn from_plaintexts(
        id: impl Into<String>,
        received_at: DateTime<Utc>,
        is_read: bool,
        metadata: &[u8],
        parsed: Option<&[u8]>,
    ) -> Result<Self, EmailError> {
        let metadata: MetadataPlaintext =
            serde_json::from_slice(metadata).map_err(EmailError::Metadata)?;
        let parsed: ParsedPlaintext = match parsed {
            Some(bytes) => serde_json::from_slice(bytes).map_err(EmailError::Parsed)?,
            None => ParsedPlaintext::default(),
        };

        let attachments = parsed
            .attachments
            .into_iter()
            .map(Attachment::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: id.into(),
            from: metadata.from,
            to: metadata.to.into_vec(),
            subject: metadata.subject,
            text: parsed.text,
            html: parsed.html,
            received_at: metadata.received_at.unwrap_or(received_at),
            headers: parsed.headers,
            attachments,
            links: parsed.links,
            auth_results: parsed.auth_results,
            is_read,
        })
    }

    /// Typed view of the authentication results, `None` if absent or in an unknown shape.
    pub fn auth_results(&self) -> Option<AuthResults> {
        self.auth_results
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Looks up a header by name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// File attached to an email.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub content_id: Option<String>,
    pub content_disposition: Option<String>,
    pub content: Vec<u8>,
    pub checksum: Option<String>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .field("content_id", &self.content_id)
            .field("content_disposition", &self.content_disposition)
            .field("content", &format_args!("[{} bytes]", self.content.len()))
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl TryFrom<AttachmentPlaintext> for Attachment {
    type Error = EmailError;

    fn try_from(value: AttachmentPlaintext) -> Result<Self, Self::Error> {
        let content = match value.content {
            Some(encoded) => {
                codec::decode_std_lenient(&encoded).map_err(|source| EmailError::Attachment {
                    filename: value.filename.clone(),
                    source,
                })?
            }
            None => Vec::new(),
        };

        Ok(Self {
            size: value.size.unwrap_or(content.len() as u64),
            filename: value.filename,
            content_type: value.content_type,
            content_id: value.content_id,
            content_disposition: value.content_disposition,
            content,
            checksum: value.checksum,
        })
    }
}

/// Decrypted metadata document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPlaintext {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Recipients,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

/// Recipients are sent either as a single string or as a list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Recipients::One(address) if address.is_empty() => Vec::new(),
            Recipients::One(address) => vec![address],
            Recipients::Many(addresses) => addresses,
        }
    }
}

impl Default for Recipients {
    fn default() -> Self {
        Recipients::Many(Vec::new())
    }
}

/// Decrypted parsed-body document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPlaintext {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPlaintext>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_results: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPlaintext {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Header values are usually strings, structured values are kept in their JSON form.
fn deserialize_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(value) => (key, value),
            other => (key, other.to_string()),
        })
        .collect())
}

/// Result of a single authentication check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCheck {
    #[serde(alias = "status")]
    pub result: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, alias = "info")]
    pub details: Option<String>,
}

impl AuthCheck {
    pub fn passed(&self) -> bool {
        self.result.eq_ignore_ascii_case("pass")
    }
}

/// Results of the SPF, DKIM, DMARC and reverse DNS checks the server ran on arrival.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResults {
    #[serde(default)]
    pub spf: Option<AuthCheck>,
    #[serde(default)]
    pub dkim: Vec<AuthCheck>,
    #[serde(default)]
    pub dmarc: Option<AuthCheck>,
    #[serde(default)]
    pub reverse_dns: Option<AuthCheck>,
}

impl AuthResults {
    /// Summarizes the checks. The email passes when SPF, DKIM and DMARC passed, reverse DNS is
    /// reported but not required.
    pub fn validate(&self) -> AuthValidation {
        let mut failures = Vec::new();

        let spf_passed = check_single("SPF", self.spf.as_ref(), &mut failures);

        let dkim_passed = self.dkim.iter().any(AuthCheck::passed);
        if self.dkim.is_empty() {
            failures.push("DKIM: no signatures".to_string());
        } else if !dkim_passed {
            for check in &self.dkim {
                failures.push(describe_failure("DKIM", check));
            }
        }

        let dmarc_passed = check_single("DMARC", self.dmarc.as_ref(), &mut failures);
        let reverse_dns_passed =
            check_single("reverse DNS", self.reverse_dns.as_ref(), &mut failures);

        AuthValidation {
            passed: spf_passed && dkim_passed && dmarc_passed,
            spf_passed,
            dkim_passed,
            dmarc_passed,
            reverse_dns_passed,
            failures,
        }
    }
}

fn check_single(name: &str, check: Option<&AuthCheck>, failures: &mut Vec<String>) -> bool {
    match check {
        Some(check) if check.passed() => true,
        Some(check) => {
            failures.push(describe_failure(name, check));
            false
        }
        None => {
            failures.push(format!("{name}: no result"));
            false
        }
    }
}

fn describe_failure(name: &str, check: &AuthCheck) -> String {
    let mut reason = format!("{name}: {}", check.result);
    if let Some(domain) = &check.domain {
        reason.push_str(&format!(" ({domain})"));
    }
    if let Some(details) = &check.details {
        reason.push_str(&format!(": {details}"));
    }
    reason
}

/// Summary returned by [`AuthResults::validate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthValidation {
    pub passed: bool,
    pub spf_passed: bool,
    pub dkim_passed: bool,
    pub dmarc_passed: bool,
    pub reverse_dns_passed: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("invalid metadata document: {0}")]
    Metadata(#[source] serde_json::Error),

    #[error("invalid parsed email document: {0}")]
    Parsed(#[source] serde_json::Error),

    #[error("invalid content of attachment \"{filename}\": {source}")]
    Attachment {
        filename: String,
        #[source]
        source: CodecError,
    },
}
