//! Core data types: tenants, credentials, stored documents and archive state.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Minimum number of digits for a tenant document (CPF has 11, CNPJ has 14).
pub const MIN_TENANT_DIGITS: usize = 11;

/// Normalized numeric tenant identifier (CPF/CNPJ digits only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Strip every non-digit from `raw` and validate the length.
    ///
    /// `"12.345.678/0001-90"` becomes `"12345678000190"`. Returns `None` when
    /// fewer than [`MIN_TENANT_DIGITS`] digits remain.
    pub fn normalize(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < MIN_TENANT_DIGITS {
            return None;
        }
        Some(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64-encoded PEM material as kept in the tenant directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodedCredentials {
    pub cert_pem_b64: String,
    pub key_pem_b64: String,
}

impl EncodedCredentials {
    /// Decode both halves into a client identity.
    pub fn decode(&self) -> HarvestResult<ClientIdentity> {
        if self.cert_pem_b64.trim().is_empty() || self.key_pem_b64.trim().is_empty() {
            return Err(HarvestError::Configuration(
                "certificate or private key is missing".to_string(),
            ));
        }
        let cert_pem = decode_pem(&self.cert_pem_b64, "certificate")?;
        let key_pem = decode_pem(&self.key_pem_b64, "private key")?;
        Ok(ClientIdentity { cert_pem, key_pem })
    }
}

fn decode_pem(encoded: &str, what: &str) -> HarvestResult<Vec<u8>> {
    let compact: String = encoded.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| HarvestError::Configuration(format!("{what} is not valid base64: {e}")))
}

/// Decoded client certificate and private key used for mutual TLS.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl ClientIdentity {
    /// Certificate followed by key, the layout `reqwest::Identity::from_pem` expects.
    pub fn combined_pem(&self) -> Vec<u8> {
        let mut pem = self.cert_pem.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&self.key_pem);
        pem
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// A taxpayer whose documents are harvested. Immutable during a round.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// Customer code used in archive names.
    pub customer_code: Option<i64>,
    /// Owning user (usually an e-mail) used in archive names.
    pub user: String,
    pub enabled: bool,
    /// Certificate expiry date.
    pub expires_on: Option<NaiveDate>,
    pub credentials: EncodedCredentials,
}

/// Why a tenant is left out of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    CertificateExpired { expired_on: NaiveDate },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::CertificateExpired { expired_on } => {
                write!(f, "certificate expired on {expired_on}")
            }
        }
    }
}

impl Tenant {
    /// Check whether the tenant takes part in a round happening on `today`.
    pub fn eligibility(&self, today: NaiveDate) -> Result<(), SkipReason> {
        if !self.enabled {
            return Err(SkipReason::Disabled);
        }
        match self.expires_on {
            Some(expired_on) if expired_on < today => {
                Err(SkipReason::CertificateExpired { expired_on })
            }
            _ => Ok(()),
        }
    }

    /// Label used in the period archive name: `{code}-{tenant}-{user}`.
    pub fn archive_label(&self) -> String {
        let code = self
            .customer_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "0".to_string());
        let user = if self.user.trim().is_empty() {
            "sem-user"
        } else {
            self.user.trim()
        };
        format!("{code}-{}-{user}", self.id)
    }
}

/// A document extracted from a confirmed response and written to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub tenant_id: TenantId,
    /// Period code (`YYYYMM`).
    pub period: String,
    pub sequence_number: u64,
    /// 1-based position of the document within its response.
    pub ordinal: usize,
    pub content: String,
    /// Hex SHA-256 of `content`.
    pub content_hash: String,
}

/// Last recorded consolidation of a tenant/period, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodArchiveState {
    pub tenant_id: TenantId,
    pub period: String,
    pub member_hash: String,
    pub file_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Errors that can occur in the harvesting engine.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        HarvestError::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for HarvestError {
    fn from(e: zip::result::ZipError) -> Self {
        HarvestError::Archive(e.to_string())
    }
}

/// Convenience result type.
pub type HarvestResult<T> = Result<T, HarvestError>;
