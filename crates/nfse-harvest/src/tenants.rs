//! Tenant directory: where the list of tenants for a round comes from.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EncodedCredentials, HarvestError, HarvestResult, Tenant, TenantId};

/// Enumerates the tenants to harvest. Called once per round.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn load(&self) -> HarvestResult<Vec<Tenant>>;
}

/// A tenant row as stored in the certificate table or a JSON file.
///
/// Field names follow the certificate table (`empresa`, `codi`, `cnpj/cpf`,
/// `vencimento`, `fazer`); English aliases are accepted in JSON files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantRecord {
    #[serde(rename = "cnpj/cpf", alias = "tax_id", alias = "cnpj", default)]
    pub tax_id: Option<String>,
    #[serde(rename = "empresa", alias = "name", default)]
    pub name: Option<String>,
    /// Number or numeric string.
    #[serde(rename = "codi", alias = "customer_code", default)]
    pub customer_code: Option<Value>,
    #[serde(default)]
    pub user: Option<String>,
    /// `YYYY-MM-DD`, possibly followed by a time part.
    #[serde(rename = "vencimento", alias = "expires_on", default)]
    pub expires_on: Option<String>,
    /// `"nao"`/`"não"` disables the tenant; anything else enables it.
    #[serde(rename = "fazer", alias = "enabled", default)]
    pub enabled: Option<Value>,
    /// Base64 of the PEM certificate.
    #[serde(alias = "cert_pem_b64", default)]
    pub pem: Option<String>,
    /// Base64 of the PEM private key.
    #[serde(alias = "key_pem_b64", default)]
    pub key: Option<String>,
}

impl TenantRecord {
    /// Convert into a [`Tenant`]. Records without a usable ID yield `None`.
    pub fn into_tenant(self) -> Option<Tenant> {
        let raw_id = self.tax_id.as_deref().unwrap_or("");
        let Some(id) = TenantId::normalize(raw_id) else {
            tracing::warn!(
                name = self.name.as_deref().unwrap_or(""),
                raw_id,
                "ignoring tenant without a valid CPF/CNPJ"
            );
            return None;
        };

        Some(Tenant {
            id,
            name: self.name.unwrap_or_default().trim().to_string(),
            customer_code: self.customer_code.as_ref().and_then(parse_code),
            user: self.user.unwrap_or_default().trim().to_string(),
            enabled: self.enabled.as_ref().map_or(true, parse_enabled),
            expires_on: self.expires_on.as_deref().and_then(parse_expiry),
            credentials: EncodedCredentials {
                cert_pem_b64: self.pem.unwrap_or_default(),
                key_pem_b64: self.key.unwrap_or_default(),
            },
        })
    }
}

/// Convert records, dropping the invalid ones.
pub fn tenants_from_records(records: Vec<TenantRecord>) -> Vec<Tenant> {
    records
        .into_iter()
        .filter_map(TenantRecord::into_tenant)
        .collect()
}

fn parse_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_enabled(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            !matches!(normalized.as_str(), "nao" | "não" | "false" | "no")
        }
        _ => true,
    }
}

fn parse_expiry(raw: &str) -> Option<NaiveDate> {
    let date = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Tenants kept in a local JSON file: an array of [`TenantRecord`].
pub struct JsonTenantFile {
    path: PathBuf,
}

impl JsonTenantFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TenantDirectory for JsonTenantFile {
    async fn load(&self) -> HarvestResult<Vec<Tenant>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            HarvestError::Configuration(format!(
                "cannot read tenant file {}: {e}",
                self.path.display()
            ))
        })?;
        let records: Vec<TenantRecord> = serde_json::from_slice(&bytes).map_err(|e| {
            HarvestError::Configuration(format!(
                "invalid tenant file {}: {e}",
                self.path.display()
            ))
        })?;
        let total = records.len();
        let tenants = tenants_from_records(records);
        tracing::info!(
            path = %self.path.display(),
            loaded = tenants.len(),
            ignored = total - tenants.len(),
            "tenants loaded"
        );
        Ok(tenants)
    }
}
