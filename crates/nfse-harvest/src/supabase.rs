//! Supabase backends: Storage for objects, PostgREST tables for cursors and
//! tenants.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cursor::CursorStore;
use crate::storage::{split_path, ObjectEntry, ObjectStore};
use crate::tenants::{tenants_from_records, TenantDirectory, TenantRecord};
use crate::types::{HarvestError, HarvestResult, Tenant, TenantId};

/// Page size for storage listings.
const LIST_PAGE_SIZE: usize = 1000;

const DEFAULT_BUCKET: &str = "imagens";
const DEFAULT_CURSOR_TABLE: &str = "nsu_nfs";
const DEFAULT_TENANT_TABLE: &str = "certifica_dfe";

/// Connection settings for a Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
    pub bucket: String,
    pub cursor_table: String,
    pub tenant_table: String,
    pub timeout: Duration,
}

impl SupabaseConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            bucket: DEFAULT_BUCKET.to_string(),
            cursor_table: DEFAULT_CURSOR_TABLE.to_string(),
            tenant_table: DEFAULT_TENANT_TABLE.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// `SUPABASE_URL` and `SUPABASE_KEY` are required; bucket and table
    /// names fall back to the defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> HarvestResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| HarvestError::Configuration(format!("{key} is not set")))
        };
        let mut config = Self::new(required("SUPABASE_URL")?, required("SUPABASE_KEY")?);
        if let Some(bucket) = lookup("SUPABASE_BUCKET") {
            config.bucket = bucket;
        }
        if let Some(table) = lookup("SUPABASE_CURSOR_TABLE") {
            config.cursor_table = table;
        }
        if let Some(table) = lookup("SUPABASE_TENANT_TABLE") {
            config.tenant_table = table;
        }
        Ok(config)
    }

    pub fn from_env() -> HarvestResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }
}

/// HTTP client carrying the project key on every request.
#[derive(Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    config: SupabaseConfig,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> HarvestResult<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| HarvestError::Configuration(format!("invalid Supabase key: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| HarvestError::Configuration(format!("invalid Supabase key: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                HarvestError::Configuration(format!("failed to build Supabase client: {e}"))
            })?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &SupabaseConfig {
        &self.config
    }

    fn storage_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.url,
            self.config.bucket,
            path.trim_start_matches('/')
        )
    }

    fn list_url(&self) -> String {
        format!("{}/storage/v1/object/list/{}", self.config.url, self.config.bucket)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }
}

/// Truncated response text for error messages.
async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("HTTP {status}: {}", body.chars().take(300).collect::<String>())
}

/// Objects in a Supabase Storage bucket.
pub struct SupabaseObjectStore {
    client: SupabaseClient,
}

impl SupabaseObjectStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct StorageListItem {
    name: String,
    /// Folders come back with a null id.
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[async_trait]
impl ObjectStore for SupabaseObjectStore {
    async fn list(&self, prefix: &str, search: Option<&str>) -> HarvestResult<Vec<ObjectEntry>> {
        let prefix = prefix.trim_matches('/');
        let mut entries = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut payload = json!({
                "prefix": prefix,
                "limit": LIST_PAGE_SIZE,
                "offset": offset,
                "sortBy": {"column": "name", "order": "asc"},
            });
            if let Some(search) = search {
                payload["search"] = Value::String(search.to_string());
            }

            let response = self
                .client
                .http
                .post(self.client.list_url())
                .json(&payload)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(HarvestError::Storage(format!(
                    "list {prefix}: {}",
                    error_text(response).await
                )));
            }
            let page: Vec<StorageListItem> = response.json().await?;
            let page_len = page.len();
            entries.extend(page.into_iter().filter(|item| item.id.is_some()).map(|item| {
                ObjectEntry {
                    size: item
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("size"))
                        .and_then(Value::as_u64),
                    name: item.name,
                }
            }));

            if page_len < LIST_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn get(&self, path: &str) -> HarvestResult<Option<Vec<u8>>> {
        let response = self.client.http.get(self.client.storage_url(path)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
            // Storage answers 400 with a "not_found" body for missing objects.
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Ok(None),
            _ => Err(HarvestError::Storage(format!(
                "download {path}: {}",
                error_text(response).await
            ))),
        }
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        overwrite: bool,
    ) -> HarvestResult<bool> {
        let mut request = self
            .client
            .http
            .post(self.client.storage_url(path))
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        if overwrite {
            request = request.header("x-upsert", "true");
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let text = error_text(response).await;
        if !overwrite && (status == StatusCode::CONFLICT || text.contains("Duplicate")) {
            let (_, name) = split_path(path);
            tracing::debug!(path = %path, name, "object already exists");
            return Ok(false);
        }
        Err(HarvestError::Storage(format!("upload {path}: {text}")))
    }
}

/// Cursor rows in a PostgREST table with columns `id`, `cnpj`, `nsu`.
pub struct PostgrestCursorStore {
    client: SupabaseClient,
}

#[derive(Deserialize)]
struct CursorRow {
    id: Value,
    #[serde(default)]
    nsu: Option<Value>,
}

impl PostgrestCursorStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    /// Most recent row for the tenant.
    async fn latest_row(&self, tenant: &TenantId) -> HarvestResult<Option<CursorRow>> {
        let url = self.client.rest_url(&self.client.config.cursor_table);
        let response = self
            .client
            .http
            .get(url)
            .query(&[
                ("select", "id,cnpj,nsu".to_string()),
                ("cnpj", format!("eq.{tenant}")),
                ("limit", "1".to_string()),
                ("order", "id.desc".to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HarvestError::Storage(format!(
                "cursor read for {tenant}: {}",
                error_text(response).await
            )));
        }
        let rows: Vec<CursorRow> = response.json().await?;
        Ok(rows.into_iter().next())
    }
}

/// The column holds numbers, sometimes as floats or strings.
fn parse_nsu(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64),
        _ => None,
    }
}

#[async_trait]
impl CursorStore for PostgrestCursorStore {
    async fn load(&self, tenant: &TenantId) -> HarvestResult<Option<u64>> {
        let row = self.latest_row(tenant).await?;
        Ok(row.and_then(|r| r.nsu.as_ref().and_then(parse_nsu)))
    }

    async fn store(&self, tenant: &TenantId, nsu: u64) -> HarvestResult<()> {
        let url = self.client.rest_url(&self.client.config.cursor_table);
        let payload = json!({"cnpj": tenant.as_str(), "nsu": nsu});

        let request = match self.latest_row(tenant).await? {
            Some(row) => {
                let id = match &row.id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.client
                    .http
                    .patch(url)
                    .query(&[("id", format!("eq.{id}"))])
                    .json(&payload)
            }
            None => self.client.http.post(url).json(&payload),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(HarvestError::Storage(format!(
                "cursor write for {tenant}: {}",
                error_text(response).await
            )));
        }
        Ok(())
    }
}

/// Tenants read from the certificate table.
pub struct PostgrestTenantDirectory {
    client: SupabaseClient,
}

impl PostgrestTenantDirectory {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenantDirectory for PostgrestTenantDirectory {
    async fn load(&self) -> HarvestResult<Vec<Tenant>> {
        let url = self.client.rest_url(&self.client.config.tenant_table);
        let response = self
            .client
            .http
            .get(url)
            .query(&[("select", r#"id,pem,key,empresa,codi,user,vencimento,"cnpj/cpf",fazer"#)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HarvestError::Storage(format!(
                "tenant table read: {}",
                error_text(response).await
            )));
        }
        let records: Vec<TenantRecord> = response.json().await?;
        let total = records.len();
        let tenants = tenants_from_records(records);
        tracing::info!(
            table = %self.client.config.tenant_table,
            loaded = tenants.len(),
            ignored = total - tenants.len(),
            "tenants loaded"
        );
        Ok(tenants)
    }
}
