//! Upstream document source: one GET per sequence number over mutual TLS.
//!
//! Network errors and 5xx responses are retried a few times with
//! exponential backoff before being handed to the classifier. 429 is
//! returned immediately so the scheduler can end the round.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};

use crate::config::SourceConfig;
use crate::types::{ClientIdentity, HarvestError, HarvestResult, Tenant, TenantId};

/// The parts of an upstream response the classifier looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// `Retry-After` in seconds, when present and numeric.
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// Per-tenant view of the upstream.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Probe one sequence number. `Err` means the request never produced a
    /// response (network failure after retries).
    async fn fetch(&self, nsu: u64) -> HarvestResult<SourceResponse>;
}

/// Builds a [`DocumentSource`] bound to one tenant's credentials.
pub trait SourceConnector: Send + Sync {
    /// Fails with [`HarvestError::Configuration`] when the tenant's
    /// credentials cannot be used.
    fn connect(&self, tenant: &Tenant) -> HarvestResult<Arc<dyn DocumentSource>>;
}

/// HTTP source for the ADN distribution endpoint.
pub struct AdnSource {
    client: reqwest::Client,
    config: SourceConfig,
    tenant: TenantId,
}

impl AdnSource {
    /// Build a client for `tenant`, presenting `identity` when given.
    pub fn new(
        config: &SourceConfig,
        tenant: &TenantId,
        identity: Option<&ClientIdentity>,
    ) -> HarvestResult<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(accept_json());

        if let Some(identity) = identity {
            let identity = reqwest::Identity::from_pem(&identity.combined_pem()).map_err(|e| {
                HarvestError::Configuration(format!("unusable client certificate for {tenant}: {e}"))
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| {
            HarvestError::Configuration(format!("failed to build HTTP client for {tenant}: {e}"))
        })?;

        Ok(Self {
            client,
            config: config.clone(),
            tenant: tenant.clone(),
        })
    }

    async fn send_once(&self, url: &str) -> Result<SourceResponse, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await?;
        Ok(SourceResponse {
            status,
            content_type,
            retry_after,
            body,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

fn accept_json() -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    headers
}

#[async_trait]
impl DocumentSource for AdnSource {
    async fn fetch(&self, nsu: u64) -> HarvestResult<SourceResponse> {
        let url = self.config.document_url(nsu, self.tenant.as_str());
        let mut retries = 0u32;

        loop {
            match self.send_once(&url).await {
                Ok(resp) => {
                    if resp.status >= 500 && retries < self.config.max_retries {
                        retries += 1;
                        tracing::debug!(
                            tenant = %self.tenant,
                            nsu,
                            status = resp.status,
                            retries,
                            "retrying after server error"
                        );
                        tokio::time::sleep(self.backoff(retries)).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if retries < self.config.max_retries {
                        retries += 1;
                        tracing::debug!(
                            tenant = %self.tenant,
                            nsu,
                            retries,
                            "retrying after network error: {e}"
                        );
                        tokio::time::sleep(self.backoff(retries)).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

/// Connects each tenant to the ADN with its own client certificate.
pub struct AdnConnector {
    config: SourceConfig,
}

impl AdnConnector {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

impl SourceConnector for AdnConnector {
    fn connect(&self, tenant: &Tenant) -> HarvestResult<Arc<dyn DocumentSource>> {
        let identity = tenant.credentials.decode()?;
        let source = AdnSource::new(&self.config, &tenant.id, Some(&identity))?;
        Ok(Arc::new(source))
    }
}
