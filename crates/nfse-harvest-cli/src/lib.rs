//! Wiring for the `nfse-harvest` binary: backend selection, diagnostics and
//! report rendering.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono_tz::Tz;
use serde::Serialize;

use nfse_harvest::{
    AdnConnector, ConsolidationOutcome, CursorStore, FileCursorStore, FsObjectStore,
    HarvestConfig, Harvester, JsonTenantFile, ObjectStore, PostgrestCursorStore,
    PostgrestTenantDirectory, RoundSummary, SourceConfig, SupabaseClient, SupabaseConfig,
    SupabaseObjectStore, TenantDirectory, TenantStatus,
};

/// Where documents, archives and cursors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Local directory (`<data-dir>/bucket`, `<data-dir>/cursors.json`).
    Fs,
    /// Supabase Storage bucket plus PostgREST tables.
    Supabase,
}

/// Storage and tenant options shared by every command.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub backend: Backend,
    pub data_dir: PathBuf,
    /// JSON tenant file. Required for the `fs` backend; overrides the
    /// certificate table for `supabase`.
    pub tenants_file: Option<PathBuf>,
}

/// Everything a command needs to talk to storage and tenants.
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub tenants: Arc<dyn TenantDirectory>,
}

impl Backends {
    /// Build the backends from options, reading Supabase settings through
    /// `lookup`.
    pub fn build(
        options: &BackendOptions,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        match options.backend {
            Backend::Fs => {
                let Some(tenants_file) = &options.tenants_file else {
                    bail!("--tenants <FILE> is required with the fs backend");
                };
                Ok(Self {
                    objects: Arc::new(FsObjectStore::new(options.data_dir.join("bucket"))),
                    cursors: Arc::new(FileCursorStore::new(options.data_dir.join("cursors.json"))),
                    tenants: Arc::new(JsonTenantFile::new(tenants_file)),
                })
            }
            Backend::Supabase => {
                let config = SupabaseConfig::from_vars(lookup)
                    .context("Supabase backend selected but not configured")?;
                let client = SupabaseClient::new(config)?;
                let tenants: Arc<dyn TenantDirectory> = match &options.tenants_file {
                    Some(path) => Arc::new(JsonTenantFile::new(path)),
                    None => Arc::new(PostgrestTenantDirectory::new(client.clone())),
                };
                Ok(Self {
                    objects: Arc::new(SupabaseObjectStore::new(client.clone())),
                    cursors: Arc::new(PostgrestCursorStore::new(client)),
                    tenants,
                })
            }
        }
    }

    /// Harvester over these backends talking to the ADN.
    pub fn harvester(&self, config: HarvestConfig, source: SourceConfig) -> Harvester {
        Harvester::new(
            config,
            Arc::new(AdnConnector::new(source)),
            self.objects.clone(),
            self.cursors.clone(),
        )
    }
}

/// Round and transport tuning. Each flag falls back to its environment
/// variable; anything left unset keeps the value from
/// `HarvestConfig::from_env` / `SourceConfig::from_env`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct TuningArgs {
    /// Parallel probes within a batch.
    #[arg(long, env = "NSU_CONCURRENCY", global = true)]
    pub concurrency: Option<usize>,

    /// Sequence numbers per batch.
    #[arg(long, env = "NSU_BATCH_SIZE", global = true)]
    pub batch_size: Option<u64>,

    /// Sequence numbers probed per tenant per round.
    #[arg(long, env = "NSU_MAX_SPAN", global = true)]
    pub max_span: Option<u64>,

    /// Cursor assumed for tenants without a stored one.
    #[arg(long, env = "NSU_DEFAULT_START", global = true)]
    pub default_start: Option<u64>,

    /// Cooldown after a 429 without a usable Retry-After, in seconds.
    #[arg(long = "rate-limit-cooldown", env = "RATE_LIMIT_COOLDOWN_SECS", global = true)]
    pub rate_limit_cooldown_secs: Option<u64>,

    /// Keep probing past a 204 instead of ending the round
    /// (STOP_ON_FIRST_204=false in the environment).
    #[arg(long, global = true)]
    pub continue_after_204: bool,

    /// Only consolidate archives on days 1..=N of the month.
    #[arg(long, env = "ARCHIVE_DAY_LIMIT", global = true)]
    pub archive_day_limit: Option<u32>,

    /// IANA zone used to decide which month is harvested.
    #[arg(long, env = "HARVEST_TIMEZONE", value_parser = parse_timezone, global = true)]
    pub timezone: Option<Tz>,

    /// ADN base URL.
    #[arg(long, env = "ADN_BASE_URL", global = true)]
    pub adn_base_url: Option<String>,

    /// Per-request timeout in seconds.
    #[arg(long = "http-timeout", env = "HTTP_TIMEOUT_SECS", global = true)]
    pub http_timeout_secs: Option<u64>,

    /// Retries on 5xx and network errors.
    #[arg(long, env = "HTTP_MAX_RETRIES", global = true)]
    pub http_max_retries: Option<u32>,
}

fn parse_timezone(raw: &str) -> Result<Tz, String> {
    raw.parse::<Tz>().map_err(|e| e.to_string())
}

impl TuningArgs {
    /// Layer the flags over `config` and `source`.
    pub fn apply(
        &self,
        mut config: HarvestConfig,
        mut source: SourceConfig,
    ) -> (HarvestConfig, SourceConfig) {
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_span {
            config.max_span = v;
        }
        if let Some(v) = self.default_start {
            config.default_start = v;
        }
        if let Some(v) = self.rate_limit_cooldown_secs {
            config.rate_limit_cooldown_default = Duration::from_secs(v);
        }
        if self.continue_after_204 {
            config.stop_on_terminal = false;
        }
        if let Some(v) = self.archive_day_limit {
            config.archive_day_limit = (v > 0).then_some(v);
        }
        if let Some(tz) = self.timezone {
            config.timezone = tz;
        }
        if let Some(url) = &self.adn_base_url {
            source.base_url = url.clone();
        }
        if let Some(v) = self.http_timeout_secs {
            source.timeout = Duration::from_secs(v.max(1));
        }
        if let Some(v) = self.http_max_retries {
            source.max_retries = v;
        }
        (config.normalized(), source)
    }
}

/// Resolve the data directory, creating it when missing.
pub fn ensure_data_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("cannot create data directory {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// One line per tenant plus a totals line.
pub fn render_summary(summary: &RoundSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Round {} | harvested {} | skipped {} | failed {} | new documents {}",
        summary.period,
        summary.harvested(),
        summary.skipped(),
        summary.failed(),
        summary.documents_saved()
    );
    for report in &summary.tenants {
        let detail = match &report.status {
            TenantStatus::Skipped { reason } => format!("skipped ({reason})"),
            TenantStatus::Failed { error } => format!("failed ({error})"),
            TenantStatus::Harvested => {
                let cursor = match (report.cursor_before, report.cursor_after) {
                    (Some(before), Some(after)) if after > before => {
                        format!("cursor {before} -> {after}")
                    }
                    (_, Some(after)) => format!("cursor {after}"),
                    _ => "cursor ?".to_string(),
                };
                let stop = report
                    .round
                    .as_ref()
                    .map(|r| r.reason.to_string())
                    .unwrap_or_default();
                let archive = report
                    .consolidation
                    .as_ref()
                    .map(render_consolidation)
                    .unwrap_or_else(|| "archive not checked".to_string());
                format!(
                    "{cursor} | saved {} | {stop} | {archive}",
                    report.documents_saved()
                )
            }
        };
        let _ = writeln!(out, "  {} {:<30} {detail}", report.tenant, report.name);
        for warning in &report.warnings {
            let _ = writeln!(out, "      warning: {warning}");
        }
    }
    out
}

pub fn render_consolidation(outcome: &ConsolidationOutcome) -> String {
    match outcome {
        ConsolidationOutcome::Empty => "no documents".to_string(),
        ConsolidationOutcome::Unchanged { file_count, .. } => {
            format!("archive up to date ({file_count} files)")
        }
        ConsolidationOutcome::Rebuilt {
            path,
            file_count,
            complete,
            ..
        } => {
            let partial = if *complete { "" } else { ", incomplete" };
            format!("archive rebuilt ({file_count} files{partial}): {path}")
        }
    }
}

/// Result of probing the upstream host.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub resolved: Vec<SocketAddr>,
    pub dns_error: Option<String>,
    /// HTTP status of a plain GET on the base URL (no client certificate).
    pub http_status: Option<u16>,
    pub http_error: Option<String>,
    pub elapsed_ms: u128,
}

impl Diagnosis {
    pub fn healthy(&self) -> bool {
        !self.resolved.is_empty() && self.http_status.is_some()
    }
}

/// Split a base URL into host and port.
pub fn host_and_port(base_url: &str) -> anyhow::Result<(String, u16)> {
    let url = reqwest::Url::parse(base_url).with_context(|| format!("invalid URL {base_url}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("URL {base_url} has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .with_context(|| format!("URL {base_url} has no port"))?;
    Ok((host, port))
}

/// DNS lookup plus one unauthenticated GET against `base_url`.
pub async fn diagnose(base_url: &str, timeout: Duration) -> anyhow::Result<Diagnosis> {
    let (host, port) = host_and_port(base_url)?;
    let started = Instant::now();

    let (resolved, dns_error) = match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => (addrs.collect(), None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .build()?;
    let (http_status, http_error) = match client.get(base_url).send().await {
        Ok(response) => (Some(response.status().as_u16()), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Ok(Diagnosis {
        url: base_url.to_string(),
        host,
        port,
        resolved,
        dns_error,
        http_status,
        http_error,
        elapsed_ms: started.elapsed().as_millis(),
    })
}
