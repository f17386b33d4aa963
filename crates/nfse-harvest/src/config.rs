//! Engine and transport configuration, loaded from the environment.

use std::time::Duration;

use chrono_tz::Tz;

use crate::storage::StorageLayout;

pub const DEFAULT_CONCURRENCY: usize = 12;
pub const DEFAULT_BATCH_SIZE: u64 = 60;
pub const DEFAULT_MAX_SPAN: u64 = 400;
pub const DEFAULT_START_NSU: u64 = 0;
pub const DEFAULT_RATE_LIMIT_COOLDOWN_SECS: u64 = 30;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Porto_Velho;

pub const DEFAULT_ADN_BASE_URL: &str = "https://adn.nfse.gov.br";
pub const DEFAULT_PATH_TEMPLATE: &str = "/contribuintes/DFe/{nsu}?cnpjConsulta={tenant}";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HTTP_MAX_RETRIES: u32 = 4;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1200;

/// Settings that shape one harvesting round.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Parallel probes within a batch.
    pub concurrency: usize,
    /// Sequence numbers per batch.
    pub batch_size: u64,
    /// Sequence numbers probed per tenant per round.
    pub max_span: u64,
    /// Cursor value assumed when none is stored.
    pub default_start: u64,
    /// Cooldown after a 429 without a usable `Retry-After`.
    pub rate_limit_cooldown_default: Duration,
    /// Whether a 204 ends the round.
    pub stop_on_terminal: bool,
    /// When set, consolidation only runs on days `1..=N` of the month.
    pub archive_day_limit: Option<u32>,
    /// Zone used to compute "today" and therefore the period.
    pub timezone: Tz,
    pub layout: StorageLayout,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            max_span: DEFAULT_MAX_SPAN,
            default_start: DEFAULT_START_NSU,
            rate_limit_cooldown_default: Duration::from_secs(DEFAULT_RATE_LIMIT_COOLDOWN_SECS),
            stop_on_terminal: true,
            archive_day_limit: None,
            timezone: DEFAULT_TIMEZONE,
            layout: StorageLayout::default(),
        }
    }
}

impl HarvestConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`, falling back to defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = EnvReader(&lookup);
        Self {
            concurrency: env.usize("NSU_CONCURRENCY", defaults.concurrency),
            batch_size: env.u64("NSU_BATCH_SIZE", defaults.batch_size),
            max_span: env.u64("NSU_MAX_SPAN", defaults.max_span),
            default_start: env.u64("NSU_DEFAULT_START", defaults.default_start),
            rate_limit_cooldown_default: Duration::from_secs(env.u64(
                "RATE_LIMIT_COOLDOWN_SECS",
                DEFAULT_RATE_LIMIT_COOLDOWN_SECS,
            )),
            stop_on_terminal: env.bool("STOP_ON_FIRST_204", defaults.stop_on_terminal),
            archive_day_limit: env
                .string("ARCHIVE_DAY_LIMIT")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|d| *d > 0),
            timezone: env
                .string("HARVEST_TIMEZONE")
                .and_then(|v| v.parse::<Tz>().ok())
                .unwrap_or(defaults.timezone),
            layout: StorageLayout {
                documents_prefix: env
                    .string("STORAGE_DOCUMENTS_PREFIX")
                    .unwrap_or(defaults.layout.documents_prefix),
                archives_prefix: env
                    .string("STORAGE_ARCHIVES_PREFIX")
                    .unwrap_or(defaults.layout.archives_prefix),
                status_prefix: env
                    .string("STORAGE_STATUS_PREFIX")
                    .unwrap_or(defaults.layout.status_prefix),
            },
        }
        .normalized()
    }

    /// Clamp values that would stall or panic the scheduler.
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.batch_size = self.batch_size.max(1);
        self
    }
}

/// Settings for the upstream HTTP transport.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    /// Path appended to `base_url`; `{nsu}` and `{tenant}` are substituted.
    pub path_template: String,
    pub timeout: Duration,
    /// Retries on 5xx and network errors. 429 is never retried here.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ADN_BASE_URL.to_string(),
            path_template: DEFAULT_PATH_TEMPLATE.to_string(),
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            max_retries: DEFAULT_HTTP_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            user_agent: format!("nfse-harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = EnvReader(&lookup);
        Self {
            base_url: env.string("ADN_BASE_URL").unwrap_or(defaults.base_url),
            path_template: env
                .string("ADN_PATH_TEMPLATE")
                .unwrap_or(defaults.path_template),
            timeout: Duration::from_secs(
                env.u64("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS).max(1),
            ),
            max_retries: u32::try_from(env.u64("HTTP_MAX_RETRIES", DEFAULT_HTTP_MAX_RETRIES.into()))
                .unwrap_or(DEFAULT_HTTP_MAX_RETRIES),
            retry_base_delay: defaults.retry_base_delay,
            user_agent: env.string("HTTP_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    /// Full URL for probing `nsu` on behalf of `tenant`.
    pub fn document_url(&self, nsu: u64, tenant: &str) -> String {
        let path = self
            .path_template
            .replace("{nsu}", &nsu.to_string())
            .replace("{tenant}", tenant);
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        self.string(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        self.string(name)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(default)
    }

    fn bool(&self, name: &str, default: bool) -> bool {
        match self.string(name) {
            Some(v) => !matches!(
                v.to_lowercase().as_str(),
                "0" | "false" | "no" | "off" | "nao" | "não"
            ),
            None => default,
        }
    }
}
