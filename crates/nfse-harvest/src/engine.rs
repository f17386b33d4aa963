//! Round driver: runs every tenant through fetch, cursor and archive steps.
//!
//! Tenants are processed one after another. A failure in one tenant is
//! recorded in its report and never stops the others.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::archive::{ArchiveConsolidator, ConsolidationOutcome};
use crate::config::HarvestConfig;
use crate::cursor::{CursorManager, CursorStore};
use crate::period::{today_in, Period};
use crate::persist::DocumentStore;
use crate::scheduler::{BatchScheduler, RoundPlan, RoundReport};
use crate::source::SourceConnector;
use crate::storage::ObjectStore;
use crate::types::{Tenant, TenantId};

/// Steps a tenant passes through within one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantPhase {
    Idle,
    Fetching,
    StoppedSafe,
    StoppedUnconfirmed,
    CursorPersisted,
    Consolidating,
}

/// How a tenant's round ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TenantStatus {
    Skipped { reason: String },
    Harvested,
    Failed { error: String },
}

/// Everything that happened to one tenant in one round.
#[derive(Debug, Clone, Serialize)]
pub struct TenantReport {
    pub tenant: TenantId,
    pub name: String,
    pub period: String,
    #[serde(flatten)]
    pub status: TenantStatus,
    pub cursor_before: Option<u64>,
    pub cursor_after: Option<u64>,
    pub round: Option<RoundReport>,
    pub consolidation: Option<ConsolidationOutcome>,
    /// Set when the cursor or archive step failed after a successful fetch.
    pub warnings: Vec<String>,
    pub phases: Vec<TenantPhase>,
}

impl TenantReport {
    fn new(tenant: &Tenant, period: &Period) -> Self {
        Self {
            tenant: tenant.id.clone(),
            name: tenant.name.clone(),
            period: period.code(),
            status: TenantStatus::Harvested,
            cursor_before: None,
            cursor_after: None,
            round: None,
            consolidation: None,
            warnings: Vec::new(),
            phases: vec![TenantPhase::Idle],
        }
    }

    fn enter(&mut self, phase: TenantPhase) {
        self.phases.push(phase);
    }

    pub fn documents_saved(&self) -> usize {
        self.round.as_ref().map_or(0, |r| r.documents_saved)
    }
}

/// Result of [`Harvester::run_round`].
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub period: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tenants: Vec<TenantReport>,
}

impl RoundSummary {
    pub fn harvested(&self) -> usize {
        self.count(|s| matches!(s, TenantStatus::Harvested))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, TenantStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TenantStatus::Failed { .. }))
    }

    pub fn documents_saved(&self) -> usize {
        self.tenants.iter().map(TenantReport::documents_saved).sum()
    }

    fn count(&self, pred: impl Fn(&TenantStatus) -> bool) -> usize {
        self.tenants.iter().filter(|t| pred(&t.status)).count()
    }
}

/// Owns the engine's components and runs rounds over a tenant list.
pub struct Harvester {
    config: HarvestConfig,
    connector: Arc<dyn SourceConnector>,
    cursors: CursorManager,
    documents: DocumentStore,
    consolidator: ArchiveConsolidator,
}

impl Harvester {
    pub fn new(
        config: HarvestConfig,
        connector: Arc<dyn SourceConnector>,
        objects: Arc<dyn ObjectStore>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let config = config.normalized();
        Self {
            cursors: CursorManager::new(cursors, config.default_start),
            documents: DocumentStore::new(objects.clone(), config.layout.clone()),
            consolidator: ArchiveConsolidator::new(objects, config.layout.clone()),
            connector,
            config,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn cursors(&self) -> &CursorManager {
        &self.cursors
    }

    /// One round over `tenants` for the previous month in the configured zone.
    pub async fn run_round(&self, tenants: &[Tenant]) -> RoundSummary {
        self.run_round_on(tenants, today_in(self.config.timezone))
            .await
    }

    /// One round as if today were `today`.
    pub async fn run_round_on(&self, tenants: &[Tenant], today: NaiveDate) -> RoundSummary {
        let period = Period::previous_month_of(today);
        let started_at = Utc::now();
        tracing::info!(period = %period, tenants = tenants.len(), "harvest round started");

        let mut reports = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            reports.push(self.process_tenant(tenant, &period, today).await);
        }

        let summary = RoundSummary {
            period: period.code(),
            started_at,
            finished_at: Utc::now(),
            tenants: reports,
        };
        tracing::info!(
            period = %period,
            harvested = summary.harvested(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            saved = summary.documents_saved(),
            "harvest round finished"
        );
        summary
    }

    /// Fetch, persist the cursor and consolidate for a single tenant.
    pub async fn process_tenant(
        &self,
        tenant: &Tenant,
        period: &Period,
        today: NaiveDate,
    ) -> TenantReport {
        let mut report = TenantReport::new(tenant, period);

        if let Err(reason) = tenant.eligibility(today) {
            tracing::info!(tenant = %tenant.id, name = %tenant.name, "skipping tenant: {reason}");
            report.status = TenantStatus::Skipped {
                reason: reason.to_string(),
            };
            return report;
        }

        let source = match self.connector.connect(tenant) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(tenant = %tenant.id, name = %tenant.name, "cannot build upstream client: {e}");
                report.status = TenantStatus::Failed {
                    error: e.to_string(),
                };
                return report;
            }
        };

        let cursor = self.cursors.get(&tenant.id).await;
        report.cursor_before = Some(cursor);
        let plan = RoundPlan::from_config(&self.config, cursor.saturating_add(1));

        report.enter(TenantPhase::Fetching);
        let round = BatchScheduler::new(&self.config, &self.documents)
            .run(source.as_ref(), &tenant.id, period, plan)
            .await;
        report.enter(if round.unconfirmed_stop {
            TenantPhase::StoppedUnconfirmed
        } else {
            TenantPhase::StoppedSafe
        });

        report.cursor_after = Some(cursor);
        match round.highest_confirmed_nsu {
            Some(highest) => match self.cursors.upsert(&tenant.id, highest).await {
                Ok(stored) => {
                    report.cursor_after = Some(stored);
                    report.enter(TenantPhase::CursorPersisted);
                }
                Err(e) => report.warnings.push(format!("cursor not persisted: {e}")),
            },
            None => {
                tracing::info!(
                    tenant = %tenant.id,
                    cursor,
                    reason = %round.reason,
                    "no confirmed outcome, cursor left unchanged"
                );
            }
        }
        report.round = Some(round);

        if self.consolidation_due(today) {
            report.enter(TenantPhase::Consolidating);
            match self.consolidator.consolidate(tenant, period).await {
                Ok(outcome) => report.consolidation = Some(outcome),
                Err(e) => {
                    tracing::error!(tenant = %tenant.id, period = %period, "consolidation failed: {e}");
                    report.warnings.push(format!("consolidation failed: {e}"));
                }
            }
        } else {
            tracing::debug!(
                tenant = %tenant.id,
                day = today.day(),
                limit = ?self.config.archive_day_limit,
                "outside consolidation window"
            );
        }

        report.enter(TenantPhase::Idle);
        report
    }

    /// Consolidate the period for every eligible tenant without fetching.
    pub async fn consolidate_all(
        &self,
        tenants: &[Tenant],
        period: &Period,
        today: NaiveDate,
    ) -> Vec<(TenantId, Result<ConsolidationOutcome, String>)> {
        let mut results = Vec::new();
        for tenant in tenants {
            if let Err(reason) = tenant.eligibility(today) {
                tracing::info!(tenant = %tenant.id, "skipping tenant: {reason}");
                continue;
            }
            let result = self
                .consolidator
                .consolidate(tenant, period)
                .await
                .map_err(|e| {
                    tracing::error!(tenant = %tenant.id, period = %period, "consolidation failed: {e}");
                    e.to_string()
                });
            results.push((tenant.id.clone(), result));
        }
        results
    }

    fn consolidation_due(&self, today: NaiveDate) -> bool {
        self.config
            .archive_day_limit
            .map_or(true, |limit| today.day() <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::cursor::MemoryCursorStore;
    use crate::scheduler::StopReason;
    use crate::source::{DocumentSource, SourceResponse};
    use crate::storage::MemoryObjectStore;
    use crate::types::{EncodedCredentials, HarvestError, HarvestResult};

    const TODAY: (i32, u32, u32) = (2025, 4, 2);

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(TODAY.0, TODAY.1, TODAY.2).unwrap()
    }

    fn tenant(id: &str) -> Tenant {
        Tenant {
            id: TenantId::normalize(id).unwrap(),
            name: format!("Tenant {id}"),
            customer_code: Some(1),
            user: "ops".to_string(),
            enabled: true,
            expires_on: None,
            credentials: EncodedCredentials::default(),
        }
    }

    /// Every NSU up to `last` is confirmed with one March document, then 204.
    struct SteadySource {
        last: u64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSource for SteadySource {
        async fn fetch(&self, nsu: u64) -> HarvestResult<SourceResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if nsu > self.last {
                return Ok(SourceResponse {
                    status: 204,
                    content_type: None,
                    retry_after: None,
                    body: String::new(),
                });
            }
            let body = serde_json::json!({
                "LoteDFe": [{"ArquivoXml": format!("<NFSe><nNFSe>{nsu}</nNFSe><dataEmissao>2025-03-15</dataEmissao></NFSe>")}]
            });
            Ok(SourceResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                retry_after: None,
                body: body.to_string(),
            })
        }
    }

    struct SteadyConnector {
        last: u64,
    }

    impl SourceConnector for SteadyConnector {
        fn connect(&self, tenant: &Tenant) -> HarvestResult<Arc<dyn DocumentSource>> {
            if tenant.name.contains("broken") {
                return Err(HarvestError::Configuration("bad certificate".to_string()));
            }
            Ok(Arc::new(SteadySource {
                last: self.last,
                calls: AtomicUsize::new(0),
            }))
        }
    }

    fn harvester(
        last: u64,
        config: HarvestConfig,
    ) -> (Harvester, Arc<MemoryObjectStore>, Arc<MemoryCursorStore>) {
        let objects = Arc::new(MemoryObjectStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let harvester = Harvester::new(
            config,
            Arc::new(SteadyConnector { last }),
            objects.clone(),
            cursors.clone(),
        );
        (harvester, objects, cursors)
    }

    #[tokio::test]
    async fn test_round_advances_cursor_and_consolidates() {
        let (harvester, objects, _) = harvester(7, HarvestConfig::default());
        let t = tenant("12345678000190");

        let summary = harvester.run_round_on(&[t.clone()], today()).await;

        assert_eq!(summary.period, "202503");
        let report = &summary.tenants[0];
        assert_eq!(report.status, TenantStatus::Harvested);
        assert_eq!(report.cursor_before, Some(0));
        assert_eq!(report.cursor_after, Some(7));
        assert_eq!(report.documents_saved(), 7);
        assert_eq!(
            report.phases,
            vec![
                TenantPhase::Idle,
                TenantPhase::Fetching,
                TenantPhase::StoppedSafe,
                TenantPhase::CursorPersisted,
                TenantPhase::Consolidating,
                TenantPhase::Idle,
            ]
        );
        assert!(matches!(
            report.consolidation,
            Some(ConsolidationOutcome::Rebuilt { file_count: 7, complete: true, .. })
        ));
        assert_eq!(harvester.cursors().get(&t.id).await, 7);
        // 7 documents, 1 archive, 1 state file
        assert_eq!(objects.paths().await.len(), 9);
    }

    #[tokio::test]
    async fn test_second_round_resumes_after_cursor() {
        let (harvester, objects, _) = harvester(3, HarvestConfig::default());
        let t = tenant("12345678000190");
        harvester.run_round_on(&[t.clone()], today()).await;
        let puts = objects.put_count();

        let summary = harvester.run_round_on(&[t], today()).await;
        let report = &summary.tenants[0];
        assert_eq!(report.cursor_before, Some(3));
        assert_eq!(report.cursor_after, Some(3));
        assert!(!report.phases.contains(&TenantPhase::CursorPersisted));
        assert!(matches!(
            report.consolidation,
            Some(ConsolidationOutcome::Unchanged { file_count: 3, .. })
        ));
        assert_eq!(objects.put_count(), puts);
    }

    #[tokio::test]
    async fn test_ineligible_and_broken_tenants_do_not_stop_round() {
        let (harvester, _, _) = harvester(2, HarvestConfig::default());
        let mut disabled = tenant("11111111000111");
        disabled.enabled = false;
        let mut expired = tenant("22222222000122");
        expired.expires_on = NaiveDate::from_ymd_opt(2025, 1, 31);
        let mut broken = tenant("33333333000133");
        broken.name = "broken cert".to_string();
        let healthy = tenant("44444444000144");

        let summary = harvester
            .run_round_on(&[disabled, expired, broken, healthy], today())
            .await;

        assert_eq!(summary.skipped(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.harvested(), 1);
        assert_eq!(summary.tenants[3].cursor_after, Some(2));
        assert!(summary.tenants[0].round.is_none());
    }

    #[tokio::test]
    async fn test_consolidation_window() {
        let config = HarvestConfig {
            archive_day_limit: Some(1),
            ..HarvestConfig::default()
        };
        let (harvester, _, _) = harvester(1, config);
        let summary = harvester
            .run_round_on(&[tenant("12345678000190")], today())
            .await;
        let report = &summary.tenants[0];
        assert!(report.consolidation.is_none());
        assert!(!report.phases.contains(&TenantPhase::Consolidating));
        assert_eq!(report.cursor_after, Some(1));
    }

    /// Answers every sequence number with the same response.
    struct FixedConnector {
        response: SourceResponse,
    }

    struct FixedSource {
        response: SourceResponse,
    }

    #[async_trait]
    impl DocumentSource for FixedSource {
        async fn fetch(&self, _nsu: u64) -> HarvestResult<SourceResponse> {
            Ok(self.response.clone())
        }
    }

    impl SourceConnector for FixedConnector {
        fn connect(&self, _tenant: &Tenant) -> HarvestResult<Arc<dyn DocumentSource>> {
            Ok(Arc::new(FixedSource {
                response: self.response.clone(),
            }))
        }
    }

    /// Memory cursor store that counts writes.
    struct CountingCursors {
        inner: MemoryCursorStore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl CursorStore for CountingCursors {
        async fn load(&self, tenant: &TenantId) -> HarvestResult<Option<u64>> {
            self.inner.load(tenant).await
        }
        async fn store(&self, tenant: &TenantId, nsu: u64) -> HarvestResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.store(tenant, nsu).await
        }
    }

    async fn round_without_confirmation(response: SourceResponse) -> (TenantReport, usize, u64) {
        let t = tenant("12345678000190");
        let cursors = Arc::new(CountingCursors {
            inner: MemoryCursorStore::with_cursor(&t.id, 10),
            writes: AtomicUsize::new(0),
        });
        let harvester = Harvester::new(
            HarvestConfig::default(),
            Arc::new(FixedConnector { response }),
            Arc::new(MemoryObjectStore::new()),
            cursors.clone(),
        );

        let mut summary = harvester.run_round_on(&[t.clone()], today()).await;
        let stored = cursors.inner.load(&t.id).await.unwrap().unwrap();
        (summary.tenants.remove(0), cursors.writes.load(Ordering::SeqCst), stored)
    }

    #[tokio::test]
    async fn test_rejection_only_round_never_writes_cursor() {
        let body = serde_json::json!({
            "StatusProcessamento": "REJEICAO",
            "Erros": [{"Codigo": "E2214"}]
        });
        let (report, writes, stored) = round_without_confirmation(SourceResponse {
            status: 400,
            content_type: Some("application/json".to_string()),
            retry_after: None,
            body: body.to_string(),
        })
        .await;

        let round = report.round.as_ref().unwrap();
        assert_eq!(
            round.reason,
            StopReason::Rejected {
                code: Some("E2214".to_string())
            }
        );
        assert!(round.unconfirmed_stop);
        assert_eq!(round.highest_confirmed_nsu, None);
        assert!(report.phases.contains(&TenantPhase::StoppedUnconfirmed));
        assert_eq!(report.cursor_after, Some(10));
        assert_eq!(writes, 0);
        assert_eq!(stored, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_only_round_never_writes_cursor() {
        let (report, writes, stored) = round_without_confirmation(SourceResponse {
            status: 429,
            content_type: None,
            retry_after: Some(std::time::Duration::from_secs(2)),
            body: String::new(),
        })
        .await;

        let round = report.round.as_ref().unwrap();
        assert_eq!(round.reason, StopReason::RateLimited { cooldown_secs: 2 });
        assert!(round.unconfirmed_stop);
        assert!(!report.phases.contains(&TenantPhase::CursorPersisted));
        assert_eq!(report.cursor_after, Some(10));
        assert_eq!(writes, 0);
        assert_eq!(stored, 10);
    }
}
