//! Batch fetch scheduler: probes a range of sequence numbers for one tenant.
//!
//! The range `[start, start + max_span)` is split into consecutive batches.
//! Batches run strictly in order; inside a batch up to `concurrency` probes
//! are in flight and results are handled as they complete. A stop outcome
//! cancels the shared token: probes not yet issued are skipped and no further
//! batch starts, while probes already in flight finish and are still
//! classified.
//!
//! The safe resume point is the highest NSU with a `CONFIRMED` outcome. The
//! highest NSU merely probed is reported for diagnostics only.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::classify::{classify_response, Outcome, OutcomeKind};
use crate::config::HarvestConfig;
use crate::extract::{document_in_period, embedded_documents};
use crate::period::Period;
use crate::persist::DocumentStore;
use crate::source::DocumentSource;
use crate::types::TenantId;

/// Range and parallelism for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundPlan {
    pub start_nsu: u64,
    pub max_span: u64,
    pub concurrency: usize,
    pub batch_size: u64,
}

impl RoundPlan {
    pub fn from_config(config: &HarvestConfig, start_nsu: u64) -> Self {
        Self {
            start_nsu,
            max_span: config.max_span,
            concurrency: config.concurrency.max(1),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Exclusive end of the probed range.
    pub fn end_nsu(&self) -> u64 {
        self.start_nsu.saturating_add(self.max_span)
    }

    /// `[start, end)` pairs for each batch, in order.
    pub fn batches(&self) -> impl Iterator<Item = (u64, u64)> {
        let end = self.end_nsu();
        let size = self.batch_size.max(1);
        let mut next = self.start_nsu;
        std::iter::from_fn(move || {
            if next >= end {
                return None;
            }
            let batch = (next, next.saturating_add(size).min(end));
            next = batch.1;
            Some(batch)
        })
    }
}

/// Why a round ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// 204: end of available data.
    Exhausted,
    NoDocument,
    Rejected { code: Option<String> },
    RateLimited { cooldown_secs: u64 },
    /// The whole span was probed without a stop outcome.
    SpanCompleted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => f.write_str("no more content (204)"),
            StopReason::NoDocument => f.write_str("NENHUM_DOCUMENTO_LOCALIZADO"),
            StopReason::Rejected { code: Some(code) } => write!(f, "REJEICAO:{code}"),
            StopReason::Rejected { code: None } => f.write_str("REJEICAO"),
            StopReason::RateLimited { cooldown_secs } => {
                write!(f, "rate limited (cooldown {cooldown_secs}s)")
            }
            StopReason::SpanCompleted => f.write_str("span completed"),
        }
    }
}

/// One probe's classification. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub sequence_number: u64,
    pub classification: OutcomeKind,
    pub documents_found: usize,
}

/// Result of [`BatchScheduler::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub documents_found: usize,
    pub documents_in_period: usize,
    pub documents_saved: usize,
    pub confirmed_count: usize,
    /// Safe resume point: highest NSU with a `CONFIRMED` outcome.
    pub highest_confirmed_nsu: Option<u64>,
    /// Highest NSU that produced any outcome. Diagnostics only.
    pub highest_probed_nsu: Option<u64>,
    pub probes_issued: usize,
    pub probes_skipped: usize,
    /// The round stopped on NO_DOCUMENT/REJECTED/RATE_LIMITED before any
    /// outcome was confirmed.
    pub unconfirmed_stop: bool,
    pub reason: StopReason,
    pub counts: BTreeMap<&'static str, usize>,
    pub outcomes: Vec<FetchOutcome>,
}

impl RoundReport {
    fn new() -> Self {
        Self {
            documents_found: 0,
            documents_in_period: 0,
            documents_saved: 0,
            confirmed_count: 0,
            highest_confirmed_nsu: None,
            highest_probed_nsu: None,
            probes_issued: 0,
            probes_skipped: 0,
            unconfirmed_stop: false,
            reason: StopReason::SpanCompleted,
            counts: BTreeMap::new(),
            outcomes: Vec::new(),
        }
    }

    /// Whether the cursor may be advanced from this round.
    pub fn made_progress(&self) -> bool {
        self.highest_confirmed_nsu.is_some()
    }
}

/// Drives probes for one tenant-round.
pub struct BatchScheduler<'a> {
    config: &'a HarvestConfig,
    documents: &'a DocumentStore,
}

/// One issued probe: its classification and what was stored from it.
struct Probe {
    nsu: u64,
    outcome: Outcome,
    stored: StoredCounts,
}

#[derive(Debug, Default, Clone, Copy)]
struct StoredCounts {
    found: usize,
    in_period: usize,
    saved: usize,
}

/// Per-round mutable state shared by result handling.
struct RoundState {
    report: RoundReport,
    stop: Option<StopReason>,
    cooldown: Option<Duration>,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(config: &'a HarvestConfig, documents: &'a DocumentStore) -> Self {
        Self { config, documents }
    }

    /// Probe `plan`'s range against `source` and store in-period documents.
    pub async fn run(
        &self,
        source: &dyn DocumentSource,
        tenant: &TenantId,
        period: &Period,
        plan: RoundPlan,
    ) -> RoundReport {
        let cancel = CancellationToken::new();
        let mut state = RoundState {
            report: RoundReport::new(),
            stop: None,
            cooldown: None,
        };

        tracing::info!(
            tenant = %tenant,
            period = %period,
            start = plan.start_nsu,
            end = plan.end_nsu(),
            batch_size = plan.batch_size,
            concurrency = plan.concurrency,
            "round started"
        );

        for (batch_start, batch_end) in plan.batches() {
            if cancel.is_cancelled() {
                break;
            }
            tracing::debug!(tenant = %tenant, batch_start, batch_end, "batch started");

            // Storing runs inside each probe so saves overlap with the
            // fetches still in flight.
            let mut probes = stream::iter(batch_start..batch_end)
                .map(|nsu| {
                    let cancel = cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return None;
                        }
                        let outcome = match source.fetch(nsu).await {
                            Ok(response) => classify_response(&response),
                            Err(e) => Outcome::TransientError {
                                reason: e.to_string(),
                            },
                        };
                        let stored = match &outcome {
                            Outcome::Confirmed { body } => {
                                self.store_documents(tenant, period, nsu, body).await
                            }
                            _ => StoredCounts::default(),
                        };
                        Some(Probe {
                            nsu,
                            outcome,
                            stored,
                        })
                    }
                })
                .buffer_unordered(plan.concurrency);

            while let Some(probe) = probes.next().await {
                match probe {
                    Some(probe) => {
                        state.report.probes_issued += 1;
                        self.record(tenant, period, probe, &mut state, &cancel);
                    }
                    None => state.report.probes_skipped += 1,
                }
            }
        }

        if let Some(cooldown) = state.cooldown {
            tracing::warn!(
                tenant = %tenant,
                cooldown_secs = cooldown.as_secs(),
                "rate limited, cooling down"
            );
            tokio::time::sleep(cooldown).await;
        }

        let mut report = state.report;
        report.reason = state.stop.unwrap_or(StopReason::SpanCompleted);
        tracing::info!(
            tenant = %tenant,
            period = %period,
            confirmed = report.confirmed_count,
            highest_confirmed = ?report.highest_confirmed_nsu,
            highest_probed = ?report.highest_probed_nsu,
            found = report.documents_found,
            saved = report.documents_saved,
            unconfirmed_stop = report.unconfirmed_stop,
            reason = %report.reason,
            "round finished"
        );
        report
    }

    /// Stop reason for an outcome that ends the round, `None` otherwise.
    fn stop_reason(&self, outcome: &Outcome) -> Option<StopReason> {
        if !outcome.stops_round(self.config.stop_on_terminal) {
            return None;
        }
        Some(match outcome {
            Outcome::Done => StopReason::Exhausted,
            Outcome::NoDocument => StopReason::NoDocument,
            Outcome::Rejected { code } => StopReason::Rejected { code: code.clone() },
            Outcome::RateLimited { retry_after } => StopReason::RateLimited {
                cooldown_secs: self.cooldown_for(*retry_after).as_secs(),
            },
            Outcome::TransientError { .. } | Outcome::Confirmed { .. } | Outcome::Malformed { .. } => {
                return None
            }
        })
    }

    fn cooldown_for(&self, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or(self.config.rate_limit_cooldown_default)
    }

    /// Save the in-period documents embedded in a confirmed body.
    async fn store_documents(
        &self,
        tenant: &TenantId,
        period: &Period,
        nsu: u64,
        body: &serde_json::Value,
    ) -> StoredCounts {
        let mut counts = StoredCounts::default();
        for (idx, doc) in embedded_documents(body).enumerate() {
            counts.found += 1;
            if !document_in_period(&doc, period) {
                continue;
            }
            counts.in_period += 1;
            if self.documents.save(tenant, period, nsu, idx + 1, &doc).await {
                counts.saved += 1;
            }
        }
        counts
    }

    fn record(
        &self,
        tenant: &TenantId,
        period: &Period,
        probe: Probe,
        state: &mut RoundState,
        cancel: &CancellationToken,
    ) {
        let Probe {
            nsu,
            outcome,
            stored,
        } = probe;
        let kind = outcome.kind();
        *state.report.counts.entry(kind.as_str()).or_insert(0) += 1;
        state.report.highest_probed_nsu = state.report.highest_probed_nsu.max(Some(nsu));

        if let Some(reason) = self.stop_reason(&outcome) {
            // Probes already in flight may report later stops; the first wins.
            if state.stop.is_none() {
                state.report.unconfirmed_stop =
                    outcome.is_unconfirmed_stop() && state.report.confirmed_count == 0;
                tracing::info!(
                    tenant = %tenant,
                    period = %period,
                    nsu,
                    outcome = %kind,
                    unconfirmed = state.report.unconfirmed_stop,
                    "stopping round: {reason}"
                );
                state.stop = Some(reason);
            }
            cancel.cancel();
        }

        match outcome {
            Outcome::Confirmed { .. } => {
                let report = &mut state.report;
                report.confirmed_count += 1;
                report.highest_confirmed_nsu = report.highest_confirmed_nsu.max(Some(nsu));
                report.documents_found += stored.found;
                report.documents_in_period += stored.in_period;
                report.documents_saved += stored.saved;
                tracing::info!(
                    tenant = %tenant,
                    period = %period,
                    nsu,
                    outcome = %kind,
                    found = stored.found,
                    in_period = stored.in_period,
                    saved = stored.saved,
                    "probe confirmed"
                );
            }
            Outcome::RateLimited { retry_after } => {
                let cooldown = self.cooldown_for(retry_after);
                state.cooldown = state.cooldown.max(Some(cooldown));
            }
            Outcome::Done if !self.config.stop_on_terminal => {
                tracing::debug!(tenant = %tenant, period = %period, nsu, outcome = %kind, "no content, continuing");
            }
            Outcome::TransientError { reason } | Outcome::Malformed { reason } => {
                tracing::warn!(tenant = %tenant, period = %period, nsu, outcome = %kind, "skipping: {reason}");
            }
            Outcome::Done | Outcome::NoDocument | Outcome::Rejected { .. } => {}
        }

        state.report.outcomes.push(FetchOutcome {
            sequence_number: nsu,
            classification: kind,
            documents_found: stored.found,
        });
    }
}
