//! Period archives: one ZIP per tenant and month, rebuilt only when the set
//! of stored documents changes.

use std::io::{Cursor, Write};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::period::Period;
use crate::storage::{ObjectStore, StorageLayout};
use crate::types::{HarvestResult, PeriodArchiveState, Tenant};

/// Digest over the sorted member names.
pub fn member_hash(sorted_names: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in sorted_names {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// What a consolidation call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    /// No documents stored for the period.
    Empty,
    /// Member set matches the recorded state; nothing uploaded.
    Unchanged { member_hash: String, file_count: usize },
    /// Archive rebuilt and uploaded. `complete` is false when some member
    /// could not be downloaded; the state is then left unrecorded.
    Rebuilt {
        path: String,
        member_hash: String,
        file_count: usize,
        complete: bool,
    },
}

/// Builds and uploads period archives.
pub struct ArchiveConsolidator {
    objects: Arc<dyn ObjectStore>,
    layout: StorageLayout,
}

impl ArchiveConsolidator {
    pub fn new(objects: Arc<dyn ObjectStore>, layout: StorageLayout) -> Self {
        Self { objects, layout }
    }

    /// Rebuild the tenant's archive for `period` if its member set changed.
    pub async fn consolidate(
        &self,
        tenant: &Tenant,
        period: &Period,
    ) -> HarvestResult<ConsolidationOutcome> {
        let dir = self.layout.document_dir(&tenant.id, period);
        let mut names: Vec<String> = self
            .objects
            .list(&dir, None)
            .await?
            .into_iter()
            .map(|e| e.name)
            .filter(|n| n.to_ascii_lowercase().ends_with(".xml"))
            .collect();

        if names.is_empty() {
            tracing::info!(tenant = %tenant.id, period = %period, "no documents stored, archive not built");
            return Ok(ConsolidationOutcome::Empty);
        }

        names.sort();
        names.dedup();
        let hash = member_hash(&names);
        let status_path = self.layout.status_path(&tenant.id, period);

        if let Some(previous) = self.load_state(&status_path).await {
            if previous.member_hash == hash {
                tracing::info!(
                    tenant = %tenant.id,
                    period = %period,
                    files = names.len(),
                    "archive up to date"
                );
                return Ok(ConsolidationOutcome::Unchanged {
                    member_hash: hash,
                    file_count: names.len(),
                });
            }
        }

        tracing::info!(
            tenant = %tenant.id,
            period = %period,
            files = names.len(),
            "building archive"
        );

        let mut members = Vec::with_capacity(names.len());
        let mut missing = 0usize;
        for name in &names {
            let path = format!("{dir}/{name}");
            match self.objects.get(&path).await {
                Ok(Some(bytes)) => members.push((name.clone(), bytes)),
                Ok(None) => {
                    missing += 1;
                    tracing::warn!(tenant = %tenant.id, period = %period, path = %path, "archive member vanished");
                }
                Err(e) => {
                    missing += 1;
                    tracing::warn!(tenant = %tenant.id, period = %period, path = %path, "archive member download failed: {e}");
                }
            }
        }

        let archive = build_archive(&members)?;
        let archive_path = self.layout.archive_path(period, &tenant.archive_label());
        self.objects
            .put(&archive_path, archive, "application/zip", true)
            .await?;
        tracing::info!(
            tenant = %tenant.id,
            period = %period,
            path = %archive_path,
            files = members.len(),
            "archive uploaded"
        );

        let complete = missing == 0;
        if complete {
            let state = PeriodArchiveState {
                tenant_id: tenant.id.clone(),
                period: period.code(),
                member_hash: hash.clone(),
                file_count: names.len(),
                updated_at: Utc::now(),
            };
            self.objects
                .put(
                    &status_path,
                    serde_json::to_vec_pretty(&state)?,
                    "application/json",
                    true,
                )
                .await?;
        } else {
            tracing::warn!(
                tenant = %tenant.id,
                period = %period,
                missing,
                "archive incomplete, state not recorded so the next round rebuilds"
            );
        }

        Ok(ConsolidationOutcome::Rebuilt {
            path: archive_path,
            member_hash: hash,
            file_count: members.len(),
            complete,
        })
    }

    /// Previously recorded state. Unreadable state means "rebuild".
    async fn load_state(&self, path: &str) -> Option<PeriodArchiveState> {
        match self.objects.get(path).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!(path = %path, "ignoring unreadable archive state: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(path = %path, "archive state read failed: {e}");
                None
            }
        }
    }
}

/// ZIP the members in the given order.
pub fn build_archive(members: &[(String, Vec<u8>)]) -> HarvestResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in members {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}
