//! Per-tenant NSU cursor with monotonic max-merge semantics.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{HarvestError, HarvestResult, TenantId};

/// Durable storage for the last confirmed NSU per tenant.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored value, or `None` when the tenant has no cursor yet.
    async fn load(&self, tenant: &TenantId) -> HarvestResult<Option<u64>>;

    /// Update the tenant's row if it exists, insert it otherwise.
    async fn store(&self, tenant: &TenantId, nsu: u64) -> HarvestResult<()>;
}

/// Reads and advances cursors. Never lowers a stored value.
pub struct CursorManager {
    store: Arc<dyn CursorStore>,
    default_start: u64,
}

impl CursorManager {
    pub fn new(store: Arc<dyn CursorStore>, default_start: u64) -> Self {
        Self {
            store,
            default_start,
        }
    }

    /// Last confirmed NSU, or the configured default. Read failures are
    /// logged and degrade to the default.
    pub async fn get(&self, tenant: &TenantId) -> u64 {
        match self.store.load(tenant).await {
            Ok(Some(nsu)) => nsu,
            Ok(None) => self.default_start,
            Err(e) => {
                tracing::warn!(
                    tenant = %tenant,
                    default = self.default_start,
                    "cursor read failed, using default: {e}"
                );
                self.default_start
            }
        }
    }

    /// Store `max(current, candidate)` and return the stored value.
    ///
    /// If the current value cannot be read nothing is written: writing the
    /// candidate blindly could lower a cursor another round already raised.
    pub async fn upsert(&self, tenant: &TenantId, candidate: u64) -> HarvestResult<u64> {
        let current = self.store.load(tenant).await.map_err(|e| {
            tracing::warn!(tenant = %tenant, candidate, "cursor read before upsert failed: {e}");
            e
        })?;

        let merged = current.map_or(candidate, |c| c.max(candidate));
        if current == Some(merged) {
            tracing::debug!(tenant = %tenant, nsu = merged, "cursor already at or past candidate");
            return Ok(merged);
        }

        self.store.store(tenant, merged).await.map_err(|e| {
            tracing::warn!(tenant = %tenant, nsu = merged, "cursor write failed: {e}");
            e
        })?;
        tracing::info!(
            tenant = %tenant,
            previous = ?current,
            nsu = merged,
            "cursor advanced"
        );
        Ok(merged)
    }
}

/// In-process cursor store.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<BTreeMap<TenantId, u64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store.
    pub fn with_cursor(tenant: &TenantId, nsu: u64) -> Self {
        let mut cursors = BTreeMap::new();
        cursors.insert(tenant.clone(), nsu);
        Self {
            cursors: Mutex::new(cursors),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, tenant: &TenantId) -> HarvestResult<Option<u64>> {
        Ok(self.cursors.lock().await.get(tenant).copied())
    }

    async fn store(&self, tenant: &TenantId, nsu: u64) -> HarvestResult<()> {
        self.cursors.lock().await.insert(tenant.clone(), nsu);
        Ok(())
    }
}

/// Cursor store kept as a JSON object (`{"<tenant>": nsu}`) in one file.
pub struct FileCursorStore {
    path: PathBuf,
    // serializes read-modify-write within this process
    lock: Mutex<()>,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> HarvestResult<BTreeMap<String, u64>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                HarvestError::Storage(format!(
                    "corrupt cursor file {}: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, tenant: &TenantId) -> HarvestResult<Option<u64>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.get(tenant.as_str()).copied())
    }

    async fn store(&self, tenant: &TenantId, nsu: u64) -> HarvestResult<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(tenant.to_string(), nsu);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&all)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tenant() -> TenantId {
        TenantId::normalize("12345678000190").unwrap()
    }

    /// Store whose reads always fail; counts writes.
    #[derive(Default)]
    struct BrokenReads {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl CursorStore for BrokenReads {
        async fn load(&self, _tenant: &TenantId) -> HarvestResult<Option<u64>> {
            Err(HarvestError::Storage("connection reset".to_string()))
        }

        async fn store(&self, _tenant: &TenantId, _nsu: u64) -> HarvestResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_get_defaults_when_absent() {
        let manager = CursorManager::new(Arc::new(MemoryCursorStore::new()), 5);
        assert_eq!(manager.get(&tenant()).await, 5);
    }

    #[tokio::test]
    async fn test_upsert_is_monotonic() {
        let manager = CursorManager::new(Arc::new(MemoryCursorStore::new()), 0);
        let candidates = [40u64, 12, 97, 3, 97, 55];
        for c in candidates {
            manager.upsert(&tenant(), c).await.unwrap();
        }
        assert_eq!(manager.get(&tenant()).await, 97);
    }

    #[tokio::test]
    async fn test_upsert_keeps_higher_initial_value() {
        let store = Arc::new(MemoryCursorStore::with_cursor(&tenant(), 500));
        let manager = CursorManager::new(store, 0);
        assert_eq!(manager.upsert(&tenant(), 120).await.unwrap(), 500);
        assert_eq!(manager.upsert(&tenant(), 501).await.unwrap(), 501);
    }

    #[tokio::test]
    async fn test_read_failure_degrades_and_blocks_write() {
        let store = Arc::new(BrokenReads::default());
        let manager = CursorManager::new(store.clone(), 9);
        assert_eq!(manager.get(&tenant()).await, 9);
        assert!(manager.upsert(&tenant(), 100).await.is_err());
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cursors.json");

        let manager = CursorManager::new(Arc::new(FileCursorStore::new(&path)), 0);
        manager.upsert(&tenant(), 321).await.unwrap();

        let reopened = CursorManager::new(Arc::new(FileCursorStore::new(&path)), 0);
        assert_eq!(reopened.get(&tenant()).await, 321);
        assert_eq!(reopened.upsert(&tenant(), 10).await.unwrap(), 321);
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileCursorStore::new(&path);
        assert!(matches!(
            store.load(&tenant()).await,
            Err(HarvestError::Storage(_))
        ));
    }
}
