//! Content-addressed, write-once storage of extracted documents.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::period::Period;
use crate::storage::{ObjectStore, StorageLayout};
use crate::types::{ExtractedDocument, TenantId};

/// Hex digits of the content digest kept in object names.
const NAME_DIGEST_LEN: usize = 16;

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `{nsu}_{ordinal:02}_{digest-prefix}.xml`
pub fn document_name(nsu: u64, ordinal: usize, digest: &str) -> String {
    let prefix = digest.get(..NAME_DIGEST_LEN).unwrap_or(digest);
    format!("{nsu}_{ordinal:02}_{prefix}.xml")
}

/// Writes extracted documents under `documents/{tenant}/{period}`.
///
/// Names are derived from the content, so re-running a sequence range
/// produces the same names and skips what is already stored.
pub struct DocumentStore {
    objects: Arc<dyn ObjectStore>,
    layout: StorageLayout,
}

impl DocumentStore {
    pub fn new(objects: Arc<dyn ObjectStore>, layout: StorageLayout) -> Self {
        Self { objects, layout }
    }

    /// Build the document record for `content`.
    pub fn prepare(
        tenant: &TenantId,
        period: &Period,
        nsu: u64,
        ordinal: usize,
        content: &str,
    ) -> ExtractedDocument {
        ExtractedDocument {
            tenant_id: tenant.clone(),
            period: period.code(),
            sequence_number: nsu,
            ordinal,
            content: content.to_string(),
            content_hash: content_digest(content.as_bytes()),
        }
    }

    /// Store one document. Returns `true` only when it was newly written.
    ///
    /// A failed existence check counts as "absent" and the upload goes ahead
    /// with no-overwrite semantics, so a flaky store can never cause a
    /// document to be dropped silently.
    pub async fn save(
        &self,
        tenant: &TenantId,
        period: &Period,
        nsu: u64,
        ordinal: usize,
        content: &str,
    ) -> bool {
        let doc = Self::prepare(tenant, period, nsu, ordinal, content);
        let name = document_name(nsu, ordinal, &doc.content_hash);
        let path = self.layout.document_path(tenant, period, &name);

        match self.objects.exists(&path).await {
            Ok(true) => {
                tracing::debug!(tenant = %tenant, period = %period, nsu, path = %path, "document already stored");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    tenant = %tenant,
                    period = %period,
                    nsu,
                    path = %path,
                    "existence check failed, uploading anyway: {e}"
                );
            }
        }

        match self
            .objects
            .put(&path, doc.content.into_bytes(), "application/xml", false)
            .await
        {
            Ok(true) => {
                tracing::info!(tenant = %tenant, period = %period, nsu, path = %path, "document stored");
                true
            }
            Ok(false) => {
                tracing::debug!(tenant = %tenant, period = %period, nsu, path = %path, "document already stored");
                false
            }
            Err(e) => {
                tracing::error!(tenant = %tenant, period = %period, nsu, path = %path, "document upload failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryObjectStore, ObjectEntry};
    use crate::types::{HarvestError, HarvestResult};
    use async_trait::async_trait;

    fn tenant() -> TenantId {
        TenantId::normalize("12345678000190").unwrap()
    }

    fn period() -> Period {
        Period::new(2025, 3).unwrap()
    }

    /// Delegates to memory but every existence check fails.
    #[derive(Default)]
    struct FlakyExists {
        inner: MemoryObjectStore,
    }

    #[async_trait]
    impl ObjectStore for FlakyExists {
        async fn list(&self, prefix: &str, search: Option<&str>) -> HarvestResult<Vec<ObjectEntry>> {
            self.inner.list(prefix, search).await
        }
        async fn exists(&self, _path: &str) -> HarvestResult<bool> {
            Err(HarvestError::Storage("timeout".to_string()))
        }
        async fn get(&self, path: &str) -> HarvestResult<Option<Vec<u8>>> {
            self.inner.get(path).await
        }
        async fn put(
            &self,
            path: &str,
            bytes: Vec<u8>,
            content_type: &str,
            overwrite: bool,
        ) -> HarvestResult<bool> {
            self.inner.put(path, bytes, content_type, overwrite).await
        }
    }

    #[test]
    fn test_document_name() {
        assert_eq!(
            content_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let digest = content_digest(b"<a/>");
        assert_eq!(digest.len(), 64);
        let name = document_name(1234, 3, &digest);
        assert_eq!(name, format!("1234_03_{}.xml", &digest[..16]));
    }

    #[tokio::test]
    async fn test_save_twice_stores_once() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = DocumentStore::new(objects.clone(), StorageLayout::default());

        assert!(store.save(&tenant(), &period(), 10, 1, "<a/>").await);
        assert!(!store.save(&tenant(), &period(), 10, 1, "<a/>").await);

        let paths = objects.paths().await;
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with("documents/12345678000190/202503/10_01_"));
        assert_eq!(objects.put_count(), 1);
        assert_eq!(
            objects.content_type(&paths[0]).await.as_deref(),
            Some("application/xml")
        );
    }

    #[tokio::test]
    async fn test_different_content_gets_different_names() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = DocumentStore::new(objects.clone(), StorageLayout::default());
        assert!(store.save(&tenant(), &period(), 10, 1, "<a/>").await);
        assert!(store.save(&tenant(), &period(), 10, 1, "<b/>").await);
        assert_eq!(objects.paths().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_existence_check_still_uploads_once() {
        let objects = Arc::new(FlakyExists::default());
        let store = DocumentStore::new(objects.clone(), StorageLayout::default());
        assert!(store.save(&tenant(), &period(), 11, 2, "<a/>").await);
        assert!(!store.save(&tenant(), &period(), 11, 2, "<a/>").await);
        assert_eq!(objects.inner.put_count(), 1);
    }

    #[tokio::test]
    async fn test_save_after_interrupted_write_stores_full_document() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(crate::storage::FsObjectStore::new(dir.path()));
        let store = DocumentStore::new(objects.clone(), StorageLayout::default());
        let content = "<NFSe><infNFSe><nNFSe>10</nNFSe></infNFSe></NFSe>";

        let digest = content_digest(content.as_bytes());
        let folder = dir.path().join("documents/12345678000190/202503");
        std::fs::create_dir_all(&folder).unwrap();
        let name = document_name(10, 1, &digest);
        std::fs::write(folder.join(format!(".tmp-1-0-{name}")), b"").unwrap();

        assert!(store.save(&tenant(), &period(), 10, 1, content).await);
        let stored = std::fs::read(folder.join(&name)).unwrap();
        assert_eq!(stored.len(), content.len());
        assert!(!store.save(&tenant(), &period(), 10, 1, content).await);
    }
}
