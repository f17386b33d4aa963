//! Object store abstraction and local backends.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::period::Period;
use crate::types::{HarvestError, HarvestResult, TenantId};

/// One listed object (a direct child of the listed prefix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Blob storage holding documents, archives and archive state.
///
/// Paths are `/`-separated and relative to the store root.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects directly under `prefix`, sorted by name. `search` keeps only
    /// names containing it.
    async fn list(&self, prefix: &str, search: Option<&str>) -> HarvestResult<Vec<ObjectEntry>>;

    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> HarvestResult<bool> {
        let (dir, file) = split_path(path);
        let entries = self.list(dir, Some(file)).await?;
        Ok(entries.iter().any(|e| e.name == file))
    }

    /// Object bytes, or `None` when absent.
    async fn get(&self, path: &str) -> HarvestResult<Option<Vec<u8>>>;

    /// Store `bytes` at `path`. With `overwrite == false` an existing object
    /// is left alone and `Ok(false)` is returned.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        overwrite: bool,
    ) -> HarvestResult<bool>;
}

/// Split `a/b/c.xml` into (`a/b`, `c.xml`).
pub fn split_path(path: &str) -> (&str, &str) {
    let path = path.trim_matches('/');
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Where each artifact lives inside the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub documents_prefix: String,
    pub archives_prefix: String,
    pub status_prefix: String,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            documents_prefix: "documents".to_string(),
            archives_prefix: "archives".to_string(),
            status_prefix: "status".to_string(),
        }
    }
}

impl StorageLayout {
    /// `documents/{tenant}/{YYYYMM}`
    pub fn document_dir(&self, tenant: &TenantId, period: &Period) -> String {
        format!("{}/{tenant}/{}", self.documents_prefix, period.code())
    }

    pub fn document_path(&self, tenant: &TenantId, period: &Period, name: &str) -> String {
        format!("{}/{name}", self.document_dir(tenant, period))
    }

    /// `archives/{YYYYMM}-{label}-NFSE_{YYYYMM}.zip`
    pub fn archive_path(&self, period: &Period, label: &str) -> String {
        let code = period.code();
        format!("{}/{code}-{label}-NFSE_{code}.zip", self.archives_prefix)
    }

    /// `status/{tenant}/{YYYYMM}.json`
    pub fn status_path(&self, tenant: &TenantId, period: &Period) -> String {
        format!("{}/{tenant}/{}.json", self.status_prefix, period.code())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-process object store. Counts writes so callers can assert on them.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// All stored paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn content_type(&self, path: &str) -> Option<String> {
        self.objects
            .lock()
            .await
            .get(path.trim_matches('/'))
            .map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str, search: Option<&str>) -> HarvestResult<Vec<ObjectEntry>> {
        let prefix = prefix.trim_matches('/');
        let objects = self.objects.lock().await;
        let entries = objects
            .iter()
            .filter_map(|(path, obj)| {
                let (dir, name) = split_path(path);
                (dir == prefix).then(|| ObjectEntry {
                    name: name.to_string(),
                    size: Some(obj.bytes.len() as u64),
                })
            })
            .filter(|e| search.map_or(true, |s| e.name.contains(s)))
            .collect();
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> HarvestResult<bool> {
        Ok(self.objects.lock().await.contains_key(path.trim_matches('/')))
    }

    async fn get(&self, path: &str) -> HarvestResult<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .await
            .get(path.trim_matches('/'))
            .map(|o| o.bytes.clone()))
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        overwrite: bool,
    ) -> HarvestResult<bool> {
        let key = path.trim_matches('/').to_string();
        let mut objects = self.objects.lock().await;
        if !overwrite && objects.contains_key(&key) {
            return Ok(false);
        }
        objects.insert(
            key,
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Object store rooted in a local directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` under the root, refusing anything that escapes it.
    fn resolve(&self, path: &str) -> HarvestResult<PathBuf> {
        let relative = Path::new(path.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(HarvestError::Storage(format!(
                "refusing object path outside the store: {path}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, prefix: &str, search: Option<&str>) -> HarvestResult<Vec<ObjectEntry>> {
        let dir = if prefix.trim_matches('/').is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // unpublished temp files
            if name.starts_with(".tmp-") {
                continue;
            }
            if search.map_or(true, |s| name.contains(s)) {
                entries.push(ObjectEntry {
                    name,
                    size: Some(metadata.len()),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> HarvestResult<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    async fn get(&self, path: &str) -> HarvestResult<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        overwrite: bool,
    ) -> HarvestResult<bool> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Objects only ever appear complete: bytes go to a temp file first,
        // then get published by link (write-once) or rename (overwrite).
        let tmp = write_temp(&full, &bytes).await?;

        if !overwrite {
            let published = tokio::fs::hard_link(&tmp, &full).await;
            let _ = tokio::fs::remove_file(&tmp).await;
            return match published {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            };
        }

        if let Err(e) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(true)
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to a hidden sibling of `full` and sync it. The temp file is
/// removed again when the write fails.
async fn write_temp(full: &Path, bytes: &[u8]) -> HarvestResult<PathBuf> {
    let file_name = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = full.with_file_name(format!(
        ".tmp-{}-{}-{file_name}",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(tmp)
}
