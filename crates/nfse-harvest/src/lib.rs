//! nfse-harvest: incremental NSU harvesting of NFS-e documents with safe
//! cursors, content-addressed storage and period archives.

pub mod archive;
pub mod classify;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod extract;
pub mod period;
pub mod persist;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod supabase;
pub mod tenants;
pub mod types;

pub use archive::{build_archive, member_hash, ArchiveConsolidator, ConsolidationOutcome};
pub use classify::{classify, classify_response, Outcome, OutcomeKind, UpstreamStatus};
pub use config::{HarvestConfig, SourceConfig};
pub use cursor::{CursorManager, CursorStore, FileCursorStore, MemoryCursorStore};
pub use engine::{Harvester, RoundSummary, TenantPhase, TenantReport, TenantStatus};
pub use extract::{decode_document, document_in_period, embedded_documents, parse_document_date};
pub use period::{today_in, Period};
pub use persist::{content_digest, document_name, DocumentStore};
pub use scheduler::{BatchScheduler, FetchOutcome, RoundPlan, RoundReport, StopReason};
pub use source::{AdnConnector, AdnSource, DocumentSource, SourceConnector, SourceResponse};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectEntry, ObjectStore, StorageLayout};
pub use supabase::{
    PostgrestCursorStore, PostgrestTenantDirectory, SupabaseClient, SupabaseConfig,
    SupabaseObjectStore,
};
pub use tenants::{JsonTenantFile, TenantDirectory, TenantRecord};
pub use types::*;
