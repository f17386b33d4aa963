//! End-to-end harvesting rounds against a mock ADN upstream.
//!
//! The engine runs with filesystem backends in a temp dir; the upstream is a
//! wiremock server answering per NSU.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nfse_harvest::*;

// ─────────────────────── helpers ───────────────────────

const CNPJ: &str = "12345678000190";

/// A round on this day harvests March 2025.
fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 4, 10).unwrap()
}

fn tenant() -> Tenant {
    Tenant {
        id: TenantId::normalize("12.345.678/0001-90").unwrap(),
        name: "Acme Ltda".to_string(),
        customer_code: Some(55),
        user: "fiscal@acme.test".to_string(),
        enabled: true,
        expires_on: NaiveDate::from_ymd_opt(2026, 12, 31),
        credentials: EncodedCredentials::default(),
    }
}

/// Connects every tenant to the mock server without a client certificate.
struct PlainConnector {
    config: SourceConfig,
}

impl SourceConnector for PlainConnector {
    fn connect(&self, tenant: &Tenant) -> HarvestResult<Arc<dyn DocumentSource>> {
        Ok(Arc::new(AdnSource::new(&self.config, &tenant.id, None)?))
    }
}

struct Harness {
    server: MockServer,
    dir: tempfile::TempDir,
    harvester: Harvester,
    cursors: Arc<FileCursorStore>,
}

impl Harness {
    /// Stop-reason assertions need `concurrency == 1`: with more probes in
    /// flight the unscripted 204 after the last NSU can arrive first.
    async fn start(concurrency: usize) -> Self {
        let server = MockServer::start().await;
        // Anything not scripted is the end of the stream.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .with_priority(10)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cursors = Arc::new(FileCursorStore::new(dir.path().join("cursors.json")));
        let source = SourceConfig {
            base_url: server.uri(),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            ..SourceConfig::default()
        };
        let config = HarvestConfig {
            concurrency,
            batch_size: 5,
            max_span: 20,
            ..HarvestConfig::default()
        };
        let harvester = Harvester::new(
            config,
            Arc::new(PlainConnector { config: source }),
            Arc::new(FsObjectStore::new(dir.path().join("bucket"))),
            cursors.clone(),
        );

        Self {
            server,
            dir,
            harvester,
            cursors,
        }
    }

    async fn respond(&self, nsu: u64, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(format!("/contribuintes/DFe/{nsu}")))
            .and(query_param("cnpjConsulta", CNPJ))
            .respond_with(template)
            .mount(&self.server)
            .await;
    }

    async fn round(&self) -> TenantReport {
        let mut summary = self.harvester.run_round_on(&[tenant()], today()).await;
        assert_eq!(summary.period, "202503");
        summary.tenants.remove(0)
    }

    fn bucket_files(&self, relative: &str) -> Vec<String> {
        let dir = self.dir.path().join("bucket").join(relative);
        let mut names: Vec<String> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    async fn stored_cursor(&self) -> Option<u64> {
        self.cursors.load(&tenant().id).await.unwrap()
    }
}

fn nfse(number: u32, issued: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><NFSe xmlns="http://www.sped.fazenda.gov.br/nfse"><infNFSe><nNFSe>{number}</nNFSe><DPS><infDPS><dhEmi>{issued}</dhEmi><dCompet>{}</dCompet></infDPS></DPS></infNFSe></NFSe>"#,
        &issued[..10]
    )
}

/// Base64 of the gzip of `xml`, as the ADN ships `ArquivoXml`.
fn packed(xml: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml.as_bytes()).unwrap();
    STANDARD.encode(encoder.finish().unwrap())
}

fn lote(docs: &[String]) -> ResponseTemplate {
    let items: Vec<Value> = docs
        .iter()
        .map(|xml| json!({"TipoDocumento": "NFSE", "ArquivoXml": packed(xml)}))
        .collect();
    ResponseTemplate::new(200).set_body_json(json!({
        "StatusProcessamento": "DOCUMENTOS_LOCALIZADOS",
        "LoteDFe": items
    }))
}

fn status(code: u16, status: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "StatusProcessamento": status,
        "Erros": [{"Codigo": "E2220", "Descricao": "Nenhum documento localizado"}]
    }))
}

fn zip_names(path: &std::path::Path) -> Vec<String> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

// ─────────────────────── rounds ───────────────────────

#[tokio::test]
async fn test_round_stores_period_documents_and_archive() {
    let h = Harness::start(4).await;
    h.respond(1, lote(&[nfse(10, "2025-03-01T00:00:00-04:00")])).await;
    h.respond(2, lote(&[nfse(11, "2025-02-28T23:59:59-04:00")])).await;
    h.respond(
        3,
        lote(&[
            nfse(12, "2025-03-31T23:59:59-04:00"),
            nfse(13, "2025-04-01T00:00:00-04:00"),
            nfse(14, "2025-03-15T08:30:00.123-04:00"),
        ]),
    )
    .await;

    let report = h.round().await;

    assert_eq!(report.status, TenantStatus::Harvested);
    assert_eq!(report.cursor_before, Some(0));
    assert_eq!(report.cursor_after, Some(3));
    assert_eq!(h.stored_cursor().await, Some(3));

    let round = report.round.as_ref().unwrap();
    assert_eq!(round.reason, StopReason::Exhausted);
    assert_eq!(round.documents_found, 5);
    assert_eq!(round.documents_saved, 3);

    let documents = h.bucket_files(&format!("documents/{CNPJ}/202503"));
    assert_eq!(documents.len(), 3);
    assert!(documents[0].starts_with("1_01_"));
    assert!(documents[1].starts_with("3_01_"));
    assert!(documents[2].starts_with("3_03_"));

    let archive = h
        .dir
        .path()
        .join("bucket/archives")
        .join(format!("202503-55-{CNPJ}-fiscal@acme.test-NFSE_202503.zip"));
    assert_eq!(zip_names(&archive), documents);
    assert_eq!(h.bucket_files(&format!("status/{CNPJ}")), vec!["202503.json"]);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = Harness::start(4).await;
    h.respond(1, lote(&[nfse(10, "2025-03-05T10:00:00")])).await;
    h.respond(2, lote(&[nfse(11, "2025-03-06T10:00:00")])).await;

    let first = h.round().await;
    assert_eq!(first.cursor_after, Some(2));
    let archive_dir = h.dir.path().join("bucket/archives");
    let archive = std::fs::read_dir(&archive_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let modified = std::fs::metadata(&archive).unwrap().modified().unwrap();

    let second = h.round().await;

    assert_eq!(second.cursor_before, Some(2));
    assert_eq!(second.cursor_after, Some(2));
    assert!(!second.phases.contains(&TenantPhase::CursorPersisted));
    assert_eq!(second.documents_saved(), 0);
    assert!(matches!(
        second.consolidation,
        Some(ConsolidationOutcome::Unchanged { file_count: 2, .. })
    ));
    assert_eq!(
        std::fs::metadata(&archive).unwrap().modified().unwrap(),
        modified
    );
    assert_eq!(h.bucket_files(&format!("documents/{CNPJ}/202503")).len(), 2);
}

#[tokio::test]
async fn test_unconfirmed_stop_leaves_cursor_alone() {
    let h = Harness::start(1).await;
    h.respond(1, status(404, "NENHUM_DOCUMENTO_LOCALIZADO")).await;

    let report = h.round().await;

    let round = report.round.as_ref().unwrap();
    assert!(round.unconfirmed_stop);
    assert_eq!(round.reason, StopReason::NoDocument);
    assert_eq!(report.cursor_after, Some(0));
    assert!(report.phases.contains(&TenantPhase::StoppedUnconfirmed));
    assert!(!report.phases.contains(&TenantPhase::CursorPersisted));
    assert_eq!(h.stored_cursor().await, None);
    assert_eq!(report.consolidation, Some(ConsolidationOutcome::Empty));
}

#[tokio::test]
async fn test_rejection_after_progress_persists_confirmed_cursor() {
    let h = Harness::start(1).await;
    h.respond(1, lote(&[nfse(1, "2025-03-02T09:00:00")])).await;
    h.respond(2, ResponseTemplate::new(500)).await;
    h.respond(3, lote(&[nfse(2, "2025-03-03T09:00:00")])).await;
    h.respond(4, status(400, "REJEICAO")).await;

    let report = h.round().await;

    let round = report.round.as_ref().unwrap();
    assert!(!round.unconfirmed_stop);
    assert_eq!(round.highest_confirmed_nsu, Some(3));
    assert_eq!(
        round.reason,
        StopReason::Rejected {
            code: Some("E2220".to_string())
        }
    );
    assert_eq!(h.stored_cursor().await, Some(3));
}

#[tokio::test]
async fn test_new_document_rebuilds_archive() {
    let h = Harness::start(4).await;
    h.respond(1, lote(&[nfse(1, "2025-03-02T09:00:00")])).await;
    let first = h.round().await;
    let Some(ConsolidationOutcome::Rebuilt { member_hash: before, .. }) = first.consolidation
    else {
        panic!("expected the first round to build the archive");
    };

    h.respond(2, lote(&[nfse(2, "2025-03-20T09:00:00")])).await;
    let second = h.round().await;

    assert_eq!(second.cursor_before, Some(1));
    assert_eq!(second.cursor_after, Some(2));
    let Some(ConsolidationOutcome::Rebuilt {
        member_hash: after,
        file_count,
        ..
    }) = second.consolidation
    else {
        panic!("expected the second round to rebuild the archive");
    };
    assert_ne!(before, after);
    assert_eq!(file_count, 2);
}

#[tokio::test]
async fn test_expired_tenant_is_never_fetched() {
    let h = Harness::start(1).await;
    let mut expired = tenant();
    expired.expires_on = NaiveDate::from_ymd_opt(2025, 4, 9);

    let summary = h.harvester.run_round_on(&[expired], today()).await;

    assert_eq!(summary.skipped(), 1);
    assert!(h.server.received_requests().await.unwrap().is_empty());
}
