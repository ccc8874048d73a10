//! End-to-end pipeline runs against a mock SEI API and the in-memory
//! state store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use seisync_client::{ClientConfig, RetryPolicy, SeiClient, LOGIN_PATH};
use seisync_db::{compute_content_hash, FilesystemBackend, MemoryStateStore, StorageBackend};
use seisync_jobs::{
    DocumentPipeline, DocumentQuery, DocumentRepository, DocumentStatus, MetadataPipeline,
    NewWorkItem, PipelineStatusRepository, RecordRepository, SchedulerConfig, Stage, StateStore,
    StopHandle, SubStatus, WorkItemRepository, WorkQuery,
};

const UNIT: &str = "110000001";
const CONSULTA: &str = r"^/v1/unidades/\d+/procedimentos/consulta$";
const DOCUMENTOS: &str = r"^/v1/unidades/\d+/procedimentos/documentos$";
const ANDAMENTOS: &str = r"^/v1/unidades/\d+/procedimentos/andamentos$";
const BAIXAR: &str = r"^/v1/unidades/\d+/documentos/baixar$";

const PDF_BYTES: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n";

struct Harness {
    server: MockServer,
    client: Arc<SeiClient>,
    store: Arc<MemoryStateStore>,
    storage_dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": "tok",
                "Unidades": [
                    {"Id": UNIT, "Sigla": "SEAD-PI/GAB"},
                    {"Id": "110000002", "Sigla": "SEAD-PI/GAB/ASSESSORIA"}
                ]
            })))
            .mount(&server)
            .await;

        let config = ClientConfig::new(server.uri(), "svc", "secret", "SEAD-PI")
            .with_default_unit(UNIT)
            .with_retry(RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(1),
                rate_limit_cooldown: Duration::from_millis(1),
            });

        Self {
            client: Arc::new(SeiClient::new(config).unwrap()),
            store: Arc::new(MemoryStateStore::new()),
            storage_dir: TempDir::new().unwrap(),
            server,
        }
    }

    fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    fn storage(&self) -> Arc<dyn StorageBackend> {
        Arc::new(FilesystemBackend::new(self.storage_dir.path()))
    }

    fn metadata(&self, config: SchedulerConfig) -> MetadataPipeline {
        MetadataPipeline::new(self.client.clone(), self.store(), config, StopHandle::new())
    }

    fn documents(&self, config: SchedulerConfig) -> DocumentPipeline {
        DocumentPipeline::new(
            self.client.clone(),
            self.store(),
            self.storage(),
            config,
            StopHandle::new(),
        )
    }

    async fn seed(&self, items: &[(&str, &str)]) {
        let items: Vec<NewWorkItem> = items
            .iter()
            .map(|(protocol, scope)| NewWorkItem::new(*protocol, *scope))
            .collect();
        self.store.insert_work_items(&items).await.unwrap();
    }

    async fn mount_consulta_ok(&self, expected_calls: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path_regex(CONSULTA))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "IdProcedimento": "555",
                "TipoProcedimento": {"Nome": "Administrativo"},
                "DataAutuacao": "02/01/2025"
            })));
        match expected_calls {
            Some(n) => mock.expect(n).mount(&self.server).await,
            None => mock.mount(&self.server).await,
        }
    }

    async fn mount_consulta_once(&self, protocol: &str, delay: Duration) {
        Mock::given(method("GET"))
            .and(path_regex(CONSULTA))
            .and(query_param("protocolo_procedimento", protocol))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"IdProcedimento": "555"}))
                    .set_delay(delay),
            )
            .expect(1)
            .mount(&self.server)
            .await;
    }

    async fn mount_download(&self, document_id: &str, expected_calls: u64) {
        Mock::given(method("GET"))
            .and(path_regex(BAIXAR))
            .and(query_param("protocolo_documento", document_id))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(PDF_BYTES.to_vec())
                    .set_delay(Duration::from_millis(20)),
            )
            .expect(expected_calls)
            .mount(&self.server)
            .await;
    }

    async fn mount_documents(&self, protocol: &str, ids: &[&str]) {
        let docs: Vec<_> = ids
            .iter()
            .map(|id| json!({"IdDocumento": id, "Serie": {"Nome": "Ofício"}, "SinAssinado": "N"}))
            .collect();
        Mock::given(method("GET"))
            .and(path_regex(DOCUMENTOS))
            .and(query_param("protocolo_procedimento", protocol))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Info": {"TotalPaginas": 1},
                "Documentos": docs
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_activities_ok(&self) {
        Mock::given(method("GET"))
            .and(path_regex(ANDAMENTOS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Info": {"TotalPaginas": 1},
                "Andamentos": [
                    {"IdAndamento": "1", "Tarefa": "GERACAO-PROCEDIMENTO", "DataHora": "02/01/2025 09:00:00"}
                ]
            })))
            .mount(&self.server)
            .await;
    }

    async fn status(&self, protocol: &str, stage: Stage) -> Option<SubStatus> {
        self.store
            .get_status(protocol)
            .await
            .unwrap()
            .map(|s| s.stage(stage).status)
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig::default().with_batch_size(4)
}

/// Settings for runs sharing a store: in-flight claims are not taken over.
fn shared_config(batch_size: usize) -> SchedulerConfig {
    config()
        .with_batch_size(batch_size)
        .with_claim_lease(Duration::from_secs(600))
}

#[tokio::test]
async fn test_metadata_run_completes_all_stages() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB"), ("P-2", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(Some(2)).await;
    h.mount_documents("P-1", &["d-11", "d-12"]).await;
    h.mount_documents("P-2", &["d-21"]).await;
    h.mount_activities_ok().await;

    let summary = h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(summary.selected, 2);
    assert_eq!(summary.completed, 2);
    for protocol in ["P-1", "P-2"] {
        for stage in Stage::ALL {
            assert_eq!(h.status(protocol, stage).await, Some(SubStatus::Completed));
        }
    }

    let process = h.store.get_process("P-1").await.unwrap().unwrap();
    assert_eq!(process.procedure_id.as_deref(), Some("555"));
    assert_eq!(process.unit_id, UNIT);
    assert_eq!(h.store.list_activities("P-2").await.unwrap().len(), 1);

    let docs = h.store.list_documents("P-1").await.unwrap();
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().all(|d| d.status == DocumentStatus::Pending));
}

#[tokio::test]
async fn test_completed_items_make_no_calls() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(Some(1)).await;
    h.mount_documents("P-1", &[]).await;
    h.mount_activities_ok().await;

    let pipeline = h.metadata(config());
    pipeline.run(&WorkQuery::all_stages()).await.unwrap();
    let second = pipeline.run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(second.selected, 0);
    let stats = h.client.metadata_transport().stats().snapshot();
    assert_eq!(stats.requests, 3);
}

#[tokio::test]
async fn test_resume_processes_only_unfinished_items() {
    let h = Harness::new().await;
    h.seed(&[
        ("P-1", "SEAD-PI/GAB"),
        ("P-2", "SEAD-PI/GAB"),
        ("P-3", "SEAD-PI/GAB"),
        ("P-4", "SEAD-PI/GAB"),
    ])
    .await;
    for protocol in ["P-1", "P-2"] {
        for stage in Stage::ALL {
            h.store.set_stage_status(protocol, stage, SubStatus::Completed).await;
        }
    }
    // Left over by an interrupted run.
    h.store
        .set_stage_status("P-3", Stage::Metadata, SubStatus::InProgress)
        .await;

    h.mount_consulta_ok(Some(2)).await;
    for protocol in ["P-3", "P-4"] {
        h.mount_documents(protocol, &[]).await;
    }
    h.mount_activities_ok().await;

    let summary = h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(summary.selected, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(h.status("P-3", Stage::Metadata).await, Some(SubStatus::Completed));
}

#[tokio::test]
async fn test_server_errors_reach_error_after_cap() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    Mock::given(method("GET"))
        .and(path_regex(CONSULTA))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&h.server)
        .await;
    h.mount_documents("P-1", &[]).await;
    h.mount_activities_ok().await;

    let pipeline = h.metadata(config().with_max_retries(3));
    let first = pipeline.run(&WorkQuery::all_stages()).await.unwrap();
    let second = pipeline.run(&WorkQuery::all_stages()).await.unwrap();
    let third = pipeline.run(&WorkQuery::all_stages()).await.unwrap();
    let fourth = pipeline.run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(first.deferred, 1);
    assert_eq!(second.deferred, 1);
    assert_eq!(third.errored, 1);
    assert_eq!(fourth.selected, 0);

    let status = h.store.get_status("P-1").await.unwrap().unwrap();
    assert_eq!(status.metadata.status, SubStatus::Error);
    assert_eq!(status.metadata.retry_count, 3);
    assert_eq!(status.documents.status, SubStatus::Completed);
}

#[tokio::test]
async fn test_not_found_is_terminal_immediately() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    Mock::given(method("GET"))
        .and(path_regex(CONSULTA))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "detail": [{"msg": "Processo não encontrado"}]
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    h.mount_documents("P-1", &[]).await;
    h.mount_activities_ok().await;

    let summary = h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(summary.errored, 1);
    let status = h.store.get_status("P-1").await.unwrap().unwrap();
    assert_eq!(status.metadata.status, SubStatus::Error);
    assert_eq!(status.metadata.retry_count, 0);
    assert!(status.metadata.last_error.unwrap().contains("não encontrado"));
}

#[tokio::test]
async fn test_denied_unit_falls_back_to_next_candidate() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/unidades/{}/procedimentos/consulta", UNIT)))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "detail": [{"msg": "Unidade não possui acesso ao processo"}]
        })))
        .mount(&h.server)
        .await;
    h.mount_consulta_ok(None).await;
    h.mount_documents("P-1", &[]).await;
    h.mount_activities_ok().await;

    let summary = h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(summary.completed, 1);
    let process = h.store.get_process("P-1").await.unwrap().unwrap();
    assert_eq!(process.unit_id, "110000002");
}

#[tokio::test]
async fn test_scoped_runs_leave_other_scopes_untouched() {
    let h = Harness::new().await;
    h.seed(&[
        ("P-A1", "SEAD-PI/GAB/A1"),
        ("P-A2", "SEAD-PI/GAB/A2"),
        ("P-B1", "SEDUC-PI/B1"),
    ])
    .await;
    h.mount_consulta_ok(Some(2)).await;
    h.mount_documents("P-A1", &[]).await;
    h.mount_documents("P-A2", &[]).await;
    h.mount_activities_ok().await;

    let scopes = vec!["SEAD-PI/GAB/A1".to_string(), "SEAD-PI/GAB/A2".to_string()];
    let results = h
        .metadata(config())
        .run_scopes(&WorkQuery::all_stages(), &scopes)
        .await;

    assert_eq!(results.len(), 2);
    for (_, result) in results {
        assert_eq!(result.unwrap().completed, 1);
    }
    assert_eq!(h.status("P-B1", Stage::Metadata).await, None);
}

#[tokio::test]
async fn test_limit_reports_remaining_items() {
    let h = Harness::new().await;
    h.seed(&[
        ("P-1", "SEAD-PI/GAB"),
        ("P-2", "SEAD-PI/GAB"),
        ("P-3", "SEAD-PI/GAB"),
    ])
    .await;
    h.mount_consulta_ok(Some(1)).await;
    h.mount_documents("P-1", &[]).await;
    h.mount_activities_ok().await;

    let summary = h
        .metadata(config())
        .run(&WorkQuery::all_stages().with_limit(1))
        .await
        .unwrap();

    assert_eq!(summary.selected, 1);
    assert_eq!(summary.remaining, 2);
}

#[tokio::test]
async fn test_stop_before_run_dispatches_nothing() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB"), ("P-2", "SEAD-PI/GAB")]).await;

    let stop = StopHandle::new();
    stop.stop();
    let pipeline = MetadataPipeline::new(h.client.clone(), h.store(), config(), stop);
    let summary = pipeline.run(&WorkQuery::all_stages()).await.unwrap();

    assert_eq!(summary.selected, 2);
    assert_eq!(summary.not_dispatched, 2);
    assert_eq!(h.client.session().login_count(), 0);
}

#[tokio::test]
async fn test_unavailable_store_aborts_run() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    h.store.set_unavailable(true);

    assert!(h.metadata(config()).run(&WorkQuery::all_stages()).await.is_err());
}

#[tokio::test]
async fn test_document_download_stores_verified_bytes() {
    let h = Harness::new().await;
    h.seed(&[("00002.006238/2025-95", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(None).await;
    h.mount_documents("00002.006238/2025-95", &["21025378"]).await;
    h.mount_activities_ok().await;
    h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    Mock::given(method("GET"))
        .and(path_regex(BAIXAR))
        .and(query_param("protocolo_documento", "21025378"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .insert_header("content-disposition", r#"attachment; filename="21025378.pdf""#)
                .set_body_bytes(PDF_BYTES.to_vec()),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    let summary = h.documents(config()).run(&DocumentQuery::default()).await.unwrap();
    assert_eq!(summary.completed, 1);

    let doc = h.store.get_document("21025378").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.storage_key.as_deref(), Some("00002-006238-2025-95/21025378.pdf"));
    assert_eq!(doc.size_bytes, Some(PDF_BYTES.len() as i64));

    let stored = h.storage().get(doc.storage_key.as_deref().unwrap()).await.unwrap();
    assert_eq!(stored, PDF_BYTES);
    assert_eq!(doc.content_hash.unwrap(), compute_content_hash(&stored));

    let again = h.documents(config()).run(&DocumentQuery::default()).await.unwrap();
    assert_eq!(again.selected, 0);
}

#[tokio::test]
async fn test_empty_body_is_retried_then_errors() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(None).await;
    h.mount_documents("P-1", &["d-1"]).await;
    h.mount_activities_ok().await;
    h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    Mock::given(method("GET"))
        .and(path_regex(BAIXAR))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&h.server)
        .await;

    let pipeline = h.documents(config().with_max_retries(2));
    let first = pipeline.run(&DocumentQuery::default()).await.unwrap();
    let second = pipeline.run(&DocumentQuery::default()).await.unwrap();

    assert_eq!(first.deferred, 1);
    assert_eq!(second.errored, 1);
    let doc = h.store.get_document("d-1").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Error);
    assert_eq!(doc.attempts, 2);
    assert!(doc.storage_key.is_none());
}

#[tokio::test]
async fn test_missing_document_errors_without_retry() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(None).await;
    h.mount_documents("P-1", &["d-1"]).await;
    h.mount_activities_ok().await;
    h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();

    Mock::given(method("GET"))
        .and(path_regex(BAIXAR))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&h.server)
        .await;

    let summary = h.documents(config()).run(&DocumentQuery::default()).await.unwrap();
    assert_eq!(summary.errored, 1);
    let doc = h.store.get_document("d-1").await.unwrap().unwrap();
    assert_eq!(doc.attempts, 1);
    assert_eq!(doc.status, DocumentStatus::Error);
}

#[tokio::test]
async fn test_concurrent_metadata_runs_fetch_each_stage_once() {
    let h = Harness::new().await;
    let protocols: Vec<String> = (1..=6).map(|n| format!("P-{}", n)).collect();
    let items: Vec<(&str, &str)> = protocols.iter().map(|p| (p.as_str(), "SEAD-PI/GAB")).collect();
    h.seed(&items).await;
    for protocol in &protocols {
        h.mount_consulta_once(protocol, Duration::from_millis(20)).await;
        Mock::given(method("GET"))
            .and(path_regex(DOCUMENTOS))
            .and(query_param("protocolo_procedimento", protocol.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Info": {"TotalPaginas": 1},
                "Documentos": []
            })))
            .expect(1)
            .mount(&h.server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path_regex(ANDAMENTOS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Info": {"TotalPaginas": 1},
            "Andamentos": []
        })))
        .expect(protocols.len() as u64)
        .mount(&h.server)
        .await;

    let first = h.metadata(shared_config(2));
    let second = h.metadata(shared_config(3));
    let query = WorkQuery::all_stages();
    let (a, b) = tokio::join!(first.run(&query), second.run(&query));
    let (a, b) = (a.unwrap(), b.unwrap());

    // Stages are claimed independently, so both runs may touch the same
    // item; every selected item must still be accounted for.
    for summary in [&a, &b] {
        assert_eq!(summary.processed() + summary.not_dispatched, summary.selected);
        assert_eq!(summary.errored, 0);
        assert_eq!(summary.deferred, 0);
    }
    for protocol in &protocols {
        for stage in Stage::ALL {
            assert_eq!(h.status(protocol, stage).await, Some(SubStatus::Completed));
        }
    }
}

#[tokio::test]
async fn test_concurrent_single_stage_runs_split_items_between_them() {
    let h = Harness::new().await;
    let protocols: Vec<String> = (1..=8).map(|n| format!("M-{}", n)).collect();
    let items: Vec<(&str, &str)> = protocols.iter().map(|p| (p.as_str(), "SEAD-PI/GAB")).collect();
    h.seed(&items).await;
    for protocol in &protocols {
        h.mount_consulta_once(protocol, Duration::from_millis(15)).await;
    }

    let first = h.metadata(shared_config(3));
    let second = h.metadata(shared_config(3));
    let query = WorkQuery::for_stage(Stage::Metadata);
    let (a, b) = tokio::join!(first.run(&query), second.run(&query));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.completed + b.completed, protocols.len() as u64);
    assert_eq!(a.skipped + a.completed, a.selected);
    assert_eq!(b.skipped + b.completed, b.selected);
    for protocol in &protocols {
        assert_eq!(h.status(protocol, Stage::Metadata).await, Some(SubStatus::Completed));
        assert_eq!(h.status(protocol, Stage::Documents).await, Some(SubStatus::Pending));
    }
}

#[tokio::test]
async fn test_concurrent_document_runs_download_each_document_once() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(None).await;
    let ids = ["d-1", "d-2", "d-3", "d-4", "d-5", "d-6", "d-7", "d-8"];
    h.mount_documents("P-1", &ids).await;
    h.mount_activities_ok().await;
    h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();
    for id in ids {
        h.mount_download(id, 1).await;
    }

    let first = h.documents(shared_config(3));
    let second = h.documents(shared_config(3));
    let query = DocumentQuery::default();
    let (a, b) = tokio::join!(first.run(&query), second.run(&query));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.completed + b.completed, ids.len() as u64);
    assert_eq!(a.errored + b.errored, 0);
    for id in ids {
        let doc = h.store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.attempts, 1);
    }
}

#[tokio::test]
async fn test_since_limits_metadata_run_to_recent_items() {
    let h = Harness::new().await;
    let at = |day| Some(Utc.with_ymd_and_hms(2025, 4, day, 9, 0, 0).unwrap());
    let items = vec![
        NewWorkItem { occurred_at: at(2), ..NewWorkItem::new("P-OLD", "SEAD-PI/GAB") },
        NewWorkItem { occurred_at: at(20), ..NewWorkItem::new("P-NEW", "SEAD-PI/GAB") },
        NewWorkItem::new("P-UNDATED", "SEAD-PI/GAB"),
    ];
    h.store.insert_work_items(&items).await.unwrap();
    h.mount_consulta_once("P-NEW", Duration::ZERO).await;
    h.mount_documents("P-NEW", &[]).await;
    h.mount_activities_ok().await;

    let since = Utc.with_ymd_and_hms(2025, 4, 15, 0, 0, 0).unwrap();
    let summary = h
        .metadata(config())
        .run(&WorkQuery::all_stages().with_since(since))
        .await
        .unwrap();

    assert_eq!(summary.selected, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(h.status("P-NEW", Stage::Metadata).await, Some(SubStatus::Completed));
    assert_eq!(h.status("P-OLD", Stage::Metadata).await, None);
    assert_eq!(h.status("P-UNDATED", Stage::Metadata).await, None);
}

#[tokio::test]
async fn test_targeted_document_run_downloads_only_that_document() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB"), ("P-2", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(None).await;
    h.mount_documents("P-1", &["d-11", "d-12"]).await;
    h.mount_documents("P-2", &["d-21"]).await;
    h.mount_activities_ok().await;
    h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();
    h.mount_download("d-12", 1).await;

    let query = DocumentQuery::default()
        .with_document_id("d-12")
        .with_protocol("P-1");
    let summary = h.documents(config()).run(&query).await.unwrap();

    assert_eq!(summary.selected, 1);
    assert_eq!(summary.completed, 1);
    let target = h.store.get_document("d-12").await.unwrap().unwrap();
    assert_eq!(target.status, DocumentStatus::Completed);
    for other in ["d-11", "d-21"] {
        let doc = h.store.get_document(other).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    let again = h.documents(config()).run(&query).await.unwrap();
    assert_eq!(again.selected, 0);
}

#[tokio::test]
async fn test_dotted_document_id_is_stored_inside_storage_root() {
    let h = Harness::new().await;
    h.seed(&[("P-1", "SEAD-PI/GAB")]).await;
    h.mount_consulta_ok(None).await;
    h.mount_documents("P-1", &["../../d-9"]).await;
    h.mount_activities_ok().await;
    h.metadata(config()).run(&WorkQuery::all_stages()).await.unwrap();
    h.mount_download("../../d-9", 1).await;

    let summary = h.documents(config()).run(&DocumentQuery::default()).await.unwrap();

    assert_eq!(summary.completed, 1);
    let doc = h.store.get_document("../../d-9").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    let key = doc.storage_key.unwrap();
    assert_eq!(key, "P-1/------d-9.pdf");
    assert!(h.storage_dir.path().join(&key).exists());
}
