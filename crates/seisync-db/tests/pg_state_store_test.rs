//! Postgres state store tests.
//!
//! Require a migrated database at `DATABASE_URL`; run with
//! `cargo test -p seisync-db -- --ignored`.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use seisync_db::test_fixtures::{scoped_item, test_database_url, unique_protocol};
use seisync_db::{
    Database, DocumentQuery, DocumentRepository, DocumentStatus, FailureKind, NewDocumentRef,
    NewWorkItem, PipelineStatusRepository, ProcessRecord, RecordRepository, Stage, StoredObject, SubStatus,
    WorkItemRepository, WorkQuery,
};

const NO_LEASE: Duration = Duration::ZERO;

async fn setup_db() -> Database {
    dotenvy::dotenv().ok();
    let db = Database::connect(&test_database_url())
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to migrate test database");
    db
}

fn process_record(protocol: &str) -> ProcessRecord {
    ProcessRecord {
        protocol: protocol.to_string(),
        procedure_id: Some("900".to_string()),
        unit_id: "110000001".to_string(),
        procedure_type: Some("Pessoal: Férias".to_string()),
        specification: None,
        access_level: Some("0".to_string()),
        legal_basis: None,
        observation: None,
        opened_at: None,
        concluded_at: None,
        interested: json!([]),
        subjects: json!([]),
        generating_unit: Some("SEAD-PI/GAB".to_string()),
        raw: json!({"IdProcedimento": "900"}),
    }
}

#[tokio::test]
#[ignore]
async fn test_selector_scope_prefix_and_insertion_order() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let items = vec![
        scoped_item(&run, "A/1", "p"),
        scoped_item(&run, "B/1", "p"),
        scoped_item(&run, "A/2", "p"),
    ];
    assert_eq!(db.insert_work_items(&items).await.unwrap(), 3);

    let selected = db
        .select_work_items(&WorkQuery::all_stages().with_scope(format!("{}/A", run)))
        .await
        .unwrap();
    let protocols: Vec<_> = selected.iter().map(|w| w.protocol.clone()).collect();
    assert_eq!(protocols, vec![items[0].protocol.clone(), items[2].protocol.clone()]);
}

#[tokio::test]
#[ignore]
async fn test_completed_item_leaves_selection() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let item = scoped_item(&run, "A", "p");
    db.insert_work_items(std::slice::from_ref(&item)).await.unwrap();

    let query = WorkQuery::for_stage(Stage::Metadata).with_scope(run.clone());
    assert_eq!(db.count_work_items(&query).await.unwrap(), 1);

    let claim = db
        .claim_stage(&item.protocol, Stage::Metadata, NO_LEASE)
        .await
        .unwrap()
        .expect("pending stage is claimable");
    assert!(db
        .complete_metadata(&claim, &process_record(&item.protocol))
        .await
        .unwrap());

    assert_eq!(db.count_work_items(&query).await.unwrap(), 0);
    let stored = db.get_process(&item.protocol).await.unwrap().unwrap();
    assert_eq!(stored.procedure_type.as_deref(), Some("Pessoal: Férias"));

    // Other stages are still open.
    let query = WorkQuery::for_stage(Stage::Activity).with_scope(run);
    assert_eq!(db.count_work_items(&query).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn test_stolen_claim_cannot_complete() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let item = scoped_item(&run, "A", "p");
    db.insert_work_items(std::slice::from_ref(&item)).await.unwrap();

    let first = db
        .claim_stage(&item.protocol, Stage::Activity, NO_LEASE)
        .await
        .unwrap()
        .unwrap();
    let second = db
        .claim_stage(&item.protocol, Stage::Activity, NO_LEASE)
        .await
        .unwrap()
        .unwrap();

    assert!(!db.complete_activity(&first, &[]).await.unwrap());
    assert!(db.complete_activity(&second, &[]).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_retry_cap_then_reset() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let item = scoped_item(&run, "A", "p");
    db.insert_work_items(std::slice::from_ref(&item)).await.unwrap();

    let mut last = None;
    for _ in 0..2 {
        let claim = db
            .claim_stage(&item.protocol, Stage::Documents, NO_LEASE)
            .await
            .unwrap()
            .unwrap();
        last = db
            .fail_stage(&claim, "HTTP 503", FailureKind::Retryable, 2)
            .await
            .unwrap();
    }
    assert_eq!(last, Some(SubStatus::Error));
    assert!(db
        .claim_stage(&item.protocol, Stage::Documents, NO_LEASE)
        .await
        .unwrap()
        .is_none());

    assert_eq!(
        db.reset_stage_errors(Stage::Documents, Some(&run)).await.unwrap(),
        1
    );
    let row = db.get_status(&item.protocol).await.unwrap().unwrap();
    assert_eq!(row.documents.status, SubStatus::Pending);
    assert_eq!(row.documents.retry_count, 0);
}

#[tokio::test]
#[ignore]
async fn test_document_lifecycle() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let item = scoped_item(&run, "A", "p");
    db.insert_work_items(std::slice::from_ref(&item)).await.unwrap();

    let document_id = unique_protocol("doc");
    let claim = db
        .claim_stage(&item.protocol, Stage::Documents, NO_LEASE)
        .await
        .unwrap()
        .unwrap();
    let added = db
        .complete_documents(
            &claim,
            &[NewDocumentRef {
                document_id: document_id.clone(),
                protocol: item.protocol.clone(),
                unit_id: "110000001".to_string(),
                number: Some("12".to_string()),
                doc_type: Some("Despacho".to_string()),
                document_date: None,
                generating_unit: None,
                signed: true,
                signers: json!([]),
                access_level: None,
                raw: json!({}),
            }],
        )
        .await
        .unwrap();
    assert_eq!(added, Some(1));

    let pending = db
        .select_documents(&DocumentQuery::default().with_scope(run.clone()))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let doc_claim = db
        .claim_document(&document_id, NO_LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc_claim.attempt, 1);
    assert!(db
        .complete_document(
            &doc_claim,
            &StoredObject {
                storage_key: "k/1.pdf".to_string(),
                content_hash: "ab".repeat(32),
                size_bytes: 10,
                content_type: Some("application/pdf".to_string()),
            },
        )
        .await
        .unwrap());

    let doc = db.get_document(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.storage_key.as_deref(), Some("k/1.pdf"));
    assert_eq!(
        db.count_documents(&DocumentQuery::default().with_scope(run))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
#[ignore]
async fn test_selector_since_filter() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let at = |day| Some(Utc.with_ymd_and_hms(2025, 5, day, 8, 0, 0).unwrap());
    let items = vec![
        NewWorkItem { occurred_at: at(1), ..scoped_item(&run, "A", "old") },
        NewWorkItem { occurred_at: at(9), ..scoped_item(&run, "A", "new") },
        scoped_item(&run, "A", "undated"),
    ];
    db.insert_work_items(&items).await.unwrap();

    let query = WorkQuery::all_stages()
        .with_scope(run)
        .with_since(Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap());
    let selected = db.select_work_items(&query).await.unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].protocol, items[1].protocol);
    assert_eq!(db.count_work_items(&query).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn test_select_documents_by_id_and_protocol() {
    let db = setup_db().await;
    let run = unique_protocol("RUN");
    let item = scoped_item(&run, "A", "p");
    db.insert_work_items(std::slice::from_ref(&item)).await.unwrap();

    let ids = [unique_protocol("doc"), unique_protocol("doc")];
    let claim = db
        .claim_stage(&item.protocol, Stage::Documents, NO_LEASE)
        .await
        .unwrap()
        .unwrap();
    let refs: Vec<_> = ids
        .iter()
        .map(|id| NewDocumentRef {
            document_id: id.clone(),
            protocol: item.protocol.clone(),
            unit_id: "110000001".to_string(),
            number: None,
            doc_type: None,
            document_date: None,
            generating_unit: None,
            signed: false,
            signers: json!([]),
            access_level: None,
            raw: json!({}),
        })
        .collect();
    db.complete_documents(&claim, &refs).await.unwrap();

    let targeted = DocumentQuery::default()
        .with_document_id(ids[1].clone())
        .with_protocol(item.protocol.clone());
    let selected = db.select_documents(&targeted).await.unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].document_id, ids[1]);
    assert_eq!(db.count_documents(&targeted).await.unwrap(), 1);

    let by_protocol = DocumentQuery::default().with_protocol(item.protocol.clone());
    assert_eq!(db.count_documents(&by_protocol).await.unwrap(), 2);

    let elsewhere = DocumentQuery::default()
        .with_document_id(ids[1].clone())
        .with_protocol(unique_protocol("other"));
    assert!(db.select_documents(&elsewhere).await.unwrap().is_empty());
}
