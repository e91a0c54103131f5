use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shelfwatch_core::{
    EntityKind, EntityRecord, EntityRow, Event, EventType, ObservationBatch, RawProduct,
};
use shelfwatch_ledger::{EventQuery, Ledger, LedgerTx, MemoryLedger, StoreError};
use shelfwatch_storage::AssetStore;
use shelfwatch_sync::{
    KindOutcome, MemoryCoordinator, PassCoordinator, PassError, SyncConfig, SyncPipeline,
};

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        workspace_root: root.to_path_buf(),
        data_dir: root.join("data"),
        downloads_dir: root.join("downloads"),
        ..SyncConfig::default()
    }
}

fn pipeline_with(
    root: &Path,
    ledger: Arc<dyn Ledger>,
    coordinator: Arc<MemoryCoordinator>,
) -> SyncPipeline {
    SyncPipeline::new(config(root), ledger, coordinator).unwrap()
}

fn product(url: &str, name: &str, price: f64) -> RawProduct {
    RawProduct {
        url: Some(url.to_string()),
        name: Some(name.to_string()),
        price: Some(price),
        currency: Some("CRC".into()),
        ..RawProduct::default()
    }
}

fn catalog() -> Vec<RawProduct> {
    vec![
        product("https://shop.example/p/a", "Widget", 100.0),
        product("https://shop.example/p/b", "Gadget", 50.0),
        product("https://shop.example/p/c", "Doohickey", 75.0),
    ]
}

async fn events_of(ledger: &MemoryLedger, event_type: EventType) -> Vec<Event> {
    ledger
        .query_events(&EventQuery::of_type(event_type))
        .await
        .unwrap()
}

#[tokio::test]
async fn replaying_a_batch_emits_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = MemoryLedger::new();
    let pipeline = pipeline_with(dir.path(), Arc::new(ledger.clone()), Arc::default());

    let first = pipeline
        .run_pass(ObservationBatch::Products(catalog()))
        .await
        .unwrap();
    assert_eq!(first.created, 3);

    let before = ledger.list_entities(EntityKind::Product, None).await.unwrap();
    let second = pipeline
        .run_pass(ObservationBatch::Products(catalog()))
        .await
        .unwrap();
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.events_appended, 0);
    assert_eq!(ledger.event_len().await, 3);

    let after = ledger.list_entities(EntityKind::Product, None).await.unwrap();
    for row in &after {
        let old = before.iter().find(|r| r.id == row.id).unwrap();
        assert_eq!(row.first_seen_at, old.first_seen_at);
        assert!(row.last_seen_at >= old.last_seen_at);
        assert_eq!(row.last_change_at, None);
    }
}

#[tokio::test]
async fn lifecycle_of_one_product() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = MemoryLedger::new();
    let pipeline = pipeline_with(dir.path(), Arc::new(ledger.clone()), Arc::default());

    pipeline
        .run_pass(ObservationBatch::Products(catalog()))
        .await
        .unwrap();

    let mut changed = catalog();
    changed[0].price = Some(120.0);
    pipeline
        .run_pass(ObservationBatch::Products(changed.clone()))
        .await
        .unwrap();
    let updated = events_of(&ledger, EventType::Updated).await;
    assert_eq!(updated.len(), 1);
    assert!(updated[0].description.contains("price: 100 → 120"));

    changed.truncate(2);
    let report = pipeline
        .run_pass(ObservationBatch::Products(changed.clone()))
        .await
        .unwrap();
    assert_eq!(report.deactivated, 1);
    assert!(!ledger
        .active_keys(EntityKind::Product)
        .await
        .unwrap()
        .contains("https://shop.example/p/c"));

    changed.push(product("https://shop.example/p/c", "Doohickey", 75.0));
    let report = pipeline
        .run_pass(ObservationBatch::Products(changed))
        .await
        .unwrap();
    assert_eq!(report.reactivated, 1);
    assert_eq!(report.events_appended, 1);

    let target = events_of(&ledger, EventType::Reactivated).await[0].target;
    let history = ledger
        .query_events(&EventQuery::for_target(target))
        .await
        .unwrap();
    let types: Vec<EventType> = history.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![EventType::Reactivated, EventType::Deactivated, EventType::Created]
    );
}

#[tokio::test]
async fn sweep_guard_leaves_store_untouched_and_releases_lease() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = MemoryLedger::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let pipeline = pipeline_with(dir.path(), Arc::new(ledger.clone()), coordinator.clone());

    pipeline
        .run_pass(ObservationBatch::Products(catalog()))
        .await
        .unwrap();
    let before: Vec<EntityRow> = ledger.list_entities(EntityKind::Product, None).await.unwrap();

    let err = pipeline
        .run_pass(ObservationBatch::Products(vec![product(
            "https://shop.example/p/a",
            "Widget",
            999.0,
        )]))
        .await
        .unwrap_err();
    assert!(matches!(err, PassError::SweepGuard { seen: 1, active: 3, .. }));

    assert_eq!(ledger.list_entities(EntityKind::Product, None).await.unwrap(), before);
    assert_eq!(ledger.event_len().await, 3);
    assert!(coordinator.current(EntityKind::Product).await.is_none());
}

#[tokio::test]
async fn invalid_records_are_reported_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = MemoryLedger::new();
    let pipeline = pipeline_with(dir.path(), Arc::new(ledger.clone()), Arc::default());

    let mut batch = catalog();
    batch.insert(1, product("ftp://shop.example/p/x", "Bad scheme", 1.0));
    batch.push(RawProduct {
        name: None,
        ..product("https://shop.example/p/z", "", 1.0)
    });

    let report = pipeline
        .run_pass(ObservationBatch::Products(batch))
        .await
        .unwrap();
    assert_eq!(report.observed, 5);
    assert_eq!(report.created, 3);
    let indices: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 4]);
}

#[tokio::test]
async fn held_lease_rejects_the_pass_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = MemoryLedger::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    coordinator
        .acquire(EntityKind::Product, "other-worker", Duration::from_secs(600))
        .await
        .unwrap();
    let pipeline = pipeline_with(dir.path(), Arc::new(ledger.clone()), coordinator);

    let err = pipeline
        .run_pass(ObservationBatch::Products(catalog()))
        .await
        .unwrap_err();
    assert!(matches!(err, PassError::LeaseHeld { ref owner, .. } if owner == "other-worker"));
    assert!(err.is_retriable());
    assert_eq!(ledger.event_len().await, 0);
}

/// Delegates to a memory ledger after stalling in `begin`.
struct StallingLedger {
    inner: MemoryLedger,
    stall: Duration,
}

#[async_trait]
impl Ledger for StallingLedger {
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn LedgerTx>, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.begin(kind).await
    }

    async fn active_keys(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError> {
        self.inner.active_keys(kind).await
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        active: Option<bool>,
    ) -> Result<Vec<EntityRow>, StoreError> {
        self.inner.list_entities(kind, active).await
    }

    async fn get_entity(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRow>, StoreError> {
        self.inner.get_entity(kind, id).await
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        self.inner.query_events(query).await
    }
}

#[tokio::test]
async fn timed_out_pass_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let inner = MemoryLedger::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let ledger = StallingLedger {
        inner: inner.clone(),
        stall: Duration::from_millis(500),
    };
    let pipeline = SyncPipeline::new(
        SyncConfig {
            pass_timeout: Duration::from_millis(20),
            ..config(dir.path())
        },
        Arc::new(ledger),
        coordinator.clone(),
    )
    .unwrap();

    let err = pipeline
        .run_pass(ObservationBatch::Products(catalog()))
        .await
        .unwrap_err();
    assert!(matches!(err, PassError::Timeout { kind: EntityKind::Product, .. }));
    assert_eq!(inner.event_len().await, 0);
    assert!(coordinator.current(EntityKind::Product).await.is_none());
}

#[tokio::test]
async fn run_once_skips_kinds_whose_source_fails_and_exports_json() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(
        root.join("products.json"),
        serde_json::to_vec(&catalog()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        root.join("sources.yaml"),
        r#"
sources:
  - source_id: shop
    kind: product
    mode: snapshot
    path: products.json
  - source_id: shop-files
    kind: file
    mode: snapshot
    path: missing-files.json
"#,
    )
    .unwrap();

    let ledger = MemoryLedger::new();
    let pipeline = pipeline_with(root, Arc::new(ledger.clone()), Arc::default());
    let summary = pipeline.run_once(None).await.unwrap();

    assert_eq!(summary.kinds.len(), 2);
    assert!(matches!(
        &summary.kinds[0].outcome,
        KindOutcome::Completed { report } if report.created == 3
    ));
    assert!(matches!(&summary.kinds[1].outcome, KindOutcome::Skipped { .. }));
    assert!(matches!(
        &summary.file_audit,
        Some(KindOutcome::Completed { report }) if report.observed == 0
    ));
    assert_eq!(summary.failed(), 0);

    let exported: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(root.join("data/products.json")).unwrap()).unwrap();
    assert_eq!(exported.len(), 3);
    assert_eq!(exported[0]["entity_type"], "product");
    let events: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(root.join("data/events.json")).unwrap()).unwrap();
    assert_eq!(events.len(), 3);
    assert!(root.join("data/files.json").exists());

    let only_files = pipeline.run_once(Some(EntityKind::File)).await.unwrap();
    assert_eq!(only_files.kinds.len(), 1);

    let only_products = pipeline.run_once(Some(EntityKind::Product)).await.unwrap();
    assert!(only_products.file_audit.is_none());
}

#[tokio::test]
async fn undecodable_snapshot_record_is_rejected_without_skipping_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(
        root.join("products.json"),
        r#"[
            {"url": "https://shop.example/p/a", "name": "Widget", "price": 100},
            {"url": "https://shop.example/p/b", "name": "Gadget", "price": "12.990"},
            {"url": "https://shop.example/p/c", "name": "Doohickey", "price": 75}
        ]"#,
    )
    .unwrap();
    std::fs::write(
        root.join("sources.yaml"),
        "sources:\n  - source_id: shop\n    kind: product\n    mode: snapshot\n    path: products.json\n",
    )
    .unwrap();

    let ledger = MemoryLedger::new();
    let pipeline = pipeline_with(root, Arc::new(ledger.clone()), Arc::default());
    let summary = pipeline.run_once(Some(EntityKind::Product)).await.unwrap();

    let KindOutcome::Completed { report } = &summary.kinds[0].outcome else {
        panic!("expected a completed pass, got {:?}", summary.kinds[0].outcome);
    };
    assert_eq!(report.observed, 3);
    assert_eq!(report.created, 2);
    let indices: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1]);
    assert!(report.rejected[0].reason.contains("could not be decoded"));
    assert_eq!(ledger.active_keys(EntityKind::Product).await.unwrap().len(), 2);
}

#[tokio::test]
async fn local_file_audit_catches_edited_and_deleted_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let assets = root.join("assets");
    std::fs::create_dir_all(&assets).unwrap();

    let mut snapshot = Vec::new();
    for name in ["kept.pdf", "edited.pdf", "deleted.pdf"] {
        let path = assets.join(name);
        let body = format!("%PDF-1.4 {name}");
        std::fs::write(&path, &body).unwrap();
        snapshot.push(serde_json::json!({
            "url": format!("https://shop.example/files/{name}"),
            "filename": name,
            "local_path": path.display().to_string(),
            "mime_type": "application/pdf",
            "hash": AssetStore::sha256_hex(body.as_bytes()),
        }));
    }
    std::fs::write(root.join("files.json"), serde_json::to_vec(&snapshot).unwrap()).unwrap();
    std::fs::write(
        root.join("sources.yaml"),
        "sources:\n  - source_id: assets\n    kind: file\n    mode: snapshot\n    path: files.json\n",
    )
    .unwrap();

    let ledger = MemoryLedger::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let pipeline = pipeline_with(root, Arc::new(ledger.clone()), coordinator.clone());
    let summary = pipeline.run_once(Some(EntityKind::File)).await.unwrap();
    assert!(matches!(
        &summary.file_audit,
        Some(KindOutcome::Completed { report }) if report.observed == 3 && report.events_appended == 0
    ));

    std::fs::write(assets.join("edited.pdf"), b"%PDF-1.4 tampered").unwrap();
    std::fs::remove_file(assets.join("deleted.pdf")).unwrap();

    let report = pipeline.run_local_file_audit().await.unwrap();
    assert_eq!(report.observed, 3);
    assert_eq!(report.updated, 1);
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.events_appended, 2);
    assert!(coordinator.current(EntityKind::File).await.is_none());

    let rows = ledger.list_entities(EntityKind::File, None).await.unwrap();
    let by_name = |name: &str| {
        rows.iter()
            .find(|r| r.key().ends_with(name))
            .cloned()
            .unwrap()
    };
    let edited = by_name("edited.pdf");
    let EntityRecord::File(fields) = &edited.record else {
        panic!("expected a file row");
    };
    assert_eq!(fields.hash, AssetStore::sha256_hex(b"%PDF-1.4 tampered"));
    assert_eq!(edited.data_hash, fields.hash);
    assert!(edited.last_change_at.is_some());
    assert!(!by_name("deleted.pdf").is_active);
    assert!(by_name("kept.pdf").is_active);

    let changed = events_of(&ledger, EventType::FileChanged).await;
    assert_eq!(changed.len(), 1);
    assert!(changed[0].description.starts_with("File changed on disk: edited.pdf"));
    assert_eq!(events_of(&ledger, EventType::Deactivated).await.len(), 1);

    // Nothing left to report on a second look.
    let again = pipeline.run_local_file_audit().await.unwrap();
    assert_eq!(again.observed, 2);
    assert_eq!(again.events_appended, 0);
}
