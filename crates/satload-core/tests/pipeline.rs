use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use satload_core::{
    BulkImporter, CancellationToken, CollectionAdmin, CollectionRef, Error, FolderSource,
    ImportError, ImportOptions, ImportOutcome, LoadMode, LoadPipeline, LoaderConfig,
    RecordKind, RetryOptions, SqliteStore,
};
use serde_json::Value;
use tempfile::TempDir;

const FAST: u32 = 1_000_000;

fn invoice(issuer: &str, recipient: &str, uuid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/3" xmlns:tfd="http://www.sat.gob.mx/TimbreFiscalDigital" version="3.2">
  <cfdi:Emisor rfc="{issuer}"/>
  <cfdi:Receptor rfc="{recipient}"/>
  <cfdi:Complemento>
    <tfd:TimbreFiscalDigital version="1.0" UUID="{uuid}"/>
  </cfdi:Complemento>
</cfdi:Comprobante>"#
    )
}

fn write_folder(files: &[(&str, String)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn config(input: &Path, quarantine: &Path, mode: LoadMode) -> LoaderConfig {
    LoaderConfig {
        input_folder: input.to_path_buf(),
        quarantine_dir: quarantine.to_path_buf(),
        collection_throughput: FAST,
        mode,
        ..LoaderConfig::default()
    }
}

async fn memory_store() -> SqliteStore {
    SqliteStore::open_memory(RetryOptions::provisioning())
        .await
        .unwrap()
}

fn pipeline(config: LoaderConfig, store: &SqliteStore) -> LoadPipeline {
    let source = FolderSource::new(config.input_folder.clone());
    LoadPipeline::new(
        config,
        Box::new(source),
        Arc::new(store.clone()),
        Arc::new(store.with_retry_options(RetryOptions::bulk_import())),
    )
}

#[tokio::test]
async fn test_graph_mode_loads_deduplicated_graph() {
    let input = write_folder(&[
        ("a.xml", invoice("AAA010101AAA", "BBB010101BBB", "u-1")),
        ("b.xml", invoice("AAA010101AAA", "CCC010101CCC", "u-2")),
        ("c.xml", "<cfdi:Comprobante>".to_string()),
    ]);
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;

    let report = pipeline(
        config(input.path(), quarantine.path(), LoadMode::Graph),
        &store,
    )
    .run()
    .await
    .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.summary.imported(RecordKind::Vertex), 5);
    assert_eq!(report.summary.imported(RecordKind::Edge), 4);
    assert_eq!(report.summary.skipped_at_extraction, 1);
    assert_eq!(store.document_count("sat", "cfdi").await.unwrap(), 9);

    let edge = store
        .get_document("sat", "cfdi", "AAA010101AAA", "AAA010101AAAu-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edge["label"], "issued");
    assert_eq!(edge["inV"], "u-1");
}

#[tokio::test]
async fn test_graph_mode_is_repeatable() {
    let input = write_folder(&[("a.xml", invoice("AAA010101AAA", "BBB010101BBB", "u-1"))]);
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;

    for _ in 0..2 {
        pipeline(
            config(input.path(), quarantine.path(), LoadMode::Graph),
            &store,
        )
        .run()
        .await
        .unwrap();
    }

    assert_eq!(store.document_count("sat", "cfdi").await.unwrap(), 5);
}

#[tokio::test]
async fn test_flat_mode_imports_every_document_in_batches() {
    let files: Vec<(String, String)> = (0..7)
        .map(|i| {
            (
                format!("{i}.xml"),
                invoice("AAA010101AAA", "BBB010101BBB", &format!("u-{i}")),
            )
        })
        .collect();
    let borrowed: Vec<(&str, String)> = files
        .iter()
        .map(|(name, content)| (name.as_str(), content.clone()))
        .collect();
    let input = write_folder(&borrowed);
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;

    let mut config = config(input.path(), quarantine.path(), LoadMode::Flat);
    config.number_of_batches = 3;

    let report = pipeline(config, &store).run().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.batches.len(), 3);
    assert_eq!(report.summary.imported(RecordKind::Document), 7);
    assert_eq!(store.document_count("sat", "cfdi").await.unwrap(), 7);
}

#[tokio::test]
async fn test_clean_start_and_finish() {
    let input = write_folder(&[("a.xml", invoice("AAA010101AAA", "BBB010101BBB", "u-1"))]);
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;

    pipeline(
        config(input.path(), quarantine.path(), LoadMode::Flat),
        &store,
    )
    .run()
    .await
    .unwrap();

    let mut again = config(input.path(), quarantine.path(), LoadMode::Flat);
    again.should_cleanup_on_start = true;
    pipeline(again, &store).run().await.unwrap();
    assert_eq!(store.document_count("sat", "cfdi").await.unwrap(), 1);

    let mut last = config(input.path(), quarantine.path(), LoadMode::Flat);
    last.should_cleanup_on_finish = true;
    let report = pipeline(last, &store).run().await.unwrap();

    assert!(report.is_clean());
    assert!(!store.database_exists("sat").await.unwrap());
}

#[tokio::test]
async fn test_missing_folder_fails_before_provisioning() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;

    let err = pipeline(
        config(
            &quarantine.path().join("missing"),
            quarantine.path(),
            LoadMode::Graph,
        ),
        &store,
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Source(_)));
    assert!(!store.database_exists("sat").await.unwrap());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let input = write_folder(&[]);
    let store = memory_store().await;
    let mut config = config(input.path(), input.path(), LoadMode::Flat);
    config.number_of_batches = 0;

    let err = pipeline(config, &store).run().await.unwrap_err();

    assert!(matches!(err, Error::Config(_)));
}

/// Accepts at most one record per call and rejects issuer `BAD`.
struct TrickleImporter {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl BulkImporter for TrickleImporter {
    async fn bulk_import(
        &self,
        _collection: &CollectionRef,
        records: &[Value],
        _options: &ImportOptions,
        _cancel: &CancellationToken,
    ) -> Result<ImportOutcome, ImportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bad: Vec<Value> = records
            .iter()
            .filter(|r| r["pk"] == "BAD")
            .cloned()
            .collect();
        let good = records.len() - bad.len();

        Ok(ImportOutcome {
            documents_imported: good.min(1) as u64,
            time_taken: Duration::from_millis(1),
            request_units_consumed: 5.0,
            bad_input: bad,
        })
    }
}

#[tokio::test]
async fn test_bad_input_is_quarantined_and_batches_converge() {
    let input = write_folder(&[
        ("a.xml", invoice("AAA010101AAA", "B", "u-1")),
        ("b.xml", invoice("BAD", "B", "u-2")),
        ("c.xml", invoice("AAA010101AAA", "B", "u-3")),
        ("d.xml", invoice("AAA010101AAA", "B", "u-4")),
    ]);
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let importer = Arc::new(TrickleImporter {
        calls: AtomicU32::new(0),
    });

    let config = config(input.path(), quarantine.path(), LoadMode::Flat);
    let source = FolderSource::new(config.input_folder.clone());
    let admin: Arc<dyn CollectionAdmin> = Arc::new(store.clone());
    let report = LoadPipeline::new(config, Box::new(source), admin, importer.clone())
        .run()
        .await
        .unwrap();

    assert!(report.is_clean());
    assert!(report.batches[0].is_complete());
    assert_eq!(report.summary.imported(RecordKind::Document), 3);
    assert_eq!(importer.calls.load(Ordering::SeqCst), 3);

    let lines = std::fs::read_to_string(quarantine.path().join("BadDocuments.txt")).unwrap();
    let rejected: Vec<Value> = lines
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["pk"], "BAD");
}

#[tokio::test]
async fn test_cancelled_run_still_reports() {
    let input = write_folder(&[("a.xml", invoice("AAA010101AAA", "BBB010101BBB", "u-1"))]);
    let quarantine = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline(
        config(input.path(), quarantine.path(), LoadMode::Graph),
        &store,
    )
    .with_cancellation(cancel)
    .run()
    .await
    .unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.summary.total_imported(), 0);
    assert_eq!(store.document_count("sat", "cfdi").await.unwrap(), 0);
}
