use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinSet;

use super::batch::{partition, PlannedBatch, RemainderPolicy};
use super::cancel::CancellationToken;
use super::metrics::{BatchOutcome, RecordKind, RunSummary};
use super::quarantine::QuarantineWriter;
use super::service::{BulkImporter, CollectionRef, ImportOptions, ImportOutcome};
use crate::error::Result;
use crate::graph::GraphModel;
use crate::ingest::FlatDocument;

pub const DEFAULT_MAX_BATCH_ATTEMPTS: u32 = 10;

/// How fixed-batch mode carves up its documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub number_of_batches: usize,
    /// Limits the run to the first N documents.
    pub documents_to_import: Option<usize>,
    pub remainder: RemainderPolicy,
    /// Submissions per batch before it is given up as stuck.
    pub max_attempts: u32,
}

impl BatchPlan {
    #[must_use]
    pub fn new(number_of_batches: usize) -> Self {
        Self {
            number_of_batches,
            documents_to_import: None,
            remainder: RemainderPolicy::default(),
            max_attempts: DEFAULT_MAX_BATCH_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, documents: Option<usize>) -> Self {
        self.documents_to_import = documents;
        self
    }

    #[must_use]
    pub fn with_remainder(mut self, remainder: RemainderPolicy) -> Self {
        self.remainder = remainder;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

pub enum ImportStrategy {
    /// Every vertex in one call, then every edge in a second call.
    WholeCollection(GraphModel),
    /// Contiguous batches imported concurrently, each re-submitted until
    /// all of its documents are settled.
    FixedBatch {
        documents: Vec<FlatDocument>,
        plan: BatchPlan,
    },
}

impl ImportStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WholeCollection(_) => "whole-collection",
            Self::FixedBatch { .. } => "fixed-batch",
        }
    }
}

/// Everything a run produced: totals, rejected records and failures.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub summary: RunSummary,
    pub bad_input: BTreeMap<RecordKind, Vec<Value>>,
    pub batches: Vec<BatchOutcome>,
    pub failures: Vec<String>,
}

impl RunReport {
    fn absorb(&mut self, kind: RecordKind, outcome: ImportOutcome) {
        self.summary.record(kind, &outcome);
        if !outcome.bad_input.is_empty() {
            self.bad_input
                .entry(kind)
                .or_default()
                .extend(outcome.bad_input);
        }
    }

    /// True when nothing failed. Rejected records do not count as failure.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn bad_input_for(&self, kind: RecordKind) -> &[Value] {
        self.bad_input
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Writes every rejected record to its quarantine file.
    pub async fn write_quarantine(&self, writer: &QuarantineWriter) -> std::io::Result<usize> {
        let mut written = 0;
        for (kind, records) in &self.bad_input {
            written += writer.write(*kind, records).await?;
        }
        Ok(written)
    }
}

/// Drives import calls against one collection.
#[derive(Clone)]
pub struct Orchestrator {
    importer: Arc<dyn BulkImporter>,
    collection: CollectionRef,
    options: ImportOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(importer: Arc<dyn BulkImporter>, collection: CollectionRef) -> Self {
        Self {
            importer,
            collection,
            options: ImportOptions::idempotent(),
            cancel: CancellationToken::new(),
        }
    }

    /// Upsert stays on and id generation stays off whatever is passed in.
    #[must_use]
    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = ImportOptions {
            enable_upsert: true,
            disable_automatic_id_generation: true,
            ..options
        };
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub async fn run(&self, strategy: ImportStrategy) -> Result<RunReport> {
        tracing::info!(
            "Starting {} import into {}",
            strategy.name(),
            self.collection
        );

        let mut report = RunReport::default();
        match strategy {
            ImportStrategy::WholeCollection(graph) => {
                self.import_graph(&graph, &mut report).await?;
            }
            ImportStrategy::FixedBatch { documents, plan } => {
                self.import_batches(documents, plan, &mut report).await;
            }
        }

        Ok(report)
    }

    async fn import_graph(&self, graph: &GraphModel, report: &mut RunReport) -> Result<()> {
        let phases = [
            (RecordKind::Vertex, graph.vertex_records()?),
            (RecordKind::Edge, graph.edge_records()?),
        ];

        for (kind, records) in phases {
            if self.cancel.is_cancelled() {
                tracing::warn!("Import cancelled before {}", kind.plural());
                report.failures.push(format!("cancelled before {}", kind.plural()));
                break;
            }
            if records.is_empty() {
                continue;
            }

            tracing::info!("Importing {} {}", records.len(), kind.plural());
            match self
                .importer
                .bulk_import(&self.collection, &records, &self.options, &self.cancel)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(
                        "Imported {} {} in {:.3} sec",
                        outcome.documents_imported,
                        kind.plural(),
                        outcome.time_taken.as_secs_f64()
                    );
                    report.absorb(kind, outcome);
                }
                Err(e) => {
                    let (partial, e) = e.split();
                    report.absorb(kind, partial);
                    // Edges would point at vertices that may not exist.
                    tracing::warn!("Import of {} failed: {}", kind.plural(), e);
                    report.failures.push(format!("{}: {e}", kind.plural()));
                    break;
                }
            }
        }

        Ok(())
    }

    async fn import_batches(
        &self,
        documents: Vec<FlatDocument>,
        plan: BatchPlan,
        report: &mut RunReport,
    ) {
        let mut records: Vec<Value> = documents
            .into_iter()
            .map(FlatDocument::into_record)
            .collect();
        if let Some(limit) = plan.documents_to_import {
            records.truncate(limit);
        }

        let layout = partition(records.len(), plan.number_of_batches, plan.remainder);
        if !layout.dropped.is_empty() {
            tracing::warn!(
                "Leaving {} documents out of the run (remainder policy {})",
                layout.dropped.len(),
                plan.remainder
            );
        }
        tracing::info!(
            "Importing {} documents in {} batches",
            records.len() - layout.dropped.len(),
            layout.batches.len()
        );

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for batch in layout.batches {
            let slice = records[batch.range.clone()].to_vec();
            let worker = self.clone();
            tasks.spawn(async move { worker.drive_batch(batch, slice, plan.max_attempts).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!("Batch task aborted: {}", e);
                    report.failures.push(format!("batch task aborted: {e}"));
                    report.summary.failed_batches += 1;
                }
            }
        }
        outcomes.sort_by_key(|o| o.batch.index);

        for outcome in outcomes {
            if let Some(error) = &outcome.error {
                report
                    .failures
                    .push(format!("batch {}: {error}", outcome.batch.index));
            } else if outcome.cancelled {
                report
                    .failures
                    .push(format!("batch {}: cancelled", outcome.batch.index));
            }
            if !outcome.is_complete() {
                report.summary.failed_batches += 1;
            }
            report.absorb(RecordKind::Document, outcome.outcome.clone());
            report.batches.push(outcome);
        }

        // Batches overlap in time, so summed per-call durations overstate it.
        report.summary.elapsed = started.elapsed();
    }

    /// Submits the batch until imported plus rejected records cover it.
    ///
    /// Rejected records are dropped from later submissions. The loop also
    /// ends on the first error, on cancellation, or after `max_attempts`.
    async fn drive_batch(
        &self,
        batch: PlannedBatch,
        mut pending: Vec<Value>,
        max_attempts: u32,
    ) -> BatchOutcome {
        let mut result = BatchOutcome::new(batch);

        while !result.is_complete() {
            if self.cancel.is_cancelled() {
                tracing::info!("Batch {} cancelled", result.batch.index);
                result.cancelled = true;
                break;
            }
            if result.attempts >= max_attempts {
                tracing::warn!(
                    "Batch {} made no progress after {} attempts ({}/{} settled)",
                    result.batch.index,
                    result.attempts,
                    result.settled(),
                    result.batch.len()
                );
                result.error = Some(format!(
                    "gave up after {} attempts with {}/{} documents settled",
                    result.attempts,
                    result.settled(),
                    result.batch.len()
                ));
                break;
            }

            result.attempts += 1;
            match self
                .importer
                .bulk_import(&self.collection, &pending, &self.options, &self.cancel)
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(
                        "Batch {} attempt {}: {} imported, {} rejected",
                        result.batch.index,
                        result.attempts,
                        outcome.documents_imported,
                        outcome.bad_input.len()
                    );
                    drop_rejected(&mut pending, &outcome.bad_input);
                    result.credit(outcome);
                }
                Err(e) => {
                    let (partial, e) = e.split();
                    drop_rejected(&mut pending, &partial.bad_input);
                    result.credit(partial);
                    tracing::warn!(
                        "Batch {} failed on attempt {}: {}",
                        result.batch.index,
                        result.attempts,
                        e
                    );
                    result.error = Some(e.to_string());
                    break;
                }
            }
        }

        result
    }
}

/// Identity used to match rejected records against pending ones: the `id`
/// when the record has one, the compact JSON otherwise.
fn record_key(record: &Value) -> String {
    match record.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => record.to_string(),
    }
}

fn drop_rejected(pending: &mut Vec<Value>, rejected: &[Value]) {
    if rejected.is_empty() {
        return;
    }
    let rejected: HashSet<String> = rejected.iter().map(record_key).collect();
    pending.retain(|record| !rejected.contains(&record_key(record)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::import::service::{ImportError, ImportResult, ServiceErrorKind};
    use crate::ingest::InvoiceRelationPair;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Imports at most `per_call` records per call and rejects records
    /// flagged `"bad": true`.
    struct ScriptedImporter {
        per_call: usize,
        calls: AtomicU32,
        fail_on_call: Option<u32>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedImporter {
        fn new(per_call: usize) -> Self {
            Self {
                per_call,
                calls: AtomicU32::new(0),
                fail_on_call: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BulkImporter for ScriptedImporter {
        async fn bulk_import(
            &self,
            _collection: &CollectionRef,
            records: &[Value],
            _options: &ImportOptions,
            _cancel: &CancellationToken,
        ) -> ImportResult<ImportOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().unwrap().push(records.len());
            if self.fail_on_call == Some(call) {
                return Err(ImportError::service(ServiceErrorKind::Unavailable, "gone"));
            }

            let (bad, good): (Vec<&Value>, Vec<&Value>) =
                records.iter().partition(|r| r["bad"] == json!(true));
            Ok(ImportOutcome {
                documents_imported: good.len().min(self.per_call) as u64,
                time_taken: Duration::from_millis(10),
                request_units_consumed: 5.0 * good.len().min(self.per_call) as f64,
                bad_input: bad.into_iter().cloned().collect(),
            })
        }
    }

    fn collection() -> CollectionRef {
        CollectionRef {
            database: "db".into(),
            collection: "coll".into(),
            throughput: 400,
        }
    }

    fn documents(n: usize) -> Vec<FlatDocument> {
        (0..n)
            .map(|i| FlatDocument {
                id: format!("doc-{i}"),
                pk: "AAA010101AAA".into(),
                body: json!({"id": format!("doc-{i}"), "pk": "AAA010101AAA"}),
            })
            .collect()
    }

    fn orchestrator(importer: &Arc<ScriptedImporter>) -> Orchestrator {
        let importer: Arc<dyn BulkImporter> = importer.clone();
        Orchestrator::new(importer, collection())
    }

    #[tokio::test]
    async fn test_fixed_batches_cover_all_documents() {
        let importer = Arc::new(ScriptedImporter::new(usize::MAX));

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: documents(10),
                plan: BatchPlan::new(3),
            })
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.batches.len(), 3);
        assert_eq!(report.summary.imported(RecordKind::Document), 10);
        let mut seen = importer.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![3, 3, 4]);
    }

    #[tokio::test]
    async fn test_batch_resubmits_until_settled() {
        let importer = Arc::new(ScriptedImporter::new(2));

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: documents(5),
                plan: BatchPlan::new(1),
            })
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.batches[0].attempts, 3);
        assert!(report.batches[0].is_complete());
        assert_eq!(report.batches[0].outcome.documents_imported, 5);
        assert_eq!(report.summary.imported(RecordKind::Document), 5);
    }

    /// Imports `first_call` records on the first call and everything after.
    struct RecoveringImporter {
        first_call: u64,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl BulkImporter for RecoveringImporter {
        async fn bulk_import(
            &self,
            _collection: &CollectionRef,
            records: &[Value],
            _options: &ImportOptions,
            _cancel: &CancellationToken,
        ) -> ImportResult<ImportOutcome> {
            let imported = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.first_call
            } else {
                records.len() as u64
            };
            Ok(ImportOutcome {
                documents_imported: imported,
                time_taken: Duration::from_millis(10),
                request_units_consumed: 5.0 * imported as f64,
                bad_input: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_resubmitted_batch_counts_each_document_once() {
        let importer: Arc<dyn BulkImporter> = Arc::new(RecoveringImporter {
            first_call: 2,
            calls: AtomicU32::new(0),
        });

        let report = Orchestrator::new(importer, collection())
            .run(ImportStrategy::FixedBatch {
                documents: documents(5),
                plan: BatchPlan::new(1),
            })
            .await
            .unwrap();

        let batch = &report.batches[0];
        assert_eq!(batch.attempts, 2);
        assert_eq!(batch.writes, 7);
        assert_eq!(batch.outcome.documents_imported, 5);
        assert_eq!(report.summary.imported(RecordKind::Document), 5);
        assert!(report.summary.to_string().contains("Inserted 5 records (5 documents)"));
    }

    /// Rejects records flagged `"bad": true`, then fails partway with the
    /// rejections attached.
    struct PartialFailureImporter;

    #[async_trait::async_trait]
    impl BulkImporter for PartialFailureImporter {
        async fn bulk_import(
            &self,
            _collection: &CollectionRef,
            records: &[Value],
            _options: &ImportOptions,
            _cancel: &CancellationToken,
        ) -> ImportResult<ImportOutcome> {
            let bad: Vec<Value> = records
                .iter()
                .filter(|r| r["bad"] == json!(true))
                .cloned()
                .collect();
            let committed = ImportOutcome {
                documents_imported: 1,
                bad_input: bad,
                ..ImportOutcome::default()
            };
            Err(ImportError::service(ServiceErrorKind::Unavailable, "gone").with_partial(committed))
        }
    }

    #[tokio::test]
    async fn test_failed_call_keeps_committed_work() {
        let mut docs = documents(3);
        docs[0].body["bad"] = json!(true);
        let importer: Arc<dyn BulkImporter> = Arc::new(PartialFailureImporter);

        let report = Orchestrator::new(Arc::clone(&importer), collection())
            .run(ImportStrategy::FixedBatch {
                documents: docs,
                plan: BatchPlan::new(1),
            })
            .await
            .unwrap();

        assert_eq!(report.summary.imported(RecordKind::Document), 1);
        assert_eq!(report.bad_input_for(RecordKind::Document).len(), 1);
        assert_eq!(report.summary.failed_batches, 1);
        assert!(report.failures[0].contains("unavailable"));

        let report = Orchestrator::new(importer, collection())
            .run(ImportStrategy::WholeCollection(graph()))
            .await
            .unwrap();

        assert_eq!(report.summary.imported(RecordKind::Vertex), 1);
        assert_eq!(report.summary.imported(RecordKind::Edge), 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_rejected_records_match_by_id() {
        let mut pending = vec![
            json!({"id": "a", "pk": "P"}),
            json!({"id": "b", "pk": "P"}),
            json!({"pk": "no-id"}),
        ];

        drop_rejected(
            &mut pending,
            &[json!({"id": "a", "pk": "P", "extra": 1}), json!({"pk": "no-id"})],
        );

        assert_eq!(pending, vec![json!({"id": "b", "pk": "P"})]);
    }

    #[tokio::test]
    async fn test_bad_input_is_quarantined_not_resubmitted() {
        let importer = Arc::new(ScriptedImporter::new(usize::MAX));
        let mut docs = documents(4);
        docs[1].body["bad"] = json!(true);

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: docs,
                plan: BatchPlan::new(1),
            })
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.summary.imported(RecordKind::Document), 3);
        assert_eq!(report.bad_input_for(RecordKind::Document).len(), 1);
        assert_eq!(importer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_bad_batch_completes() {
        let importer = Arc::new(ScriptedImporter::new(usize::MAX));
        let mut docs = documents(3);
        for doc in &mut docs {
            doc.body["bad"] = json!(true);
        }

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: docs,
                plan: BatchPlan::new(1),
            })
            .await
            .unwrap();

        assert!(report.batches[0].is_complete());
        assert_eq!(report.summary.failed_batches, 0);
        assert_eq!(report.bad_input_for(RecordKind::Document).len(), 3);
    }

    #[tokio::test]
    async fn test_error_ends_batch_keeping_partial_import() {
        let mut scripted = ScriptedImporter::new(2);
        scripted.fail_on_call = Some(2);
        let importer = Arc::new(scripted);

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: documents(5),
                plan: BatchPlan::new(1),
            })
            .await
            .unwrap();

        assert_eq!(report.summary.imported(RecordKind::Document), 2);
        assert_eq!(report.summary.failed_batches, 1);
        assert!(report.failures[0].starts_with("batch 0:"));
    }

    #[tokio::test]
    async fn test_stuck_batch_gives_up() {
        let importer = Arc::new(ScriptedImporter::new(0));

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: documents(2),
                plan: BatchPlan::new(1).with_max_attempts(4),
            })
            .await
            .unwrap();

        assert_eq!(report.batches[0].attempts, 4);
        assert_eq!(report.summary.failed_batches, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_submits_nothing() {
        let importer = Arc::new(ScriptedImporter::new(usize::MAX));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator(&importer)
            .with_cancellation(cancel)
            .run(ImportStrategy::FixedBatch {
                documents: documents(4),
                plan: BatchPlan::new(2),
            })
            .await
            .unwrap();

        assert_eq!(importer.calls.load(Ordering::SeqCst), 0);
        assert!(report.batches.iter().all(|b| b.cancelled));
    }

    #[tokio::test]
    async fn test_document_limit_and_drop_policy() {
        let importer = Arc::new(ScriptedImporter::new(usize::MAX));

        let report = orchestrator(&importer)
            .run(ImportStrategy::FixedBatch {
                documents: documents(20),
                plan: BatchPlan::new(3)
                    .with_limit(Some(10))
                    .with_remainder(RemainderPolicy::Drop),
            })
            .await
            .unwrap();

        assert_eq!(report.summary.imported(RecordKind::Document), 9);
    }

    fn graph() -> GraphModel {
        let pairs = vec![
            InvoiceRelationPair::new("A".into(), "B".into(), "u1".into()),
            InvoiceRelationPair::new("A".into(), "C".into(), "u2".into()),
        ];
        GraphBuilder::build(&pairs)
    }

    #[tokio::test]
    async fn test_whole_collection_imports_vertices_then_edges() {
        let importer = Arc::new(ScriptedImporter::new(usize::MAX));

        let report = orchestrator(&importer)
            .run(ImportStrategy::WholeCollection(graph()))
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(*importer.seen.lock().unwrap(), vec![5, 4]);
        assert_eq!(report.summary.imported(RecordKind::Vertex), 5);
        assert_eq!(report.summary.imported(RecordKind::Edge), 4);
        assert_eq!(report.summary.elapsed, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_vertex_failure_skips_edges() {
        let mut scripted = ScriptedImporter::new(usize::MAX);
        scripted.fail_on_call = Some(1);
        let importer = Arc::new(scripted);

        let report = orchestrator(&importer)
            .run(ImportStrategy::WholeCollection(graph()))
            .await
            .unwrap();

        assert_eq!(importer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.summary.total_imported(), 0);
    }

    #[test]
    fn test_options_stay_idempotent() {
        let importer: Arc<dyn BulkImporter> = Arc::new(ScriptedImporter::new(1));
        let orchestrator = Orchestrator::new(importer, collection()).with_options(ImportOptions {
            enable_upsert: false,
            disable_automatic_id_generation: false,
            max_concurrency_per_partition_key_range: Some(4),
            max_in_memory_sorting_batch_size: None,
        });

        assert!(orchestrator.options().enable_upsert);
        assert!(orchestrator.options().disable_automatic_id_generation);
        assert_eq!(
            orchestrator.options().max_concurrency_per_partition_key_range,
            Some(4)
        );
    }
}
