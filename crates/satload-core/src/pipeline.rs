use std::sync::Arc;

use crate::config::{LoadMode, LoaderConfig};
use crate::document::DocumentSource;
use crate::error::Result;
use crate::graph::GraphBuilder;
use crate::import::{
    BulkImporter, CancellationToken, CollectionAdmin, ImportStrategy, Orchestrator, Provisioner,
    QuarantineWriter, RunReport,
};
use crate::ingest::{extract_all, project_all};

/// One end-to-end load: read, transform, provision, import, quarantine.
pub struct LoadPipeline {
    config: LoaderConfig,
    source: Box<dyn DocumentSource>,
    admin: Arc<dyn CollectionAdmin>,
    importer: Arc<dyn BulkImporter>,
    cancel: CancellationToken,
}

impl LoadPipeline {
    pub fn new(
        config: LoaderConfig,
        source: Box<dyn DocumentSource>,
        admin: Arc<dyn CollectionAdmin>,
        importer: Arc<dyn BulkImporter>,
    ) -> Self {
        Self {
            config,
            source,
            admin,
            importer,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the load. Only invalid configuration, an unreadable source or
    /// failed provisioning are errors; import failures are reported in the
    /// returned [`RunReport`].
    pub async fn run(&self) -> Result<RunReport> {
        self.config.validate()?;

        let documents = self.source.load_raw().await?;
        let (strategy, skipped) = match self.config.mode {
            LoadMode::Graph => {
                let extracted = extract_all(&documents);
                let graph = GraphBuilder::build(&extracted.pairs);
                tracing::info!(
                    "Built graph with {} vertices and {} edges",
                    graph.vertices.len(),
                    graph.edges.len()
                );
                let stored = graph.stored_vertex_count();
                if stored != graph.vertices.len() {
                    tracing::warn!(
                        "{} vertices share a key with another label and will be stored as one record",
                        graph.vertices.len() - stored
                    );
                }
                (
                    ImportStrategy::WholeCollection(graph),
                    extracted.failure_count(),
                )
            }
            LoadMode::Flat => {
                let projected = project_all(&documents);
                let skipped = projected.failed.len();
                (
                    ImportStrategy::FixedBatch {
                        documents: projected.documents,
                        plan: self.config.batch_plan(),
                    },
                    skipped,
                )
            }
        };

        let provisioner = Provisioner::new(self.admin.as_ref());
        let collection = provisioner
            .prepare(&self.config.target(), self.config.should_cleanup_on_start)
            .await?;

        let mut report = Orchestrator::new(Arc::clone(&self.importer), collection)
            .with_options(self.config.import_options())
            .with_cancellation(self.cancel.clone())
            .run(strategy)
            .await?;
        report.summary.skipped_at_extraction = skipped;

        let quarantine = QuarantineWriter::new(&self.config.quarantine_dir);
        if let Err(e) = report.write_quarantine(&quarantine).await {
            tracing::warn!(
                "Could not write quarantine files to {}: {}",
                quarantine.dir().display(),
                e
            );
            report.failures.push(format!("quarantine: {e}"));
        }

        if self.config.should_cleanup_on_finish {
            if let Err(e) = provisioner
                .drop_database_if_exists(&self.config.database_name)
                .await
            {
                tracing::warn!("Cleanup failed: {}", e);
                report.failures.push(format!("cleanup: {e}"));
            }
        }

        Ok(report)
    }
}
