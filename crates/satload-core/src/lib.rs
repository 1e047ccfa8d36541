#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod document;
pub mod error;
pub mod graph;
pub mod import;
pub mod ingest;
pub mod pipeline;
pub mod store;

pub use config::{ConfigError, LoaderConfig, LoadMode};
pub use document::{DocumentSource, FolderSource, RawDocument, SourceError};
pub use error::{Error, Result};
pub use graph::{Edge, EdgeLabel, GraphBuilder, GraphModel, Vertex, VertexLabel};
pub use import::{
    BatchOutcome, BatchPlan, BulkImporter, CancellationToken, CollectionAdmin, CollectionRef,
    CollectionTarget, ImportError, ImportOptions, ImportOutcome, ImportStrategy, Orchestrator,
    PlannedBatch, Provisioner, ProvisioningError, QuarantineWriter, RecordKind, RemainderPolicy,
    RetryOptions, RunReport, RunSummary,
};
pub use ingest::{
    extract, extract_all, project, project_all, ExtractionBatch, ExtractionError,
    FlatDocument, InvoiceRelation, InvoiceRelationPair, ProjectionBatch, RelationKind,
};
pub use pipeline::LoadPipeline;
pub use store::SqliteStore;
