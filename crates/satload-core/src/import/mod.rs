mod batch;
mod cancel;
mod metrics;
mod orchestrator;
mod provision;
mod quarantine;
mod service;

pub use batch::{partition, Partition, PlannedBatch, RemainderPolicy};
pub use cancel::CancellationToken;
pub use metrics::{BatchOutcome, KindTotals, RecordKind, RunSummary};
pub use orchestrator::{
    BatchPlan, ImportStrategy, Orchestrator, RunReport, DEFAULT_MAX_BATCH_ATTEMPTS,
};
pub use provision::{CollectionTarget, Provisioner, ProvisioningError, ProvisioningResult};
pub use quarantine::QuarantineWriter;
pub use service::{
    BulkImporter, CollectionAdmin, CollectionRef, ImportError, ImportOptions, ImportOutcome,
    ImportResult, RetryOptions, ServiceErrorKind,
};
