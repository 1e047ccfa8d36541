use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::cancel::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// Request rate exceeded; safe to retry after a delay.
    Throttled,
    Unavailable,
    NotFound,
    Conflict,
}

impl ServiceErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::Unavailable => "unavailable",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a call against the bulk-import service.
///
/// `Service` covers transport and throttling failures reported by the
/// service client; `Generic` is everything else.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Service error ({kind}): {message}")]
    Service {
        kind: ServiceErrorKind,
        message: String,
    },
    #[error("Import failed: {0}")]
    Generic(String),
    /// A call that failed after part of its work was already committed.
    #[error("{source} (after {} records were imported)", .outcome.documents_imported)]
    Partial {
        outcome: Box<ImportOutcome>,
        #[source]
        source: Box<ImportError>,
    },
}

impl ImportError {
    pub fn service(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self::Service {
            kind,
            message: message.into(),
        }
    }

    /// Attaches what the call committed before failing. An empty outcome
    /// leaves the error as it is.
    #[must_use]
    pub fn with_partial(self, outcome: ImportOutcome) -> Self {
        if outcome.documents_imported == 0 && outcome.bad_input.is_empty() {
            return self;
        }
        match self {
            Self::Partial {
                outcome: mut earlier,
                source,
            } => {
                earlier.merge(outcome);
                Self::Partial {
                    outcome: earlier,
                    source,
                }
            }
            other => Self::Partial {
                outcome: Box::new(outcome),
                source: Box::new(other),
            },
        }
    }

    /// Separates the committed part of a failed call from the failure.
    pub fn split(self) -> (ImportOutcome, Self) {
        match self {
            Self::Partial { outcome, source } => (*outcome, *source),
            other => (ImportOutcome::default(), other),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.kind() == Some(ServiceErrorKind::Throttled)
    }

    pub fn kind(&self) -> Option<ServiceErrorKind> {
        match self {
            Self::Service { kind, .. } => Some(*kind),
            Self::Generic(_) => None,
            Self::Partial { source, .. } => source.kind(),
        }
    }
}

pub type ImportResult<T> = Result<T, ImportError>;

/// Throttle retry budget of a service connection.
///
/// A connection is opened with one profile per phase: provisioning absorbs
/// transient throttling itself, bulk import hands pacing to the import call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_retry_attempts_on_throttled_requests: u32,
    pub max_retry_wait: Duration,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

impl RetryOptions {
    #[must_use]
    pub const fn provisioning() -> Self {
        Self {
            max_retry_attempts_on_throttled_requests: 9,
            max_retry_wait: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn bulk_import() -> Self {
        Self {
            max_retry_attempts_on_throttled_requests: 0,
            max_retry_wait: Duration::ZERO,
        }
    }

    /// Runs `op`, retrying throttled failures within the attempt and wait
    /// budget. Any other failure is returned immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> ImportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ImportResult<T>>,
    {
        let mut attempt = 0;
        let mut waited = Duration::ZERO;

        loop {
            match op().await {
                Err(e) if e.is_throttled() && attempt < self.max_retry_attempts_on_throttled_requests => {
                    let remaining = self.max_retry_wait.saturating_sub(waited);
                    if remaining.is_zero() {
                        return Err(e);
                    }
                    let delay = backoff(attempt).min(remaining);
                    attempt += 1;
                    tracing::debug!(
                        "Throttled, retry {}/{} in {:?}",
                        attempt,
                        self.max_retry_attempts_on_throttled_requests,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    waited += delay;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::provisioning()
    }
}

fn backoff(attempt: u32) -> Duration {
    INITIAL_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

/// Options passed with every bulk-import call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub enable_upsert: bool,
    pub disable_automatic_id_generation: bool,
    pub max_concurrency_per_partition_key_range: Option<usize>,
    pub max_in_memory_sorting_batch_size: Option<usize>,
}

impl ImportOptions {
    /// Upsert with caller-supplied ids, which makes a resubmitted batch
    /// idempotent.
    #[must_use]
    pub fn idempotent() -> Self {
        Self {
            enable_upsert: true,
            disable_automatic_id_generation: true,
            max_concurrency_per_partition_key_range: None,
            max_in_memory_sorting_batch_size: None,
        }
    }

    #[must_use]
    pub fn with_sorting_batch_size(mut self, size: usize) -> Self {
        self.max_in_memory_sorting_batch_size = Some(size);
        self
    }
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::idempotent()
    }
}

/// Statistics returned by one bulk-import call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub documents_imported: u64,
    pub time_taken: Duration,
    pub request_units_consumed: f64,
    /// Records the service refused on content grounds.
    pub bad_input: Vec<Value>,
}

impl ImportOutcome {
    pub fn merge(&mut self, other: Self) {
        self.documents_imported += other.documents_imported;
        self.time_taken += other.time_taken;
        self.request_units_consumed += other.request_units_consumed;
        self.bad_input.extend(other.bad_input);
    }
}

/// Handle to a provisioned collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
    /// Provisioned request units per second.
    pub throughput: u32,
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database, self.collection)
    }
}

#[async_trait::async_trait]
pub trait BulkImporter: Send + Sync {
    async fn bulk_import(
        &self,
        collection: &CollectionRef,
        records: &[Value],
        options: &ImportOptions,
        cancel: &CancellationToken,
    ) -> ImportResult<ImportOutcome>;
}

#[async_trait::async_trait]
pub trait CollectionAdmin: Send + Sync {
    async fn database_exists(&self, database: &str) -> ImportResult<bool>;

    async fn create_database(&self, database: &str) -> ImportResult<()>;

    async fn delete_database(&self, database: &str) -> ImportResult<()>;

    async fn get_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> ImportResult<Option<CollectionRef>>;

    async fn create_collection(
        &self,
        database: &str,
        collection: &str,
        throughput: u32,
    ) -> ImportResult<CollectionRef>;
}
