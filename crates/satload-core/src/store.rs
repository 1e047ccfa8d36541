use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::import::{
    BulkImporter, CancellationToken, CollectionAdmin, CollectionRef, ImportError, ImportOptions,
    ImportOutcome, ImportResult, RetryOptions, ServiceErrorKind,
};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS databases (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    database TEXT NOT NULL,
    name TEXT NOT NULL,
    throughput INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (database, name)
);

CREATE TABLE IF NOT EXISTS documents (
    database TEXT NOT NULL,
    collection TEXT NOT NULL,
    pk TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (database, collection, pk, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(database, collection);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO documents (database, collection, pk, id, body, updated_at)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT (database, collection, pk, id)
DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
"#;

const INSERT_SQL: &str = r#"
INSERT INTO documents (database, collection, pk, id, body, updated_at)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT (database, collection, pk, id) DO NOTHING
"#;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
const MAX_ID_LEN: usize = 255;
const FORBIDDEN_ID_CHARS: [char; 4] = ['/', '\\', '?', '#'];

const WRITE_BASE_CHARGE: f64 = 5.0;
const WRITE_CHARGE_PER_KB: f64 = 1.0;
const CONFLICT_CHARGE: f64 = 1.0;

/// How long one statement waits on a lock before it reports busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Throttle budget of each chunk write inside an import call.
pub const DEFAULT_IMPORT_RETRY: RetryOptions = RetryOptions::provisioning();

/// Local document store standing in for the bulk-import service.
///
/// Records are keyed by `(database, collection, pk, id)`. Every write is
/// charged request units from its body size and the store sleeps after each
/// chunk so a collection never runs faster than its provisioned throughput.
///
/// `retry` is the connection's budget and covers admin calls. Chunk writes
/// inside [`BulkImporter::bulk_import`] use `import_retry`, so a connection
/// opened with a zero budget still leaves throttle handling to the import.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    retry: RetryOptions,
    import_retry: RetryOptions,
}

impl SqliteStore {
    /// Opens `endpoint`, either a `sqlite:` URL or a file path.
    pub async fn open(endpoint: &str, retry: RetryOptions) -> ImportResult<Self> {
        let options = if endpoint.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(endpoint)?
        } else {
            SqliteConnectOptions::new()
                .filename(endpoint)
                .create_if_missing(true)
        };
        let options = options
            .busy_timeout(BUSY_TIMEOUT)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;
        tracing::debug!("Opened store at {}", endpoint);

        Ok(Self::from_pool(pool, retry))
    }

    pub async fn open_memory(retry: RetryOptions) -> ImportResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self::from_pool(pool, retry))
    }

    fn from_pool(pool: Pool<Sqlite>, retry: RetryOptions) -> Self {
        Self {
            pool,
            retry,
            import_retry: DEFAULT_IMPORT_RETRY,
        }
    }

    /// A handle on the same store with a different connection retry budget.
    #[must_use]
    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        Self {
            pool: self.pool.clone(),
            retry,
            import_retry: self.import_retry,
        }
    }

    /// Sets the throttle budget of chunk writes during an import.
    #[must_use]
    pub fn with_import_retry(mut self, retry: RetryOptions) -> Self {
        self.import_retry = retry;
        self
    }

    pub fn retry_options(&self) -> RetryOptions {
        self.retry
    }

    pub async fn document_count(&self, database: &str, collection: &str) -> ImportResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM documents WHERE database = ? AND collection = ?",
        )
        .bind(database)
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn get_document(
        &self,
        database: &str,
        collection: &str,
        pk: &str,
        id: &str,
    ) -> ImportResult<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT body FROM documents
            WHERE database = ? AND collection = ? AND pk = ? AND id = ?
            "#,
        )
        .bind(database)
        .bind(collection)
        .bind(pk)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(body,)| {
            serde_json::from_str(&body)
                .map_err(|e| ImportError::Generic(format!("corrupt document {pk}/{id}: {e}")))
        })
        .transpose()
    }

    async fn lookup_database(&self, database: &str) -> ImportResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM databases WHERE name = ?")
            .bind(database)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn insert_database(&self, database: &str) -> ImportResult<()> {
        sqlx::query("INSERT INTO databases (name, created_at) VALUES (?, ?)")
            .bind(database)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_database(&self, database: &str) -> ImportResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents WHERE database = ?")
            .bind(database)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE database = ?")
            .bind(database)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM databases WHERE name = ?")
            .bind(database)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ImportError::service(
                ServiceErrorKind::NotFound,
                format!("database {database}"),
            ));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn lookup_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> ImportResult<Option<CollectionRef>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT database, name, throughput FROM collections WHERE database = ? AND name = ?",
        )
        .bind(database)
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(database, collection, throughput)| CollectionRef {
            database,
            collection,
            throughput: u32::try_from(throughput).unwrap_or(u32::MAX),
        }))
    }

    async fn insert_collection(
        &self,
        database: &str,
        collection: &str,
        throughput: u32,
    ) -> ImportResult<CollectionRef> {
        if !self.lookup_database(database).await? {
            return Err(ImportError::service(
                ServiceErrorKind::NotFound,
                format!("database {database}"),
            ));
        }

        sqlx::query(
            "INSERT INTO collections (database, name, throughput, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(database)
        .bind(collection)
        .bind(i64::from(throughput))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(CollectionRef {
            database: database.to_string(),
            collection: collection.to_string(),
            throughput,
        })
    }

    async fn write_chunk(
        &self,
        collection: &CollectionRef,
        rows: &[Row],
        upsert: bool,
    ) -> ImportResult<Written> {
        let sql = if upsert { UPSERT_SQL } else { INSERT_SQL };
        let now = Utc::now().to_rfc3339();
        let mut written = Written::default();

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let result = sqlx::query(sql)
                .bind(&collection.database)
                .bind(&collection.collection)
                .bind(&row.pk)
                .bind(&row.id)
                .bind(&row.body)
                .bind(&now)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() > 0 {
                written.count += 1;
                written.request_units += write_charge(row.body.len());
            } else {
                written.request_units += CONFLICT_CHARGE;
            }
        }
        tx.commit().await?;

        Ok(written)
    }
}

#[async_trait::async_trait]
impl CollectionAdmin for SqliteStore {
    async fn database_exists(&self, database: &str) -> ImportResult<bool> {
        self.retry.run(move || self.lookup_database(database)).await
    }

    async fn create_database(&self, database: &str) -> ImportResult<()> {
        self.retry.run(move || self.insert_database(database)).await
    }

    async fn delete_database(&self, database: &str) -> ImportResult<()> {
        self.retry.run(move || self.remove_database(database)).await
    }

    async fn get_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> ImportResult<Option<CollectionRef>> {
        self.retry
            .run(move || self.lookup_collection(database, collection))
            .await
    }

    async fn create_collection(
        &self,
        database: &str,
        collection: &str,
        throughput: u32,
    ) -> ImportResult<CollectionRef> {
        self.retry
            .run(move || self.insert_collection(database, collection, throughput))
            .await
    }
}

#[async_trait::async_trait]
impl BulkImporter for SqliteStore {
    async fn bulk_import(
        &self,
        collection: &CollectionRef,
        records: &[Value],
        options: &ImportOptions,
        cancel: &CancellationToken,
    ) -> ImportResult<ImportOutcome> {
        let started = Instant::now();

        let target = self
            .retry
            .run(move || self.lookup_collection(&collection.database, &collection.collection))
            .await?
            .ok_or_else(|| {
                ImportError::service(ServiceErrorKind::NotFound, format!("collection {collection}"))
            })?;

        let chunk_size = options
            .max_in_memory_sorting_batch_size
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .max(1);
        let mut outcome = ImportOutcome::default();

        for chunk in records.chunks(chunk_size) {
            if cancel.is_cancelled() {
                tracing::debug!("Import into {} cancelled between chunks", target);
                break;
            }

            let mut rows = Vec::with_capacity(chunk.len());
            for record in chunk {
                match Row::prepare(record, options) {
                    Some(row) => rows.push(row),
                    None => outcome.bad_input.push(record.clone()),
                }
            }
            if rows.is_empty() {
                continue;
            }

            let rows = &rows;
            let target_ref = &target;
            let written = match self
                .import_retry
                .run(move || self.write_chunk(target_ref, rows, options.enable_upsert))
                .await
            {
                Ok(written) => written,
                Err(e) => {
                    outcome.time_taken = started.elapsed();
                    return Err(e.with_partial(outcome));
                }
            };

            outcome.documents_imported += written.count;
            outcome.request_units_consumed += written.request_units;

            pace(target.throughput, written.request_units, cancel).await;
        }

        outcome.time_taken = started.elapsed();
        Ok(outcome)
    }
}

/// A validated record ready to write.
#[derive(Debug)]
struct Row {
    pk: String,
    id: String,
    body: String,
}

impl Row {
    /// `None` marks the record as bad input.
    fn prepare(record: &Value, options: &ImportOptions) -> Option<Self> {
        let fields = record.as_object()?;
        let pk = fields.get("pk")?.as_str().filter(|pk| !pk.is_empty())?;

        match fields.get("id") {
            Some(Value::String(id)) if valid_id(id) => Some(Self {
                pk: pk.to_string(),
                id: id.clone(),
                body: record.to_string(),
            }),
            None if !options.disable_automatic_id_generation => {
                let id = Uuid::new_v4().to_string();
                let mut body = fields.clone();
                body.insert("id".into(), Value::String(id.clone()));
                Some(Self {
                    pk: pk.to_string(),
                    id,
                    body: Value::Object(body).to_string(),
                })
            }
            _ => None,
        }
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_ID_LEN && !id.contains(FORBIDDEN_ID_CHARS)
}

#[derive(Debug, Default)]
struct Written {
    count: u64,
    request_units: f64,
}

fn write_charge(body_len: usize) -> f64 {
    WRITE_BASE_CHARGE + WRITE_CHARGE_PER_KB * (body_len as f64 / 1024.0)
}

/// Sleeps long enough that `request_units` fit in the collection's
/// per-second budget. Returns early on cancellation.
async fn pace(throughput: u32, request_units: f64, cancel: &CancellationToken) {
    if throughput == 0 || request_units <= 0.0 {
        return;
    }

    let delay = Duration::from_secs_f64(request_units / f64::from(throughput));
    tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = cancel.cancelled() => {}
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::service(ServiceErrorKind::Conflict, db.message())
            }
            sqlx::Error::Database(db) if is_busy(db.code().as_deref()) => {
                Self::service(ServiceErrorKind::Throttled, db.message())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::service(ServiceErrorKind::Unavailable, e.to_string())
            }
            _ => Self::Generic(e.to_string()),
        }
    }
}

/// `SQLITE_BUSY` and `SQLITE_LOCKED`, including their extended codes.
fn is_busy(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}
