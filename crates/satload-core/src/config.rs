use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::import::{
    BatchPlan, CollectionTarget, ImportOptions, RemainderPolicy, DEFAULT_MAX_BATCH_ATTEMPTS,
};
use crate::store::DEFAULT_CHUNK_SIZE;

pub const ENV_PREFIX: &str = "SATLOAD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which shape the invoices are loaded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Deduplicated issuer/invoice/recipient vertices and their edges.
    #[default]
    Graph,
    /// One document per invoice carrying the whole converted tree.
    Flat,
}

impl LoadMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Flat => "flat",
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graph" => Ok(Self::Graph),
            "flat" | "document" | "documents" => Ok(Self::Flat),
            _ => Err(format!("unknown load mode: {s}")),
        }
    }
}

/// Settings of one loader run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderConfig {
    pub endpoint: String,
    /// Carried through to the sink; the bundled store ignores it.
    pub authorization_key: String,
    pub database_name: String,
    pub collection_name: String,
    pub collection_throughput: u32,
    pub input_folder: PathBuf,
    pub should_cleanup_on_start: bool,
    pub should_cleanup_on_finish: bool,
    pub number_of_documents_to_import: Option<usize>,
    pub number_of_batches: usize,
    pub mode: LoadMode,
    pub remainder_policy: RemainderPolicy,
    pub max_batch_attempts: u32,
    pub quarantine_dir: PathBuf,
    pub max_in_memory_sorting_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            endpoint: "satload.db".to_string(),
            authorization_key: String::new(),
            database_name: "sat".to_string(),
            collection_name: "cfdi".to_string(),
            collection_throughput: 400,
            input_folder: PathBuf::new(),
            should_cleanup_on_start: false,
            should_cleanup_on_finish: false,
            number_of_documents_to_import: None,
            number_of_batches: 1,
            mode: LoadMode::default(),
            remainder_policy: RemainderPolicy::default(),
            max_batch_attempts: DEFAULT_MAX_BATCH_ATTEMPTS,
            quarantine_dir: PathBuf::from("."),
            max_in_memory_sorting_batch_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl LoaderConfig {
    /// Reads a JSON file. Keys left out keep their defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields from `SATLOAD_*` environment variables.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Overrides fields from variables named `SATLOAD_<FIELD>`, where
    /// `<FIELD>` is the upper snake case field name.
    pub fn apply_vars<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| {
            let key = format!("{ENV_PREFIX}{field}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = var("ENDPOINT") {
            self.endpoint = v;
        }
        if let Some((_, v)) = var("AUTHORIZATION_KEY") {
            self.authorization_key = v;
        }
        if let Some((_, v)) = var("DATABASE_NAME") {
            self.database_name = v;
        }
        if let Some((_, v)) = var("COLLECTION_NAME") {
            self.collection_name = v;
        }
        if let Some((k, v)) = var("COLLECTION_THROUGHPUT") {
            self.collection_throughput = parse(&k, &v)?;
        }
        if let Some((_, v)) = var("INPUT_FOLDER") {
            self.input_folder = PathBuf::from(v);
        }
        if let Some((k, v)) = var("SHOULD_CLEANUP_ON_START") {
            self.should_cleanup_on_start = parse_bool(&k, &v)?;
        }
        if let Some((k, v)) = var("SHOULD_CLEANUP_ON_FINISH") {
            self.should_cleanup_on_finish = parse_bool(&k, &v)?;
        }
        if let Some((k, v)) = var("NUMBER_OF_DOCUMENTS_TO_IMPORT") {
            self.number_of_documents_to_import = if v.is_empty() {
                None
            } else {
                Some(parse(&k, &v)?)
            };
        }
        if let Some((k, v)) = var("NUMBER_OF_BATCHES") {
            self.number_of_batches = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("MODE") {
            self.mode = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("REMAINDER_POLICY") {
            self.remainder_policy = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("MAX_BATCH_ATTEMPTS") {
            self.max_batch_attempts = parse(&k, &v)?;
        }
        if let Some((_, v)) = var("QUARANTINE_DIR") {
            self.quarantine_dir = PathBuf::from(v);
        }
        if let Some((k, v)) = var("MAX_IN_MEMORY_SORTING_BATCH_SIZE") {
            self.max_in_memory_sorting_batch_size = parse(&k, &v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint is empty".into()));
        }
        if self.database_name.trim().is_empty() {
            return Err(ConfigError::Invalid("databaseName is empty".into()));
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::Invalid("collectionName is empty".into()));
        }
        if self.input_folder.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("inputFolder is not set".into()));
        }
        if self.collection_throughput == 0 {
            return Err(ConfigError::Invalid(
                "collectionThroughput must be positive".into(),
            ));
        }
        if self.number_of_batches == 0 {
            return Err(ConfigError::Invalid(
                "numberOfBatches must be positive".into(),
            ));
        }
        if self.max_batch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "maxBatchAttempts must be positive".into(),
            ));
        }
        if self.max_in_memory_sorting_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "maxInMemorySortingBatchSize must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn target(&self) -> CollectionTarget {
        CollectionTarget {
            database: self.database_name.clone(),
            collection: self.collection_name.clone(),
            throughput: self.collection_throughput,
        }
    }

    pub fn batch_plan(&self) -> BatchPlan {
        BatchPlan::new(self.number_of_batches)
            .with_limit(self.number_of_documents_to_import)
            .with_remainder(self.remainder_policy)
            .with_max_attempts(self.max_batch_attempts)
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions::idempotent().with_sorting_batch_size(self.max_in_memory_sorting_batch_size)
    }
}

fn parse<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}
