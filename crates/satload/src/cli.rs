use std::path::PathBuf;

use clap::Parser;
use satload_core::{LoadMode, LoaderConfig, RemainderPolicy};

#[derive(Debug, Parser)]
#[command(
    name = "satload",
    about = "Load CFDI invoice folders into a bulk document or graph store",
    version
)]
pub struct Cli {
    /// JSON configuration file (camelCase keys)
    #[arg(short = 'c', long, env = "SATLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Folder of XML invoices, one per file
    #[arg(short = 'i', long = "input")]
    pub input_folder: Option<PathBuf>,

    /// Store location: a sqlite: URL or a file path
    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long = "database")]
    pub database_name: Option<String>,

    #[arg(long = "collection")]
    pub collection_name: Option<String>,

    /// Provisioned request units per second
    #[arg(long = "throughput")]
    pub collection_throughput: Option<u32>,

    /// graph or flat
    #[arg(short = 'm', long)]
    pub mode: Option<LoadMode>,

    /// Number of concurrent batches in flat mode
    #[arg(short = 'b', long = "batches")]
    pub number_of_batches: Option<usize>,

    /// Import only the first N documents in flat mode
    #[arg(short = 'n', long = "limit")]
    pub number_of_documents_to_import: Option<usize>,

    /// absorb_into_last or drop
    #[arg(long = "remainder")]
    pub remainder_policy: Option<RemainderPolicy>,

    /// Directory for BadVertices.txt, BadEdges.txt and BadDocuments.txt
    #[arg(long)]
    pub quarantine_dir: Option<PathBuf>,

    /// Drop the database before importing
    #[arg(long)]
    pub cleanup_on_start: bool,

    /// Drop the database after importing
    #[arg(long)]
    pub cleanup_on_finish: bool,

    /// Exit without waiting for a key press
    #[arg(long)]
    pub no_pause: bool,
}

impl Cli {
    /// Flags win over file and environment settings.
    pub fn apply(&self, config: &mut LoaderConfig) {
        if let Some(folder) = &self.input_folder {
            config.input_folder.clone_from(folder);
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint.clone_from(endpoint);
        }
        if let Some(name) = &self.database_name {
            config.database_name.clone_from(name);
        }
        if let Some(name) = &self.collection_name {
            config.collection_name.clone_from(name);
        }
        if let Some(throughput) = self.collection_throughput {
            config.collection_throughput = throughput;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(batches) = self.number_of_batches {
            config.number_of_batches = batches;
        }
        if let Some(limit) = self.number_of_documents_to_import {
            config.number_of_documents_to_import = Some(limit);
        }
        if let Some(policy) = self.remainder_policy {
            config.remainder_policy = policy;
        }
        if let Some(dir) = &self.quarantine_dir {
            config.quarantine_dir.clone_from(dir);
        }
        if self.cleanup_on_start {
            config.should_cleanup_on_start = true;
        }
        if self.cleanup_on_finish {
            config.should_cleanup_on_finish = true;
        }
    }
}
