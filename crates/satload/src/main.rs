mod cli;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use satload_core::{
    CancellationToken, FolderSource, LoadPipeline, LoaderConfig, RetryOptions, RunReport,
    SqliteStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "satload=info,satload_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let code = match run(&cli).await {
        Ok(report) => {
            println!("{}", report.summary);
            for failure in &report.failures {
                eprintln!("Failed: {failure}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    };

    if !cli.no_pause {
        wait_for_key();
    }

    code
}

async fn run(cli: &Cli) -> Result<RunReport> {
    let config = load_config(cli)?;
    config.validate()?;

    tracing::info!(
        "Loading {} in {} mode into {}/{}",
        config.input_folder.display(),
        config.mode,
        config.database_name,
        config.collection_name
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping import");
                cancel.cancel();
            }
        }
    });

    let admin = SqliteStore::open(&config.endpoint, RetryOptions::provisioning())
        .await
        .with_context(|| format!("Failed to open store at {}", config.endpoint))?;
    let importer = admin.with_retry_options(RetryOptions::bulk_import());
    let source = FolderSource::new(config.input_folder.clone());

    let pipeline = LoadPipeline::new(
        config,
        Box::new(source),
        Arc::new(admin),
        Arc::new(importer),
    )
    .with_cancellation(cancel);

    Ok(pipeline.run().await?)
}

fn load_config(cli: &Cli) -> Result<LoaderConfig> {
    let mut config = match &cli.config {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::default(),
    };
    config.apply_env()?;
    cli.apply(&mut config);
    Ok(config)
}

fn wait_for_key() {
    println!("Press any key to exit...");
    let _ = std::io::stdout().flush();
    let _ = std::io::stdin().read_line(&mut String::new());
}
