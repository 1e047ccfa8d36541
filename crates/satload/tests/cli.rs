use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn satload(dir: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("satload").into();
    cmd.current_dir(dir);
    cmd.env("NO_COLOR", "1");
    cmd.env_remove("SATLOAD_CONFIG");
    cmd
}

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

/// A tempdir holding an `xml/` folder with the given files.
fn workspace(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("xml");
    fs::create_dir(&input).unwrap();
    for (name, content) in files {
        fs::write(input.join(name), content).unwrap();
    }
    (tmp, input)
}

fn run_args(input: &Path) -> Vec<String> {
    vec![
        "--input".into(),
        input.display().to_string(),
        "--endpoint".into(),
        "store.db".into(),
        "--throughput".into(),
        "1000000".into(),
        "--no-pause".into(),
    ]
}

// --- Binary startup ---

#[test]
fn binary_runs() {
    let mut cmd: Command = cargo_bin_cmd!("satload").into();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("satload"));
}

#[test]
fn help_lists_options() {
    let mut cmd: Command = cargo_bin_cmd!("satload").into();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--no-pause"))
        .stdout(predicate::str::contains("--batches"));
}

// --- Graph mode ---

#[test]
fn graph_run_prints_summary() {
    let doc = invoice("AAA010101AAA", "BBB010101BBB", "u-1");
    let (tmp, input) = workspace(&[("a.xml", &doc)]);

    satload(tmp.path())
        .args(run_args(&input))
        .assert()
        .success()
        .stdout(predicate::str::contains("Summary for run started"))
        .stdout(predicate::str::contains(
            "Inserted 5 records (3 vertices, 2 edges)",
        ))
        .stdout(predicate::str::contains("Press any key").not());

    assert!(tmp.path().join("store.db").exists());
}

#[test]
fn malformed_documents_are_skipped() {
    let doc = invoice("AAA010101AAA", "BBB010101BBB", "u-1");
    let (tmp, input) = workspace(&[("a.xml", &doc), ("b.xml", "not xml at all <")]);

    satload(tmp.path())
        .args(run_args(&input))
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Skipped malformed source documents: 1",
        ));
}

// --- Flat mode ---

#[test]
fn flat_run_uses_batches() {
    let docs: Vec<String> = (0..5)
        .map(|i| invoice("AAA010101AAA", "BBB010101BBB", &format!("u-{i}")))
        .collect();
    let names: Vec<String> = (0..5).map(|i| format!("{i}.xml")).collect();
    let files: Vec<(&str, &str)> = names
        .iter()
        .map(String::as_str)
        .zip(docs.iter().map(String::as_str))
        .collect();
    let (tmp, input) = workspace(&files);

    satload(tmp.path())
        .args(run_args(&input))
        .args(["--mode", "flat", "--batches", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Inserted 5 records (5 documents)"));
}

// --- Configuration ---

#[test]
fn config_file_is_read() {
    let doc = invoice("AAA010101AAA", "BBB010101BBB", "u-1");
    let (tmp, input) = workspace(&[("a.xml", &doc)]);
    let config = tmp.path().join("satload.json");
    fs::write(
        &config,
        format!(
            r#"{{"inputFolder": {:?}, "endpoint": "from-config.db", "collectionThroughput": 1000000, "mode": "flat"}}"#,
            input.display().to_string()
        ),
    )
    .unwrap();

    satload(tmp.path())
        .args(["--config", "satload.json", "--no-pause"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(1 documents)"));

    assert!(tmp.path().join("from-config.db").exists());
}

#[test]
fn env_overrides_are_validated() {
    let (tmp, input) = workspace(&[]);

    satload(tmp.path())
        .args(run_args(&input))
        .env("SATLOAD_NUMBER_OF_BATCHES", "0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("numberOfBatches"));
}

// --- Setup errors ---

#[test]
fn missing_input_folder_fails_after_prompt() {
    let tmp = TempDir::new().unwrap();

    satload(tmp.path())
        .args(["--input", "nowhere", "--endpoint", "store.db"])
        .write_stdin("\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"))
        .stdout(predicate::str::contains("Press any key to exit..."));
}

#[test]
fn unset_input_folder_is_rejected() {
    let tmp = TempDir::new().unwrap();

    satload(tmp.path())
        .arg("--no-pause")
        .assert()
        .failure()
        .stderr(predicate::str::contains("inputFolder"));
}
