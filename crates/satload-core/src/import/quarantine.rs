use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::metrics::RecordKind;

/// Appends rejected records to one text file per record shape, one compact
/// JSON record per line. Files are never truncated, so repeated runs keep
/// their history.
#[derive(Debug, Clone)]
pub struct QuarantineWriter {
    dir: PathBuf,
}

impl QuarantineWriter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: RecordKind) -> PathBuf {
        let name = match kind {
            RecordKind::Vertex => "BadVertices.txt",
            RecordKind::Edge => "BadEdges.txt",
            RecordKind::Document => "BadDocuments.txt",
        };
        self.dir.join(name)
    }

    /// Returns the number of records written. Nothing is created when
    /// `records` is empty.
    pub async fn write(&self, kind: RecordKind, records: &[Value]) -> std::io::Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(kind);

        let mut buf = String::new();
        for record in records {
            buf.push_str(&record.to_string());
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        tracing::warn!(
            "Quarantined {} bad {} in {}",
            records.len(),
            kind.plural(),
            path.display()
        );

        Ok(records.len())
    }
}
