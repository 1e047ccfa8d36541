use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Input folder not found: {0}")]
    NotFound(PathBuf),
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type SourceResult<T> = Result<T, SourceError>;

/// One unparsed input document.
///
/// A raw document has no identity beyond its position in the load order; the
/// origin path is kept only so failures can be reported against a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub index: usize,
    pub origin: Option<PathBuf>,
    pub content: String,
}

impl RawDocument {
    #[must_use]
    pub fn new(index: usize, content: impl Into<String>) -> Self {
        Self {
            index,
            origin: None,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: PathBuf) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Human-readable label used in log lines.
    pub fn describe(&self) -> String {
        self.origin.as_ref().map_or_else(
            || format!("document #{}", self.index),
            |p| p.display().to_string(),
        )
    }
}

#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load_raw(&self) -> SourceResult<Vec<RawDocument>>;
}

/// Reads every regular file in a directory as one document. File names carry
/// no meaning; files are visited in path order so runs are repeatable.
pub struct FolderSource {
    folder: PathBuf,
}

impl FolderSource {
    #[must_use]
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

#[async_trait::async_trait]
impl DocumentSource for FolderSource {
    async fn load_raw(&self) -> SourceResult<Vec<RawDocument>> {
        match tokio::fs::metadata(&self.folder).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(SourceError::NotFound(self.folder.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(self.folder.clone()));
            }
            Err(e) => return Err(io_err(&self.folder)(e)),
        }

        let mut entries = tokio::fs::read_dir(&self.folder)
            .await
            .map_err(io_err(&self.folder))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.folder))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err(&path))?;
            let regular = if file_type.is_symlink() {
                tokio::fs::metadata(&path)
                    .await
                    .is_ok_and(|meta| meta.is_file())
            } else {
                file_type.is_file()
            };
            if regular {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await.map_err(io_err(&path))?;
            match String::from_utf8(bytes) {
                Ok(content) => {
                    let index = documents.len();
                    documents.push(RawDocument::new(index, content).with_origin(path));
                }
                Err(e) => {
                    tracing::warn!("Skipping {}: not valid UTF-8 ({})", path.display(), e);
                }
            }
        }

        tracing::info!(
            "Loaded {} documents from {}",
            documents.len(),
            self.folder.display()
        );

        Ok(documents)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SourceError {
    let path = path.to_path_buf();
    move |source| SourceError::Io { path, source }
}
