use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::entry::AuditEntry;

#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create audit directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffered JSON-lines appender. One [`write`](Self::write) call is one line;
/// nothing is guaranteed on disk until [`flush`](Self::flush).
pub struct AuditWriter {
    out: BufWriter<tokio::fs::File>,
    lines_written: u64,
}

impl AuditWriter {
    /// Open `path` for appending, creating it and its parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditWriteError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| AuditWriteError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            out: BufWriter::new(file),
            lines_written: 0,
        })
    }

    pub async fn write(&mut self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.lines_written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.out.flush().await?;
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }
}
