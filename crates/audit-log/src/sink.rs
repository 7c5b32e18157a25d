use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

const CHANNEL_CAPACITY: usize = 1024;

/// Idle time after which buffered lines are flushed to disk.
const IDLE_FLUSH: Duration = Duration::from_millis(500);

/// Cloneable handle for submitting [`AuditEntry`] values.
///
/// A sink is either backed by a background writer task or disabled, in which
/// case [`log`](Self::log) is a no-op. Connection handlers hold a clone and
/// never learn which of the two they have.
#[derive(Clone, Debug)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    /// Open `path` and spawn the writer task.
    ///
    /// The task exits after the last clone of the sink is dropped, flushing
    /// once more on the way out. Awaiting the returned handle therefore waits
    /// for every submitted entry to reach the file.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let writer = AuditWriter::open(path).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(drain(writer, rx));
        Ok((Self { tx: Some(tx) }, handle))
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an entry, waiting for channel capacity if necessary. Entries
    /// submitted after the writer task has died are dropped with a warning.
    pub async fn log(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(
                event_type = ?err.0.event_type,
                "audit writer is gone; entry dropped"
            );
        }
    }
}

async fn drain(mut writer: AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let mut pending = false;

    loop {
        match tokio::time::timeout(IDLE_FLUSH, rx.recv()).await {
            Ok(Some(entry)) => match writer.write(&entry).await {
                Ok(()) => pending = true,
                Err(err) => tracing::error!(%err, "failed to write audit entry"),
            },
            Ok(None) => break,
            Err(_idle) if pending => {
                if let Err(err) = writer.flush().await {
                    tracing::error!(%err, "audit flush failed");
                } else {
                    pending = false;
                }
            }
            Err(_idle) => {}
        }
    }

    if pending {
        if let Err(err) = writer.flush().await {
            tracing::error!(%err, "final audit flush failed");
        }
    }
    tracing::debug!(lines = writer.lines_written(), "audit writer stopped");
}
