use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

pub use crate::config::TranscriptFormat;
use crate::error::ConfabResult;
use crate::models::{Message, ParticipantKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub origin: ParticipantKind,
}

impl From<&Message> for TranscriptEntry {
    fn from(message: &Message) -> Self {
        Self {
            timestamp: message.sent_at,
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            body: message.body.clone(),
            origin: message.origin,
        }
    }
}

impl TranscriptEntry {
    fn format(&self, format: TranscriptFormat) -> String {
        match format {
            TranscriptFormat::Json => {
                format!("{}\n", serde_json::to_string(self).unwrap_or_default())
            }
            TranscriptFormat::Plain => format!(
                "[{}] {} ({}, {}): {}\n",
                self.timestamp.format("%Y-%m-%d %H:%M:%S"),
                self.sender_name,
                self.sender_id,
                self.origin,
                self.body
            ),
        }
    }
}

/// Receives every routed message. Implementations must not block and
/// must swallow their own failures.
pub trait TranscriptSink: Send + Sync {
    fn append(&self, entry: TranscriptEntry);
}

pub type DynTranscriptSink = Arc<dyn TranscriptSink>;

pub struct NullTranscriptSink;

impl TranscriptSink for NullTranscriptSink {
    fn append(&self, _entry: TranscriptEntry) {}
}

/// Echoes `name > message` to stdout, the hub's console mode.
pub struct ConsoleTranscriptSink;

impl TranscriptSink for ConsoleTranscriptSink {
    fn append(&self, entry: TranscriptEntry) {
        println!("{} > {}", entry.sender_name, entry.body);
    }
}

pub struct CompositeTranscriptSink {
    sinks: Vec<DynTranscriptSink>,
}

impl CompositeTranscriptSink {
    pub fn new(sinks: Vec<DynTranscriptSink>) -> Self {
        Self { sinks }
    }
}

impl TranscriptSink for CompositeTranscriptSink {
    fn append(&self, entry: TranscriptEntry) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.append(entry.clone());
            }
            last.append(entry);
        }
    }
}

enum WriterCommand {
    Append(TranscriptEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only transcript file.
///
/// A single writer task owns the file; `append` only enqueues.
#[derive(Clone)]
pub struct FileTranscriptSink {
    tx: mpsc::UnboundedSender<WriterCommand>,
    path: PathBuf,
}

impl FileTranscriptSink {
    pub async fn open(path: impl AsRef<Path>, format: TranscriptFormat) -> ConfabResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(file, rx, format, path.clone()));

        debug!(path = %path.display(), ?format, "Transcript file opened");
        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves once every entry queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl TranscriptSink for FileTranscriptSink {
    fn append(&self, entry: TranscriptEntry) {
        if self.tx.send(WriterCommand::Append(entry)).is_err() {
            warn!(path = %self.path.display(), "Transcript writer has stopped; entry dropped");
        }
    }
}

async fn run_writer(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    format: TranscriptFormat,
    path: PathBuf,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(entry) => {
                let line = entry.format(format);
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!(path = %path.display(), error = %e, "Failed to write transcript entry");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    error!(path = %path.display(), error = %e, "Failed to flush transcript");
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(path = %path.display(), "Transcript writer stopped");
}
