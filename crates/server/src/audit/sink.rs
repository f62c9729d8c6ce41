//! Output sinks for audit records.
//!
//! A sink's `write` must return promptly: it runs inside lifecycle dispatch.
//! Sinks backed by slow I/O queue records and write them from a background
//! task instead.

use std::path::Path;

use common::{AuditRecord, SinkError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::error;

/// Destination for structured audit records.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    /// Hand one record to the sink without blocking.
    fn write(&self, record: &AuditRecord) -> Result<(), SinkError>;
}

/// Newline-delimited JSON written by a background task.
///
/// `write` only enqueues; when the bounded queue is full the record is
/// refused with [`SinkError::Backpressure`] rather than waiting.
#[derive(Debug, Clone)]
pub struct WriterSink {
    tx: mpsc::Sender<AuditRecord>,
    capacity: usize,
}

impl WriterSink {
    /// Spawn the writer task draining into `writer`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<W>(writer: W, capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(drain(rx, writer));
        (Self { tx, capacity }, handle)
    }

    /// Sink writing to the process's standard output.
    pub fn stdout(capacity: usize) -> (Self, JoinHandle<()>) {
        Self::spawn(tokio::io::stdout(), capacity)
    }

    /// Sink appending to the file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened.
    pub async fn file(path: &Path, capacity: usize) -> Result<(Self, JoinHandle<()>), SinkError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::spawn(file, capacity))
    }

    /// Append to `path` when given, otherwise write to standard output.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened.
    pub async fn open(
        path: Option<&Path>,
        capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), SinkError> {
        match path {
            Some(path) => Self::file(path, capacity).await,
            None => Ok(Self::stdout(capacity)),
        }
    }
}

impl AuditSink for WriterSink {
    fn write(&self, record: &AuditRecord) -> Result<(), SinkError> {
        self.tx.try_send(record.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Backpressure {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

async fn drain<W>(mut rx: mpsc::Receiver<AuditRecord>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(record) = rx.recv().await {
        if let Err(e) = write_line(&mut writer, &record).await {
            error!(
                target: "diagnostic",
                error = %e,
                request_id = %record.request_id,
                "audit write failed"
            );
        }
    }
    let _ = writer.flush().await;
}

async fn write_line<W>(writer: &mut W, record: &AuditRecord) -> Result<(), SinkError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn record(id: &str) -> AuditRecord {
        AuditRecord {
            event: "after".into(),
            request_id: id.into(),
            method: "GET".into(),
            path: "/".into(),
            status_code: 200,
            duration_ms: 1,
            protocol: "HTTP/2.0".into(),
            remote_address: None,
            time: 0,
            request_body: None,
            response_body: None,
        }
    }

    #[tokio::test]
    async fn writer_sink_emits_ndjson() {
        let (writer, reader) = tokio::io::duplex(4096);
        let (sink, _task) = WriterSink::spawn(writer, 8);
        sink.write(&record("a")).unwrap();
        sink.write(&record("b")).unwrap();

        let mut lines = BufReader::new(reader).lines();
        let first: AuditRecord =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: AuditRecord =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.request_id, "a");
        assert_eq!(second.request_id, "b");
    }

    #[tokio::test]
    async fn stalled_writer_yields_backpressure() {
        // Nobody reads the other end, so the writer task blocks on the first record.
        let (writer, _reader) = tokio::io::duplex(1);
        let (sink, _task) = WriterSink::spawn(writer, 1);
        let results: Vec<_> = (0..16).map(|i| sink.write(&record(&i.to_string()))).collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SinkError::Backpressure { capacity: 1 }))));
    }

    #[tokio::test]
    async fn closed_writer_is_reported() {
        let (writer, _reader) = tokio::io::duplex(64);
        let (sink, task) = WriterSink::spawn(writer, 1);
        task.abort();
        let _ = task.await;
        assert!(matches!(sink.write(&record("x")), Err(SinkError::Closed)));
    }

    /// Accepts nothing and never wakes its task.
    struct Stuck;

    impl AsyncWrite for Stuck {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Pending
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn write_returns_promptly_while_output_is_stuck() {
        let (sink, _task) = WriterSink::spawn(Stuck, 4);
        let start = std::time::Instant::now();
        let mut refused = 0;
        for i in 0..1000 {
            match sink.write(&record(&i.to_string())) {
                Ok(()) => {}
                Err(SinkError::Backpressure { capacity: 4 }) => refused += 1,
                Err(e) => panic!("unexpected sink error: {e}"),
            }
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
        assert!(refused >= 1000 - 5);
    }

    #[tokio::test]
    async fn open_without_path_uses_stdout() {
        let (sink, _task) = WriterSink::open(None, 8).await.unwrap();
        assert!(sink.write(&record("stdout")).is_ok());
    }

    #[tokio::test]
    async fn open_with_path_appends_to_file() {
        let path = std::env::temp_dir().join(format!("audit-{}.ndjson", uuid::Uuid::new_v4()));
        let (sink, task) = WriterSink::open(Some(&path), 8).await.unwrap();
        sink.write(&record("file")).unwrap();
        drop(sink);
        task.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
        let written: AuditRecord = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(written.request_id, "file");
    }
}
