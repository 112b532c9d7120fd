use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
};

use crate::process_support::{log_file_limits, log_max_lines};

/// Bounded ring of log lines addressed by sequence number.
///
/// Sequence numbers start at 1 and are contiguous, so the number of the
/// oldest retained line is enough to index into the ring.
#[derive(Debug)]
pub struct LogBuffer {
    oldest_seq: u64,
    max_lines: usize,
    lines: VecDeque<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(log_max_lines())
    }
}

impl LogBuffer {
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            oldest_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
            self.oldest_seq += 1;
        }
        self.lines.push_back(line);
    }

    /// Up to `limit` lines numbered above `cursor`, and the cursor to poll with next.
    ///
    /// Cursor 0 asks for the newest `limit` lines instead.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if self.lines.is_empty() {
            return (Vec::new(), cursor);
        }
        let start = if cursor == 0 {
            self.lines.len().saturating_sub(limit)
        } else {
            match usize::try_from(cursor.saturating_add(1).saturating_sub(self.oldest_seq)) {
                Ok(i) if i < self.lines.len() => i,
                _ => return (Vec::new(), cursor),
            }
        };
        let out: Vec<String> = self.lines.iter().skip(start).take(limit).cloned().collect();
        let next = self.oldest_seq + (start + out.len()) as u64 - 1;
        (out, next)
    }
}

/// Append-only log of operation status lines and client output.
///
/// Every line is stamped on the way in, kept in a bounded ring buffer for the
/// dashboard, and mirrored to `console.log` when a file is attached.
#[derive(Clone, Debug)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::in_memory(LogBuffer::default())
    }
}

impl LogSink {
    pub fn in_memory(buffer: LogBuffer) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(buffer)),
            file_tx: None,
        }
    }

    /// Must be called from within a tokio runtime; the file writer runs as a task.
    pub async fn with_file(path: PathBuf) -> std::io::Result<Self> {
        let (max_bytes, max_files) = log_file_limits();
        let mut writer = FileLogWriter::open(path, max_bytes, max_files).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(err) = writer.write_line(&line).await {
                    tracing::warn!(%err, path = %writer.path.display(), "console log write failed");
                }
            }
        });

        Ok(Self {
            buffer: Arc::new(Mutex::new(LogBuffer::default())),
            file_tx: Some(tx),
        })
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = format!(
            "{} {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            line.into()
        );
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    pub async fn tail(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.buffer.lock().await.tail_after(cursor, limit)
    }
}

/// Appends to `console.log`, shifting it to `console.log.1` … `.N` past `max_bytes`.
struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = open_append(&path).await?;
        let bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        // Oldest generation first so nothing is overwritten before it moves.
        for n in (1..=self.max_files).rev() {
            let from = if n == 1 {
                self.path.clone()
            } else {
                self.generation(n - 1)
            };
            match tokio::fs::rename(&from, self.generation(n)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        self.file = open_append(&self.path).await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let record = format!("{}\n", line.trim_end_matches('\n'));
        let len = record.len() as u64;
        if self.max_bytes > 0 && self.bytes > 0 && self.bytes + len > self.max_bytes {
            if let Err(err) = self.rotate().await {
                tracing::warn!(%err, path = %self.path.display(), "console log rotation failed");
            }
        }
        self.file.write_all(record.as_bytes()).await?;
        self.file.flush().await?;
        self.bytes += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_from_zero_returns_most_recent() {
        let mut buf = LogBuffer::with_capacity(10);
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, next) = buf.tail_after(0, 2);
        assert_eq!(lines, vec!["line 4", "line 5"]);
        assert_eq!(next, 5);
    }

    #[test]
    fn tail_after_cursor_is_incremental() {
        let mut buf = LogBuffer::with_capacity(10);
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, next) = buf.tail_after(2, 2);
        assert_eq!(lines, vec!["line 3", "line 4"]);
        assert_eq!(next, 4);

        let (lines, next) = buf.tail_after(next, 100);
        assert_eq!(lines, vec!["line 5"]);
        assert_eq!(next, 5);

        let (lines, next) = buf.tail_after(next, 100);
        assert!(lines.is_empty());
        assert_eq!(next, 5);
    }

    #[test]
    fn buffer_drops_oldest_beyond_capacity() {
        let mut buf = LogBuffer::with_capacity(3);
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, _) = buf.tail_after(0, 100);
        assert_eq!(lines, vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn stale_cursor_resumes_at_oldest_retained_line() {
        let mut buf = LogBuffer::with_capacity(3);
        for i in 1..=6 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, next) = buf.tail_after(1, 2);
        assert_eq!(lines, vec!["line 4", "line 5"]);
        assert_eq!(next, 5);

        // A cursor from a previous process that is ahead of this buffer yields nothing.
        let (lines, next) = buf.tail_after(40, 10);
        assert!(lines.is_empty());
        assert_eq!(next, 40);

        let (lines, next) = LogBuffer::with_capacity(3).tail_after(0, 10);
        assert!(lines.is_empty());
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn sink_stamps_lines() {
        let sink = LogSink::in_memory(LogBuffer::with_capacity(10));
        sink.emit("[botpanel] hello").await;
        let (lines, _) = sink.tail(0, 10).await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" [botpanel] hello"));
        assert!(lines[0].starts_with("20"));
    }

    #[tokio::test]
    async fn file_writer_rotates_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let mut w = FileLogWriter::open(path.clone(), 16, 2).await.unwrap();
        w.write_line("0123456789").await.unwrap();
        w.write_line("abcdefghij").await.unwrap();

        let current = tokio::fs::read_to_string(&path).await.unwrap();
        let rotated = tokio::fs::read_to_string(format!("{}.1", path.display()))
            .await
            .unwrap();
        assert_eq!(current, "abcdefghij\n");
        assert_eq!(rotated, "0123456789\n");
    }
}
