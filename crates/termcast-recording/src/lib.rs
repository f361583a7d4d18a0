//! The append-only recording file per §3 "Recording" and §4.A.
//!
//! Every session directory carries a `stream-out` file: a header line
//! followed by newline-delimited `[elapsed, kind, payload]` events. Only
//! one writer may be registered per session at a time; every append is
//! checked against that registration so a stray second writer (a bug, or
//! a crash-and-respawn race) gets `WriteRejected` instead of corrupting
//! the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use termcast_types::{EventKind, RecordingEvent, RecordingHeader};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

pub const STREAM_FILE: &str = "stream-out";
pub const NOTIFICATION_FILE: &str = "notification-stream";

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("no recording for session {0}")]
    NotFound(String),
    #[error("caller does not own the recording for session {0}")]
    WriteRejected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriterId(u64);

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// Owns the on-disk layout for every session's recording and notification
/// files, and tracks which [`RecordingHandle`] currently owns each
/// session's write access.
#[derive(Clone)]
pub struct RecordingStore {
    base_dir: PathBuf,
    owners: DashMap<String, WriterId>,
}

impl RecordingStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            owners: DashMap::new(),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    pub fn recording_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(STREAM_FILE)
    }

    pub fn notification_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(NOTIFICATION_FILE)
    }

    /// Creates the session directory and writes the header line. Returns a
    /// [`RecordingHandle`] that is the sole authority allowed to append
    /// further events (§4.A: "the Store fails with WriteRejected if the
    /// caller is not the Supervisor owning the session").
    pub async fn create_header(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
        env: HashMap<String, String>,
    ) -> Result<RecordingHandle, RecordingError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let header = RecordingHeader::new(rows, cols, env);
        let mut line = serde_json::to_vec(&header)?;
        line.push(b'\n');

        let path = self.recording_path(session_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        let writer_id = WriterId(NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed));
        self.owners.insert(session_id.to_string(), writer_id);

        Ok(RecordingHandle {
            store: self.clone(),
            session_id: session_id.to_string(),
            writer_id,
            file: Mutex::new(file),
            start: Instant::now(),
        })
    }

    fn check_owner(&self, session_id: &str, writer_id: WriterId) -> Result<(), RecordingError> {
        match self.owners.get(session_id) {
            Some(current) if *current == writer_id => Ok(()),
            _ => Err(RecordingError::WriteRejected(session_id.to_string())),
        }
    }

    fn release(&self, session_id: &str, writer_id: WriterId) {
        self.owners.remove_if(session_id, |_, v| *v == writer_id);
    }

    /// Reads just the header line, without holding the file open.
    pub async fn read_header(&self, session_id: &str) -> Result<RecordingHeader, RecordingError> {
        let path = self.recording_path(session_id);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| RecordingError::NotFound(session_id.to_string()))?;
        let mut lines = BufReader::new(file).lines();
        let first = lines
            .next_line()
            .await?
            .ok_or_else(|| RecordingError::NotFound(session_id.to_string()))?;
        Ok(serde_json::from_str(&first)?)
    }

    /// Opens the recording for reading, returning the header and a file
    /// handle positioned just after the header line (§4.A
    /// `openForRead`). Stateless: does not block or interact with
    /// concurrent appends.
    pub async fn open_for_read(
        &self,
        session_id: &str,
    ) -> Result<(RecordingHeader, tokio::fs::File), RecordingError> {
        let path = self.recording_path(session_id);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| RecordingError::NotFound(session_id.to_string()))?;

        let mut reader = BufReader::new(&mut file);
        let mut first = String::new();
        let n = reader.read_line(&mut first).await?;
        if n == 0 {
            return Err(RecordingError::NotFound(session_id.to_string()));
        }
        let header: RecordingHeader = serde_json::from_str(first.trim_end())?;

        use std::io::SeekFrom;
        tokio::io::AsyncSeekExt::seek(&mut file, SeekFrom::Start(n as u64)).await?;
        Ok((header, file))
    }

    pub async fn stat_size(&self, session_id: &str) -> Result<u64, RecordingError> {
        let meta = tokio::fs::metadata(self.recording_path(session_id))
            .await
            .map_err(|_| RecordingError::NotFound(session_id.to_string()))?;
        Ok(meta.len())
    }

    /// Opens a session's `notification-stream` sidecar for tailing
    /// (§3 supplement). Unlike the recording proper, this file has no
    /// header line — it is a plain newline-delimited JSON log.
    pub async fn open_notifications(
        &self,
        session_id: &str,
    ) -> Result<tokio::fs::File, RecordingError> {
        let path = self.notification_path(session_id);
        tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(RecordingError::Io)
    }

    pub async fn append_notification(
        &self,
        session_id: &str,
        notification: &serde_json::Value,
    ) -> Result<(), RecordingError> {
        let path = self.notification_path(session_id);
        let mut line = serde_json::to_vec(notification)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// The sole writer capability for one session's recording. Obtained from
/// [`RecordingStore::create_header`]; dropped (or explicitly [`close`][Self::close]d) when the
/// owning PTY Supervisor tears the session down.
pub struct RecordingHandle {
    store: RecordingStore,
    session_id: String,
    writer_id: WriterId,
    file: Mutex<tokio::fs::File>,
    start: Instant,
}

impl RecordingHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    async fn append(&self, event: RecordingEvent) -> Result<(), RecordingError> {
        self.store.check_owner(&self.session_id, self.writer_id)?;
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn append_output(&self, bytes: &[u8]) -> Result<(), RecordingError> {
        self.append(RecordingEvent::output(self.elapsed_seconds(), bytes))
            .await
    }

    pub async fn append_input(&self, bytes: &[u8]) -> Result<(), RecordingError> {
        self.append(RecordingEvent::input_echo(self.elapsed_seconds(), bytes))
            .await
    }

    pub async fn append_resize(&self, cols: u16, rows: u16) -> Result<(), RecordingError> {
        self.append(RecordingEvent::resize(self.elapsed_seconds(), cols, rows))
            .await
    }

    /// Releases this handle's write ownership. Idempotent.
    pub fn close(&self) {
        self.store.release(&self.session_id, self.writer_id);
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// True if `kind == Output` and the payload contains a full-screen-clear
/// escape sequence (ESC `[2J`, with or without a trailing ESC `[H`),
/// used by the Stream Watcher's backfill scan (§4.D step 2).
pub fn contains_clear_sequence(event: &RecordingEvent) -> bool {
    event.kind == EventKind::Output && event.payload.contains("\u{1b}[2J")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_then_events_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let handle = store
            .create_header("s1", 24, 80, HashMap::new())
            .await
            .unwrap();
        handle.append_output(b"hello\n").await.unwrap();
        handle.append_resize(100, 40).await.unwrap();

        let (header, mut file) = store.open_for_read("s1").await.unwrap();
        assert_eq!(header.rows, 24);
        assert_eq!(header.cols, 80);

        let mut contents = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut file, &mut contents)
            .await
            .unwrap();
        let lines: Vec<RecordingEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].payload, "hello\n");
        assert_eq!(lines[1].parse_resize(), Some((100, 40)));
    }

    #[tokio::test]
    async fn second_writer_is_rejected_after_ownership_moves() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let first = store
            .create_header("s1", 24, 80, HashMap::new())
            .await
            .unwrap();
        // Re-creating the header (as if a second Supervisor attached)
        // reassigns ownership; the first handle's writes must now fail.
        let _second = store
            .create_header("s1", 24, 80, HashMap::new())
            .await
            .unwrap();
        let err = first.append_output(b"late").await.unwrap_err();
        assert!(matches!(err, RecordingError::WriteRejected(_)));
    }

    #[test]
    fn detects_clear_sequence() {
        let e = RecordingEvent::output(0.0, b"\x1b[2J\x1b[Hhi");
        assert!(contains_clear_sequence(&e));
        let e2 = RecordingEvent::output(0.0, b"hi");
        assert!(!contains_clear_sequence(&e2));
    }
}
