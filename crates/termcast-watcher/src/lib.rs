//! Stream Watcher (§4.D): delivers a truncated backfill followed by a
//! live tail of a session's recording to any number of concurrent
//! subscribers, sharing one file-watch per session.

use std::io::SeekFrom;
use std::sync::Arc;

use dashmap::DashMap;
use termcast_recording::{contains_clear_sequence, RecordingError, RecordingStore};
use termcast_types::{RecordingEvent, RecordingHeader};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error("failed to watch recording file: {0}")]
    Notify(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    SlowConsumer,
    SessionClosed,
}

#[derive(Debug, Clone)]
pub enum WatchMessage {
    Header(RecordingHeader),
    /// A synthesized clear-and-home, emitted only when backfill truncated
    /// history at a prior clear sequence (§4.D step 3).
    SyntheticClear,
    Event(RecordingEvent),
    Disconnected(DisconnectReason),
}

pub struct Subscription {
    pub rx: mpsc::Receiver<WatchMessage>,
}

struct SessionWatch {
    growth_tx: broadcast::Sender<()>,
    _watcher: notify::RecommendedWatcher,
}

#[derive(Clone)]
pub struct StreamWatcher {
    recordings: RecordingStore,
    watches: Arc<DashMap<String, Arc<SessionWatch>>>,
}

impl StreamWatcher {
    pub fn new(recordings: RecordingStore) -> Self {
        Self {
            recordings,
            watches: Arc::new(DashMap::new()),
        }
    }

    /// Subscribes to `session_id`'s recording, queuing up to
    /// `queue_capacity` messages before disconnecting the subscriber as
    /// `SlowConsumer` (§4.D "Subscriber queueing").
    pub async fn subscribe(
        &self,
        session_id: &str,
        queue_capacity: usize,
    ) -> Result<Subscription, WatcherError> {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let session_id = session_id.to_string();
        let recordings = self.recordings.clone();
        let watch = self.get_or_create_watch(&session_id)?;

        tokio::spawn(async move {
            if let Err(e) = run_subscriber(recordings, &session_id, tx.clone(), watch).await {
                debug!(session = %session_id, error = %e, "subscriber stream ended");
                let _ = tx
                    .try_send(WatchMessage::Disconnected(DisconnectReason::SessionClosed));
            }
        });

        Ok(Subscription { rx })
    }

    fn get_or_create_watch(&self, session_id: &str) -> Result<Arc<SessionWatch>, WatcherError> {
        if let Some(existing) = self.watches.get(session_id) {
            return Ok(existing.clone());
        }

        let path = self.recordings.recording_path(session_id);
        let (growth_tx, _rx) = broadcast::channel(16);
        let sender = growth_tx.clone();

        use notify::Watcher;
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = sender.send(());
                }
            }
        })
        .map_err(|e| WatcherError::Notify(e.to_string()))?;

        watcher
            .watch(&path, notify::RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Notify(e.to_string()))?;

        let shared = Arc::new(SessionWatch {
            growth_tx,
            _watcher: watcher,
        });
        self.watches.insert(session_id.to_string(), shared.clone());
        Ok(shared)
    }

    /// Drops the shared file-watch for a session, e.g. once the
    /// Registry has deleted its directory.
    pub fn forget(&self, session_id: &str) {
        self.watches.remove(session_id);
    }
}

async fn run_subscriber(
    recordings: RecordingStore,
    session_id: &str,
    tx: mpsc::Sender<WatchMessage>,
    watch: Arc<SessionWatch>,
) -> Result<(), WatcherError> {
    let header = recordings.read_header(session_id).await?;
    if tx.try_send(WatchMessage::Header(header)).is_err() {
        let _ = tx.try_send(WatchMessage::Disconnected(DisconnectReason::SlowConsumer));
        return Ok(());
    }

    let (body_start, found_clear) = scan_last_clear(&recordings, session_id).await?;
    if found_clear && tx.try_send(WatchMessage::SyntheticClear).is_err() {
        let _ = tx.try_send(WatchMessage::Disconnected(DisconnectReason::SlowConsumer));
        return Ok(());
    }

    let path = recordings.recording_path(session_id);
    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(SeekFrom::Start(body_start)).await?;
    let mut cursor = body_start;
    let mut growth_rx = watch.growth_tx.subscribe();

    loop {
        let events = read_new_events(&mut file, &mut cursor).await?;
        for event in events {
            if tx.try_send(WatchMessage::Event(event)).is_err() {
                let _ =
                    tx.try_send(WatchMessage::Disconnected(DisconnectReason::SlowConsumer));
                return Ok(());
            }
        }

        if tx.is_closed() {
            return Ok(());
        }

        match growth_rx.recv().await {
            Ok(()) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Implements the backfill algorithm's steps 2-4: scans the whole
/// recording once for the byte offset of the last event containing a
/// clear sequence. Bounds the amount of history later streamed to a
/// subscriber, not the cost of the scan itself — §8 scenario 2 accepts
/// an O(file size) scan in exchange for a backfill that collapses to a
/// few MB regardless of how large the file has grown.
async fn scan_last_clear(
    recordings: &RecordingStore,
    session_id: &str,
) -> Result<(u64, bool), WatcherError> {
    let (_header, mut file) = recordings.open_for_read(session_id).await?;
    let header_end = file.stream_position().await?;

    let mut offset = header_end;
    let mut last_clear_offset: Option<u64> = None;
    let mut reader = tokio::io::BufReader::new(&mut file);
    let mut line = String::new();
    loop {
        line.clear();
        let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await?;
        if n == 0 {
            break;
        }
        if let Ok(event) = serde_json::from_str::<RecordingEvent>(line.trim_end()) {
            if contains_clear_sequence(&event) {
                last_clear_offset = Some(offset);
            }
        }
        offset += n as u64;
    }

    match last_clear_offset {
        Some(o) => Ok((o, true)),
        None => Ok((header_end, false)),
    }
}

async fn read_new_events(
    file: &mut tokio::fs::File,
    cursor: &mut u64,
) -> Result<Vec<RecordingEvent>, WatcherError> {
    let meta = file.metadata().await.map_err(RecordingError::Io)?;
    if meta.len() <= *cursor {
        return Ok(Vec::new());
    }

    let mut buf = Vec::with_capacity((meta.len() - *cursor) as usize);
    file.seek(SeekFrom::Start(*cursor))
        .await
        .map_err(RecordingError::Io)?;
    file.read_to_end(&mut buf).await.map_err(RecordingError::Io)?;

    let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok(Vec::new());
    };

    let complete = &buf[..=last_newline];
    *cursor += complete.len() as u64;

    let mut events = Vec::new();
    for line in complete.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<RecordingEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(error = %e, "skipping malformed recording line"),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn backfill_with_no_clear_covers_entire_recording() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let handle = store
            .create_header("s1", 24, 80, HashMap::new())
            .await
            .unwrap();
        handle.append_output(b"one\n").await.unwrap();
        handle.append_output(b"two\n").await.unwrap();
        drop(handle);

        let watcher = StreamWatcher::new(store);
        let mut sub = watcher.subscribe("s1", 64).await.unwrap();

        let mut messages = Vec::new();
        for _ in 0..3 {
            if let Ok(Some(msg)) =
                tokio::time::timeout(std::time::Duration::from_millis(500), sub.rx.recv()).await
            {
                messages.push(msg);
            }
        }

        assert!(matches!(messages[0], WatchMessage::Header(_)));
        assert!(messages
            .iter()
            .any(|m| matches!(m, WatchMessage::Event(e) if e.payload == "one\n")));
        assert!(!messages
            .iter()
            .any(|m| matches!(m, WatchMessage::SyntheticClear)));
    }

    #[tokio::test]
    async fn backfill_truncates_at_last_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let handle = store
            .create_header("s1", 24, 80, HashMap::new())
            .await
            .unwrap();
        handle.append_output(b"before\n").await.unwrap();
        handle.append_output(b"\x1b[2J\x1b[H").await.unwrap();
        handle.append_output(b"after\n").await.unwrap();
        drop(handle);

        let watcher = StreamWatcher::new(store);
        let mut sub = watcher.subscribe("s1", 64).await.unwrap();

        let mut saw_before = false;
        let mut saw_synthetic = false;
        let mut saw_after = false;
        for _ in 0..5 {
            match tokio::time::timeout(std::time::Duration::from_millis(500), sub.rx.recv()).await
            {
                Ok(Some(WatchMessage::Event(e))) if e.payload == "before\n" => saw_before = true,
                Ok(Some(WatchMessage::Event(e))) if e.payload == "after\n" => saw_after = true,
                Ok(Some(WatchMessage::SyntheticClear)) => saw_synthetic = true,
                _ => {}
            }
        }
        assert!(!saw_before, "pre-clear content must not be replayed");
        assert!(saw_synthetic);
        assert!(saw_after);
    }
}
