//! Terminal Renderer (§4.E): a headless `vt100` VT100 emulator per
//! session, fed by the same bytes the PTY Supervisor hands the
//! Recording Store, broadcasting binary cell-buffer snapshots to any
//! number of subscribers.

mod wire;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use termcast_pty::PtySupervisor;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub use wire::encode_snapshot;

/// Snapshots are flushed at most this often while output is steady, and
/// immediately once the stream has been idle this long (§4.E "emits on
/// idle >= N ms or >= M bytes consumed since the last snapshot").
const IDLE_FLUSH: Duration = Duration::from_millis(16);
const BYTE_FLUSH_THRESHOLD: usize = 8192;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 8;
const SCROLLBACK_LINES: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    #[error(transparent)]
    Pty(#[from] termcast_pty::PtyError),
    #[error("renderer for session {0} is not attached")]
    NotAttached(String),
}

struct RenderedSession {
    parser: Mutex<vt100::Parser>,
    snapshot_tx: broadcast::Sender<Bytes>,
    feed_handle: JoinHandle<()>,
}

/// Owns one [`vt100::Parser`] per session. Lives alongside the PTY
/// Supervisor and Recording Store, reached only through session ids.
#[derive(Clone)]
pub struct TerminalRenderer {
    pty: PtySupervisor,
    sessions: Arc<DashMap<String, Arc<RenderedSession>>>,
}

impl TerminalRenderer {
    pub fn new(pty: PtySupervisor) -> Self {
        Self {
            pty,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Starts folding `session_id`'s raw output into a virtual screen.
    /// Idempotent: re-attaching a session already attached is a no-op.
    pub fn attach(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), RendererError> {
        if self.sessions.contains_key(session_id) {
            return Ok(());
        }

        let raw_rx = self.pty.subscribe_raw_output(session_id)?;
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let parser = Mutex::new(vt100::Parser::new(rows, cols, SCROLLBACK_LINES));

        let id = session_id.to_string();
        let feed_handle = self.spawn_feed(id, raw_rx, snapshot_tx.clone());

        let session = Arc::new(RenderedSession {
            parser,
            snapshot_tx,
            feed_handle,
        });
        self.sessions.insert(session_id.to_string(), session);
        Ok(())
    }

    fn spawn_feed(
        &self,
        session_id: String,
        mut raw_rx: broadcast::Receiver<Bytes>,
        snapshot_tx: broadcast::Sender<Bytes>,
    ) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut pending = 0usize;
            loop {
                match tokio::time::timeout(IDLE_FLUSH, raw_rx.recv()).await {
                    Ok(Ok(chunk)) => {
                        let Some(session) = sessions.get(&session_id).map(|e| e.value().clone())
                        else {
                            break;
                        };
                        session.parser.lock().await.process(&chunk);
                        pending += chunk.len();
                        if pending >= BYTE_FLUSH_THRESHOLD {
                            flush(&session, &snapshot_tx).await;
                            pending = 0;
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                        debug!(session = %session_id, skipped = n, "renderer dropped lagging output");
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_elapsed) => {
                        if pending > 0 {
                            if let Some(session) =
                                sessions.get(&session_id).map(|e| e.value().clone())
                            {
                                flush(&session, &snapshot_tx).await;
                            }
                            pending = 0;
                        }
                    }
                }
            }
        })
    }

    /// Resizes the virtual screen and emits a snapshot unconditionally,
    /// regardless of the idle/byte flush thresholds (§4.E "unconditionally
    /// on resize").
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), RendererError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RendererError::NotAttached(session_id.to_string()))?;
        session.parser.lock().await.set_size(rows, cols);
        flush(&session, &session.snapshot_tx).await;
        Ok(())
    }

    /// Subscribes to binary snapshots for `session_id`, immediately
    /// sending the current screen so a new subscriber never waits for the
    /// next flush (§4.E "new subscribers receive the full current
    /// snapshot immediately").
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<(Bytes, broadcast::Receiver<Bytes>), RendererError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RendererError::NotAttached(session_id.to_string()))?;
        let snapshot = {
            let parser = session.parser.lock().await;
            wire::encode_snapshot(parser.screen())
        };
        Ok((snapshot, session.snapshot_tx.subscribe()))
    }

    pub fn detach(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.feed_handle.abort();
        }
    }
}

async fn flush(session: &RenderedSession, snapshot_tx: &broadcast::Sender<Bytes>) {
    let frame = {
        let parser = session.parser.lock().await;
        wire::encode_snapshot(parser.screen())
    };
    let _ = snapshot_tx.send(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use termcast_recording::RecordingStore;
    use tokio::time::Duration as StdDuration;

    fn spawn_descriptor() -> termcast_pty::SpawnDescriptor {
        termcast_pty::SpawnDescriptor {
            command: vec!["/bin/echo".into(), "hi".into()],
            working_dir: "/".into(),
            env: Default::default(),
            rows: 24,
            cols: 80,
        }
    }

    #[tokio::test]
    async fn subscribe_immediately_receives_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = RecordingStore::new(dir.path());
        let pty = PtySupervisor::new();
        let handle = Arc::new(
            recordings
                .create_header("r1", 24, 80, Default::default())
                .await
                .unwrap(),
        );
        pty.spawn("r1", spawn_descriptor(), handle).await.unwrap();

        let renderer = TerminalRenderer::new(pty);
        renderer.attach("r1", 24, 80).unwrap();

        // give the echo a moment to run and the feed task to process it
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let (snapshot, _rx) = renderer.subscribe("r1").await.unwrap();
        assert_eq!(&snapshot[0..4], b"VTCB");
    }

    #[tokio::test]
    async fn resize_flushes_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = RecordingStore::new(dir.path());
        let pty = PtySupervisor::new();
        let handle = Arc::new(
            recordings
                .create_header("r2", 24, 80, Default::default())
                .await
                .unwrap(),
        );
        pty.spawn("r2", spawn_descriptor(), handle).await.unwrap();

        let renderer = TerminalRenderer::new(pty);
        renderer.attach("r2", 24, 80).unwrap();
        let (_snap, mut rx) = renderer.subscribe("r2").await.unwrap();

        renderer.resize("r2", 30, 100).await.unwrap();
        let frame = tokio::time::timeout(StdDuration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let rows = u16::from_le_bytes([frame[6], frame[7]]);
        let cols = u16::from_le_bytes([frame[8], frame[9]]);
        assert_eq!((rows, cols), (30, 100));
    }
}
