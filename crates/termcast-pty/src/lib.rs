//! PTY Supervisor (§4.B): owns exactly one child process per session
//! behind a PTY master, drains its output into the Recording Store and a
//! broadcast channel the Terminal Renderer feeds from, and accepts
//! input/resize/signal/kill.

mod signal;

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use termcast_recording::RecordingHandle;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use signal::SignalKind;

/// Bound of the channel between the blocking PTY reader thread and the
/// async task that appends to the recording and broadcasts to
/// subscribers (§4.B "Output draining").
const DRAIN_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("session not found: {0}")]
    SessionGone(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("PTYs are not available on this platform")]
    PtyUnavailable,
    #[error("invalid size: rows={rows} cols={cols}")]
    InvalidSize { rows: i64, cols: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SpawnDescriptor {
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

struct SupervisedSession {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    output_tx: broadcast::Sender<Bytes>,
    exit_tx: watch::Sender<Option<i32>>,
    drain_handle: JoinHandle<()>,
    closed: AtomicBool,
}

/// Owns every live child process on this node. One [`SupervisedSession`]
/// per session id; the Registry (§4.C) and Recording Store are separate
/// components reached only through ids, per §9's cyclic-reference
/// guidance.
#[derive(Clone)]
pub struct PtySupervisor {
    sessions: Arc<DashMap<String, Arc<SupervisedSession>>>,
}

impl PtySupervisor {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Spawns `descriptor` under a fresh PTY and starts draining its
    /// output into `recording`. The recording handle is the sole writer
    /// capability for this session (termcast-recording::RecordingStore);
    /// the supervisor never constructs one itself.
    pub async fn spawn(
        &self,
        session_id: &str,
        descriptor: SpawnDescriptor,
        recording: Arc<RecordingHandle>,
    ) -> Result<(), PtyError> {
        if descriptor.command.is_empty() {
            return Err(PtyError::SpawnFailed("empty command".into()));
        }

        let id = session_id.to_string();
        let spawn_descriptor = descriptor.clone();
        let (master, child, reader) = tokio::task::spawn_blocking(move || {
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize {
                    rows: spawn_descriptor.rows,
                    cols: spawn_descriptor.cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

            let mut cmd = CommandBuilder::new(&spawn_descriptor.command[0]);
            cmd.args(&spawn_descriptor.command[1..]);
            cmd.cwd(&spawn_descriptor.working_dir);
            for (k, v) in &spawn_descriptor.env {
                cmd.env(k, v);
            }

            let child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
            drop(pair.slave);

            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;

            Ok::<_, PtyError>((pair.master, child, reader))
        })
        .await
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))??;

        let pid = child.process_id();
        let writer = master
            .take_writer()
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;

        let (output_tx, _) = broadcast::channel::<Bytes>(DRAIN_CHANNEL_CAPACITY);
        let (exit_tx, _exit_rx) = watch::channel(None);
        let (drain_tx, mut drain_rx) = mpsc::channel::<Bytes>(DRAIN_CHANNEL_CAPACITY);

        // Blocking reader thread: applies backpressure by blocking on a
        // bounded channel send, which in turn stalls the PTY master read
        // and, transitively, the child's own writes to its tty (§4.B:
        // "the child blocks on write, never the server").
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if drain_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "pty reader exiting");
                        break;
                    }
                }
            }
        });

        let recording_for_drain = recording.clone();
        let output_tx_for_drain = output_tx.clone();
        let drain_handle = tokio::spawn(async move {
            while let Some(chunk) = drain_rx.recv().await {
                if let Err(e) = recording_for_drain.append_output(&chunk).await {
                    warn!(error = %e, "failed to append output to recording, ending session");
                    break;
                }
                // Best-effort: a lagging or absent subscriber never blocks
                // drain progress (§5: "Pushing to a subscriber send queue:
                // non-blocking; overflow disconnects the subscriber").
                let _ = output_tx_for_drain.send(chunk);
            }
        });

        let session = Arc::new(SupervisedSession {
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            pid,
            output_tx,
            exit_tx,
            drain_handle,
            closed: AtomicBool::new(false),
        });

        self.sessions.insert(id.clone(), session.clone());
        self.spawn_exit_watcher(id, session);

        Ok(())
    }

    fn spawn_exit_watcher(&self, session_id: String, session: Arc<SupervisedSession>) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let code = tokio::task::spawn_blocking({
                let session = session.clone();
                move || {
                    let mut child = session.child.blocking_lock();
                    child.wait().ok().and_then(|status| status.exit_code().try_into().ok())
                }
            })
            .await
            .unwrap_or(None);

            session.closed.store(true, Ordering::SeqCst);
            let _ = session.exit_tx.send(Some(code.unwrap_or(-1)));
            sessions.remove(&session_id);
        });
    }

    pub async fn write(&self, session_id: &str, bytes: &[u8]) -> Result<(), PtyError> {
        let session = self.get(session_id)?;
        if session.closed.load(Ordering::SeqCst) {
            return Err(PtyError::SessionGone(session_id.to_string()));
        }
        let data = bytes.to_vec();
        let writer = session.clone();
        tokio::task::spawn_blocking(move || {
            let mut w = writer.writer.blocking_lock();
            w.write_all(&data)?;
            w.flush()
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))??;
        Ok(())
    }

    /// Resizes the PTY and appends a resize event to the recording
    /// (§4.B: "issues window size ioctl; appends a resize event").
    pub async fn resize(
        &self,
        session_id: &str,
        recording: &RecordingHandle,
        rows: u16,
        cols: u16,
    ) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::InvalidSize {
                rows: rows as i64,
                cols: cols as i64,
            });
        }
        let session = self.get(session_id)?;
        session
            .master
            .lock()
            .await
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;

        let _ = recording.append_resize(cols, rows).await;
        Ok(())
    }

    pub fn signal(&self, session_id: &str, kind: SignalKind) -> Result<(), PtyError> {
        let session = self.get(session_id)?;
        let pid = session
            .pid
            .ok_or_else(|| PtyError::SessionGone(session_id.to_string()))?;
        signal::deliver(pid, kind)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Returns the exit code
    /// once the child has actually exited.
    pub async fn kill(&self, session_id: &str, grace: Duration) -> Result<i32, PtyError> {
        let session = self.get(session_id)?;
        let mut exit_rx = session.exit_tx.subscribe();

        if session.pid.is_some() {
            let _ = self.signal(session_id, SignalKind::Term);
        }

        let waited = tokio::time::timeout(grace, exit_rx.changed()).await;
        if waited.is_err() {
            if session.pid.is_some() {
                let _ = self.signal(session_id, SignalKind::Kill);
            }
            let _ = exit_rx.changed().await;
        }

        Ok(exit_rx.borrow().unwrap_or(-1))
    }

    /// Awaits the single-shot exit notification for a session (§4.B
    /// `onExit`), expressed as a future rather than a callback.
    pub async fn wait_for_exit(&self, session_id: &str) -> Result<i32, PtyError> {
        let mut rx = {
            let session = self.get(session_id)?;
            session.exit_tx.subscribe()
        };
        if rx.borrow().is_none() {
            let _ = rx.changed().await;
        }
        Ok(rx.borrow().unwrap_or(-1))
    }

    /// Subscribes to the raw output byte stream the Terminal Renderer
    /// (§4.E) folds into its virtual screen — the same bytes the
    /// Recording captures, per §4.E's "fed by the Supervisor output
    /// stream".
    pub fn subscribe_raw_output(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<Bytes>, PtyError> {
        Ok(self.get(session_id)?.output_tx.subscribe())
    }

    pub fn pid(&self, session_id: &str) -> Option<u32> {
        self.sessions.get(session_id).and_then(|s| s.pid)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| !s.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn get(&self, session_id: &str) -> Result<Arc<SupervisedSession>, PtyError> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| PtyError::SessionGone(session_id.to_string()))
    }
}

impl Default for PtySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SupervisedSession {
    fn drop(&mut self) {
        self.drain_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termcast_recording::RecordingStore;

    fn echo_descriptor() -> SpawnDescriptor {
        SpawnDescriptor {
            command: vec!["/bin/echo".into(), "hi".into()],
            working_dir: "/".into(),
            env: Default::default(),
            rows: 24,
            cols: 80,
        }
    }

    #[tokio::test]
    async fn spawned_echo_produces_output_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = RecordingStore::new(dir.path());
        let pty = PtySupervisor::new();
        let handle = Arc::new(
            recordings
                .create_header("e1", 24, 80, Default::default())
                .await
                .unwrap(),
        );

        pty.spawn("e1", echo_descriptor(), handle).await.unwrap();
        let mut rx = pty.subscribe_raw_output("e1").unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for output")
            .unwrap();
        assert!(chunk.starts_with(b"hi"));

        let code = tokio::time::timeout(Duration::from_secs(2), pty.wait_for_exit("e1"))
            .await
            .expect("timed out waiting for exit")
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn resize_rejects_zero_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = RecordingStore::new(dir.path());
        let pty = PtySupervisor::new();
        let handle = Arc::new(
            recordings
                .create_header("e2", 24, 80, Default::default())
                .await
                .unwrap(),
        );
        pty.spawn("e2", echo_descriptor(), handle.clone()).await.unwrap();

        let err = pty.resize("e2", &handle, 0, 80).await.unwrap_err();
        assert!(matches!(err, PtyError::InvalidSize { rows: 0, .. }));

        let err = pty.resize("e2", &handle, 24, 0).await.unwrap_err();
        assert!(matches!(err, PtyError::InvalidSize { cols: 0, .. }));
    }
}
