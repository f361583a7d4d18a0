//! Session Registry (§4.C): authoritative enumeration, creation, rename,
//! and deletion of sessions on this node. Mediates between the PTY
//! Supervisor and the Recording Store so callers only ever deal in
//! session ids.

mod liveness;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use termcast_config::Config;
use termcast_pty::{PtyError, PtySupervisor, SignalKind, SpawnDescriptor};
use termcast_recording::{RecordingError, RecordingHandle, RecordingStore};
use termcast_types::{CoreError, Kind, RunState, SessionDescriptor, SessionRecord, SessionSummary};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("create failed: {0}")]
    CreateFailed(String),
    #[error("session {0} is still running")]
    StillRunning(String),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        let kind = match &e {
            RegistryError::NotFound(_) => Kind::NotFound,
            RegistryError::StillRunning(_) => Kind::Conflict,
            RegistryError::CreateFailed(_) | RegistryError::Pty(_) => Kind::SpawnFailed,
            _ => Kind::Internal,
        };
        CoreError::new(kind, e.to_string())
    }
}

const SESSION_FILE: &str = "session.json";

#[derive(Clone)]
pub struct SessionRegistry {
    config: Arc<Config>,
    recordings: RecordingStore,
    supervisor: PtySupervisor,
    index: Arc<RwLock<HashMap<String, SessionRecord>>>,
    handles: Arc<DashMap<String, Arc<RecordingHandle>>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, recordings: RecordingStore, supervisor: PtySupervisor) -> Self {
        Self {
            config,
            recordings,
            supervisor,
            index: Arc::new(RwLock::new(HashMap::new())),
            handles: Arc::new(DashMap::new()),
        }
    }

    pub fn recordings(&self) -> &RecordingStore {
        &self.recordings
    }

    pub fn supervisor(&self) -> &PtySupervisor {
        &self.supervisor
    }

    /// Reloads every `session.json` found on disk into the in-memory
    /// index, reclassifying dead pids as exited along the way. Called
    /// once at startup so a restarted server still lists prior sessions.
    pub async fn load_from_disk(&self) -> Result<(), RegistryError> {
        let sessions_dir = self.config.data_dir.join("sessions");
        if !sessions_dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&sessions_dir).await?;
        let mut index = self.index.write().await;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.read_record(&id).await {
                Ok(record) => {
                    index.insert(id, reclassify(record));
                }
                Err(e) => warn!(session = %id, error = %e, "skipping unreadable session directory"),
            }
        }
        Ok(())
    }

    async fn read_record(&self, session_id: &str) -> Result<SessionRecord, RegistryError> {
        let path = self.config.session_dir(session_id).join(SESSION_FILE);
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn persist(&self, record: &SessionRecord) -> Result<(), RegistryError> {
        let dir = self.config.session_dir(&record.id);
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(record)?;
        termcast_util::write_atomic(&dir.join(SESSION_FILE), &bytes)?;
        Ok(())
    }

    pub async fn create(&self, descriptor: SessionDescriptor) -> Result<String, RegistryError> {
        if descriptor.command.is_empty() {
            return Err(RegistryError::CreateFailed("empty command".into()));
        }

        let id = termcast_util::new_session_id();
        let record = SessionRecord {
            id: id.clone(),
            descriptor: descriptor.clone(),
            status: RunState::Starting,
            pid: None,
            created_at: chrono::Utc::now(),
        };
        self.persist(&record).await?;
        {
            let mut index = self.index.write().await;
            index.insert(id.clone(), record.clone());
        }

        let handle = Arc::new(
            self.recordings
                .create_header(&id, descriptor.rows, descriptor.cols, descriptor.env.clone())
                .await?,
        );

        let spawn_result = self
            .supervisor
            .spawn(
                &id,
                SpawnDescriptor {
                    command: descriptor.command.clone(),
                    working_dir: descriptor.working_dir.clone(),
                    env: descriptor.env.clone(),
                    rows: descriptor.rows,
                    cols: descriptor.cols,
                },
                handle.clone(),
            )
            .await;

        match spawn_result {
            Ok(()) => {
                self.handles.insert(id.clone(), handle);
                let pid = self.pid_of(&id).await;
                self.update_status(&id, RunState::Running, pid).await?;
                self.spawn_exit_reconciler(id.clone());
                info!(session = %id, "session created");
                Ok(id)
            }
            Err(e) => {
                self.update_status(&id, RunState::Exited { code: None }, None)
                    .await?;
                Err(RegistryError::CreateFailed(e.to_string()))
            }
        }
    }

    async fn pid_of(&self, session_id: &str) -> Option<u32> {
        self.supervisor.pid(session_id)
    }

    fn spawn_exit_reconciler(&self, session_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(code) = this.supervisor.wait_for_exit(&session_id).await {
                this.handles.remove(&session_id);
                let _ = this
                    .update_status(&session_id, RunState::Exited { code: Some(code) }, None)
                    .await;
            }
        });
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: RunState,
        pid: Option<u32>,
    ) -> Result<(), RegistryError> {
        let mut index = self.index.write().await;
        let record = index
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        record.status = status;
        if pid.is_some() {
            record.pid = pid;
        }
        let record = record.clone();
        drop(index);
        self.persist(&record).await
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut index = self.index.write().await;
        let mut out = Vec::with_capacity(index.len());
        for record in index.values_mut() {
            reclassify_in_place(record, &self.supervisor);
            out.push(SessionSummary::from_record(record));
        }
        out
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionSummary, RegistryError> {
        let mut index = self.index.write().await;
        let record = index
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        reclassify_in_place(record, &self.supervisor);
        let summary = SessionSummary::from_record(record);
        let record = record.clone();
        drop(index);
        let _ = self.persist(&record).await;
        Ok(summary)
    }

    /// Last-writer-wins rename (§8 round-trip law).
    pub async fn rename(&self, session_id: &str, new_name: String) -> Result<(), RegistryError> {
        let mut index = self.index.write().await;
        let record = index
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        record.descriptor.name = Some(new_name);
        let record = record.clone();
        drop(index);
        self.persist(&record).await
    }

    /// Terminates the child (SIGTERM, grace period, SIGKILL) without
    /// deleting the session's directory — the recording and descriptor
    /// persist until an explicit `delete` (§3 "directory persists until
    /// explicit deletion or cleanup").
    pub async fn close(&self, session_id: &str, grace: Duration) -> Result<(), RegistryError> {
        if !self.supervisor.is_running(session_id) {
            return Ok(());
        }
        let code = self.supervisor.kill(session_id, grace).await?;
        self.handles.remove(session_id);
        self.update_status(session_id, RunState::Exited { code: Some(code) }, None)
            .await
    }

    pub async fn delete(&self, session_id: &str, force: bool) -> Result<(), RegistryError> {
        let running = self.supervisor.is_running(session_id);
        if running {
            if !force {
                return Err(RegistryError::StillRunning(session_id.to_string()));
            }
            self.supervisor
                .kill(session_id, Duration::from_secs(3))
                .await?;
        }
        self.handles.remove(session_id);
        self.index.write().await.remove(session_id);
        let dir = self.config.session_dir(session_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub async fn cleanup_exited(&self, older_than: Duration) -> Result<Vec<String>, RegistryError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let stale: Vec<String> = {
            let index = self.index.read().await;
            index
                .values()
                .filter(|r| matches!(r.status, RunState::Exited { .. }) && r.created_at < cutoff)
                .map(|r| r.id.clone())
                .collect()
        };
        for id in &stale {
            self.delete(id, false).await?;
        }
        Ok(stale)
    }

    pub fn recording_handle(&self, session_id: &str) -> Option<Arc<RecordingHandle>> {
        self.handles.get(session_id).map(|e| e.value().clone())
    }

    pub async fn signal(&self, session_id: &str, kind: SignalKind) -> Result<(), RegistryError> {
        Ok(self.supervisor.signal(session_id, kind)?)
    }
}

fn reclassify(mut record: SessionRecord) -> SessionRecord {
    if let RunState::Running = record.status {
        let alive = record.pid.map(liveness::is_alive).unwrap_or(false);
        if !alive {
            record.status = RunState::Exited { code: None };
        }
    }
    record
}

/// Corrects a "zombie" session (§3, §8): directory present, pid dead,
/// status still `running`, without waiting for the supervisor.
fn reclassify_in_place(record: &mut SessionRecord, supervisor: &PtySupervisor) {
    if let RunState::Running = record.status {
        let supervised = supervisor.is_running(&record.id);
        let alive = supervised || record.pid.map(liveness::is_alive).unwrap_or(false);
        if !alive {
            record.status = RunState::Exited { code: None };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termcast_types::SpawnSource;

    fn registry_fixture(dir: &std::path::Path) -> SessionRegistry {
        let config = Arc::new(Config {
            data_dir: dir.to_path_buf(),
            verbosity: termcast_util::Verbosity::Info,
            debug_mode: false,
            default_rows: 24,
            default_cols: 80,
            kill_grace_period: Duration::from_secs(3),
            subscriber_queue_capacity: 64,
        });
        let recordings = RecordingStore::new(dir.join("sessions"));
        SessionRegistry::new(config, recordings, PtySupervisor::new())
    }

    fn descriptor(command: &[&str]) -> SessionDescriptor {
        SessionDescriptor {
            command: command.iter().map(|s| s.to_string()).collect(),
            working_dir: "/".into(),
            env: Default::default(),
            rows: 24,
            cols: 80,
            name: None,
            title_mode: Default::default(),
            spawn_source: SpawnSource::Web,
            git_repo_path: None,
            git_branch: None,
            remote_id: None,
        }
    }

    #[test]
    fn reclassify_in_place_corrects_a_dead_pid() {
        // A reaped child's pid is guaranteed not to answer kill(pid, 0).
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let supervisor = PtySupervisor::new();
        let mut record = SessionRecord {
            id: "zombie".into(),
            descriptor: descriptor(&["/bin/true"]),
            status: RunState::Running,
            pid: Some(dead_pid),
            created_at: chrono::Utc::now(),
        };
        reclassify_in_place(&mut record, &supervisor);
        assert_eq!(record.status, RunState::Exited { code: None });
    }

    #[test]
    fn reclassify_in_place_leaves_a_live_pid_running() {
        let record_pid = std::process::id();
        let mut record = SessionRecord {
            id: "alive".into(),
            descriptor: descriptor(&["/bin/cat"]),
            status: RunState::Running,
            pid: Some(record_pid),
            created_at: chrono::Utc::now(),
        };
        reclassify_in_place(&mut record, &PtySupervisor::new());
        assert_eq!(record.status, RunState::Running);
    }

    #[tokio::test]
    async fn rename_is_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_fixture(dir.path());
        let id = registry.create(descriptor(&["/bin/cat"])).await.unwrap();

        registry.rename(&id, "first".into()).await.unwrap();
        registry.rename(&id, "second".into()).await.unwrap();

        let summary = registry.get(&id).await.unwrap();
        assert_eq!(summary.name.as_deref(), Some("second"));

        registry.delete(&id, true).await.unwrap();
    }

    #[tokio::test]
    async fn delete_without_force_refuses_a_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_fixture(dir.path());
        let id = registry.create(descriptor(&["/bin/cat"])).await.unwrap();

        let err = registry.delete(&id, false).await.unwrap_err();
        assert!(matches!(err, RegistryError::StillRunning(_)));

        registry.delete(&id, true).await.unwrap();
        assert!(matches!(
            registry.get(&id).await.unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }
}
