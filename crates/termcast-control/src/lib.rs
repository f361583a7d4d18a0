//! Control Plane (§4.F): validates and dispatches per-session input,
//! resize, signal, rename, and close operations. A thin, stateless layer
//! over the Registry and PTY Supervisor — every operation here is
//! idempotent at the protocol layer, per §4.F.

mod keymap;

use std::time::Duration;

use termcast_pty::SignalKind;
use termcast_registry::SessionRegistry;
use termcast_types::{CoreError, Kind};
use tracing::warn;

pub use keymap::lookup as lookup_key;

const MIN_DIM: u16 = 1;
const MAX_DIM: u16 = 10_000;
const CLOSE_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid resize: rows={rows} cols={cols}, must be {min}..={max}")]
    InvalidResize { rows: u16, cols: u16, min: u16, max: u16 },
    #[error("unknown key name: {0}")]
    UnknownKey(String),
    #[error("signal {0} is not in the accepted whitelist")]
    SignalNotAllowed(String),
    #[error(transparent)]
    Registry(#[from] termcast_registry::RegistryError),
}

impl ControlError {
    fn into_core(self) -> CoreError {
        match self {
            ControlError::Registry(inner) => inner.into(),
            other => CoreError::new(Kind::InvalidRequest, other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ControlPlane {
    registry: SessionRegistry,
}

impl ControlPlane {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Writes raw bytes to a session's PTY and records an input-echo
    /// event (§3's Recording data model, kind `"i"`).
    pub async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), CoreError> {
        self.registry
            .supervisor()
            .write(session_id, bytes)
            .await
            .map_err(|e| CoreError::new(Kind::SessionGone, e.to_string()))?;
        if let Some(handle) = self.registry.recording_handle(session_id) {
            if let Err(e) = handle.append_input(bytes).await {
                warn!(session = %session_id, error = %e, "failed to append input-echo event");
            }
        }
        Ok(())
    }

    /// Resolves a symbolic key name (§3 supplement) and forwards it as
    /// input, rejecting names outside the known table.
    pub async fn input_key(&self, session_id: &str, key: &str) -> Result<(), CoreError> {
        let bytes = keymap::lookup(key)
            .ok_or_else(|| ControlError::UnknownKey(key.to_string()).into_core())?;
        self.input(session_id, bytes).await
    }

    /// Validates dimensions (§4.F: `1 <= dim <= 10000`) before forwarding
    /// to the Supervisor. Resizing to the current size is a no-op at the
    /// protocol layer but still reissues the ioctl; cheap and idempotent.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), CoreError> {
        if rows < MIN_DIM || rows > MAX_DIM || cols < MIN_DIM || cols > MAX_DIM {
            return Err(ControlError::InvalidResize {
                rows,
                cols,
                min: MIN_DIM,
                max: MAX_DIM,
            }
            .into_core());
        }
        let handle = self
            .registry
            .recording_handle(session_id)
            .ok_or_else(|| CoreError::new(Kind::SessionGone, session_id.to_string()))?;
        self.registry
            .supervisor()
            .resize(session_id, &handle, rows, cols)
            .await
            .map_err(|e| CoreError::new(Kind::SessionGone, e.to_string()))
    }

    /// Delivers a signal restricted to the whitelist {INT, TERM, HUP,
    /// QUIT} (§4.F). Delivery is allowed and re-sent on every retry.
    pub async fn signal(&self, session_id: &str, name: &str) -> Result<(), CoreError> {
        let kind = SignalKind::from_name(name)
            .ok_or_else(|| ControlError::SignalNotAllowed(name.to_string()).into_core())?;
        self.registry
            .signal(session_id, kind)
            .await
            .map_err(ControlError::Registry)
            .map_err(ControlError::into_core)
    }

    pub async fn rename(&self, session_id: &str, new_name: String) -> Result<(), CoreError> {
        self.registry
            .rename(session_id, new_name)
            .await
            .map_err(ControlError::Registry)
            .map_err(ControlError::into_core)
    }

    /// `signal(TERM)` then `kill` after a grace period (§4.F).
    pub async fn close(&self, session_id: &str) -> Result<(), CoreError> {
        self.registry
            .close(session_id, CLOSE_GRACE)
            .await
            .map_err(ControlError::Registry)
            .map_err(ControlError::into_core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use termcast_config::Config;
    use termcast_pty::PtySupervisor;
    use termcast_recording::RecordingStore;
    use termcast_types::{SessionDescriptor, SpawnSource, TitleMode};

    async fn test_plane(dir: &std::path::Path) -> ControlPlane {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        let recordings = RecordingStore::new(&config.data_dir);
        let supervisor = PtySupervisor::new();
        let registry = SessionRegistry::new(Arc::new(config), recordings, supervisor);
        ControlPlane::new(registry)
    }

    fn echo_descriptor() -> SessionDescriptor {
        SessionDescriptor {
            command: vec!["/bin/sleep".into(), "5".into()],
            working_dir: "/".into(),
            env: Default::default(),
            rows: 24,
            cols: 80,
            name: None,
            title_mode: TitleMode::None,
            spawn_source: SpawnSource::Web,
            git_repo_path: None,
            git_branch: None,
            remote_id: None,
        }
    }

    #[tokio::test]
    async fn resize_rejects_out_of_range_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let plane = test_plane(dir.path()).await;
        let id = plane.registry.create(echo_descriptor()).await.unwrap();

        let err = plane.resize(&id, 0, 80).await.unwrap_err();
        assert_eq!(err.kind, Kind::InvalidRequest);

        let err = plane.resize(&id, 24, 10_001).await.unwrap_err();
        assert_eq!(err.kind, Kind::InvalidRequest);
    }

    #[tokio::test]
    async fn signal_rejects_names_outside_the_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let plane = test_plane(dir.path()).await;
        let id = plane.registry.create(echo_descriptor()).await.unwrap();

        let err = plane.signal(&id, "KILL").await.unwrap_err();
        assert_eq!(err.kind, Kind::InvalidRequest);

        plane.signal(&id, "TERM").await.unwrap();
    }

    #[tokio::test]
    async fn input_key_resolves_symbolic_names() {
        let dir = tempfile::tempdir().unwrap();
        let plane = test_plane(dir.path()).await;
        let id = plane.registry.create(echo_descriptor()).await.unwrap();

        plane.input_key(&id, "ctrl_c").await.unwrap();
        let err = plane.input_key(&id, "not_a_key").await.unwrap_err();
        assert_eq!(err.kind, Kind::InvalidRequest);
    }
}
