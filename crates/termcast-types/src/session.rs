use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How the recorded terminal title should be derived, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    None,
    Filter,
    Static,
    Dynamic,
}

impl Default for TitleMode {
    fn default() -> Self {
        TitleMode::None
    }
}

/// Where a session creation request originated, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnSource {
    Web,
    ExternalTerminal,
    Forwarded,
}

impl Default for SpawnSource {
    fn default() -> Self {
        SpawnSource::Web
    }
}

/// The immutable-ish descriptor a session is created with (§3 "Descriptor").
/// `session.json`'s persisted shape mirrors this plus a status field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
    pub name: Option<String>,
    #[serde(default)]
    pub title_mode: TitleMode,
    #[serde(default)]
    pub spawn_source: SpawnSource,
    pub git_repo_path: Option<String>,
    pub git_branch: Option<String>,
    pub remote_id: Option<String>,
}

/// Derived runtime state, never persisted directly (§3 "Runtime state").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
    Exited { code: Option<i32> },
}

impl RunState {
    pub fn status_str(&self) -> &'static str {
        match self {
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Exited { .. } => "exited",
        }
    }
}

/// The on-disk `session.json` shape: descriptor + last-known status,
/// exactly as §4.C says "`session.json` is the source of truth for
/// descriptor; runtime status is recomputed by probing pid liveness".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(flatten)]
    pub descriptor: SessionDescriptor,
    pub status: RunState,
    pub pid: Option<u32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The shape returned by `GET /api/sessions` and `GET /api/sessions/:id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub command: Vec<String>,
    pub working_dir: String,
    pub status: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub rows: u16,
    pub cols: u16,
    pub git_repo_path: Option<String>,
    pub git_branch: Option<String>,
    pub remote_id: Option<String>,
    pub exit_code: Option<i32>,
}

impl SessionSummary {
    pub fn from_record(record: &SessionRecord) -> Self {
        let exit_code = match &record.status {
            RunState::Exited { code } => *code,
            _ => None,
        };
        Self {
            id: record.id.clone(),
            name: record.descriptor.name.clone(),
            command: record.descriptor.command.clone(),
            working_dir: record.descriptor.working_dir.clone(),
            status: record.status.status_str().to_string(),
            started_at: record.created_at,
            rows: record.descriptor.rows,
            cols: record.descriptor.cols,
            git_repo_path: record.descriptor.git_repo_path.clone(),
            git_branch: record.descriptor.git_branch.clone(),
            remote_id: record.descriptor.remote_id.clone(),
            exit_code,
        }
    }
}
