use std::path::PathBuf;
use std::time::Duration;

use termcast_util::Verbosity;

/// Process configuration sourced entirely from the environment (§6: CLI
/// argument parsing is out of scope; §1 excludes installer/packaging).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub verbosity: Verbosity,
    pub debug_mode: bool,
    pub default_rows: u16,
    pub default_cols: u16,
    pub kill_grace_period: Duration,
    pub subscriber_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os("TERMCAST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let verbosity = std::env::var("TERMCAST_LOG")
            .ok()
            .and_then(|v| Verbosity::from_env_str(&v))
            .unwrap_or(Verbosity::Info);

        let debug_mode = std::env::var("TERMCAST_DEBUG")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let default_rows = env_u16("TERMCAST_DEFAULT_ROWS", 24);
        let default_cols = env_u16("TERMCAST_DEFAULT_COLS", 80);
        let kill_grace_period = Duration::from_secs(env_u64("TERMCAST_KILL_GRACE_SECS", 3));
        let subscriber_queue_capacity = env_u64("TERMCAST_SUBSCRIBER_QUEUE", 512) as usize;

        Self {
            data_dir,
            verbosity,
            debug_mode,
            default_rows,
            default_cols,
            kill_grace_period,
            subscriber_queue_capacity,
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termcast")
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
