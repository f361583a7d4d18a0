use std::sync::atomic::{AtomicU8, Ordering};

/// Process-wide log verbosity, set once at startup and read from hot
/// paths (the PTY drain loop, the watcher's tail loop) without threading
/// a logger handle through every call (§9: "Global mutable verbosity
/// level is acceptable as a process-wide atomic").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    Silent = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl Verbosity {
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Some(Verbosity::Silent),
            "error" => Some(Verbosity::Error),
            "warn" => Some(Verbosity::Warn),
            "info" => Some(Verbosity::Info),
            "verbose" => Some(Verbosity::Verbose),
            "debug" => Some(Verbosity::Debug),
            _ => None,
        }
    }

    pub fn tracing_directive(self) -> &'static str {
        match self {
            Verbosity::Silent => "off",
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Debug => "trace",
        }
    }
}

static VERBOSITY: AtomicU8 = AtomicU8::new(Verbosity::Info as u8);

pub fn set_verbosity(level: Verbosity) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

pub fn verbosity() -> Verbosity {
    match VERBOSITY.load(Ordering::Relaxed) {
        0 => Verbosity::Silent,
        1 => Verbosity::Error,
        2 => Verbosity::Warn,
        3 => Verbosity::Info,
        4 => Verbosity::Verbose,
        _ => Verbosity::Debug,
    }
}

pub fn at_least(level: Verbosity) -> bool {
    verbosity() >= level
}
