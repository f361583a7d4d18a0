use crate::PtyError;

/// The whitelist of deliverable signals (§4.F: "restricted to a
/// whitelist {INT, TERM, HUP, QUIT}"); `Kill` is used internally by
/// [`crate::PtySupervisor::kill`]'s escalation and is not exposed to the
/// control plane's `signal(name)` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Int,
    Term,
    Hup,
    Quit,
    Kill,
}

impl SignalKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INT" => Some(SignalKind::Int),
            "TERM" => Some(SignalKind::Term),
            "HUP" => Some(SignalKind::Hup),
            "QUIT" => Some(SignalKind::Quit),
            _ => None,
        }
    }
}

#[cfg(unix)]
pub fn deliver(pid: u32, kind: SignalKind) -> Result<(), PtyError> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        SignalKind::Int => Signal::SIGINT,
        SignalKind::Term => Signal::SIGTERM,
        SignalKind::Hup => Signal::SIGHUP,
        SignalKind::Quit => Signal::SIGQUIT,
        SignalKind::Kill => Signal::SIGKILL,
    };

    // Deliver to the process group so a shell's children are reached too
    // (§4.B: "delivers SIGINT/SIGTERM/SIGHUP to the process group").
    killpg(Pid::from_raw(pid as i32), signal)
        .or_else(|_| nix::sys::signal::kill(Pid::from_raw(pid as i32), signal))
        .map_err(|e| PtyError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(not(unix))]
pub fn deliver(_pid: u32, _kind: SignalKind) -> Result<(), PtyError> {
    Err(PtyError::PtyUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whitelisted_names_case_insensitively() {
        assert_eq!(SignalKind::from_name("int"), Some(SignalKind::Int));
        assert_eq!(SignalKind::from_name("TERM"), Some(SignalKind::Term));
        assert_eq!(SignalKind::from_name("Hup"), Some(SignalKind::Hup));
        assert_eq!(SignalKind::from_name("QUIT"), Some(SignalKind::Quit));
        assert_eq!(SignalKind::from_name("KILL"), None);
        assert_eq!(SignalKind::from_name("bogus"), None);
    }
}
