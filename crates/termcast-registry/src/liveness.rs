/// Portable `kill(pid, 0)` liveness probe used to correct "zombie"
/// sessions on read (§4.C: "status is recomputed by probing pid
/// liveness").
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}
