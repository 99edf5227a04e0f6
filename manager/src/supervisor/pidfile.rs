//! PID file handling and zero-signal liveness checks.

use std::fs;
use std::io;
use std::path::Path;

/// Reads a PID file. Missing, empty, or garbled files yield `None`.
pub fn read_pid(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    let pid: u32 = text.trim().parse().ok()?;
    (pid > 0).then_some(pid)
}

/// Writes `pid` via a temp file and rename so readers never see a torn value.
pub fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    let tmp = path.with_extension("pid.tmp");
    fs::write(&tmp, format!("{pid}\n"))?;
    fs::rename(&tmp, path)
}

/// Removes the PID file; a missing file is not an error.
pub fn remove_pid(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// `kill(pid, 0)` succeeds: the process exists and we may signal it.
///
/// A process owned by another user yields `EPERM` and counts as not ours.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    reap(pid);
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Sends `signal` to `pid`; returns whether delivery succeeded.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: plain kill(2) on a positive pid.
    unsafe { libc::kill(pid, signal) == 0 }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: i32) -> bool {
    false
}

/// Collects an exited child of this process so it stops answering the
/// zero-signal check. No-op for processes we did not spawn.
#[cfg(unix)]
fn reap(pid: libc::pid_t) {
    let mut status = 0;
    // SAFETY: WNOHANG never blocks; ECHILD for foreign pids is ignored.
    unsafe {
        libc::waitpid(pid, &mut status, libc::WNOHANG);
    }
}
