//! Cache-directory lock gating download and extract.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::pidfile;

use super::SnapshotError;

pub const LOCK_FILE: &str = ".lock";

/// A lock without a readable PID is held until it is this old.
const UNREADABLE_GRACE: Duration = Duration::from_secs(60);

/// Held while a download or extraction runs; removes the lock file on drop.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    /// Creates `<cache_dir>/.lock` holding our PID. A lock left behind by a
    /// dead process, or an unreadable one older than the grace period, is
    /// removed and acquisition retried once.
    pub fn acquire(cache_dir: &Path) -> Result<Self, SnapshotError> {
        fs::create_dir_all(cache_dir).map_err(SnapshotError::io("create snapshot cache"))?;
        let path = cache_dir.join(LOCK_FILE);

        for _ in 0..2 {
            match publish(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match pidfile::read_pid(&path) {
                        Some(pid) if pidfile::is_alive(pid) => {
                            return Err(SnapshotError::Locked { pid });
                        }
                        Some(_) => {}
                        None if !is_abandoned(&path) => {
                            return Err(SnapshotError::LockPending { path });
                        }
                        None => {}
                    }
                    tracing::warn!(lock = %path.display(), "removing stale snapshot lock");
                    pidfile::remove_pid(&path)
                        .map_err(SnapshotError::io("remove stale snapshot lock"))?;
                }
                Err(e) => return Err(SnapshotError::io("create snapshot lock")(e)),
            }
        }
        Err(SnapshotError::io("create snapshot lock")(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock reappeared while removing a stale one",
        )))
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(err) = pidfile::remove_pid(&self.path) {
            tracing::warn!(%err, lock = %self.path.display(), "failed to release snapshot lock");
        }
    }
}

/// Writes our PID to a private file, then hard-links it to `path`. The lock
/// only ever becomes visible with its PID already in it.
fn publish(path: &Path) -> io::Result<()> {
    let pid = std::process::id();
    let staged = path.with_file_name(format!("{LOCK_FILE}.{pid}"));
    fs::write(&staged, format!("{pid}\n"))?;

    let linked = fs::hard_link(&staged, path);
    if let Err(err) = fs::remove_file(&staged) {
        tracing::warn!(%err, path = %staged.display(), "failed to remove staged snapshot lock");
    }
    linked
}

fn is_abandoned(path: &Path) -> bool {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().is_ok_and(|age| age >= UNREADABLE_GRACE),
        Err(e) => e.kind() == io::ErrorKind::NotFound,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = TempDir::new().expect("create temp dir");
        let lock = CacheLock::acquire(tmp.path()).expect("first acquire");
        let err = CacheLock::acquire(tmp.path()).expect_err("held");
        assert!(matches!(err, SnapshotError::Locked { pid } if pid == std::process::id()));
        drop(lock);
        assert!(!tmp.path().join(LOCK_FILE).exists());
        CacheLock::acquire(tmp.path()).expect("re-acquire after release");
    }

    #[test]
    fn acquire_leaves_only_the_lock_file() {
        let tmp = TempDir::new().expect("create temp dir");
        let _lock = CacheLock::acquire(tmp.path()).expect("acquire");

        let names: Vec<_> = fs::read_dir(tmp.path())
            .expect("read cache dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(LOCK_FILE)]);
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead = child.id();
        child.wait().expect("wait");
        fs::write(tmp.path().join(LOCK_FILE), format!("{dead}\n")).expect("write stale lock");

        let _lock = CacheLock::acquire(tmp.path()).expect("stale lock replaced");
        let pid = pidfile::read_pid(&tmp.path().join(LOCK_FILE));
        assert_eq!(pid, Some(std::process::id()));
    }

    #[test]
    fn fresh_empty_lock_is_treated_as_held() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join(LOCK_FILE);
        fs::write(&path, "").expect("write empty lock");

        let err = CacheLock::acquire(tmp.path()).expect_err("empty lock is held");
        assert!(matches!(err, SnapshotError::LockPending { .. }));
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).expect("read lock"), "");
    }

    #[test]
    fn abandoned_empty_lock_is_taken_over() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join(LOCK_FILE);
        fs::write(&path, "").expect("write empty lock");
        OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("open lock")
            .set_modified(SystemTime::now() - 2 * UNREADABLE_GRACE)
            .expect("age lock");

        let _lock = CacheLock::acquire(tmp.path()).expect("abandoned lock replaced");
        assert_eq!(pidfile::read_pid(&path), Some(std::process::id()));
    }
}
