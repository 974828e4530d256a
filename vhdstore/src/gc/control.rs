//! The `gc-running`/`gc-exited` touch-file protocol the CLI uses to start
//! and stop the daemon process across a process boundary: presence of the
//! file is the signal, not its contents.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use vhdstore_shared::{VhdStoreError, VhdStoreResult};

fn sr_run_dir(run_dir: &Path, sr_unique_id: &str) -> PathBuf {
    run_dir.join(sr_unique_id)
}

fn running_marker(run_dir: &Path, sr_unique_id: &str) -> PathBuf {
    sr_run_dir(run_dir, sr_unique_id).join("gc-running")
}

fn exited_marker(run_dir: &Path, sr_unique_id: &str) -> PathBuf {
    sr_run_dir(run_dir, sr_unique_id).join("gc-exited")
}

/// Touch `gc-running` for `sr_unique_id`. The daemon binary itself enters
/// its main loop only once this file exists; callers spawn the process
/// first and then call this (or have the daemon touch it on startup).
pub fn start_gc(run_dir: &Path, sr_unique_id: &str) -> VhdStoreResult<()> {
    let dir = sr_run_dir(run_dir, sr_unique_id);
    fs::create_dir_all(&dir)?;
    let _ = fs::remove_file(exited_marker(run_dir, sr_unique_id));
    fs::write(running_marker(run_dir, sr_unique_id), b"")?;
    Ok(())
}

/// True while the daemon should keep iterating its main loop.
pub fn is_running(run_dir: &Path, sr_unique_id: &str) -> bool {
    running_marker(run_dir, sr_unique_id).exists()
}

/// The daemon calls this once, after its loop has actually stopped, so
/// `stop_gc` callers waiting on [`wait_for_exit`] observe the daemon is
/// truly gone rather than merely asked to stop.
pub fn mark_exited(run_dir: &Path, sr_unique_id: &str) -> VhdStoreResult<()> {
    fs::write(exited_marker(run_dir, sr_unique_id), b"")?;
    Ok(())
}

/// Unlink `gc-running` and block until the daemon touches `gc-exited`, or
/// `timeout` elapses.
pub fn stop_gc(run_dir: &Path, sr_unique_id: &str, timeout: Duration) -> VhdStoreResult<()> {
    let _ = fs::remove_file(running_marker(run_dir, sr_unique_id));
    wait_for_exit(run_dir, sr_unique_id, timeout)
}

fn wait_for_exit(run_dir: &Path, sr_unique_id: &str, timeout: Duration) -> VhdStoreResult<()> {
    let marker = exited_marker(run_dir, sr_unique_id);
    let deadline = Instant::now() + timeout;
    while !marker.exists() {
        if Instant::now() >= deadline {
            return Err(VhdStoreError::Internal(format!(
                "coalesce daemon for {sr_unique_id} did not exit within {timeout:?}"
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn start_gc_creates_running_marker_and_clears_exited() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(sr_run_dir(dir.path(), "sr1")).unwrap();
        fs::write(exited_marker(dir.path(), "sr1"), b"").unwrap();

        start_gc(dir.path(), "sr1").unwrap();

        assert!(is_running(dir.path(), "sr1"));
        assert!(!exited_marker(dir.path(), "sr1").exists());
    }

    #[test]
    fn stop_gc_times_out_if_daemon_never_exits() {
        let dir = TempDir::new().unwrap();
        start_gc(dir.path(), "sr1").unwrap();

        let err = stop_gc(dir.path(), "sr1", Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, VhdStoreError::Internal(_)));
        assert!(!is_running(dir.path(), "sr1"));
    }

    #[test]
    fn stop_gc_succeeds_once_daemon_marks_exited() {
        let dir = TempDir::new().unwrap();
        start_gc(dir.path(), "sr1").unwrap();
        mark_exited(dir.path(), "sr1").unwrap();

        stop_gc(dir.path(), "sr1", Duration::from_millis(150)).unwrap();
    }
}
