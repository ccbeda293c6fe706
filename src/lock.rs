//! Process-wide advisory file lock serializing CNI invocations on a node.
//!
//! The lock is a sibling `.lock` file next to the state store. Acquisition
//! polls within a bounded timeout; release happens on every exit path via
//! the RAII guard. A lock file whose modification time is strictly older
//! than the last host reboot belonged to an invocation killed by that
//! reboot and is force-released before acquisition.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::PathBuf,
    time::{Duration, Instant, SystemTime},
};

use fs2::FileExt;
use tracing::warn;

use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: Option<File>,
}

/// True when a lock file last touched at `mtime` predates the host reboot
/// at `reboot` and is therefore held by a dead process.
#[must_use]
pub fn is_stale(mtime: SystemTime, reboot: SystemTime) -> bool {
    mtime < reboot
}

impl ProcessLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Acquires the lock, waiting up to `timeout`. When `last_reboot` is
    /// known and an existing lock file predates it, the stale file is
    /// force-released first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] when the deadline expires and
    /// [`Error::IoFailure`] on filesystem failures.
    pub fn acquire(
        &mut self,
        timeout: Duration,
        last_reboot: Option<SystemTime>,
    ) -> Result<(), Error> {
        if let Some(reboot) = last_reboot {
            self.discard_if_stale(reboot)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(Error::LockTimeout(format!(
                        "could not lock {} within {timeout:?}: {e}",
                        self.path.display()
                    )))
                }
            }
        }

        // Recording the holder pid aids post-mortem of stale locks.
        let mut file = file;
        let _ = write!(file, "{}", std::process::id());
        let _ = file.sync_all();
        self.file = Some(file);
        Ok(())
    }

    fn discard_if_stale(&self, reboot: SystemTime) -> Result<(), Error> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        let mtime = meta.modified()?;
        if is_stale(mtime, reboot) {
            warn!(
                lock = %self.path.display(),
                "discarding lock file left behind by a pre-reboot invocation"
            );
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Releases the lock. Safe to call when not held.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use rstest::rstest;

    use super::{is_stale, ProcessLock};

    #[rstest]
    #[case(100, 101, true)]
    #[case(100, 100, false)]
    #[case(101, 100, false)]
    fn test_is_stale(#[case] mtime_secs: u64, #[case] reboot_secs: u64, #[case] expected: bool) {
        let base = SystemTime::UNIX_EPOCH;
        let mtime = base + Duration::from_secs(mtime_secs);
        let reboot = base + Duration::from_secs(reboot_secs);
        assert_eq!(is_stale(mtime, reboot), expected);
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json.lock");

        let mut lock = ProcessLock::new(&path);
        lock.acquire(Duration::from_secs(1), None).unwrap();
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json.lock");

        let mut first = ProcessLock::new(&path);
        first.acquire(Duration::from_secs(1), None).unwrap();

        let mut second = ProcessLock::new(&path);
        let err = second
            .acquire(Duration::from_millis(250), None)
            .unwrap_err();
        assert_eq!(u32::from(&err), 11);

        first.release();
        second.acquire(Duration::from_secs(1), None).unwrap();
    }

    #[test]
    fn test_stale_lock_discarded_after_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json.lock");
        std::fs::write(&path, "1234").unwrap();

        // Reboot strictly after the file's mtime forces a discard.
        let reboot = SystemTime::now() + Duration::from_secs(5);
        let mut lock = ProcessLock::new(&path);
        lock.acquire(Duration::from_secs(1), Some(reboot)).unwrap();
        assert!(lock.is_held());
    }

    #[test]
    fn test_release_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json.lock");

        {
            let mut lock = ProcessLock::new(&path);
            lock.acquire(Duration::from_secs(1), None).unwrap();
        }

        let mut again = ProcessLock::new(&path);
        again.acquire(Duration::from_millis(500), None).unwrap();
    }
}
