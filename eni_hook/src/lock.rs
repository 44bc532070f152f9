//! Per-interface exclusive lock.
//!
//! The hook runner may start a second pass for an interface while the first
//! is still polling metadata. Both would edit the same addresses, so each pass
//! holds an advisory `flock` on `<lock_dir>/<interface>.lock` until it ends.

use thiserror::Error;
use tokio::task;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to prepare lock file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("Unable to lock {}: {source}", path.display())]
    Lock { path: PathBuf, source: io::Error },
    #[error("Lock task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Held for the duration of a pass; released when dropped.
#[derive(Debug)]
pub struct InterfaceLock {
    _file: File,
    path: PathBuf,
}

impl InterfaceLock {
    pub async fn acquire(lock_dir: &Path, interface: &str) -> Result<Self, Error> {
        let path = lock_dir.join(format!("{interface}.lock"));
        let file = open(lock_dir, &path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;

        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::info!(%interface, lock = %path.display(), "another pass is running, waiting for it");
                let started = Instant::now();
                let file = task::spawn_blocking(move || flock(&file, libc::LOCK_EX).map(|_| file))
                    .await?
                    .map_err(|source| Error::Lock {
                        path: path.clone(),
                        source,
                    })?;
                tracing::info!(
                    lock = %path.display(),
                    waited = %humantime::format_duration(started.elapsed()),
                    "lock acquired after waiting"
                );
                return Ok(InterfaceLock { _file: file, path });
            }
            Err(source) => return Err(Error::Lock { path, source }),
        }

        tracing::debug!(lock = %path.display(), "lock acquired");
        Ok(InterfaceLock { _file: file, path })
    }

    /// Fails right away instead of waiting when another pass holds the lock.
    #[cfg(test)]
    pub fn try_acquire(lock_dir: &Path, interface: &str) -> Result<Self, Error> {
        let path = lock_dir.join(format!("{interface}.lock"));
        let file = open(lock_dir, &path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(InterfaceLock { _file: file, path }),
            Err(source) => Err(Error::Lock { path, source }),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InterfaceLock {
    fn drop(&mut self) {
        tracing::debug!(lock = %self.path.display(), "lock released");
    }
}

fn open(lock_dir: &Path, path: &Path) -> io::Result<File> {
    fs::create_dir_all(lock_dir)?;
    OpenOptions::new().create(true).truncate(false).write(true).open(path)
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use std::time::Duration;

    #[tokio::test]
    async fn creates_lock_file_per_interface() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let lock_dir = dir.path().join("eni-hook");

        let lock = InterfaceLock::acquire(&lock_dir, "eth1").await?;

        assert_eq!(lock.path(), lock_dir.join("eth1.lock"));
        assert!(lock.path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn same_interface_is_exclusive() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let _held = InterfaceLock::acquire(dir.path(), "eth1").await?;

        let res = InterfaceLock::try_acquire(dir.path(), "eth1");

        assert!(matches!(res, Err(Error::Lock { source, .. }) if source.kind() == io::ErrorKind::WouldBlock));
        Ok(())
    }

    #[tokio::test]
    async fn different_interfaces_do_not_contend() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let _eth1 = InterfaceLock::acquire(dir.path(), "eth1").await?;

        let eth2 = InterfaceLock::try_acquire(dir.path(), "eth2");

        assert!(eth2.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn waits_for_release() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let held = InterfaceLock::acquire(dir.path(), "eth1").await?;

        let lock_dir = dir.path().to_path_buf();
        let waiter = tokio::spawn(async move { InterfaceLock::acquire(&lock_dir, "eth1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let lock = tokio::time::timeout(Duration::from_secs(5), waiter).await???;

        assert_eq!(lock.path(), dir.path().join("eth1.lock"));
        Ok(())
    }
}
