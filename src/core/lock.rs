//! Purpose: Cross-process locks keyed by pool identity.
//! Exports: `DepositLock`, `NotifyLock`, `UsageGuard`, path helpers.
//! Role: The deposit lock serializes writers; the shared usage guard makes
//! Role: "is anyone using this pool" answerable for dispose.
//! Invariants: Lock files are siblings of the pool file, so any process that
//! Invariants: can open the pool finds the same locks.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};

pub(crate) fn deposit_lock_path(pool_path: &Path) -> PathBuf {
    sibling(pool_path, "deposit-lock")
}

pub(crate) fn notify_lock_path(pool_path: &Path) -> PathBuf {
    sibling(pool_path, "notify-lock")
}

fn sibling(pool_path: &Path, suffix: &str) -> PathBuf {
    let mut name = pool_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    pool_path.with_file_name(name)
}

fn open_lock_file(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))
}

/// Exclusive cross-process lock serializing all depositors of one pool.
/// Held for the duration of a deposit (or resize); released on drop.
pub(crate) struct DepositLock {
    file: File,
}

impl DepositLock {
    pub(crate) fn acquire(pool_path: &Path) -> Result<Self, Error> {
        let path = deposit_lock_path(pool_path);
        let file = open_lock_file(&path)?;
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl Drop for DepositLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Same shape as the deposit lock, for the notification collaborator.
pub(crate) struct NotifyLock {
    file: File,
}

impl NotifyLock {
    pub(crate) fn acquire(pool_path: &Path) -> Result<Self, Error> {
        let path = notify_lock_path(pool_path);
        let file = open_lock_file(&path)?;
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl Drop for NotifyLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Shared lock on the pool file itself, held for the lifetime of every open
/// hose. Dispose needs the exclusive counterpart and therefore fails while
/// any hose exists.
pub(crate) struct UsageGuard {
    _file: File,
}

impl UsageGuard {
    pub(crate) fn shared(pool_path: &Path) -> Result<Self, Error> {
        let file = open_lock_file(pool_path)?;
        file.lock_shared().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(pool_path)
                .with_source(err)
        })?;
        Ok(Self { _file: file })
    }
}

/// Non-blocking exclusive claim used by dispose; fails `InUse` while any
/// usage guard is alive.
pub(crate) fn claim_exclusive(pool_path: &Path) -> Result<File, Error> {
    let file = open_lock_file(pool_path)?;
    file.try_lock_exclusive().map_err(|err| {
        if err.kind() == io::ErrorKind::WouldBlock {
            Error::new(ErrorKind::InUse)
                .with_path(pool_path)
                .with_message("pool is open in another hose or process")
        } else {
            Error::new(lock_error_kind(&err))
                .with_path(pool_path)
                .with_source(err)
        }
    })?;
    Ok(file)
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
