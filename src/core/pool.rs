//! Purpose: Pool lifecycle: creation options, create, dispose.
//! Exports: `Pool`, `PoolOptions`, size constants.
//! Role: Owns the on-disk birth and death of pools; everything between those
//! Role: two moments goes through a hose.
//! Invariants: Created files are fully initialized before `create` returns;
//! Invariants: a failed creation leaves nothing behind.
//! Invariants: Dispose never removes a file it cannot identify as a pool.

use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{
    self, InitParams, Layout, FLAG_AUTO_DISPOSE, FLAG_CHECKSUM, FLAG_FROZEN, FLAG_STOP_WHEN_FULL,
    FLAG_SYNC,
};
use crate::core::lock::{claim_exclusive, deposit_lock_path, notify_lock_path};
use crate::core::notify;
use crate::core::region::Region;
use crate::pool_paths;

pub const SIZE_GRANULARITY: u64 = 4096;
pub const MIN_ENTRY_SPACE: u64 = 1024;
pub const MAX_POOL_SIZE: u64 = 8 << 40;
pub const DEFAULT_POOL_SIZE: u64 = 1 << 20;

/// Everything configurable about a pool at creation time.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    size: u64,
    toc_capacity: u64,
    stop_when_full: bool,
    frozen: bool,
    auto_dispose: bool,
    checksum: bool,
    sync: bool,
    mode: Option<u32>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            toc_capacity: 0,
            stop_when_full: false,
            frozen: false,
            auto_dispose: false,
            checksum: false,
            sync: false,
            mode: None,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested record capacity in bytes. The file itself is larger: header
    /// plus capacity, rounded up to the size granularity.
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = bytes;
        self
    }

    /// Number of position-index slots to embed; zero means no index.
    pub fn toc_capacity(mut self, slots: u64) -> Self {
        self.toc_capacity = slots;
        self
    }

    pub fn stop_when_full(mut self, on: bool) -> Self {
        self.stop_when_full = on;
        self
    }

    pub fn frozen(mut self, on: bool) -> Self {
        self.frozen = on;
        self
    }

    pub fn auto_dispose(mut self, on: bool) -> Self {
        self.auto_dispose = on;
        self
    }

    pub fn checksum(mut self, on: bool) -> Self {
        self.checksum = on;
        self
    }

    pub fn sync(mut self, on: bool) -> Self {
        self.sync = on;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    fn flags(&self) -> u64 {
        let mut flags = 0;
        if self.stop_when_full {
            flags |= FLAG_STOP_WHEN_FULL;
        }
        if self.frozen {
            flags |= FLAG_FROZEN;
        }
        if self.auto_dispose {
            flags |= FLAG_AUTO_DISPOSE;
        }
        if self.checksum {
            flags |= FLAG_CHECKSUM;
        }
        if self.sync {
            flags |= FLAG_SYNC;
        }
        flags
    }
}

/// Round a requested record capacity into an actual file size.
pub(crate) fn normalized_file_size(header_size: u64, requested: u64) -> Result<u64, Error> {
    let entry_space = requested.max(MIN_ENTRY_SPACE);
    let raw = header_size.checked_add(entry_space).ok_or_else(|| {
        Error::new(ErrorKind::TooBig).with_message("requested pool size overflows")
    })?;
    let file_size = raw.div_ceil(SIZE_GRANULARITY) * SIZE_GRANULARITY;
    if file_size > MAX_POOL_SIZE {
        return Err(Error::new(ErrorKind::TooBig).with_message(format!(
            "pool of {file_size} bytes exceeds the {MAX_POOL_SIZE}-byte maximum"
        )));
    }
    Ok(file_size)
}

pub struct Pool;

impl Pool {
    /// Create a named pool in the default pool directory.
    pub fn create(name: &str, options: &PoolOptions) -> Result<(), Error> {
        let path = pool_paths::path_for_name(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(parent).with_source(err))?;
        }
        Self::create_at(&path, options)
    }

    pub fn create_at(path: &Path, options: &PoolOptions) -> Result<(), Error> {
        if options.toc_capacity > 0 && options.toc_capacity % 2 != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("index capacity must be a positive even number"));
        }
        let header_size = Layout::Chunked.header_size(options.toc_capacity);
        let file_size = normalized_file_size(header_size, options.size)?;
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                let kind = match err.kind() {
                    std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                    std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                    _ => ErrorKind::Io,
                };
                Error::new(kind).with_path(path).with_source(err)
            })?;

        let initialized = (|| -> Result<(), Error> {
            file.set_len(file_size)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
            let region = Region::map(&file, path)?;
            let (uid, gid) = owner();
            Layout::Chunked.init(
                &region,
                &InitParams {
                    file_size,
                    toc_capacity: options.toc_capacity,
                    flags: options.flags(),
                    lock_key: 0,
                    mode: options.mode.unwrap_or(0o644) as u64,
                    uid,
                    gid,
                },
            )?;
            if let Some(mode) = options.mode {
                apply_mode(path, mode)?;
            }
            Ok(())
        })();

        if let Err(err) = initialized {
            // Never leave a half-born pool on disk.
            let _ = fs::remove_file(path);
            return Err(err);
        }
        Ok(())
    }

    pub fn dispose(name: &str) -> Result<(), Error> {
        Self::dispose_at(&pool_paths::path_for_name(name)?)
    }

    /// Remove the pool and its lock files. Fails `InUse` while any hose is
    /// open in any process.
    pub fn dispose_at(path: &Path) -> Result<(), Error> {
        let mut file = OpenOptions::new().read(true).open(path).map_err(|err| {
            let kind = match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                _ => ErrorKind::Io,
            };
            Error::new(kind).with_path(path).with_source(err)
        })?;
        // A pool we cannot read (future version) is still a pool and still
        // disposable; anything else is off limits.
        match layout::bootstrap(&mut file, path) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WrongVersion => {}
            Err(err) => return Err(err),
        }
        drop(file);

        let claim = claim_exclusive(path)?;
        fs::remove_file(path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        let _ = fs::remove_file(deposit_lock_path(path));
        let _ = fs::remove_file(notify_lock_path(path));
        notify::unlink_for_path(path);
        drop(claim);
        Ok(())
    }
}

#[cfg(unix)]
fn owner() -> (u64, u64) {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    unsafe { (libc::getuid() as u64, libc::getgid() as u64) }
}

#[cfg(not(unix))]
fn owner() -> (u64, u64) {
    (0, 0)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| Error::new(ErrorKind::Permission).with_path(path).with_source(err))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}
