//! Purpose: The hose: a per-handle cursor over one pool.
//! Exports: `Hose`, `Record`, `Timeout`, `OptionToggles`, registry functions.
//! Role: Public face of the engine. Owns the cursor, the shared usage lock,
//! Role: and the await loop; all storage semantics live below in the store.
//! Invariants: A hose registered before `invalidate_all_hoses` refuses every
//! Invariants: subsequent operation; the pool itself is untouched.
//! Invariants: `withdraw` is the only path that may auto-dispose a pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{FLAG_AUTO_DISPOSE, FLAG_FROZEN, FLAG_STOP_WHEN_FULL, FLAG_SYNC};
use crate::core::lock::UsageGuard;
use crate::core::notify;
use crate::core::pool::{normalized_file_size, Pool, PoolOptions};
use crate::core::protein::Protein;
use crate::core::resize;
use crate::core::store::{EntryData, RetryHook, Store, TimeBound};
use crate::core::validate;
use crate::pool_paths;

/// How long an `await_next` is willing to block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timeout {
    Forever,
    Immediate,
    After(Duration),
}

/// How an `await_next` ended: a record arrived, the timeout elapsed, or
/// someone interrupted the wait through a `WakeupHandle`.
#[derive(Clone, Debug)]
pub enum AwaitOutcome {
    Found(Record),
    TimedOut,
    Woken,
}

/// Cloneable handle that interrupts a blocked `await_next` on its hose from
/// another thread. The interrupted await reports `Woken`.
#[derive(Clone)]
pub struct WakeupHandle {
    woken: Arc<AtomicBool>,
    path: PathBuf,
}

impl WakeupHandle {
    pub fn wake(&self) {
        self.woken.store(true, Ordering::SeqCst);
        // Kick the pool's wakeup channel so a blocked wait notices now
        // instead of at the end of its poll slice.
        if let Err(err) = notify::post_for_path(&self.path) {
            tracing::debug!(error = %err, "wakeup post failed");
        }
    }
}

/// One record fetched from a pool.
#[derive(Clone, Debug)]
pub struct Record {
    pub index: u64,
    pub stamp: f64,
    pub protein: Protein,
}

impl Record {
    fn from_entry(data: EntryData) -> Self {
        Self {
            index: data.index,
            stamp: data.stamp,
            protein: data.protein,
        }
    }
}

/// Option changes applicable to a live pool. The checksum flag is absent on
/// purpose: it changes the entry layout and is fixed at creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct OptionToggles {
    pub stop_when_full: Option<bool>,
    pub frozen: Option<bool>,
    pub auto_dispose: Option<bool>,
    pub sync: Option<bool>,
}

// The process-wide hose registry: a generation counter and an open count.
// After a fork, the child calls `invalidate_all_hoses` so inherited hoses
// (whose locks and mappings it shares unsafely) refuse to operate.
static EPOCH: AtomicU64 = AtomicU64::new(0);
static OPEN_HOSES: AtomicU64 = AtomicU64::new(0);

/// Invalidate every hose currently open in this process.
pub fn invalidate_all_hoses() {
    EPOCH.fetch_add(1, Ordering::SeqCst);
}

pub fn open_hose_count() -> u64 {
    OPEN_HOSES.load(Ordering::SeqCst)
}

pub struct Hose {
    store: Store,
    cursor: u64,
    usage: Option<UsageGuard>,
    epoch: u64,
    released: bool,
    woken: Arc<AtomicBool>,
}

impl Hose {
    /// Open a hose on a named pool in the default pool directory.
    pub fn participate(name: &str) -> Result<Self, Error> {
        Self::participate_at(&pool_paths::path_for_name(name)?)
    }

    pub fn participate_at(path: &Path) -> Result<Self, Error> {
        let mut store = Store::open(path)?;
        let usage = UsageGuard::shared(path)?;
        let cursor = store.bounds()?.map(|(oldest, _)| oldest).unwrap_or(0);
        OPEN_HOSES.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            store,
            cursor,
            usage: Some(usage),
            epoch: EPOCH.load(Ordering::SeqCst),
            released: false,
            woken: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Participate, creating the pool first if it does not exist. A racing
    /// creator is fine: whoever loses the create just participates.
    pub fn participate_creatingly(name: &str, options: &PoolOptions) -> Result<Self, Error> {
        match Self::participate(name) {
            Err(err) if err.kind() == ErrorKind::NotFound => match Pool::create(name, options) {
                Ok(()) => Self::participate(name),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => Self::participate(name),
                Err(err) => Err(err),
            },
            other => other,
        }
    }

    fn check_epoch(&self) -> Result<(), Error> {
        if EPOCH.load(Ordering::SeqCst) != self.epoch {
            return Err(Error::new(ErrorKind::Usage)
                .with_path(self.store.path())
                .with_message("hose was invalidated; participate again"));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn deposit(&mut self, protein: &Protein) -> Result<(u64, f64), Error> {
        self.check_epoch()?;
        self.store.deposit(protein)
    }

    pub fn nth(&mut self, index: u64) -> Result<Record, Error> {
        self.check_epoch()?;
        self.store.nth(index).map(Record::from_entry)
    }

    /// The record at the cursor, advancing the cursor past it. A cursor that
    /// fell behind the oldest record skips forward to it.
    pub fn next(&mut self) -> Result<Record, Error> {
        self.check_epoch()?;
        loop {
            let Some((oldest, newest)) = self.store.bounds()? else {
                return Err(no_newer());
            };
            if self.cursor < oldest {
                self.cursor = oldest;
            }
            if self.cursor > newest {
                return Err(no_newer());
            }
            match self.store.nth(self.cursor) {
                Ok(data) => {
                    self.cursor = data.index + 1;
                    return Ok(Record::from_entry(data));
                }
                // Evicted between the bounds check and the read; go again.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// The record just before the cursor, moving the cursor onto it.
    pub fn prev(&mut self) -> Result<Record, Error> {
        self.check_epoch()?;
        loop {
            let Some((oldest, newest)) = self.store.bounds()? else {
                return Err(no_older());
            };
            let ceiling = self.cursor.min(newest + 1);
            if ceiling <= oldest {
                return Err(no_older());
            }
            match self.store.nth(ceiling - 1) {
                Ok(data) => {
                    self.cursor = data.index;
                    return Ok(Record::from_entry(data));
                }
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Wait for a record newer than the cursor. A record that arrived wins
    /// over a pending wakeup; a wakeup wins over the timeout. The wakeup
    /// channel is an optimization: waits are short bounded polls, so a lost
    /// wakeup only costs latency.
    pub fn await_next(&mut self, timeout: Timeout) -> Result<AwaitOutcome, Error> {
        self.check_epoch()?;
        if let Some(record) = self.poll_next()? {
            return Ok(AwaitOutcome::Found(record));
        }
        if self.woken.swap(false, Ordering::SeqCst) {
            return Ok(AwaitOutcome::Woken);
        }
        if matches!(timeout, Timeout::Immediate) {
            return Ok(AwaitOutcome::TimedOut);
        }
        let deadline = match timeout {
            Timeout::After(window) => Some(Instant::now() + window),
            _ => None,
        };
        // Arm before re-checking: a deposit landing after the poll above
        // posts the semaphore we are now holding open.
        let semaphore = notify::arm_for_path(self.store.path()).ok();
        loop {
            if let Some(record) = self.poll_next()? {
                return Ok(AwaitOutcome::Found(record));
            }
            if self.woken.swap(false, Ordering::SeqCst) {
                return Ok(AwaitOutcome::Woken);
            }
            let slice = Duration::from_millis(50);
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(AwaitOutcome::TimedOut);
                    }
                    remaining.min(slice)
                }
                None => slice,
            };
            match &semaphore {
                Some(semaphore) => {
                    let _ = semaphore.wait(wait);
                }
                None => std::thread::sleep(wait.min(Duration::from_millis(5))),
            }
        }
    }

    /// A handle other threads can use to interrupt this hose's `await_next`.
    pub fn wakeup_handle(&self) -> WakeupHandle {
        WakeupHandle {
            woken: self.woken.clone(),
            path: self.store.path().to_path_buf(),
        }
    }

    /// Replace the observer of reader retry loops; tests install a counter.
    pub fn set_retry_hook(&mut self, hook: Arc<dyn RetryHook>) {
        self.store.set_retry_hook(hook);
    }

    fn poll_next(&mut self) -> Result<Option<Record>, Error> {
        match self.next() {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Seek the cursor to the record nearest `stamp` and return it.
    pub fn probe_by_time(&mut self, stamp: f64, bound: TimeBound) -> Result<Record, Error> {
        self.check_epoch()?;
        let index = self.store.probe_by_time(stamp, bound)?;
        let data = self.store.nth(index)?;
        self.cursor = data.index;
        Ok(Record::from_entry(data))
    }

    /// Discard every record with index below `index`.
    pub fn advance_oldest(&mut self, index: u64) -> Result<(), Error> {
        self.check_epoch()?;
        self.store.advance_oldest(index)
    }

    /// Change the pool's record capacity to `size` bytes (rounded the same
    /// way as at creation).
    pub fn resize(&mut self, size: u64) -> Result<(), Error> {
        self.check_epoch()?;
        let file_size = normalized_file_size(self.store.hdr.header_size, size)?;
        resize::resize(&mut self.store, file_size)
    }

    pub fn change_options(&mut self, toggles: OptionToggles) -> Result<(), Error> {
        self.check_epoch()?;
        let mut set = 0u64;
        let mut clear = 0u64;
        for (flag, value) in [
            (FLAG_STOP_WHEN_FULL, toggles.stop_when_full),
            (FLAG_FROZEN, toggles.frozen),
            (FLAG_AUTO_DISPOSE, toggles.auto_dispose),
            (FLAG_SYNC, toggles.sync),
        ] {
            match value {
                Some(true) => set |= flag,
                Some(false) => clear |= flag,
                None => {}
            }
        }
        if set == 0 && clear == 0 {
            return Ok(());
        }
        self.store.change_flags(set, clear).map(|_| ())
    }

    pub fn info(&mut self) -> Result<serde_json::Value, Error> {
        self.check_epoch()?;
        self.store.info()
    }

    /// Full-scan consistency check; returns the live record count.
    pub fn validate(&mut self) -> Result<u64, Error> {
        self.check_epoch()?;
        validate::validate_pool(&mut self.store)
    }

    /// Close the hose. On an auto-dispose pool the last hose out also
    /// disposes it.
    pub fn withdraw(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        OPEN_HOSES.fetch_sub(1, Ordering::SeqCst);
        let auto = self
            .store
            .flags()
            .map(|flags| flags & FLAG_AUTO_DISPOSE != 0)
            .unwrap_or(false);
        let path = self.store.path().to_path_buf();
        // Drop the shared usage lock before probing for exclusivity.
        self.usage = None;
        if auto && EPOCH.load(Ordering::SeqCst) == self.epoch {
            match Pool::dispose_at(&path) {
                Ok(()) => {}
                // Someone else still has it open; they get to be last out.
                Err(err) if err.kind() == ErrorKind::InUse => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Drop for Hose {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::debug!(error = %err, "hose release failed");
        }
    }
}

fn no_newer() -> Error {
    Error::new(ErrorKind::NotFound).with_message("no record newer than the cursor")
}

fn no_older() -> Error {
    Error::new(ErrorKind::NotFound).with_message("no record older than the cursor")
}
