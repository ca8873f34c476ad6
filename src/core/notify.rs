//! Purpose: Best-effort deposit wakeups via per-pool named semaphores.
//! Exports: `WaitOutcome`, `NotifyError`, `PoolSemaphore`, `pool_semaphore_name`,
//! Exports: `arm_for_path`, `post_for_path`, `unlink_for_path`.
//! Role: Optimization for awaiting readers; correctness never depends on it,
//! Role: so waits are bounded polls and every failure degrades to polling.
//! Invariants: Semaphore names derive deterministically from the pool path.
//! Invariants: The await protocol is arm, re-check, then wait; never wait first.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::core::lock::NotifyLock;

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
#[cfg(all(unix, not(target_os = "linux")))]
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Debug)]
pub(crate) enum NotifyError {
    Unavailable,
    Io(io::Error),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Unavailable => write!(f, "notification is unavailable on this system"),
            NotifyError::Io(err) => write!(f, "notification failed: {err}"),
        }
    }
}

pub(crate) trait SemaphoreBackend: Clone {
    type Handle;

    fn open(&self, name: &str) -> Result<Self::Handle, NotifyError>;
    fn post(&self, handle: &Self::Handle) -> Result<(), NotifyError>;
    fn wait(&self, handle: &Self::Handle, timeout: Duration) -> Result<WaitOutcome, NotifyError>;
    fn close(&self, handle: &Self::Handle);
}

pub(crate) struct Semaphore<B: SemaphoreBackend> {
    handle: B::Handle,
    backend: B,
}

impl<B: SemaphoreBackend> Semaphore<B> {
    fn open_with_backend(name: String, backend: B) -> Result<Self, NotifyError> {
        let handle = backend.open(&name)?;
        Ok(Self { handle, backend })
    }

    pub(crate) fn post(&self) -> Result<(), NotifyError> {
        self.backend.post(&self.handle)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        self.backend.wait(&self.handle, timeout)
    }
}

impl<B: SemaphoreBackend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.backend.close(&self.handle);
    }
}

#[derive(Clone)]
pub(crate) struct OsSemaphoreBackend;

#[cfg(unix)]
impl SemaphoreBackend for OsSemaphoreBackend {
    type Handle = *mut libc::sem_t;

    fn open(&self, name: &str) -> Result<Self::Handle, NotifyError> {
        let full = format!("/{name}");
        let c_name = CString::new(full).map_err(|_| NotifyError::Unavailable)?;
        let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t;
        let handle =
            unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, mode as libc::c_uint, 0) };
        if handle == libc::SEM_FAILED {
            return Err(map_sem_error());
        }
        Ok(handle)
    }

    fn post(&self, handle: &Self::Handle) -> Result<(), NotifyError> {
        let rc = unsafe { libc::sem_post(*handle) };
        if rc != 0 {
            return Err(map_sem_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn wait(&self, handle: &Self::Handle, timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        // A real timed wait: the waiter sleeps in the kernel and a post
        // wakes it immediately instead of at the next poll tick.
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(map_sem_error());
        }
        let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
        let deadline = libc::timespec {
            tv_sec: now.tv_sec
                + timeout.as_secs() as libc::time_t
                + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
        };
        loop {
            if unsafe { libc::sem_timedwait(*handle, &deadline) } == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ETIMEDOUT => return Ok(WaitOutcome::TimedOut),
                Some(code) if code == libc::EINTR => continue,
                _ => return Err(map_sem_error_with(err)),
            }
        }
    }

    // Without sem_timedwait the wait degrades to a trywait poll.
    #[cfg(not(target_os = "linux"))]
    fn wait(&self, handle: &Self::Handle, timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        let start = SystemTime::now();
        let poll = Duration::from_millis(5).min(timeout.max(Duration::from_millis(1)));

        loop {
            let rc = unsafe { libc::sem_trywait(*handle) };
            if rc == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN => {
                    let elapsed = start.elapsed().unwrap_or_default();
                    if elapsed >= timeout {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    std::thread::sleep(poll);
                }
                Some(code) if code == libc::EINTR => continue,
                _ => return Err(map_sem_error_with(err)),
            }
        }
    }

    fn close(&self, handle: &Self::Handle) {
        unsafe {
            libc::sem_close(*handle);
        }
    }
}

#[cfg(not(unix))]
impl SemaphoreBackend for OsSemaphoreBackend {
    type Handle = ();

    fn open(&self, _name: &str) -> Result<Self::Handle, NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn post(&self, _handle: &Self::Handle) -> Result<(), NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn wait(&self, _handle: &Self::Handle, _timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn close(&self, _handle: &Self::Handle) {}
}

pub(crate) type PoolSemaphore = Semaphore<OsSemaphoreBackend>;

pub(crate) fn pool_semaphore_name(path: &Path) -> String {
    let bytes = canonical_path_bytes(path);
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("cstn-{hex}")
}

/// Open (arm) the wakeup channel for an await. The caller must re-check for
/// an already-arrived deposit after arming and before waiting; that ordering
/// closes the race where a post lands between the check and the wait.
pub(crate) fn arm_for_path(path: &Path) -> Result<PoolSemaphore, NotifyError> {
    // Creation of the named semaphore is serialized across processes; a
    // handle that cannot take the lock degrades to polling.
    let _lock = NotifyLock::acquire(path).map_err(|_| NotifyError::Unavailable)?;
    let name = pool_semaphore_name(path);
    PoolSemaphore::open_with_backend(name, OsSemaphoreBackend)
}

/// Fire-and-forget wake of everyone awaiting this pool. Called by the
/// depositor after the deposit lock is released.
pub(crate) fn post_for_path(path: &Path) -> Result<(), NotifyError> {
    let semaphore = arm_for_path(path)?;
    semaphore.post()
}

/// Remove the named semaphore when the pool itself is disposed.
pub(crate) fn unlink_for_path(path: &Path) {
    #[cfg(unix)]
    {
        let full = format!("/{}", pool_semaphore_name(path));
        if let Ok(c_name) = CString::new(full) {
            unsafe {
                libc::sem_unlink(c_name.as_ptr());
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn canonical_path_bytes(path: &Path) -> Vec<u8> {
    let resolved = std::fs::canonicalize(path);
    let path = resolved.as_ref().map_or(path, |value| value.as_path());
    #[cfg(unix)]
    {
        path.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        path.to_string_lossy().as_bytes().to_vec()
    }
}

#[cfg(unix)]
fn map_sem_error() -> NotifyError {
    map_sem_error_with(io::Error::last_os_error())
}

#[cfg(unix)]
fn map_sem_error_with(err: io::Error) -> NotifyError {
    match err.raw_os_error() {
        Some(code) if code == libc::ENOSYS || code == libc::ENOTSUP => NotifyError::Unavailable,
        _ => NotifyError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct TestBackend {
        semaphores: Arc<Mutex<HashMap<String, Arc<TestSemaphoreState>>>>,
    }

    struct TestSemaphoreState {
        count: Mutex<u64>,
        ready: Condvar,
    }

    impl TestSemaphoreState {
        fn new() -> Self {
            Self {
                count: Mutex::new(0),
                ready: Condvar::new(),
            }
        }
    }

    impl SemaphoreBackend for TestBackend {
        type Handle = Arc<TestSemaphoreState>;

        fn open(&self, name: &str) -> Result<Self::Handle, NotifyError> {
            let mut guard = self.semaphores.lock().expect("lock");
            Ok(guard
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TestSemaphoreState::new()))
                .clone())
        }

        fn post(&self, handle: &Self::Handle) -> Result<(), NotifyError> {
            let mut count = handle.count.lock().expect("lock");
            *count += 1;
            handle.ready.notify_all();
            Ok(())
        }

        fn wait(
            &self,
            handle: &Self::Handle,
            timeout: Duration,
        ) -> Result<WaitOutcome, NotifyError> {
            let mut count = handle.count.lock().expect("lock");
            if *count > 0 {
                *count -= 1;
                return Ok(WaitOutcome::Signaled);
            }

            let (mut count, result) = handle.ready.wait_timeout(count, timeout).expect("wait");
            if *count > 0 {
                *count -= 1;
                return Ok(WaitOutcome::Signaled);
            }
            if result.timed_out() {
                return Ok(WaitOutcome::TimedOut);
            }
            Ok(WaitOutcome::TimedOut)
        }

        fn close(&self, _handle: &Self::Handle) {}
    }

    #[test]
    fn semaphore_name_is_stable_and_prefixed() {
        let path = Path::new("/tmp/pools/test.cistern");
        let first = pool_semaphore_name(path);
        let second = pool_semaphore_name(path);
        assert_eq!(first, second);
        assert!(first.starts_with("cstn-"));
    }

    #[test]
    fn post_before_wait_is_not_lost() {
        // The arm/re-check/wait protocol relies on posts being sticky: a
        // post that lands before the wait must satisfy it.
        let backend = TestBackend::default();
        let name = pool_semaphore_name(Path::new("test.cistern"));
        let waiter = Semaphore::open_with_backend(name.clone(), backend.clone()).expect("open");
        let poster = Semaphore::open_with_backend(name, backend).expect("open");

        poster.post().expect("post");
        assert_eq!(
            waiter.wait(Duration::from_millis(5)).expect("wait"),
            WaitOutcome::Signaled
        );
        assert_eq!(
            waiter.wait(Duration::from_millis(5)).expect("wait"),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn wait_times_out_without_posts() {
        let backend = TestBackend::default();
        let name = pool_semaphore_name(Path::new("idle.cistern"));
        let sem = Semaphore::open_with_backend(name, backend).expect("open");
        assert_eq!(
            sem.wait(Duration::from_millis(5)).expect("wait"),
            WaitOutcome::TimedOut
        );
    }
}
