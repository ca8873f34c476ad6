//! Purpose: Whole-pool consistency scan.
//! Role: Walks every live entry under the deposit lock, re-reading each one
//! Role: through the normal fetch path so checksums and descriptors are
//! Role: verified too.

use crate::core::error::{Error, ErrorKind};
use crate::core::lock::DepositLock;
use crate::core::plan::next_entry;
use crate::core::store::Store;

/// Verify every live entry and return how many there are. The deposit lock
/// is held for the whole scan, so nothing is evicted mid-walk.
pub(crate) fn validate_pool(store: &mut Store) -> Result<u64, Error> {
    let _lock = DepositLock::acquire(store.path())?;
    store.check_size()?;
    let snap = store.snapshot()?;
    if snap.is_empty() {
        return Ok(0);
    }

    let mut count = 0u64;
    let mut cursor = snap.oldest;
    let mut expected: Option<u64> = None;
    loop {
        let data = store.read_entry(cursor)?.ok_or_else(|| {
            Error::new(ErrorKind::Corrupt)
                .with_path(store.path())
                .with_message(format!("entry at offset {cursor} is unreadable"))
        })?;
        if let Some(expected) = expected {
            if data.index != expected {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_path(store.path())
                    .with_message(format!(
                        "sequence skips from {} to {}",
                        expected - 1,
                        data.index
                    )));
            }
        }
        expected = Some(data.index + 1);
        count += 1;
        if cursor == snap.newest {
            return Ok(count);
        }
        cursor = next_entry(&snap, &*store, cursor)?;
    }
}
