//! Purpose: Plan deposit placement and eviction without performing any I/O.
//! Exports: `plan_deposit`, `DepositPlan`, `StoreSnapshot`, `EntryWalker`, `remodulate`.
//! Role: Pure planning layer; `store` applies the plan under the deposit lock.
//! Invariants: No side effects; output depends only on the snapshot and what
//! Invariants: the walker reports about existing entries.
//! Invariants: Planned offsets never decrease: oldest <= new oldest <= write.

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{FLAG_FROZEN, FLAG_STOP_WHEN_FULL};

/// Smallest entry footprint: timestamp, index, minimal record, jumpback.
pub(crate) const MIN_ENTRY_SPAN: u64 = 32;

/// Everything the planner needs to know about the pool, read once under the
/// deposit lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StoreSnapshot {
    pub oldest: u64,
    pub newest: u64,
    pub first_entry: u64,
    pub region_size: u64,
    pub flags: u64,
}

impl StoreSnapshot {
    pub(crate) fn is_empty(&self) -> bool {
        self.newest == 0 || self.newest < self.oldest
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.region_size - self.first_entry
    }

    pub(crate) fn physical(&self, virt: u64) -> u64 {
        virt % self.region_size
    }
}

/// Read access to existing entries; implemented over the mapped region by
/// the store, and over plain tables in tests.
pub(crate) trait EntryWalker {
    /// Total on-disk size of the entry starting at this virtual offset.
    fn entry_span(&self, entry: u64) -> Result<u64, Error>;
    /// Sequence index stored at this virtual offset, `None` when the
    /// position cannot hold an entry.
    fn entry_index(&self, entry: u64) -> Option<u64>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DepositPlan {
    pub write_entry: u64,
    /// Publish before writing entry bytes when `Some`. Equal to `write_entry`
    /// when the incoming entry evicts everything.
    pub new_oldest: Option<u64>,
}

/// Smallest value strictly greater than `above` that is congruent to
/// `offset` modulo `modulo`.
pub(crate) fn remodulate(above: u64, offset: u64, modulo: u64) -> u64 {
    let base = above - (above % modulo) + offset;
    if base > above {
        base
    } else {
        base + modulo
    }
}

pub(crate) fn plan_deposit(
    snap: &StoreSnapshot,
    walker: &dyn EntryWalker,
    entry_size: u64,
    evict_from: Option<u64>,
) -> Result<DepositPlan, Error> {
    if snap.flags & FLAG_FROZEN != 0 {
        return Err(Error::new(ErrorKind::Frozen).with_message("pool is frozen"));
    }
    // An entry must end strictly before the physical end of the region, so
    // the usable capacity is one word short of the entry space.
    if entry_size >= snap.capacity() {
        return Err(Error::new(ErrorKind::TooBig).with_message(format!(
            "entry of {entry_size} bytes exceeds pool capacity of {} bytes",
            snap.capacity() - 8
        )));
    }
    if entry_size % 8 != 0 || entry_size < MIN_ENTRY_SPAN {
        return Err(Error::new(ErrorKind::Internal)
            .with_message(format!("implausible entry size {entry_size}")));
    }

    let mut write = if snap.is_empty() {
        snap.oldest
    } else {
        let span = checked_span(snap, walker, snap.newest)?;
        let write = snap.newest + span;
        if write <= snap.newest {
            return Err(pointer_disorder(snap, "newest entry wraps the offset space"));
        }
        write
    };
    if write < snap.oldest && !snap.is_empty() {
        return Err(pointer_disorder(snap, "write position below oldest"));
    }

    // An entry never reaches the physical end of the region.
    if snap.physical(write) + entry_size >= snap.region_size {
        write = remodulate(write, snap.first_entry, snap.region_size);
    }
    if snap.physical(write) < snap.first_entry {
        return Err(pointer_disorder(snap, "write position inside the header"));
    }

    if snap.is_empty() {
        let new_oldest = if snap.oldest == write { None } else { Some(write) };
        return Ok(DepositPlan {
            write_entry: write,
            new_oldest,
        });
    }

    // Evict every entry whose physical bytes the incoming write overlaps:
    // exactly those a full region-lap behind the write's end.
    let need = write + entry_size;
    if snap.oldest + snap.region_size >= need {
        return Ok(DepositPlan {
            write_entry: write,
            new_oldest: None,
        });
    }
    if snap.flags & FLAG_STOP_WHEN_FULL != 0 {
        return Err(Error::new(ErrorKind::Full)
            .with_message("deposit would evict entries from a stop-when-full pool"));
    }

    let mut cursor = snap.oldest;
    if let Some(hint) = evict_from {
        // Index-accelerated skip: only trusted when the hinted entry is live
        // and itself due for eviction.
        if hint >= snap.oldest && hint <= snap.newest && hint + snap.region_size < need {
            cursor = hint;
        }
    }
    while cursor + snap.region_size < need {
        if cursor >= snap.newest {
            // The incoming entry overwrites literally everything.
            return Ok(DepositPlan {
                write_entry: write,
                new_oldest: Some(write),
            });
        }
        cursor = next_entry(snap, walker, cursor)?;
    }
    if cursor > write {
        return Err(pointer_disorder(snap, "new oldest beyond write position"));
    }
    Ok(DepositPlan {
        write_entry: write,
        new_oldest: Some(cursor),
    })
}

/// Step from one live entry to the next, handling the wrap slack the writer
/// leaves when an entry would not fit before the physical end. The step is
/// verified by sequence-index continuity; under the deposit lock nothing
/// races us, so a mismatch is corruption.
pub(crate) fn next_entry(
    snap: &StoreSnapshot,
    walker: &dyn EntryWalker,
    entry: u64,
) -> Result<u64, Error> {
    let span = checked_span(snap, walker, entry)?;
    let index = walker.entry_index(entry).ok_or_else(|| {
        Error::new(ErrorKind::Corrupt)
            .with_offset(entry)
            .with_message("unreadable entry index")
    })?;
    let next = entry + span;
    if next <= entry {
        return Err(pointer_disorder(snap, "entry span wraps the offset space"));
    }
    // The successor either follows directly or wrapped to the next cycle,
    // leaving slack before the physical end. Try the wrapped position first:
    // the entry at the cycle-start position can only carry the successor
    // index when the walk really is at the end of its cycle.
    let wrapped = remodulate(next, snap.first_entry, snap.region_size);
    if walker.entry_index(wrapped) == Some(index + 1) {
        return Ok(wrapped);
    }
    let straight_fits = snap.physical(next) >= snap.first_entry
        && snap.physical(next) + MIN_ENTRY_SPAN <= snap.region_size;
    if straight_fits && walker.entry_index(next) == Some(index + 1) {
        return Ok(next);
    }
    Err(Error::new(ErrorKind::Corrupt)
        .with_offset(next)
        .with_index(index + 1)
        .with_message("sequence index chain broken while walking entries"))
}

fn checked_span(
    snap: &StoreSnapshot,
    walker: &dyn EntryWalker,
    entry: u64,
) -> Result<u64, Error> {
    let span = walker.entry_span(entry)?;
    if span < MIN_ENTRY_SPAN || span % 8 != 0 || span > snap.capacity() {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_offset(entry)
            .with_message(format!("implausible entry span {span}")));
    }
    Ok(span)
}

fn pointer_disorder(snap: &StoreSnapshot, what: &str) -> Error {
    Error::new(ErrorKind::Corrupt).with_message(format!(
        "{what} (oldest {}, newest {})",
        snap.oldest, snap.newest
    ))
}
