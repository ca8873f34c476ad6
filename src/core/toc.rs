//! Purpose: Maintain the optional position index ("table of contents").
//! Exports: `Toc`, `TocEntry`, `toc_bytes`, `TOC_SIGNATURE`.
//! Role: Accelerates sequence-index and timestamp lookups; every hit is a
//! Role: hint the caller re-validates by walking real entries, never truth.
//! Invariants: Only the depositor (under the deposit lock) mutates the index.
//! Invariants: Recorded indices are `first_index + n * step`; step only doubles.

use crate::core::error::{Error, ErrorKind};
use crate::core::region::Region;

pub(crate) const TOC_SIGNATURE: u64 = 0x00BE_EF00_FEED_0011;

const WORD: u64 = 8;
const HEADER_WORDS: u64 = 6;
const SLOT_WORDS: u64 = 2;

/// Bytes needed to embed an index with the given slot capacity.
pub(crate) fn toc_bytes(capacity: u64) -> u64 {
    (HEADER_WORDS + capacity * SLOT_WORDS) * WORD
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TocEntry {
    pub index: u64,
    pub offset: u64,
    pub stamp: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct TocHeader {
    capacity: u64,
    count: u64,
    start: u64,
    step: u64,
    first_index: u64,
}

/// Handle to an index embedded at a fixed byte offset of the mapped region.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Toc {
    base: u64,
}

impl Toc {
    pub(crate) fn new(base: u64) -> Self {
        Self { base }
    }

    pub(crate) fn init(&self, region: &Region, capacity: u64) -> Result<(), Error> {
        if capacity % 2 != 0 || capacity == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("index capacity must be a positive even number"));
        }
        region.write_u64(self.base, TOC_SIGNATURE)?;
        self.write_header(
            region,
            TocHeader {
                capacity,
                count: 0,
                start: 0,
                step: 1,
                first_index: 0,
            },
        )
    }

    fn read_header(&self, region: &Region) -> Result<TocHeader, Error> {
        if region.read_u64(self.base)? != TOC_SIGNATURE {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_offset(self.base)
                .with_message("position index signature mismatch"));
        }
        let header = TocHeader {
            capacity: region.read_u64(self.base + WORD)?,
            count: region.read_u64(self.base + 2 * WORD)?,
            start: region.read_u64(self.base + 3 * WORD)?,
            step: region.read_u64(self.base + 4 * WORD)?,
            first_index: region.read_u64(self.base + 5 * WORD)?,
        };
        if header.capacity == 0
            || header.capacity % 2 != 0
            || header.count > header.capacity
            || header.start >= header.capacity
            || header.step == 0
        {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_offset(self.base)
                .with_message("position index header out of range"));
        }
        Ok(header)
    }

    fn write_header(&self, region: &Region, header: TocHeader) -> Result<(), Error> {
        region.write_u64(self.base + WORD, header.capacity)?;
        region.write_u64(self.base + 2 * WORD, header.count)?;
        region.write_u64(self.base + 3 * WORD, header.start)?;
        region.write_u64(self.base + 4 * WORD, header.step)?;
        region.write_u64(self.base + 5 * WORD, header.first_index)
    }

    fn slot_offset(&self, header: &TocHeader, n: u64) -> u64 {
        let slot = (header.start + n) % header.capacity;
        self.base + (HEADER_WORDS + slot * SLOT_WORDS) * WORD
    }

    fn read_slot(&self, region: &Region, header: &TocHeader, n: u64) -> Result<TocEntry, Error> {
        let at = self.slot_offset(header, n);
        Ok(TocEntry {
            index: header.first_index + n * header.step,
            offset: region.read_u64(at)?,
            stamp: region.read_f64(at + WORD)?,
        })
    }

    fn write_slot(
        &self,
        region: &Region,
        header: &TocHeader,
        n: u64,
        offset: u64,
        stamp: f64,
    ) -> Result<(), Error> {
        let at = self.slot_offset(header, n);
        region.write_u64(at, offset)?;
        region.write_f64(at + WORD, stamp)
    }

    /// Record a freshly deposited entry. Best effort: callers log failures
    /// and move on, the index is never required for correctness.
    pub(crate) fn append(
        &self,
        region: &Region,
        index: u64,
        offset: u64,
        stamp: f64,
        oldest_offset: u64,
    ) -> Result<(), Error> {
        let mut header = self.read_header(region)?;
        if header.count == 0 {
            header.count = 1;
            header.start = 0;
            header.step = 1;
            header.first_index = index;
            self.write_slot(region, &header, 0, offset, stamp)?;
            return self.write_header(region, header);
        }

        let next = header.first_index + header.count * header.step;
        if index < next {
            // Not on the current stride; already covered.
            return Ok(());
        }
        if index > next {
            // The sequence skipped past us (the pool was emptied); restart.
            header.count = 1;
            header.start = 0;
            header.step = 1;
            header.first_index = index;
            self.write_slot(region, &header, 0, offset, stamp)?;
            return self.write_header(region, header);
        }

        if header.count == header.capacity {
            self.collect_dead(region, &mut header, oldest_offset)?;
        }
        if header.count == header.capacity {
            self.compact(region, &mut header)?;
            // After doubling the stride this index may fall between strides.
            if index != header.first_index + header.count * header.step {
                return self.write_header(region, header);
            }
        }

        self.write_slot(region, &header, header.count, offset, stamp)?;
        header.count += 1;
        self.write_header(region, header)
    }

    /// Drop leading slots whose entries have been evicted. Batched: only runs
    /// when the array is full, so pointer churn stays low.
    fn collect_dead(
        &self,
        region: &Region,
        header: &mut TocHeader,
        oldest_offset: u64,
    ) -> Result<(), Error> {
        let mut dead = 0;
        while dead < header.count {
            let entry = self.read_slot(region, header, dead)?;
            if entry.offset >= oldest_offset {
                break;
            }
            dead += 1;
        }
        if dead > 0 {
            header.start = (header.start + dead) % header.capacity;
            header.count -= dead;
            header.first_index += dead * header.step;
            self.write_header(region, *header)?;
        }
        Ok(())
    }

    /// Keep every other recorded entry and double the stride.
    fn compact(&self, region: &Region, header: &mut TocHeader) -> Result<(), Error> {
        let kept = header.count / 2;
        for n in 0..kept {
            let entry = self.read_slot(region, header, 2 * n)?;
            self.write_slot(region, header, n, entry.offset, entry.stamp)?;
        }
        header.count = kept;
        header.step *= 2;
        self.write_header(region, *header)
    }

    /// Forget everything; used when the resize engine rebuilds the index.
    pub(crate) fn clear(&self, region: &Region) -> Result<(), Error> {
        let mut header = self.read_header(region)?;
        header.count = 0;
        header.start = 0;
        header.step = 1;
        header.first_index = 0;
        self.write_header(region, header)
    }

    /// Greatest recorded entry with index <= `index`, plus the next recorded
    /// entry if any, bracketing the target for a short walk.
    pub(crate) fn find_index(
        &self,
        region: &Region,
        index: u64,
    ) -> Result<Option<(TocEntry, Option<TocEntry>)>, Error> {
        let header = self.read_header(region)?;
        if header.count == 0 || index < header.first_index {
            return Ok(None);
        }
        let n = ((index - header.first_index) / header.step).min(header.count - 1);
        let lower = self.read_slot(region, &header, n)?;
        let upper = if n + 1 < header.count {
            Some(self.read_slot(region, &header, n + 1)?)
        } else {
            None
        };
        // Re-read: a concurrent depositor may have shifted the window while
        // we were reading slots.
        if self.read_header(region)? != header {
            return Ok(None);
        }
        Ok(Some((lower, upper)))
    }

    /// Greatest recorded entry whose offset is below `limit`. The deposit
    /// path uses this to skip ahead when one big deposit evicts many entries.
    pub(crate) fn find_offset_below(
        &self,
        region: &Region,
        limit: u64,
    ) -> Result<Option<TocEntry>, Error> {
        let header = self.read_header(region)?;
        if header.count == 0 {
            return Ok(None);
        }
        // Offsets are virtual and ascend with the recorded index.
        let mut lo = 0u64;
        let mut hi = header.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_slot(region, &header, mid)?.offset < limit {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(None);
        }
        let entry = self.read_slot(region, &header, lo - 1)?;
        if self.read_header(region)? != header {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Binary search for the pair of recorded entries bracketing `stamp`.
    /// Returns (last entry with stamp <= target, first entry after), either
    /// side `None` when the target falls off that end of the index.
    pub(crate) fn find_stamp(
        &self,
        region: &Region,
        stamp: f64,
    ) -> Result<Option<(Option<TocEntry>, Option<TocEntry>)>, Error> {
        let header = self.read_header(region)?;
        if header.count == 0 {
            return Ok(None);
        }
        let mut lo = 0u64;
        let mut hi = header.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.read_slot(region, &header, mid)?;
            if entry.stamp <= stamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let lower = if lo > 0 {
            Some(self.read_slot(region, &header, lo - 1)?)
        } else {
            None
        };
        let upper = if lo < header.count {
            Some(self.read_slot(region, &header, lo)?)
        } else {
            None
        };
        if self.read_header(region)? != header {
            return Ok(None);
        }
        Ok(Some((lower, upper)))
    }

    #[cfg(test)]
    fn snapshot(&self, region: &Region) -> (u64, u64, u64) {
        let header = self.read_header(region).expect("header");
        (header.count, header.step, header.first_index)
    }
}

#[cfg(test)]
mod tests {
    use super::{toc_bytes, Toc};
    use crate::core::region::Region;
    use std::fs::OpenOptions;

    fn scratch(capacity: u64) -> (tempfile::TempDir, Region, Toc) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toc.cistern");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.set_len(toc_bytes(capacity) + 64).expect("len");
        let region = Region::map(&file, &path).expect("map");
        let toc = Toc::new(0);
        toc.init(&region, capacity).expect("init");
        (dir, region, toc)
    }

    #[test]
    fn capacity_must_be_positive_and_even() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toc.cistern");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.set_len(1024).expect("len");
        let region = Region::map(&file, &path).expect("map");
        assert!(Toc::new(0).init(&region, 3).is_err());
        assert!(Toc::new(0).init(&region, 0).is_err());
        assert!(Toc::new(0).init(&region, 4).is_ok());
    }

    #[test]
    fn lookups_bracket_the_target() {
        let (_dir, region, toc) = scratch(8);
        for i in 0..6u64 {
            toc.append(&region, i, 1000 + i * 100, i as f64, 0).expect("append");
        }
        let (lower, upper) = toc.find_index(&region, 3).expect("find").expect("hit");
        assert_eq!(lower.index, 3);
        assert_eq!(lower.offset, 1300);
        assert_eq!(upper.expect("upper").index, 4);

        let (lower, upper) = toc.find_stamp(&region, 2.5).expect("find").expect("hit");
        assert_eq!(lower.expect("lower").index, 2);
        assert_eq!(upper.expect("upper").index, 3);

        assert!(toc.find_index(&region, 99).expect("find").is_some());
        let (lower, _) = toc.find_index(&region, 99).expect("find").expect("hit");
        assert_eq!(lower.index, 5);
    }

    #[test]
    fn full_index_compacts_by_doubling_the_stride() {
        let (_dir, region, toc) = scratch(4);
        for i in 0..4u64 {
            toc.append(&region, i, 1000 + i * 100, i as f64, 0).expect("append");
        }
        assert_eq!(toc.snapshot(&region), (4, 1, 0));
        // No evicted entries, so the fifth append forces compaction.
        toc.append(&region, 4, 1400, 4.0, 0).expect("append");
        let (count, step, first) = toc.snapshot(&region);
        assert_eq!(step, 2);
        assert_eq!(first, 0);
        assert_eq!(count, 3);
        // Recorded indices are now 0, 2, 4.
        let (lower, _) = toc.find_index(&region, 3).expect("find").expect("hit");
        assert_eq!(lower.index, 2);
        assert_eq!(lower.offset, 1200);
    }

    #[test]
    fn dead_slots_are_collected_before_compaction() {
        let (_dir, region, toc) = scratch(4);
        for i in 0..4u64 {
            toc.append(&region, i, 1000 + i * 100, i as f64, 0).expect("append");
        }
        // Entries at offsets below 1200 have been evicted.
        toc.append(&region, 4, 1400, 4.0, 1200).expect("append");
        let (count, step, first) = toc.snapshot(&region);
        assert_eq!(step, 1);
        assert_eq!(first, 2);
        assert_eq!(count, 3);
    }

    #[test]
    fn index_restarts_after_sequence_gap() {
        let (_dir, region, toc) = scratch(8);
        toc.append(&region, 0, 1000, 0.0, 0).expect("append");
        toc.append(&region, 1, 1100, 1.0, 0).expect("append");
        // The pool was emptied and deposits resumed at a later index.
        toc.append(&region, 10, 9000, 10.0, 0).expect("append");
        let (count, step, first) = toc.snapshot(&region);
        assert_eq!((count, step, first), (1, 1, 10));
    }

    #[test]
    fn offset_lookup_returns_greatest_below_limit() {
        let (_dir, region, toc) = scratch(8);
        for i in 0..6u64 {
            toc.append(&region, i, 1000 + i * 100, i as f64, 0).expect("append");
        }
        let hit = toc.find_offset_below(&region, 1250).expect("find").expect("hit");
        assert_eq!(hit.index, 2);
        assert_eq!(hit.offset, 1200);
        assert!(toc.find_offset_below(&region, 1000).expect("find").is_none());
        let top = toc.find_offset_below(&region, u64::MAX).expect("find").expect("hit");
        assert_eq!(top.index, 5);
    }

    #[test]
    fn misses_fall_off_the_ends() {
        let (_dir, region, toc) = scratch(8);
        for i in 5..8u64 {
            toc.append(&region, i, 1000 + i * 100, i as f64, 0).expect("append");
        }
        assert!(toc.find_index(&region, 2).expect("find").is_none());
        let (lower, upper) = toc.find_stamp(&region, 0.5).expect("find").expect("hit");
        assert!(lower.is_none());
        assert_eq!(upper.expect("upper").index, 5);
        let (lower, upper) = toc.find_stamp(&region, 99.0).expect("find").expect("hit");
        assert_eq!(lower.expect("lower").index, 7);
        assert!(upper.is_none());
    }
}
