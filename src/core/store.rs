//! Purpose: The storage engine proper: lock-free reads and locked deposits
//! Purpose: over one mapped pool file.
//! Exports: `Store`, `EntryData`, `TimeBound`, `RetryHook`.
//! Role: Owns the speculative-read protocol. Readers copy bytes out, then
//! Role: re-validate against the pointer words; a reader that loses the race
//! Role: retries, it never blocks the writer.
//! Invariants: `oldest` is advanced (Release) before an overwrite begins and
//! Invariants: `newest` is advanced (Release) only after the entry is whole.
//! Invariants: Entry bytes under `[oldest, newest]` are immutable.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{
    self, HeaderMap, Layout, FLAG_AUTO_DISPOSE, FLAG_CHECKSUM, FLAG_FROZEN, FLAG_STOP_WHEN_FULL,
    FLAG_SYNC,
};
use crate::core::lock::DepositLock;
use crate::core::notify;
use crate::core::plan::{
    next_entry, plan_deposit, remodulate, EntryWalker, StoreSnapshot, MIN_ENTRY_SPAN,
};
use crate::core::protein::{align8, decode_descriptor, Protein};
use crate::core::region::Region;
use crate::core::toc::Toc;

/// Sequence indices are bounded by one deposit per nanosecond for a century;
/// anything larger is overwritten garbage that cannot be mistaken for a
/// merely stale value.
pub(crate) const MAX_REASONABLE_INDEX: u64 = 3_153_600_000_000_000_000;

const RETRY_LOG_INTERVAL: u64 = 100_000;
/// Reads this close to either end of the window are likely to be evicted or
/// raced soon, so they are not worth caching.
const CACHE_EDGE_MARGIN: u64 = 10;

const TIMESTAMP_OFF: u64 = 0;
const INDEX_OFF: u64 = 8;
const CHECKSUM_OFF: u64 = 16;
const JUMPBACK_LEN: u64 = 8;

/// Observer of reader retry loops. The default logs through `tracing`; tests
/// substitute a counter.
pub trait RetryHook: Send + Sync {
    fn on_retry(&self, op: &'static str, spins: u64);
}

struct TracingRetryHook;

impl RetryHook for TracingRetryHook {
    fn on_retry(&self, op: &'static str, spins: u64) {
        if spins % RETRY_LOG_INTERVAL == 0 {
            tracing::warn!(op, spins, "read keeps losing the race against a writer");
        }
    }
}

struct Spin {
    op: &'static str,
    spins: u64,
    hook: Arc<dyn RetryHook>,
}

impl Spin {
    fn new(op: &'static str, hook: Arc<dyn RetryHook>) -> Self {
        Self { op, spins: 0, hook }
    }

    fn retry(&mut self) {
        self.spins += 1;
        self.hook.on_retry(self.op, self.spins);
        std::hint::spin_loop();
    }
}

/// One record read out of the pool, with its storage metadata.
#[derive(Clone, Debug)]
pub(crate) struct EntryData {
    pub index: u64,
    pub stamp: f64,
    pub protein: Protein,
}

/// How a timestamp probe resolves when no record carries the exact stamp.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeBound {
    /// Whichever neighbor is nearer; ties go to the earlier record.
    Closest,
    /// The latest record at or before the target.
    ClosestLower,
    /// The earliest record at or after the target.
    ClosestHigher,
}

#[derive(Clone, Copy, Debug)]
struct Window {
    oldest: u64,
    oldest_index: u64,
    newest: u64,
    newest_index: u64,
}

pub(crate) struct Store {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) region: Region,
    pub(crate) hdr: HeaderMap,
    cache: Option<(u64, u64)>,
    hook: Arc<dyn RetryHook>,
}

impl Store {
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                let kind = match err.kind() {
                    std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                    std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                    _ => ErrorKind::Io,
                };
                Error::new(kind).with_path(path).with_source(err)
            })?;
        let boot = layout::bootstrap(&mut file, path)?;
        let region = Region::map(&file, path)?;
        // The file may have been resized between the head read and the map.
        if region.len() != boot.file_size || boot.header_size > boot.file_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_path(path)
                .with_message("pool changed size while being opened"));
        }
        let hdr = boot.layout.read(&region, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            region,
            hdr,
            cache: None,
            hook: Arc::new(TracingRetryHook),
        })
    }

    pub(crate) fn set_retry_hook(&mut self, hook: Arc<dyn RetryHook>) {
        self.hook = hook;
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn layout(&self) -> Layout {
        self.hdr.layout
    }

    /// Live feature flags; legacy pools have no flag word.
    pub(crate) fn flags(&self) -> Result<u64, Error> {
        match self.hdr.conf {
            Some(conf) => self.region.load(conf.flags_at),
            None => Ok(self.hdr.flags),
        }
    }

    /// Bytes per entry before the record itself.
    fn record_off(&self) -> u64 {
        if self.hdr.flags & FLAG_CHECKSUM != 0 {
            CHECKSUM_OFF + 8
        } else {
            CHECKSUM_OFF
        }
    }

    /// Another process may have resized the pool; the configured size is the
    /// truth and a stale mapping must be replaced before any offset math.
    pub(crate) fn check_size(&mut self) -> Result<(), Error> {
        let Some(conf) = self.hdr.conf else {
            return Ok(());
        };
        if self.region.load(conf.file_size_at)? != self.region.len() {
            self.remap()?;
        }
        Ok(())
    }

    pub(crate) fn remap(&mut self) -> Result<(), Error> {
        self.region = Region::map(&self.file, &self.path)?;
        self.hdr = self.hdr.layout.read(&self.region, &self.path)?;
        self.cache = None;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Result<StoreSnapshot, Error> {
        Ok(StoreSnapshot {
            oldest: self.region.load(self.hdr.oldest_at)?,
            newest: self.region.load(self.hdr.newest_at)?,
            first_entry: self.hdr.header_size,
            region_size: self.region.len(),
            flags: self.flags()?,
        })
    }

    fn next_index(&self, snap: &StoreSnapshot) -> Result<u64, Error> {
        if let Some(conf) = self.hdr.conf {
            return self.region.load(conf.next_index_at);
        }
        // Legacy pools never persist the counter; derive it from the newest
        // entry, whose bytes are intact under the deposit lock.
        if snap.newest == 0 {
            return Ok(0);
        }
        match self.index_at(snap.newest)? {
            Some(index) if index <= MAX_REASONABLE_INDEX => Ok(index + 1),
            _ => Err(Error::new(ErrorKind::Corrupt)
                .with_path(&self.path)
                .with_offset(snap.newest)
                .with_message("newest entry has no plausible sequence index")),
        }
    }

    fn set_next_index(&self, value: u64) -> Result<(), Error> {
        if let Some(conf) = self.hdr.conf {
            self.region.store(conf.next_index_at, value)?;
        }
        Ok(())
    }

    // Light probes. Each reads one word without validating the whole entry;
    // `None` means the position cannot hold an entry at all.

    fn index_at(&self, entry: u64) -> Result<Option<u64>, Error> {
        let size = self.region.len();
        let p = entry % size;
        if p < self.hdr.header_size || p + MIN_ENTRY_SPAN > size {
            return Ok(None);
        }
        Ok(Some(self.region.read_u64(p + INDEX_OFF)?))
    }

    fn stamp_at(&self, entry: u64) -> Result<Option<f64>, Error> {
        let size = self.region.len();
        let p = entry % size;
        if p < self.hdr.header_size || p + MIN_ENTRY_SPAN > size {
            return Ok(None);
        }
        Ok(Some(self.region.read_f64(p + TIMESTAMP_OFF)?))
    }

    fn span_at(&self, entry: u64) -> Result<Option<u64>, Error> {
        let size = self.region.len();
        let p = entry % size;
        if p < self.hdr.header_size || p + MIN_ENTRY_SPAN > size {
            return Ok(None);
        }
        let word = self.region.read_u64(p + self.record_off())?;
        let Ok(wire) = decode_descriptor(word) else {
            return Ok(None);
        };
        let span = self.record_off() + align8(wire) + JUMPBACK_LEN;
        if p + span >= size {
            return Ok(None);
        }
        Ok(Some(span))
    }

    fn in_window(&self, entry: u64) -> Result<bool, Error> {
        let oldest = self.region.load(self.hdr.oldest_at)?;
        let newest = self.region.load(self.hdr.newest_at)?;
        Ok(newest != 0 && oldest <= newest && entry >= oldest && entry <= newest)
    }

    /// A coherent view of the live window, or `None` when the pool is empty.
    /// The pointer words are re-read after the index probes; since they only
    /// ever grow, an unchanged pair proves the probed entries were live.
    fn window(&self, spin: &mut Spin) -> Result<Option<Window>, Error> {
        loop {
            let oldest = self.region.load(self.hdr.oldest_at)?;
            let newest = self.region.load(self.hdr.newest_at)?;
            if newest == 0 || newest < oldest {
                return Ok(None);
            }
            let oldest_index = self.index_at(oldest)?;
            let newest_index = self.index_at(newest)?;
            // The probes must complete before the pointer re-read vouches
            // for them.
            fence(Ordering::SeqCst);
            if self.region.load(self.hdr.oldest_at)? != oldest
                || self.region.load(self.hdr.newest_at)? != newest
            {
                spin.retry();
                continue;
            }
            let (oldest_index, newest_index) = match (oldest_index, newest_index) {
                (Some(o), Some(n)) => (o, n),
                _ => {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_path(&self.path)
                        .with_message("live pointer outside the entry space"))
                }
            };
            if oldest_index > MAX_REASONABLE_INDEX || newest_index > MAX_REASONABLE_INDEX {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_path(&self.path)
                    .with_message("sequence index exceeds the plausible ceiling"));
            }
            if newest_index < oldest_index {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_path(&self.path)
                    .with_message("pointer indices out of order"));
            }
            return Ok(Some(Window {
                oldest,
                oldest_index,
                newest,
                newest_index,
            }));
        }
    }

    /// Speculatively copy out the entry at `entry`. `Ok(None)` means the
    /// entry was overwritten mid-read (retry); a validation failure on an
    /// entry that stayed live the whole time is real corruption.
    pub(crate) fn read_entry(&self, entry: u64) -> Result<Option<EntryData>, Error> {
        let size = self.region.len();
        let first = self.hdr.header_size;
        let p = entry % size;
        if p < first || p + MIN_ENTRY_SPAN > size {
            return Ok(None);
        }
        let record_off = self.record_off();
        let stamp = self.region.read_f64(p + TIMESTAMP_OFF)?;
        let index = self.region.read_u64(p + INDEX_OFF)?;
        let expected_sum = if self.hdr.flags & FLAG_CHECKSUM != 0 {
            Some(self.region.read_u64(p + CHECKSUM_OFF)?)
        } else {
            None
        };
        let wire = match decode_descriptor(self.region.read_u64(p + record_off)?) {
            Ok(wire) => wire,
            Err(err) => return self.fail_or_stompled(entry, err),
        };
        let span = record_off + align8(wire) + JUMPBACK_LEN;
        if p + span >= size {
            return self.fail_or_stompled(
                entry,
                Error::new(ErrorKind::Corrupt).with_message("record reaches past the region end"),
            );
        }
        let mut record = vec![0u8; wire as usize];
        self.region.read_bytes(p + record_off, &mut record)?;
        let jumpback = self.region.read_u64(p + span - JUMPBACK_LEN)?;
        if jumpback != span {
            return self.fail_or_stompled(
                entry,
                Error::new(ErrorKind::Corrupt)
                    .with_message("entry size and trailing jumpback disagree"),
            );
        }
        // Everything is copied out; if the entry is still live, none of it
        // was torn by a concurrent overwrite. The fence keeps the copies
        // above from drifting past the pointer loads that vouch for them.
        fence(Ordering::SeqCst);
        if !self.in_window(entry)? {
            return Ok(None);
        }
        if index > MAX_REASONABLE_INDEX {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_path(&self.path)
                .with_offset(entry)
                .with_message("sequence index exceeds the plausible ceiling"));
        }
        if let Some(sum) = expected_sum {
            if entry_checksum(&record, stamp, index) != sum {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_path(&self.path)
                    .with_offset(entry)
                    .with_index(index)
                    .with_message("record checksum mismatch"));
            }
        }
        let protein = Protein::decode(&record).map_err(|err| err.with_offset(entry))?;
        Ok(Some(EntryData {
            index,
            stamp,
            protein,
        }))
    }

    fn fail_or_stompled(&self, entry: u64, err: Error) -> Result<Option<EntryData>, Error> {
        if self.in_window(entry)? {
            Err(err.with_path(&self.path).with_offset(entry))
        } else {
            Ok(None)
        }
    }

    /// Reader-side forward step; `None` when the chain cannot be followed
    /// (the walk raced an overwrite and must re-anchor).
    fn hop_forward(&self, entry: u64, index: u64) -> Result<Option<u64>, Error> {
        let size = self.region.len();
        let first = self.hdr.header_size;
        let Some(span) = self.span_at(entry)? else {
            return Ok(None);
        };
        let Some(next) = entry.checked_add(span) else {
            return Ok(None);
        };
        let wrapped = remodulate(next, first, size);
        if self.index_at(wrapped)? == Some(index + 1) {
            return Ok(Some(wrapped));
        }
        let p = next % size;
        if p >= first && p + MIN_ENTRY_SPAN <= size && self.index_at(next)? == Some(index + 1) {
            return Ok(Some(next));
        }
        Ok(None)
    }

    /// Reader-side backward step via the trailing jumpback word. Only valid
    /// between physically adjacent entries: at a cycle start the word before
    /// the entry is wrap slack, so the walk gives up and re-anchors forward.
    fn hop_back(&self, entry: u64, index: u64) -> Result<Option<u64>, Error> {
        if index == 0 {
            return Ok(None);
        }
        let size = self.region.len();
        let first = self.hdr.header_size;
        let p = entry % size;
        if p < first + MIN_ENTRY_SPAN || p + MIN_ENTRY_SPAN > size {
            return Ok(None);
        }
        let jumpback = self.region.read_u64(p - JUMPBACK_LEN)?;
        if jumpback < MIN_ENTRY_SPAN || jumpback % 8 != 0 || jumpback > p - first {
            return Ok(None);
        }
        let prev = entry - jumpback;
        if self.index_at(prev)? == Some(index - 1) {
            return Ok(Some(prev));
        }
        Ok(None)
    }

    fn remember(&mut self, index: u64, entry: u64, win: &Window) {
        if index >= win.oldest_index + CACHE_EDGE_MARGIN
            && index + CACHE_EDGE_MARGIN <= win.newest_index
        {
            self.cache = Some((index, entry));
        }
    }

    /// Fetch the record with sequence index `index`. Retries until it reads
    /// a coherent copy or can prove the record is gone.
    pub(crate) fn nth(&mut self, index: u64) -> Result<EntryData, Error> {
        let mut spin = Spin::new("nth", self.hook.clone());
        let mut force_forward = false;
        loop {
            self.check_size()?;
            let Some(win) = self.window(&mut spin)? else {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_index(index)
                    .with_message("pool is empty"));
            };
            if index < win.oldest_index {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_index(index)
                    .with_message("record has been discarded"));
            }
            if index > win.newest_index {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_index(index)
                    .with_message("record has not been deposited yet"));
            }

            let (mut aidx, mut aoff) = self.pick_anchor(index, &win, force_forward)?;
            let mut lost = false;
            while aidx != index {
                let hop = if aidx < index {
                    self.hop_forward(aoff, aidx)?
                } else {
                    self.hop_back(aoff, aidx)?
                };
                match hop {
                    Some(next) => {
                        aoff = next;
                        aidx = if aidx < index { aidx + 1 } else { aidx - 1 };
                    }
                    None => {
                        lost = true;
                        break;
                    }
                }
            }
            if lost {
                // A failed backward walk may have hit a cycle start rather
                // than a racing writer; approach from the oldest end instead.
                force_forward = aidx > index;
                spin.retry();
                continue;
            }
            match self.read_entry(aoff)? {
                Some(data) if data.index == index => {
                    self.remember(index, aoff, &win);
                    return Ok(data);
                }
                _ => {
                    spin.retry();
                    continue;
                }
            }
        }
    }

    /// Start the walk from whichever known position is closest in sequence
    /// distance: a window end, the per-handle cache, or an index hit.
    fn pick_anchor(
        &self,
        index: u64,
        win: &Window,
        force_forward: bool,
    ) -> Result<(u64, u64), Error> {
        let mut anchor = (win.oldest_index, win.oldest);
        if force_forward {
            return Ok(anchor);
        }
        let mut best = index - win.oldest_index;
        if win.newest_index - index < best {
            best = win.newest_index - index;
            anchor = (win.newest_index, win.newest);
        }
        if let Some((cidx, coff)) = self.cache {
            if cidx >= win.oldest_index
                && cidx <= win.newest_index
                && coff >= win.oldest
                && coff <= win.newest
                && cidx.abs_diff(index) < best
            {
                best = cidx.abs_diff(index);
                anchor = (cidx, coff);
            }
        }
        if let Some(base) = self.hdr.toc_base {
            match Toc::new(base).find_index(&self.region, index) {
                Ok(Some((lower, _))) => {
                    if lower.index >= win.oldest_index
                        && lower.index <= win.newest_index
                        && lower.offset >= win.oldest
                        && lower.offset <= win.newest
                        && lower.index.abs_diff(index) < best
                    {
                        anchor = (lower.index, lower.offset);
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(error = %err, "position index lookup failed"),
            }
        }
        Ok(anchor)
    }

    /// Current sequence bounds, `None` when the pool is empty.
    pub(crate) fn bounds(&mut self) -> Result<Option<(u64, u64)>, Error> {
        self.check_size()?;
        let mut spin = Spin::new("bounds", self.hook.clone());
        Ok(self
            .window(&mut spin)?
            .map(|win| (win.oldest_index, win.newest_index)))
    }

    pub(crate) fn deposit(&mut self, protein: &Protein) -> Result<(u64, f64), Error> {
        self.deposit_at(protein, wall_clock())
    }

    pub(crate) fn deposit_at(&mut self, protein: &Protein, stamp: f64) -> Result<(u64, f64), Error> {
        let lock = DepositLock::acquire(&self.path)?;
        self.check_size()?;
        let snap = self.snapshot()?;
        let record = protein.encode();
        let record_off = self.record_off();
        let entry_size = record_off + record.len() as u64 + JUMPBACK_LEN;

        let hint = self.evict_hint(&snap, entry_size)?;
        let plan = plan_deposit(&snap, &*self, entry_size, hint)?;
        let index = self.next_index(&snap)?;

        // Readers between the two pointer publications see a smaller window,
        // never a corrupt one: oldest moves forward before its bytes are
        // touched, newest moves only once the entry is complete.
        if let Some(new_oldest) = plan.new_oldest {
            self.region.store(self.hdr.oldest_at, new_oldest)?;
        }
        // The entry bytes below are plain writes; without a full fence they
        // could become visible before the oldest advance that retires the
        // space they land in.
        fence(Ordering::SeqCst);
        let p = snap.physical(plan.write_entry);
        self.region.write_f64(p + TIMESTAMP_OFF, stamp)?;
        self.region.write_u64(p + INDEX_OFF, index)?;
        if self.hdr.flags & FLAG_CHECKSUM != 0 {
            let wire = protein.wire_len() as usize;
            self.region
                .write_u64(p + CHECKSUM_OFF, entry_checksum(&record[..wire], stamp, index))?;
        }
        self.region.write_bytes(p + record_off, &record)?;
        self.region
            .write_u64(p + entry_size - JUMPBACK_LEN, entry_size)?;
        if snap.flags & FLAG_SYNC != 0 {
            self.region.flush_range(p, entry_size)?;
        }
        self.region.store(self.hdr.newest_at, plan.write_entry)?;
        self.set_next_index(index + 1)?;

        if let Some(base) = self.hdr.toc_base {
            let oldest_now = plan.new_oldest.unwrap_or(snap.oldest);
            if let Err(err) =
                Toc::new(base).append(&self.region, index, plan.write_entry, stamp, oldest_now)
            {
                tracing::debug!(error = %err, "position index append failed");
            }
        }
        drop(lock);
        if let Err(err) = notify::post_for_path(&self.path) {
            tracing::debug!(error = %err, "deposit wakeup failed");
        }
        Ok((index, stamp))
    }

    /// Ask the position index where a bulk eviction should start walking.
    fn evict_hint(&self, snap: &StoreSnapshot, entry_size: u64) -> Result<Option<u64>, Error> {
        let Some(base) = self.hdr.toc_base else {
            return Ok(None);
        };
        if snap.is_empty() || entry_size >= snap.capacity() {
            return Ok(None);
        }
        let Some(span) = self.span_at(snap.newest)? else {
            return Ok(None);
        };
        let mut write = snap.newest + span;
        if snap.physical(write) + entry_size >= snap.region_size {
            write = remodulate(write, snap.first_entry, snap.region_size);
        }
        let need = write + entry_size;
        if snap.oldest + snap.region_size >= need {
            return Ok(None);
        }
        match Toc::new(base).find_offset_below(&self.region, need - snap.region_size) {
            Ok(hit) => Ok(hit.map(|entry| entry.offset)),
            Err(err) => {
                tracing::debug!(error = %err, "position index hint failed");
                Ok(None)
            }
        }
    }

    /// Discard every record with index below `target`. Advancing to exactly
    /// `newest + 1` empties the pool; further than that is an error.
    pub(crate) fn advance_oldest(&mut self, target: u64) -> Result<(), Error> {
        let _lock = DepositLock::acquire(&self.path)?;
        self.check_size()?;
        let snap = self.snapshot()?;
        if snap.is_empty() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_index(target)
                .with_message("pool is empty"));
        }
        // Under the deposit lock the pointers hold still, so these reads are
        // authoritative.
        let oldest_index = self.checked_index(snap.oldest)?;
        let newest_index = self.checked_index(snap.newest)?;
        if target <= oldest_index {
            return Ok(());
        }
        if target == newest_index + 1 {
            // Empty the pool: park oldest one whole cycle ahead, a state the
            // deposit planner recognizes as "temporarily empty".
            let parked = remodulate(snap.newest, snap.first_entry, snap.region_size);
            self.region.store(self.hdr.oldest_at, parked)?;
            if self.hdr.conf.is_some() {
                // The sequence counter lives in the configuration chunk, so
                // newest can drop back to the truly-empty sentinel. Legacy
                // pools keep it: the counter is derived from its entry.
                self.region.store(self.hdr.newest_at, 0)?;
            }
            return Ok(());
        }
        if target > newest_index {
            return Err(Error::new(ErrorKind::NotFound)
                .with_index(target)
                .with_message("cannot advance past the newest record"));
        }
        let mut cursor = snap.oldest;
        let mut index = oldest_index;
        while index < target {
            cursor = next_entry(&snap, &*self, cursor)?;
            index += 1;
        }
        self.region.store(self.hdr.oldest_at, cursor)
    }

    fn checked_index(&self, entry: u64) -> Result<u64, Error> {
        match self.index_at(entry)? {
            Some(index) if index <= MAX_REASONABLE_INDEX => Ok(index),
            _ => Err(Error::new(ErrorKind::Corrupt)
                .with_path(&self.path)
                .with_offset(entry)
                .with_message("entry has no plausible sequence index")),
        }
    }

    /// Find the record nearest `target` seconds-since-epoch, resolved per
    /// `bound`. Returns the record's sequence index.
    pub(crate) fn probe_by_time(&mut self, target: f64, bound: TimeBound) -> Result<u64, Error> {
        let mut spin = Spin::new("probe_by_time", self.hook.clone());
        'outer: loop {
            self.check_size()?;
            let Some(win) = self.window(&mut spin)? else {
                return Err(Error::new(ErrorKind::NotFound).with_message("pool is empty"));
            };
            let mut aidx = win.oldest_index;
            let mut aoff = win.oldest;
            if let Some(base) = self.hdr.toc_base {
                if let Ok(Some((Some(lower), _))) =
                    Toc::new(base).find_stamp(&self.region, target)
                {
                    if lower.index >= win.oldest_index
                        && lower.index <= win.newest_index
                        && lower.offset >= win.oldest
                        && lower.offset <= win.newest
                    {
                        aidx = lower.index;
                        aoff = lower.offset;
                    }
                }
            }

            let mut below: Option<(u64, f64)> = None;
            let mut above: Option<(u64, f64)> = None;
            loop {
                let Some(stamp) = self.stamp_at(aoff)? else {
                    spin.retry();
                    continue 'outer;
                };
                fence(Ordering::SeqCst);
                if !self.in_window(aoff)? {
                    spin.retry();
                    continue 'outer;
                }
                if stamp <= target {
                    below = Some((aidx, stamp));
                } else {
                    above = Some((aidx, stamp));
                    break;
                }
                if aidx == win.newest_index {
                    break;
                }
                match self.hop_forward(aoff, aidx)? {
                    Some(next) => {
                        aoff = next;
                        aidx += 1;
                    }
                    None => {
                        spin.retry();
                        continue 'outer;
                    }
                }
            }

            let hit = match bound {
                TimeBound::ClosestLower => below.map(|(index, _)| index),
                TimeBound::ClosestHigher => match (below, above) {
                    (Some((index, stamp)), _) if stamp == target => Some(index),
                    (_, Some((index, _))) => Some(index),
                    _ => None,
                },
                TimeBound::Closest => match (below, above) {
                    (Some((bi, bs)), Some((ai, as_))) => {
                        Some(if as_ - target >= target - bs { bi } else { ai })
                    }
                    (Some((index, _)), None) | (None, Some((index, _))) => Some(index),
                    (None, None) => None,
                },
            };
            return hit.ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("no record bounds timestamp {target}"))
            });
        }
    }

    /// Atomically update the option flags. Fails on legacy pools, which have
    /// no flag word to update.
    pub(crate) fn change_flags(&self, set: u64, clear: u64) -> Result<u64, Error> {
        let Some(conf) = self.hdr.conf else {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_path(&self.path)
                .with_message("legacy pools have no adjustable options"));
        };
        let atom = self.region.atomic(conf.flags_at)?;
        let mut flags = atom.load(Ordering::Acquire);
        loop {
            let next = (flags & !clear) | set;
            match atom.compare_exchange(flags, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(next),
                Err(actual) => flags = actual,
            }
        }
    }

    pub(crate) fn info(&mut self) -> Result<serde_json::Value, Error> {
        self.check_size()?;
        let snap = self.snapshot()?;
        let mut spin = Spin::new("info", self.hook.clone());
        let win = self.window(&mut spin)?;
        let flags = snap.flags;
        let permissions = match self.hdr.perm {
            Some(perm) => json!({
                "mode": format!("{:o}", self.region.read_u64(perm.mode_at)?),
                "uid": self.region.read_u64(perm.uid_at)?,
                "gid": self.region.read_u64(perm.gid_at)?,
            }),
            None => serde_json::Value::Null,
        };
        Ok(json!({
            "path": self.path.display().to_string(),
            "layout": match self.hdr.layout {
                Layout::Chunked => "chunked",
                Layout::Legacy => "legacy",
            },
            "file_size": self.hdr.file_size,
            "header_size": snap.first_entry,
            "capacity": snap.capacity() - 8,
            "indexed": self.hdr.toc_base.is_some(),
            "permissions": permissions,
            "options": {
                "stop_when_full": flags & FLAG_STOP_WHEN_FULL != 0,
                "frozen": flags & FLAG_FROZEN != 0,
                "auto_dispose": flags & FLAG_AUTO_DISPOSE != 0,
                "checksum": flags & FLAG_CHECKSUM != 0,
                "sync": flags & FLAG_SYNC != 0,
            },
            "oldest_index": win.map(|w| w.oldest_index),
            "newest_index": win.map(|w| w.newest_index),
            "record_count": win.map(|w| w.newest_index - w.oldest_index + 1).unwrap_or(0),
        }))
    }
}

impl EntryWalker for Store {
    fn entry_span(&self, entry: u64) -> Result<u64, Error> {
        match self.span_at(entry) {
            Ok(Some(span)) => Ok(span),
            Ok(None) => Err(Error::new(ErrorKind::Corrupt)
                .with_path(&self.path)
                .with_offset(entry)
                .with_message("live entry has no readable span")),
            Err(err) => Err(err),
        }
    }

    fn entry_index(&self, entry: u64) -> Option<u64> {
        self.index_at(entry).ok().flatten()
    }
}

/// First eight bytes of a SHA-256 over the record and its metadata.
fn entry_checksum(record: &[u8], stamp: f64, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(record);
    hasher.update(stamp.to_bits().to_le_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::{Store, TimeBound};
    use crate::core::error::ErrorKind;
    use crate::core::layout::{
        InitParams, Layout, FLAG_CHECKSUM, FLAG_FROZEN, FLAG_STOP_WHEN_FULL,
    };
    use crate::core::protein::Protein;
    use crate::core::region::Region;
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    fn make_pool(
        dir: &tempfile::TempDir,
        name: &str,
        file_size: u64,
        toc_capacity: u64,
        flags: u64,
    ) -> PathBuf {
        let path = dir.path().join(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.set_len(file_size).expect("len");
        let region = Region::map(&file, &path).expect("map");
        Layout::Chunked
            .init(
                &region,
                &InitParams {
                    file_size,
                    toc_capacity,
                    flags,
                    lock_key: 0,
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                },
            )
            .expect("init");
        path
    }

    fn record(text: &str) -> Protein {
        Protein::from_payload(text.as_bytes().to_vec()).expect("protein")
    }

    #[test]
    fn deposit_and_fetch_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "basic.cistern", 4096, 0, 0);
        let mut store = Store::open(&path).expect("open");

        for i in 0..5u64 {
            let (index, _) = store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
            assert_eq!(index, i);
        }
        for i in 0..5u64 {
            let data = store.nth(i).expect("nth");
            assert_eq!(data.index, i);
            assert_eq!(data.protein.payload(), format!("record-{i:02}").as_bytes());
        }
        assert_eq!(store.bounds().expect("bounds"), Some((0, 4)));

        // The sequence counter survives reopening.
        drop(store);
        let mut store = Store::open(&path).expect("reopen");
        let (index, _) = store.deposit(&record("record-05")).expect("deposit");
        assert_eq!(index, 5);
    }

    #[test]
    fn wraparound_discards_the_oldest_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Header is 144 bytes; each "record-NN" entry occupies 48, so the
        // 152-byte entry space holds three entries once wrapped.
        let path = make_pool(&dir, "wrap.cistern", 296, 0, 0);
        let mut store = Store::open(&path).expect("open");

        for i in 0..10u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }
        assert_eq!(store.bounds().expect("bounds"), Some((7, 9)));
        for i in 7..10u64 {
            let data = store.nth(i).expect("nth");
            assert_eq!(data.protein.payload(), format!("record-{i:02}").as_bytes());
        }
        let err = store.nth(6).expect_err("discarded");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.nth(10).expect_err("future");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn oversized_deposit_leaves_the_pool_intact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "big.cistern", 296, 0, 0);
        let mut store = Store::open(&path).expect("open");
        store.deposit(&record("record-00")).expect("deposit");

        let err = store
            .deposit(&record(&"x".repeat(200)))
            .expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::TooBig);
        assert_eq!(store.bounds().expect("bounds"), Some((0, 0)));
        assert_eq!(store.nth(0).expect("nth").protein.payload(), b"record-00");
    }

    #[test]
    fn frozen_pool_rejects_deposits_until_thawed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "frozen.cistern", 4096, 0, 0);
        let mut store = Store::open(&path).expect("open");
        store.deposit(&record("before")).expect("deposit");

        store.change_flags(FLAG_FROZEN, 0).expect("freeze");
        let err = store.deposit(&record("during")).expect_err("frozen");
        assert_eq!(err.kind(), ErrorKind::Frozen);
        assert_eq!(store.bounds().expect("bounds"), Some((0, 0)));

        store.change_flags(0, FLAG_FROZEN).expect("thaw");
        let (index, _) = store.deposit(&record("after")).expect("deposit");
        assert_eq!(index, 1);
    }

    #[test]
    fn stop_when_full_fails_instead_of_evicting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "full.cistern", 296, 0, FLAG_STOP_WHEN_FULL);
        let mut store = Store::open(&path).expect("open");

        for i in 0..3u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }
        let err = store.deposit(&record("record-03")).expect_err("full");
        assert_eq!(err.kind(), ErrorKind::Full);
        assert_eq!(store.bounds().expect("bounds"), Some((0, 2)));
    }

    #[test]
    fn checksum_catches_silent_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "sum.cistern", 4096, 0, FLAG_CHECKSUM);
        let mut store = Store::open(&path).expect("open");
        store.deposit(&record("hello")).expect("deposit");
        assert_eq!(store.nth(0).expect("nth").protein.payload(), b"hello");

        // First entry at physical 144; its payload starts after the 24-byte
        // preamble and the 8-byte record descriptor.
        store.region.write_bytes(144 + 24 + 8, &[0xFF]).expect("clobber");
        let err = store.nth(0).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn advance_oldest_discards_empties_and_bounds_checks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "adv.cistern", 4096, 0, 0);
        let mut store = Store::open(&path).expect("open");
        for i in 0..5u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }

        store.advance_oldest(3).expect("advance");
        assert_eq!(store.bounds().expect("bounds"), Some((3, 4)));
        assert_eq!(store.nth(2).expect_err("discarded").kind(), ErrorKind::NotFound);
        assert_eq!(store.nth(3).expect("nth").index, 3);

        // Already behind oldest: a no-op, not an error.
        store.advance_oldest(1).expect("no-op");
        assert_eq!(store.bounds().expect("bounds"), Some((3, 4)));

        // Past newest + 1 is unreachable.
        let err = store.advance_oldest(9).expect_err("past newest");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Exactly newest + 1 empties the pool; deposits then resume with the
        // sequence intact.
        store.advance_oldest(5).expect("empty");
        assert_eq!(store.bounds().expect("bounds"), None);
        let (index, _) = store.deposit(&record("record-05")).expect("deposit");
        assert_eq!(index, 5);
        assert_eq!(store.bounds().expect("bounds"), Some((5, 5)));
    }

    #[test]
    fn indexed_pool_reads_match_linear_expectation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "toc.cistern", 8192, 16, 0);
        let mut store = Store::open(&path).expect("open");
        for i in 0..60u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }

        let (oldest, newest) = store.bounds().expect("bounds").expect("live");
        assert_eq!(newest, 59);
        for i in [oldest, oldest + 1, (oldest + newest) / 2, newest - 1, newest] {
            let data = store.nth(i).expect("nth");
            assert_eq!(data.index, i);
            assert_eq!(data.protein.payload(), format!("record-{i:02}").as_bytes());
        }

        // A fresh handle has no cache and must lean on the embedded index.
        drop(store);
        let mut store = Store::open(&path).expect("reopen");
        let mid = (oldest + newest) / 2;
        assert_eq!(store.nth(mid).expect("nth").index, mid);
    }

    #[test]
    fn timestamp_probe_resolves_each_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "time.cistern", 8192, 0, 0);
        let mut store = Store::open(&path).expect("open");
        for (i, stamp) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
            store
                .deposit_at(&record(&format!("record-{i:02}")), *stamp)
                .expect("deposit");
        }

        // Ties between neighbors resolve toward the earlier record.
        assert_eq!(store.probe_by_time(25.0, TimeBound::Closest).expect("probe"), 1);
        assert_eq!(store.probe_by_time(26.0, TimeBound::Closest).expect("probe"), 2);
        assert_eq!(store.probe_by_time(25.0, TimeBound::ClosestLower).expect("probe"), 1);
        assert_eq!(store.probe_by_time(25.0, TimeBound::ClosestHigher).expect("probe"), 2);
        // An exact hit satisfies the higher bound too.
        assert_eq!(store.probe_by_time(20.0, TimeBound::ClosestHigher).expect("probe"), 1);
        assert_eq!(store.probe_by_time(5.0, TimeBound::ClosestHigher).expect("probe"), 0);
        assert_eq!(store.probe_by_time(45.0, TimeBound::ClosestLower).expect("probe"), 3);
        assert_eq!(store.probe_by_time(45.0, TimeBound::Closest).expect("probe"), 3);
        assert_eq!(
            store
                .probe_by_time(5.0, TimeBound::ClosestLower)
                .expect_err("below all")
                .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            store
                .probe_by_time(45.0, TimeBound::ClosestHigher)
                .expect_err("above all")
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn legacy_pools_cannot_change_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.cistern");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.set_len(4096).expect("len");
        let region = Region::map(&file, &path).expect("map");
        Layout::Legacy
            .init(
                &region,
                &InitParams {
                    file_size: 4096,
                    toc_capacity: 0,
                    flags: 0,
                    lock_key: 0,
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                },
            )
            .expect("init");
        drop(region);

        let mut store = Store::open(&path).expect("open");
        let err = store.change_flags(FLAG_FROZEN, 0).expect_err("legacy");
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        // Reads and writes still work; the index counter is derived from the
        // newest entry instead of a header word.
        let (index, _) = store.deposit(&record("legacy-0")).expect("deposit");
        assert_eq!(index, 0);
        let (index, _) = store.deposit(&record("legacy-1")).expect("deposit");
        assert_eq!(index, 1);
        assert_eq!(store.nth(1).expect("nth").protein.payload(), b"legacy-1");
    }
}
