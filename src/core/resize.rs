//! Purpose: Grow or shrink a live pool without losing surviving records.
//! Role: Runs entirely under the deposit lock. Readers are blinded by parking
//! Role: the oldest pointer past newest (the temporarily-empty state), so the
//! Role: relocation is never visible as a half-moved window.
//! Invariants: Surviving records keep their sequence indices and stamps.
//! Invariants: The newest record is never discarded; a size that cannot hold
//! Invariants: it is an error.

use std::sync::atomic::{fence, Ordering};

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::Layout;
use crate::core::lock::DepositLock;
use crate::core::plan::{next_entry, remodulate, EntryWalker, MIN_ENTRY_SPAN};
use crate::core::store::Store;
use crate::core::toc::Toc;

struct Relocated {
    index: u64,
    stamp: f64,
    blob: Vec<u8>,
}

/// Change the pool's file size to `new_size` bytes. The header keeps its
/// size and position; records that no longer fit are discarded oldest-first.
pub(crate) fn resize(store: &mut Store, new_size: u64) -> Result<(), Error> {
    let _lock = DepositLock::acquire(store.path())?;
    store.check_size()?;
    if store.layout() == Layout::Legacy {
        return Err(Error::new(ErrorKind::Unsupported)
            .with_path(store.path())
            .with_message("legacy pools cannot be resized"));
    }
    let snap = store.snapshot()?;
    if new_size == snap.region_size {
        return Ok(());
    }
    let first = snap.first_entry;
    if new_size < first + MIN_ENTRY_SPAN + 8 {
        return Err(Error::new(ErrorKind::Usage)
            .with_path(store.path())
            .with_message(format!("size {new_size} leaves no room for records")));
    }

    // Copy every live entry out verbatim; spans, stamps and jumpbacks are
    // all position-independent.
    let mut entries: Vec<Relocated> = Vec::new();
    if !snap.is_empty() {
        let mut cursor = snap.oldest;
        loop {
            let span = store.entry_span(cursor)?;
            let p = snap.physical(cursor);
            let mut blob = vec![0u8; span as usize];
            store.region.read_bytes(p, &mut blob)?;
            entries.push(Relocated {
                index: store.region.read_u64(p + 8)?,
                stamp: store.region.read_f64(p)?,
                blob,
            });
            if cursor == snap.newest {
                break;
            }
            cursor = next_entry(&snap, &*store, cursor)?;
        }
    }

    let budget = new_size - first - 8;
    let mut total: u64 = entries.iter().map(|entry| entry.blob.len() as u64).sum();
    let mut dropped = 0usize;
    while total > budget {
        if entries.len() - dropped <= 1 {
            return Err(Error::new(ErrorKind::TooBig)
                .with_path(store.path())
                .with_message(format!("size {new_size} cannot hold the newest record")));
        }
        total -= entries[dropped].blob.len() as u64;
        dropped += 1;
    }

    // Blind readers before any bytes move, then change the file itself.
    let parked = if snap.is_empty() {
        snap.oldest
    } else {
        let parked = remodulate(snap.newest, first, snap.region_size);
        store.region.store(store.hdr.oldest_at, parked)?;
        parked
    };
    // The relocation writes below are plain; they must not become visible
    // before the parking store that blinds readers to them.
    fence(Ordering::SeqCst);
    store
        .file
        .set_len(new_size)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(store.path()).with_source(err))?;
    store.remap()?;

    let survivors = &entries[dropped..];
    let conf = store.hdr.conf.ok_or_else(|| {
        Error::new(ErrorKind::Internal).with_message("chunked pool lost its configuration chunk")
    })?;

    if survivors.is_empty() {
        store.region.store(store.hdr.newest_at, 0)?;
        store.region.store(store.hdr.oldest_at, first)?;
        store.region.store(conf.file_size_at, new_size)?;
        if let Some(base) = store.hdr.toc_base {
            Toc::new(base).clear(&store.region)?;
        }
        return Ok(());
    }

    // Fresh virtual offsets: past everything previously published and
    // congruent with the first entry position under the new modulus.
    let new_start = remodulate(parked.max(snap.newest), first, new_size);
    let mut offsets = Vec::with_capacity(survivors.len());
    let mut virt = new_start;
    for entry in survivors {
        store.region.write_bytes(virt % new_size, &entry.blob)?;
        offsets.push(virt);
        virt += entry.blob.len() as u64;
    }
    let newest = offsets[survivors.len() - 1];

    // Publish the new size first so remote handles remap, then reveal the
    // relocated window: oldest before newest keeps it empty until coherent.
    store.region.store(conf.file_size_at, new_size)?;
    if let Some(base) = store.hdr.toc_base {
        let toc = Toc::new(base);
        toc.clear(&store.region)?;
        for (entry, offset) in survivors.iter().zip(&offsets) {
            if let Err(err) =
                toc.append(&store.region, entry.index, *offset, entry.stamp, new_start)
            {
                tracing::debug!(error = %err, "position index rebuild failed");
                break;
            }
        }
    }
    store.region.store(store.hdr.oldest_at, new_start)?;
    store.region.store(store.hdr.newest_at, newest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::resize;
    use crate::core::error::ErrorKind;
    use crate::core::layout::{InitParams, Layout};
    use crate::core::protein::Protein;
    use crate::core::region::Region;
    use crate::core::store::Store;
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    fn make_pool(
        dir: &tempfile::TempDir,
        name: &str,
        layout: Layout,
        file_size: u64,
        toc_capacity: u64,
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
        layout
            .init(
                &region,
                &InitParams {
                    file_size,
                    toc_capacity,
                    flags: 0,
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
    fn growing_keeps_survivors_and_restores_room() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "grow.cistern", Layout::Chunked, 296, 0);
        let mut store = Store::open(&path).expect("open");
        for i in 0..10u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }
        assert_eq!(store.bounds().expect("bounds"), Some((7, 9)));

        resize(&mut store, 4096).expect("resize");
        assert_eq!(store.bounds().expect("bounds"), Some((7, 9)));
        for i in 7..10u64 {
            let data = store.nth(i).expect("nth");
            assert_eq!(data.protein.payload(), format!("record-{i:02}").as_bytes());
        }
        let (index, _) = store.deposit(&record("record-10")).expect("deposit");
        assert_eq!(index, 10);
        assert_eq!(store.bounds().expect("bounds"), Some((7, 10)));
    }

    #[test]
    fn shrinking_discards_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "shrink.cistern", Layout::Chunked, 4096, 0);
        let mut store = Store::open(&path).expect("open");
        for i in 0..16u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }
        assert_eq!(store.bounds().expect("bounds"), Some((0, 15)));

        // 296 bytes leave a 152-byte entry space: three 48-byte entries.
        resize(&mut store, 296).expect("resize");
        assert_eq!(store.bounds().expect("bounds"), Some((13, 15)));
        assert_eq!(store.nth(12).expect_err("dropped").kind(), ErrorKind::NotFound);
        assert_eq!(store.nth(15).expect("nth").protein.payload(), b"record-15");
        let (index, _) = store.deposit(&record("record-16")).expect("deposit");
        assert_eq!(index, 16);
    }

    #[test]
    fn size_that_cannot_hold_the_newest_record_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "tight.cistern", Layout::Chunked, 4096, 0);
        let mut store = Store::open(&path).expect("open");
        store
            .deposit(&record(&"x".repeat(300)))
            .expect("deposit");

        let err = resize(&mut store, 296).expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::TooBig);
        assert_eq!(store.bounds().expect("bounds"), Some((0, 0)));
        assert_eq!(store.nth(0).expect("nth").protein.payload().len(), 300);
    }

    #[test]
    fn empty_pools_resize_and_keep_their_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "empty.cistern", Layout::Chunked, 296, 0);
        let mut store = Store::open(&path).expect("open");
        store.deposit(&record("record-00")).expect("deposit");
        store.advance_oldest(1).expect("empty");
        assert_eq!(store.bounds().expect("bounds"), None);

        resize(&mut store, 4096).expect("resize");
        assert_eq!(store.bounds().expect("bounds"), None);
        let (index, _) = store.deposit(&record("record-01")).expect("deposit");
        assert_eq!(index, 1);
    }

    #[test]
    fn indexed_pool_survives_a_resize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "indexed.cistern", Layout::Chunked, 8192, 16);
        let mut store = Store::open(&path).expect("open");
        for i in 0..60u64 {
            store
                .deposit(&record(&format!("record-{i:02}")))
                .expect("deposit");
        }

        resize(&mut store, 16384).expect("resize");
        let (oldest, newest) = store.bounds().expect("bounds").expect("live");
        assert_eq!((oldest, newest), (0, 59));
        let mid = 30;
        assert_eq!(store.nth(mid).expect("nth").index, mid);
        assert_eq!(
            store.nth(mid).expect("nth").protein.payload(),
            format!("record-{mid:02}").as_bytes()
        );
    }

    #[test]
    fn legacy_pools_cannot_be_resized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_pool(&dir, "legacy.cistern", Layout::Legacy, 4096, 0);
        let mut store = Store::open(&path).expect("open");
        let err = resize(&mut store, 8192).expect_err("legacy");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
