//! Purpose: Define and parse the on-disk pool header in both supported layouts.
//! Exports: `Layout`, `HeaderMap`, `InitParams`, feature-flag constants.
//! Role: Everything above this module is layout-agnostic; it works with the
//! Role: byte offsets a `HeaderMap` hands out.
//! Invariants: The configuration chunk is always the first chunk, so the
//! Invariants: file-size/header-size words can be found without a full scan.
//! Invariants: Unknown flag bits 0-31 are a hard error; bits 32-63 are ignored.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{pool_version_error, POOL_FORMAT_VERSION};
use crate::core::region::Region;
use crate::core::toc::{toc_bytes, Toc};

pub(crate) const MAGIC: [u8; 4] = [0xFF, 0x0B, 0x10, 0x93];
const FILE_TYPE_POOL: u8 = 2;
const HEADER_FLAG_BIG_ENDIAN: u16 = 1;

const CHUNK_SIG_BASE: u64 = 0x1bad_d00d << 32;
const LEGACY_MAGIC: u64 = 0x0006_5b00_00af_4c81;

pub(crate) const FLAG_STOP_WHEN_FULL: u64 = 1 << 0;
pub(crate) const FLAG_FROZEN: u64 = 1 << 1;
pub(crate) const FLAG_AUTO_DISPOSE: u64 = 1 << 2;
pub(crate) const FLAG_CHECKSUM: u64 = 1 << 3;
pub(crate) const FLAG_FLOCK: u64 = 1 << 4;
pub(crate) const FLAG_SYNC: u64 = 1 << 32;

// Low-word bits change entry layout or eviction semantics; accepting an
// unknown one would misread the pool.
const KNOWN_HARD_FLAGS: u64 = FLAG_STOP_WHEN_FULL
    | FLAG_FROZEN
    | FLAG_AUTO_DISPOSE
    | FLAG_CHECKSUM
    | FLAG_FLOCK;

const WORD: u64 = 8;
const MAGIC_OCT_LEN: u64 = WORD;

const fn fourcc(tag: &[u8; 4]) -> u64 {
    CHUNK_SIG_BASE | u32::from_le_bytes(*tag) as u64
}

const CHUNK_CONF: u64 = fourcc(b"conf");
const CHUNK_PTRS: u64 = fourcc(b"ptrs");
const CHUNK_PERM: u64 = fourcc(b"perm");
const CHUNK_INDX: u64 = fourcc(b"indx");

const CONF_WORDS: u64 = 8; // sig, len, version, file size, header size, lock key, flags, next index
const PTRS_WORDS: u64 = 4;
const PERM_WORDS: u64 = 5;

const LEGACY_OLDEST_AT: u64 = 0;
const LEGACY_NEWEST_AT: u64 = 8;
const LEGACY_MAGIC_AT: u64 = 16;
const LEGACY_FIXED_LEN: u64 = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Layout {
    Legacy,
    Chunked,
}

/// Byte offsets of the configuration chunk payload words.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConfMap {
    pub file_size_at: u64,
    pub flags_at: u64,
    pub next_index_at: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PermMap {
    pub mode_at: u64,
    pub uid_at: u64,
    pub gid_at: u64,
}

/// Resolved header: where everything lives inside the mapped region, plus a
/// snapshot of the slow-changing configuration words.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeaderMap {
    pub layout: Layout,
    pub oldest_at: u64,
    pub newest_at: u64,
    pub conf: Option<ConfMap>,
    pub perm: Option<PermMap>,
    pub toc_base: Option<u64>,
    pub header_size: u64,
    pub file_size: u64,
    pub flags: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct InitParams {
    pub file_size: u64,
    pub toc_capacity: u64,
    pub flags: u64,
    pub lock_key: u64,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
}

/// The few facts needed before the file can be mapped.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Bootstrap {
    pub layout: Layout,
    pub file_size: u64,
    pub header_size: u64,
}

impl Layout {
    /// Total header bytes for a freshly initialized pool.
    pub(crate) fn header_size(&self, toc_capacity: u64) -> u64 {
        match self {
            Layout::Legacy => LEGACY_FIXED_LEN + embedded_toc(toc_capacity),
            Layout::Chunked => {
                let fixed =
                    MAGIC_OCT_LEN + (CONF_WORDS + PTRS_WORDS + PERM_WORDS) * WORD;
                let indx = if toc_capacity > 0 {
                    2 * WORD + toc_bytes(toc_capacity)
                } else {
                    0
                };
                fixed + indx
            }
        }
    }

    pub(crate) fn init(&self, region: &Region, params: &InitParams) -> Result<HeaderMap, Error> {
        match self {
            Layout::Chunked => init_chunked(region, params),
            Layout::Legacy => init_legacy(region, params),
        }
    }

    pub(crate) fn read(&self, region: &Region, path: &Path) -> Result<HeaderMap, Error> {
        match self {
            Layout::Chunked => read_chunked(region, path),
            Layout::Legacy => read_legacy(region, path),
        }
    }
}

fn embedded_toc(toc_capacity: u64) -> u64 {
    if toc_capacity > 0 {
        toc_bytes(toc_capacity)
    } else {
        0
    }
}

fn init_chunked(region: &Region, params: &InitParams) -> Result<HeaderMap, Error> {
    let header_size = Layout::Chunked.header_size(params.toc_capacity);
    let mut oct = [0u8; 8];
    oct[..4].copy_from_slice(&MAGIC);
    oct[4] = POOL_FORMAT_VERSION as u8;
    oct[5] = FILE_TYPE_POOL;
    oct[6..8].copy_from_slice(&0u16.to_be_bytes()); // little-endian records
    region.write_bytes(0, &oct)?;

    let conf_at = MAGIC_OCT_LEN;
    region.write_u64(conf_at, CHUNK_CONF)?;
    region.write_u64(conf_at + WORD, CONF_WORDS)?;
    region.write_u64(conf_at + 2 * WORD, POOL_FORMAT_VERSION as u64)?;
    region.write_u64(conf_at + 3 * WORD, params.file_size)?;
    region.write_u64(conf_at + 4 * WORD, header_size)?;
    region.write_u64(conf_at + 5 * WORD, params.lock_key)?;
    region.write_u64(conf_at + 6 * WORD, params.flags)?;
    region.write_u64(conf_at + 7 * WORD, 0)?; // next index

    let ptrs_at = conf_at + CONF_WORDS * WORD;
    region.write_u64(ptrs_at, CHUNK_PTRS)?;
    region.write_u64(ptrs_at + WORD, PTRS_WORDS)?;
    region.write_u64(ptrs_at + 2 * WORD, header_size)?; // oldest: first entry position
    region.write_u64(ptrs_at + 3 * WORD, 0)?; // newest: never written

    let perm_at = ptrs_at + PTRS_WORDS * WORD;
    region.write_u64(perm_at, CHUNK_PERM)?;
    region.write_u64(perm_at + WORD, PERM_WORDS)?;
    region.write_u64(perm_at + 2 * WORD, params.mode)?;
    region.write_u64(perm_at + 3 * WORD, params.uid)?;
    region.write_u64(perm_at + 4 * WORD, params.gid)?;

    let mut toc_base = None;
    if params.toc_capacity > 0 {
        let indx_at = perm_at + PERM_WORDS * WORD;
        let toc_words = toc_bytes(params.toc_capacity) / WORD;
        region.write_u64(indx_at, CHUNK_INDX)?;
        region.write_u64(indx_at + WORD, 2 + toc_words)?;
        let base = indx_at + 2 * WORD;
        Toc::new(base).init(region, params.toc_capacity)?;
        toc_base = Some(base);
    }

    Ok(HeaderMap {
        layout: Layout::Chunked,
        oldest_at: ptrs_at + 2 * WORD,
        newest_at: ptrs_at + 3 * WORD,
        conf: Some(ConfMap {
            file_size_at: conf_at + 3 * WORD,
            flags_at: conf_at + 6 * WORD,
            next_index_at: conf_at + 7 * WORD,
        }),
        perm: Some(PermMap {
            mode_at: perm_at + 2 * WORD,
            uid_at: perm_at + 3 * WORD,
            gid_at: perm_at + 4 * WORD,
        }),
        toc_base,
        header_size,
        file_size: params.file_size,
        flags: params.flags,
    })
}

fn read_chunked(region: &Region, path: &Path) -> Result<HeaderMap, Error> {
    let mut oct = [0u8; 8];
    region.read_bytes(0, &mut oct)?;
    if oct[..4] != MAGIC {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("bad pool magic"));
    }
    if oct[4] as u32 != POOL_FORMAT_VERSION {
        return Err(pool_version_error(oct[4] as u32).with_path(path));
    }
    if oct[5] != FILE_TYPE_POOL {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message(format!("not a pool file (type byte {})", oct[5])));
    }
    let header_flags = u16::from_be_bytes([oct[6], oct[7]]);
    if header_flags & HEADER_FLAG_BIG_ENDIAN != 0 {
        return Err(Error::new(ErrorKind::Unsupported)
            .with_path(path)
            .with_message("big-endian pools are not supported"));
    }

    let conf_at = MAGIC_OCT_LEN;
    if region.read_u64(conf_at)? != CHUNK_CONF {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("configuration chunk is not first"));
    }
    let conf_words = region.read_u64(conf_at + WORD)?;
    if conf_words < CONF_WORDS {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("configuration chunk too short"));
    }
    let mmap_version = region.read_u64(conf_at + 2 * WORD)?;
    if mmap_version != POOL_FORMAT_VERSION as u64 {
        return Err(pool_version_error(mmap_version as u32).with_path(path));
    }
    let file_size = region.read_u64(conf_at + 3 * WORD)?;
    let header_size = region.read_u64(conf_at + 4 * WORD)?;
    let flags = region.read_u64(conf_at + 6 * WORD)?;
    let unknown = (flags & u32::MAX as u64) & !KNOWN_HARD_FLAGS;
    if unknown != 0 {
        return Err(Error::new(ErrorKind::WrongVersion)
            .with_path(path)
            .with_message(format!("pool uses unknown feature flags {unknown:#x}"))
            .with_hint("upgrade cistern to open this pool"));
    }
    if file_size == 0 || header_size < Layout::Chunked.header_size(0) || header_size >= file_size {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("implausible file/header sizes in configuration chunk"));
    }

    let conf = ConfMap {
        file_size_at: conf_at + 3 * WORD,
        flags_at: conf_at + 6 * WORD,
        next_index_at: conf_at + 7 * WORD,
    };

    // Remaining chunks may come in any order; skip ones we do not know.
    let mut at = conf_at + conf_words * WORD;
    let mut oldest_at = None;
    let mut newest_at = None;
    let mut perm = None;
    let mut toc_base = None;
    while at + 2 * WORD <= header_size {
        let sig = region.read_u64(at)?;
        let words = region.read_u64(at + WORD)?;
        if words < 2 || at + words * WORD > header_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_path(path)
                .with_offset(at)
                .with_message("chunk length out of range"));
        }
        match sig {
            CHUNK_PTRS => {
                if words < PTRS_WORDS {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_path(path)
                        .with_message("pointer chunk too short"));
                }
                oldest_at = Some(at + 2 * WORD);
                newest_at = Some(at + 3 * WORD);
            }
            CHUNK_PERM => {
                if words >= PERM_WORDS {
                    perm = Some(PermMap {
                        mode_at: at + 2 * WORD,
                        uid_at: at + 3 * WORD,
                        gid_at: at + 4 * WORD,
                    });
                }
            }
            CHUNK_INDX => {
                toc_base = Some(at + 2 * WORD);
            }
            _ => {}
        }
        at += words * WORD;
    }

    let (oldest_at, newest_at) = match (oldest_at, newest_at) {
        (Some(oldest), Some(newest)) => (oldest, newest),
        _ => {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_path(path)
                .with_message("missing pointer chunk"))
        }
    };

    Ok(HeaderMap {
        layout: Layout::Chunked,
        oldest_at,
        newest_at,
        conf: Some(conf),
        perm,
        toc_base,
        header_size,
        file_size,
        flags,
    })
}

fn init_legacy(region: &Region, params: &InitParams) -> Result<HeaderMap, Error> {
    let header_size = Layout::Legacy.header_size(params.toc_capacity);
    region.write_u64(LEGACY_OLDEST_AT, header_size)?;
    region.write_u64(LEGACY_NEWEST_AT, 0)?;
    region.write_u64(LEGACY_MAGIC_AT, LEGACY_MAGIC)?;
    let mut toc_base = None;
    if params.toc_capacity > 0 {
        let base = LEGACY_FIXED_LEN;
        Toc::new(base).init(region, params.toc_capacity)?;
        toc_base = Some(base);
    }
    Ok(HeaderMap {
        layout: Layout::Legacy,
        oldest_at: LEGACY_OLDEST_AT,
        newest_at: LEGACY_NEWEST_AT,
        conf: None,
        perm: None,
        toc_base,
        header_size,
        file_size: params.file_size,
        flags: 0,
    })
}

fn read_legacy(region: &Region, path: &Path) -> Result<HeaderMap, Error> {
    let magic = region.read_u64(LEGACY_MAGIC_AT)?;
    let version = (magic >> 24) & 0xFF;
    if magic & !(0xFF << 24) != LEGACY_MAGIC {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("bad legacy pool magic"));
    }
    if version != 0 {
        return Err(pool_version_error(version as u32).with_path(path));
    }
    // An embedded index announces itself with its signature word.
    let mut toc_base = None;
    let mut header_size = LEGACY_FIXED_LEN;
    if region.len() >= LEGACY_FIXED_LEN + 2 * WORD
        && region.read_u64(LEGACY_FIXED_LEN)? == crate::core::toc::TOC_SIGNATURE
    {
        let capacity = region.read_u64(LEGACY_FIXED_LEN + WORD)?;
        header_size = LEGACY_FIXED_LEN + toc_bytes(capacity);
        toc_base = Some(LEGACY_FIXED_LEN);
    }
    if header_size >= region.len() {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("legacy header exceeds file size"));
    }
    Ok(HeaderMap {
        layout: Layout::Legacy,
        oldest_at: LEGACY_OLDEST_AT,
        newest_at: LEGACY_NEWEST_AT,
        conf: None,
        perm: None,
        toc_base,
        header_size,
        file_size: region.len(),
        flags: 0,
    })
}

/// Identify the layout and critical sizes by reading the file head, before
/// anything is mapped.
pub(crate) fn bootstrap(file: &mut File, path: &Path) -> Result<Bootstrap, Error> {
    let actual = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    let mut head = [0u8; (MAGIC_OCT_LEN + CONF_WORDS * WORD) as usize];
    if actual < head.len() as u64 {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_path(path)
            .with_message("pool file too small for any header"));
    }
    file.read_exact(&mut head)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;

    if head[..4] == MAGIC {
        if head[4] as u32 != POOL_FORMAT_VERSION {
            return Err(pool_version_error(head[4] as u32).with_path(path));
        }
        let file_size = read_word(&head, MAGIC_OCT_LEN + 3 * WORD);
        let header_size = read_word(&head, MAGIC_OCT_LEN + 4 * WORD);
        if file_size != actual {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_path(path)
                .with_message(format!(
                    "configured size {file_size} disagrees with file size {actual}"
                )));
        }
        return Ok(Bootstrap {
            layout: Layout::Chunked,
            file_size,
            header_size,
        });
    }

    let magic = read_word(&head, LEGACY_MAGIC_AT);
    if magic & !(0xFF << 24) == LEGACY_MAGIC {
        return Ok(Bootstrap {
            layout: Layout::Legacy,
            file_size: actual,
            header_size: LEGACY_FIXED_LEN,
        });
    }

    Err(Error::new(ErrorKind::Corrupt)
        .with_path(path)
        .with_message("file is not a pool in any known layout"))
}

fn read_word(buf: &[u8], at: u64) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at as usize..at as usize + 8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::{
        bootstrap, InitParams, Layout, CHUNK_CONF, FLAG_CHECKSUM, FLAG_SYNC, MAGIC, WORD,
    };
    use crate::core::error::ErrorKind;
    use crate::core::region::Region;
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    fn scratch(len: u64) -> (tempfile::TempDir, PathBuf, Region) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.cistern");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.set_len(len).expect("len");
        let region = Region::map(&file, &path).expect("map");
        (dir, path, region)
    }

    fn params(file_size: u64, toc_capacity: u64, flags: u64) -> InitParams {
        InitParams {
            file_size,
            toc_capacity,
            flags,
            lock_key: 0x1234,
            mode: 0o644,
            uid: 0,
            gid: 0,
        }
    }

    #[test]
    fn chunked_init_read_round_trip() {
        let (_dir, path, region) = scratch(64 * 1024);
        let init = Layout::Chunked
            .init(&region, &params(64 * 1024, 16, FLAG_CHECKSUM | FLAG_SYNC))
            .expect("init");
        let read = Layout::Chunked.read(&region, &path).expect("read");
        assert_eq!(read.header_size, init.header_size);
        assert_eq!(read.file_size, 64 * 1024);
        assert_eq!(read.flags, FLAG_CHECKSUM | FLAG_SYNC);
        assert_eq!(read.oldest_at, init.oldest_at);
        assert_eq!(read.newest_at, init.newest_at);
        assert_eq!(read.toc_base, init.toc_base);
        assert!(read.toc_base.is_some());
        assert!(read.perm.is_some());
        // A fresh pool starts truly empty.
        assert_eq!(region.read_u64(read.oldest_at).expect("oldest"), read.header_size);
        assert_eq!(region.read_u64(read.newest_at).expect("newest"), 0);
    }

    #[test]
    fn header_size_reflects_index_capacity() {
        let bare = Layout::Chunked.header_size(0);
        let indexed = Layout::Chunked.header_size(32);
        assert!(indexed > bare);
        assert_eq!(bare % 8, 0);
        assert_eq!(indexed % 8, 0);
    }

    #[test]
    fn unknown_hard_flag_is_rejected_and_soft_flag_ignored() {
        let (_dir, path, region) = scratch(64 * 1024);
        let init = Layout::Chunked
            .init(&region, &params(64 * 1024, 0, 0))
            .expect("init");
        let conf = init.conf.expect("conf");

        region.write_u64(conf.flags_at, 1 << 20).expect("flags");
        let err = Layout::Chunked.read(&region, &path).expect_err("hard flag");
        assert_eq!(err.kind(), ErrorKind::WrongVersion);

        region.write_u64(conf.flags_at, 1 << 40).expect("flags");
        let read = Layout::Chunked.read(&region, &path).expect("soft flag");
        assert_eq!(read.flags, 1 << 40);
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let (_dir, path, region) = scratch(64 * 1024);
        let init = Layout::Chunked
            .init(&region, &params(64 * 1024, 0, 0))
            .expect("init");
        // Rewrite the perm chunk signature to something unrecognized.
        let perm = init.perm.expect("perm");
        region
            .write_u64(perm.mode_at - 2 * WORD, super::CHUNK_SIG_BASE | 0x7478_7878)
            .expect("sig");
        let read = Layout::Chunked.read(&region, &path).expect("read");
        assert!(read.perm.is_none());
        assert_eq!(read.oldest_at, init.oldest_at);
    }

    #[test]
    fn conf_must_be_first_chunk() {
        let (_dir, path, region) = scratch(64 * 1024);
        Layout::Chunked
            .init(&region, &params(64 * 1024, 0, 0))
            .expect("init");
        region.write_u64(8, CHUNK_CONF + 1).expect("clobber");
        let err = Layout::Chunked.read(&region, &path).expect_err("read");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn legacy_round_trip_and_version_gate() {
        let (_dir, path, region) = scratch(64 * 1024);
        Layout::Legacy
            .init(&region, &params(64 * 1024, 8, 0))
            .expect("init");
        let read = Layout::Legacy.read(&region, &path).expect("read");
        assert_eq!(read.layout, Layout::Legacy);
        assert!(read.toc_base.is_some());
        assert!(read.conf.is_none());
        assert_eq!(read.file_size, 64 * 1024);

        // Stamp a future legacy version into the magic word.
        let magic = region.read_u64(16).expect("magic");
        region.write_u64(16, magic | (3 << 24)).expect("magic");
        let err = Layout::Legacy.read(&region, &path).expect_err("version");
        assert_eq!(err.kind(), ErrorKind::WrongVersion);
    }

    #[test]
    fn bootstrap_identifies_both_layouts() {
        let (_dir, path, region) = scratch(64 * 1024);
        Layout::Chunked
            .init(&region, &params(64 * 1024, 0, 0))
            .expect("init");
        drop(region);
        let mut file = OpenOptions::new().read(true).open(&path).expect("open");
        let boot = bootstrap(&mut file, &path).expect("bootstrap");
        assert_eq!(boot.layout, Layout::Chunked);
        assert_eq!(boot.file_size, 64 * 1024);

        let (_dir, path, region) = scratch(64 * 1024);
        Layout::Legacy
            .init(&region, &params(64 * 1024, 0, 0))
            .expect("init");
        drop(region);
        let mut file = OpenOptions::new().read(true).open(&path).expect("open");
        let boot = bootstrap(&mut file, &path).expect("bootstrap");
        assert_eq!(boot.layout, Layout::Legacy);
    }

    #[test]
    fn bootstrap_rejects_garbage() {
        let (_dir, path, region) = scratch(4096);
        region.write_bytes(0, b"not a pool at all").expect("write");
        assert_ne!(&MAGIC[..], b"not ");
        drop(region);
        let mut file = OpenOptions::new().read(true).open(&path).expect("open");
        let err = bootstrap(&mut file, &path).expect_err("garbage");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
