//! Purpose: Bounds-checked access to the shared memory-mapped pool file.
//! Exports: `Region`.
//! Role: The only module allowed to touch raw mmap memory; everything above
//! Role: works in virtual offsets and copied-out bytes.
//! Invariants: Every access is bounds-checked against the mapped length.
//! Invariants: The oldest/newest words are only touched through `AtomicU64`.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};

pub(crate) struct Region {
    mmap: MmapMut,
}

impl Region {
    pub(crate) fn map(file: &File, path: &Path) -> Result<Self, Error> {
        let mmap = unsafe {
            MmapMut::map_mut(file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
        };
        Ok(Self { mmap })
    }

    pub(crate) fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn check(&self, offset: u64, len: u64) -> Result<(), Error> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| out_of_range(offset, len))?;
        if end > self.len() {
            return Err(out_of_range(offset, len));
        }
        Ok(())
    }

    /// View an aligned word of the mapping as an atomic. This is the
    /// cross-process synchronization seam: the pointer words are shared with
    /// other mappings of the same file.
    pub(crate) fn atomic(&self, offset: u64) -> Result<&AtomicU64, Error> {
        self.check(offset, 8)?;
        if offset % 8 != 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_offset(offset)
                .with_message("misaligned atomic word"));
        }
        let ptr = unsafe { self.mmap.as_ptr().add(offset as usize) };
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    pub(crate) fn load(&self, offset: u64) -> Result<u64, Error> {
        Ok(self.atomic(offset)?.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, offset: u64, value: u64) -> Result<(), Error> {
        self.atomic(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Copy bytes out of the mapping. The copy may race a concurrent
    /// depositor in another process; callers must treat the result as
    /// possibly torn and re-validate against the pointer words.
    pub(crate) fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.check(offset, buf.len() as u64)?;
        let src = unsafe { self.mmap.as_ptr().add(offset as usize) };
        unsafe {
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Write bytes into the mapping. Only the deposit/resize paths call this,
    /// and only while holding the deposit lock, so writes never race writes.
    pub(crate) fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.check(offset, data.len() as u64)?;
        let dst = unsafe { self.mmap.as_ptr().add(offset as usize) as *mut u8 };
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    pub(crate) fn read_u64(&self, offset: u64) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_bytes(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn write_u64(&self, offset: u64, value: u64) -> Result<(), Error> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub(crate) fn read_f64(&self, offset: u64) -> Result<f64, Error> {
        Ok(f64::from_bits(self.read_u64(offset)?))
    }

    pub(crate) fn write_f64(&self, offset: u64, value: f64) -> Result<(), Error> {
        self.write_u64(offset, value.to_bits())
    }

    pub(crate) fn flush_range(&self, offset: u64, len: u64) -> Result<(), Error> {
        self.check(offset, len)?;
        self.mmap
            .flush_range(offset as usize, len as usize)
            .map_err(|err| Error::new(ErrorKind::Io).with_offset(offset).with_source(err))
    }
}

fn out_of_range(offset: u64, len: u64) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_offset(offset)
        .with_message(format!("access of {len} bytes past mapped region"))
}
