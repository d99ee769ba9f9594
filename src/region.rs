//! Anonymous RWX mappings the tracee executes from.
//!
//! An isolated region is surrounded by one `PROT_NONE` page on each side, so
//! an instruction touching one byte past either end faults in the tracee
//! instead of silently hitting a neighbouring mapping.

use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use log::{debug, warn};
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

use crate::arch::page_size;
use crate::error::Error;
use crate::ptrace_execute::Tracee;

/// Granularity of [`Region::read_traced`].
const WORD: usize = 4;

pub struct Region {
    // Whole reserved span, guard pages included.
    map: NonNull<c_void>,
    reserved: usize,
    // Offset of the usable span inside the mapping.
    offset: usize,
    len: usize,
}

impl Region {
    /// Maps `len` zeroed, readable, writable and executable bytes.
    ///
    /// # Panics
    ///
    /// If `len` is zero.
    pub fn new(len: usize) -> Result<Self, Error> {
        assert!(len > 0, "region length must be positive");

        let map = Self::map(len)?;
        debug!("mapped {len:#x} bytes at {:p}", map);

        Ok(Self {
            map,
            reserved: len,
            offset: 0,
            len,
        })
    }

    /// Like [`Region::new`], with an inaccessible page right before and right
    /// after the usable span.
    ///
    /// # Panics
    ///
    /// If `len` is zero or not a multiple of the page size.
    pub fn isolated(len: usize) -> Result<Self, Error> {
        let page = page_size();
        assert!(len > 0, "region length must be positive");
        assert!(
            len % page == 0,
            "isolated region length {len:#x} is not a multiple of the page size {page:#x}"
        );

        let reserved = len + 2 * page;
        let map = Self::map(reserved)?;

        let region = Self {
            map,
            reserved,
            offset: page,
            len,
        };

        // On failure `region` is dropped, which unmaps the whole span.
        region.guard(0, page)?;
        region.guard(page + len, page)?;

        debug!(
            "mapped isolated {len:#x} bytes at {:#x} (guards at {:p} and {:#x})",
            region.addr(),
            map,
            region.addr() + len as u64
        );

        Ok(region)
    }

    fn map(len: usize) -> Result<NonNull<c_void>, Error> {
        let length = NonZeroUsize::new(len).ok_or(Error::Map(nix::Error::EINVAL))?;

        // Anonymous mappings come zero-filled from the kernel.
        unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(Error::Map)
    }

    fn guard(&self, offset: usize, len: usize) -> Result<(), Error> {
        debug_assert!(offset + len <= self.reserved);

        unsafe {
            let at = NonNull::new_unchecked(self.map.as_ptr().cast::<u8>().add(offset).cast());
            mprotect(at, len, ProtFlags::PROT_NONE)
        }
        .map_err(Error::Protect)
    }

    /// Start of the usable span. The tracee sees the same address.
    pub fn addr(&self) -> u64 {
        self.start() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_isolated(&self) -> bool {
        self.offset != 0
    }

    fn start(&self) -> *mut u8 {
        // `offset` is always within the reserved span.
        unsafe { self.map.as_ptr().cast::<u8>().add(self.offset) }
    }

    /// Copies `src` to the start of the region.
    ///
    /// # Panics
    ///
    /// If `src` is longer than the region.
    pub fn write(&mut self, src: &[u8]) {
        self.write_at(0, src);
    }

    /// Copies `src` to `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// If `src` does not fit between `offset` and the end of the region.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        let end = offset
            .checked_add(src.len())
            .filter(|&end| end <= self.len)
            .unwrap_or_else(|| {
                panic!("write of {} bytes at {offset:#x} past region of {:#x}", src.len(), self.len)
            });
        self.as_mut_slice()[offset..end].copy_from_slice(src);
    }

    /// The region as seen by this process.
    ///
    /// A tracee works on a copy-on-write copy of the mapping; use
    /// [`Region::read_traced`] to see what it wrote.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.start(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.start(), self.len) }
    }

    /// Reads the first `len` bytes of the region out of `tracee`'s address
    /// space, one 4-byte word per `PTRACE_PEEKDATA`.
    ///
    /// # Panics
    ///
    /// If `len` is not a multiple of 4 or exceeds the region.
    pub fn read_traced(&self, tracee: &Tracee, len: usize) -> Result<Vec<u8>, Error> {
        assert!(len % WORD == 0, "traced reads must be a multiple of {WORD} bytes, got {len}");
        assert!(len <= self.len, "read of {len:#x} bytes past region of {:#x}", self.len);

        let native = mem::size_of::<libc::c_long>();
        let mut buf = Vec::with_capacity(len);

        for offset in (0..len).step_by(WORD) {
            // Peeks are native-word sized; slide the last ones back so they
            // never reach into the trailing guard page.
            let at = offset.min(self.len.saturating_sub(native));
            let word = tracee.peek(self.addr() + at as u64)?;
            let skew = offset - at;
            buf.extend_from_slice(&word.to_ne_bytes()[skew..skew + WORD]);
        }

        Ok(buf)
    }

    /// Unmaps the region, guard pages included.
    pub fn dispose(self) -> Result<(), Error> {
        let result = unsafe { munmap(self.map, self.reserved) }.map_err(Error::Unmap);
        debug!("unmapped {:#x} bytes at {:p}", self.reserved, self.map);
        mem::forget(self);
        result
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.map, self.reserved) } {
            warn!("munmap of {:p} failed: {err}", self.map);
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("isolated", &self.is_isolated())
            .finish_non_exhaustive()
    }
}
