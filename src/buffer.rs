// This file is part of fpga-dma, a user-space DMA engine for FPGA accelerators.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// fpga-dma is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// fpga-dma is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Page-aligned, pinned host buffers.
//!
//! Every buffer is its own anonymous mapping, pre-faulted and locked when the process
//! limits allow it. The allocator keeps a side table of live buffers keyed by base
//! address, so releasing a buffer is a lookup that checks the buffer identity instead of
//! trusting bytes stored next to the returned pointer.
//!
//! The side table is also how the engine resolves a host address given to a transfer:
//! a host range is only accepted when it lies inside a live buffer, and the transfer then
//! holds the mapping alive until it completes.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use fpga_dma::buffer::AlignedBuffer;
//! # fn example() -> Result<(), fpga_dma::error::DmaError> {
//! let mut buf = AlignedBuffer::allocate(4096)?;
//! buf.as_mut_slice().fill(0xA5);
//! assert_eq!(buf.addr() % 4096, 0);
//! buf.free()?;
//! # Ok(())
//! # }
//! ```

use crate::error::DmaError;
use log::{debug, trace, warn};
use nix::sys::mman::{MapFlags, MmapAdvise, ProtFlags, madvise, mlock, mmap_anonymous, munmap};
use nix::unistd::{SysconfVar, sysconf};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

#[cfg(any(target_os = "linux", target_os = "android"))]
const POPULATE: MapFlags = MapFlags::MAP_POPULATE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POPULATE: MapFlags = MapFlags::empty();

const FALLBACK_PAGE_SIZE: usize = 4096;

/// The system page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(n)) if n > 0 => n as usize,
        other => {
            warn!("Could not query page size ({other:?}), assuming {FALLBACK_PAGE_SIZE}");
            FALLBACK_PAGE_SIZE
        }
    })
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// An anonymous shared mapping. Unmapped when the last reference goes away.
pub(crate) struct Mapping {
    addr: NonNull<c_void>,
    len: usize,
}

// SAFETY: The mapping is plain memory owned by this object; it is valid to access from
// any thread and is only unmapped on drop.
unsafe impl Send for Mapping {}
// SAFETY: See above. Concurrent access to the bytes is governed by the DMA protocol,
// not by this object.
unsafe impl Sync for Mapping {}

impl Mapping {
    fn anonymous(size: usize) -> Result<Self, DmaError> {
        let len = round_up(size, page_size());
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| DmaError::InvalidParam("cannot map an empty buffer".to_string()))?;
        // SAFETY: A fresh anonymous mapping does not alias any existing memory.
        let addr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | POPULATE,
            )
        }
        .map_err(|e| DmaError::Mmap {
            what: format!("map {len} bytes of host memory"),
            e,
        })?;
        let mapping = Mapping { addr, len };

        // SAFETY: addr/len describe the mapping created above.
        if let Err(e) = unsafe { madvise(addr, len, MmapAdvise::MADV_SEQUENTIAL) } {
            warn!("madvise(MADV_SEQUENTIAL) failed on {:p}: {e}", addr.as_ptr());
        }
        // SAFETY: addr/len describe the mapping created above.
        if let Err(e) = unsafe { mlock(addr, len) } {
            debug!("Could not lock {len} bytes at {:p} in memory: {e}", addr.as_ptr());
        }
        trace!("Mapped {len} bytes at {:p}", addr.as_ptr());
        Ok(mapping)
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr().cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: self holds a valid mmap result that nothing else references anymore.
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            warn!("munmap of {:p} ({} bytes) failed: {e}", self.addr.as_ptr(), self.len);
        } else {
            trace!("Unmapped {} bytes at {:p}", self.len, self.addr.as_ptr());
        }
    }
}

/// A window of host memory inside a live mapping.
///
/// Holding a region keeps the underlying mapping alive, even after the buffer it came
/// from was freed. This is what accelerators receive in `map_dma` and what in-flight
/// transfers hold on to.
#[derive(Clone)]
pub struct DmaRegion {
    mapping: Arc<Mapping>,
    offset: usize,
    len: usize,
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl DmaRegion {
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: offset never exceeds the mapping length (checked on construction).
        unsafe { self.mapping.as_ptr().add(self.offset) }
    }

    pub fn addr(&self) -> u64 {
        self.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        let start = self.addr();
        addr >= start
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= start + self.len as u64)
    }

    /// A narrower view of this region.
    pub fn subrange(&self, offset: usize, len: usize) -> Result<DmaRegion, DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(DmaRegion {
                mapping: self.mapping.clone(),
                offset: self.offset + offset,
                len,
            }),
            _ => Err(DmaError::InvalidParam(format!(
                "range {offset:#x}+{len:#x} is outside a {:#x} byte region",
                self.len
            ))),
        }
    }

    /// Copy `data` to the start of this region.
    pub fn write(&self, data: &[u8]) -> Result<(), DmaError> {
        if data.len() > self.len {
            return Err(DmaError::InvalidParam(format!(
                "{} bytes do not fit a {} byte region",
                data.len(),
                self.len
            )));
        }
        // SAFETY: the destination is inside a live mapping (checked above) and `data`
        // is a separate Rust allocation or an earlier copy out of device memory.
        unsafe { std::ptr::copy(data.as_ptr(), self.as_ptr(), data.len()) };
        Ok(())
    }

    /// Copy the start of this region into `out`.
    pub fn read(&self, out: &mut [u8]) -> Result<(), DmaError> {
        if out.len() > self.len {
            return Err(DmaError::InvalidParam(format!(
                "cannot read {} bytes from a {} byte region",
                out.len(),
                self.len
            )));
        }
        // SAFETY: the source is inside a live mapping (checked above).
        unsafe { std::ptr::copy(self.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copy all of `src` to the start of this region. The two may overlap.
    pub fn copy_from(&self, src: &DmaRegion) -> Result<(), DmaError> {
        if src.len > self.len {
            return Err(DmaError::InvalidParam(format!(
                "cannot copy {} bytes into a {} byte region",
                src.len, self.len
            )));
        }
        // SAFETY: both ranges are inside live mappings; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.as_ptr(), self.as_ptr(), src.len) };
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

struct ArenaEntry {
    id: BufferId,
    size: usize,
    mapping: Arc<Mapping>,
}

#[derive(Default)]
struct Arena {
    next_id: u64,
    live: BTreeMap<usize, ArenaEntry>,
}

static ARENA: OnceLock<Mutex<Arena>> = OnceLock::new();

fn arena() -> Result<MutexGuard<'static, Arena>, DmaError> {
    ARENA
        .get_or_init(|| Mutex::new(Arena::default()))
        .lock()
        .map_err(|e| DmaError::Internal(format!("Failed when locking buffer arena: {e}")))
}

fn release(id: BufferId, base: usize) -> Result<(), DmaError> {
    let mut arena = arena()?;
    match arena.live.get(&base) {
        Some(entry) if entry.id == id => {
            arena.live.remove(&base);
            trace!("Released buffer {id:?} at {base:#x}");
            Ok(())
        }
        _ => Err(DmaError::InvalidParam(format!(
            "buffer {id:?} at {base:#x} is not a live allocation"
        ))),
    }
}

/// Resolve a host address range to the live buffer that contains it.
pub(crate) fn resolve_host(addr: u64, len: u64) -> Result<DmaRegion, DmaError> {
    let arena = arena()?;
    let found = arena
        .live
        .range(..=addr as usize)
        .next_back()
        .map(|(base, entry)| (*base, entry));
    match found {
        Some((base, entry)) => {
            let region = DmaRegion {
                mapping: entry.mapping.clone(),
                offset: 0,
                len: entry.size,
            };
            if !region.contains(addr, len) {
                return Err(DmaError::InvalidParam(format!(
                    "host range {addr:#x}+{len:#x} runs past buffer {:?} at {base:#x}",
                    entry.id
                )));
            }
            region.subrange((addr as usize) - base, len as usize)
        }
        None => Err(DmaError::InvalidParam(format!(
            "host range {addr:#x}+{len:#x} is not inside an aligned buffer"
        ))),
    }
}

/// A page-aligned host buffer usable as a DMA source or destination.
///
/// Data the engine writes into a buffer lands asynchronously; read it only after the
/// transfer targeting it has completed.
pub struct AlignedBuffer {
    id: BufferId,
    size: usize,
    mapping: Arc<Mapping>,
    released: bool,
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("id", &self.id)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size)
            .field("mapped", &self.mapping.len())
            .finish()
    }
}

impl AlignedBuffer {
    /// Allocate a page-aligned buffer of at least `size` bytes.
    ///
    /// # Returns: `Result<AlignedBuffer, DmaError>`
    /// * `Ok(AlignedBuffer)` - Zero-filled buffer, pointer aligned to [`page_size`]
    /// * `Err(DmaError::InvalidParam)` - `size` is zero
    /// * `Err(DmaError::Mmap)` - The reservation failed
    pub fn allocate(size: usize) -> Result<Self, DmaError> {
        if size == 0 {
            return Err(DmaError::InvalidParam(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let mapping = Arc::new(Mapping::anonymous(size)?);
        let base = mapping.as_ptr() as usize;
        let mut arena = arena()?;
        arena.next_id += 1;
        let id = BufferId(arena.next_id);
        arena.live.insert(
            base,
            ArenaEntry {
                id,
                size,
                mapping: mapping.clone(),
            },
        );
        debug!("Allocated buffer {id:?}: {size} bytes at {base:#x}");
        Ok(AlignedBuffer {
            id,
            size,
            mapping,
            released: false,
        })
    }

    /// Release the buffer. Transfers still holding part of it keep the memory mapped
    /// until they complete.
    pub fn free(mut self) -> Result<(), DmaError> {
        self.released = true;
        release(self.id, self.mapping.as_ptr() as usize)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.as_ptr() as u64
    }

    /// Requested size.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Size of the reservation, rounded up to whole pages.
    pub fn mapped_len(&self) -> usize {
        self.mapping.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is live for as long as self and holds at least `size` bytes.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes this the only slice handed out.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.size) }
    }

    /// The whole buffer as a region for DMA mapping.
    pub fn region(&self) -> DmaRegion {
        DmaRegion {
            mapping: self.mapping.clone(),
            offset: 0,
            len: self.size,
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = release(self.id, self.mapping.as_ptr() as usize) {
                warn!("{e}");
            }
        }
    }
}
