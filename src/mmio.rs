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

//! Register access to an accelerator and the memory mapping it exposes.
//!
//! [`Accelerator`] is the seam between the engine and a device: the engine only ever
//! reads and writes 32/64-bit registers at byte offsets in the accelerator's register
//! space, and asks the accelerator to make host memory reachable by DMA. The real port
//! device ([`crate::dfl::DflPort`]) and the in-process model ([`crate::sim::SimAccelerator`])
//! both implement it.

use crate::buffer::DmaRegion;
use crate::error::DmaError;
use log::{trace, warn};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

pub trait Accelerator: Send + Sync {
    /// A short description used in log messages, e.g. the device path.
    fn name(&self) -> String;
    fn read_mmio32(&self, offset: u64) -> Result<u32, DmaError>;
    fn read_mmio64(&self, offset: u64) -> Result<u64, DmaError>;
    fn write_mmio32(&self, offset: u64, value: u32) -> Result<(), DmaError>;
    fn write_mmio64(&self, offset: u64, value: u64) -> Result<(), DmaError>;
    /// Make `region` reachable by the device and return its I/O virtual address.
    ///
    /// The accelerator may keep a clone of the region; it must stay mapped until
    /// [`Accelerator::unmap_dma`] is called with the returned address.
    fn map_dma(&self, region: &DmaRegion) -> Result<u64, DmaError>;
    fn unmap_dma(&self, iova: u64) -> Result<(), DmaError>;
}

/// A register space mapped from a device file.
#[derive(Debug)]
pub struct MmioRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: Accesses are single volatile loads and stores of naturally aligned words;
// the mapping itself is only released on drop.
unsafe impl Send for MmioRegion {}
// SAFETY: See above.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Map `len` bytes of `file` starting at `offset` for register access.
    ///
    /// # Arguments
    ///
    /// * `file` - Device node (or, in tests, a plain file) opened read/write
    /// * `offset` - Offset of the register region inside the file, page aligned
    /// * `len` - Size of the register region
    ///
    /// # Returns: `Result<MmioRegion, DmaError>`
    /// * `Ok(MmioRegion)` - The mapped region
    /// * `Err(DmaError::InvalidParam)` - Zero length or an offset that does not fit `off_t`
    /// * `Err(DmaError::Mmap)` - The mapping failed
    pub fn map(file: &File, offset: u64, len: usize) -> Result<Self, DmaError> {
        let length = NonZeroUsize::new(len).ok_or_else(|| {
            DmaError::InvalidParam("cannot map an empty register region".to_string())
        })?;
        let file_offset = nix::libc::off_t::try_from(offset).map_err(|_| {
            DmaError::InvalidParam(format!("register region offset {offset:#x} is too large"))
        })?;
        // SAFETY: MAP_SHARED mapping of a file we hold open; the kernel validates the range.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                file_offset,
            )
        }
        .map_err(|e| DmaError::Mmap {
            what: format!("map {len:#x} bytes of registers at {offset:#x}"),
            e,
        })?;
        trace!("Mapped {len:#x} register bytes at {:p}", ptr.as_ptr());
        Ok(MmioRegion { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word_ptr<T>(&self, offset: u64) -> Result<*mut T, DmaError> {
        let size = size_of::<T>() as u64;
        if offset % size != 0 {
            Err(DmaError::InvalidParam(format!(
                "unaligned {size}-byte register access at {offset:#x}"
            )))
        } else if offset.checked_add(size).is_none_or(|end| end > self.len as u64) {
            Err(DmaError::InvalidParam(format!(
                "register offset {offset:#x} is outside the mapped range"
            )))
        } else {
            // SAFETY: in bounds and aligned, checked above.
            Ok(unsafe { self.ptr.as_ptr().cast::<u8>().add(offset as usize).cast::<T>() })
        }
    }

    pub fn read32(&self, offset: u64) -> Result<u32, DmaError> {
        let ptr = self.word_ptr::<u32>(offset)?;
        // SAFETY: word_ptr returned an aligned pointer inside the mapping.
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    pub fn read64(&self, offset: u64) -> Result<u64, DmaError> {
        let ptr = self.word_ptr::<u64>(offset)?;
        // SAFETY: word_ptr returned an aligned pointer inside the mapping.
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    pub fn write32(&self, offset: u64, value: u32) -> Result<(), DmaError> {
        let ptr = self.word_ptr::<u32>(offset)?;
        // SAFETY: word_ptr returned an aligned pointer inside the mapping.
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }

    pub fn write64(&self, offset: u64, value: u64) -> Result<(), DmaError> {
        let ptr = self.word_ptr::<u64>(offset)?;
        // SAFETY: word_ptr returned an aligned pointer inside the mapping.
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are not used after this.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("Failed to unmap register region at {:p}: {e}", self.ptr.as_ptr());
        }
    }
}
