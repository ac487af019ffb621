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

//! Accelerator backend for a DFL port device (`/dev/dfl-port.N`).
//!
//! The AFU register space is region 0 of the port, mapped into the process. Host memory
//! is made reachable by the device with the port's DMA map ioctl, which pins the pages
//! and returns the I/O address to put in descriptors.

use crate::buffer::{DmaRegion, page_size, round_up};
use crate::error::DmaError;
use crate::mmio::{Accelerator, MmioRegion};
use crate::system_io::{fs_open_rw, fs_read_dir};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub static DEV_DIR: &str = "/dev";
const PORT_PREFIX: &str = "dfl-port.";

const DFL_FPGA_MAGIC: u8 = 0xB6;
const DFL_PORT_BASE: u8 = 0x40;
const AFU_MMIO_REGION: u32 = 0;

pub const DFL_PORT_REGION_READ: u32 = 1 << 0;
pub const DFL_PORT_REGION_WRITE: u32 = 1 << 1;
pub const DFL_PORT_REGION_MMAP: u32 = 1 << 2;

/// `struct dfl_fpga_port_region_info`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionInfo {
    argsz: u32,
    pub flags: u32,
    pub index: u32,
    padding: u32,
    pub size: u64,
    pub offset: u64,
}

/// `struct dfl_fpga_port_dma_map`
#[repr(C)]
#[derive(Debug, Default)]
pub struct DmaMap {
    argsz: u32,
    flags: u32,
    user_addr: u64,
    length: u64,
    iova: u64,
}

/// `struct dfl_fpga_port_dma_unmap`
#[repr(C)]
#[derive(Debug, Default)]
pub struct DmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
}

nix::ioctl_readwrite_bad!(
    /// `DFL_FPGA_PORT_GET_REGION_INFO`
    port_get_region_info,
    nix::request_code_none!(DFL_FPGA_MAGIC, DFL_PORT_BASE + 2),
    RegionInfo
);

nix::ioctl_readwrite_bad!(
    /// `DFL_FPGA_PORT_DMA_MAP`
    port_dma_map,
    nix::request_code_none!(DFL_FPGA_MAGIC, DFL_PORT_BASE + 3),
    DmaMap
);

nix::ioctl_readwrite_bad!(
    /// `DFL_FPGA_PORT_DMA_UNMAP`
    port_dma_unmap,
    nix::request_code_none!(DFL_FPGA_MAGIC, DFL_PORT_BASE + 4),
    DmaUnmap
);

/// Port device nodes in `dir`, sorted by name.
///
/// # Returns: `Result<Vec<PathBuf>, DmaError>`
/// * `Ok(Vec<PathBuf>)` - Paths of `dfl-port.*` entries, possibly empty
/// * `Err(DmaError::IOReadDir)` - `dir` cannot be listed
pub fn list_ports(dir: &Path) -> Result<Vec<PathBuf>, DmaError> {
    let mut names: Vec<String> = fs_read_dir(dir)?
        .into_iter()
        .filter(|name| name.starts_with(PORT_PREFIX))
        .collect();
    names.sort();
    trace!("Found ports {names:?} in {dir:?}");
    Ok(names.into_iter().map(|name| dir.join(name)).collect())
}

#[derive(Debug)]
pub struct DflPort {
    path: PathBuf,
    file: File,
    mmio: MmioRegion,
    /// Regions mapped for DMA, by I/O address. Holding them keeps the pages alive.
    mappings: Mutex<HashMap<u64, DmaRegion>>,
}

impl DflPort {
    /// Open a port device and map its AFU register region.
    ///
    /// # Arguments
    ///
    /// * `path` - The port device node, e.g. `/dev/dfl-port.0`
    ///
    /// # Returns: `Result<DflPort, DmaError>`
    /// * `Ok(DflPort)` - Port with its AFU registers mapped
    /// * `Err(DmaError::IORead)` - The device node cannot be opened
    /// * `Err(DmaError::Ioctl)` - The node is not a DFL port
    /// * `Err(DmaError::NotSupported)` - The AFU region cannot be mapped
    pub fn open(path: &Path) -> Result<Self, DmaError> {
        let file = fs_open_rw(path)?;
        let region = region_info(&file, path, AFU_MMIO_REGION)?;
        debug!("AFU region of {path:?}: {region:?}");
        if region.flags & DFL_PORT_REGION_MMAP == 0 {
            return Err(DmaError::NotSupported(format!(
                "AFU region of {path:?} cannot be mapped"
            )));
        }
        let mmio = MmioRegion::map(&file, region.offset, region.size as usize)?;
        info!("Opened {path:?}, {:#x} bytes of AFU registers", region.size);
        Ok(DflPort {
            path: path.to_owned(),
            file,
            mmio,
            mappings: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mappings(&self) -> Result<MutexGuard<'_, HashMap<u64, DmaRegion>>, DmaError> {
        self.mappings
            .lock()
            .map_err(|e| DmaError::Internal(format!("Failed when locking DMA mappings: {e}")))
    }
}

fn region_info(file: &File, path: &Path, index: u32) -> Result<RegionInfo, DmaError> {
    let mut info = RegionInfo {
        argsz: size_of::<RegionInfo>() as u32,
        index,
        ..RegionInfo::default()
    };
    // SAFETY: `info` is a properly sized and initialized dfl_fpga_port_region_info.
    unsafe { port_get_region_info(file.as_raw_fd(), &mut info) }.map_err(|e| {
        DmaError::Ioctl {
            request: "DFL_FPGA_PORT_GET_REGION_INFO",
            file: path.to_owned(),
            e,
        }
    })?;
    Ok(info)
}

impl Accelerator for DflPort {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn read_mmio32(&self, offset: u64) -> Result<u32, DmaError> {
        self.mmio.read32(offset)
    }

    fn read_mmio64(&self, offset: u64) -> Result<u64, DmaError> {
        self.mmio.read64(offset)
    }

    fn write_mmio32(&self, offset: u64, value: u32) -> Result<(), DmaError> {
        self.mmio.write32(offset, value)
    }

    fn write_mmio64(&self, offset: u64, value: u64) -> Result<(), DmaError> {
        self.mmio.write64(offset, value)
    }

    fn map_dma(&self, region: &DmaRegion) -> Result<u64, DmaError> {
        let mut map = DmaMap {
            argsz: size_of::<DmaMap>() as u32,
            user_addr: region.addr(),
            length: round_up(region.len(), page_size()) as u64,
            ..DmaMap::default()
        };
        // SAFETY: `map` is a properly sized dfl_fpga_port_dma_map describing memory that
        // `region` keeps mapped until the matching unmap.
        unsafe { port_dma_map(self.file.as_raw_fd(), &mut map) }.map_err(|e| {
            DmaError::Ioctl {
                request: "DFL_FPGA_PORT_DMA_MAP",
                file: self.path.clone(),
                e,
            }
        })?;
        debug!(
            "Mapped {:#x} bytes at {:#x} for DMA at {:#x}",
            map.length, map.user_addr, map.iova
        );
        self.mappings()?.insert(map.iova, region.clone());
        Ok(map.iova)
    }

    fn unmap_dma(&self, iova: u64) -> Result<(), DmaError> {
        let mut unmap = DmaUnmap {
            argsz: size_of::<DmaUnmap>() as u32,
            iova,
            ..DmaUnmap::default()
        };
        // SAFETY: `unmap` is a properly sized dfl_fpga_port_dma_unmap.
        unsafe { port_dma_unmap(self.file.as_raw_fd(), &mut unmap) }.map_err(|e| {
            DmaError::Ioctl {
                request: "DFL_FPGA_PORT_DMA_UNMAP",
                file: self.path.clone(),
                e,
            }
        })?;
        self.mappings()?.remove(&iova);
        trace!("Unmapped I/O address {iova:#x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn ioctl_layouts_match_the_kernel() {
        expect_eq!(size_of::<RegionInfo>(), 32);
        expect_eq!(size_of::<DmaMap>(), 32);
        expect_eq!(size_of::<DmaUnmap>(), 16);
    }

    #[gtest]
    fn lists_only_port_nodes_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["dfl-port.1", "dfl-fme.0", "dfl-port.0", "null"] {
            File::create(dir.path().join(name))?;
        }
        expect_eq!(
            list_ports(dir.path())?,
            vec![dir.path().join("dfl-port.0"), dir.path().join("dfl-port.1")]
        );
        Ok(())
    }

    #[gtest]
    fn missing_directory_is_reported() {
        expect_that!(
            list_ports(Path::new("/nonexistent/dev")),
            err(displays_as(contains_substring("DmaError::IOReadDir")))
        );
    }

    #[gtest]
    fn plain_file_is_not_a_port() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        expect_that!(
            DflPort::open(file.path()),
            err(displays_as(contains_substring("DFL_FPGA_PORT_GET_REGION_INFO")))
        );
        Ok(())
    }
}
