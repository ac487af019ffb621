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

//! fpga-dma - a user-space DMA engine for FPGA accelerators.
//!
//! The engine moves data between host memory and the memory attached to an FPGA through
//! memory-to-memory DMA channels exposed in the accelerator's register space. It:
//! - Allocates page-aligned, pinned host buffers ([`buffer`])
//! - Opens channels found in the device feature list ([`channel`], [`regs`])
//! - Splits transfers at alignment and size boundaries and queues hardware descriptors
//! - Completes transfers synchronously or through callbacks run by [`DmaChannel::poll`]
//! - Offers a small-transfer fast path over a DMA-mapped scratch buffer
//!
//! # Accelerators
//!
//! Register access and DMA mapping go through the [`Accelerator`] trait. Two
//! implementations are provided:
//! - [`dfl::DflPort`] - A Linux DFL port device such as `/dev/dfl-port.0`
//! - [`sim::SimAccelerator`] - An in-process model of the dispatcher, used by the tests and
//!   the bench's `--sim` mode
//!
//! # Configuration
//!
//! Polling budgets and per-channel limits come from `/usr/lib/fpga-dma/config.toml`,
//! overridden by `/etc/fpga-dma/config.toml`. See [`config`].
//!
//! # Example
//!
//! ```no_run
//! use fpga_dma::{AlignedBuffer, DmaHandle, TransferType, sim::SimAccelerator};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), fpga_dma::DmaError> {
//! let handle = DmaHandle::open(Arc::new(SimAccelerator::new(1)))?;
//! let mut ch = handle.open_channel(0)?;
//! let mut buf = AlignedBuffer::allocate(4096)?;
//! fpga_dma::verify::fill(buf.as_mut_slice())?;
//!
//! let mut transfer = ch.init_transfer();
//! transfer
//!     .set_src(buf.addr())
//!     .set_dst(0)
//!     .set_len(4096)
//!     .set_type(TransferType::HostToFpga);
//! ch.start_transfer(&transfer)?;
//! # Ok(())
//! # }
//! ```

pub mod bench;
pub mod buffer;
pub mod channel;
pub mod completion;
pub mod config;
pub mod dfl;
pub mod error;
pub mod mmio;
mod plan;
pub mod regs;
pub mod sim;
pub mod system_io;
pub mod transfer;
pub mod verify;

pub use buffer::AlignedBuffer;
pub use channel::{DmaChannel, DmaHandle};
pub use error::{DmaError, FpgaResult};
pub use mmio::Accelerator;
pub use transfer::{Transfer, TransferCallback, TransferOutcome, TransferType};
