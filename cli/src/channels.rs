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

use fpga_dma::{DmaError, DmaHandle};

/// Lists the channels of the accelerator with their register base and status
pub fn channels_handler(handle: &DmaHandle) -> Result<String, DmaError> {
    let mut lines = vec![format!(
        "{}: {} DMA channel(s)",
        handle.accelerator().name(),
        handle.channel_count()
    )];
    for (index, base) in handle.channel_bases().iter().enumerate() {
        let status = match handle.open_channel(index) {
            Ok(ch) => {
                let status = ch.status().map(|s| format!("{s:?}"));
                ch.close().map_err(|(_, e)| e)?;
                status?
            }
            Err(e @ DmaError::Busy(_)) => format!("in use ({e})"),
            Err(e) => return Err(e),
        };
        lines.push(format!("channel {index} at {base:#x}: {status}"));
    }
    Ok(lines.join("\n"))
}
