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

//! Splitting transfers into hardware-sized pieces.
//!
//! Nothing here touches a device. The channel asks for pieces and then issues them in
//! the order returned, which is always ascending in address.

use crate::config::{ALIGN_BYTES, BURST_BYTES};
use crate::error::DmaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Piece {
    /// Moved through the register window. Offsets are relative to the transfer start.
    Window { offset: u64, len: u64 },
    /// Moved by descriptors. Device side starts and ends on a line boundary.
    Dma { offset: u64, len: u64 },
}

/// Split a transfer touching device memory at `dev_addr` into an unaligned head, a
/// line-aligned middle and an unaligned tail.
pub(crate) fn split_device_range(dev_addr: u64, len: u64) -> Vec<Piece> {
    let mut pieces = Vec::with_capacity(3);
    let misalign = dev_addr % ALIGN_BYTES;
    let head = if misalign == 0 {
        0
    } else {
        (ALIGN_BYTES - misalign).min(len)
    };
    if head > 0 {
        pieces.push(Piece::Window {
            offset: 0,
            len: head,
        });
    }
    let rest = len - head;
    let tail = rest % ALIGN_BYTES;
    let middle = rest - tail;
    if middle > 0 {
        pieces.push(Piece::Dma {
            offset: head,
            len: middle,
        });
    }
    if tail > 0 {
        pieces.push(Piece::Window {
            offset: head + middle,
            len: tail,
        });
    }
    pieces
}

/// `(offset, len)` chunks of at most `chunk` bytes covering `len`.
pub(crate) fn chunks(len: u64, chunk: u64) -> impl Iterator<Item = (u64, u64)> {
    (0..len.div_ceil(chunk)).map(move |i| {
        let offset = i * chunk;
        (offset, chunk.min(len - offset))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BurstSpan {
    pub offset: u64,
    pub len: u64,
    /// Lines per burst.
    pub burst: u8,
}

/// Split a line-aligned host-side range so that 4-line bursts never cross a 256 byte
/// boundary of the host address.
pub(crate) fn split_bursts(host_addr: u64, len: u64) -> Vec<BurstSpan> {
    let mut spans = Vec::with_capacity(3);
    let to_boundary = (BURST_BYTES - host_addr % BURST_BYTES) % BURST_BYTES;
    let head = to_boundary.min(len);
    if head > 0 {
        spans.push(BurstSpan {
            offset: 0,
            len: head,
            burst: 1,
        });
    }
    let rest = len - head;
    let middle = rest - rest % BURST_BYTES;
    if middle > 0 {
        spans.push(BurstSpan {
            offset: head,
            len: middle,
            burst: (BURST_BYTES / ALIGN_BYTES) as u8,
        });
    }
    if rest > middle {
        spans.push(BurstSpan {
            offset: head + middle,
            len: rest - middle,
            burst: 1,
        });
    }
    spans
}

/// Reject device-to-device copies whose destination starts inside the source.
pub(crate) fn check_overlap(src: u64, dst: u64, len: u64) -> Result<(), DmaError> {
    if src < dst && dst < src.saturating_add(len) {
        return Err(DmaError::NotSupported(format!(
            "overlapping device copy {src:#x} -> {dst:#x} of {len:#x} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn is_line_aligned(value: u64) -> bool {
    value % ALIGN_BYTES == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    fn covered(pieces: &[Piece]) -> Vec<(u64, u64)> {
        pieces
            .iter()
            .map(|p| match *p {
                Piece::Window { offset, len } | Piece::Dma { offset, len } => (offset, len),
            })
            .collect()
    }

    #[gtest]
    #[rstest]
    #[case::aligned(0x1000, 4096, vec![Piece::Dma { offset: 0, len: 4096 }])]
    #[case::tiny(0x3, 5, vec![Piece::Window { offset: 0, len: 5 }])]
    #[case::short_aligned(0x40, 17, vec![Piece::Window { offset: 0, len: 17 }])]
    #[case::head_and_tail(
        0x3,
        200,
        vec![
            Piece::Window { offset: 0, len: 61 },
            Piece::Dma { offset: 61, len: 128 },
            Piece::Window { offset: 189, len: 11 },
        ]
    )]
    #[case::head_only(0x3d, 67, vec![Piece::Window { offset: 0, len: 3 }, Piece::Dma { offset: 3, len: 64 }])]
    fn device_range_pieces(#[case] addr: u64, #[case] len: u64, #[case] expected: Vec<Piece>) {
        expect_eq!(split_device_range(addr, len), expected);
    }

    #[gtest]
    #[rstest]
    fn pieces_tile_the_transfer(
        #[values(0, 3, 5, 7, 61, 64)] addr: u64,
        #[values(1, 63, 64, 65, 4096, 4096 + 61)] len: u64,
    ) {
        let pieces = split_device_range(addr, len);
        let mut next = 0;
        for (offset, n) in covered(&pieces) {
            expect_eq!(offset, next);
            next += n;
        }
        expect_eq!(next, len);
        for piece in pieces {
            if let Piece::Dma { offset, len } = piece {
                expect_true!(is_line_aligned(addr + offset));
                expect_true!(is_line_aligned(len));
            }
        }
    }

    #[gtest]
    #[rstest]
    #[case::on_boundary(0x1000, 1024, vec![(0, 1024, 4)])]
    #[case::short(0x1040, 64, vec![(0, 64, 1)])]
    #[case::head_middle_tail(0x10c0, 0x280, vec![(0, 0x40, 1), (0x40, 0x200, 4), (0x240, 0x40, 1)])]
    fn burst_spans(#[case] addr: u64, #[case] len: u64, #[case] expected: Vec<(u64, u64, u8)>) {
        let spans: Vec<_> = split_bursts(addr, len)
            .into_iter()
            .map(|s| (s.offset, s.len, s.burst))
            .collect();
        expect_eq!(spans, expected);
    }

    #[gtest]
    fn chunks_cover_length() {
        expect_eq!(
            chunks(2500, 1024).collect::<Vec<_>>(),
            vec![(0, 1024), (1024, 1024), (2048, 452)]
        );
        expect_eq!(chunks(0, 1024).count(), 0);
    }

    #[gtest]
    #[rstest]
    #[case::disjoint(0, 0x1000, 0x1000, ok(anything()))]
    #[case::backwards(0x800, 0x0, 0x1000, ok(anything()))]
    #[case::overlapping(0, 0x800, 0x1000, err(displays_as(contains_substring("DmaError::NotSupported"))))]
    fn overlap<M: for<'a> Matcher<&'a std::result::Result<(), DmaError>>>(
        #[case] src: u64,
        #[case] dst: u64,
        #[case] len: u64,
        #[case] condition: M,
    ) {
        expect_that!(check_overlap(src, dst, len), condition);
    }
}
