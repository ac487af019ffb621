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

//! Deterministic test data.
//!
//! Buffers are filled from one canonical byte pattern: the low byte of each output of
//! the C library's `rand()` after `srand(PATTERN_SEED)`, the additive feedback generator
//! of glibc. The pattern is generated once and grown on demand, so filling and verifying
//! large buffers costs a memcpy and a compare.

use crate::error::DmaError;
use log::{debug, error};
use std::sync::{Mutex, MutexGuard, OnceLock};

pub const PATTERN_SEED: u32 = 99;

const DEGREE: usize = 31;
const SEPARATION: usize = 3;
const DISCARDED: usize = 310;
const RING: usize = DEGREE + SEPARATION;

/// The pattern generator.
///
/// `r[i] = r[i - 31] + r[i - 3]` over the last 34 words, each output being `r[i] >> 1`.
#[derive(Debug, Clone)]
pub struct PatternGenerator {
    ring: [u32; RING],
    pos: usize,
}

impl PatternGenerator {
    pub fn new(seed: u32) -> Self {
        let mut ring = [0u32; RING];
        let mut word = if seed == 0 { 1 } else { seed as i32 };
        ring[0] = word as u32;
        for slot in ring.iter_mut().take(DEGREE).skip(1) {
            let (hi, lo) = (word / 127_773, word % 127_773);
            word = 16_807 * lo - 2_836 * hi;
            if word < 0 {
                word += i32::MAX;
            }
            *slot = word as u32;
        }
        ring.copy_within(..SEPARATION, DEGREE);
        let mut generator = PatternGenerator { ring, pos: 0 };
        for _ in 0..DISCARDED {
            generator.next_word();
        }
        generator
    }

    /// The next `rand()` value, in `0..=i32::MAX`.
    pub fn next_word(&mut self) -> u32 {
        // ring[pos] holds r[i - 34]
        let word = self.ring[(self.pos + RING - DEGREE) % RING]
            .wrapping_add(self.ring[(self.pos + RING - SEPARATION) % RING]);
        self.ring[self.pos] = word;
        self.pos = (self.pos + 1) % RING;
        word >> 1
    }
}

impl Iterator for PatternGenerator {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        Some((self.next_word() % 256) as u8)
    }
}

struct Pattern {
    bytes: Vec<u8>,
    generator: PatternGenerator,
}

static PATTERN: OnceLock<Mutex<Pattern>> = OnceLock::new();

fn pattern(len: usize) -> Result<MutexGuard<'static, Pattern>, DmaError> {
    let mut guard = PATTERN
        .get_or_init(|| {
            Mutex::new(Pattern {
                bytes: Vec::new(),
                generator: PatternGenerator::new(PATTERN_SEED),
            })
        })
        .lock()
        .map_err(|e| DmaError::Internal(format!("Failed when locking test pattern: {e}")))?;
    if guard.bytes.len() < len {
        let grow = len - guard.bytes.len();
        debug!("Extending test pattern by {grow} bytes to {len}");
        let Pattern { bytes, generator } = &mut *guard;
        bytes.extend(generator.take(grow));
    }
    Ok(guard)
}

/// The first byte of the pattern.
pub fn first_pattern_byte() -> u8 {
    PatternGenerator::new(PATTERN_SEED).next().unwrap_or_default()
}

/// Fill `buf` with the pattern.
pub fn fill(buf: &mut [u8]) -> Result<(), DmaError> {
    let pattern = pattern(buf.len())?;
    buf.copy_from_slice(&pattern.bytes[..buf.len()]);
    Ok(())
}

/// Compare `buf` with the pattern.
///
/// # Returns: `Result<(), DmaError>`
/// * `Ok(())` - Every byte matches
/// * `Err(DmaError::Mismatch)` - The first differing offset, with expected and actual values
pub fn verify(buf: &[u8]) -> Result<(), DmaError> {
    let pattern = pattern(buf.len())?;
    let expected = &pattern.bytes[..buf.len()];
    if buf == expected {
        return Ok(());
    }
    match buf.iter().zip(expected).position(|(a, e)| a != e) {
        Some(offset) => {
            let err = DmaError::Mismatch {
                offset,
                expected: expected[offset],
                actual: buf[offset],
            };
            error!("{err}");
            Err(err)
        }
        None => Ok(()),
    }
}

pub fn clear(buf: &mut [u8]) {
    buf.fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    fn generator_matches_reference_sequence() {
        // srand(99); rand() % 256
        let first: Vec<u8> = PatternGenerator::new(PATTERN_SEED).take(4).collect();
        expect_eq!(first, vec![148, 212, 21, 181]);
        expect_eq!(first_pattern_byte(), 148);
    }

    #[gtest]
    #[rstest]
    #[case::seed_one(1)]
    #[case::seed_zero_is_one(0)]
    fn generator_words_match_libc_rand(#[case] seed: u32) {
        let mut generator = PatternGenerator::new(seed);
        let words: Vec<u32> = (0..3).map(|_| generator.next_word()).collect();
        expect_eq!(words, vec![1_804_289_383, 846_930_886, 1_681_692_777]);
    }

    #[gtest]
    #[rstest]
    #[case::small(17)]
    #[case::page(4096)]
    #[case::large(3 * 1024 * 1024 + 5)]
    fn fill_then_verify(#[case] len: usize) -> Result<()> {
        let mut buf = vec![0u8; len];
        fill(&mut buf)?;
        verify(&buf)?;
        expect_eq!(buf[0], first_pattern_byte());
        Ok(())
    }

    #[gtest]
    fn mismatch_reports_first_bad_offset() -> Result<()> {
        let mut buf = vec![0u8; 256];
        fill(&mut buf)?;
        buf[200] ^= 0xff;
        buf[201] ^= 0xff;
        expect_that!(
            verify(&buf),
            err(displays_as(contains_substring("invalid data at 0xc8")))
        );
        Ok(())
    }

    #[gtest]
    fn cleared_buffer_fails_verification() {
        let mut buf = vec![1u8; 64];
        clear(&mut buf);
        expect_true!(buf.iter().all(|b| *b == 0));
        expect_that!(verify(&buf), err(anything()));
    }
}
