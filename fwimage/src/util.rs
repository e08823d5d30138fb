/*
 * SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt;

/// A small wrapper to format a byte slice as lowercase hex in [`fmt::Debug`]
/// output.
#[derive(Clone, Copy)]
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Trim trailing bytes equal to `value`. Intermediate occurrences before the
/// last differing byte are kept.
pub fn trim_end_fill(data: &[u8], value: u8) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| *b != value)
        .map(|pos| pos + 1)
        .unwrap_or_default();

    &data[..end]
}

/// Return the range `[offset, offset + size)` clipped to `len`.
pub fn clip_range(offset: u64, size: u64, len: usize) -> (usize, usize) {
    let len = len as u64;
    let start = offset.min(len);
    let end = offset.saturating_add(size).min(len);

    (start as usize, end as usize)
}
