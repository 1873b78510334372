// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Formats the printf-style file-name pattern used in start-verb commands
//! (spec §3 Cached State, §6: "Filenames in start verbs are printf-formatted
//! with one `%d` slot filled from the first image number"). The pattern has
//! exactly one conversion, either `%d`, `%0Nd`, or `%.Nd` (the two zero-pad
//! spellings seen across deployments, e.g. `image_%.5d.cbf`).

use crate::error::{DriverError, Result};

/// Substitutes `number` into `pattern`'s single `%d`-family conversion.
pub fn format_sequence_filename(pattern: &str, number: i64) -> Result<String> {
    let Some(percent) = pattern.find('%') else {
        return Err(DriverError::Protocol {
            message: format!("file pattern {pattern:?} has no %d conversion"),
        });
    };

    let rest = &pattern[percent + 1..];
    let mut chars = rest.char_indices();
    let mut width = 0usize;
    let mut saw_digits = false;

    // Optional `.` precision marker (`%.5d`), or a bare zero-padded width
    // (`%05d`); both mean "zero-pad to this many digits".
    let mut cursor = 0usize;
    if let Some((_, '.')) = chars.clone().next() {
        chars.next();
        cursor = 1;
    }
    for (idx, ch) in chars {
        if ch.is_ascii_digit() {
            width = width * 10 + (ch as usize - '0' as usize);
            saw_digits = true;
            cursor = idx + 1;
        } else {
            break;
        }
    }
    let _ = saw_digits;

    let Some('d') = rest[cursor..].chars().next() else {
        return Err(DriverError::Protocol {
            message: format!("file pattern {pattern:?} has no %d conversion"),
        });
    };

    let conversion_end = percent + 1 + cursor + 1;
    let digits = format!("{number:0width$}", width = width);
    Ok(format!("{}{digits}{}", &pattern[..percent], &pattern[conversion_end..]))
}
