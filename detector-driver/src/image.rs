// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Raw per-frame image file decoding: fixed 1024-byte header skip followed
//! by a raw pixel payload (spec §4.4).

use std::alloc::{alloc, dealloc, Layout};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use crate::error::{DriverError, Result};

/// Bytes to skip at the start of every frame file before the raw pixel
/// payload begins.
pub const HEADER_LEN: u64 = 1024;

/// 16-byte-aligned owned pixel buffer, matching the alignment the detector's
/// DMA engine assumes when it writes frame files.
pub struct FrameBuffer {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

// SAFETY: `FrameBuffer` owns its allocation exclusively; no aliasing occurs
// across threads because each buffer is handed to exactly one consumer.
unsafe impl Send for FrameBuffer {}

impl FrameBuffer {
    /// A zero-length placeholder, used where no pixel payload is available
    /// (e.g. remote-mode ingestion synthesizing frame arrivals without a
    /// data transport).
    pub fn empty() -> Self {
        Self::alloc(0)
    }

    fn alloc(len: usize) -> Self {
        let layout = match Layout::from_size_align(len.max(1), 16) {
            Ok(layout) => layout,
            Err(err) => panic!("frame buffer size {len} does not fit a valid layout: {err}"),
        };
        // SAFETY: `layout` has non-zero size; the returned pointer is
        // checked for null before use.
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null(), "frame buffer allocation failed");
        Self { ptr, len, layout }
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Deref`; exclusive access is guaranteed by `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` are exactly what `alloc` returned/was given.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Reads one frame file at `path`, skipping [`HEADER_LEN`] header bytes and
/// reading exactly `width * height * bytes_per_pixel` bytes of payload.
///
/// A short read (the writer hasn't finished yet) is reported as
/// [`DriverError::Decode`] with a reason starting `"short read"`; callers
/// poll/retry rather than treating this as fatal, matching the original's
/// "not yet complete" handling.
pub fn read_frame(path: &Path, width: usize, height: usize, bytes_per_pixel: usize) -> Result<FrameBuffer> {
    let expected_len = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(bytes_per_pixel))
        .ok_or_else(|| DriverError::Decode {
            path: path.to_owned(),
            reason: "frame dimensions overflow usize".to_owned(),
        })?;

    let mut file = File::open(path).map_err(DriverError::Io)?;
    file.seek(SeekFrom::Start(HEADER_LEN)).map_err(DriverError::Io)?;

    let mut buffer = FrameBuffer::alloc(expected_len);
    let mut read_so_far = 0;
    loop {
        match file.read(&mut buffer[read_so_far..]) {
            Ok(0) => break,
            Ok(n) => read_so_far += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(DriverError::Io(err)),
        }
    }

    if read_so_far != expected_len {
        return Err(DriverError::Decode {
            path: path.to_owned(),
            reason: format!("short read: got {read_so_far} of {expected_len} bytes"),
        });
    }

    Ok(buffer)
}
