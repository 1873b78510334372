// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Retention-window sizing from free space on the watch filesystem.

use std::path::Path;

use nix::sys::statvfs::statvfs;

use crate::config::RetentionPolicy;
use crate::error::{DriverError, Result};

/// How many completed frame files to retain at once, given `policy` and the
/// per-frame size in bytes. `Auto` reserves half of the free space on
/// `watch_path`'s filesystem for frame files, matching the original's
/// `f_blocks / nb_block_for_image / 2` sizing.
pub fn retained_frame_count(policy: RetentionPolicy, watch_path: &Path, frame_bytes: u64) -> Result<u32> {
    match policy {
        RetentionPolicy::KeepAll => Ok(u32::MAX),
        RetentionPolicy::KeepLast(n) => Ok(n),
        RetentionPolicy::Auto => {
            let stats = statvfs(watch_path).map_err(DriverError::Sys)?;
            let block_size = stats.fragment_size().max(stats.block_size());
            let free_bytes = stats.blocks_free() as u64 * block_size as u64;
            let frame_bytes = frame_bytes.max(1);
            let capacity = free_bytes / frame_bytes / 2;
            Ok(capacity.min(u32::MAX as u64) as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_all_ignores_filesystem() {
        let count = retained_frame_count(RetentionPolicy::KeepAll, Path::new("/"), 1_000_000).unwrap();
        assert_eq!(count, u32::MAX);
    }

    #[test]
    fn keep_last_returns_configured_value() {
        let count = retained_frame_count(RetentionPolicy::KeepLast(16), Path::new("/"), 1_000_000).unwrap();
        assert_eq!(count, 16);
    }

    #[test]
    fn auto_sizes_from_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let count = retained_frame_count(RetentionPolicy::Auto, dir.path(), 4096).unwrap();
        assert!(count > 0);
    }
}
