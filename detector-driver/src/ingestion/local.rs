// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Local mode: a filesystem watcher loop that detects completed per-frame
//! image files, reorders them through the pending-frame map, and enforces a
//! retention policy (spec §4.4).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::buffer::retained_frame_count;
use crate::config::RetentionPolicy;
use crate::error::{DriverError, Result};
use crate::image::read_frame;

use super::pending::PendingFrames;
use super::{AcquisitionDescriptor, FrameSink};

pub struct LocalIngestion {
    watch_path: PathBuf,
    retention: RetentionPolicy,
    pending_bound: usize,
    descriptor: Option<AcquisitionDescriptor>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<Mutex<bool>>,
}

impl LocalIngestion {
    pub fn new(watch_path: PathBuf, retention: RetentionPolicy, pending_bound: usize) -> Self {
        Self {
            watch_path,
            retention,
            pending_bound,
            descriptor: None,
            worker: None,
            stop: Arc::new(Mutex::new(false)),
        }
    }

    /// Deletes any frame files left over in `watch_path` from a previous
    /// run, matching the original's `prepareAcq` stale-file sweep.
    pub fn prepare(&mut self, descriptor: AcquisitionDescriptor) -> Result<()> {
        *self.stop.lock().unwrap() = false;
        self.descriptor = Some(descriptor);
        if !self.watch_path.exists() {
            fs::create_dir_all(&self.watch_path).map_err(DriverError::Io)?;
            return Ok(());
        }
        for entry in fs::read_dir(&self.watch_path).map_err(DriverError::Io)? {
            let entry = entry.map_err(DriverError::Io)?;
            if frame_index(&entry.path()).is_some() {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    pub fn start(&mut self, sink: Box<dyn FrameSink>) -> Result<()> {
        let descriptor = self.descriptor.ok_or_else(|| DriverError::Protocol {
            message: "start called before prepare".to_owned(),
        })?;

        let (tx, rx) = channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(tx).map_err(|err| DriverError::Protocol {
            message: format!("failed to create filesystem watcher: {err}"),
        })?;
        watcher
            .watch(&self.watch_path, RecursiveMode::NonRecursive)
            .map_err(|err| DriverError::Protocol {
                message: format!("failed to watch {}: {err}", self.watch_path.display()),
            })?;

        let watch_path = self.watch_path.clone();
        let retention = self.retention;
        let pending_bound = self.pending_bound;
        let stop = Arc::clone(&self.stop);

        let handle = std::thread::Builder::new()
            .name("frame-ingestion".into())
            .spawn(move || run(watcher, rx, watch_path, retention, pending_bound, descriptor, sink, stop))
            .map_err(DriverError::Io)?;
        self.worker = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        *self.stop.lock().unwrap() = true;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
    watch_path: PathBuf,
    retention: RetentionPolicy,
    pending_bound: usize,
    descriptor: AcquisitionDescriptor,
    mut sink: Box<dyn FrameSink>,
    stop: Arc<Mutex<bool>>,
) {
    let mut pending = PendingFrames::new(pending_bound);
    let mut delivered_count = 0usize;

    loop {
        if *stop.lock().unwrap() {
            return;
        }
        let event = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "watcher reported an error");
                continue;
            }
        };
        if !matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        ) {
            continue;
        }

        for path in event.paths {
            let Some(index) = frame_index(&path) else {
                continue;
            };
            if index >= descriptor.nb_images {
                continue;
            }
            match read_frame(&path, descriptor.width, descriptor.height, descriptor.bytes_per_pixel) {
                Ok(buffer) => match pending.insert(index, buffer) {
                    Ok(ready) => {
                        for buffer in ready {
                            let keep_going = sink.on_frame(delivered_count, buffer);
                            delivered_count += 1;
                            if !keep_going {
                                return;
                            }
                        }
                        apply_retention(&watch_path, retention, delivered_count, descriptor.frame_bytes() as u64);
                    }
                    Err(()) => {
                        sink.on_error(DriverError::Overrun { bound: pending_bound });
                        return;
                    }
                },
                // The writer hasn't finished yet; the next `Modify` event
                // for the same path retries the read.
                Err(DriverError::Decode { .. }) => {
                    debug!(path = %path.display(), "frame file not yet complete");
                }
                Err(err) => {
                    sink.on_error(err);
                    return;
                }
            }
        }
    }
}

fn frame_index(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let digits: String = digits.chars().rev().collect();
    digits.parse().ok()
}

fn apply_retention(watch_path: &Path, retention: RetentionPolicy, delivered_count: usize, frame_bytes: u64) {
    let keep = match retention {
        RetentionPolicy::KeepAll => return,
        RetentionPolicy::KeepLast(n) => n as usize,
        RetentionPolicy::Auto => match retained_frame_count(RetentionPolicy::Auto, watch_path, frame_bytes) {
            Ok(n) => n as usize,
            Err(err) => {
                warn!(%err, "failed to size auto retention window, keeping everything");
                return;
            }
        },
    };
    if delivered_count <= keep {
        return;
    }
    let cutoff = delivered_count - keep;
    let Ok(entries) = fs::read_dir(watch_path) else {
        return;
    };
    for entry in entries.flatten() {
        if let Some(index) = frame_index(&entry.path()) {
            if index < cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
