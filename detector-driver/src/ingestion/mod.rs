// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C5: the frame ingestion pipeline. Dispatches to a local filesystem
//! watcher or a remote (no-local-storage) mode behind one capability so the
//! acquisition state machine never duplicates pending-frame or retention
//! logic (spec §9 design note).

mod local;
mod pending;
mod remote;

use std::sync::Arc;

use crate::config::{Deployment, DriverConfig};
use crate::error::Result;
use crate::image::FrameBuffer;

/// Receives frames as the pipeline delivers them, strictly in order.
pub trait FrameSink: Send {
    /// Delivers frame `index`. Returns `false` to request delivery stop
    /// (spec §4.4: "each `new_frame_ready` call to the framework returns a
    /// 'continue' boolean; a `false` latches a stop") — a clean, caller
    /// requested halt, distinct from the error path below.
    fn on_frame(&mut self, index: usize, buffer: FrameBuffer) -> bool;
    fn on_error(&mut self, error: crate::error::DriverError);
}

/// Per-acquisition parameters the pipeline needs besides the deployment
/// mode: expected frame count and raw payload geometry.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionDescriptor {
    pub nb_images: usize,
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
}

impl AcquisitionDescriptor {
    pub fn frame_bytes(&self) -> usize {
        self.width * self.height * self.bytes_per_pixel
    }
}

/// The frame ingestion capability. Construct once per [`DriverConfig`] and
/// reuse it across acquisitions.
pub enum Ingestion {
    Local(local::LocalIngestion),
    Remote(remote::RemoteIngestion),
}

impl Ingestion {
    pub fn new(config: &DriverConfig, channel: Arc<crate::channel::ControlChannel>) -> Self {
        match &config.deployment {
            Deployment::Local { watch_path } => {
                Ingestion::Local(local::LocalIngestion::new(watch_path.clone(), config.retention, config.pending_frame_bound))
            }
            Deployment::Remote => Ingestion::Remote(remote::RemoteIngestion::new(channel)),
        }
    }

    /// Clears stale state ahead of a new acquisition (stale files for
    /// `Local`, the acquired-image counter baseline for `Remote`).
    pub fn prepare(&mut self, descriptor: AcquisitionDescriptor) -> Result<()> {
        match self {
            Ingestion::Local(inner) => inner.prepare(descriptor),
            Ingestion::Remote(inner) => inner.prepare(descriptor),
        }
    }

    /// Starts delivering frames to `sink` on a background thread. Returns
    /// once the watcher/poll thread is running; `stop` joins it.
    pub fn start(&mut self, sink: Box<dyn FrameSink>) -> Result<()> {
        match self {
            Ingestion::Local(inner) => inner.start(sink),
            Ingestion::Remote(inner) => inner.start(sink),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Ingestion::Local(inner) => inner.stop(),
            Ingestion::Remote(inner) => inner.stop(),
        }
    }
}
