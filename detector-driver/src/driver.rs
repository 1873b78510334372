// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Top-level facade wiring a [`DriverConfig`] into a [`ControlChannel`], an
//! [`Acquisition`] state machine, and the framework adapters (C7). This is
//! the type a caller constructs once per detector instance; everything else
//! in the crate is reachable through it or directly for finer-grained
//! control.

use std::sync::Arc;

use crate::acquisition::Acquisition;
use crate::adapters::{DetectorInfoAdapter, SavingAdapter, SyncAdapter};
use crate::channel::ControlChannel;
use crate::config::{CameraDescriptor, DriverConfig};
use crate::error::Result;

/// Owns the control channel, the acquisition state machine, and the
/// framework-facing adapters for one detector instance (spec §1: "one
/// driver instance drives one server endpoint").
pub struct Driver {
    config: DriverConfig,
    channel: Arc<ControlChannel>,
    acquisition: Acquisition,
}

impl Driver {
    /// Builds the control channel and acquisition state machine from
    /// `config`, but does not connect yet — call [`Driver::connect`]
    /// afterward.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let channel = Arc::new(ControlChannel::new(config.channel)?);
        channel.set_safety_limits(config.temperature_limits.clone(), config.humidity_limits.clone());
        let acquisition = Acquisition::new(&config, Arc::clone(&channel));
        Ok(Self {
            config,
            channel,
            acquisition,
        })
    }

    /// Connects the control channel to `config.host:config.port`.
    pub fn connect(&self) -> Result<()> {
        self.channel.connect(&self.config.host, self.config.port)
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    pub fn acquisition(&mut self) -> &mut Acquisition {
        &mut self.acquisition
    }

    pub fn detector_info(&self, descriptor: CameraDescriptor) -> DetectorInfoAdapter {
        DetectorInfoAdapter::new(descriptor)
    }

    pub fn sync(&self) -> SyncAdapter {
        SyncAdapter::new(Arc::clone(&self.channel), self.config.min_latency)
    }

    pub fn saving(&self) -> SavingAdapter {
        SavingAdapter::new(Arc::clone(&self.channel))
    }
}
