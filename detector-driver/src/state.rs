// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C4: cached detector state. The control channel's I/O thread updates this
//! under its lock as [`crate::protocol::Event`]s arrive; command methods and
//! framework adapters read through [`crate::channel::ControlChannel`]'s
//! snapshot accessors.

use crate::types::{DetectorStatus, Gain};

/// Sentinel written into `energy` before the server has ever reported one
/// (mirrors the "no value yet" convention of the original's `-1`).
pub const ENERGY_UNSET: f64 = -1.0;

/// Everything the control channel knows about the detector besides its
/// connection status. Cloned out to callers rather than handed out by
/// reference, since it lives behind the same lock as the status/condvar
/// pair in [`crate::channel::ControlChannel`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedState {
    pub status: DetectorStatus,
    pub exposure: f64,
    pub exposure_period: f64,
    pub nb_images: i32,
    pub hw_trigger_delay: f64,
    pub exposures_per_frame: i32,
    pub threshold: i32,
    pub gain: Gain,
    pub energy: f64,
    pub gap_fill: bool,
    pub imgpath: String,
    pub file_pattern: String,
    pub nb_acquired_images: i32,
    pub temperatures: Vec<f64>,
    pub humidities: Vec<f64>,
    pub temperature_limits: Vec<f64>,
    pub humidity_limits: Vec<f64>,
    pub last_error_message: Option<String>,
    /// Set once a capability probe has determined the server lacks
    /// `setenergy`; `set_energy` becomes a local no-op after this (spec §4.3
    /// capability probe note).
    pub has_setenergy: bool,
}

impl Default for CachedState {
    fn default() -> Self {
        Self {
            status: DetectorStatus::Disconnected,
            exposure: 1.0,
            exposure_period: 1.0,
            nb_images: 1,
            hw_trigger_delay: 0.0,
            exposures_per_frame: 1,
            threshold: 0,
            gain: Gain::Default,
            energy: ENERGY_UNSET,
            gap_fill: false,
            imgpath: String::new(),
            file_pattern: String::new(),
            nb_acquired_images: 0,
            temperatures: Vec::new(),
            humidities: Vec::new(),
            temperature_limits: Vec::new(),
            humidity_limits: Vec::new(),
            last_error_message: None,
            has_setenergy: true,
        }
    }
}

impl CachedState {
    /// True if any reported channel's reading is at or past its configured
    /// upper bound. Checked by [`crate::acquisition::Acquisition::prepare`]
    /// before a run is staged, and again by
    /// [`crate::channel::ControlChannel::start_acquisition`] immediately
    /// before the start verb is written, since a reading can trip between
    /// those two calls (spec §4.5, §6).
    pub fn safety_interlock(&self) -> Option<(usize, f64, f64)> {
        for (idx, &limit) in self.temperature_limits.iter().enumerate() {
            if let Some(&reading) = self.temperatures.get(idx) {
                if reading >= limit {
                    return Some((idx, reading, limit));
                }
            }
        }
        for (idx, &limit) in self.humidity_limits.iter().enumerate() {
            if let Some(&reading) = self.humidities.get(idx) {
                if reading >= limit {
                    return Some((idx, reading, limit));
                }
            }
        }
        None
    }
}
