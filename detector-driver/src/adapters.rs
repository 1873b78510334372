// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C7: framework adapters. Thin wrappers that translate the acquisition
//! framework's capability-shaped interfaces (detector-info, sync, buffer,
//! optional direct-saving) into calls on the core (spec §4.6). None of
//! these hold logic beyond the translation itself — the real behavior lives
//! in [`crate::channel`] and [`crate::ingestion`].

use std::io::BufReader;
use std::path::Path;

use crate::channel::ControlChannel;
use crate::config::CameraDescriptor;
use crate::error::{DriverError, Result};
use crate::types::{Gain, TriggerMode};

/// Image pixel depth, mirroring the acquisition framework's own enum (spec
/// §4.6: the core only ever reports `Bpp32S`, matching the original's
/// `DetInfoCtrlObj::getCurrImageType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Bpp32Signed,
}

/// Detector-info adapter: static geometry and identification, sourced from
/// an optional on-disk descriptor file with manufacturer defaults when
/// absent (spec §4.6).
pub struct DetectorInfoAdapter {
    descriptor: CameraDescriptor,
}

impl DetectorInfoAdapter {
    pub fn new(descriptor: CameraDescriptor) -> Self {
        Self { descriptor }
    }

    /// Loads the descriptor from `path` if it exists, otherwise falls back
    /// to [`CameraDescriptor::default`] (spec §4.6).
    pub fn from_optional_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(CameraDescriptor::default()));
        }
        let file = std::fs::File::open(path).map_err(DriverError::Io)?;
        let descriptor = CameraDescriptor::from_reader(BufReader::new(file))?;
        Ok(Self::new(descriptor))
    }

    pub fn max_image_size(&self) -> (usize, usize) {
        (self.descriptor.width, self.descriptor.height)
    }

    pub fn detector_image_size(&self) -> (usize, usize) {
        self.max_image_size()
    }

    pub fn curr_image_type(&self) -> ImageType {
        ImageType::Bpp32Signed
    }

    pub fn def_image_type(&self) -> ImageType {
        self.curr_image_type()
    }

    /// `Bpp32Signed` is the only supported image type; anything else is
    /// rejected (spec §4.6, grounded on `DetInfoCtrlObj::setCurrImageType`
    /// throwing on any non-default value).
    pub fn set_curr_image_type(&self, image_type: ImageType) -> Result<()> {
        if image_type != self.curr_image_type() {
            return Err(DriverError::Protocol {
                message: "invalid pixel depth: only Bpp32Signed is supported".to_owned(),
            });
        }
        Ok(())
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.descriptor.pixel_pitch_m, self.descriptor.pixel_pitch_m)
    }

    pub fn detector_type(&self) -> &str {
        &self.descriptor.detector_type
    }

    pub fn detector_model(&self) -> &str {
        &self.descriptor.name
    }
}

/// Valid parameter ranges the sync adapter reports to the framework (spec
/// §4.6, DESIGN.md §4: grounded on `SyncCtrlObj::getValidRanges`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidRanges {
    pub min_exposure: f64,
    pub max_exposure: f64,
    pub min_latency: f64,
    pub max_latency: f64,
}

/// Sync adapter: exposure/latency time, trigger mode, and frame-count
/// translation between the framework and the control channel (spec §4.6).
pub struct SyncAdapter {
    channel: std::sync::Arc<ControlChannel>,
    min_latency: std::time::Duration,
}

impl SyncAdapter {
    pub fn new(channel: std::sync::Arc<ControlChannel>, min_latency: std::time::Duration) -> Self {
        Self { channel, min_latency }
    }

    /// Exposure and latency both range `[1e-9, 1e6]` seconds in the
    /// original; latency's floor is the configured minimum instead of the
    /// global floor (spec §9 open question).
    pub fn valid_ranges(&self) -> ValidRanges {
        ValidRanges {
            min_exposure: 1e-9,
            max_exposure: 1e6,
            min_latency: self.min_latency.as_secs_f64(),
            max_latency: 1e6,
        }
    }

    /// Validates `exposure` against [`Self::valid_ranges`] before ever
    /// writing to the socket (spec §4 supplement: fail fast, no silent
    /// bumping). The `ExternalGate` zero-exposure quirk is preserved as a
    /// silent local no-op, matching the original's border-effect handling
    /// for that one trigger mode.
    pub fn set_exposure(&self, trigger_mode: TriggerMode, seconds: f64) -> Result<()> {
        if trigger_mode == TriggerMode::ExternalGate && seconds <= 0.0 {
            tracing::debug!(seconds, "ignoring non-positive exposure under ExternalGate");
            return Ok(());
        }
        let ranges = self.valid_ranges();
        if !(ranges.min_exposure..=ranges.max_exposure).contains(&seconds) {
            return Err(DriverError::Protocol {
                message: format!(
                    "exposure {seconds} outside valid range [{}, {}]",
                    ranges.min_exposure, ranges.max_exposure
                ),
            });
        }
        self.channel.set_exposure(seconds)
    }

    pub fn set_latency(&self, seconds: f64) -> Result<()> {
        let ranges = self.valid_ranges();
        if !(ranges.min_latency..=ranges.max_latency).contains(&seconds) {
            return Err(DriverError::Protocol {
                message: format!(
                    "latency {seconds} outside valid range [{}, {}]",
                    ranges.min_latency, ranges.max_latency
                ),
            });
        }
        let exposure = self.channel.snapshot().exposure;
        self.channel.set_exposure_period(exposure + seconds)
    }

    pub fn set_nb_frames(&self, nb_frames: i32) -> Result<()> {
        self.channel.set_nb_images(nb_frames)
    }

    pub fn nb_hw_frames(&self) -> i32 {
        self.channel.snapshot().nb_images
    }
}

/// Direct-saving adapter. Delegates all persistence to the control server
/// via `mxsettings`; reading the server's own file format back is out of
/// scope (spec §1 Non-goals: "the CBF image-file reader used only by that
/// backend" is an external collaborator).
pub struct SavingAdapter {
    channel: std::sync::Arc<ControlChannel>,
}

impl SavingAdapter {
    pub fn new(channel: std::sync::Arc<ControlChannel>) -> Self {
        Self { channel }
    }

    /// Forwards header metadata as `mxsettings <k> <v> <k> <v> ...` (spec
    /// §4.6, grounded on `SavingCtrlObj::setCommonHeader`).
    pub fn set_common_header(&self, header: &[(String, String)]) -> Result<()> {
        let mut command = String::from("mxsettings");
        for (key, value) in header {
            command.push(' ');
            command.push_str(key);
            command.push(' ');
            command.push_str(value);
        }
        match self.channel.send_any_and_get_error(&command)? {
            None => Ok(()),
            Some(message) => Err(DriverError::Protocol { message }),
        }
    }

    /// Reading a completed frame back through the server's own file format
    /// requires the CBF decoder, which is explicitly out of scope (spec §1).
    pub fn read_frame(&self, _frame_nr: usize) -> Result<()> {
        Err(DriverError::NotSupported(
            "direct-saving read-back requires the external CBF reader",
        ))
    }
}

/// Translates the framework's trigger-mode enum to [`TriggerMode`]. In this
/// driver the two already share the same variant set 1:1 (spec §3), so the
/// adapter is the identity function; it exists as the seam a future
/// framework-side enum change would land on without touching [`crate::channel`].
pub fn adapt_trigger_mode(mode: TriggerMode) -> TriggerMode {
    mode
}

/// Translates the framework's gain enum to [`Gain`]. Identity for the same
/// reason as [`adapt_trigger_mode`].
pub fn adapt_gain(gain: Gain) -> Gain {
    gain
}
