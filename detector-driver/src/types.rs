// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Core enumerations shared by the control channel, ingestion pipeline, and
//! framework adapters.

use serde::{Deserialize, Serialize};

/// The control channel's state, mirrored from the server's free-form
/// replies. `Error` is sticky: once entered, only an explicit user-initiated
/// command (or [`crate::channel::ControlChannel::soft_reset`]) leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorStatus {
    Disconnected,
    Standby,
    SettingEnergy,
    SettingThreshold,
    SettingExposure,
    SettingExposurePeriod,
    SettingHardwareTriggerDelay,
    SettingExposurePerFrame,
    SettingNbImagesInSequence,
    ReadingTh,
    AnyCommand,
    Running,
    KillingAcquisition,
    Error,
}

impl DetectorStatus {
    /// True for any of the `SettingX`/`ReadingTh`/`AnyCommand` variants that
    /// a command method waits to leave again — i.e. every state a
    /// state-mutating command can put the channel into besides `Running`
    /// and `KillingAcquisition`.
    pub fn is_transient(self) -> bool {
        !matches!(
            self,
            DetectorStatus::Disconnected
                | DetectorStatus::Standby
                | DetectorStatus::Running
                | DetectorStatus::KillingAcquisition
                | DetectorStatus::Error
        )
    }
}

/// Detector-side half of the composite status reported to the acquisition
/// framework (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetDomain {
    Idle,
    Exposure,
    Readout,
    Latency,
    Fault,
}

/// Acquisition-side half of the composite status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcqDomain {
    Ready,
    Running,
    Fault,
}

/// `(detector, acquisition)` pair returned by
/// [`crate::acquisition::Acquisition::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeStatus {
    pub detector: DetDomain,
    pub acquisition: AcqDomain,
}

/// Detector gain setting. `Default` lets the server pick based on threshold
/// alone (no `G`-suffixed token is sent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Gain {
    #[default]
    Default,
    Low,
    Mid,
    High,
    UltraHigh,
}

impl Gain {
    /// The token sent in `setthreshold [<gainG>] <eV>`. `Default` has none.
    pub fn request_token(self) -> Option<&'static str> {
        match self {
            Gain::Default => None,
            Gain::Low => Some("lowG"),
            Gain::Mid => Some("midG"),
            Gain::High => Some("highG"),
            Gain::UltraHigh => Some("uhighG"),
        }
    }

    /// Parses the gain word(s) the server echoes back in a `Settings:` reply
    /// (`low`, `mid`, `high`, `ultra high`). Returns `None` for an
    /// unrecognized word rather than falling back to a default, so the
    /// caller can decide whether that is a protocol error.
    pub fn from_reply_token(token: &str) -> Option<Gain> {
        match token {
            "low" => Some(Gain::Low),
            "mid" => Some(Gain::Mid),
            "high" => Some(Gain::High),
            "ultra high" => Some(Gain::UltraHigh),
            _ => None,
        }
    }
}

/// Trigger mode, mapped 1:1 from the acquisition framework's own enum by
/// [`crate::adapters::SyncAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerMode {
    #[default]
    InternalSingle,
    InternalMulti,
    ExternalSingle,
    ExternalMulti,
    ExternalGate,
}

impl TriggerMode {
    /// The verb used in the start command for this trigger mode (spec §4.3).
    pub fn start_verb(self) -> &'static str {
        match self {
            TriggerMode::InternalSingle | TriggerMode::InternalMulti => "exposure",
            TriggerMode::ExternalSingle => "exttrigger",
            TriggerMode::ExternalMulti => "extmtrigger",
            TriggerMode::ExternalGate => "extenable",
        }
    }
}
