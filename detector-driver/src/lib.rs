// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-side driver for a photon-counting X-ray area detector's vendor
//! socket control server.
//!
//! The crate is organized around the triad described in its design:
//!
//! - [`channel`] — the control channel (C3), built on the wire codec
//!   ([`wire`]) and reply classifier ([`protocol`]), owning the cached
//!   detector state ([`state`]).
//! - [`ingestion`] — the frame ingestion pipeline (C5), which decodes
//!   per-frame image files ([`image`]) and sizes its retention window
//!   ([`buffer`]).
//! - [`acquisition`] — the acquisition state machine (C6) binding the two
//!   together across prepare/start/stop.
//!
//! [`adapters`] exposes the framework-facing capability wrappers (C7) on
//! top of the core; [`config`] and [`error`] are the crate's configuration
//! surface and error taxonomy.
//!
//! # Example
//!
//! ```no_run
//! use detector_driver::channel::{ChannelConfig, ControlChannel};
//!
//! let channel = ControlChannel::new(ChannelConfig::default())?;
//! channel.connect("localhost", 41234)?;
//! channel.set_exposure(0.1)?;
//! # Ok::<(), detector_driver::error::DriverError>(())
//! ```

pub mod acquisition;
pub mod adapters;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod filename;
pub mod image;
pub mod ingestion;
pub mod protocol;
pub mod state;
pub mod types;
pub mod wire;

pub use acquisition::Acquisition;
pub use channel::ControlChannel;
pub use config::DriverConfig;
pub use driver::Driver;
pub use error::{DriverError, Result};
