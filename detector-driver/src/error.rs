// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the control channel and frame ingestion pipeline.

use thiserror::Error;

/// Errors surfaced to callers of [`crate::channel::ControlChannel`] and
/// [`crate::ingestion::Ingestion`].
///
/// Query operations (`status`, cached-value getters) never fail; only
/// state-mutating operations return this type.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Socket create/connect/read/write failure. Always followed by a
    /// transition to `DetectorStatus::Disconnected`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `poll(2)`/pipe syscall used by the I/O loop or the watcher thread
    /// failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// A command's deadline elapsed before the channel reached its expected
    /// terminal state. The cached value touched by the command is left
    /// unchanged.
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The server replied with an `ERR` class, or a successful reply failed
    /// to parse where a value was expected. `message` is the server's text,
    /// verbatim.
    #[error("protocol error: {message}")]
    Protocol {
        /// The server's error text, or a locally-detected parse failure.
        message: String,
    },

    /// `start_acquisition` was called while the channel was already
    /// `Running`.
    #[error("acquisition already running")]
    Busy,

    /// A temperature or humidity channel exceeded its configured upper
    /// bound at start-time.
    #[error("safety interlock tripped on channel {channel}: {reading} exceeds limit {limit}")]
    SafetyInterlock {
        /// Index of the offending sensor channel.
        channel: usize,
        /// The reading that tripped the interlock.
        reading: f64,
        /// The configured upper bound.
        limit: f64,
    },

    /// A capability probe determined the server lacks a command (currently
    /// only `setenergy`).
    #[error("server does not support: {0}")]
    NotSupported(&'static str),

    /// Ingestion: a file was read short after its retry budget, or its size
    /// did not match the expected frame size after the header skip.
    #[error("frame decode failed for {path}: {reason}")]
    Decode {
        /// Path of the offending image file.
        path: std::path::PathBuf,
        /// Human-readable reason.
        reason: String,
    },

    /// Ingestion: the pending-frame map exceeded its bound. The control
    /// channel is transitioned to `Error` as a side effect of raising this.
    #[error("pending frame map overran its bound of {bound} entries")]
    Overrun {
        /// The configured bound that was exceeded.
        bound: usize,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DriverError>;
