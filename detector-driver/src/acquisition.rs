// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C6: the acquisition state machine. Binds the control channel and the
//! frame ingestion pipeline across prepare/start/running/stop/error
//! transitions (spec §4.5).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::channel::ControlChannel;
use crate::config::{Deployment, DriverConfig};
use crate::error::{DriverError, Result};
use crate::image::FrameBuffer;
use crate::ingestion::{AcquisitionDescriptor, FrameSink, Ingestion};
use crate::types::{AcqDomain, CompositeStatus, DetDomain, DetectorStatus, TriggerMode};

/// Wraps a caller-supplied [`FrameSink`] to track delivered-frame count and
/// fault state, mirroring the original's `getNbHwAcquiredFrames`, which
/// derives the acquired count from the buffer layer
/// (`m_buffer.getLastAcquiredFrame() + 1`) rather than from the control
/// channel's own counter.
struct TrackingSink {
    inner: Box<dyn FrameSink>,
    delivered: Arc<AtomicUsize>,
    fault: Arc<AtomicBool>,
    channel: Arc<ControlChannel>,
}

impl FrameSink for TrackingSink {
    fn on_frame(&mut self, index: usize, buffer: FrameBuffer) -> bool {
        self.delivered.store(index + 1, Ordering::SeqCst);
        self.inner.on_frame(index, buffer)
    }

    fn on_error(&mut self, error: DriverError) {
        self.fault.store(true, Ordering::SeqCst);
        self.channel.error_stop(error.to_string());
        self.inner.on_error(error);
    }
}

/// Rejects a latency below the configured minimum instead of silently
/// bumping it (spec §9 open question, resolved: fail fast at `prepare`).
fn validate_latency(latency: f64, min_latency: std::time::Duration) -> Result<()> {
    let min_latency = min_latency.as_secs_f64();
    if latency < min_latency {
        return Err(DriverError::Protocol {
            message: format!("latency {latency}s is below the configured minimum of {min_latency}s"),
        });
    }
    Ok(())
}

/// Orchestrates one detector across its whole prepare→start→running→stop
/// lifecycle. Not `Clone`; a caller that needs to share it across threads
/// wraps it in an `Arc<Mutex<_>>` itself, since prepare/start/stop are
/// inherently sequential.
pub struct Acquisition {
    channel: Arc<ControlChannel>,
    ingestion: Ingestion,
    trigger_mode: TriggerMode,
    requested: usize,
    delivered: Arc<AtomicUsize>,
    fault: Arc<AtomicBool>,
    pipeline_running: bool,
    /// Output directory pushed via `imgpath` at every `prepare`, if the
    /// deployment is `Local` (spec §4.4 "Prepare ... pushes the current
    /// imgpath/pattern into the control channel"). `None` under `Remote`,
    /// where the server's own `imgpath` is left untouched by this driver.
    imgpath: Option<String>,
    file_pattern: String,
    min_latency: std::time::Duration,
}

impl Acquisition {
    pub fn new(config: &DriverConfig, channel: Arc<ControlChannel>) -> Self {
        let ingestion = Ingestion::new(config, Arc::clone(&channel));
        let imgpath = match &config.deployment {
            Deployment::Local { watch_path } => Some(watch_path.display().to_string()),
            Deployment::Remote => None,
        };
        Self {
            channel,
            ingestion,
            trigger_mode: TriggerMode::default(),
            requested: 0,
            delivered: Arc::new(AtomicUsize::new(0)),
            fault: Arc::new(AtomicBool::new(false)),
            pipeline_running: false,
            imgpath,
            file_pattern: config.file_pattern.clone(),
            min_latency: config.min_latency,
        }
    }

    /// Applies every cached setting needed for the run, checks the safety
    /// interlock, and resets ingestion's stale state. Must be called while
    /// the channel is idle (spec §4.5).
    pub fn prepare(
        &mut self,
        trigger_mode: TriggerMode,
        exposure: f64,
        latency: f64,
        nb_frames: i32,
        descriptor: AcquisitionDescriptor,
    ) -> Result<()> {
        if let Some((channel, reading, limit)) = self.channel.snapshot().safety_interlock() {
            return Err(DriverError::SafetyInterlock {
                channel,
                reading,
                limit,
            });
        }

        validate_latency(latency, self.min_latency)?;

        let exposure_period = exposure + latency;
        let nb_images = if trigger_mode == TriggerMode::InternalMulti {
            1
        } else {
            nb_frames
        };

        self.channel.set_exposure(exposure)?;
        self.channel.set_exposure_period(exposure_period)?;
        self.channel.set_nb_images(nb_images)?;
        if let Some(imgpath) = &self.imgpath {
            self.channel.set_imgpath(imgpath)?;
        }
        self.channel.set_file_pattern(self.file_pattern.clone());
        self.trigger_mode = trigger_mode;
        self.requested = nb_frames.max(0) as usize;
        self.delivered.store(0, Ordering::SeqCst);
        self.fault.store(false, Ordering::SeqCst);

        self.ingestion.prepare(descriptor)?;
        Ok(())
    }

    /// Starts the ingestion pipeline first so it is ready to observe the
    /// very first frame, then asks the channel to start the exposure
    /// sequence with a filename built from `first_image_number` (spec §4.5's
    /// stated ordering, §6's filename formatting).
    pub fn start(&mut self, first_image_number: i64, sink: Box<dyn FrameSink>) -> Result<()> {
        let tracking = Box::new(TrackingSink {
            inner: sink,
            delivered: Arc::clone(&self.delivered),
            fault: Arc::clone(&self.fault),
            channel: Arc::clone(&self.channel),
        });
        self.ingestion.start(tracking)?;
        if let Err(err) = self.channel.start_acquisition(self.trigger_mode, first_image_number) {
            self.ingestion.stop();
            return Err(err);
        }
        self.pipeline_running = true;
        info!(trigger_mode = ?self.trigger_mode, first_image_number, "acquisition started");
        Ok(())
    }

    /// Stops the ingestion pipeline, then asks the channel to kill the
    /// in-progress exposure (spec §4.5's stated ordering: pipeline before
    /// channel, so no in-flight frame is lost mid-delivery).
    ///
    /// Idempotent: a second call with the pipeline already stopped is a
    /// no-op, matching [`ControlChannel::stop_acquisition`]'s own
    /// idempotence (spec §8).
    pub fn stop(&mut self) -> Result<()> {
        self.ingestion.stop();
        self.pipeline_running = false;
        self.channel.stop_acquisition()?;
        Ok(())
    }

    /// Number of frames delivered to the sink so far in the current run,
    /// matching the original's buffer-derived acquired-frame counter rather
    /// than the control channel's own `nb_acquired_images`, which only
    /// updates on full sequence completion.
    pub fn nb_acquired_images(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Composite status derived from the channel's cached detector status
    /// joined with ingestion progress (spec §4.5's mapping table).
    pub fn status(&self) -> CompositeStatus {
        let delivered = self.nb_acquired_images();
        let timed_out = self.fault.load(Ordering::SeqCst);

        match self.channel.status() {
            DetectorStatus::Disconnected => CompositeStatus {
                detector: DetDomain::Fault,
                acquisition: AcqDomain::Fault,
            },
            DetectorStatus::Error => CompositeStatus {
                detector: DetDomain::Idle,
                acquisition: AcqDomain::Fault,
            },
            DetectorStatus::Running => CompositeStatus {
                detector: DetDomain::Exposure,
                acquisition: AcqDomain::Running,
            },
            DetectorStatus::KillingAcquisition => {
                if self.pipeline_running {
                    CompositeStatus {
                        detector: DetDomain::Idle,
                        acquisition: AcqDomain::Running,
                    }
                } else {
                    CompositeStatus {
                        detector: DetDomain::Idle,
                        acquisition: AcqDomain::Ready,
                    }
                }
            }
            _ => {
                if timed_out {
                    CompositeStatus {
                        detector: DetDomain::Idle,
                        acquisition: AcqDomain::Fault,
                    }
                } else if delivered >= self.requested {
                    CompositeStatus {
                        detector: DetDomain::Idle,
                        acquisition: AcqDomain::Ready,
                    }
                } else if self.pipeline_running {
                    CompositeStatus {
                        detector: DetDomain::Idle,
                        acquisition: AcqDomain::Running,
                    }
                } else {
                    CompositeStatus {
                        detector: DetDomain::Idle,
                        acquisition: AcqDomain::Ready,
                    }
                }
            }
        }
    }
}
