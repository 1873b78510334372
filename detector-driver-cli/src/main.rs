// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Connects to a control server, drives one scripted acquisition, and
//! prints composite status transitions as they happen. Not part of the
//! core contract — a convenience front end over `detector-driver`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use detector_driver::acquisition::Acquisition;
use detector_driver::channel::ChannelConfig;
use detector_driver::config::{Deployment, DriverConfig, RetentionPolicy};
use detector_driver::error::DriverError;
use detector_driver::image::FrameBuffer;
use detector_driver::ingestion::{AcquisitionDescriptor, FrameSink};
use detector_driver::types::TriggerMode;
use detector_driver::Driver;

/// Drive one scripted acquisition against a Pilatus-protocol control server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Control server hostname or address.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Control server TCP port.
    #[arg(long, default_value_t = 41234)]
    port: u16,

    /// Exposure time per frame, in seconds.
    #[arg(long, default_value_t = 1.0)]
    exposure: f64,

    /// Minimum latency added to exposure to compute the exposure period, in
    /// seconds.
    #[arg(long, default_value_t = 0.003)]
    latency: f64,

    /// Number of frames to acquire.
    #[arg(long, default_value_t = 1)]
    nb_frames: i32,

    /// Trigger mode for the run.
    #[arg(long, value_enum, default_value_t = CliTriggerMode::InternalSingle)]
    trigger_mode: CliTriggerMode,

    /// Directory the control server writes frame files into. When omitted,
    /// the driver runs in remote/simulated ingestion mode.
    #[arg(long)]
    watch_path: Option<PathBuf>,

    /// Frame width in pixels, used only when `--watch-path` is set.
    #[arg(long, default_value_t = 2463)]
    width: usize,

    /// Frame height in pixels, used only when `--watch-path` is set.
    #[arg(long, default_value_t = 2527)]
    height: usize,

    /// Bytes per pixel, used only when `--watch-path` is set.
    #[arg(long, default_value_t = 4)]
    bytes_per_pixel: usize,

    /// First image number, filled into the `%d` slot of the file pattern
    /// the start verb sends to the server.
    #[arg(long, default_value_t = 0)]
    first_image_number: i64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliTriggerMode {
    InternalSingle,
    InternalMulti,
    ExternalSingle,
    ExternalMulti,
    ExternalGate,
}

impl From<CliTriggerMode> for TriggerMode {
    fn from(mode: CliTriggerMode) -> Self {
        match mode {
            CliTriggerMode::InternalSingle => TriggerMode::InternalSingle,
            CliTriggerMode::InternalMulti => TriggerMode::InternalMulti,
            CliTriggerMode::ExternalSingle => TriggerMode::ExternalSingle,
            CliTriggerMode::ExternalMulti => TriggerMode::ExternalMulti,
            CliTriggerMode::ExternalGate => TriggerMode::ExternalGate,
        }
    }
}

struct PrintingSink {
    expected: usize,
}

impl FrameSink for PrintingSink {
    fn on_frame(&mut self, index: usize, buffer: FrameBuffer) -> bool {
        println!("frame {index}/{} ready ({} bytes)", self.expected.saturating_sub(1), buffer.len());
        true
    }

    fn on_error(&mut self, error: DriverError) {
        eprintln!("ingestion error: {error}");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let deployment = match &cli.watch_path {
        Some(path) => Deployment::Local { watch_path: path.clone() },
        None => Deployment::Remote,
    };

    let config = DriverConfig {
        host: cli.host.clone(),
        port: cli.port,
        channel: ChannelConfig::default(),
        deployment,
        file_pattern: "image_%.5d.cbf".to_owned(),
        retention: RetentionPolicy::Auto,
        min_latency: Duration::from_secs_f64(cli.latency.max(0.0)),
        temperature_limits: Vec::new(),
        humidity_limits: Vec::new(),
        pending_frame_bound: 32,
    };

    let mut driver = Driver::new(config).context("failed to build driver")?;
    driver.connect().context("failed to connect to control server")?;

    let descriptor = AcquisitionDescriptor {
        nb_images: cli.nb_frames.max(0) as usize,
        width: cli.width,
        height: cli.height,
        bytes_per_pixel: cli.bytes_per_pixel,
    };

    let acquisition: &mut Acquisition = driver.acquisition();
    acquisition
        .prepare(cli.trigger_mode.into(), cli.exposure, cli.latency, cli.nb_frames, descriptor)
        .context("prepare failed")?;

    println!("status before start: {:?}", acquisition.status());

    acquisition
        .start(
            cli.first_image_number,
            Box::new(PrintingSink {
                expected: cli.nb_frames.max(0) as usize,
            }),
        )
        .context("start failed")?;

    loop {
        let status = acquisition.status();
        println!("status: {status:?} (acquired {})", acquisition.nb_acquired_images());
        if status.acquisition == detector_driver::types::AcqDomain::Ready {
            break;
        }
        if status.acquisition == detector_driver::types::AcqDomain::Fault {
            anyhow::bail!("acquisition faulted");
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    acquisition.stop().context("stop failed")?;
    println!("final status: {:?}", acquisition.status());
    Ok(())
}
