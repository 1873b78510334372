// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! Remote mode: no local filesystem view of frame files exists, so the
//! pipeline instead polls the control channel's acquired-image counter and
//! synthesizes frames in order as it advances (spec §4.4, deployment
//! Non-goal carve-out: no transport for pulling pixel data back is
//! implemented here, only the ordering/delivery contract).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::channel::ControlChannel;
use crate::error::Result;
use crate::image::FrameBuffer;

use super::{AcquisitionDescriptor, FrameSink};

pub struct RemoteIngestion {
    channel: Arc<ControlChannel>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<Mutex<bool>>,
    baseline: i32,
}

impl RemoteIngestion {
    pub fn new(channel: Arc<ControlChannel>) -> Self {
        Self {
            channel,
            worker: None,
            stop: Arc::new(Mutex::new(false)),
            baseline: 0,
        }
    }

    pub fn prepare(&mut self, _descriptor: AcquisitionDescriptor) -> Result<()> {
        *self.stop.lock().unwrap() = false;
        self.baseline = self.channel.snapshot().nb_acquired_images;
        Ok(())
    }

    pub fn start(&mut self, sink: Box<dyn FrameSink>) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        let stop = Arc::clone(&self.stop);
        let baseline = self.baseline;

        let handle = std::thread::Builder::new()
            .name("frame-ingestion-remote".into())
            .spawn(move || run(channel, baseline, sink, stop))
            .map_err(crate::error::DriverError::Io)?;
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

fn run(channel: Arc<ControlChannel>, baseline: i32, mut sink: Box<dyn FrameSink>, stop: Arc<Mutex<bool>>) {
    let mut delivered = 0usize;
    loop {
        if *stop.lock().unwrap() {
            return;
        }
        let acquired = channel.snapshot().nb_acquired_images - baseline;
        while (acquired as i64) > delivered as i64 {
            let keep_going = sink.on_frame(delivered, FrameBuffer::empty());
            delivered += 1;
            if !keep_going {
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
