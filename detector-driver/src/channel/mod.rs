// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C3: the control channel. Owns the TCP session to the control server,
//! multiplexes command/reply pairs against asynchronously arriving server
//! events, and exposes a thread-safe, blocking-until-expected-state command
//! surface to callers.

mod io_loop;

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::unistd::{close, pipe, write};
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::protocol::Event;
use crate::state::CachedState;
use crate::types::{DetectorStatus, Gain, TriggerMode};

/// Timeouts governing the channel's command/connect behavior (spec §4.3,
/// §6: "3s default for ack-style commands, 10s for anything the server may
/// take longer to settle, both caller-overridable").
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub long_command_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
            long_command_timeout: Duration::from_secs(10),
        }
    }
}

struct Shared {
    state: Mutex<CachedState>,
    condvar: Condvar,
    socket: Mutex<Option<TcpStream>>,
    config: ChannelConfig,
    /// Write end of the self-pipe; writing a byte wakes the I/O thread's
    /// `poll(2)` out of an indefinite wait so it can notice shutdown or a
    /// freshly connected socket (spec §6).
    wake_write_fd: std::os::unix::io::RawFd,
    wake_read_fd: std::os::unix::io::RawFd,
    shutdown: Mutex<bool>,
    /// Set for the duration of a resync burst so that a `/tmp/setthreshold`
    /// completion the burst's own `setthreshold`/`setenergy` call provokes
    /// does not spawn another burst on top of it (spec §4.3's resync
    /// trigger would otherwise recurse forever against itself).
    resyncing: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = close(self.wake_write_fd);
        let _ = close(self.wake_read_fd);
    }
}

/// A persistent session to the control server. Cheaply cloneable; every
/// clone shares the same socket, I/O thread, and cached state.
pub struct ControlChannel {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(CachedState::default()),
            condvar: Condvar::new(),
            socket: Mutex::new(None),
            config,
            wake_write_fd: write_fd,
            wake_read_fd: read_fd,
            shutdown: Mutex::new(false),
            resyncing: AtomicBool::new(false),
        });

        let io_thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("control-channel-io".into())
                .spawn(move || io_loop::run(shared))
                .map_err(DriverError::Io)?
        };

        Ok(Self {
            shared,
            io_thread: Mutex::new(Some(io_thread)),
        })
    }

    /// Builds a lightweight handle sharing an existing channel's state and
    /// socket without owning the I/O thread. Used internally to run a
    /// resync burst from a throwaway background thread (spawned by the I/O
    /// thread itself on a `/tmp/setthreshold` completion) without it ever
    /// touching `shutdown` on the real channel.
    fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            io_thread: Mutex::new(None),
        }
    }

    /// Opens (or reopens) the TCP session, runs the resync burst, and sends
    /// the unconditional warm-up exposure (spec §4.3).
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        info!(host, port, "connecting to control server");
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect_timeout(
            &addr
                .parse()
                .or_else(|_| {
                    use std::net::ToSocketAddrs;
                    addr.to_socket_addrs()?
                        .next()
                        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))
                })?,
            self.shared.config.connect_timeout,
        )?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(200)))?;

        {
            let mut socket = self.shared.socket.lock().unwrap();
            *socket = Some(stream.try_clone()?);
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            state.status = DetectorStatus::Standby;
        }
        self.shared.condvar.notify_all();
        self.wake_io_thread();

        self.resync()?;

        // Unconditional warm-up: the server needs a first exposure to leave
        // whatever state it booted into (spec §9 open question, resolved:
        // keep the workaround, it is cheap and the original always sent it).
        if let Err(err) = self.send_any_command("exposure warmup.edf") {
            warn!(%err, "warm-up exposure failed, continuing anyway");
        }

        Ok(())
    }

    /// Re-applies every cached setting in the server's expected order after
    /// a (re)connect, or after the server confirms a threshold/energy change
    /// has fully applied (spec §4.3). Guarded against re-entrancy: the
    /// `setthreshold`/`setenergy` calls this burst itself issues will
    /// provoke their own `/tmp/setthreshold` completion, which must not
    /// spawn a second burst on top of this one.
    fn resync(&self) -> Result<()> {
        self.shared.resyncing.store(true, Ordering::SeqCst);
        let result = self.resync_body();
        self.shared.resyncing.store(false, Ordering::SeqCst);
        result
    }

    fn resync_body(&self) -> Result<()> {
        let snapshot = self.snapshot();

        if snapshot.has_setenergy && snapshot.energy >= 0.0 {
            self.set_energy(snapshot.energy)?;
        } else {
            self.set_threshold_gain(snapshot.threshold, snapshot.gain)?;
        }
        self.set_exposure(snapshot.exposure)?;
        self.set_exposure_period(snapshot.exposure_period)?;
        self.set_imgpath(&snapshot.imgpath)?;
        self.set_hardware_trigger_delay(snapshot.hw_trigger_delay)?;
        self.set_nb_images(snapshot.nb_images)?;
        self.send_any_command("setackint 0")?;
        self.send_any_command("dbglvl 1")?;
        self.set_exposures_per_frame(snapshot.exposures_per_frame)?;
        self.send_any_command("th")?;
        Ok(())
    }

    fn wake_io_thread(&self) {
        let _ = write(self.shared.wake_write_fd, &[0u8]);
    }

    /// Current cached state, read under lock.
    pub fn snapshot(&self) -> CachedState {
        self.shared.state.lock().unwrap().clone()
    }

    /// Sets the per-channel temperature/humidity upper bounds the safety
    /// interlock checks at start-time (spec §3, §6). Local only; no
    /// corresponding server command exists for these bounds.
    pub fn set_safety_limits(&self, temperature_limits: Vec<f64>, humidity_limits: Vec<f64>) {
        let mut state = self.shared.state.lock().unwrap();
        state.temperature_limits = temperature_limits;
        state.humidity_limits = humidity_limits;
    }

    /// Records the printf-style file-name pattern used to format the start
    /// verb's filename argument (spec §3, §6). Purely local bookkeeping —
    /// unlike `imgpath`, the pattern itself is never sent to the server on
    /// its own; it only ever appears filled in as part of a start command.
    pub fn set_file_pattern(&self, pattern: String) {
        self.shared.state.lock().unwrap().file_pattern = pattern;
    }

    pub fn status(&self) -> DetectorStatus {
        self.shared.state.lock().unwrap().status
    }

    fn require_idle(&self, state: &CachedState) -> Result<()> {
        match state.status {
            DetectorStatus::Error => Err(DriverError::Protocol {
                message: state
                    .last_error_message
                    .clone()
                    .unwrap_or_else(|| "channel is in sticky error state".to_owned()),
            }),
            DetectorStatus::Disconnected => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not connected",
            ))),
            DetectorStatus::Running | DetectorStatus::KillingAcquisition => Err(DriverError::Busy),
            _ => Ok(()),
        }
    }

    fn write_command(&self, command: &str) -> Result<()> {
        let mut socket = self.shared.socket.lock().unwrap();
        let Some(stream) = socket.as_mut() else {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not connected",
            )));
        };
        crate::wire::write_command(stream, command).map_err(|err| {
            let _ = socket.take();
            DriverError::Io(err)
        })
    }

    /// Sends `command`, transitions the channel to `pending`, and blocks
    /// until either the I/O thread moves the channel out of `pending` again
    /// or `timeout` elapses (spec §4.3 "blocking until expected state").
    fn send_and_wait(&self, command: &str, pending: DetectorStatus, timeout: Duration) -> Result<CachedState> {
        let mut state = self.shared.state.lock().unwrap();
        self.require_idle(&state)?;
        state.status = pending;
        drop(state);

        self.write_command(command)?;

        let guard = self.shared.state.lock().unwrap();
        let (guard, timed_out) = self
            .shared
            .condvar
            .wait_timeout_while(guard, timeout, |state| state.status == pending)
            .unwrap();

        if timed_out.timed_out() {
            return Err(DriverError::Timeout(timeout));
        }
        if guard.status == DetectorStatus::Error {
            return Err(DriverError::Protocol {
                message: guard
                    .last_error_message
                    .clone()
                    .unwrap_or_else(|| "command rejected".to_owned()),
            });
        }
        Ok(guard.clone())
    }

    /// Fire-and-forget style send used for commands the server never fails
    /// in practice (`setackint`, `dbglvl`, `th`, the warm-up exposure).
    fn send_any_command(&self, command: &str) -> Result<()> {
        self.write_command(command)
    }

    /// Sends `command` and waits only for the acknowledging `AnyCommand`
    /// transition, returning the server's free-form reply text if it was an
    /// error. Mirrors the original's `sendAnyCommandAndGetErrorMsg`.
    pub fn send_any_and_get_error(&self, command: &str) -> Result<Option<String>> {
        let state = self.send_and_wait(command, DetectorStatus::AnyCommand, self.shared.config.command_timeout);
        match state {
            Ok(state) => Ok(state.last_error_message.clone()),
            Err(DriverError::Protocol { message }) => Ok(Some(message)),
            Err(other) => Err(other),
        }
    }

    pub fn set_energy(&self, energy_ev: f64) -> Result<()> {
        if !self.snapshot().has_setenergy {
            debug!(energy_ev, "setenergy unsupported by server, skipping");
            return Ok(());
        }
        let command = format!("setenergy {energy_ev}");
        match self.send_and_wait(&command, DetectorStatus::SettingEnergy, self.shared.config.command_timeout) {
            Ok(_) => Ok(()),
            Err(DriverError::NotSupported(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// Sets threshold/gain, then waits for the server's follow-up
    /// calibration-complete confirmation, per spec §4.3's gap-fill note:
    /// the follow-up `gapfill` command is sent with an explicit literal
    /// (`-1` to enable, `0` to disable), never derived arithmetically.
    pub fn set_threshold_gain(&self, threshold_ev: i32, gain: Gain) -> Result<()> {
        let command = match gain.request_token() {
            Some(token) => format!("setthreshold {token} {threshold_ev}"),
            None => format!("setthreshold {threshold_ev}"),
        };
        self.send_and_wait(&command, DetectorStatus::SettingThreshold, self.shared.config.long_command_timeout)?;

        let gap_fill = self.snapshot().gap_fill;
        let gap_fill_arg = if gap_fill { "-1" } else { "0" };
        self.send_any_command(&format!("gapfill {gap_fill_arg}"))?;
        Ok(())
    }

    pub fn set_exposure(&self, seconds: f64) -> Result<()> {
        let command = format!("exptime {seconds}");
        self.send_and_wait(&command, DetectorStatus::SettingExposure, self.shared.config.command_timeout)?;
        Ok(())
    }

    pub fn set_exposure_period(&self, seconds: f64) -> Result<()> {
        let command = format!("expperiod {seconds}");
        self.send_and_wait(&command, DetectorStatus::SettingExposurePeriod, self.shared.config.command_timeout)?;
        Ok(())
    }

    pub fn set_nb_images(&self, nb_images: i32) -> Result<()> {
        let command = format!("nimages {nb_images}");
        self.send_and_wait(
            &command,
            DetectorStatus::SettingNbImagesInSequence,
            self.shared.config.command_timeout,
        )?;
        Ok(())
    }

    pub fn set_hardware_trigger_delay(&self, seconds: f64) -> Result<()> {
        let command = format!("delay {seconds}");
        self.send_and_wait(
            &command,
            DetectorStatus::SettingHardwareTriggerDelay,
            self.shared.config.command_timeout,
        )?;
        Ok(())
    }

    pub fn set_exposures_per_frame(&self, nb_exposures: i32) -> Result<()> {
        let command = format!("nexpframe {nb_exposures}");
        self.send_and_wait(
            &command,
            DetectorStatus::SettingExposurePerFrame,
            self.shared.config.command_timeout,
        )?;
        Ok(())
    }

    pub fn set_imgpath(&self, path: &str) -> Result<()> {
        let command = format!("imgpath {path}");
        self.send_and_wait(&command, DetectorStatus::ReadingTh, self.shared.config.command_timeout)?;
        Ok(())
    }

    /// Starts an exposure sequence. `trigger_mode` selects the server verb
    /// (spec §4.3); the filename argument is the cached file pattern with
    /// its single `%d` slot filled from `first_image_number` (spec §6). A
    /// server that can't honor the currently cached exposure period is
    /// treated as a `Protocol` error rather than silently bumped and retried
    /// (spec §9 open question, rejected). Re-checks the safety interlock
    /// (spec §4.3, §6) even though callers are expected to have gone through
    /// `Acquisition::prepare` already — a channel/humidity reading can trip
    /// the interlock in the window between `prepare` and `start`, and this
    /// is also a public entry point callers can reach directly.
    pub fn start_acquisition(&self, trigger_mode: TriggerMode, first_image_number: i64) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        self.require_idle(&state)?;
        if let Some((channel, reading, limit)) = state.safety_interlock() {
            return Err(DriverError::SafetyInterlock { channel, reading, limit });
        }
        let filename = crate::filename::format_sequence_filename(&state.file_pattern, first_image_number)?;
        state.status = DetectorStatus::Running;
        state.nb_acquired_images = 0;
        drop(state);

        self.write_command(&format!("{} {filename}", trigger_mode.start_verb()))?;
        Ok(())
    }

    /// Requests a kill of the in-progress acquisition and blocks until the
    /// server confirms it (`7 ERR *** killing exposure` followed by the
    /// channel settling back to `Standby`).
    pub fn stop_acquisition(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.status != DetectorStatus::Running {
            return Ok(());
        }
        state.status = DetectorStatus::KillingAcquisition;
        drop(state);

        self.write_command("k")?;

        let guard = self.shared.state.lock().unwrap();
        let (_guard, timed_out) = self
            .shared
            .condvar
            .wait_timeout_while(guard, self.shared.config.long_command_timeout, |state| {
                state.status == DetectorStatus::KillingAcquisition
            })
            .unwrap();
        if timed_out.timed_out() {
            return Err(DriverError::Timeout(self.shared.config.long_command_timeout));
        }
        Ok(())
    }

    /// Forces the channel into the sticky `Error` state without waiting on
    /// any server reply, for a local fault the server never reported — e.g.
    /// the ingestion pipeline's pending-frame map overrunning its bound
    /// (spec §4.4 "the pipeline calls `error_stop` on the Control Channel,
    /// which transitions state to `Error`").
    pub fn error_stop(&self, message: impl Into<String>) {
        let mut state = self.shared.state.lock().unwrap();
        state.status = DetectorStatus::Error;
        state.last_error_message = Some(message.into());
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// Clears the sticky `Error` state locally without talking to the
    /// server (spec §4.3).
    pub fn soft_reset(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.status == DetectorStatus::Error {
            state.status = DetectorStatus::Standby;
            state.last_error_message = None;
        }
        self.shared.condvar.notify_all();
    }

    /// Sends the server's own reset command and waits for it to come back
    /// up as `Standby`.
    pub fn hard_reset(&self) -> Result<()> {
        self.send_and_wait("resetcam", DetectorStatus::AnyCommand, self.shared.config.long_command_timeout)?;
        self.soft_reset();
        Ok(())
    }

    /// Stops the I/O thread and closes the self-pipe. A no-op on a handle
    /// built by [`Self::from_shared`], which never owned the I/O thread in
    /// the first place.
    pub fn shutdown(&self) {
        let Some(handle) = self.io_thread.lock().unwrap().take() else {
            return;
        };
        *self.shared.shutdown.lock().unwrap() = true;
        self.wake_io_thread();
        let _ = handle.join();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns a background resync burst in response to a `/tmp/setthreshold`
/// completion observed by the I/O thread (spec §4.3). Skipped if a resync
/// (this one's own, or the post-connect one) is already in flight, so the
/// completions a burst's own commands provoke don't recurse.
fn spawn_resync_on_calibration_complete(shared: &Arc<Shared>) {
    if shared.resyncing.load(Ordering::SeqCst) {
        return;
    }
    let shared = Arc::clone(shared);
    let spawned = std::thread::Builder::new()
        .name("control-channel-resync".into())
        .spawn(move || {
            let channel = ControlChannel::from_shared(shared);
            if let Err(err) = channel.resync() {
                warn!(%err, "resync after calibration complete failed");
            }
        });
    if let Err(err) = spawned {
        warn!(%err, "failed to spawn resync-on-calibration-complete thread");
    }
}

pub(crate) fn apply_event(state: &mut CachedState, event: Event) {
    use DetectorStatus::*;

    // Sticky error (spec §3, §4.3, §9): once the channel has latched
    // `Error`, no inbound record may clear it or touch cached fields. Only
    // an explicit user-initiated command (`soft_reset`/`hard_reset`) does.
    if state.status == Error {
        tracing::debug!(?event, "dropping reply while channel is in sticky error state");
        return;
    }

    match event {
        Event::EnergyAck(ev) => {
            state.energy = ev;
            state.status = Standby;
        }
        Event::ThresholdAck { threshold, gain } => {
            state.threshold = threshold;
            if let Some(gain) = gain {
                state.gain = gain;
            }
            state.status = Standby;
        }
        Event::CalibrationComplete => {
            // Confirms the threshold/energy change has fully applied; no
            // cached field changes, the status transition already happened
            // on the Settings: line.
        }
        Event::ExposureTimeAck(seconds) => {
            state.exposure = seconds;
            state.status = Standby;
        }
        Event::ExposurePeriodAck(seconds) => {
            state.exposure_period = seconds;
            state.status = Standby;
        }
        Event::ExposuresPerFrameAck(n) => {
            state.exposures_per_frame = n;
            state.status = Standby;
        }
        Event::HardwareTriggerDelayAck(seconds) => {
            state.hw_trigger_delay = seconds;
            state.status = Standby;
        }
        Event::NbImagesAck(n) => {
            state.nb_images = n;
            state.status = Standby;
        }
        Event::ImgpathAck(path) => {
            state.imgpath = path;
            state.status = Standby;
        }
        Event::ImgpathError(message) => {
            state.last_error_message = Some(message);
            state.status = Error;
        }
        Event::ExposureSequenceComplete(_path) => {
            state.status = Standby;
            state.nb_acquired_images = state.nb_images;
        }
        Event::ExposureKillConfirmed => {
            state.status = Standby;
        }
        Event::ExposureFailed(message) => {
            state.last_error_message = Some(message);
            state.status = Error;
        }
        Event::AcquisitionKilled => {
            state.status = Standby;
        }
        Event::CommandRejected(message) => {
            state.last_error_message = Some(message);
            state.status = Error;
        }
        Event::CapabilityMissing("setenergy") => {
            state.has_setenergy = false;
            state.status = Standby;
        }
        Event::CapabilityMissing(_) => {
            state.status = Standby;
        }
        Event::TemperatureHumidityReport(readings) => {
            state.temperatures = readings.iter().map(|(_, t, _)| *t).collect();
            state.humidities = readings.iter().map(|(_, _, h)| *h).collect();
        }
        Event::TemperatureHumidityError(message) => {
            state.last_error_message = Some(message);
        }
        Event::GenericError(message) => {
            state.last_error_message = Some(message);
            state.status = Error;
        }
        Event::GenericAck => {
            if state.status == AnyCommand {
                state.status = Standby;
            }
        }
        Event::Unrecognized(text) => {
            tracing::debug!(record = %text, "unrecognized reply record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_event_clears_transient_status_on_ack() {
        let mut state = CachedState::default();
        state.status = DetectorStatus::SettingExposure;
        apply_event(&mut state, Event::ExposureTimeAck(0.5));
        assert_eq!(state.exposure, 0.5);
        assert_eq!(state.status, DetectorStatus::Standby);
    }

    #[test]
    fn apply_event_marks_capability_missing() {
        let mut state = CachedState::default();
        state.status = DetectorStatus::SettingEnergy;
        apply_event(&mut state, Event::CapabilityMissing("setenergy"));
        assert!(!state.has_setenergy);
        assert_eq!(state.status, DetectorStatus::Standby);
    }

    #[test]
    fn apply_event_enters_sticky_error_on_rejection() {
        let mut state = CachedState::default();
        apply_event(&mut state, Event::CommandRejected("bad command".into()));
        assert_eq!(state.status, DetectorStatus::Error);
        assert_eq!(state.last_error_message.as_deref(), Some("bad command"));
    }

    #[test]
    fn apply_event_sets_acquired_count_on_sequence_complete() {
        let mut state = CachedState::default();
        state.status = DetectorStatus::Running;
        state.nb_images = 10;
        apply_event(&mut state, Event::ExposureSequenceComplete("/tmp/x_0009.edf".into()));
        assert_eq!(state.status, DetectorStatus::Standby);
        assert_eq!(state.nb_acquired_images, 10);
    }

    #[test]
    fn apply_event_ignores_records_while_in_sticky_error() {
        let mut state = CachedState::default();
        state.status = DetectorStatus::Error;
        state.exposure = 0.5;
        apply_event(&mut state, Event::ExposureTimeAck(1.5));
        assert_eq!(state.status, DetectorStatus::Error);
        assert_eq!(state.exposure, 0.5);
    }

    #[test]
    fn apply_event_updates_temperature_humidity() {
        let mut state = CachedState::default();
        apply_event(
            &mut state,
            Event::TemperatureHumidityReport(vec![(0, 24.0, 18.0)]),
        );
        assert_eq!(state.temperatures, vec![24.0]);
        assert_eq!(state.humidities, vec![18.0]);
    }
}
