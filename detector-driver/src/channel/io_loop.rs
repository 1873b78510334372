// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! The control channel's dedicated I/O thread: blocks in `poll(2)` over the
//! socket and a self-pipe wake fd, reads available bytes, and classifies
//! complete records into cached-state transitions.

use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::read;
use tracing::{trace, warn};

use crate::wire::{RecordSplitter, SplitError};

use super::{apply_event, Shared};

pub(super) fn run(shared: Arc<Shared>) {
    let mut splitter = RecordSplitter::new();
    let mut read_buf = [0u8; 4096];

    loop {
        if *shared.shutdown.lock().unwrap() {
            return;
        }

        let socket_fd = shared
            .socket
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.as_raw_fd());

        // SAFETY: `wake_read_fd` outlives this loop iteration; it is only
        // closed in `Shared::drop`, after this thread has been joined.
        let wake_fd = unsafe { BorrowedFd::borrow_raw(shared.wake_read_fd) };
        let mut fds = vec![PollFd::new(wake_fd, PollFlags::POLLIN)];
        // SAFETY: same lifetime argument as above, scoped to a raw socket fd
        // obtained just before the call.
        let socket_poll_fd = socket_fd.map(|fd| unsafe { BorrowedFd::borrow_raw(fd) });
        if let Some(fd) = socket_poll_fd.as_ref() {
            fds.push(PollFd::new(*fd, PollFlags::POLLIN));
        }

        let timeout = if socket_fd.is_some() {
            PollTimeout::NONE
        } else {
            // Nothing to watch yet besides the wake pipe; recheck
            // periodically in case `connect` races this check.
            PollTimeout::from(200u16)
        };

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                warn!(%err, "poll failed in control channel I/O thread");
                continue;
            }
        }

        if fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            let mut drain = [0u8; 256];
            let _ = read(shared.wake_read_fd, &mut drain);
        }

        let socket_readable = fds
            .get(1)
            .and_then(|pfd| pfd.revents())
            .map(|revents| revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
            .unwrap_or(false);

        if !socket_readable {
            continue;
        }

        let Some(fd) = socket_fd else { continue };
        // SAFETY: `fd` was read from the live socket a moment ago under the
        // same lock discipline as every other socket access in this module.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match read(borrowed.as_raw_fd(), &mut read_buf) {
            Ok(0) => {
                warn!("control server closed the connection");
                disconnect(&shared);
            }
            Ok(n) => match splitter.feed(&read_buf[..n]) {
                Ok(records) => {
                    for record in records {
                        trace!(bytes = record.len(), "reply record received");
                        let event = crate::protocol::classify(&record);
                        let is_calibration_complete = matches!(event, crate::protocol::Event::CalibrationComplete);
                        let mut state = shared.state.lock().unwrap();
                        apply_event(&mut state, event);
                        drop(state);
                        shared.condvar.notify_all();
                        if is_calibration_complete {
                            super::spawn_resync_on_calibration_complete(&shared);
                        }
                    }
                }
                Err(SplitError::Oversized { prefix }) => {
                    warn!(len = prefix.len(), "oversized reply record discarded");
                    enter_error(&shared, format!("oversized reply record ({} bytes) discarded", prefix.len()));
                }
            },
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {}
            Err(nix::errno::Errno::EINTR) => {}
            Err(err) => {
                warn!(%err, "read failed on control socket");
                disconnect(&shared);
            }
        }
    }
}

fn disconnect(shared: &Arc<Shared>) {
    *shared.socket.lock().unwrap() = None;
    let mut state = shared.state.lock().unwrap();
    state.status = crate::types::DetectorStatus::Disconnected;
    drop(state);
    shared.condvar.notify_all();
}

/// Latches the sticky `Error` state for a fault the server never reported
/// itself — spec §4.1: an oversized record "yield[s] an `Error` status with
/// the offending prefix logged." Mirrors
/// [`crate::channel::ControlChannel::error_stop`], but callable from the I/O
/// thread, which only holds `Shared`, not a full `ControlChannel`.
fn enter_error(shared: &Arc<Shared>, message: String) {
    let mut state = shared.state.lock().unwrap();
    state.status = crate::types::DetectorStatus::Error;
    state.last_error_message = Some(message);
    drop(state);
    shared.condvar.notify_all();
}
