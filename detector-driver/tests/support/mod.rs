// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! A scripted TCP responder standing in for the control server, driven by a
//! plain closure mapping an inbound command record to the reply records it
//! should send back. Mirrors the original's actual wire protocol closely
//! enough that the driver under test never knows it isn't talking to a real
//! detector.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use detector_driver::wire::TERMINATOR;

pub type Handler = Box<dyn Fn(&str) -> Vec<String> + Send>;

pub struct FakeServer {
    pub addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

pub type ConnectHook = Box<dyn FnOnce(&TcpStream) + Send>;

impl FakeServer {
    /// Starts listening and spawns a background thread that accepts exactly
    /// one connection and applies `handler` to every inbound record.
    pub fn start(handler: Handler) -> Self {
        Self::start_with_hook(handler, None)
    }

    /// Like [`Self::start`], but runs `on_connect` against the raw stream
    /// immediately after accepting, before any command has been read —
    /// used to inject an unsolicited async event (spec §4.2's `215 OK`
    /// reports arrive this way in production too).
    pub fn start_with_hook(handler: Handler, on_connect: Option<ConnectHook>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("fake-control-server".into())
            .spawn(move || run(listener, handler, on_connect, stop_clone))
            .expect("spawn fake server thread");
        Self {
            addr,
            handle: Some(handle),
            stop,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(listener: TcpListener, handler: Handler, on_connect: Option<ConnectHook>, stop: Arc<AtomicBool>) {
    let stream = loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return,
        }
    };
    stream.set_nonblocking(true).expect("nonblocking stream");
    if let Some(hook) = on_connect {
        hook(&stream);
    }

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match (&stream).read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buf.iter().position(|&b| b == TERMINATOR) {
                    let record: Vec<u8> = buf.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&record[..record.len() - 1]).into_owned();
                    for reply in handler(&text) {
                        send(&stream, &reply);
                    }
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    }
}

fn send(mut stream: &TcpStream, text: &str) {
    let mut out = text.as_bytes().to_vec();
    out.push(TERMINATOR);
    let _ = stream.write_all(&out);
}

/// Pushes a raw reply record to `stream` directly, used to inject
/// unsolicited async events (e.g. a temperature/humidity report) ahead of
/// the command/reply stream.
pub fn push_unsolicited(stream: &TcpStream, text: &str) {
    send(stream, text);
}

/// A handler covering every command the resync burst and the warm-up
/// workaround send, plus the settings/start/kill verbs, so tests only need
/// to special-case the one or two commands their scenario cares about.
pub fn standard_reply(cmd: &str) -> Vec<String> {
    let cmd = cmd.trim();

    if let Some(rest) = cmd.strip_prefix("setenergy ") {
        return vec![format!("15 OK Energy: {}", rest.trim())];
    }
    if cmd.starts_with("setthreshold") {
        return vec!["15 OK  Settings: mid gain; threshold: 6300 eV; vcmp: 0.654 V".to_owned()];
    }
    if let Some(rest) = cmd.strip_prefix("exptime ") {
        return vec![format!("15 OK Exposure time set to: {} sec", rest.trim())];
    }
    if let Some(rest) = cmd.strip_prefix("expperiod ") {
        return vec![format!("15 OK Exposure period set to: {} sec", rest.trim())];
    }
    if let Some(rest) = cmd.strip_prefix("nimages ") {
        return vec![format!("15 OK N images set to: {}", rest.trim())];
    }
    if let Some(rest) = cmd.strip_prefix("delay ") {
        return vec![format!("15 OK Delay time set to: {} sec", rest.trim())];
    }
    if let Some(rest) = cmd.strip_prefix("nexpframe ") {
        return vec![format!("15 OK Exposures per frame set to: {}", rest.trim())];
    }
    if let Some(rest) = cmd.strip_prefix("imgpath ") {
        return vec![format!("10 OK {}", rest.trim())];
    }
    if cmd.starts_with("gapfill")
        || cmd.starts_with("setackint")
        || cmd.starts_with("dbglvl")
        || cmd == "th"
        || cmd.starts_with("exposure warmup")
    {
        return Vec::new();
    }
    if cmd == "k" {
        return vec!["7 ERR *** killing exposure".to_owned(), "13 killed".to_owned()];
    }
    if cmd.starts_with("exposure ") || cmd.starts_with("exttrigger ") || cmd.starts_with("extmtrigger ") || cmd.starts_with("extenable ") {
        // A real server only replies once the exposure sequence actually
        // completes; tests that need this drive it explicitly instead of
        // relying on the default handler.
        return Vec::new();
    }
    Vec::new()
}

/// Writes a frame file matching the ingestion pipeline's expected layout: a
/// 1024-byte header followed by `width * height * bytes_per_pixel` bytes of
/// payload (spec §4.4, §6).
pub fn write_frame_file(dir: &std::path::Path, pattern_base: &str, index: usize, width: usize, height: usize, bytes_per_pixel: usize) {
    let path = dir.join(format!("{pattern_base}_{index:05}.edf"));
    let mut file = std::fs::File::create(path).expect("create frame file");
    file.write_all(&vec![0u8; 1024]).expect("write header");
    let payload = vec![index as u8; width * height * bytes_per_pixel];
    file.write_all(&payload).expect("write payload");
}
