// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C2: the reply classifier. Maps a reply record's numeric prefix and
//! keyword-sniffed body to a typed [`Event`]. This is the only place in the
//! crate that knows the server's text-sniffing heuristics; every other
//! component sees only this enum (spec §4.2, design note in spec §9).

use crate::types::Gain;

/// A typed transition derived from one reply record.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    EnergyAck(f64),
    ThresholdAck { threshold: i32, gain: Option<Gain> },
    /// The server's `/tmp/setthreshold` confirmation line: a preceding
    /// threshold or energy change has now fully applied and a resync burst
    /// should be re-issued.
    CalibrationComplete,
    ExposureTimeAck(f64),
    ExposurePeriodAck(f64),
    ExposuresPerFrameAck(i32),
    HardwareTriggerDelayAck(f64),
    NbImagesAck(i32),
    ImgpathAck(String),
    ImgpathError(String),
    /// `7 OK <path>`: the exposure sequence completed and wrote its last
    /// file at `path`.
    ExposureSequenceComplete(String),
    /// `7 ERR *** killing exposure`: the in-progress kill was confirmed.
    ExposureKillConfirmed,
    ExposureFailed(String),
    /// `13 ...`: acquisition killed.
    AcquisitionKilled,
    CommandRejected(String),
    /// Sticky detection that the server lacks a named command (today only
    /// `setenergy`).
    CapabilityMissing(&'static str),
    TemperatureHumidityReport(Vec<(usize, f64, f64)>),
    TemperatureHumidityError(String),
    GenericError(String),
    /// A `15 OK` body whose keywords didn't match anything the core tracks
    /// (e.g. the free-form `Starting ... background` line). Not an error;
    /// simply nothing to update.
    GenericAck,
    /// A record whose prefix wasn't recognized at all.
    Unrecognized(String),
}

/// Classifies one reply record (already split on the terminator, and
/// therefore terminator-free) into an [`Event`].
pub fn classify(record: &[u8]) -> Event {
    let text = String::from_utf8_lossy(record);
    let text = text.as_ref();

    if let Some(rest) = text.strip_prefix("15 ") {
        return classify_15(rest);
    }
    if let Some(rest) = text.strip_prefix("13") {
        let _ = rest;
        return Event::AcquisitionKilled;
    }
    if let Some(rest) = text.strip_prefix("7 ") {
        return classify_7(rest);
    }
    if let Some(rest) = text.strip_prefix("1 ") {
        return classify_1(rest);
    }
    if let Some(rest) = text.strip_prefix("10 ") {
        return classify_10(rest);
    }
    if let Some(rest) = text.strip_prefix("215 ") {
        return classify_215(rest);
    }
    Event::Unrecognized(text.to_owned())
}

fn classify_15(rest: &str) -> Event {
    let Some(body) = rest.strip_prefix("OK ").or_else(|| rest.strip_prefix("OK")) else {
        let message = rest.strip_prefix("ERR ").unwrap_or(rest).trim().to_owned();
        return Event::GenericError(message);
    };
    let body = body.trim_start();

    if body.contains("Energy") {
        if let Some(colon) = body.find(':') {
            if let Ok(ev) = body[colon + 1..].trim().parse::<f64>() {
                return Event::EnergyAck(ev);
            }
        }
        return Event::GenericAck;
    }

    if let Some(pos) = body.find("Settings:") {
        return parse_settings(&body[pos + "Settings:".len()..]);
    }

    if body.contains("/tmp/setthreshold") {
        return Event::CalibrationComplete;
    }

    if let Some(pos) = body.find("Exposure") {
        return parse_exposure_ack(&body[pos..]);
    }

    if let Some(pos) = body.find("Delay") {
        return parse_trailing_f64(&body[pos..]).map_or(Event::GenericAck, Event::HardwareTriggerDelayAck);
    }

    if body.contains("N images") {
        if let Some(colon) = body.find(':') {
            if let Ok(n) = body[colon + 1..].trim().parse::<i32>() {
                return Event::NbImagesAck(n);
            }
        }
        return Event::GenericAck;
    }

    Event::GenericAck
}

/// Parses `<gain-word(s)> gain; threshold: <n> eV; vcmp: <v> V`.
fn parse_settings(body: &str) -> Event {
    let mut fields = body.split(';');
    let gain_field = fields.next().unwrap_or_default();
    let threshold_field = fields.next().unwrap_or_default();

    let gain = gain_field
        .trim()
        .strip_suffix("gain")
        .map(str::trim)
        .and_then(Gain::from_reply_token);

    let threshold = threshold_field
        .trim()
        .strip_prefix("threshold:")
        .and_then(|s| s.trim().split_whitespace().next())
        .and_then(|n| n.parse::<i32>().ok());

    match threshold {
        Some(threshold) => Event::ThresholdAck { threshold, gain },
        None => Event::GenericAck,
    }
}

/// `Exposure time set to: <f> sec` / `Exposure period set to: <f> sec` /
/// `Exposures per frame set to: <n>`, disambiguated by spec §4.2: characters
/// 9..14 of the message (`time`, `period`, otherwise per-frame).
fn parse_exposure_ack(message: &str) -> Event {
    let discriminator = message.get(9..14).unwrap_or_default();
    let Some(colon) = message.find(':') else {
        return Event::GenericAck;
    };
    let value_part = message[colon + 1..].trim();
    let numeric: String = value_part
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    if discriminator == "time " {
        numeric
            .parse::<f64>()
            .map_or(Event::GenericAck, Event::ExposureTimeAck)
    } else if discriminator.starts_with("perio") {
        numeric
            .parse::<f64>()
            .map_or(Event::GenericAck, Event::ExposurePeriodAck)
    } else {
        value_part
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<i32>().ok())
            .map_or(Event::GenericAck, Event::ExposuresPerFrameAck)
    }
}

fn parse_trailing_f64(message: &str) -> Option<f64> {
    let colon = message.find(':')?;
    let value_part = message[colon + 1..].trim();
    let numeric: String = value_part
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    numeric.parse::<f64>().ok()
}

fn classify_7(rest: &str) -> Event {
    if let Some(path) = rest.strip_prefix("OK ") {
        return Event::ExposureSequenceComplete(path.trim().to_owned());
    }
    if let Some(message) = rest.strip_prefix("ERR ") {
        if message.contains("killing exposure") {
            return Event::ExposureKillConfirmed;
        }
        return Event::ExposureFailed(message.trim().to_owned());
    }
    Event::Unrecognized(format!("7 {rest}"))
}

fn classify_1(rest: &str) -> Event {
    if let Some(message) = rest.strip_prefix("ERR ") {
        let message = message.trim();
        if message.contains("Unrecognized command: setenergy") {
            return Event::CapabilityMissing("setenergy");
        }
        return Event::CommandRejected(message.to_owned());
    }
    Event::Unrecognized(format!("1 {rest}"))
}

fn classify_10(rest: &str) -> Event {
    if let Some(path) = rest.strip_prefix("OK ").or_else(|| rest.strip_prefix("OK")) {
        return Event::ImgpathAck(path.trim().to_owned());
    }
    if let Some(message) = rest.strip_prefix("ERR ") {
        return Event::ImgpathError(message.trim().to_owned());
    }
    Event::Unrecognized(format!("10 {rest}"))
}

/// `215 OK` bodies are multi-line: each line matches
/// `Channel <n>: Temperature = <t> C, Rel. Humidity = <h>`.
fn classify_215(rest: &str) -> Event {
    if let Some(body) = rest.strip_prefix("OK ").or_else(|| rest.strip_prefix("OK")) {
        let mut readings = Vec::new();
        for line in body.lines() {
            if let Some(reading) = parse_channel_line(line) {
                readings.push(reading);
            }
        }
        return Event::TemperatureHumidityReport(readings);
    }
    if let Some(message) = rest.strip_prefix("ERR ") {
        return Event::TemperatureHumidityError(message.trim().to_owned());
    }
    Event::Unrecognized(format!("215 {rest}"))
}

fn parse_channel_line(line: &str) -> Option<(usize, f64, f64)> {
    let line = line.trim();
    let rest = line.strip_prefix("Channel ")?;
    let (n_str, rest) = rest.split_once(':')?;
    let n: usize = n_str.trim().parse().ok()?;

    let temp_pos = rest.find("Temperature")?;
    let hum_pos = rest.find("Rel. Humidity")?;
    let temp_eq = rest[temp_pos..].find('=')? + temp_pos;
    let hum_eq = rest[hum_pos..].find('=')? + hum_pos;

    let temp_str: String = rest[temp_eq + 1..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let hum_str: String = rest[hum_eq + 1..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    Some((n, temp_str.parse().ok()?, hum_str.parse().ok()?))
}
