// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! C1: the wire codec. Frames outgoing commands with the protocol's
//! terminator and splits an inbound byte stream into discrete reply records.

use std::io::{self, Write};

/// The server's record terminator: ASCII `CAN`, decimal 24.
pub const TERMINATOR: u8 = 24;

/// Maximum size of a single reply record before it is treated as corrupt.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Writes a command line to `w`, appending [`TERMINATOR`]. Retries partial
/// writes until the whole buffer is sent or the socket errors, per spec §4.1.
pub fn write_command<W: Write>(w: &mut W, command: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(command.len() + 1);
    buf.extend_from_slice(command.as_bytes());
    buf.push(TERMINATOR);

    let mut sent = 0;
    while sent < buf.len() {
        sent += w.write(&buf[sent..])?;
    }
    Ok(())
}

/// Accumulates bytes read off the socket and yields complete records,
/// preserving partial records across calls to [`RecordSplitter::feed`].
#[derive(Debug, Default)]
pub struct RecordSplitter {
    buf: Vec<u8>,
}

/// Outcome of feeding a chunk of bytes to a [`RecordSplitter`].
#[derive(Debug)]
pub enum SplitError {
    /// A record grew past [`MAX_RECORD_LEN`] without a terminator. Carries
    /// the prefix accumulated so far so the caller can log it before
    /// discarding the rest.
    Oversized { prefix: Vec<u8> },
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly-read bytes into the splitter, returning every complete
    /// record contained within (in arrival order). Any trailing partial
    /// record is retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, SplitError> {
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut start = 0;
        while let Some(rel_pos) = self.buf[start..].iter().position(|&b| b == TERMINATOR) {
            let end = start + rel_pos;
            records.push(self.buf[start..end].to_vec());
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_RECORD_LEN {
            let prefix = self.buf[..MAX_RECORD_LEN.min(self.buf.len())].to_vec();
            self.buf.clear();
            return Err(SplitError::Oversized { prefix });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_command_appends_terminator() {
        let mut out = Vec::new();
        write_command(&mut out, "exptime 0.1").unwrap();
        assert_eq!(out, b"exptime 0.1\x18");
    }

    #[test]
    fn splitter_yields_complete_records_only() {
        let mut splitter = RecordSplitter::new();
        let recs = splitter.feed(b"15 OK hello\x1810 OK /tmp").unwrap();
        assert_eq!(recs, vec![b"15 OK hello".to_vec()]);
        let recs = splitter.feed(b"\x18").unwrap();
        assert_eq!(recs, vec![b"10 OK /tmp".to_vec()]);
    }

    #[test]
    fn splitter_preserves_boundaries_across_reads() {
        let mut splitter = RecordSplitter::new();
        assert!(splitter.feed(b"15 O").unwrap().is_empty());
        let recs = splitter.feed(b"K done\x18").unwrap();
        assert_eq!(recs, vec![b"15 OK done".to_vec()]);
    }

    #[test]
    fn splitter_handles_concatenated_records() {
        let mut splitter = RecordSplitter::new();
        let recs = splitter.feed(b"13 \x187 OK /a.cbf\x18").unwrap();
        assert_eq!(recs, vec![b"13 ".to_vec(), b"7 OK /a.cbf".to_vec()]);
    }

    #[test]
    fn splitter_rejects_oversized_records() {
        let mut splitter = RecordSplitter::new();
        let huge = vec![b'x'; MAX_RECORD_LEN + 1];
        let err = splitter.feed(&huge).unwrap_err();
        match err {
            SplitError::Oversized { prefix } => assert_eq!(prefix.len(), MAX_RECORD_LEN),
        }
    }
}
