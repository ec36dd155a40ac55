//! Shell streams over an authenticated connection.
//!
//! One stream runs at a time:
//!
//! ```text
//! client                      daemon
//!   OPEN(local, 0, "shell:cmd\0") →
//!                             ← OKAY(remote, local)
//!                             ← WRTE(remote, local, chunk)
//!   OKAY(local, remote)       →                         (once per WRTE)
//!                             ← CLSE(remote, local)
//!   CLSE(local, remote)       →
//! ```

use adbloop_proto::{CLSE, Message, OKAY, WRTE};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{Connection, Transport};

/// Result of a line-streamed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Number of lines emitted.
    pub lines: usize,
    /// `false` if any line contained the error marker.
    pub success: bool,
}

impl<S: Transport> Connection<S> {
    /// Runs `command` in a remote shell and returns its whole output.
    pub fn shell(&mut self, command: &str) -> Result<String> {
        let mut output = Vec::new();
        self.run_stream(command, |chunk| output.extend_from_slice(chunk))?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Runs `command` and hands each output line to `on_line` as soon as it
    /// is complete. A line containing `marker` marks the run failed.
    pub fn shell_streaming(
        &mut self,
        command: &str,
        marker: &str,
        mut on_line: impl FnMut(&str),
    ) -> Result<StreamOutcome> {
        let mut outcome = StreamOutcome {
            lines: 0,
            success: true,
        };
        let mut emit = |line: &str| {
            outcome.lines += 1;
            if !marker.is_empty() && line.contains(marker) {
                outcome.success = false;
            }
            on_line(line);
        };

        let mut buffer = LineBuffer::default();
        self.run_stream(command, |chunk| buffer.push(chunk, &mut emit))?;
        if let Some(rest) = buffer.finish() {
            emit(&rest);
        }
        Ok(outcome)
    }

    /// Opens a `shell:` stream and feeds every `WRTE` payload to `on_chunk`.
    fn run_stream(&mut self, command: &str, mut on_chunk: impl FnMut(&[u8])) -> Result<()> {
        let destination = format!("shell:{command}");
        let max = self.max_payload();
        if destination.len() + 1 > max as usize {
            return Err(Error::PayloadTooLarge {
                len: destination.len() + 1,
                max,
            });
        }

        let local = self.alloc_local_id();
        self.send(&Message::open(local, &destination))?;

        let remote = loop {
            let msg = self.recv_for(local)?;
            match msg.command {
                OKAY => break msg.arg0,
                CLSE => {
                    return Err(Error::StreamRejected {
                        command: command.to_owned(),
                    });
                }
                _ => return Err(Error::unexpected("OKAY", &msg)),
            }
        };
        debug!(local, remote, "stream open");

        loop {
            let msg = self.recv_for(local)?;
            match msg.command {
                WRTE => {
                    on_chunk(&msg.payload);
                    self.send(&Message::okay(local, remote))?;
                }
                CLSE => {
                    self.send(&Message::close(local, remote))?;
                    debug!(local, remote, "stream closed");
                    return Ok(());
                }
                _ => return Err(Error::unexpected("WRTE or CLSE", &msg)),
            }
        }
    }

    /// Receives the next message addressed to `local`, skipping late `CLSE`s
    /// for streams that are already finished.
    fn recv_for(&mut self, local: u32) -> Result<Message> {
        loop {
            let msg = self.recv()?;
            if msg.arg1 == local {
                return Ok(msg);
            }
            if msg.command == CLSE {
                debug!(stale = msg.arg1, local, "skipping close for finished stream");
                continue;
            }
            return Err(Error::unexpected("message for the open stream", &msg));
        }
    }
}

/// Splits a byte stream into lines without losing partial data between chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    /// Bytes after the last newline seen.
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `chunk` and emits every completed line, without its `\n`/`\r\n`.
    pub fn push(&mut self, chunk: &[u8], mut emit: impl FnMut(&str)) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            emit(&decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
    }

    /// Returns the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

/// Lossy UTF-8 with a trailing `\r` removed.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
