//! In-memory scripted peer for protocol tests.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use adbloop_proto::{CLSE, Message};

use crate::event::{CancelToken, Event};
use crate::transport::Transport;

/// A stream that replays pre-encoded peer messages and records what the
/// client sends.
#[derive(Debug)]
pub(crate) struct ScriptedStream {
    /// Encoded peer replies, read in order.
    incoming: io::Cursor<Vec<u8>>,
    /// Everything the client wrote.
    outgoing: Vec<u8>,
    /// Last timeout set by the client.
    read_timeout: Mutex<Option<Duration>>,
    /// Set when the client shuts the stream down.
    closed: Arc<AtomicBool>,
    /// Read past the script end as a timeout instead of EOF.
    stall_when_drained: bool,
    /// Cancel this token once the client has sent this many `CLSE`s.
    cancel_after_closes: Option<(usize, CancelToken)>,
}

impl ScriptedStream {
    /// Scripts the given peer replies.
    pub(crate) fn new(replies: Vec<Message>) -> Self {
        let mut incoming = Vec::new();
        for msg in &replies {
            adbloop_proto::encode(&mut incoming, msg).unwrap();
        }
        Self {
            incoming: io::Cursor::new(incoming),
            outgoing: Vec::new(),
            read_timeout: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            stall_when_drained: false,
            cancel_after_closes: None,
        }
    }

    /// Makes reads past the script end fail with `TimedOut`.
    pub(crate) fn stall_when_drained(mut self) -> Self {
        self.stall_when_drained = true;
        self
    }

    /// Cancels `token` after the client's `n`-th `CLSE`.
    pub(crate) fn cancel_after_closes(mut self, n: usize, token: CancelToken) -> Self {
        self.cancel_after_closes = Some((n, token));
        self
    }

    /// Shared flag observing whether the stream was closed.
    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Decodes everything the client sent so far.
    pub(crate) fn sent(&self) -> Vec<Message> {
        let mut cursor = io::Cursor::new(&self.outgoing);
        let mut out = Vec::new();
        while (cursor.position() as usize) < self.outgoing.len() {
            out.push(adbloop_proto::decode(&mut cursor).unwrap());
        }
        out
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.incoming.read(buf)?;
        if n == 0 && !buf.is_empty() && self.stall_when_drained {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted stall"));
        }
        Ok(n)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.outgoing.extend_from_slice(buf);
        if let Some((n, token)) = &self.cancel_after_closes {
            let closes = self.sent().iter().filter(|m| m.command == CLSE).count();
            if closes >= *n {
                token.cancel();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedStream {
    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        Ok(*self.read_timeout.lock().unwrap())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *self.read_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Peer replies for one shell stream: accept, one write per chunk, close.
pub(crate) fn shell_replies(local_id: u32, remote_id: u32, chunks: &[&str]) -> Vec<Message> {
    let mut replies = vec![Message::okay(remote_id, local_id)];
    for chunk in chunks {
        replies.push(Message::write(remote_id, local_id, chunk.as_bytes().to_vec()));
    }
    replies.push(Message::close(remote_id, local_id));
    replies
}

/// Drains every log line from a finished event channel.
pub(crate) fn drain_logs(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Log(line) = event {
            lines.push(line);
        }
    }
    lines
}
