//! Progress events delivered to the caller and cooperative cancellation.
//!
//! The worker never calls back into the caller. It pushes [`Event`]s into a
//! channel that the caller drains on its own execution context, either with
//! `recv().await` from an async main loop or `blocking_recv()` from a thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

/// A progress event for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A human-readable progress line.
    Log(String),
    /// Terminal signal; sent exactly once, always last.
    Finished {
        /// Whether the operation as a whole succeeded.
        success: bool,
    },
}

/// Worker-side sending half for one operation's events.
#[derive(Debug, Clone)]
pub struct EventSink {
    /// Channel to the caller.
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Creates a sink and the receiver the caller drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits a progress line. Lines sent after the caller hung up are dropped.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        trace!(%line, "progress");
        let _ = self.tx.send(Event::Log(line));
    }

    /// Emits the terminal signal, consuming the sink so it cannot be sent twice.
    pub fn finish(self, success: bool) {
        let _ = self.tx.send(Event::Finished { success });
    }
}

/// Cooperative cancellation flag, polled between commands.
///
/// A token is cancelled either directly or when the [`Bridge`](crate::Bridge)
/// that issued it cancels everything submitted before the call.
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Set by [`cancel`](Self::cancel).
    own: Arc<AtomicBool>,
    /// Bridge-wide cancellation epoch.
    epoch: Arc<AtomicU64>,
    /// Epoch at the time this token was issued.
    born: u64,
}

impl CancelToken {
    /// A standalone token not tied to any bridge.
    pub fn new() -> Self {
        Self::with_epoch(Arc::new(AtomicU64::new(0)))
    }

    /// A token that is also cancelled when `epoch` advances.
    pub(crate) fn with_epoch(epoch: Arc<AtomicU64>) -> Self {
        let born = epoch.load(Ordering::SeqCst);
        Self {
            own: Arc::new(AtomicBool::new(false)),
            epoch,
            born,
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != self.born
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order_and_finish_last() {
        let (sink, mut rx) = EventSink::channel();
        sink.log("one");
        sink.log(String::from("two"));
        sink.finish(true);

        assert_eq!(rx.blocking_recv(), Some(Event::Log("one".into())));
        assert_eq!(rx.blocking_recv(), Some(Event::Log("two".into())));
        assert_eq!(rx.blocking_recv(), Some(Event::Finished { success: true }));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn logging_after_receiver_dropped_is_harmless() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.log("nobody listening");
        sink.finish(false);
    }

    #[test]
    fn token_cancels_directly() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn epoch_cancels_only_older_tokens() {
        let epoch = Arc::new(AtomicU64::new(0));
        let old = CancelToken::with_epoch(Arc::clone(&epoch));
        epoch.fetch_add(1, Ordering::SeqCst);
        let new = CancelToken::with_epoch(Arc::clone(&epoch));

        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());
    }
}
