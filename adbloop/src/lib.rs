//! Embedded Android debug bridge client.
//!
//! `adbloop` lets an app talk to the debug daemon of the device it runs on,
//! over TCP on loopback or a local interface. It speaks the bridge's framed
//! wire protocol, authenticates with a persisted RSA key pair and runs shell
//! commands, so the app can grant itself permissions, install packages and
//! run scripts without a computer attached.
//!
//! # Quick start
//!
//! ```no_run
//! use adbloop::{Bridge, Config};
//!
//! let config = Config::default().with_package("com.example.cam");
//! let bridge = Bridge::new(config)?;
//!
//! // Progress lines arrive on the caller's side; the verdict comes last.
//! let ok = bridge
//!     .grant_all_permissions()
//!     .wait(|line| println!("{line}"));
//! println!("all granted: {ok}");
//! # Ok::<(), adbloop::Error>(())
//! ```
//!
//! Each operation opens its own connection, authenticates and closes it
//! again. Operations run one at a time on a background worker.

mod auth;
mod bridge;
mod config;
mod error;
mod event;
mod keys;
mod runner;
mod stream;
#[cfg(test)]
mod testing;
mod transport;

pub use auth::{HOST_BANNER, Handshake, HandshakeState};
pub use bridge::{Bridge, Operation};
pub use config::{Config, DEFAULT_ERROR_MARKER, DEFAULT_PORT};
pub use error::{Error, Result};
pub use event::{CancelToken, Event, EventSink};
pub use keys::{
    AdbKey, KEY_BITS, KeyStore, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE, PUBLIC_KEY_STRUCT_LEN,
};
pub use runner::{
    CommandResult, GrantPlan, Outcome, Step, Tally, classify, install_package, run_plan,
    run_script, shell_quote,
};
pub use stream::{LineBuffer, StreamOutcome};
pub use transport::{
    Connection, ReadTimeoutGuard, Transport, candidate_hosts, connect, release_stale_session,
};
