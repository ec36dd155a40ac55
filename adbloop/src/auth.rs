//! Connect and authentication handshake.
//!
//! ```text
//! Init ─CNXN→ SentConnect ─┬─ CNXN ────────────────────────────→ Connected
//!                          └─ AUTH(TOKEN) → AwaitAuth
//! AwaitAuth ─AUTH(SIGNATURE)→ SignedSent ─┬─ CNXN ──────────────→ Connected
//!                                         └─ AUTH → SendPublicKey
//! SendPublicKey ─AUTH(RSAPUBLICKEY)→ AwaitUserConfirm ─┬─ CNXN ─→ Connected
//!                                                      └─ else ─→ Failed
//! ```
//!
//! Any other message in any state fails the handshake.

use std::io;

use adbloop_proto::{
    AUTH, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, CNXN, MAX_PAYLOAD, Message, VERSION,
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::EventSink;
use crate::keys::KeyStore;
use crate::transport::{Connection, Transport};

/// Banner identifying this side as a host peer.
pub const HOST_BANNER: &str = "host::\0";

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakeState {
    /// Nothing sent yet.
    Init,
    /// `CNXN` sent, waiting for the first reply.
    SentConnect,
    /// Holding a token to sign.
    AwaitAuth,
    /// Signature sent, waiting for the verdict.
    SignedSent,
    /// The signature was not accepted; the public key must be offered.
    SendPublicKey,
    /// Public key sent, waiting for the user to approve it on the device.
    AwaitUserConfirm,
    /// Session established.
    Connected,
    /// Terminal failure.
    Failed,
}

/// Drives one connection through the handshake.
#[derive(Debug)]
pub struct Handshake<'a> {
    /// Timeouts and identity.
    config: &'a Config,
    /// Current state.
    state: HandshakeState,
    /// Token from the last `AUTH(TOKEN)`.
    token: Vec<u8>,
}

impl<'a> Handshake<'a> {
    /// Starts a handshake in [`HandshakeState::Init`].
    pub const fn new(config: &'a Config) -> Self {
        Self {
            config,
            state: HandshakeState::Init,
            token: Vec::new(),
        }
    }

    /// Current state.
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs until [`HandshakeState::Connected`] or an error.
    ///
    /// On success the connection's max payload is taken from the peer's
    /// `CNXN`. On error the state is left at [`HandshakeState::Failed`].
    pub fn run<S: Transport>(
        &mut self,
        conn: &mut Connection<S>,
        keys: &mut KeyStore,
        sink: &EventSink,
    ) -> Result<()> {
        let result = self.drive(conn, keys, sink);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    /// The state machine proper.
    fn drive<S: Transport>(
        &mut self,
        conn: &mut Connection<S>,
        keys: &mut KeyStore,
        sink: &EventSink,
    ) -> Result<()> {
        loop {
            debug!(state = ?self.state, "handshake");
            self.state = match self.state {
                HandshakeState::Init => {
                    conn.send(&Message::connect(VERSION, MAX_PAYLOAD, HOST_BANNER))?;
                    HandshakeState::SentConnect
                }
                HandshakeState::SentConnect => {
                    let reply = conn.recv()?;
                    match (reply.command, reply.arg0) {
                        (CNXN, _) => accept(conn, &reply),
                        (AUTH, AUTH_TOKEN) => {
                            self.token = reply.payload;
                            HandshakeState::AwaitAuth
                        }
                        _ => return Err(Error::unexpected("CNXN or AUTH(TOKEN)", &reply)),
                    }
                }
                HandshakeState::AwaitAuth => {
                    sink.log("Authenticating with stored key...");
                    let signature = keys.key()?.sign(&self.token)?;
                    conn.send(&Message::auth(AUTH_SIGNATURE, signature))?;
                    HandshakeState::SignedSent
                }
                HandshakeState::SignedSent => {
                    let reply = conn.recv()?;
                    match (reply.command, reply.arg0) {
                        (CNXN, _) => accept(conn, &reply),
                        (AUTH, AUTH_TOKEN) => {
                            self.token = reply.payload;
                            HandshakeState::SendPublicKey
                        }
                        _ => return Err(Error::unexpected("CNXN or AUTH(TOKEN)", &reply)),
                    }
                }
                HandshakeState::SendPublicKey => {
                    let payload = keys.key()?.public_key_payload(&self.config.identity)?;
                    conn.send(&Message::auth(AUTH_RSAPUBLICKEY, payload))?;
                    sink.log("Key not yet trusted. Tap \"Allow\" on the device to authorize debugging.");
                    HandshakeState::AwaitUserConfirm
                }
                HandshakeState::AwaitUserConfirm => {
                    let reply = {
                        let mut conn = conn.widen_read_timeout(self.config.auth_timeout)?;
                        match conn.recv() {
                            Ok(reply) => reply,
                            Err(Error::Io(e)) if is_timeout(&e) => return Err(Error::AuthTimeout),
                            Err(e) => return Err(e),
                        }
                    };
                    if reply.command != CNXN {
                        debug!(got = %reply.name(), "public key not accepted");
                        return Err(Error::AuthRejected);
                    }
                    sink.log("Debugging authorized on device.");
                    accept(conn, &reply)
                }
                HandshakeState::Connected => return Ok(()),
                HandshakeState::Failed => {
                    return Err(Error::Protocol {
                        expected: "a fresh handshake",
                        got: "a failed one".into(),
                    });
                }
            };
        }
    }
}

/// Smallest max payload any daemon version supports (protocol v1).
const MIN_PAYLOAD: u32 = 4096;

/// Adopts the peer's `CNXN` parameters.
fn accept<S: Transport>(conn: &mut Connection<S>, reply: &Message) -> HandshakeState {
    if reply.arg1 < MIN_PAYLOAD {
        warn!(advertised = reply.arg1, used = MIN_PAYLOAD, "implausible max payload");
    }
    conn.set_max_payload(reply.arg1.max(MIN_PAYLOAD));
    let banner = String::from_utf8_lossy(&reply.payload);
    info!(
        version = reply.arg0,
        max_payload = reply.arg1,
        banner = %banner.trim_end_matches('\0'),
        "handshake complete"
    );
    HandshakeState::Connected
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::ScriptedStream;

    fn cnxn(max_payload: u32) -> Message {
        Message::connect(VERSION, max_payload, "device::ro.product.name=car;\0")
    }

    fn token() -> Message {
        Message::auth(AUTH_TOKEN, vec![7u8; 20])
    }

    /// Runs a handshake against `stream`; returns the result, final state and sent frames.
    fn run(stream: ScriptedStream, keys: &mut KeyStore) -> (Result<u32>, HandshakeState, Vec<Message>) {
        let config = Config::default();
        let (sink, _rx) = EventSink::channel();
        let mut conn = Connection::new(stream);
        let mut hs = Handshake::new(&config);
        let result = hs.run(&mut conn, keys, &sink).map(|()| conn.max_payload());
        (result, hs.state(), conn.stream().sent())
    }

    fn key_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn immediate_accept_skips_authentication() {
        let (dir, mut keys) = key_store();
        let (result, state, sent) = run(ScriptedStream::new(vec![cnxn(4096)]), &mut keys);

        assert_eq!(result.unwrap(), 4096);
        assert_eq!(state, HandshakeState::Connected);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, CNXN);
        assert_eq!(sent[0].arg0, VERSION);
        assert_eq!(sent[0].arg1, MAX_PAYLOAD);
        assert_eq!(sent[0].payload, HOST_BANNER.as_bytes());
        assert!(
            !dir.path().join(crate::keys::PRIVATE_KEY_FILE).exists(),
            "key must not be generated when unused"
        );
    }

    #[test]
    fn tiny_max_payload_is_raised_to_the_minimum() {
        let (_dir, mut keys) = key_store();
        let (result, state, _) = run(ScriptedStream::new(vec![cnxn(0)]), &mut keys);
        assert_eq!(result.unwrap(), MIN_PAYLOAD);
        assert_eq!(state, HandshakeState::Connected);

        let (result, _, _) = run(ScriptedStream::new(vec![cnxn(16)]), &mut keys);
        assert_eq!(result.unwrap(), 4096);
    }

    #[test]
    fn accept_after_signature() {
        let (_dir, mut keys) = key_store();
        let (result, state, sent) = run(ScriptedStream::new(vec![token(), cnxn(8192)]), &mut keys);

        assert_eq!(result.unwrap(), 8192);
        assert_eq!(state, HandshakeState::Connected);
        assert_eq!(sent.len(), 2);
        assert_eq!((sent[1].command, sent[1].arg0), (AUTH, AUTH_SIGNATURE));
        assert_eq!(sent[1].payload, keys.key().unwrap().sign(&[7u8; 20]).unwrap());
    }

    #[test]
    fn accept_after_public_key_confirmation() {
        let (_dir, mut keys) = key_store();
        let stream = ScriptedStream::new(vec![token(), token(), cnxn(MAX_PAYLOAD)]);
        let (result, state, sent) = run(stream, &mut keys);

        assert_eq!(result.unwrap(), MAX_PAYLOAD);
        assert_eq!(state, HandshakeState::Connected);
        assert_eq!(sent.len(), 3);
        assert_eq!((sent[2].command, sent[2].arg0), (AUTH, AUTH_RSAPUBLICKEY));
        let expected = keys
            .key()
            .unwrap()
            .public_key_payload(&Config::default().identity)
            .unwrap();
        assert_eq!(sent[2].payload, expected);
    }

    #[test]
    fn rejection_after_public_key_fails() {
        let (_dir, mut keys) = key_store();
        let stream = ScriptedStream::new(vec![token(), token(), token()]);
        let (result, state, _) = run(stream, &mut keys);

        assert!(matches!(result, Err(Error::AuthRejected)));
        assert_eq!(state, HandshakeState::Failed);
    }

    #[test]
    fn no_confirmation_times_out() {
        let (_dir, mut keys) = key_store();
        let stream = ScriptedStream::new(vec![token(), token()]).stall_when_drained();
        let config = Config::default();
        let (sink, _rx) = EventSink::channel();
        let mut conn = Connection::new(stream);
        conn.stream()
            .set_read_timeout(Some(config.read_timeout))
            .unwrap();

        let mut hs = Handshake::new(&config);
        let result = hs.run(&mut conn, &mut keys, &sink);

        assert!(matches!(result, Err(Error::AuthTimeout)));
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert_eq!(
            conn.stream().read_timeout().unwrap(),
            Some(Duration::from_secs(10)),
            "steady-state timeout must be restored"
        );
    }

    #[test]
    fn unexpected_first_reply_fails() {
        let (_dir, mut keys) = key_store();
        let (result, state, _) = run(ScriptedStream::new(vec![Message::okay(1, 1)]), &mut keys);
        assert!(matches!(result, Err(Error::Protocol { .. })));
        assert_eq!(state, HandshakeState::Failed);
    }

    #[test]
    fn unexpected_reply_after_signature_fails() {
        let (_dir, mut keys) = key_store();
        let stream = ScriptedStream::new(vec![token(), Message::write(1, 1, b"x".to_vec())]);
        let (result, state, _) = run(stream, &mut keys);
        match result {
            Err(Error::Protocol { got, .. }) => assert!(got.starts_with("WRTE")),
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(state, HandshakeState::Failed);
    }

    #[test]
    fn peer_hangup_fails() {
        let (_dir, mut keys) = key_store();
        let (result, state, _) = run(ScriptedStream::new(Vec::new()), &mut keys);
        assert!(result.unwrap_err().is_disconnect());
        assert_eq!(state, HandshakeState::Failed);
    }
}
