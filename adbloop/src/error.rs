//! Error types for adbloop operations.

use std::net::SocketAddr;

/// Alias for `Result<T, adbloop::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by connection, authentication and stream operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No candidate host accepted a connection on the debug port.
    #[error("no debug daemon reachable on port {port} (tried {})", fmt_addrs(.tried))]
    NoConnection {
        /// The debug port that was tried.
        port: u16,
        /// Every address that was attempted, in order.
        tried: Vec<SocketAddr>,
    },

    /// The peer sent a message that is not valid in the current state.
    #[error("protocol error: expected {expected}, got {got}")]
    Protocol {
        /// What the current state allows.
        expected: &'static str,
        /// What actually arrived.
        got: String,
    },

    /// The peer refused the offered public key.
    #[error("authentication rejected by device")]
    AuthRejected,

    /// Nobody approved the public key on the device in time.
    #[error("timed out waiting for on-device authorization")]
    AuthTimeout,

    /// The peer closed a stream instead of accepting it.
    #[error("device refused to open stream for `{command}`")]
    StreamRejected {
        /// The shell command that was refused.
        command: String,
    },

    /// An outgoing payload exceeds the negotiated maximum.
    #[error("payload of {len} bytes exceeds negotiated maximum of {max} bytes")]
    PayloadTooLarge {
        /// Payload size in bytes.
        len: usize,
        /// Negotiated maximum payload size.
        max: u32,
    },

    /// RSA key generation or signing failed.
    #[error("rsa: {0}")]
    Key(#[from] rsa::Error),

    /// A persisted key could not be encoded or decoded.
    #[error("key encoding: {0}")]
    KeyEncoding(String),

    /// The configuration cannot drive the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// An I/O error from the socket or the key store.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns user-facing instructions for failures the user can fix.
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::NoConnection { .. } => Some(
                "Enable USB or wireless debugging in Developer options and expose the \
                 debug daemon on TCP (for example `adb tcpip 5555` from a computer), then retry.",
            ),
            Self::AuthRejected | Self::AuthTimeout => Some(
                "Check the device screen for the \"Allow debugging?\" prompt and accept it. \
                 If no prompt appears, revoke debugging authorizations in Developer options and retry.",
            ),
            _ => None,
        }
    }

    /// Whether this error means the socket is gone and nothing else can be sent.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// Builds a [`Error::Protocol`] from an unexpected message.
    pub(crate) fn unexpected(expected: &'static str, got: &adbloop_proto::Message) -> Self {
        Self::Protocol {
            expected,
            got: format!("{}({:#x}, {:#x})", got.name(), got.arg0, got.arg1),
        }
    }
}

/// Joins addresses for display.
fn fmt_addrs(addrs: &[SocketAddr]) -> String {
    if addrs.is_empty() {
        return "no addresses".to_owned();
    }
    addrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
