//! Command codes and the in-memory message type.

/// Connect: opens a session and advertises version and max payload.
pub const CNXN: u32 = 0x4e58_4e43;
/// Authenticate: token challenge, signature, or public key.
pub const AUTH: u32 = 0x4854_5541;
/// Open a logical stream to a service (`shell:...`).
pub const OPEN: u32 = 0x4e45_504f;
/// Acknowledge: stream accepted, or write received.
pub const OKAY: u32 = 0x5941_4b4f;
/// Write a chunk of stream data.
pub const WRTE: u32 = 0x4554_5257;
/// Close a logical stream.
pub const CLSE: u32 = 0x4553_4c43;

/// `AUTH` arg0: the peer sends a random token to sign.
pub const AUTH_TOKEN: u32 = 1;
/// `AUTH` arg0: the client answers with a signature over the token.
pub const AUTH_SIGNATURE: u32 = 2;
/// `AUTH` arg0: the client offers its public key for on-device approval.
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Protocol version advertised in `CNXN`.
pub const VERSION: u32 = 0x0100_0000;

/// Maximum payload size this client advertises in `CNXN`.
pub const MAX_PAYLOAD: u32 = 256 * 1024;

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command code (`CNXN`, `AUTH`, ...).
    pub command: u32,
    /// First argument; meaning depends on the command.
    pub arg0: u32,
    /// Second argument; meaning depends on the command.
    pub arg1: u32,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message from its parts.
    pub fn new(command: u32, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// `CNXN(version, max_payload, banner)`.
    pub fn connect(version: u32, max_payload: u32, banner: &str) -> Self {
        Self::new(CNXN, version, max_payload, banner.as_bytes())
    }

    /// `AUTH(kind, 0, payload)`.
    pub fn auth(kind: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(AUTH, kind, 0, payload)
    }

    /// `OPEN(local_id, 0, "destination\0")`.
    pub fn open(local_id: u32, destination: &str) -> Self {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        Self::new(OPEN, local_id, 0, payload)
    }

    /// `OKAY(local_id, remote_id)`.
    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(OKAY, local_id, remote_id, Vec::new())
    }

    /// `WRTE(local_id, remote_id, data)`.
    pub fn write(local_id: u32, remote_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::new(WRTE, local_id, remote_id, data)
    }

    /// `CLSE(local_id, remote_id)`.
    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(CLSE, local_id, remote_id, Vec::new())
    }

    /// Four-letter name of this message's command, for logs.
    pub fn name(&self) -> String {
        command_name(self.command)
    }
}

/// Renders a command code as its ASCII tag, or hex when it is not printable.
pub fn command_name(command: u32) -> String {
    let bytes = command.to_le_bytes();
    if bytes.iter().all(u8::is_ascii_uppercase) {
        bytes.iter().map(|&b| char::from(b)).collect()
    } else {
        format!("{command:#010x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_spell_their_names() {
        assert_eq!(command_name(CNXN), "CNXN");
        assert_eq!(command_name(AUTH), "AUTH");
        assert_eq!(command_name(OPEN), "OPEN");
        assert_eq!(command_name(OKAY), "OKAY");
        assert_eq!(command_name(WRTE), "WRTE");
        assert_eq!(command_name(CLSE), "CLSE");
    }

    #[test]
    fn unknown_command_renders_as_hex() {
        assert_eq!(command_name(0x0000_0001), "0x00000001");
    }

    #[test]
    fn open_payload_is_nul_terminated() {
        let msg = Message::open(7, "shell:id");
        assert_eq!(msg.arg0, 7);
        assert_eq!(msg.arg1, 0);
        assert_eq!(msg.payload, b"shell:id\0");
    }
}
