//! Wire framing for the Android debug bridge protocol.
//!
//! Every exchange is a 24-byte little-endian header followed by an opaque
//! payload, suitable for any reliable byte stream (TCP in practice).

mod codec;
mod message;

pub use codec::{HEADER_LEN, Header, MAX_FRAME, decode, encode, to_bytes};
pub use message::{
    AUTH, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, CLSE, CNXN, MAX_PAYLOAD, Message, OKAY,
    OPEN, VERSION, WRTE, command_name,
};
