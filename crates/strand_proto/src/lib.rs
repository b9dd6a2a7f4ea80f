//! Wire protocol for the strand distributed object store.
//!
//! This crate is pure codec: the fixed command header, typed bodies, the
//! streaming RPC messages and the error taxonomy. It performs no I/O; the
//! client engine and the node share it.

pub mod body;
pub mod codec;
pub mod command;
pub mod error;
pub mod key;
pub mod stream;

pub use body::{decode_body, encode_body};
pub use command::{cflags, ioflags, read_flags, CommandHeader, Opcode, Packet, Time, HEADER_SIZE};
pub use error::{ErrorCode, WireError, WireResult};
pub use key::{Id, KeyId, KEY_SIZE};
