//! Fixed-layout command header and flag sets.
//!
//! Every command travels as a 112-byte little-endian header followed by a
//! body of `size` bytes. The header layout is part of the wire contract and
//! must not change:
//!
//! ```text
//! offset  size  field
//!      0    64  key id
//!     64     4  group id
//!     68     4  status (signed)
//!     72     4  backend id
//!     76     4  trace id
//!     80     8  flags
//!     88     8  transaction id
//!     96     8  body size
//!    104     4  command opcode
//!    108     4  reserved (zero)
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{WireError, WireResult};
use crate::key::{KeyId, KEY_SIZE};

/// Command header size in bytes.
pub const HEADER_SIZE: usize = 112;

/// Upper bound on a single command body; larger payloads must go through
/// the streaming transport.
pub const MAX_BODY_SIZE: u64 = 256 * 1024 * 1024;

/// Command flag bits (`flags` header field).
pub mod cflags {
    /// Sender expects a terminal acknowledgement even on empty results.
    pub const NEED_ACK: u64 = 1 << 0;
    /// This command is a reply, not a request.
    pub const REPLY: u64 = 1 << 1;
    /// Non-terminal part of a multi-part response.
    pub const MORE: u64 = 1 << 2;
    /// Target exactly the addressed node, bypass routing.
    pub const DIRECT: u64 = 1 << 3;
    /// Target the backend named in the header, bypass backend selection.
    pub const DIRECT_BACKEND: u64 = 1 << 4;
    /// Execute without taking the per-key lock.
    pub const NOLOCK: u64 = 1 << 5;
    /// Verify/produce data checksums.
    pub const CHECKSUM: u64 = 1 << 6;
    /// Bypass the server cache.
    pub const NOCACHE: u64 = 1 << 7;
    /// Exempt this command from the server queue timeout.
    pub const NO_QUEUE_TIMEOUT: u64 = 1 << 8;
    /// Promote per-command logging to info level along the whole path.
    pub const TRACE_BIT: u64 = 1 << 31;

    /// Render set bits for log lines.
    pub fn dump(flags: u64) -> String {
        const NAMES: [(u64, &str); 10] = [
            (NEED_ACK, "need_ack"),
            (REPLY, "reply"),
            (MORE, "more"),
            (DIRECT, "direct"),
            (DIRECT_BACKEND, "direct_backend"),
            (NOLOCK, "nolock"),
            (CHECKSUM, "checksum"),
            (NOCACHE, "nocache"),
            (NO_QUEUE_TIMEOUT, "no_queue_timeout"),
            (TRACE_BIT, "trace"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        set.join("|")
    }
}

/// I/O flag bits carried in read/write/remove bodies.
pub mod ioflags {
    /// Reserve space and write the first chunk; record stays uncommitted.
    pub const PREPARE: u64 = 1 << 0;
    /// Write into a prepared, still uncommitted record.
    pub const PLAIN: u64 = 1 << 1;
    /// Final chunk; record becomes visible to lookup/read.
    pub const COMMIT: u64 = 1 << 2;
    /// Remove only when the session timestamp is not older than the record.
    pub const CAS_TIMESTAMP: u64 = 1 << 3;
    /// Rewrite only the json part of an existing record.
    pub const UPDATE_JSON: u64 = 1 << 4;
    /// Write only when the stored data checksum matches the expected one.
    pub const CAS_CHECKSUM: u64 = 1 << 5;
}

/// Read selector bits (`read_flags` in read bodies).
pub mod read_flags {
    pub const JSON: u64 = 1 << 0;
    pub const DATA: u64 = 1 << 1;
}

/// Wall-clock timestamp with nanosecond precision.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Time {
            sec: d.as_secs(),
            nsec: u64::from(d.subsec_nanos()),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

macro_rules! opcodes {
    ($(($variant:ident, $value:expr, $name:expr),)*) => {
        /// Command opcode.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u32)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        impl Opcode {
            pub fn from_u32(v: u32) -> Option<Self> {
                match v {
                    $($value => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            /// Stable name used in logs and stats.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }
    };
}

opcodes! {
    (Lookup, 1, "lookup"),
    (Read, 2, "read"),
    (Write, 3, "write"),
    (Remove, 4, "remove"),
    (BulkRead, 5, "bulk_read"),
    (BulkWrite, 6, "bulk_write"),
    (BulkRemove, 7, "bulk_remove"),
    (ReadRange, 8, "read_range"),
    (RemoveRange, 9, "remove_range"),
    (Iterator, 10, "iterator"),
    (Stat, 11, "stat"),
    (Status, 12, "status"),
    (BackendControl, 13, "backend_control"),
    (RouteList, 14, "route_list"),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-layout command header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    pub key: KeyId,
    pub group: u32,
    pub status: i32,
    pub backend: u32,
    pub trace: u32,
    pub flags: u64,
    pub trans: u64,
    pub size: u64,
    pub opcode: Opcode,
}

impl CommandHeader {
    pub fn new(opcode: Opcode, key: KeyId, group: u32) -> Self {
        Self {
            key,
            group,
            status: 0,
            backend: 0,
            trace: 0,
            flags: 0,
            trans: 0,
            size: 0,
            opcode,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags & cflags::REPLY != 0
    }

    /// Non-terminal part of a multi-part response.
    pub fn has_more(&self) -> bool {
        self.flags & cflags::MORE != 0
    }

    pub fn is_trace(&self) -> bool {
        self.flags & cflags::TRACE_BIT != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_slice(self.key.as_bytes());
        buf.put_u32_le(self.group);
        buf.put_i32_le(self.status);
        buf.put_u32_le(self.backend);
        buf.put_u32_le(self.trace);
        buf.put_u64_le(self.flags);
        buf.put_u64_le(self.trans);
        buf.put_u64_le(self.size);
        buf.put_u32_le(self.opcode as u32);
        buf.put_u32_le(0);
    }

    pub fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::TruncatedHeader(buf.remaining()));
        }
        let mut key = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut key);
        let group = buf.get_u32_le();
        let status = buf.get_i32_le();
        let backend = buf.get_u32_le();
        let trace = buf.get_u32_le();
        let flags = buf.get_u64_le();
        let trans = buf.get_u64_le();
        let size = buf.get_u64_le();
        let opcode_raw = buf.get_u32_le();
        let reserved = buf.get_u32_le();
        if reserved != 0 {
            return Err(WireError::DirtyReserved);
        }
        if size > MAX_BODY_SIZE {
            return Err(WireError::OversizedBody {
                got: size,
                limit: MAX_BODY_SIZE,
            });
        }
        let opcode = Opcode::from_u32(opcode_raw).ok_or(WireError::UnknownOpcode(opcode_raw))?;
        Ok(Self {
            key: KeyId(key),
            group,
            status,
            backend,
            trace,
            flags,
            trans,
            size,
            opcode,
        })
    }
}

impl Serialize for CommandHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        serializer.serialize_bytes(&buf)
    }
}

impl<'de> Deserialize<'de> for CommandHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderVisitor;

        impl<'de> Visitor<'de> for HeaderVisitor {
            type Value = CommandHeader;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{HEADER_SIZE} command header bytes")
            }

            fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<CommandHeader, E> {
                let mut buf = v;
                CommandHeader::decode(&mut buf).map_err(E::custom)
            }
        }

        deserializer.deserialize_bytes(HeaderVisitor)
    }
}

/// One framed command: header plus opaque body bytes.
#[derive(Clone, Debug)]
pub struct Packet {
    pub header: CommandHeader,
    pub body: Bytes,
}

impl Packet {
    pub fn new(header: CommandHeader, body: Bytes) -> Self {
        Self { header, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> CommandHeader {
        let mut h = CommandHeader::new(Opcode::Write, KeyId::from_name(b"", b"k"), 7);
        h.status = -2;
        h.backend = 3;
        h.trace = 0xdead_beef;
        h.flags = cflags::NEED_ACK | cflags::TRACE_BIT;
        h.trans = 42;
        h.size = 1024;
        h
    }

    #[test]
    fn header_round_trip() {
        let h = sample_header();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = CommandHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn header_layout_is_fixed() {
        let h = sample_header();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);

        // Spot-check a few offsets against the documented layout.
        assert_eq!(&buf[..64], h.key.as_bytes());
        assert_eq!(buf[64..68], 7u32.to_le_bytes());
        assert_eq!(buf[68..72], (-2i32).to_le_bytes());
        assert_eq!(buf[88..96], 42u64.to_le_bytes());
        assert_eq!(buf[104..108], (Opcode::Write as u32).to_le_bytes());
        assert_eq!(buf[108..112], [0u8; 4]);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let h = sample_header();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        buf.truncate(HEADER_SIZE - 1);
        assert!(matches!(
            CommandHeader::decode(&mut buf.freeze()),
            Err(WireError::TruncatedHeader(_))
        ));
    }

    #[test]
    fn dirty_reserved_is_rejected() {
        let h = sample_header();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        buf[108] = 1;
        assert!(matches!(
            CommandHeader::decode(&mut buf.freeze()),
            Err(WireError::DirtyReserved)
        ));
    }

    #[test]
    fn flag_dump_names_set_bits() {
        let dump = cflags::dump(cflags::REPLY | cflags::MORE);
        assert_eq!(dump, "reply|more");
    }
}
