//! Result entries: one observable reply unit per transaction reply.

use std::net::SocketAddr;
use std::ops::Deref;

use bytes::Bytes;
use strand_proto::body::{IteratorResponse, LookupResponse, ReadResponse, StatResponse};
use strand_proto::{decode_body, CommandHeader, ErrorCode};

use crate::error::Error;

/// One reply unit: source address, parsed header, body bytes and an optional
/// error descriptor. Entries with a set `error` are invalid for typed access
/// but still flow through filters and subscribers.
#[derive(Clone, Debug)]
pub struct ResultEntry {
    pub addr: Option<SocketAddr>,
    pub cmd: CommandHeader,
    pub data: Bytes,
    pub error: Option<Error>,
}

impl ResultEntry {
    pub fn status(&self) -> i32 {
        self.cmd.status
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// Terminal acknowledgement without payload.
    pub fn is_ack(&self) -> bool {
        !self.cmd.has_more() && self.data.is_empty()
    }

    /// Last reply of its transaction.
    pub fn is_final(&self) -> bool {
        !self.cmd.has_more()
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn decoded<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        if self.error.is_some() || self.data.is_empty() {
            return None;
        }
        decode_body(&self.data).ok()
    }
}

macro_rules! typed_entry {
    ($(#[$doc:meta])* $name:ident, $body:ty, $accessor:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug)]
        pub struct $name {
            entry: ResultEntry,
            body: Option<$body>,
        }

        impl $name {
            /// Decoded body, absent on error or ack entries.
            pub fn $accessor(&self) -> Option<&$body> {
                self.body.as_ref()
            }

            pub fn into_raw(self) -> ResultEntry {
                self.entry
            }
        }

        impl From<ResultEntry> for $name {
            fn from(entry: ResultEntry) -> Self {
                let body = entry.decoded();
                Self { entry, body }
            }
        }

        impl Deref for $name {
            type Target = ResultEntry;

            fn deref(&self) -> &ResultEntry {
                &self.entry
            }
        }
    };
}

typed_entry!(
    /// Lookup (and write-ack) entry exposing record metadata.
    LookupEntry,
    LookupResponse,
    record_info
);

typed_entry!(
    /// Read entry carrying the requested record parts.
    ReadEntry,
    ReadResponse,
    io_info
);

typed_entry!(
    /// One streamed iterator entry.
    IteratorEntry,
    IteratorResponse,
    iterator_info
);

typed_entry!(
    /// Node statistics entry.
    StatEntry,
    StatResponse,
    stat_info
);

/// Write acknowledgements are lookup-shaped.
pub type WriteEntry = LookupEntry;

/// Remove acknowledgements carry no body.
pub type RemoveEntry = ResultEntry;

impl ReadEntry {
    /// Record json part, empty when not requested or on error.
    pub fn json(&self) -> &[u8] {
        self.io_info().map(|r| r.json.as_slice()).unwrap_or(&[])
    }

    /// Record data part, empty when not requested or on error.
    pub fn payload(&self) -> &[u8] {
        self.io_info().map(|r| r.data.as_slice()).unwrap_or(&[])
    }
}

impl StatEntry {
    /// Stat payload parsed as JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        self.stat_info()
            .and_then(|s| serde_json::from_str(&s.payload).ok())
    }
}

/// Build a locally synthesized error entry that never touched the wire.
pub fn synthetic_entry(
    mut cmd: CommandHeader,
    addr: Option<SocketAddr>,
    code: ErrorCode,
    message: impl Into<String>,
) -> ResultEntry {
    cmd.status = code.status();
    cmd.flags |= strand_proto::cflags::REPLY;
    cmd.size = 0;
    ResultEntry {
        addr,
        cmd,
        data: Bytes::new(),
        error: Some(Error::new(code, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_proto::{cflags, encode_body, KeyId, Opcode};

    fn header(status: i32, flags: u64) -> CommandHeader {
        let mut h = CommandHeader::new(Opcode::Lookup, KeyId::from_name(b"", b"k"), 1);
        h.status = status;
        h.flags = flags;
        h
    }

    #[test]
    fn ack_and_final_classification() {
        let ack = ResultEntry {
            addr: None,
            cmd: header(0, cflags::REPLY),
            data: Bytes::new(),
            error: None,
        };
        assert!(ack.is_ack());
        assert!(ack.is_final());

        let partial = ResultEntry {
            addr: None,
            cmd: header(0, cflags::REPLY | cflags::MORE),
            data: Bytes::from_static(b"x"),
            error: None,
        };
        assert!(!partial.is_ack());
        assert!(!partial.is_final());
    }

    #[test]
    fn typed_entry_decodes_body() {
        let info = LookupResponse {
            data_size: 4,
            json_size: 7,
            path: "/dev/null".into(),
            ..Default::default()
        };
        let entry = ResultEntry {
            addr: None,
            cmd: header(0, cflags::REPLY),
            data: encode_body(&info).unwrap(),
            error: None,
        };
        let typed = LookupEntry::from(entry);
        let got = typed.record_info().expect("decoded record info");
        assert_eq!(got.data_size, 4);
        assert_eq!(got.path, "/dev/null");
    }

    #[test]
    fn error_entry_has_no_typed_body() {
        let entry = synthetic_entry(
            header(0, 0),
            None,
            ErrorCode::NoRoute,
            "no route for key",
        );
        assert_eq!(entry.status(), ErrorCode::NoRoute.status());
        assert!(!entry.is_valid());
        let typed = LookupEntry::from(entry);
        assert!(typed.record_info().is_none());
    }
}
