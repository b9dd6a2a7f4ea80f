//! Typed command bodies.
//!
//! Bodies ride behind the fixed command header as bincode payloads. Every
//! request that can outlive the client's patience carries an optional
//! `deadline` so forwarding nodes can tighten it.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::Time;
use crate::error::WireResult;
use crate::key::{Id, KeyId};

/// Serialize a body into wire bytes.
pub fn encode_body<T: Serialize>(body: &T) -> WireResult<Bytes> {
    Ok(Bytes::from(bincode::serialize(body)?))
}

/// Deserialize a body from wire bytes.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> WireResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Read request: which parts to return and the data window.
///
/// `data_size == 0` means everything after `data_offset`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadRequest {
    pub ioflags: u64,
    pub read_flags: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub deadline: Option<Time>,
}

/// Read reply carrying the requested record parts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadResponse {
    pub record_flags: u64,
    pub user_flags: u64,
    pub json_timestamp: Time,
    pub json_size: u64,
    pub json_capacity: u64,
    pub read_json_size: u64,
    pub data_timestamp: Time,
    pub data_size: u64,
    pub read_data_offset: u64,
    pub read_data_size: u64,
    pub json: Vec<u8>,
    pub data: Vec<u8>,
}

/// Write request covering plain writes and the prepare/plain/commit family,
/// selected by `ioflags`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    pub ioflags: u64,
    pub user_flags: u64,
    pub json_timestamp: Time,
    pub json_capacity: u64,
    pub json: Vec<u8>,
    pub data_timestamp: Time,
    pub data_offset: u64,
    pub data_capacity: u64,
    /// Total record size the commit finalizes; only read with `COMMIT`.
    pub data_commit_size: u64,
    pub data: Vec<u8>,
    pub cache_lifetime: u64,
    /// Stored-data checksum the server must observe for `CAS_CHECKSUM`.
    pub expected_data_checksum: Option<u32>,
    pub deadline: Option<Time>,
}

/// Lookup (and write acknowledgement) reply: record metadata only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LookupResponse {
    pub record_flags: u64,
    pub user_flags: u64,
    pub path: String,
    pub json_timestamp: Time,
    pub json_offset: u64,
    pub json_size: u64,
    pub json_capacity: u64,
    pub json_checksum: Vec<u8>,
    pub data_timestamp: Time,
    pub data_offset: u64,
    pub data_size: u64,
    pub data_checksum: Vec<u8>,
}

/// Record flag bits surfaced in lookup/read replies.
pub mod record_flags {
    /// Record was prepared but not yet committed.
    pub const UNCOMMITTED: u64 = 1 << 0;
    /// Record carries data checksums.
    pub const CHECKSUMMED: u64 = 1 << 1;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub ioflags: u64,
    /// Session timestamp used by `CAS_TIMESTAMP` removal.
    pub timestamp: Time,
    pub deadline: Option<Time>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkReadRequest {
    /// Keys owned by the addressed node, sorted ascending.
    pub keys: Vec<Id>,
    pub read_flags: u64,
    pub deadline: Option<Time>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkRemoveRequest {
    /// Keys owned by the addressed node, sorted ascending.
    pub keys: Vec<Id>,
    pub ioflags: u64,
    pub timestamp: Time,
    pub deadline: Option<Time>,
}

/// Key interval `[begin, end)` for range reads/removes and iterators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: KeyId,
    pub end: KeyId,
}

impl KeyRange {
    pub fn contains(&self, key: &KeyId) -> bool {
        *key >= self.begin && *key < self.end
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RangeRequest {
    pub range: KeyRange,
    pub read_flags: u64,
    /// Zero means unbounded.
    pub limit: u64,
    pub deadline: Option<Time>,
}

/// Iterator control request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IteratorRequest {
    Start {
        flags: u64,
        key_ranges: Vec<KeyRange>,
        time_range: (Time, Time),
    },
    Pause {
        iterator_id: u64,
    },
    Continue {
        iterator_id: u64,
    },
    Cancel {
        iterator_id: u64,
    },
}

/// Iterator flag bits.
pub mod iterator_flags {
    /// Stream record json along with metadata.
    pub const JSON: u64 = 1 << 0;
    /// Stream record data along with metadata.
    pub const DATA: u64 = 1 << 1;
    /// Restrict to the supplied key ranges.
    pub const KEY_RANGE: u64 = 1 << 2;
    /// Restrict to the supplied time range.
    pub const TIME_RANGE: u64 = 1 << 3;
}

/// One streamed iterator entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IteratorResponse {
    pub iterator_id: u64,
    pub status: i32,
    pub iterated_keys: u64,
    pub total_keys: u64,
    pub key: KeyId,
    pub record_flags: u64,
    pub user_flags: u64,
    pub json_timestamp: Time,
    pub json_size: u64,
    pub data_timestamp: Time,
    pub data_size: u64,
    pub json: Vec<u8>,
    pub data: Vec<u8>,
}

/// Stat categories requested from a node.
pub mod stat_categories {
    pub const BACKENDS: u64 = 1 << 0;
    pub const IO_QUEUES: u64 = 1 << 1;
    pub const COMMANDS: u64 = 1 << 2;
    pub const ALL: u64 = BACKENDS | IO_QUEUES | COMMANDS;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatRequest {
    pub categories: u64,
}

/// Stat reply: one JSON document describing the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatResponse {
    pub payload: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusRequest {
    /// New status bits, or `None` to only read the current value.
    pub status: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: u64,
}

/// Backend control verbs used by administrative sessions and tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BackendControlRequest {
    /// Make the backend sleep before serving each request.
    SetDelay { backend_id: u32, delay_ms: u64 },
    Enable { backend_id: u32 },
    Disable { backend_id: u32 },
}

/// One routing table entry advertised by a node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RouteEntry {
    pub group: u32,
    pub backend_id: u32,
    /// First key id served by this backend within the group ring.
    pub id_begin: KeyId,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteListResponse {
    pub entries: Vec<RouteEntry>,
}
