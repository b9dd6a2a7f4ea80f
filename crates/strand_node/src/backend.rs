//! In-memory record backend.
//!
//! A record stores two independent parts, json and data, each with its own
//! timestamp, size and reserved capacity. Records written through the
//! prepare/plain/commit family stay uncommitted and invisible to lookup and
//! read until the commit lands.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use strand_client::Error;
use strand_proto::body::{
    record_flags, KeyRange, LookupResponse, ReadRequest, ReadResponse, RemoveRequest, WriteRequest,
};
use strand_proto::{ioflags, read_flags, ErrorCode, KeyId, Time};

type OpResult<T> = Result<T, Error>;

#[derive(Clone, Debug, Default)]
pub struct Record {
    pub json: Vec<u8>,
    pub json_timestamp: Time,
    pub json_capacity: u64,
    pub data: Vec<u8>,
    pub data_timestamp: Time,
    pub data_capacity: u64,
    pub user_flags: u64,
    pub record_flags: u64,
    pub cache_lifetime: u64,
}

impl Record {
    fn uncommitted(&self) -> bool {
        self.record_flags & record_flags::UNCOMMITTED != 0
    }

    fn lookup_response(&self) -> LookupResponse {
        LookupResponse {
            record_flags: self.record_flags,
            user_flags: self.user_flags,
            path: String::new(),
            json_timestamp: self.json_timestamp,
            json_offset: 0,
            json_size: self.json.len() as u64,
            json_capacity: self.json_capacity,
            json_checksum: crc32fast::hash(&self.json).to_le_bytes().to_vec(),
            data_timestamp: self.data_timestamp,
            data_offset: 0,
            data_size: self.data.len() as u64,
            data_checksum: crc32fast::hash(&self.data).to_le_bytes().to_vec(),
        }
    }
}

pub struct Backend {
    pub backend_id: u32,
    pub group: u32,
    pub queue_timeout: Duration,
    enabled: AtomicBool,
    delay_ms: AtomicU64,
    /// Store sharded by leading key byte to spread lock pressure.
    shards: Vec<Mutex<BTreeMap<KeyId, Record>>>,
}

impl Backend {
    pub fn new(backend_id: u32, group: u32, queue_timeout: Duration, shards: usize) -> Self {
        Self {
            backend_id,
            group,
            queue_timeout,
            enabled: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(BTreeMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &KeyId) -> &Mutex<BTreeMap<KeyId, Record>> {
        &self.shards[key.0[0] as usize % self.shards.len()]
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Artificial per-request service delay; the test hook behind the
    /// backend-control RPC.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_delay(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn record_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn lookup(&self, key: &KeyId) -> OpResult<LookupResponse> {
        let shard = self.shard(key).lock().unwrap();
        match shard.get(key) {
            Some(record) if !record.uncommitted() => Ok(record.lookup_response()),
            _ => Err(not_found(key)),
        }
    }

    pub fn read(&self, key: &KeyId, request: &ReadRequest) -> OpResult<ReadResponse> {
        let shard = self.shard(key).lock().unwrap();
        let record = match shard.get(key) {
            Some(record) if !record.uncommitted() => record,
            _ => return Err(not_found(key)),
        };

        let mut response = ReadResponse {
            record_flags: record.record_flags,
            user_flags: record.user_flags,
            json_timestamp: record.json_timestamp,
            json_size: record.json.len() as u64,
            json_capacity: record.json_capacity,
            data_timestamp: record.data_timestamp,
            data_size: record.data.len() as u64,
            ..Default::default()
        };

        if request.read_flags & read_flags::JSON != 0 {
            response.json = record.json.clone();
            response.read_json_size = response.json.len() as u64;
        }
        if request.read_flags & read_flags::DATA != 0 {
            let offset = request.data_offset.min(record.data.len() as u64) as usize;
            let available = record.data.len() - offset;
            let len = if request.data_size == 0 {
                available
            } else {
                available.min(request.data_size as usize)
            };
            response.data = record.data[offset..offset + len].to_vec();
            response.read_data_offset = offset as u64;
            response.read_data_size = len as u64;
        }
        Ok(response)
    }

    pub fn write(&self, key: &KeyId, request: &WriteRequest) -> OpResult<LookupResponse> {
        let mut shard = self.shard(key).lock().unwrap();

        if request.ioflags & ioflags::UPDATE_JSON != 0 {
            let record = shard.get_mut(key).ok_or_else(|| not_found(key))?;
            if record.json_capacity > 0 && request.json.len() as u64 > record.json_capacity {
                return Err(Error::new(
                    ErrorCode::TooBig,
                    format!(
                        "json of {} bytes exceeds capacity {}",
                        request.json.len(),
                        record.json_capacity
                    ),
                ));
            }
            record.json = request.json.clone();
            record.json_timestamp = request.json_timestamp;
            return Ok(record.lookup_response());
        }

        if request.ioflags & ioflags::CAS_CHECKSUM != 0 {
            let record = shard.get(key).ok_or_else(|| not_found(key))?;
            let current = crc32fast::hash(&record.data);
            if request.expected_data_checksum != Some(current) {
                return Err(Error::new(
                    ErrorCode::BadChecksum,
                    format!("cas mismatch: stored checksum {current:#010x}"),
                ));
            }
        }

        let prepare = request.ioflags & ioflags::PREPARE != 0;
        let plain = request.ioflags & ioflags::PLAIN != 0;
        let commit = request.ioflags & ioflags::COMMIT != 0;

        if prepare {
            let mut record = Record {
                json_capacity: request.json_capacity,
                data_capacity: request.data_capacity,
                record_flags: record_flags::UNCOMMITTED,
                ..Record::default()
            };
            write_parts(&mut record, request)?;
            let response = record.lookup_response();
            shard.insert(*key, record);
            return Ok(response);
        }

        if plain || commit {
            let record = shard.get_mut(key).ok_or_else(|| not_found(key))?;
            if !record.uncommitted() {
                return Err(Error::new(
                    ErrorCode::Protocol,
                    format!("record {key} is not prepared"),
                ));
            }
            write_parts(record, request)?;
            if commit {
                let commit_size = request.data_commit_size as usize;
                record.data.resize(commit_size, 0);
                record.record_flags &= !record_flags::UNCOMMITTED;
            }
            return Ok(record.lookup_response());
        }

        // Plain overwrite; a non-zero offset patches the existing record.
        let record = shard.entry(*key).or_default();
        if request.data_offset == 0 {
            record.data.clear();
        }
        record.json_capacity = record.json_capacity.max(request.json_capacity);
        record.data_capacity = record.data_capacity.max(request.data_capacity);
        record.record_flags &= !record_flags::UNCOMMITTED;
        write_parts(record, request)?;
        if request.data_offset == 0 || !request.json.is_empty() {
            record.json = request.json.clone();
            record.json_timestamp = request.json_timestamp;
        }
        Ok(record.lookup_response())
    }

    pub fn remove(&self, key: &KeyId, request: &RemoveRequest) -> OpResult<()> {
        let mut shard = self.shard(key).lock().unwrap();
        let record = shard.get(key).ok_or_else(|| not_found(key))?;
        if request.ioflags & ioflags::CAS_TIMESTAMP != 0
            && !record.uncommitted()
            && request.timestamp < record.data_timestamp
        {
            return Err(Error::new(
                ErrorCode::BadChecksum,
                "record is newer than the removal timestamp",
            ));
        }
        shard.remove(key);
        Ok(())
    }

    /// Committed keys within `range`, ascending, capped by `limit` when
    /// non-zero.
    pub fn keys_in_range(&self, range: &KeyRange, limit: u64) -> Vec<KeyId> {
        if range.begin >= range.end {
            return Vec::new();
        }
        let mut keys: Vec<KeyId> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap()
                    .range(range.begin..range.end)
                    .filter(|(_, record)| !record.uncommitted())
                    .map(|(key, _)| *key)
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort_unstable();
        if limit > 0 {
            keys.truncate(limit as usize);
        }
        keys
    }

    /// Snapshot of committed records for iteration, optionally filtered.
    pub fn snapshot(
        &self,
        key_ranges: &[KeyRange],
        time_range: Option<(Time, Time)>,
    ) -> Vec<(KeyId, Record)> {
        let mut records: Vec<(KeyId, Record)> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, r)| !r.uncommitted())
                    .map(|(k, r)| (*k, r.clone()))
                    .collect::<Vec<_>>()
            })
            .filter(|(key, record)| {
                let key_ok =
                    key_ranges.is_empty() || key_ranges.iter().any(|range| range.contains(key));
                let time_ok = time_range
                    .map(|(begin, end)| record.data_timestamp >= begin && record.data_timestamp < end)
                    .unwrap_or(true);
                key_ok && time_ok
            })
            .collect();
        records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        records
    }

    pub fn get(&self, key: &KeyId) -> Option<Record> {
        self.shard(key).lock().unwrap().get(key).cloned()
    }
}

fn not_found(key: &KeyId) -> Error {
    Error::new(ErrorCode::NotFound, format!("key {key} not found"))
}

/// Append json and data parts honoring declared capacities.
fn write_parts(record: &mut Record, request: &WriteRequest) -> OpResult<()> {
    if request.json_capacity > 0 && request.json.len() as u64 > request.json_capacity {
        return Err(Error::new(ErrorCode::TooBig, "json exceeds declared capacity"));
    }
    if !request.json.is_empty() {
        record.json = request.json.clone();
        record.json_timestamp = request.json_timestamp;
    }

    let end = request.data_offset as usize + request.data.len();
    if record.data_capacity > 0 && end as u64 > record.data_capacity {
        return Err(Error::new(ErrorCode::TooBig, "data exceeds reserved capacity"));
    }
    if record.data.len() < end {
        record.data.resize(end, 0);
    }
    record.data[request.data_offset as usize..end].copy_from_slice(&request.data);
    if !request.data.is_empty() || request.data_offset == 0 {
        record.data_timestamp = request.data_timestamp;
    }
    record.user_flags = request.user_flags;
    if request.cache_lifetime != 0 {
        record.cache_lifetime = request.cache_lifetime;
    }
    Ok(())
}
