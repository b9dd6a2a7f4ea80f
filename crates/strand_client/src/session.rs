//! Session: policy container and entry point for all user-visible
//! operations.
//!
//! A session is cheap to clone; clones carry independent policy over the
//! same shared transport. Every operation returns a typed async result that
//! streams entries as replicas answer and completes once, according to the
//! session's filter/checker policy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use strand_proto::body::{
    stat_categories, BackendControlRequest, IteratorRequest, KeyRange, RangeRequest, ReadRequest,
    RemoveRequest, StatRequest, StatusRequest, WriteRequest,
};
use strand_proto::{
    cflags, encode_body, ioflags, read_flags, CommandHeader, ErrorCode, Id, KeyId, Opcode, Time,
};

use crate::async_result::{AsyncResult, TypedResult};
use crate::bulk;
use crate::cluster::Cluster;
use crate::dispatch::{Control, Dispatcher};
use crate::entry::{
    IteratorEntry, LookupEntry, ReadEntry, RemoveEntry, ResultEntry, StatEntry, WriteEntry,
};
use crate::error::Error;
use crate::policy::{Checker, ExceptionSet, Filter, Policy};

pub type AsyncLookupResult = TypedResult<LookupEntry>;
pub type AsyncReadResult = TypedResult<ReadEntry>;
pub type AsyncWriteResult = TypedResult<WriteEntry>;
pub type AsyncRemoveResult = TypedResult<RemoveEntry>;
pub type AsyncIteratorResult = TypedResult<IteratorEntry>;
pub type AsyncStatResult = TypedResult<StatEntry>;

/// A key argument: a name to transform, a raw id, or an id pinned to one
/// group.
#[derive(Clone, Debug)]
pub enum Key {
    Name(String),
    Id(KeyId),
    Routed(Id),
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<KeyId> for Key {
    fn from(id: KeyId) -> Self {
        Key::Id(id)
    }
}

impl From<Id> for Key {
    fn from(id: Id) -> Self {
        Key::Routed(id)
    }
}

#[derive(Clone)]
pub struct Session {
    cluster: Arc<Cluster>,
    groups: Vec<u32>,
    namespace: Vec<u8>,
    cflags: u64,
    ioflags: u64,
    user_flags: u64,
    timeout: Duration,
    timestamp: Time,
    json_timestamp: Time,
    cache_lifetime: u64,
    trace_id: u32,
    filter: Filter,
    checker: Checker,
    exceptions: ExceptionSet,
    forward: Option<SocketAddr>,
    direct: Option<SocketAddr>,
    chunk_size: u64,
}

impl Session {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            groups: Vec::new(),
            namespace: Vec::new(),
            cflags: 0,
            ioflags: 0,
            user_flags: 0,
            timeout: Duration::from_secs(5),
            timestamp: Time::ZERO,
            json_timestamp: Time::ZERO,
            cache_lifetime: 0,
            trace_id: 0,
            filter: Filter::default(),
            checker: Checker::default(),
            exceptions: ExceptionSet::default(),
            forward: None,
            direct: None,
            chunk_size: 0,
        }
    }

    /// Same policy, transient per-call overrides cleared.
    pub fn clean_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.direct = None;
        clone.forward = None;
        clone
    }

    // --- policy accessors -------------------------------------------------

    pub fn set_groups(&mut self, groups: Vec<u32>) -> &mut Self {
        self.groups = groups;
        self
    }

    pub fn groups(&self) -> &[u32] {
        &self.groups
    }

    pub fn set_namespace(&mut self, namespace: impl Into<Vec<u8>>) -> &mut Self {
        self.namespace = namespace.into();
        self
    }

    pub fn set_cflags(&mut self, cflags: u64) -> &mut Self {
        self.cflags = cflags;
        self
    }

    pub fn cflags(&self) -> u64 {
        self.cflags
    }

    pub fn set_ioflags(&mut self, ioflags: u64) -> &mut Self {
        self.ioflags = ioflags;
        self
    }

    pub fn set_user_flags(&mut self, user_flags: u64) -> &mut Self {
        self.user_flags = user_flags;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timestamp(&mut self, ts: Time) -> &mut Self {
        self.timestamp = ts;
        self
    }

    pub fn reset_timestamp(&mut self) -> &mut Self {
        self.timestamp = Time::ZERO;
        self
    }

    /// Json timestamp override; zero means "use the data timestamp".
    pub fn set_json_timestamp(&mut self, ts: Time) -> &mut Self {
        self.json_timestamp = ts;
        self
    }

    pub fn set_cache_lifetime(&mut self, lifetime_s: u64) -> &mut Self {
        self.cache_lifetime = lifetime_s;
        self
    }

    /// Bit 31 of the trace id promotes per-command logging along the path.
    pub fn set_trace_id(&mut self, trace_id: u32) -> &mut Self {
        self.trace_id = trace_id;
        self
    }

    pub fn trace_id(&self) -> u32 {
        self.trace_id
    }

    pub fn set_filter(&mut self, filter: Filter) -> &mut Self {
        self.filter = filter;
        self
    }

    pub fn set_checker(&mut self, checker: Checker) -> &mut Self {
        self.checker = checker;
        self
    }

    pub fn set_exceptions(&mut self, exceptions: ExceptionSet) -> &mut Self {
        self.exceptions = exceptions;
        self
    }

    /// Address all group-routed sends to this proxy; it dispatches for us.
    pub fn set_forward(&mut self, forward: Option<SocketAddr>) -> &mut Self {
        self.forward = forward;
        self
    }

    /// Pin every send to exactly this node, bypassing routing.
    pub fn set_direct(&mut self, direct: Option<SocketAddr>) -> &mut Self {
        self.direct = direct;
        self
    }

    pub fn direct(&self) -> Option<SocketAddr> {
        self.direct
    }

    /// Split writes bigger than this into prepare/plain/commit chunks;
    /// zero disables chunking.
    pub fn set_chunk_size(&mut self, chunk_size: u64) -> &mut Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Transform a key argument into its id under the session namespace.
    pub fn transform(&self, key: &Key) -> KeyId {
        match key {
            Key::Name(name) => KeyId::from_name(&self.namespace, name.as_bytes()),
            Key::Id(id) => *id,
            Key::Routed(id) => id.key,
        }
    }

    // --- dispatch plumbing ------------------------------------------------

    fn target_groups(&self, key: &Key) -> Vec<u32> {
        match key {
            Key::Routed(id) => vec![id.group],
            _ => self.groups.clone(),
        }
    }

    pub fn ioflags(&self) -> u64 {
        self.ioflags
    }

    pub fn timestamp(&self) -> Time {
        self.timestamp
    }

    pub(crate) fn policy_for_groups(&self, total_groups: usize) -> Policy {
        self.policy(total_groups)
    }

    fn policy(&self, total_groups: usize) -> Policy {
        Policy {
            filter: self.filter,
            checker: self.checker,
            exceptions: self.exceptions,
            total_groups,
        }
    }

    /// Child-dispatch policy: everything flows, outcome judged by the
    /// caller, never raises.
    pub(crate) fn inner_policy(&self) -> Policy {
        Policy {
            filter: Filter::AllWithAck,
            checker: Checker::NoCheck,
            exceptions: ExceptionSet::NO_EXCEPTIONS,
            total_groups: 1,
        }
    }

    pub(crate) fn dispatcher(&self, groups: Vec<u32>, policy: Policy) -> Dispatcher {
        Dispatcher {
            cluster: self.cluster.clone(),
            groups,
            direct: self.direct,
            forward: self.forward,
            timeout: self.timeout,
            policy,
        }
    }

    pub(crate) fn header(&self, opcode: Opcode, key: KeyId, group: u32) -> CommandHeader {
        let mut header = CommandHeader::new(opcode, key, group);
        header.flags = self.cflags | cflags::NEED_ACK;
        header.trace = self.trace_id;
        if self.trace_id & (1 << 31) != 0 {
            header.flags |= cflags::TRACE_BIT;
        }
        header
    }

    /// Absolute deadline forwarded inside request bodies so proxies can
    /// tighten their own transaction timeouts.
    pub(crate) fn body_deadline(&self) -> Option<Time> {
        let now = Time::now();
        Some(Time {
            sec: now.sec + self.timeout.as_secs(),
            nsec: now.nsec,
        })
    }

    fn write_timestamps(&self) -> (Time, Time) {
        let data_ts = if self.timestamp.is_zero() {
            Time::now()
        } else {
            self.timestamp
        };
        let json_ts = if self.json_timestamp.is_zero() {
            data_ts
        } else {
            self.json_timestamp
        };
        (data_ts, json_ts)
    }

    fn encode<T: serde::Serialize>(&self, body: &T) -> Result<Bytes, Error> {
        encode_body(body).map_err(Error::from)
    }

    fn failed<E: From<ResultEntry> + Send + 'static>(
        &self,
        policy: Policy,
        error: Error,
    ) -> TypedResult<E> {
        TypedResult::new(AsyncResult::failed(policy, error))
    }

    // --- lookup / read ----------------------------------------------------

    /// Locate `key` in every configured group: one entry per successful
    /// replica. When no replica succeeds, the per-group error entries are
    /// delivered instead, so the caller can see each group's verdict.
    pub async fn lookup(&self, key: impl Into<Key>) -> AsyncLookupResult {
        let key = key.into();
        let groups = self.target_groups(&key);
        let header = self.header(Opcode::Lookup, self.transform(&key), 0);
        let dispatcher = self.dispatcher(groups.clone(), self.inner_policy());
        let inner = dispatcher
            .send_to_groups(Control::new(header, Bytes::new()))
            .await;

        let result = AsyncResult::new(self.policy(groups.len()));
        let outer = result.handler();
        outer.set_total(inner.total());

        struct Gate {
            outer: crate::async_result::ResultHandler,
            errors: std::sync::Mutex<Vec<ResultEntry>>,
            any_success: std::sync::atomic::AtomicBool,
        }
        let gate = std::sync::Arc::new(Gate {
            outer,
            errors: std::sync::Mutex::new(Vec::new()),
            any_success: std::sync::atomic::AtomicBool::new(false),
        });

        let on_entry = {
            let gate = gate.clone();
            move |entry: &ResultEntry| {
                if entry.status() == 0 {
                    gate.any_success
                        .store(true, std::sync::atomic::Ordering::Release);
                    gate.outer.process(entry.clone());
                } else {
                    gate.errors.lock().unwrap().push(entry.clone());
                }
            }
        };
        let on_complete = {
            let gate = gate.clone();
            move |error: &Option<Error>| {
                if !gate.any_success.load(std::sync::atomic::Ordering::Acquire) {
                    let errors = std::mem::take(&mut *gate.errors.lock().unwrap());
                    for entry in errors {
                        gate.outer.process(entry);
                    }
                }
                gate.outer.complete(error.clone());
            }
        };
        inner.connect(on_entry, on_complete);

        TypedResult::new(result)
    }

    /// Read json and data of `key`; `size == 0` reads everything after
    /// `offset`.
    pub async fn read(&self, key: impl Into<Key>, offset: u64, size: u64) -> AsyncReadResult {
        self.read_impl(key.into(), read_flags::JSON | read_flags::DATA, offset, size, None)
            .await
    }

    /// Read only the json part of `key`.
    pub async fn read_json(&self, key: impl Into<Key>) -> AsyncReadResult {
        self.read_impl(key.into(), read_flags::JSON, 0, 0, None).await
    }

    /// Read only the data part of `key`.
    pub async fn read_data(&self, key: impl Into<Key>, offset: u64, size: u64) -> AsyncReadResult {
        self.read_impl(key.into(), read_flags::DATA, offset, size, None)
            .await
    }

    /// Lookup across groups, order replicas by freshness, read from the
    /// freshest one first.
    pub async fn read_latest(&self, key: impl Into<Key>, offset: u64, size: u64) -> AsyncReadResult {
        let key = key.into();
        let groups = self.target_groups(&key);
        if groups.is_empty() {
            return self.failed(
                self.policy(0),
                Error::new(ErrorCode::NoRoute, "session has no groups"),
            );
        }

        let mut probe = self.clean_clone();
        probe.set_filter(Filter::Positive);
        probe.set_checker(Checker::AtLeastOne);
        probe.set_exceptions(ExceptionSet::NO_EXCEPTIONS);
        let lookups = probe.lookup(key.clone()).await;

        let entries = lookups.get().await.unwrap_or_default();
        // Freshest replica first; session group order breaks timestamp ties.
        let mut ordered: Vec<(usize, Time)> = entries
            .iter()
            .filter_map(|e| {
                let ts = e.record_info().map(|r| r.data_timestamp)?;
                let pos = groups.iter().position(|&g| g == e.cmd.group)?;
                Some((pos, ts))
            })
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let group_order: Vec<u32> = if ordered.is_empty() {
            groups
        } else {
            ordered.iter().map(|&(pos, _)| groups[pos]).collect()
        };

        self.read_impl(
            key,
            read_flags::JSON | read_flags::DATA,
            offset,
            size,
            Some(group_order),
        )
        .await
    }

    /// Sequentially try groups until one read succeeds; per-group error
    /// entries flow into the result as they happen.
    async fn read_impl(
        &self,
        key: Key,
        rflags: u64,
        offset: u64,
        size: u64,
        group_order: Option<Vec<u32>>,
    ) -> AsyncReadResult {
        let groups = group_order.unwrap_or_else(|| self.target_groups(&key));
        let policy = self.policy(1);
        if groups.is_empty() {
            return self.failed(policy, Error::new(ErrorCode::NoRoute, "session has no groups"));
        }

        let body = ReadRequest {
            ioflags: self.ioflags,
            read_flags: rflags,
            data_offset: offset,
            data_size: size,
            deadline: self.body_deadline(),
        };
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };

        let result = AsyncResult::new(policy);
        let outer = result.handler();
        outer.set_total(1);

        let session = self.clone();
        let key_id = self.transform(&key);

        // The first attempt goes on the wire before this call returns, so
        // back-to-back operations keep their issue order.
        let mut remaining = groups.into_iter();
        let first_group = remaining.next().expect("groups checked non-empty");
        let header = self.header(Opcode::Read, key_id, first_group);
        let dispatcher = self.dispatcher(vec![first_group], self.inner_policy());
        let first_child = dispatcher
            .send_to_single_state(Control::new(header, body.clone()))
            .await;

        tokio::spawn(async move {
            let mut child = first_child;
            let mut last_error: Option<Error> = None;
            let mut failed: Vec<ResultEntry> = Vec::new();
            loop {
                let entries = child.get().await.unwrap_or_default();
                if entries.iter().any(|e| e.status() == 0 && !e.is_ack()) {
                    for entry in entries {
                        outer.process(entry);
                    }
                    outer.complete(None);
                    return;
                }
                last_error = child
                    .error()
                    .or_else(|| entries.iter().find_map(|e| e.error.clone()))
                    .or(last_error);
                failed.extend(entries);

                match remaining.next() {
                    Some(group) => {
                        let header = session.header(Opcode::Read, key_id, group);
                        let dispatcher =
                            session.dispatcher(vec![group], session.inner_policy());
                        child = dispatcher
                            .send_to_single_state(Control::new(header, body.clone()))
                            .await;
                    }
                    None => {
                        // Every group failed; surface each group's verdict.
                        for entry in failed {
                            outer.process(entry);
                        }
                        outer.complete(last_error.or_else(|| {
                            Some(Error::new(ErrorCode::NoRoute, "no successful replies"))
                        }));
                        return;
                    }
                }
            }
        });

        TypedResult::new(result)
    }

    // --- write family -----------------------------------------------------

    /// Write `json` and `data` under `key` into every configured group.
    pub async fn write(
        &self,
        key: impl Into<Key>,
        json: impl Into<Vec<u8>>,
        json_capacity: u64,
        data: impl Into<Vec<u8>>,
        data_capacity: u64,
    ) -> AsyncWriteResult {
        let key = key.into();
        let json = json.into();
        let data = data.into();
        if self.chunk_size > 0 && (data.len() as u64) > self.chunk_size {
            return self
                .write_chunked(key, json, json_capacity, data, data_capacity)
                .await;
        }
        self.write_op(
            key,
            self.ioflags,
            json,
            json_capacity,
            data,
            0,
            data_capacity,
            0,
            None,
        )
        .await
    }

    /// Write `data` at `offset` without touching json.
    pub async fn write_data(
        &self,
        key: impl Into<Key>,
        data: impl Into<Vec<u8>>,
        offset: u64,
    ) -> AsyncWriteResult {
        self.write_op(key.into(), self.ioflags, Vec::new(), 0, data.into(), offset, 0, 0, None)
            .await
    }

    /// Reserve space and write the first part; the record stays uncommitted
    /// and invisible to lookup/read until commit.
    pub async fn write_prepare(
        &self,
        key: impl Into<Key>,
        json: impl Into<Vec<u8>>,
        json_capacity: u64,
        data: impl Into<Vec<u8>>,
        data_offset: u64,
        data_capacity: u64,
    ) -> AsyncWriteResult {
        self.write_op(
            key.into(),
            self.ioflags | ioflags::PREPARE,
            json.into(),
            json_capacity,
            data.into(),
            data_offset,
            data_capacity,
            0,
            None,
        )
        .await
    }

    /// Write a middle part into a prepared record.
    pub async fn write_plain(
        &self,
        key: impl Into<Key>,
        json: impl Into<Vec<u8>>,
        data: impl Into<Vec<u8>>,
        data_offset: u64,
    ) -> AsyncWriteResult {
        self.write_op(
            key.into(),
            self.ioflags | ioflags::PLAIN,
            json.into(),
            0,
            data.into(),
            data_offset,
            0,
            0,
            None,
        )
        .await
    }

    /// Write the final part and make the record visible.
    pub async fn write_commit(
        &self,
        key: impl Into<Key>,
        json: impl Into<Vec<u8>>,
        data: impl Into<Vec<u8>>,
        data_offset: u64,
        data_commit_size: u64,
    ) -> AsyncWriteResult {
        self.write_op(
            key.into(),
            self.ioflags | ioflags::COMMIT,
            json.into(),
            0,
            data.into(),
            data_offset,
            0,
            data_commit_size,
            None,
        )
        .await
    }

    /// Rewrite only the json part of an existing record.
    pub async fn update_json(
        &self,
        key: impl Into<Key>,
        json: impl Into<Vec<u8>>,
    ) -> AsyncWriteResult {
        self.write_op(
            key.into(),
            self.ioflags | ioflags::UPDATE_JSON,
            json.into(),
            0,
            Vec::new(),
            0,
            0,
            0,
            None,
        )
        .await
    }

    /// Write succeeding only when the stored data checksum matches.
    pub async fn write_cas(
        &self,
        key: impl Into<Key>,
        json: impl Into<Vec<u8>>,
        data: impl Into<Vec<u8>>,
        expected_checksum: u32,
    ) -> AsyncWriteResult {
        self.write_op(
            key.into(),
            self.ioflags | ioflags::CAS_CHECKSUM,
            json.into(),
            0,
            data.into(),
            0,
            0,
            0,
            Some(expected_checksum),
        )
        .await
    }

    /// Read-modify-write with up to `retries` attempts on checksum mismatch.
    pub async fn write_cas_with(
        &self,
        key: impl Into<Key>,
        converter: impl Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
        retries: usize,
    ) -> AsyncWriteResult {
        let key = key.into();
        let policy = self.policy(self.target_groups(&key).len());
        let result = AsyncResult::new(policy);
        let outer = result.handler();
        outer.set_total(1);

        let session = self.clone();
        tokio::spawn(async move {
            let mut attempts = retries.max(1);
            loop {
                let mut probe = session.clean_clone();
                probe.set_exceptions(ExceptionSet::NO_EXCEPTIONS);
                probe.set_filter(Filter::AllWithAck);
                let read = probe.read(key.clone(), 0, 0).await;
                let read_entries = read.get().await.unwrap_or_default();
                let current = read_entries.iter().find(|e| e.status() == 0);

                let (old, expected) = match (&read.error(), current) {
                    (None, Some(entry)) => {
                        let data = entry.payload().to_vec();
                        let csum = crc32fast::hash(&data);
                        (data, Some(csum))
                    }
                    // Missing key converts from empty and writes unguarded.
                    _ if read
                        .error()
                        .map(|e| e.is(ErrorCode::NotFound))
                        .unwrap_or(false) =>
                    {
                        (Vec::new(), None)
                    }
                    _ => {
                        outer.complete(read.error().or_else(|| {
                            Some(Error::new(ErrorCode::NotFound, "read for cas failed"))
                        }));
                        return;
                    }
                };

                let new_data = converter(old);
                let write = match expected {
                    Some(csum) => session.write_cas(key.clone(), Vec::new(), new_data, csum).await,
                    None => session.write(key.clone(), Vec::new(), 0, new_data, 0).await,
                };
                let entries = write.raw().get().await.unwrap_or_default();
                let err = write.raw().error();
                let mismatched = err
                    .as_ref()
                    .map(|e| e.is(ErrorCode::BadChecksum))
                    .unwrap_or(false);
                attempts -= 1;
                if mismatched && attempts > 0 {
                    continue;
                }
                for entry in entries {
                    outer.process(entry);
                }
                outer.complete(err);
                return;
            }
        });

        TypedResult::new(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_op(
        &self,
        key: Key,
        ioflags: u64,
        json: Vec<u8>,
        json_capacity: u64,
        data: Vec<u8>,
        data_offset: u64,
        data_capacity: u64,
        data_commit_size: u64,
        expected_data_checksum: Option<u32>,
    ) -> AsyncWriteResult {
        let groups = self.target_groups(&key);
        let policy = self.policy(groups.len());
        let (data_ts, json_ts) = self.write_timestamps();
        let body = WriteRequest {
            ioflags,
            user_flags: self.user_flags,
            json_timestamp: json_ts,
            json_capacity,
            json,
            data_timestamp: data_ts,
            data_offset,
            data_capacity,
            data_commit_size,
            data,
            cache_lifetime: self.cache_lifetime,
            expected_data_checksum,
            deadline: self.body_deadline(),
        };
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::Write, self.transform(&key), 0);
        let dispatcher = self.dispatcher(groups, policy);
        TypedResult::new(dispatcher.send_to_groups_io(header, |_| body.clone()).await)
    }

    /// Chunked write: prepare, N plain parts, commit, sequential per group.
    async fn write_chunked(
        &self,
        key: Key,
        json: Vec<u8>,
        json_capacity: u64,
        data: Vec<u8>,
        data_capacity: u64,
    ) -> AsyncWriteResult {
        let groups = self.target_groups(&key);
        let policy = self.policy(groups.len());
        if groups.is_empty() {
            return self.failed(policy, Error::new(ErrorCode::NoRoute, "session has no groups"));
        }

        let result = AsyncResult::new(policy);
        let outer = result.handler();
        outer.set_total(groups.len());

        let session = self.clone();
        let chunk = self.chunk_size as usize;
        let total_size = data.len() as u64;
        tokio::spawn(async move {
            let mut first_error: Option<Error> = None;
            for group in groups {
                let id = Id::new(session.transform(&key), group);
                let mut sub = session.clean_clone();
                sub.set_exceptions(ExceptionSet::NO_EXCEPTIONS);
                sub.set_filter(Filter::AllWithAck);
                sub.set_groups(vec![group]);
                sub.set_chunk_size(0);

                let mut offset = 0usize;
                let mut failed = None;
                let mut step = 0usize;
                while offset < data.len() {
                    let end = (offset + chunk).min(data.len());
                    let part = data[offset..end].to_vec();
                    let last = end == data.len();
                    let write = if step == 0 {
                        sub.write_prepare(
                            id,
                            json.clone(),
                            json_capacity,
                            part,
                            offset as u64,
                            data_capacity.max(total_size),
                        )
                        .await
                    } else if last {
                        sub.write_commit(id, Vec::new(), part, offset as u64, total_size)
                            .await
                    } else {
                        sub.write_plain(id, Vec::new(), part, offset as u64).await
                    };

                    write.raw().wait().await.ok();
                    if let Some(err) = write.raw().error() {
                        failed = Some(err);
                        break;
                    }
                    if last {
                        for entry in write.raw().get().await.unwrap_or_default() {
                            outer.process(entry);
                        }
                    }
                    offset = end;
                    step += 1;
                }

                if let Some(err) = failed {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            outer.complete(first_error);
        });

        TypedResult::new(result)
    }

    // --- remove -----------------------------------------------------------

    /// Remove `key` from every configured group. With `CAS_TIMESTAMP` set the
    /// removal only applies when the session timestamp is not older than the
    /// record.
    pub async fn remove(&self, key: impl Into<Key>) -> AsyncRemoveResult {
        let key = key.into();
        let groups = self.target_groups(&key);
        let body = RemoveRequest {
            ioflags: self.ioflags,
            timestamp: self.timestamp,
            deadline: self.body_deadline(),
        };
        let policy = self.policy(groups.len());
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::Remove, self.transform(&key), 0);
        let dispatcher = self.dispatcher(groups, policy);
        TypedResult::new(dispatcher.send_to_groups(Control::new(header, body)).await)
    }

    // --- bulk operations ----------------------------------------------------

    /// Read many keys with one request per owning node.
    pub async fn bulk_read(&self, keys: Vec<Id>) -> AsyncReadResult {
        bulk::bulk_read(self, keys, read_flags::JSON | read_flags::DATA).await
    }

    pub async fn bulk_read_json(&self, keys: Vec<Id>) -> AsyncReadResult {
        bulk::bulk_read(self, keys, read_flags::JSON).await
    }

    pub async fn bulk_read_data(&self, keys: Vec<Id>) -> AsyncReadResult {
        bulk::bulk_read(self, keys, read_flags::DATA).await
    }

    /// Write many keyed blobs; per-key writes aggregated into one result.
    pub async fn bulk_write(&self, blobs: Vec<(Id, Vec<u8>, Vec<u8>)>) -> AsyncWriteResult {
        bulk::bulk_write(self, blobs).await
    }

    /// Remove many keys with one request per owning node. Every input key
    /// yields exactly one entry, synthesized if its node never answered.
    pub async fn bulk_remove(&self, keys: Vec<Id>) -> AsyncRemoveResult {
        bulk::bulk_remove(self, keys).await
    }

    // --- ranges -----------------------------------------------------------

    /// Server-streaming read over a key interval in one group.
    pub async fn read_data_range(
        &self,
        range: KeyRange,
        group: u32,
        limit: u64,
    ) -> AsyncReadResult {
        let body = RangeRequest {
            range,
            read_flags: read_flags::JSON | read_flags::DATA,
            limit,
            deadline: self.body_deadline(),
        };
        let policy = self.policy(1);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::ReadRange, range.begin, group);
        let dispatcher = self.dispatcher(vec![group], policy);
        TypedResult::new(
            dispatcher
                .send_to_single_state(Control::new(header, body))
                .await,
        )
    }

    /// Server-streaming remove over a key interval in one group.
    pub async fn remove_data_range(&self, range: KeyRange, group: u32) -> AsyncRemoveResult {
        let body = RangeRequest {
            range,
            read_flags: 0,
            limit: 0,
            deadline: self.body_deadline(),
        };
        let policy = self.policy(1);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::RemoveRange, range.begin, group);
        let dispatcher = self.dispatcher(vec![group], policy);
        TypedResult::new(
            dispatcher
                .send_to_single_state(Control::new(header, body))
                .await,
        )
    }

    // --- iterators ----------------------------------------------------------

    /// Start a server-resident iterator on one backend of `addr`.
    pub async fn start_iterator(
        &self,
        addr: SocketAddr,
        backend_id: u32,
        flags: u64,
        key_ranges: Vec<KeyRange>,
        time_range: (Time, Time),
    ) -> AsyncIteratorResult {
        let body = IteratorRequest::Start {
            flags,
            key_ranges,
            time_range,
        };
        self.iterator_op(addr, backend_id, body).await
    }

    pub async fn pause_iterator(
        &self,
        addr: SocketAddr,
        backend_id: u32,
        iterator_id: u64,
    ) -> AsyncIteratorResult {
        self.iterator_op(addr, backend_id, IteratorRequest::Pause { iterator_id })
            .await
    }

    pub async fn continue_iterator(
        &self,
        addr: SocketAddr,
        backend_id: u32,
        iterator_id: u64,
    ) -> AsyncIteratorResult {
        self.iterator_op(addr, backend_id, IteratorRequest::Continue { iterator_id })
            .await
    }

    pub async fn cancel_iterator(
        &self,
        addr: SocketAddr,
        backend_id: u32,
        iterator_id: u64,
    ) -> AsyncIteratorResult {
        self.iterator_op(addr, backend_id, IteratorRequest::Cancel { iterator_id })
            .await
    }

    async fn iterator_op(
        &self,
        addr: SocketAddr,
        backend_id: u32,
        body: IteratorRequest,
    ) -> AsyncIteratorResult {
        let policy = self.policy(1);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let mut header = self.header(Opcode::Iterator, KeyId::ZERO, 0);
        header.backend = backend_id;
        header.flags |= cflags::DIRECT_BACKEND | cflags::NOLOCK;
        let dispatcher = self.dispatcher(Vec::new(), policy);
        TypedResult::new(dispatcher.send_to_address(addr, Control::new(header, body)).await)
    }

    // --- stats / administration ---------------------------------------------

    /// Statistics from every node in the routing table.
    pub async fn stat_log(&self) -> AsyncStatResult {
        let body = StatRequest {
            categories: stat_categories::ALL,
        };
        let members = self.cluster.route().members().len().max(1);
        let policy = self.policy(members);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::Stat, KeyId::ZERO, 0);
        let dispatcher = self.dispatcher(Vec::new(), policy);
        TypedResult::new(dispatcher.send_to_each_node(Control::new(header, body)).await)
    }

    /// Statistics from a single node, one entry per backend it serves.
    pub async fn stat_log_on(&self, addr: SocketAddr) -> AsyncStatResult {
        let body = StatRequest {
            categories: stat_categories::ALL,
        };
        let policy = self.policy(1);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::Stat, KeyId::ZERO, 0);
        let dispatcher = self.dispatcher(Vec::new(), policy);
        TypedResult::new(
            dispatcher
                .send_to_each_backend(addr, Control::new(header, body))
                .await,
        )
    }

    /// Command counters from every node.
    pub async fn stat_log_count(&self) -> AsyncStatResult {
        let body = StatRequest {
            categories: stat_categories::COMMANDS,
        };
        let members = self.cluster.route().members().len().max(1);
        let policy = self.policy(members);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::Stat, KeyId::ZERO, 0);
        let dispatcher = self.dispatcher(Vec::new(), policy);
        TypedResult::new(dispatcher.send_to_each_node(Control::new(header, body)).await)
    }

    /// Read or mutate the status bits of the node owning `id`.
    pub async fn update_status_by_id(
        &self,
        id: Id,
        status: Option<u64>,
    ) -> TypedResult<ResultEntry> {
        match self.cluster.route().locate(id.group, &id.key) {
            Some(entry) => self.update_status(entry.addr, status).await,
            None => self.failed(
                self.policy(1),
                Error::new(
                    ErrorCode::NoRoute,
                    format!("no route for key {} in group {}", id.key, id.group),
                ),
            ),
        }
    }

    /// Read or mutate a node's status bits; always direct.
    pub async fn update_status(
        &self,
        addr: SocketAddr,
        status: Option<u64>,
    ) -> TypedResult<ResultEntry> {
        let body = StatusRequest { status };
        let policy = self.policy(1);
        let body = match self.encode(&body) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::Status, KeyId::ZERO, 0);
        let dispatcher = self.dispatcher(Vec::new(), policy);
        TypedResult::new(dispatcher.send_to_address(addr, Control::new(header, body)).await)
    }

    /// Make one backend sleep before serving each request; test hook and
    /// operational throttle.
    pub async fn set_delay(
        &self,
        addr: SocketAddr,
        backend_id: u32,
        delay_ms: u64,
    ) -> TypedResult<ResultEntry> {
        self.backend_control(addr, BackendControlRequest::SetDelay { backend_id, delay_ms })
            .await
    }

    pub async fn backend_control(
        &self,
        addr: SocketAddr,
        request: BackendControlRequest,
    ) -> TypedResult<ResultEntry> {
        let policy = self.policy(1);
        let body = match self.encode(&request) {
            Ok(body) => body,
            Err(err) => return self.failed(policy, err),
        };
        let header = self.header(Opcode::BackendControl, KeyId::ZERO, 0);
        let dispatcher = self.dispatcher(Vec::new(), policy);
        TypedResult::new(dispatcher.send_to_address(addr, Control::new(header, body)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_conversions() {
        let by_name = Key::from("object");
        assert!(matches!(by_name, Key::Name(_)));

        let id = Id::new(KeyId::from_name(b"", b"object"), 2);
        match Key::from(id) {
            Key::Routed(routed) => assert_eq!(routed.group, 2),
            other => panic!("unexpected key {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_clone_drops_overrides() {
        let cluster = Cluster::connect(&[]).await.unwrap();
        let mut session = Session::new(cluster);
        session
            .set_groups(vec![1, 2])
            .set_timeout(Duration::from_secs(9))
            .set_filter(Filter::AllFinal)
            .set_forward(Some("127.0.0.1:4000".parse().unwrap()))
            .set_direct(Some("127.0.0.1:4001".parse().unwrap()));

        let clone = session.clean_clone();
        assert_eq!(clone.groups(), &[1, 2]);
        assert_eq!(clone.timeout(), Duration::from_secs(9));
        assert!(clone.direct().is_none());
        assert!(clone.forward.is_none());
        assert_eq!(clone.filter, Filter::AllFinal);
    }

    #[tokio::test]
    async fn namespace_changes_transform() {
        let cluster = Cluster::connect(&[]).await.unwrap();
        let mut a = Session::new(cluster.clone());
        let mut b = Session::new(cluster);
        a.set_namespace(b"tenant-a".to_vec());
        b.set_namespace(b"tenant-b".to_vec());
        let key = Key::from("shared name");
        assert_ne!(a.transform(&key), b.transform(&key));
    }

    #[tokio::test]
    async fn trace_bit_follows_trace_id() {
        let cluster = Cluster::connect(&[]).await.unwrap();
        let mut session = Session::new(cluster);
        session.set_trace_id(1 << 31 | 7);
        let header = session.header(Opcode::Lookup, KeyId::ZERO, 1);
        assert!(header.is_trace());

        session.set_trace_id(7);
        let header = session.header(Opcode::Lookup, KeyId::ZERO, 1);
        assert!(!header.is_trace());
    }
}
