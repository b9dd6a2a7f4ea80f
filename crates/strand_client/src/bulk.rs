//! Bulk operation planners.
//!
//! Bulk reads/removes partition the input key set by owning node and issue
//! one sub-request per node with that node's sorted key list. A responded
//! bitset per sub-request guarantees the completeness rule: every input key
//! produces exactly one entry, real or synthesized.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use strand_proto::body::{BulkReadRequest, BulkRemoveRequest};
use strand_proto::{cflags, encode_body, CommandHeader, ErrorCode, Id, Opcode};

use crate::aggregator::aggregated;
use crate::async_result::{AsyncResult, ResultHandler, TypedResult};
use crate::entry::{synthetic_entry, ResultEntry};
use crate::error::Error;
use crate::policy::{Checker, ExceptionSet, Filter, Policy};
use crate::session::{AsyncReadResult, AsyncRemoveResult, AsyncWriteResult, Key, Session};

/// Sub-dispatch policy: everything flows, a sub-request with zero successes
/// completes with its first per-entry error so the synthesized entries can
/// carry the real failure.
fn sub_policy() -> Policy {
    Policy {
        filter: Filter::AllWithAck,
        checker: Checker::AtLeastOne,
        exceptions: ExceptionSet::NO_EXCEPTIONS,
        total_groups: 1,
    }
}

/// Per-node bulk sub-request state: sorted key list plus the responded
/// bitset used to synthesize entries for keys the node never answered.
struct SingleBulkState {
    handler: ResultHandler,
    opcode: Opcode,
    addr: SocketAddr,
    keys: Vec<Id>,
    responded: Mutex<Vec<bool>>,
    template: CommandHeader,
}

impl SingleBulkState {
    fn process(&self, entry: &ResultEntry) {
        // Per-key replies carry MORE; the transaction ack and synthesized
        // transport failures are terminal and handled at completion time.
        if !entry.cmd.has_more() {
            return;
        }

        let probe = Id::new(entry.cmd.key, entry.cmd.group);
        match self.keys.binary_search(&probe) {
            Ok(index) => {
                let mut responded = self.responded.lock().unwrap();
                if responded[index] {
                    tracing::debug!(
                        opcode = %self.opcode,
                        key = %entry.cmd.key,
                        "duplicate bulk reply for key"
                    );
                    return;
                }
                responded[index] = true;
                drop(responded);
                self.handler.process(entry.clone());
            }
            Err(_) => tracing::warn!(
                opcode = %self.opcode,
                key = %entry.cmd.key,
                status = entry.status(),
                "bulk reply for unknown key"
            ),
        }
    }

    fn complete(&self, error: &Option<Error>) {
        let responded = self.responded.lock().unwrap().clone();
        for (index, key) in self.keys.iter().enumerate() {
            if responded[index] {
                continue;
            }
            let mut cmd = self.template;
            cmd.key = key.key;
            cmd.group = key.group;
            cmd.flags |= cflags::REPLY | cflags::MORE;
            let entry = match error {
                Some(err) => {
                    cmd.status = err.status();
                    ResultEntry {
                        addr: Some(self.addr),
                        cmd,
                        data: Bytes::new(),
                        error: Some(err.clone()),
                    }
                }
                None => synthetic_entry(
                    cmd,
                    Some(self.addr),
                    ErrorCode::NotFound,
                    format!("{}: no reply for key {}", self.opcode, key.key),
                ),
            };
            self.handler.process(entry);
        }
        self.handler.complete(error.clone());
        tracing::debug!(opcode = %self.opcode, addr = %self.addr, "bulk sub-request finished");
    }
}

/// Issue one bulk sub-request against `addr` and return its per-key result.
async fn single_bulk(
    session: &Session,
    opcode: Opcode,
    addr: SocketAddr,
    mut keys: Vec<Id>,
    body: Bytes,
) -> AsyncResult {
    keys.sort_unstable();

    let child = AsyncResult::new(session.inner_policy());
    let mut header = session.header(opcode, keys[0].key, keys[0].group);
    header.flags |= cflags::NOLOCK;

    let mut sub_session = session.clean_clone();
    sub_session.set_direct(Some(addr));
    let dispatcher = sub_session.dispatcher(Vec::new(), sub_policy());

    let state = Arc::new(SingleBulkState {
        handler: child.handler(),
        opcode,
        addr,
        responded: Mutex::new(vec![false; keys.len()]),
        template: header,
        keys,
    });

    let sub = dispatcher
        .send_to_single_state(crate::dispatch::Control::new(header, body))
        .await;
    state.handler.set_total(sub.total());

    let on_entry = {
        let state = state.clone();
        move |entry: &ResultEntry| state.process(entry)
    };
    let on_complete = {
        let state = state.clone();
        move |err: &Option<Error>| state.complete(err)
    };
    sub.connect(on_entry, on_complete);

    child
}

/// Partition keys by owning node. Unroutable keys land in the second list.
fn partition(session: &Session, keys: Vec<Id>) -> (BTreeMap<SocketAddr, Vec<Id>>, Vec<Id>) {
    let mut by_node: BTreeMap<SocketAddr, Vec<Id>> = BTreeMap::new();
    let mut unrouted = Vec::new();

    if let Some(addr) = session.direct() {
        by_node.insert(addr, keys);
        return (by_node, unrouted);
    }

    for id in keys {
        match session.cluster().route().locate(id.group, &id.key) {
            Some(entry) => by_node.entry(entry.addr).or_default().push(id),
            None => unrouted.push(id),
        }
    }
    (by_node, unrouted)
}

/// Child result carrying immediate synthetic NO_ROUTE entries for keys the
/// routing table cannot place.
fn unrouted_child(session: &Session, opcode: Opcode, unrouted: &[Id]) -> AsyncResult {
    let child = AsyncResult::new(session.inner_policy());
    let handler = child.handler();
    handler.set_total(0);
    for id in unrouted {
        let mut cmd = session.header(opcode, id.key, id.group);
        cmd.flags |= cflags::MORE;
        handler.process(synthetic_entry(
            cmd,
            None,
            ErrorCode::NoRoute,
            format!("{}: no route for key {} in group {}", opcode, id.key, id.group),
        ));
    }
    handler.complete(None);
    child
}

fn distinct_groups(keys: &[Id]) -> usize {
    let mut groups: Vec<u32> = keys.iter().map(|id| id.group).collect();
    groups.sort_unstable();
    groups.dedup();
    groups.len()
}

pub(crate) async fn bulk_remove(session: &Session, keys: Vec<Id>) -> AsyncRemoveResult {
    let policy = session.policy_for_groups(distinct_groups(&keys));
    if keys.is_empty() {
        return TypedResult::new(AsyncResult::failed(
            policy,
            Error::new(ErrorCode::NoRoute, "bulk_remove: keys list is empty"),
        ));
    }
    tracing::info!(keys = keys.len(), "bulk_remove started");

    let body = BulkRemoveRequest {
        keys: Vec::new(),
        ioflags: session.ioflags(),
        timestamp: session.timestamp(),
        deadline: session.body_deadline(),
    };

    let (by_node, unrouted) = partition(session, keys);
    let mut children = Vec::with_capacity(by_node.len() + 1);
    if !unrouted.is_empty() {
        children.push(unrouted_child(session, Opcode::BulkRemove, &unrouted));
    }
    for (addr, mut node_keys) in by_node {
        node_keys.sort_unstable();
        let body = BulkRemoveRequest {
            keys: node_keys.clone(),
            ..body.clone()
        };
        let body = match encode_body(&body) {
            Ok(body) => body,
            Err(err) => {
                return TypedResult::new(AsyncResult::failed(policy, err.into()));
            }
        };
        children.push(single_bulk(session, Opcode::BulkRemove, addr, node_keys, body).await);
    }

    TypedResult::new(aggregated(policy, &children))
}

pub(crate) async fn bulk_read(session: &Session, keys: Vec<Id>, read_flags: u64) -> AsyncReadResult {
    let policy = session.policy_for_groups(distinct_groups(&keys));
    if keys.is_empty() {
        return TypedResult::new(AsyncResult::failed(
            policy,
            Error::new(ErrorCode::NoRoute, "bulk_read: keys list is empty"),
        ));
    }

    let (by_node, unrouted) = partition(session, keys);
    let mut children = Vec::with_capacity(by_node.len() + 1);
    if !unrouted.is_empty() {
        children.push(unrouted_child(session, Opcode::BulkRead, &unrouted));
    }
    for (addr, mut node_keys) in by_node {
        node_keys.sort_unstable();
        let body = BulkReadRequest {
            keys: node_keys.clone(),
            read_flags,
            deadline: session.body_deadline(),
        };
        let body = match encode_body(&body) {
            Ok(body) => body,
            Err(err) => {
                return TypedResult::new(AsyncResult::failed(policy, err.into()));
            }
        };
        children.push(single_bulk(session, Opcode::BulkRead, addr, node_keys, body).await);
    }

    TypedResult::new(aggregated(policy, &children))
}

pub(crate) async fn bulk_write(
    session: &Session,
    blobs: Vec<(Id, Vec<u8>, Vec<u8>)>,
) -> AsyncWriteResult {
    let groups = distinct_groups(&blobs.iter().map(|(id, _, _)| *id).collect::<Vec<_>>());
    let policy = session.policy_for_groups(groups);
    if blobs.is_empty() {
        return TypedResult::new(AsyncResult::failed(
            policy,
            Error::new(ErrorCode::NoRoute, "bulk_write: nothing to write"),
        ));
    }

    let mut sub_session = session.clean_clone();
    sub_session.set_exceptions(crate::policy::ExceptionSet::NO_EXCEPTIONS);

    let mut children = Vec::with_capacity(blobs.len());
    for (id, json, data) in blobs {
        let write = sub_session.write(Key::from(id), json, 0, data, 0).await;
        children.push(write.raw().clone());
    }

    TypedResult::new(aggregated(policy, &children))
}
