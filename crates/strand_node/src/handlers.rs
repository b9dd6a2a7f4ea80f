//! Per-opcode command execution against the local backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use strand_proto::body::{
    iterator_flags, stat_categories, BackendControlRequest, BulkReadRequest, BulkRemoveRequest,
    IteratorRequest, IteratorResponse, RangeRequest, ReadRequest, RemoveRequest, RouteListResponse,
    StatRequest, StatResponse, StatusRequest, StatusResponse, WriteRequest,
};
use strand_proto::{decode_body, encode_body, ErrorCode, Id, Opcode, Packet};

use crate::backend::Backend;
use crate::server::Replier;
use crate::NodeState;

/// Server-resident iterator control block.
pub struct IteratorCtl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: tokio::sync::Notify,
}

impl IteratorCtl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        })
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::Acquire) && !self.cancelled() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.paused.load(Ordering::Acquire) || self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Active iterators on this node, keyed by iterator id.
#[derive(Default)]
pub struct IteratorRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Arc<IteratorCtl>>>,
}

impl IteratorRegistry {
    fn register(&self) -> (u64, Arc<IteratorCtl>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctl = IteratorCtl::new();
        self.active.lock().unwrap().insert(id, ctl.clone());
        (id, ctl)
    }

    fn get(&self, id: u64) -> Option<Arc<IteratorCtl>> {
        self.active.lock().unwrap().get(&id).cloned()
    }

    fn remove(&self, id: u64) {
        self.active.lock().unwrap().remove(&id);
    }
}

/// Execute one queued command. `backend` is absent only for the fast-path
/// opcodes that never touch a backend queue.
pub async fn execute_command(
    node: &Arc<NodeState>,
    backend: Option<&Backend>,
    packet: Packet,
    replier: Arc<Replier>,
) {
    let header = packet.header;
    match header.opcode {
        Opcode::RouteList => route_list(node, &replier),
        Opcode::Stat => stat(node, &packet, &replier),
        Opcode::Status => status(node, &packet, &replier),
        Opcode::BackendControl => backend_control(node, &packet, &replier),
        Opcode::Iterator => iterator(node, &packet, &replier),
        _ => {
            let Some(backend) = backend else {
                let _ = replier.ack(ErrorCode::NotSupported.status());
                return;
            };
            if !backend.enabled() {
                let _ = replier.ack(ErrorCode::NotSupported.status());
                return;
            }
            data_command(node, backend, &packet, &replier);
        }
    }
}

fn data_command(node: &Arc<NodeState>, backend: &Backend, packet: &Packet, replier: &Arc<Replier>) {
    let header = packet.header;
    let outcome = match header.opcode {
        Opcode::Lookup => backend
            .lookup(&header.key)
            .and_then(|resp| respond(replier, &resp)),
        Opcode::Read => decode_body::<ReadRequest>(&packet.body)
            .map_err(protocol_error)
            .and_then(|req| {
                check_deadline(&req.deadline)?;
                backend.read(&header.key, &req)
            })
            .and_then(|resp| respond(replier, &resp)),
        Opcode::Write => decode_body::<WriteRequest>(&packet.body)
            .map_err(protocol_error)
            .and_then(|req| {
                check_deadline(&req.deadline)?;
                backend.write(&header.key, &req)
            })
            .and_then(|resp| respond(replier, &resp)),
        Opcode::Remove => decode_body::<RemoveRequest>(&packet.body)
            .map_err(protocol_error)
            .and_then(|req| {
                check_deadline(&req.deadline)?;
                backend.remove(&header.key, &req)
            })
            .map(|()| {
                let _ = replier.ack(0);
            }),
        Opcode::BulkRead => bulk_read(node, packet, replier),
        Opcode::BulkRemove => bulk_remove(node, packet, replier),
        Opcode::ReadRange => read_range(backend, packet, replier),
        Opcode::RemoveRange => remove_range(backend, packet, replier),
        other => {
            tracing::warn!(opcode = %other, "opcode not served by backend queue");
            Err(strand_client::Error::new(
                ErrorCode::NotSupported,
                format!("{other} is not a data command"),
            ))
        }
    };

    if let Err(err) = outcome {
        let _ = replier.ack(err.status());
    }
}

fn protocol_error(err: strand_proto::WireError) -> strand_client::Error {
    strand_client::Error::new(ErrorCode::Protocol, err.to_string())
}

/// Requests carry the client's absolute deadline; serving one that already
/// expired would only produce a reply nobody is waiting for.
fn check_deadline(deadline: &Option<strand_proto::Time>) -> Result<(), strand_client::Error> {
    match deadline {
        Some(deadline) if !deadline.is_zero() && *deadline < strand_proto::Time::now() => Err(
            strand_client::Error::new(ErrorCode::TimedOut, "request deadline passed"),
        ),
        _ => Ok(()),
    }
}

/// Serialize a body and send it as the terminal success reply.
fn respond<T: serde::Serialize>(
    replier: &Arc<Replier>,
    body: &T,
) -> Result<(), strand_client::Error> {
    let body = encode_body(body).map_err(protocol_error)?;
    let _ = replier.finish(0, body);
    Ok(())
}

/// One reply per requested key, then the transaction ack. Keys this node
/// does not serve produce per-key NOT_SUPPORTED entries.
fn bulk_read(
    node: &Arc<NodeState>,
    packet: &Packet,
    replier: &Arc<Replier>,
) -> Result<(), strand_client::Error> {
    let request: BulkReadRequest = decode_body(&packet.body).map_err(protocol_error)?;
    check_deadline(&request.deadline)?;
    for id in &request.keys {
        let reply = node
            .backend_for_group(id.group)
            .map(|rt| rt.backend.clone())
            .ok_or_else(|| {
                strand_client::Error::new(ErrorCode::NotSupported, "group not served here")
            })
            .and_then(|backend| {
                backend.read(
                    &id.key,
                    &ReadRequest {
                        read_flags: request.read_flags,
                        ..Default::default()
                    },
                )
            });
        send_bulk_part(replier, *id, reply.map(|resp| encode_body(&resp)));
    }
    let _ = replier.ack(0);
    Ok(())
}

fn bulk_remove(
    node: &Arc<NodeState>,
    packet: &Packet,
    replier: &Arc<Replier>,
) -> Result<(), strand_client::Error> {
    let request: BulkRemoveRequest = decode_body(&packet.body).map_err(protocol_error)?;
    check_deadline(&request.deadline)?;
    let remove = RemoveRequest {
        ioflags: request.ioflags,
        timestamp: request.timestamp,
        deadline: None,
    };
    for id in &request.keys {
        let reply = node
            .backend_for_group(id.group)
            .map(|rt| rt.backend.clone())
            .ok_or_else(|| {
                strand_client::Error::new(ErrorCode::NotSupported, "group not served here")
            })
            .and_then(|backend| backend.remove(&id.key, &remove));
        send_bulk_part(
            replier,
            *id,
            reply.map(|()| Ok::<_, strand_proto::WireError>(Bytes::new())),
        );
    }
    let _ = replier.ack(0);
    Ok(())
}

fn send_bulk_part(
    replier: &Arc<Replier>,
    id: Id,
    reply: Result<Result<Bytes, strand_proto::WireError>, strand_client::Error>,
) {
    let (status, body) = match reply {
        Ok(Ok(body)) => (0, body),
        Ok(Err(err)) => (ErrorCode::Protocol.status(), {
            tracing::warn!("bulk body serialization failed: {err}");
            Bytes::new()
        }),
        Err(err) => (err.status(), Bytes::new()),
    };
    let _ = replier.part(
        |header| {
            header.key = id.key;
            header.group = id.group;
            header.status = status;
        },
        body,
    );
}

fn read_range(
    backend: &Backend,
    packet: &Packet,
    replier: &Arc<Replier>,
) -> Result<(), strand_client::Error> {
    let request: RangeRequest = decode_body(&packet.body).map_err(protocol_error)?;
    check_deadline(&request.deadline)?;
    let read = ReadRequest {
        read_flags: request.read_flags,
        ..Default::default()
    };
    for key in backend.keys_in_range(&request.range, request.limit) {
        match backend.read(&key, &read) {
            Ok(resp) => {
                let body = encode_body(&resp).map_err(protocol_error)?;
                let _ = replier.part(
                    |header| {
                        header.key = key;
                    },
                    body,
                );
            }
            // Raced with a concurrent remove; the key just drops out.
            Err(err) if err.is(ErrorCode::NotFound) => continue,
            Err(err) => return Err(err),
        }
    }
    let _ = replier.ack(0);
    Ok(())
}

fn remove_range(
    backend: &Backend,
    packet: &Packet,
    replier: &Arc<Replier>,
) -> Result<(), strand_client::Error> {
    let request: RangeRequest = decode_body(&packet.body).map_err(protocol_error)?;
    check_deadline(&request.deadline)?;
    let remove = RemoveRequest::default();
    for key in backend.keys_in_range(&request.range, request.limit) {
        let status = match backend.remove(&key, &remove) {
            Ok(()) => 0,
            Err(err) => err.status(),
        };
        let _ = replier.part(
            |header| {
                header.key = key;
                header.status = status;
            },
            Bytes::new(),
        );
    }
    let _ = replier.ack(0);
    Ok(())
}

// --- fast-path commands ---------------------------------------------------

fn route_list(node: &Arc<NodeState>, replier: &Arc<Replier>) {
    let response = RouteListResponse {
        entries: node.cluster.route().dump(),
    };
    match encode_body(&response) {
        Ok(body) => {
            let _ = replier.finish(0, body);
        }
        Err(err) => {
            tracing::warn!("route list serialization failed: {err}");
            let _ = replier.ack(ErrorCode::Protocol.status());
        }
    }
}

fn stat(node: &Arc<NodeState>, packet: &Packet, replier: &Arc<Replier>) {
    let categories = decode_body::<StatRequest>(&packet.body)
        .map(|req| req.categories)
        .unwrap_or(stat_categories::ALL);
    // A backend-pinned stat request reports that backend only.
    let backend = (packet.header.flags & strand_proto::cflags::DIRECT_BACKEND != 0)
        .then_some(packet.header.backend);
    let payload = node.stat_payload_for(categories, backend);
    let response = StatResponse {
        payload: payload.to_string(),
    };
    match encode_body(&response) {
        Ok(body) => {
            let _ = replier.finish(0, body);
        }
        Err(_) => {
            let _ = replier.ack(ErrorCode::Protocol.status());
        }
    }
}

fn status(node: &Arc<NodeState>, packet: &Packet, replier: &Arc<Replier>) {
    let request: StatusRequest = match decode_body(&packet.body) {
        Ok(request) => request,
        Err(_) => {
            let _ = replier.ack(ErrorCode::Protocol.status());
            return;
        }
    };
    if let Some(status) = request.status {
        node.status.store(status, Ordering::Relaxed);
        tracing::info!(status, "node status updated");
    }
    let response = StatusResponse {
        status: node.status.load(Ordering::Relaxed),
    };
    match encode_body(&response) {
        Ok(body) => {
            let _ = replier.finish(0, body);
        }
        Err(_) => {
            let _ = replier.ack(ErrorCode::Protocol.status());
        }
    }
}

fn backend_control(node: &Arc<NodeState>, packet: &Packet, replier: &Arc<Replier>) {
    let request: BackendControlRequest = match decode_body(&packet.body) {
        Ok(request) => request,
        Err(_) => {
            let _ = replier.ack(ErrorCode::Protocol.status());
            return;
        }
    };
    let backend_id = match request {
        BackendControlRequest::SetDelay { backend_id, .. }
        | BackendControlRequest::Enable { backend_id }
        | BackendControlRequest::Disable { backend_id } => backend_id,
    };
    let Some(runtime) = node.backend_by_id(backend_id) else {
        let _ = replier.ack(ErrorCode::NotSupported.status());
        return;
    };
    match request {
        BackendControlRequest::SetDelay { delay_ms, .. } => {
            tracing::info!(backend_id, delay_ms, "backend delay set");
            runtime.backend.set_delay(delay_ms);
        }
        BackendControlRequest::Enable { .. } => runtime.backend.set_enabled(true),
        BackendControlRequest::Disable { .. } => runtime.backend.set_enabled(false),
    }
    let _ = replier.ack(0);
}

/// Iterator control. Start streams entries from a spawned task so a paused
/// iterator never pins an i/o worker.
fn iterator(node: &Arc<NodeState>, packet: &Packet, replier: &Arc<Replier>) {
    let header = packet.header;
    let request: IteratorRequest = match decode_body(&packet.body) {
        Ok(request) => request,
        Err(_) => {
            let _ = replier.ack(ErrorCode::Protocol.status());
            return;
        }
    };

    match request {
        IteratorRequest::Start {
            flags,
            key_ranges,
            time_range,
        } => {
            let Some(runtime) = node.backend_by_id(header.backend) else {
                let _ = replier.ack(ErrorCode::NotSupported.status());
                return;
            };
            let ranges = if flags & iterator_flags::KEY_RANGE != 0 {
                key_ranges
            } else {
                Vec::new()
            };
            let times = (flags & iterator_flags::TIME_RANGE != 0).then_some(time_range);
            let records = runtime.backend.snapshot(&ranges, times);
            let (iterator_id, ctl) = node.iterators.register();
            tracing::info!(iterator_id, keys = records.len(), "iterator started");

            let node = node.clone();
            let replier = replier.clone();
            let backend = runtime.backend.clone();
            tokio::spawn(async move {
                let total = records.len() as u64;
                let mut iterated = 0u64;
                for (key, record) in records {
                    ctl.wait_while_paused().await;
                    if ctl.cancelled() {
                        break;
                    }
                    // Backend service delay applies per streamed entry.
                    let delay = backend.delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    iterated += 1;
                    let response = IteratorResponse {
                        iterator_id,
                        status: 0,
                        iterated_keys: iterated,
                        total_keys: total,
                        key,
                        record_flags: record.record_flags,
                        user_flags: record.user_flags,
                        json_timestamp: record.json_timestamp,
                        json_size: record.json.len() as u64,
                        data_timestamp: record.data_timestamp,
                        data_size: record.data.len() as u64,
                        json: (flags & iterator_flags::JSON != 0)
                            .then(|| record.json.clone())
                            .unwrap_or_default(),
                        data: (flags & iterator_flags::DATA != 0)
                            .then(|| record.data.clone())
                            .unwrap_or_default(),
                    };
                    let Ok(body) = encode_body(&response) else {
                        break;
                    };
                    if replier
                        .part(
                            |h| {
                                h.key = key;
                            },
                            body,
                        )
                        .is_err()
                    {
                        break;
                    }
                }
                node.iterators.remove(iterator_id);
                let _ = replier.ack(0);
                tracing::info!(iterator_id, iterated, "iterator finished");
            });
        }
        IteratorRequest::Pause { iterator_id } => {
            iterator_ctl(node, replier, iterator_id, |ctl| {
                ctl.paused.store(true, Ordering::Release);
                ctl.notify.notify_waiters();
            });
        }
        IteratorRequest::Continue { iterator_id } => {
            iterator_ctl(node, replier, iterator_id, |ctl| {
                ctl.paused.store(false, Ordering::Release);
                ctl.notify.notify_waiters();
            });
        }
        IteratorRequest::Cancel { iterator_id } => {
            iterator_ctl(node, replier, iterator_id, |ctl| {
                ctl.cancelled.store(true, Ordering::Release);
                ctl.notify.notify_waiters();
            });
        }
    }
}

fn iterator_ctl(
    node: &Arc<NodeState>,
    replier: &Arc<Replier>,
    iterator_id: u64,
    apply: impl FnOnce(&IteratorCtl),
) {
    let Some(ctl) = node.iterators.get(iterator_id) else {
        let _ = replier.ack(ErrorCode::NotFound.status());
        return;
    };
    apply(&ctl);
    let response = IteratorResponse {
        iterator_id,
        ..Default::default()
    };
    match encode_body(&response) {
        Ok(body) => {
            let _ = replier.finish(0, body);
        }
        Err(_) => {
            let _ = replier.ack(ErrorCode::Protocol.status());
        }
    }
}
