//! Command transport server: connection handling, repliers and the
//! forwarding dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use strand_client::handler::{Reply, ReplyCallback};
use strand_proto::codec::CommandCodec;
use strand_proto::{cflags, CommandHeader, ErrorCode, Opcode, Packet};

use crate::io_pool::{Job, JobKind};
use crate::NodeState;

/// Per-request reply writer. Enforces the single-terminal-reply rule: the
/// second attempt to finish the same transaction returns `Already` and is
/// swallowed by callers after a debug log.
pub struct Replier {
    writer: mpsc::UnboundedSender<Packet>,
    req: CommandHeader,
    finished: AtomicBool,
}

impl Replier {
    pub fn new(writer: mpsc::UnboundedSender<Packet>, req: CommandHeader) -> Arc<Self> {
        Arc::new(Self {
            writer,
            req,
            finished: AtomicBool::new(false),
        })
    }

    pub fn request(&self) -> &CommandHeader {
        &self.req
    }

    fn base(&self) -> CommandHeader {
        let mut header = self.req;
        header.status = 0;
        header.size = 0;
        header.flags = cflags::REPLY | (self.req.flags & cflags::TRACE_BIT);
        header
    }

    fn send(&self, header: CommandHeader, body: Bytes) -> Result<(), ErrorCode> {
        self.writer
            .send(Packet::new(header, body))
            .map_err(|_| ErrorCode::ConnectionReset)
    }

    /// Non-terminal part of a multi-part response.
    pub fn part(
        &self,
        adjust: impl FnOnce(&mut CommandHeader),
        body: Bytes,
    ) -> Result<(), ErrorCode> {
        if self.finished.load(Ordering::Acquire) {
            return Err(ErrorCode::Already);
        }
        let mut header = self.base();
        header.flags |= cflags::MORE;
        adjust(&mut header);
        self.send(header, body)
    }

    /// Terminal reply; at most one per transaction.
    pub fn finish(&self, status: i32, body: Bytes) -> Result<(), ErrorCode> {
        if self.finished.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                trans = self.req.trans,
                opcode = %self.req.opcode,
                "duplicate terminal reply suppressed"
            );
            return Err(ErrorCode::Already);
        }
        let mut header = self.base();
        header.status = status;
        self.send(header, body)
    }

    /// Terminal acknowledgement without payload.
    pub fn ack(&self, status: i32) -> Result<(), ErrorCode> {
        self.finish(status, Bytes::new())
    }

    /// Relay a reply received on behalf of a forwarded transaction, keeping
    /// the origin's status, addressing fields and MORE flag.
    pub fn relay(&self, cmd: CommandHeader, body: Bytes, last: bool) -> Result<(), ErrorCode> {
        if last {
            if self.finished.swap(true, Ordering::AcqRel) {
                return Err(ErrorCode::Already);
            }
        } else if self.finished.load(Ordering::Acquire) {
            return Err(ErrorCode::Already);
        }
        let mut header = self.base();
        header.key = cmd.key;
        header.group = cmd.group;
        header.backend = cmd.backend;
        header.status = cmd.status;
        if !last {
            header.flags |= cflags::MORE;
        }
        self.send(header, body)
    }
}

/// Accept loop for the command port.
pub async fn serve(node: Arc<NodeState>, listener: TcpListener) {
    let limit = Arc::new(tokio::sync::Semaphore::new(node.config.net_thread_num.max(1)));
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                continue;
            }
        };
        let Ok(permit) = limit.clone().acquire_owned().await else {
            return;
        };
        let node = node.clone();
        tokio::spawn(async move {
            let _permit = permit;
            connection(node, socket, peer).await;
        });
    }
}

async fn connection(node: Arc<NodeState>, socket: TcpStream, peer: SocketAddr) {
    let _ = socket.set_nodelay(true);
    let framed = Framed::new(socket, CommandCodec);
    let (mut sink, mut stream) = framed.split();
    let (writer, mut writer_rx) = mpsc::unbounded_channel::<Packet>();

    tokio::spawn(async move {
        while let Some(packet) = writer_rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!(%peer, "connection accepted");
    while let Some(frame) = stream.next().await {
        let packet = match frame {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(%peer, "connection dropped: {err}");
                break;
            }
        };
        dispatch_packet(&node, &writer, peer, packet).await;
    }
    tracing::debug!(%peer, "connection closed");
}

/// Route one inbound command: fast ops bypass the backend queues, data ops
/// queue on their backend, everything else is forwarded or refused.
async fn dispatch_packet(
    node: &Arc<NodeState>,
    writer: &mpsc::UnboundedSender<Packet>,
    peer: SocketAddr,
    packet: Packet,
) {
    let header = packet.header;
    node.count_command(header.opcode);
    if header.is_trace() {
        tracing::info!(%peer, opcode = %header.opcode, trans = header.trans,
            flags = cflags::dump(header.flags), "command received");
    }

    let replier = Replier::new(writer.clone(), header);
    match header.opcode {
        Opcode::RouteList
        | Opcode::Stat
        | Opcode::Status
        | Opcode::BackendControl
        | Opcode::Iterator => {
            node.fast_pool().submit_or_fail(Job {
                enqueued: Instant::now(),
                no_queue_timeout: true,
                kind: JobKind::Command { packet, replier },
            });
        }
        _ => {
            let runtime = if header.flags & cflags::DIRECT_BACKEND != 0 {
                node.backend_by_id(header.backend)
            } else {
                node.backend_for_group(header.group)
            };

            match runtime {
                Some(runtime) => {
                    let no_queue_timeout = header.flags & cflags::NO_QUEUE_TIMEOUT != 0;
                    runtime.submit_or_fail(Job {
                        enqueued: Instant::now(),
                        no_queue_timeout,
                        kind: JobKind::Command { packet, replier },
                    });
                }
                None if header.flags & (cflags::DIRECT | cflags::DIRECT_BACKEND) != 0 => {
                    let _ = replier.ack(ErrorCode::NotSupported.status());
                }
                None => forward_command(node, packet, replier).await,
            }
        }
    }
}

/// Run the dispatcher on the client's behalf: locate the owner of the
/// command's group/key, send with this node's wait timeout as the deadline,
/// relay every reply back on the original transaction.
async fn forward_command(node: &Arc<NodeState>, packet: Packet, replier: Arc<Replier>) {
    let mut header = packet.header;
    let Some(entry) = node
        .cluster
        .route()
        .locate(header.group, &header.key)
        .filter(|entry| entry.addr != node.addr)
    else {
        tracing::debug!(group = header.group, opcode = %header.opcode,
            "cannot forward: group unknown");
        let _ = replier.ack(ErrorCode::NotSupported.status());
        return;
    };

    header.trans = 0;
    header.flags &= !(cflags::REPLY | cflags::MORE);

    tracing::debug!(opcode = %header.opcode, group = header.group,
        owner = %entry.addr, "forwarding command");

    let callback: ReplyCallback = {
        let replier = replier.clone();
        Arc::new(move |reply| match reply {
            Reply::Message {
                cmd, body, last, ..
            } => {
                if let Err(code) = replier.relay(cmd, body, last) {
                    tracing::debug!(trans = cmd.trans, ?code, "relay suppressed");
                }
            }
            Reply::Failure { error, .. } => {
                let _ = replier.ack(error.status());
            }
        })
    };

    node.cluster
        .transport()
        .send(
            entry.addr,
            header,
            packet.body,
            node.config.wait_timeout(),
            callback,
        )
        .await;
}
