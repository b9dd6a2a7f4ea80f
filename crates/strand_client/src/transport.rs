//! Command transport.
//!
//! Owns connections to peer nodes, the transaction table and the deadline
//! queue. A transaction lives in the table from send until its terminal
//! event; destruction always delivers exactly one terminal event to the
//! bound callback, whether it is a wire reply, a synthesized deadline or a
//! connection loss.

use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use strand_proto::body::RouteEntry;
use strand_proto::codec::CommandCodec;
use strand_proto::{cflags, CommandHeader, ErrorCode, Opcode, Packet};

use crate::error::{Error, Result};
use crate::handler::{Reply, ReplyCallback};

/// Transaction table shard count; ids are sharded by `trans % SHARDS`.
const TRANS_SHARDS: u64 = 19;

/// Dialing budget, separate from per-transaction deadlines.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct TransEntry {
    dst: SocketAddr,
    cmd: CommandHeader,
    callback: ReplyCallback,
}

struct NodeConn {
    tx: mpsc::UnboundedSender<Packet>,
}

pub struct Transport {
    shards: Vec<Mutex<HashMap<u64, TransEntry>>>,
    next_trans: AtomicU64,
    conns: tokio::sync::Mutex<HashMap<SocketAddr, Arc<NodeConn>>>,
    deadline_tx: mpsc::UnboundedSender<(Instant, u64)>,
}

impl Transport {
    pub fn new() -> Arc<Self> {
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            shards: (0..TRANS_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_trans: AtomicU64::new(0),
            conns: tokio::sync::Mutex::new(HashMap::new()),
            deadline_tx,
        });
        tokio::spawn(deadline_loop(Arc::downgrade(&transport), deadline_rx));
        transport
    }

    fn shard(&self, trans: u64) -> &Mutex<HashMap<u64, TransEntry>> {
        &self.shards[(trans % TRANS_SHARDS) as usize]
    }

    /// Send one command to `addr`. The callback observes every reply of the
    /// spawned transaction and exactly one terminal event.
    pub async fn send(
        self: &Arc<Self>,
        addr: SocketAddr,
        mut header: CommandHeader,
        body: Bytes,
        timeout: Duration,
        callback: ReplyCallback,
    ) -> u64 {
        let trans = self.next_trans.fetch_add(1, Ordering::Relaxed) + 1;
        header.trans = trans;
        header.size = body.len() as u64;

        if header.is_trace() {
            tracing::info!(opcode = %header.opcode, trans, %addr,
                flags = cflags::dump(header.flags), "sending command");
        } else {
            tracing::debug!(opcode = %header.opcode, trans, %addr, "sending command");
        }

        self.shard(trans).lock().unwrap().insert(
            trans,
            TransEntry {
                dst: addr,
                cmd: header,
                callback,
            },
        );
        let _ = self.deadline_tx.send((Instant::now() + timeout, trans));

        match self.conn(addr).await {
            Ok(conn) => {
                if conn.tx.send(Packet::new(header, body)).is_err() {
                    self.fail_trans(trans, ErrorCode::ConnectionReset, "send on closed connection");
                }
            }
            Err(err) => {
                self.fail_trans(trans, ErrorCode::ConnectionReset, err.message().to_string());
            }
        }
        trans
    }

    /// One-shot request helper: resolves with the terminal reply.
    pub async fn request_one(
        self: &Arc<Self>,
        addr: SocketAddr,
        header: CommandHeader,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(CommandHeader, Bytes)> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let callback: ReplyCallback = Arc::new(move |reply| {
            let resolved = match reply {
                Reply::Message {
                    cmd, body, last, ..
                } => {
                    if !last && cmd.status == 0 {
                        return;
                    }
                    if cmd.status != 0 {
                        Err(Error::from_status(cmd.status, "request failed"))
                    } else {
                        Ok((cmd, body))
                    }
                }
                Reply::Failure { error, .. } => Err(error),
            };
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(resolved);
            }
        });
        self.send(addr, header, body, timeout, callback).await;
        rx.await
            .map_err(|_| Error::new(ErrorCode::ConnectionReset, "request dropped"))?
    }

    /// Fetch the routing table advertised by one node.
    pub async fn fetch_route_list(
        self: &Arc<Self>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<RouteEntry>> {
        let mut header =
            CommandHeader::new(Opcode::RouteList, strand_proto::KeyId::ZERO, 0);
        header.flags = cflags::NEED_ACK | cflags::DIRECT;
        let (_, body) = self.request_one(addr, header, Bytes::new(), timeout).await?;
        let response: strand_proto::body::RouteListResponse =
            strand_proto::decode_body(&body)?;
        Ok(response.entries)
    }

    async fn conn(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<NodeConn>> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(&addr) {
            if !conn.tx.is_closed() {
                return Ok(conn.clone());
            }
            conns.remove(&addr);
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::new(ErrorCode::TimedOut, format!("connect to {addr} timed out")))?
            .map_err(|err| {
                Error::new(ErrorCode::ConnectionReset, format!("connect to {addr}: {err}"))
            })?;
        let _ = stream.set_nodelay(true);

        let framed = Framed::new(stream, CommandCodec);
        let (mut sink, stream) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(err) = sink.send(packet).await {
                    tracing::debug!(%addr, "writer stopped: {err}");
                    break;
                }
            }
        });
        tokio::spawn(reader_loop(Arc::downgrade(self), addr, stream));

        let conn = Arc::new(NodeConn { tx });
        conns.insert(addr, conn.clone());
        tracing::debug!(%addr, "connected");
        Ok(conn)
    }

    /// Complete one transaction with a synthesized failure.
    fn fail_trans(&self, trans: u64, code: ErrorCode, message: impl Into<String>) {
        let entry = self.shard(trans).lock().unwrap().remove(&trans);
        if let Some(entry) = entry {
            (entry.callback)(Reply::Failure {
                addr: Some(entry.dst),
                cmd: entry.cmd,
                error: Error::new(code, message),
            });
        }
    }

    /// Fail every in-flight transaction bound to a lost peer.
    fn drain_peer(&self, addr: SocketAddr) {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let dead: Vec<u64> = shard
                .iter()
                .filter(|(_, e)| e.dst == addr)
                .map(|(t, _)| *t)
                .collect();
            for trans in dead {
                if let Some(entry) = shard.remove(&trans) {
                    drained.push((trans, entry));
                }
            }
        }
        if !drained.is_empty() {
            tracing::warn!(%addr, count = drained.len(), "peer lost, draining transactions");
        }
        for (_, entry) in drained {
            (entry.callback)(Reply::Failure {
                addr: Some(addr),
                cmd: entry.cmd,
                error: Error::new(ErrorCode::ConnectionReset, format!("connection to {addr} lost")),
            });
        }
    }

    fn dispatch_reply(&self, addr: SocketAddr, packet: Packet) {
        let header = packet.header;
        if !header.is_reply() {
            tracing::debug!(%addr, opcode = %header.opcode, "non-reply packet ignored");
            return;
        }

        let last = !header.has_more();
        let callback = {
            let mut shard = self.shard(header.trans).lock().unwrap();
            if last {
                shard.remove(&header.trans).map(|e| e.callback)
            } else {
                shard.get(&header.trans).map(|e| e.callback.clone())
            }
        };

        match callback {
            Some(callback) => callback(Reply::Message {
                addr,
                cmd: header,
                body: packet.body,
                last,
            }),
            // Late replies to destroyed transactions are swallowed; the
            // terminal event has already been delivered.
            None => tracing::debug!(trans = header.trans, %addr, "reply for unknown transaction"),
        }
    }
}

async fn reader_loop(
    transport: Weak<Transport>,
    addr: SocketAddr,
    mut stream: futures_util::stream::SplitStream<Framed<TcpStream, CommandCodec>>,
) {
    loop {
        match stream.next().await {
            Some(Ok(packet)) => {
                let Some(transport) = transport.upgrade() else {
                    return;
                };
                transport.dispatch_reply(addr, packet);
            }
            Some(Err(err)) => {
                tracing::debug!(%addr, "reader error: {err}");
                break;
            }
            None => break,
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.conns.lock().await.remove(&addr);
        transport.drain_peer(addr);
    }
}

/// Deadline queue: a dedicated task popping the nearest deadline and
/// synthesizing TIMEDOUT for transactions still in the table.
async fn deadline_loop(
    transport: Weak<Transport>,
    mut rx: mpsc::UnboundedReceiver<(Instant, u64)>,
) {
    let mut heap: BinaryHeap<std::cmp::Reverse<(Instant, u64)>> = BinaryHeap::new();
    loop {
        let next_at = heap.peek().map(|entry| entry.0 .0);
        tokio::select! {
            registered = rx.recv() => match registered {
                Some((at, trans)) => heap.push(std::cmp::Reverse((at, trans))),
                None => return,
            },
            _ = async {
                match next_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    // Nothing queued; park until a registration arrives.
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                while let Some(std::cmp::Reverse((at, trans))) = heap.peek().copied() {
                    if at > now {
                        break;
                    }
                    heap.pop();
                    let Some(transport) = transport.upgrade() else {
                        return;
                    };
                    // Lazily ignores transactions that already completed.
                    transport.fail_trans(trans, ErrorCode::TimedOut, "transaction deadline");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn header(opcode: Opcode) -> CommandHeader {
        CommandHeader::new(opcode, strand_proto::KeyId::from_name(b"", b"k"), 1)
    }

    /// Test peer that answers every command with `parts` MORE-flagged
    /// replies followed by a terminal ack.
    async fn spawn_echo_peer(parts: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, CommandCodec);
                    while let Some(Ok(packet)) = framed.next().await {
                        let mut reply = packet.header;
                        reply.flags |= cflags::REPLY;
                        for _ in 0..parts {
                            let mut part = reply;
                            part.flags |= cflags::MORE;
                            let body = Bytes::from_static(b"part");
                            framed.send(Packet::new(part, body)).await.unwrap();
                        }
                        framed.send(Packet::new(reply, Bytes::new())).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    fn counting_callback() -> (ReplyCallback, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let replies = Arc::new(AtomicUsize::new(0));
        let finals = Arc::new(AtomicUsize::new(0));
        let (r, f) = (replies.clone(), finals.clone());
        let callback: ReplyCallback = Arc::new(move |reply| match reply {
            Reply::Message { last, .. } => {
                r.fetch_add(1, Ordering::SeqCst);
                if last {
                    f.fetch_add(1, Ordering::SeqCst);
                }
            }
            Reply::Failure { .. } => {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        (callback, replies, finals)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replies_route_to_their_transaction() {
        let peer = spawn_echo_peer(2).await;
        let transport = Transport::new();
        let (callback, replies, finals) = counting_callback();

        transport
            .send(
                peer,
                header(Opcode::Lookup),
                Bytes::new(),
                Duration::from_secs(5),
                callback,
            )
            .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while finals.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(replies.load(Ordering::SeqCst), 3);
        assert_eq!(finals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deadline_synthesizes_timedout() {
        // Peer accepts but never replies.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let transport = Transport::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let callback: ReplyCallback = Arc::new(move |reply| {
            if let Reply::Failure { error, .. } = reply {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(error);
                }
            }
        });

        transport
            .send(
                addr,
                header(Opcode::Read),
                Bytes::new(),
                Duration::from_millis(100),
                callback,
            )
            .await;

        let err = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(err.is(ErrorCode::TimedOut));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_peer_fails_transaction() {
        let transport = Transport::new();
        let (callback, _, finals) = counting_callback();
        // Port 1 on localhost refuses connections.
        transport
            .send(
                "127.0.0.1:1".parse().unwrap(),
                header(Opcode::Lookup),
                Bytes::new(),
                Duration::from_secs(5),
                callback,
            )
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while finals.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transaction_ids_are_unique_and_increasing() {
        let peer = spawn_echo_peer(0).await;
        let transport = Transport::new();
        let (callback, _, _) = counting_callback();
        let a = transport
            .send(peer, header(Opcode::Lookup), Bytes::new(), Duration::from_secs(5), callback.clone())
            .await;
        let b = transport
            .send(peer, header(Opcode::Lookup), Bytes::new(), Duration::from_secs(5), callback)
            .await;
        assert!(b > a);
    }
}
