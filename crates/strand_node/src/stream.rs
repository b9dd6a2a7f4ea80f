//! Streaming RPC subsystem.
//!
//! Chunked reads and writes are driven by tag state machines attached to a
//! completion queue. A pool of workers loops `queue.next() -> tag.proceed(ok)`;
//! every wait a machine performs is expressed as a pending queue signal:
//! demuxed inbound frames and writer flush acknowledgements both land here.
//! A `proceed(ok=false)` at any pre-terminal state transitions the machine
//! straight to terminal; errors returned by `proceed` are caught by the
//! worker loop and never unwind further.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use strand_proto::body::{ReadRequest, ReadResponse, WriteRequest};
use strand_proto::stream::{
    chunk_budget, ReadStreamHeader, StreamCodec, StreamFrame, StreamMessage, WriteStreamHeader,
};
use strand_proto::{CommandHeader, ErrorCode};

use crate::backend::Backend;
use crate::io_pool::{Job, JobKind};
use crate::NodeState;

/// A completion-queue tag: an outstanding streaming operation.
#[async_trait]
pub trait Tag: Send + Sync {
    async fn proceed(self: Arc<Self>, ok: bool) -> anyhow::Result<()>;
}

pub type TagRef = Arc<dyn Tag>;

/// The queue every streaming wait is parked on.
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<(TagRef, bool)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(TagRef, bool)>>,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn post(&self, tag: TagRef, ok: bool) {
        let _ = self.tx.send((tag, ok));
    }

    async fn next(&self) -> Option<(TagRef, bool)> {
        self.rx.lock().await.recv().await
    }
}

/// Fixed worker pool draining the completion queue.
pub fn start_workers(queue: Arc<CompletionQueue>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some((tag, ok)) = queue.next().await {
                    if let Err(err) = tag.proceed(ok).await {
                        tracing::warn!("stream tag failed: {err:#}");
                    }
                }
            })
        })
        .collect()
}

/// Outbound frame plus the tag to signal once the frame is flushed.
type Outbound = (StreamFrame, Option<TagRef>);

/// Shared per-connection streaming state.
pub struct StreamConn {
    node: Arc<NodeState>,
    queue: Arc<CompletionQueue>,
    writer: mpsc::UnboundedSender<Outbound>,
    write_jobs: Mutex<HashMap<u64, Arc<WriteJob>>>,
}

impl StreamConn {
    fn send_error(&self, stream_id: u64, code: ErrorCode, message: impl Into<String>) {
        let _ = self.writer.send((
            StreamFrame {
                stream_id,
                message: StreamMessage::Error {
                    status: code.status(),
                    message: message.into(),
                },
            },
            None,
        ));
    }
}

/// Accept loop for the streaming port.
pub async fn serve(node: Arc<NodeState>, listener: TcpListener, queue: Arc<CompletionQueue>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("stream accept failed: {err}");
                continue;
            }
        };
        let node = node.clone();
        let queue = queue.clone();
        tokio::spawn(stream_connection(node, queue, socket, peer));
    }
}

async fn stream_connection(
    node: Arc<NodeState>,
    queue: Arc<CompletionQueue>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let _ = socket.set_nodelay(true);
    let framed = Framed::new(socket, StreamCodec);
    let (mut sink, mut stream) = framed.split();
    let (writer, mut writer_rx) = mpsc::unbounded_channel::<Outbound>();

    let flush_queue = queue.clone();
    tokio::spawn(async move {
        while let Some((frame, ack)) = writer_rx.recv().await {
            let ok = sink.send(frame).await.is_ok();
            if let Some(tag) = ack {
                flush_queue.post(tag, ok);
            }
            if !ok {
                break;
            }
        }
    });

    let conn = Arc::new(StreamConn {
        node,
        queue: queue.clone(),
        writer,
        write_jobs: Mutex::new(HashMap::new()),
    });

    tracing::debug!(%peer, "stream connection accepted");
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%peer, "stream connection dropped: {err}");
                break;
            }
        };
        demux(&conn, frame);
    }

    // Drain pending machines with ok=false so every tag reaches terminal.
    let pending: Vec<Arc<WriteJob>> = conn.write_jobs.lock().unwrap().values().cloned().collect();
    for job in pending {
        queue.post(job, false);
    }
    tracing::debug!(%peer, "stream connection closed");
}

/// Route one inbound frame to its state machine, spawning a fresh machine
/// per newly accepted request.
fn demux(conn: &Arc<StreamConn>, frame: StreamFrame) {
    let stream_id = frame.stream_id;
    match frame.message {
        StreamMessage::ReadRequest {
            cmd,
            ioflags: _,
            read_flags,
            data_offset,
            data_size,
        } => {
            let job = ReadJob::new(
                conn,
                stream_id,
                cmd,
                ReadRequest {
                    ioflags: 0,
                    read_flags,
                    data_offset,
                    data_size,
                    deadline: None,
                },
            );
            conn.queue.post(job, true);
        }
        StreamMessage::WriteRequest {
            header,
            json_chunk,
            data_chunk,
        } => {
            let job = {
                let mut jobs = conn.write_jobs.lock().unwrap();
                jobs.entry(stream_id)
                    .or_insert_with(|| WriteJob::new(conn, stream_id))
                    .clone()
            };
            job.push(Some((header, json_chunk, data_chunk)));
            conn.queue.post(job, true);
        }
        StreamMessage::WritesDone => {
            let job = conn.write_jobs.lock().unwrap().get(&stream_id).cloned();
            match job {
                Some(job) => {
                    job.push(None);
                    conn.queue.post(job, true);
                }
                None => conn.send_error(stream_id, ErrorCode::Protocol, "no write stream open"),
            }
        }
        other => {
            tracing::debug!(stream_id, "unexpected inbound stream message: {other:?}");
            conn.send_error(stream_id, ErrorCode::Protocol, "unexpected message kind");
        }
    }
}

// --- server-streaming read ------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadPhase {
    RequestWaiting,
    ResponsePartial,
    ResponseComplete,
}

struct ReadState {
    phase: ReadPhase,
    response: Option<ReadResponse>,
    json_offset: usize,
    data_offset: usize,
}

/// Server-streaming read machine: accept the request, push it through the
/// owning backend's i/o queue, then emit the header and payload chunks,
/// finishing atomically with the last chunk.
pub struct ReadJob {
    conn: Weak<StreamConn>,
    stream_id: u64,
    cmd: CommandHeader,
    request: ReadRequest,
    state: Mutex<ReadState>,
}

impl ReadJob {
    fn new(
        conn: &Arc<StreamConn>,
        stream_id: u64,
        cmd: CommandHeader,
        request: ReadRequest,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::downgrade(conn),
            stream_id,
            cmd,
            request,
            state: Mutex::new(ReadState {
                phase: ReadPhase::RequestWaiting,
                response: None,
                json_offset: 0,
                data_offset: 0,
            }),
        })
    }

    /// Executed on the backend i/o pool once the job is decoupled from the
    /// queue.
    pub async fn execute(self: &Arc<Self>, backend: &Backend) {
        match backend.read(&self.cmd.key, &self.request) {
            Ok(response) => {
                self.state.lock().unwrap().response = Some(response);
                self.send_next(true);
            }
            Err(err) => self.fail_status(err.status(), err.message().to_string()),
        }
    }

    /// Terminate without a payload, e.g. on queue timeout.
    pub fn fail(self: &Arc<Self>, code: ErrorCode) {
        self.fail_status(code.status(), code.to_string());
    }

    fn fail_status(&self, status: i32, message: String) {
        self.state.lock().unwrap().phase = ReadPhase::ResponseComplete;
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.writer.send((
                StreamFrame {
                    stream_id: self.stream_id,
                    message: StreamMessage::Error { status, message },
                },
                None,
            ));
        }
    }

    /// Emit the next response part, greedily filling the message cap.
    fn send_next(self: &Arc<Self>, first: bool) {
        let Some(conn) = self.conn.upgrade() else {
            self.state.lock().unwrap().phase = ReadPhase::ResponseComplete;
            return;
        };

        let mut state = self.state.lock().unwrap();
        let Some(response) = state.response.take() else {
            state.phase = ReadPhase::ResponseComplete;
            return;
        };

        let header = first.then(|| ReadStreamHeader {
            cmd: Some(self.cmd),
            record_flags: response.record_flags,
            user_flags: response.user_flags,
            json_timestamp: response.json_timestamp,
            json_size: response.json_size,
            json_capacity: response.json_capacity,
            read_json_size: response.read_json_size,
            data_timestamp: response.data_timestamp,
            data_size: response.data_size,
            read_data_offset: response.read_data_offset,
            read_data_size: response.read_data_size,
        });

        let mut used = 0usize;
        let json_take = chunk_budget(used).min(response.json.len() - state.json_offset);
        let json_chunk = response.json[state.json_offset..state.json_offset + json_take].to_vec();
        state.json_offset += json_take;
        used += json_take;

        let data_take = chunk_budget(used).min(response.data.len() - state.data_offset);
        let data_chunk = response.data[state.data_offset..state.data_offset + data_take].to_vec();
        state.data_offset += data_take;

        // A part is non-terminal while either payload has bytes left; the
        // final part is written-and-finished in one message.
        let last =
            state.json_offset == response.json.len() && state.data_offset == response.data.len();
        state.phase = if last {
            ReadPhase::ResponseComplete
        } else {
            ReadPhase::ResponsePartial
        };
        state.response = Some(response);
        drop(state);

        let sent = conn.writer.send((
            StreamFrame {
                stream_id: self.stream_id,
                message: StreamMessage::ReadResponse {
                    header,
                    json_chunk,
                    data_chunk,
                    last,
                },
            },
            Some(self.clone() as TagRef),
        ));
        if sent.is_err() {
            self.state.lock().unwrap().phase = ReadPhase::ResponseComplete;
        }
    }
}

#[async_trait]
impl Tag for ReadJob {
    async fn proceed(self: Arc<Self>, ok: bool) -> anyhow::Result<()> {
        if !ok {
            self.state.lock().unwrap().phase = ReadPhase::ResponseComplete;
            return Ok(());
        }

        let phase = self.state.lock().unwrap().phase;
        match phase {
            ReadPhase::RequestWaiting => {
                let Some(conn) = self.conn.upgrade() else {
                    return Ok(());
                };
                match conn.node.backend_for_group(self.cmd.group) {
                    Some(runtime) => runtime.submit_or_fail(Job {
                        enqueued: Instant::now(),
                        no_queue_timeout: false,
                        kind: JobKind::StreamRead(self.clone()),
                    }),
                    None => self.fail(ErrorCode::NotSupported),
                }
            }
            ReadPhase::ResponsePartial => self.send_next(false),
            // Flush ack of the final part; the tag frees itself when the
            // last reference drops.
            ReadPhase::ResponseComplete => {}
        }
        Ok(())
    }
}

// --- client-streaming write -----------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WritePhase {
    RequestWaitingFirst,
    RequestWaitingNext,
    Processing,
    ResponseComplete,
}

type WritePart = Option<(Option<WriteStreamHeader>, Vec<u8>, Vec<u8>)>;

struct WriteState {
    phase: WritePhase,
    /// Demuxed inbound parts awaiting a worker; sharing the state lock keeps
    /// append order identical to arrival order across pool workers.
    mailbox: VecDeque<WritePart>,
    header: Option<WriteStreamHeader>,
    json: Vec<u8>,
    data: Vec<u8>,
}

/// Client-streaming write machine: header first, contiguous payload
/// appends, then verification and one lookup-shaped response.
pub struct WriteJob {
    conn: Weak<StreamConn>,
    stream_id: u64,
    state: Mutex<WriteState>,
}

impl WriteJob {
    fn new(conn: &Arc<StreamConn>, stream_id: u64) -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::downgrade(conn),
            stream_id,
            state: Mutex::new(WriteState {
                phase: WritePhase::RequestWaitingFirst,
                mailbox: VecDeque::new(),
                header: None,
                json: Vec::new(),
                data: Vec::new(),
            }),
        })
    }

    fn push(&self, part: WritePart) {
        self.state.lock().unwrap().mailbox.push_back(part);
    }

    pub fn fail(self: &Arc<Self>, code: ErrorCode) {
        self.fail_message(code, code.to_string());
    }

    fn fail_message(self: &Arc<Self>, code: ErrorCode, message: impl Into<String>) {
        self.state.lock().unwrap().phase = WritePhase::ResponseComplete;
        if let Some(conn) = self.conn.upgrade() {
            conn.write_jobs.lock().unwrap().remove(&self.stream_id);
            conn.send_error(self.stream_id, code, message);
        }
    }

    /// Executed on the backend i/o pool with the fully assembled request.
    pub async fn execute(self: &Arc<Self>, backend: &Backend) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let (request, cmd) = {
            let mut state = self.state.lock().unwrap();
            let Some(header) = state.header.take() else {
                drop(state);
                self.fail_message(ErrorCode::Protocol, "write stream lost its header");
                return;
            };
            let cmd = header.cmd;
            let request = WriteRequest {
                ioflags: header.ioflags,
                user_flags: header.user_flags,
                json_timestamp: header.json_timestamp,
                json_capacity: header.json_capacity,
                json: std::mem::take(&mut state.json),
                data_timestamp: header.data_timestamp,
                data_offset: header.data_offset,
                data_capacity: header.data_capacity,
                data_commit_size: header.data_commit_size,
                data: std::mem::take(&mut state.data),
                cache_lifetime: header.cache_lifetime,
                expected_data_checksum: None,
                deadline: None,
            };
            (request, cmd)
        };
        let Some(cmd) = cmd else {
            self.fail_message(ErrorCode::Protocol, "write stream missing command header");
            return;
        };

        let (status, response) = match backend.write(&cmd.key, &request) {
            Ok(response) => (0, Some(response)),
            Err(err) => (err.status(), None),
        };

        self.state.lock().unwrap().phase = WritePhase::ResponseComplete;
        let _ = conn.writer.send((
            StreamFrame {
                stream_id: self.stream_id,
                message: StreamMessage::WriteResponse { status, response },
            },
            Some(self.clone() as TagRef),
        ));
    }

    fn append(
        state: &mut WriteState,
        header: Option<WriteStreamHeader>,
        json_chunk: &[u8],
        data_chunk: &[u8],
        first: bool,
    ) -> Result<(), String> {
        if first {
            let header = header.ok_or("first write message carries no header")?;
            state.json = Vec::with_capacity(header.json_size as usize);
            state.data = Vec::with_capacity(header.data_size as usize);
            state.header = Some(header);
        }
        let declared = state.header.as_ref().expect("header set on first message");
        if state.json.len() + json_chunk.len() > declared.json_size as usize {
            return Err("json payload overflows declared size".into());
        }
        if state.data.len() + data_chunk.len() > declared.data_size as usize {
            return Err("data payload overflows declared size".into());
        }
        state.json.extend_from_slice(json_chunk);
        state.data.extend_from_slice(data_chunk);
        Ok(())
    }
}

#[async_trait]
impl Tag for WriteJob {
    async fn proceed(self: Arc<Self>, ok: bool) -> anyhow::Result<()> {
        if !ok {
            let phase = {
                let mut state = self.state.lock().unwrap();
                std::mem::replace(&mut state.phase, WritePhase::ResponseComplete)
            };
            if phase != WritePhase::ResponseComplete {
                if let Some(conn) = self.conn.upgrade() {
                    conn.write_jobs.lock().unwrap().remove(&self.stream_id);
                }
            }
            return Ok(());
        }

        // Pop-and-apply happens under one lock so parts from concurrent pool
        // workers land in arrival order; side effects run after unlocking.
        enum Step {
            Idle,
            Failed(String),
            PushDownstream(Option<u32>),
            Cleanup,
        }

        let step = {
            let mut state = self.state.lock().unwrap();
            match state.phase {
                WritePhase::RequestWaitingFirst | WritePhase::RequestWaitingNext => {
                    match state.mailbox.pop_front() {
                        Some(Some((header, json_chunk, data_chunk))) => {
                            let first = state.phase == WritePhase::RequestWaitingFirst;
                            match WriteJob::append(
                                &mut state,
                                header,
                                &json_chunk,
                                &data_chunk,
                                first,
                            ) {
                                Ok(()) => {
                                    state.phase = WritePhase::RequestWaitingNext;
                                    Step::Idle
                                }
                                Err(message) => Step::Failed(message),
                            }
                        }
                        Some(None) => {
                            // End of stream: the assembled payload must match
                            // the declared sizes exactly.
                            let complete = state.header.as_ref().is_some_and(|h| {
                                state.json.len() as u64 == h.json_size
                                    && state.data.len() as u64 == h.data_size
                            });
                            if complete {
                                state.phase = WritePhase::Processing;
                                let group = state
                                    .header
                                    .as_ref()
                                    .and_then(|h| h.cmd)
                                    .map(|cmd| cmd.group);
                                Step::PushDownstream(group)
                            } else {
                                Step::Failed("incomplete write stream payload".into())
                            }
                        }
                        None => Step::Idle,
                    }
                }
                WritePhase::Processing => Step::Idle,
                WritePhase::ResponseComplete => Step::Cleanup,
            }
        };

        match step {
            Step::Idle => {}
            Step::Failed(message) => self.fail_message(ErrorCode::Protocol, message),
            Step::PushDownstream(group) => {
                let Some(conn) = self.conn.upgrade() else {
                    return Ok(());
                };
                match group.and_then(|g| conn.node.backend_for_group(g)) {
                    Some(runtime) => runtime.submit_or_fail(Job {
                        enqueued: Instant::now(),
                        no_queue_timeout: false,
                        kind: JobKind::StreamWrite(self.clone()),
                    }),
                    None => self.fail(ErrorCode::NotSupported),
                }
            }
            Step::Cleanup => {
                if let Some(conn) = self.conn.upgrade() {
                    conn.write_jobs.lock().unwrap().remove(&self.stream_id);
                }
            }
        }
        Ok(())
    }
}
