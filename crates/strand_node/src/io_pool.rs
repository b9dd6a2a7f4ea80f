//! Per-backend i/o pools.
//!
//! Each backend owns a bounded FIFO drained by a fixed set of workers. A job
//! that waited in the queue longer than the backend's queue timeout is
//! dropped with a TIMEDOUT ack instead of being served, so the client learns
//! about the overload immediately rather than at its session deadline.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use strand_proto::{ErrorCode, Packet};

use crate::backend::Backend;
use crate::server::Replier;
use crate::stream::{ReadJob, WriteJob};
use crate::{handlers, NodeState};

/// Bounded FIFO depth per pool.
const QUEUE_CAPACITY: usize = 4096;

pub enum JobKind {
    Command {
        packet: Packet,
        replier: Arc<Replier>,
    },
    StreamRead(Arc<ReadJob>),
    StreamWrite(Arc<WriteJob>),
}

pub struct Job {
    pub enqueued: Instant,
    pub no_queue_timeout: bool,
    pub kind: JobKind,
}

impl Job {
    /// Terminate the job without serving it.
    fn fail(self, code: ErrorCode) {
        match self.kind {
            JobKind::Command { replier, .. } => {
                let _ = replier.ack(code.status());
            }
            JobKind::StreamRead(job) => job.fail(code),
            JobKind::StreamWrite(job) => job.fail(code),
        }
    }
}

#[derive(Clone)]
pub struct IoPool {
    tx: mpsc::Sender<Job>,
}

impl IoPool {
    /// Start `workers` tasks draining one bounded queue. `backend` is absent
    /// for the fast pool serving queue-exempt commands.
    pub fn start(
        node: Arc<NodeState>,
        backend: Option<Arc<Backend>>,
        workers: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|_| {
                let node = node.clone();
                let backend = backend.clone();
                let rx = rx.clone();
                tokio::spawn(worker(node, backend, rx))
            })
            .collect();
        (Self { tx }, handles)
    }

    /// Enqueue or refuse: a full queue fails the job with NO_MEMORY so the
    /// caller is never silently dropped.
    pub fn submit_or_fail(&self, job: Job) {
        if let Err(err) = self.tx.try_send(job) {
            let job = match err {
                mpsc::error::TrySendError::Full(job) => {
                    tracing::warn!("i/o queue full, refusing job");
                    job
                }
                mpsc::error::TrySendError::Closed(job) => job,
            };
            job.fail(ErrorCode::NoMemory);
        }
    }

    /// Current queue depth, surfaced by the stat payload.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

async fn worker(
    node: Arc<NodeState>,
    backend: Option<Arc<Backend>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            return;
        };

        if let Some(backend) = &backend {
            // Queue-timeout check happens at decouple time, not at enqueue.
            let waited = job.enqueued.elapsed();
            if !job.no_queue_timeout && waited > backend.queue_timeout {
                tracing::warn!(
                    backend = backend.backend_id,
                    waited_ms = waited.as_millis() as u64,
                    "request waited past queue timeout, dropping with ack"
                );
                job.fail(ErrorCode::TimedOut);
                continue;
            }

            let delay = backend.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        match job.kind {
            JobKind::Command { packet, replier } => {
                handlers::execute_command(&node, backend.as_deref(), packet, replier).await;
            }
            JobKind::StreamRead(stream_job) => {
                if let Some(backend) = &backend {
                    stream_job.execute(backend).await;
                } else {
                    stream_job.fail(ErrorCode::NotSupported);
                }
            }
            JobKind::StreamWrite(stream_job) => {
                if let Some(backend) = &backend {
                    stream_job.execute(backend).await;
                } else {
                    stream_job.fail(ErrorCode::NotSupported);
                }
            }
        }
    }
}
