//! Storage node for the strand distributed object store.
//!
//! A node serves the command transport (framed fixed-header commands), the
//! streaming transport (chunked reads/writes over a completion queue) and
//! forwards commands for groups it does not own. Nodes are embeddable: tests
//! boot them in process through [`start_node`].

pub mod backend;
pub mod config;
pub mod handlers;
pub mod io_pool;
pub mod server;
pub mod stream;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use strand_client::Cluster;
use strand_proto::body::RouteEntry;
use strand_proto::{KeyId, Opcode};

use crate::backend::Backend;
use crate::config::NodeConfig;
use crate::handlers::IteratorRegistry;
use crate::io_pool::{IoPool, Job};

pub use crate::config::BackendConfig;

/// One backend plus its i/o pool.
pub struct BackendRuntime {
    pub backend: Arc<Backend>,
    pool: OnceLock<IoPool>,
}

impl BackendRuntime {
    pub fn submit_or_fail(&self, job: Job) {
        match self.pool.get() {
            Some(pool) => pool.submit_or_fail(job),
            None => tracing::error!("backend pool not started"),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.pool.get().map(|pool| pool.depth()).unwrap_or(0)
    }
}

pub struct NodeState {
    pub config: NodeConfig,
    /// Actual command listen address after binding.
    pub addr: SocketAddr,
    pub stream_addr: Option<SocketAddr>,
    backends: Vec<Arc<BackendRuntime>>,
    /// Client-engine handle used for forwarding and route knowledge.
    pub cluster: Arc<Cluster>,
    pub iterators: IteratorRegistry,
    pub status: AtomicU64,
    fast_pool: OnceLock<IoPool>,
    counters: Mutex<BTreeMap<&'static str, u64>>,
    started: Instant,
}

impl NodeState {
    pub fn backend_for_group(&self, group: u32) -> Option<Arc<BackendRuntime>> {
        self.backends
            .iter()
            .find(|rt| rt.backend.group == group)
            .cloned()
    }

    pub fn backend_by_id(&self, backend_id: u32) -> Option<Arc<BackendRuntime>> {
        self.backends
            .iter()
            .find(|rt| rt.backend.backend_id == backend_id)
            .cloned()
    }

    pub fn backends(&self) -> &[Arc<BackendRuntime>] {
        &self.backends
    }

    pub(crate) fn fast_pool(&self) -> &IoPool {
        self.fast_pool.get().expect("fast pool started with node")
    }

    pub(crate) fn count_command(&self, opcode: Opcode) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(opcode.as_str())
            .or_insert(0) += 1;
    }

    /// JSON stat document served to `stat` requests.
    pub fn stat_payload(&self, categories: u64) -> serde_json::Value {
        self.stat_payload_for(categories, None)
    }

    /// Stat document scoped to one backend when `backend_id` is set.
    pub fn stat_payload_for(
        &self,
        categories: u64,
        backend_id: Option<u32>,
    ) -> serde_json::Value {
        use strand_proto::body::stat_categories as cat;

        let selected: Vec<&Arc<BackendRuntime>> = self
            .backends
            .iter()
            .filter(|rt| backend_id.is_none() || backend_id == Some(rt.backend.backend_id))
            .collect();

        let mut payload = serde_json::json!({
            "address": self.addr,
            "uptime_s": self.started.elapsed().as_secs(),
            "status": self.status.load(Ordering::Relaxed),
        });

        if categories & cat::BACKENDS != 0 {
            let backends: Vec<serde_json::Value> = selected
                .iter()
                .map(|rt| {
                    serde_json::json!({
                        "backend_id": rt.backend.backend_id,
                        "group": rt.backend.group,
                        "enabled": rt.backend.enabled(),
                        "delay_ms": rt.backend.delay().as_millis() as u64,
                        "records": rt.backend.record_count(),
                    })
                })
                .collect();
            payload["backends"] = serde_json::Value::from(backends);
        }

        if categories & cat::IO_QUEUES != 0 {
            let queues: Vec<serde_json::Value> = selected
                .iter()
                .map(|rt| {
                    serde_json::json!({
                        "backend_id": rt.backend.backend_id,
                        "depth": rt.queue_depth(),
                        "queue_timeout_s": rt.backend.queue_timeout.as_secs(),
                    })
                })
                .collect();
            payload["io_queues"] = serde_json::Value::from(queues);
        }

        if categories & cat::COMMANDS != 0 {
            let counters = self.counters.lock().unwrap();
            payload["commands"] = serde_json::json!(&*counters);
        }

        payload
    }

    /// Routing entries this node advertises for itself.
    fn self_routes(&self) -> Vec<RouteEntry> {
        self.backends
            .iter()
            .filter(|rt| rt.backend.enabled())
            .map(|rt| RouteEntry {
                group: rt.backend.group,
                backend_id: rt.backend.backend_id,
                id_begin: KeyId::ZERO,
                addr: self.addr,
            })
            .collect()
    }
}

/// Running node handle. Dropping it aborts every task the node spawned.
pub struct NodeHandle {
    pub addr: SocketAddr,
    pub stream_addr: Option<SocketAddr>,
    pub state: Arc<NodeState>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Merge a peer's routing table into this node, enabling forwarding to
    /// it.
    pub async fn add_remote(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.state
            .cluster
            .add_remote(addr)
            .await
            .map_err(|err| anyhow::anyhow!("route exchange with {addr}: {err}"))
    }

    pub fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Boot a node: bind listeners, start pools, advertise self routes and pull
/// routes from configured remotes.
pub async fn start_node(config: NodeConfig) -> anyhow::Result<NodeHandle> {
    let listener = TcpListener::bind(config.address)
        .await
        .with_context(|| format!("binding {}", config.address))?;
    let addr = listener.local_addr()?;

    let stream_listener = match config.stream_address {
        Some(stream_address) => Some(
            TcpListener::bind(stream_address)
                .await
                .with_context(|| format!("binding stream {stream_address}"))?,
        ),
        None => None,
    };
    let stream_addr = stream_listener
        .as_ref()
        .map(|l| l.local_addr())
        .transpose()?;

    let cluster = Cluster::connect(&[])
        .await
        .map_err(|err| anyhow::anyhow!("cluster bootstrap: {err}"))?;

    let backends: Vec<Arc<BackendRuntime>> = config
        .backends
        .iter()
        .filter(|b| b.enable)
        .map(|b| {
            Arc::new(BackendRuntime {
                backend: Arc::new(Backend::new(
                    b.backend_id,
                    b.group,
                    config.queue_timeout_for(b),
                    config.caches_number,
                )),
                pool: OnceLock::new(),
            })
        })
        .collect();

    let state = Arc::new(NodeState {
        addr,
        stream_addr,
        backends,
        cluster,
        iterators: IteratorRegistry::default(),
        status: AtomicU64::new(0),
        fast_pool: OnceLock::new(),
        counters: Mutex::new(BTreeMap::new()),
        started: Instant::now(),
        config,
    });

    let mut tasks = Vec::new();

    for runtime in &state.backends {
        let (pool, workers) = IoPool::start(
            state.clone(),
            Some(runtime.backend.clone()),
            state.config.io_thread_num,
        );
        runtime
            .pool
            .set(pool)
            .unwrap_or_else(|_| unreachable!("pool set once per backend"));
        tasks.extend(workers);
    }

    let (fast_pool, fast_workers) =
        IoPool::start(state.clone(), None, state.config.nonblocking_io_thread_num);
    state
        .fast_pool
        .set(fast_pool)
        .unwrap_or_else(|_| unreachable!("fast pool set once"));
    tasks.extend(fast_workers);

    // The node knows its own routes before serving anything.
    state.cluster.route().apply(&state.self_routes());
    for remote in state.config.remotes.clone() {
        if let Err(err) = state.cluster.add_remote(remote).await {
            tracing::warn!(%remote, "route exchange failed: {err}");
        }
    }

    tasks.push(tokio::spawn(server::serve(state.clone(), listener)));

    if let Some(stream_listener) = stream_listener {
        let queue = stream::CompletionQueue::new();
        tasks.extend(stream::start_workers(queue.clone(), state.config.thread_num));
        tasks.push(tokio::spawn(stream::serve(
            state.clone(),
            stream_listener,
            queue,
        )));
    }

    tracing::info!(%addr, stream = ?stream_addr, backends = state.backends.len(),
        "node started");

    Ok(NodeHandle {
        addr,
        stream_addr,
        state,
        tasks,
    })
}
