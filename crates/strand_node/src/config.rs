//! Node configuration.
//!
//! Loaded from a JSON document or assembled in process for embedded nodes.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_thread_num() -> usize {
    2
}

fn default_io_thread_num() -> usize {
    1
}

fn default_nonblocking_io_thread_num() -> usize {
    2
}

fn default_net_thread_num() -> usize {
    64
}

fn default_caches_number() -> usize {
    4
}

fn default_queue_timeout() -> u64 {
    5
}

fn default_wait_timeout() -> u64 {
    5
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    pub backend_id: u32,
    pub group: u32,
    #[serde(default = "crate::config::default_enable")]
    pub enable: bool,
    /// Overrides the node-wide queue timeout for this backend, seconds.
    #[serde(default)]
    pub queue_timeout: Option<u64>,
}

pub(crate) fn default_enable() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Command transport listen address.
    pub address: SocketAddr,
    /// Streaming transport listen address; disabled when absent.
    #[serde(default)]
    pub stream_address: Option<SocketAddr>,
    /// Streaming completion-queue worker count.
    #[serde(default = "default_thread_num")]
    pub thread_num: usize,
    /// Workers per backend i/o pool.
    #[serde(default = "default_io_thread_num")]
    pub io_thread_num: usize,
    /// Workers serving commands that bypass the backend queues.
    #[serde(default = "default_nonblocking_io_thread_num")]
    pub nonblocking_io_thread_num: usize,
    /// Concurrent connection cap.
    #[serde(default = "default_net_thread_num")]
    pub net_thread_num: usize,
    /// Store lock shards per backend.
    #[serde(default = "default_caches_number")]
    pub caches_number: usize,
    /// Node-wide server queue timeout, seconds.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: u64,
    /// Deadline applied to transactions this node forwards, seconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: u64,
    pub backends: Vec<BackendConfig>,
    /// Peers whose routing tables are merged at startup.
    #[serde(default)]
    pub remotes: Vec<SocketAddr>,
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Ephemeral localhost node serving one backend per listed group;
    /// the embedded-test entry point.
    pub fn for_groups(groups: &[u32]) -> Self {
        Self {
            address: "127.0.0.1:0".parse().unwrap(),
            stream_address: Some("127.0.0.1:0".parse().unwrap()),
            thread_num: default_thread_num(),
            io_thread_num: default_io_thread_num(),
            nonblocking_io_thread_num: default_nonblocking_io_thread_num(),
            net_thread_num: default_net_thread_num(),
            caches_number: default_caches_number(),
            queue_timeout: default_queue_timeout(),
            wait_timeout: default_wait_timeout(),
            backends: groups
                .iter()
                .enumerate()
                .map(|(i, &group)| BackendConfig {
                    backend_id: i as u32 + 1,
                    group,
                    enable: true,
                    queue_timeout: None,
                })
                .collect(),
            remotes: Vec::new(),
        }
    }

    pub fn queue_timeout_for(&self, backend: &BackendConfig) -> Duration {
        Duration::from_secs(backend.queue_timeout.unwrap_or(self.queue_timeout))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }
}
