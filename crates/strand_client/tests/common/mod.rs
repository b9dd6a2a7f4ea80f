//! Shared helpers for integration tests: boot embedded nodes, interlink
//! their routing tables and hand out configured sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use strand_client::{Checker, Cluster, ExceptionSet, Filter, Session};
use strand_node::config::NodeConfig;
use strand_node::{start_node, NodeHandle};

/// Default per-test session timeout.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestCluster {
    pub nodes: Vec<NodeHandle>,
    pub cluster: Arc<Cluster>,
}

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

/// One node per entry, serving the listed groups.
pub async fn start_cluster(groups_per_node: &[&[u32]]) -> TestCluster {
    let configs = groups_per_node
        .iter()
        .map(|groups| NodeConfig::for_groups(groups))
        .collect();
    start_cluster_with(configs).await
}

/// Boot nodes from explicit configs, interlink their routing tables and
/// connect a client through every node.
pub async fn start_cluster_with(configs: Vec<NodeConfig>) -> TestCluster {
    init_logging();

    let mut nodes = Vec::with_capacity(configs.len());
    for config in configs {
        nodes.push(start_node(config).await.expect("node starts"));
    }

    let addrs: Vec<SocketAddr> = nodes.iter().map(|n| n.addr).collect();
    for (i, node) in nodes.iter().enumerate() {
        for (j, &addr) in addrs.iter().enumerate() {
            if i != j {
                node.add_remote(addr).await.expect("route exchange");
            }
        }
    }

    let cluster = Cluster::connect(&addrs).await.expect("client connects");
    TestCluster { nodes, cluster }
}

impl TestCluster {
    /// Session over the given groups with a permissive observation policy:
    /// everything flows, nothing raises, outcome inspected explicitly.
    pub fn observing_session(&self, groups: &[u32]) -> Session {
        let mut session = Session::new(self.cluster.clone());
        session
            .set_groups(groups.to_vec())
            .set_timeout(SESSION_TIMEOUT)
            .set_filter(Filter::AllWithAck)
            .set_checker(Checker::NoCheck)
            .set_exceptions(ExceptionSet::NO_EXCEPTIONS);
        session
    }

    /// Session with the default positive/at-least-one policy.
    pub fn session(&self, groups: &[u32]) -> Session {
        let mut session = Session::new(self.cluster.clone());
        session
            .set_groups(groups.to_vec())
            .set_timeout(SESSION_TIMEOUT);
        session
    }

    pub fn addr(&self, node: usize) -> SocketAddr {
        self.nodes[node].addr
    }
}
