//! Client handle to the storage cluster: shared transport plus the routing
//! table downloaded from the configured remotes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use strand_proto::ErrorCode;

use crate::error::{Error, Result};
use crate::route::RouteTable;
use crate::transport::Transport;

/// Route download budget per remote.
const ROUTE_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Cluster {
    transport: Arc<Transport>,
    route: Arc<RouteTable>,
}

impl Cluster {
    /// Connect to the cluster through the given remotes and download their
    /// routing tables. An empty remote list yields an unrouted cluster that
    /// can be populated later with [`Cluster::add_remote`].
    pub async fn connect(remotes: &[SocketAddr]) -> Result<Arc<Self>> {
        let cluster = Arc::new(Self {
            transport: Transport::new(),
            route: Arc::new(RouteTable::new()),
        });

        let mut last_error = None;
        for &remote in remotes {
            if let Err(err) = cluster.add_remote(remote).await {
                tracing::warn!(%remote, "route download failed: {err}");
                last_error = Some(err);
            }
        }

        if !remotes.is_empty() && cluster.route.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| Error::new(ErrorCode::NoRoute, "no usable remotes")));
        }
        Ok(cluster)
    }

    /// Download and merge one node's routing table.
    pub async fn add_remote(&self, addr: SocketAddr) -> Result<()> {
        let entries = self
            .transport
            .fetch_route_list(addr, ROUTE_FETCH_TIMEOUT)
            .await?;
        tracing::debug!(%addr, entries = entries.len(), "routes downloaded");
        self.route.apply(&entries);
        Ok(())
    }

    pub fn route(&self) -> &RouteTable {
        &self.route
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}
