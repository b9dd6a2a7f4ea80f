//! Dispatch strategies.
//!
//! A strategy translates one prepared control into N concrete transactions
//! and returns the async result fed by their shared handler. Every strategy
//! calls `set_total` only after all sends are issued; the handler's guard
//! slot keeps early replies from completing the result mid-dispatch.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use strand_proto::{cflags, CommandHeader, ErrorCode};

use crate::async_result::AsyncResult;
use crate::cluster::Cluster;
use crate::error::Error;
use crate::handler::{BasicHandler, Reply};
use crate::policy::Policy;

/// One prepared command: header template plus serialized body.
#[derive(Clone)]
pub(crate) struct Control {
    pub header: CommandHeader,
    pub body: Bytes,
}

impl Control {
    pub fn new(header: CommandHeader, body: Bytes) -> Self {
        Self { header, body }
    }
}

/// Routing context captured from the session for one dispatch.
pub(crate) struct Dispatcher {
    pub cluster: Arc<Cluster>,
    pub groups: Vec<u32>,
    pub direct: Option<SocketAddr>,
    pub forward: Option<SocketAddr>,
    pub timeout: Duration,
    pub policy: Policy,
}

impl Dispatcher {
    async fn send_impl<F, Fut>(&self, f: F) -> AsyncResult
    where
        F: FnOnce(Arc<BasicHandler>) -> Fut,
        Fut: Future<Output = usize>,
    {
        let result = AsyncResult::new(self.policy.clone());
        let handler = BasicHandler::new(result.handler());
        let count = f(handler.clone()).await;
        handler.set_total(count);
        result
    }

    /// Resolve the destination for one group-routed send. `direct` wins and
    /// pins the flag; `forward` addresses the proxy without pinning, so the
    /// forward node re-dispatches on our behalf.
    fn resolve(&self, header: &mut CommandHeader) -> Option<SocketAddr> {
        if let Some(addr) = self.direct {
            header.flags |= cflags::DIRECT;
            return Some(addr);
        }
        if let Some(addr) = self.forward {
            return Some(addr);
        }
        self.cluster
            .route()
            .locate(header.group, &header.key)
            .map(|entry| entry.addr)
    }

    async fn send_one(
        &self,
        handler: &Arc<BasicHandler>,
        addr: Option<SocketAddr>,
        header: CommandHeader,
        body: Bytes,
    ) {
        match addr {
            Some(addr) => {
                self.cluster
                    .transport()
                    .send(addr, header, body, self.timeout, handler.callback())
                    .await;
            }
            None => handler.handle(Reply::Failure {
                addr: None,
                cmd: header,
                error: Error::new(
                    ErrorCode::NoRoute,
                    format!("no route for key {} in group {}", header.key, header.group),
                ),
            }),
        }
    }

    /// One transaction to one resolved state.
    pub async fn send_to_single_state(&self, ctl: Control) -> AsyncResult {
        self.send_impl(|handler| async move {
            let mut header = ctl.header;
            let addr = self.resolve(&mut header);
            self.send_one(&handler, addr, header, ctl.body).await;
            1
        })
        .await
    }

    /// One transaction per session group; the body is shared.
    pub async fn send_to_groups(&self, ctl: Control) -> AsyncResult {
        self.send_to_groups_io(ctl.header, |_| ctl.body.clone()).await
    }

    /// One i/o transaction per session group with a per-group body.
    pub async fn send_to_groups_io(
        &self,
        header: CommandHeader,
        body_for: impl Fn(u32) -> Bytes,
    ) -> AsyncResult {
        self.send_impl(|handler| async move {
            let mut count = 0;
            for &group in &self.groups {
                let mut header = header;
                header.group = group;
                let addr = self.resolve(&mut header);
                self.send_one(&handler, addr, header, body_for(group)).await;
                count += 1;
            }
            count
        })
        .await
    }

    /// One transaction per backend advertised by the target node.
    pub async fn send_to_each_backend(&self, addr: SocketAddr, ctl: Control) -> AsyncResult {
        self.send_impl(|handler| async move {
            let backends = self.cluster.route().backends_on(addr);
            let mut count = 0;
            for (backend_id, group) in backends {
                let mut header = ctl.header;
                header.flags |= cflags::DIRECT | cflags::DIRECT_BACKEND;
                header.backend = backend_id;
                header.group = group;
                self.send_one(&handler, Some(addr), header, ctl.body.clone())
                    .await;
                count += 1;
            }
            if count == 0 {
                handler.handle(Reply::Failure {
                    addr: Some(addr),
                    cmd: ctl.header,
                    error: Error::new(
                        ErrorCode::NoRoute,
                        format!("no backends advertised by {addr}"),
                    ),
                });
                count = 1;
            }
            count
        })
        .await
    }

    /// One direct transaction per node in the routing table.
    pub async fn send_to_each_node(&self, ctl: Control) -> AsyncResult {
        self.send_impl(|handler| async move {
            let members = self.cluster.route().members();
            let mut count = 0;
            for addr in members {
                let mut header = ctl.header;
                header.flags |= cflags::DIRECT;
                self.send_one(&handler, Some(addr), header, ctl.body.clone())
                    .await;
                count += 1;
            }
            if count == 0 {
                handler.handle(Reply::Failure {
                    addr: None,
                    cmd: ctl.header,
                    error: Error::new(ErrorCode::NoRoute, "routing table is empty"),
                });
                count = 1;
            }
            count
        })
        .await
    }

    /// One direct transaction to an explicit address.
    pub async fn send_to_address(&self, addr: SocketAddr, ctl: Control) -> AsyncResult {
        self.send_impl(|handler| async move {
            let mut header = ctl.header;
            header.flags |= cflags::DIRECT;
            self.send_one(&handler, Some(addr), header, ctl.body).await;
            1
        })
        .await
    }
}
