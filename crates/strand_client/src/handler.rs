//! Per-dispatch reply sink.
//!
//! Every logical send creates exactly one [`BasicHandler`] shared by all the
//! transactions it spawns. The handler translates transport replies into
//! result entries and completes the async result when the last transaction
//! reports in.
//!
//! The completion counter targets `total + 1`: the extra slot belongs to the
//! dispatcher and is released by [`BasicHandler::set_total`] once every send
//! has been issued, so transactions that finish before the dispatcher is done
//! counting can never complete the handler early.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use strand_proto::CommandHeader;

use crate::async_result::ResultHandler;
use crate::entry::ResultEntry;
use crate::error::Error;

/// One transport-level reply event delivered to a handler.
#[derive(Debug)]
pub enum Reply {
    /// A wire reply; `last` when this transaction will produce no more.
    Message {
        addr: SocketAddr,
        cmd: CommandHeader,
        body: Bytes,
        last: bool,
    },
    /// A synthesized failure: deadline, connection loss or local dispatch
    /// error. Always terminal for its transaction.
    Failure {
        addr: Option<SocketAddr>,
        cmd: CommandHeader,
        error: Error,
    },
}

/// Reply callback bound to each dispatched transaction.
pub type ReplyCallback = Arc<dyn Fn(Reply) + Send + Sync>;

pub struct BasicHandler {
    handler: ResultHandler,
    completed: AtomicUsize,
    /// `total + 1` once the dispatcher has counted its sends; zero before.
    total: AtomicUsize,
}

impl BasicHandler {
    pub fn new(handler: ResultHandler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        })
    }

    /// The callback handed to the transport for every transaction of this
    /// dispatch.
    pub fn callback(self: &Arc<Self>) -> ReplyCallback {
        let this = self.clone();
        Arc::new(move |reply| this.handle(reply))
    }

    pub fn handle(&self, reply: Reply) {
        match reply {
            Reply::Message {
                addr,
                cmd,
                body,
                last,
            } => {
                tracing::debug!(
                    opcode = %cmd.opcode,
                    trans = cmd.trans,
                    status = cmd.status,
                    size = body.len(),
                    %addr,
                    last,
                    "handled reply"
                );
                let error = if cmd.status != 0 {
                    Some(Error::from_status(
                        cmd.status,
                        format!("{}: remote error from {addr}", cmd.opcode),
                    ))
                } else {
                    None
                };
                self.handler.process(ResultEntry {
                    addr: Some(addr),
                    cmd,
                    data: body,
                    error,
                });
                if last {
                    self.increment_completed();
                }
            }
            Reply::Failure { addr, cmd, error } => {
                tracing::debug!(
                    opcode = %cmd.opcode,
                    trans = cmd.trans,
                    status = error.status(),
                    "transaction failed: {error}"
                );
                let mut cmd = cmd;
                cmd.status = error.status();
                cmd.flags |= strand_proto::cflags::REPLY;
                self.handler.process(ResultEntry {
                    addr,
                    cmd,
                    data: Bytes::new(),
                    error: Some(error),
                });
                self.increment_completed();
            }
        }
    }

    /// Called by the dispatcher after all sends are issued; releases the
    /// guard slot so the handler can complete.
    pub fn set_total(&self, total: usize) {
        self.handler.set_total(total);
        self.total.store(total + 1, Ordering::Release);
        self.increment_completed();
    }

    fn increment_completed(&self) {
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.total.load(Ordering::Acquire);
        if total != 0 && done == total {
            self.handler.complete(None);
        }
    }
}
