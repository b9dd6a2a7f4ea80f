//! Fan-in of several async results into one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use strand_proto::ErrorCode;

use crate::async_result::{AsyncResult, ResultHandler};
use crate::entry::ResultEntry;
use crate::error::Error;
use crate::policy::Policy;

struct AggInner {
    remaining: usize,
    error: Option<Error>,
}

struct AggState {
    handler: ResultHandler,
    inner: Mutex<AggInner>,
    has_success: AtomicBool,
}

impl AggState {
    fn on_entry(&self, entry: &ResultEntry) {
        if entry.is_valid() && entry.status() == 0 {
            self.has_success.store(true, Ordering::Relaxed);
        }
        self.handler.process(entry.clone());
    }

    fn on_finished(&self, error: &Option<Error>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.error.is_none() {
            if let Some(err) = error {
                inner.error = Some(err.clone());
            }
        }
        inner.remaining -= 1;
        if inner.remaining == 0 {
            // Any successful child clears the aggregate error; the outer
            // checker still gets the final say via complete(None).
            let error = if self.has_success.load(Ordering::Relaxed) {
                None
            } else {
                inner.error.take()
            };
            drop(inner);
            self.handler.complete(error);
        }
    }
}

/// Compose `children` into one result under `policy`.
///
/// Entries flow through as they arrive; the aggregate completes after every
/// child has completed. Call this after the children have been dispatched so
/// their transaction totals are known.
pub fn aggregated(policy: Policy, children: &[AsyncResult]) -> AsyncResult {
    let result = AsyncResult::new(policy);
    let handler = result.handler();

    if children.is_empty() {
        handler.complete(Some(Error::new(
            ErrorCode::NoRoute,
            "has no requests to send",
        )));
        return result;
    }

    let total: usize = children.iter().map(|c| c.total()).sum();
    let state = Arc::new(AggState {
        handler,
        inner: Mutex::new(AggInner {
            remaining: children.len(),
            error: None,
        }),
        has_success: AtomicBool::new(false),
    });

    for child in children {
        let on_entry = {
            let state = state.clone();
            move |entry: &ResultEntry| state.on_entry(entry)
        };
        let on_finished = {
            let state = state.clone();
            move |err: &Option<Error>| state.on_finished(err)
        };
        child.connect(on_entry, on_finished);
    }

    state.handler.set_total(total);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Checker, Filter};
    use bytes::Bytes;
    use strand_proto::{cflags, CommandHeader, KeyId, Opcode};

    fn child() -> AsyncResult {
        AsyncResult::new(Policy {
            filter: Filter::AllWithAck,
            checker: Checker::NoCheck,
            ..Policy::default()
        })
    }

    fn entry(group: u32, status: i32) -> ResultEntry {
        let mut cmd = CommandHeader::new(Opcode::Remove, KeyId::from_name(b"", b"k"), group);
        cmd.status = status;
        cmd.flags = cflags::REPLY;
        ResultEntry {
            addr: None,
            cmd,
            data: Bytes::from_static(b"x"),
            error: if status == 0 {
                None
            } else {
                Some(Error::from_status(status, "child error"))
            },
        }
    }

    #[tokio::test]
    async fn completes_after_all_children() {
        let a = child();
        let b = child();
        let agg = aggregated(
            Policy {
                filter: Filter::AllWithAck,
                checker: Checker::NoCheck,
                ..Policy::default()
            },
            &[a.clone(), b.clone()],
        );

        a.handler().process(entry(1, 0));
        a.handler().complete(None);
        assert!(!agg.is_complete());

        b.handler().process(entry(2, 0));
        b.handler().complete(None);
        assert!(agg.is_complete());
        assert_eq!(agg.get().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_success_clears_child_errors() {
        let a = child();
        let b = child();
        let agg = aggregated(
            Policy {
                filter: Filter::AllWithAck,
                checker: Checker::AtLeastOne,
                total_groups: 2,
                ..Policy::default()
            },
            &[a.clone(), b.clone()],
        );

        a.handler().process(entry(1, -110));
        a.handler()
            .complete(Some(Error::from_status(-110, "timed out")));
        b.handler().process(entry(2, 0));
        b.handler().complete(None);

        assert!(agg.error().is_none());
    }

    #[tokio::test]
    async fn all_failed_propagates_first_child_error() {
        let a = child();
        let b = child();
        let agg = aggregated(
            Policy {
                filter: Filter::AllWithAck,
                checker: Checker::NoCheck,
                ..Policy::default()
            },
            &[a.clone(), b.clone()],
        );

        a.handler()
            .complete(Some(Error::from_status(-110, "timed out")));
        b.handler().complete(Some(Error::from_status(-2, "not found")));

        // The first child error to arrive is the one propagated.
        assert_eq!(agg.error().unwrap().status(), -110);
    }

    #[tokio::test]
    async fn empty_input_fails_immediately() {
        let agg = aggregated(Policy::default(), &[]);
        assert!(agg.error().unwrap().is(ErrorCode::NoRoute));
    }
}
