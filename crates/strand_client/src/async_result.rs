//! Multi-entry futures.
//!
//! An async result accepts entries via its [`ResultHandler`] and exactly one
//! terminal `complete`. Subscribers attach with `(on_entry, on_complete)`
//! pairs; a late subscriber receives a replay of already-admitted entries and
//! then the terminal event, so attach order never races delivery.
//!
//! Entry delivery is serialized by the internal mutex even when replies
//! arrive on several transport tasks; `complete` strictly follows the last
//! admitted entry for every subscriber.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::Notify;

use crate::entry::ResultEntry;
use crate::error::{Error, Result};
use crate::policy::Policy;
use strand_proto::ErrorCode;

type EntryFn = Box<dyn Fn(&ResultEntry) + Send>;
type CompleteFn = Box<dyn FnOnce(&Option<Error>) + Send>;

struct Subscriber {
    on_entry: EntryFn,
    on_complete: Option<CompleteFn>,
}

struct Inner {
    entries: Vec<ResultEntry>,
    subscribers: Vec<Subscriber>,
    total: usize,
    /// `Some(None)` = completed ok, `Some(Some(e))` = completed with error.
    terminal: Option<Option<Error>>,
    success_groups: HashSet<u32>,
    first_error: Option<Error>,
}

struct Shared {
    state: Mutex<Inner>,
    cond: Condvar,
    notify: Notify,
    policy: Policy,
}

/// Consumer half of a multi-entry future.
#[derive(Clone)]
pub struct AsyncResult {
    shared: Arc<Shared>,
}

/// Producer half: feeds entries and the terminal event.
#[derive(Clone)]
pub struct ResultHandler {
    shared: Arc<Shared>,
}

impl AsyncResult {
    pub fn new(policy: Policy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Inner {
                    entries: Vec::new(),
                    subscribers: Vec::new(),
                    total: 0,
                    terminal: None,
                    success_groups: HashSet::new(),
                    first_error: None,
                }),
                cond: Condvar::new(),
                notify: Notify::new(),
                policy,
            }),
        }
    }

    /// Shorthand for a result that is already terminally failed.
    pub fn failed(policy: Policy, error: Error) -> Self {
        let result = Self::new(policy);
        result.handler().complete(Some(error));
        result
    }

    pub fn handler(&self) -> ResultHandler {
        ResultHandler {
            shared: self.shared.clone(),
        }
    }

    /// Attach a subscriber. Already-admitted entries are replayed first; if
    /// the result is complete, both callbacks fire before this returns.
    pub fn connect(
        &self,
        on_entry: impl Fn(&ResultEntry) + Send + 'static,
        on_complete: impl FnOnce(&Option<Error>) + Send + 'static,
    ) {
        let mut st = self.shared.state.lock().unwrap();
        for entry in &st.entries {
            on_entry(entry);
        }
        match st.terminal.clone() {
            Some(err) => on_complete(&err),
            None => st.subscribers.push(Subscriber {
                on_entry: Box::new(on_entry),
                on_complete: Some(Box::new(on_complete)),
            }),
        }
    }

    /// Expected number of transactions, as hinted by the dispatcher.
    pub fn total(&self) -> usize {
        self.shared.state.lock().unwrap().total
    }

    /// Terminal error, if the result completed with one.
    pub fn error(&self) -> Option<Error> {
        self.shared
            .state
            .lock()
            .unwrap()
            .terminal
            .clone()
            .flatten()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().unwrap().terminal.is_some()
    }

    async fn done(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the terminal event. Returns the terminal error only when the
    /// session's exception policy raises at wait time.
    pub async fn wait(&self) -> Result<()> {
        self.done().await;
        match self.error() {
            Some(err) if self.shared.policy.exceptions.at_wait() => Err(err),
            _ => Ok(()),
        }
    }

    /// Wait and collect all admitted entries.
    pub async fn get(&self) -> Result<Vec<ResultEntry>> {
        self.done().await;
        self.finish_get()
    }

    /// Blocking flavor of [`AsyncResult::wait`] for non-async callers.
    pub fn wait_blocking(&self) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        while st.terminal.is_none() {
            st = self.shared.cond.wait(st).unwrap();
        }
        let err = st.terminal.clone().flatten();
        drop(st);
        match err {
            Some(err) if self.shared.policy.exceptions.at_wait() => Err(err),
            _ => Ok(()),
        }
    }

    /// Blocking flavor of [`AsyncResult::get`] for non-async callers.
    pub fn get_blocking(&self) -> Result<Vec<ResultEntry>> {
        let mut st = self.shared.state.lock().unwrap();
        while st.terminal.is_none() {
            st = self.shared.cond.wait(st).unwrap();
        }
        drop(st);
        self.finish_get()
    }

    fn finish_get(&self) -> Result<Vec<ResultEntry>> {
        match self.error() {
            Some(err) if self.shared.policy.exceptions.at_get() => Err(err),
            _ => Ok(self.shared.state.lock().unwrap().entries.clone()),
        }
    }
}

impl ResultHandler {
    /// Feed one entry. Success accounting for the checker happens on the raw
    /// entry; the filter decides whether subscribers ever see it.
    pub fn process(&self, entry: ResultEntry) {
        let mut st = self.shared.state.lock().unwrap();
        if st.terminal.is_some() {
            tracing::debug!(
                opcode = %entry.cmd.opcode,
                trans = entry.cmd.trans,
                "entry after terminal event dropped"
            );
            return;
        }

        if entry.is_valid() && entry.status() == 0 {
            st.success_groups.insert(entry.cmd.group);
        }
        if st.first_error.is_none() {
            if let Some(err) = &entry.error {
                st.first_error = Some(err.clone());
            }
        }

        if self.shared.policy.filter.admits(&entry) {
            for sub in &st.subscribers {
                (sub.on_entry)(&entry);
            }
            st.entries.push(entry);
        }
    }

    /// Terminal event; idempotence guards against late duplicate completion,
    /// the first call wins.
    pub fn complete(&self, error: Option<Error>) {
        let mut st = self.shared.state.lock().unwrap();
        if st.terminal.is_some() {
            return;
        }

        let policy = &self.shared.policy;
        let final_error = match error {
            Some(err) => Some(err),
            None => {
                if policy
                    .checker
                    .satisfied(&st.success_groups, policy.total_groups)
                {
                    None
                } else {
                    Some(st.first_error.clone().unwrap_or_else(|| {
                        Error::new(ErrorCode::NoRoute, "no successful replies")
                    }))
                }
            }
        };

        st.terminal = Some(final_error.clone());
        let mut subscribers = std::mem::take(&mut st.subscribers);
        for sub in &mut subscribers {
            if let Some(on_complete) = sub.on_complete.take() {
                on_complete(&final_error);
            }
        }
        drop(st);

        self.shared.cond.notify_all();
        self.shared.notify.notify_waiters();
    }

    /// Pre-size hint: how many transactions will feed this result.
    pub fn set_total(&self, total: usize) {
        self.shared.state.lock().unwrap().total = total;
    }

    pub fn policy(&self) -> &Policy {
        &self.shared.policy
    }
}

/// Typed view over an [`AsyncResult`], converting entries on access.
pub struct TypedResult<E> {
    raw: AsyncResult,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for TypedResult<E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: From<ResultEntry> + Send + 'static> TypedResult<E> {
    pub fn new(raw: AsyncResult) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &AsyncResult {
        &self.raw
    }

    pub async fn get(&self) -> Result<Vec<E>> {
        Ok(self.raw.get().await?.into_iter().map(E::from).collect())
    }

    pub async fn wait(&self) -> Result<()> {
        self.raw.wait().await
    }

    pub fn get_blocking(&self) -> Result<Vec<E>> {
        Ok(self
            .raw
            .get_blocking()?
            .into_iter()
            .map(E::from)
            .collect())
    }

    pub fn wait_blocking(&self) -> Result<()> {
        self.raw.wait_blocking()
    }

    pub fn connect(
        &self,
        on_entry: impl Fn(E) + Send + 'static,
        on_complete: impl FnOnce(&Option<Error>) + Send + 'static,
    ) {
        self.raw
            .connect(move |entry| on_entry(E::from(entry.clone())), on_complete);
    }

    pub fn total(&self) -> usize {
        self.raw.total()
    }

    pub fn error(&self) -> Option<Error> {
        self.raw.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::synthetic_entry;
    use crate::policy::{Checker, ExceptionSet, Filter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strand_proto::{cflags, CommandHeader, KeyId, Opcode};

    fn entry(group: u32, status: i32) -> ResultEntry {
        let mut cmd = CommandHeader::new(Opcode::Lookup, KeyId::from_name(b"", b"k"), group);
        cmd.status = status;
        cmd.flags = cflags::REPLY;
        ResultEntry {
            addr: None,
            cmd,
            data: bytes::Bytes::from_static(b"body"),
            error: if status == 0 {
                None
            } else {
                Some(Error::from_status(status, "remote error"))
            },
        }
    }

    fn policy(filter: Filter, checker: Checker, groups: usize) -> Policy {
        Policy {
            filter,
            checker,
            exceptions: ExceptionSet::DEFAULT,
            total_groups: groups,
        }
    }

    #[tokio::test]
    async fn entries_then_complete_in_order() {
        let result = AsyncResult::new(policy(Filter::AllWithAck, Checker::NoCheck, 1));
        let handler = result.handler();

        let seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            let done = done.clone();
            result.connect(
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                move |err| {
                    assert!(err.is_none());
                    done.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        handler.process(entry(1, 0));
        handler.process(entry(2, 0));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        handler.complete(None);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(result.get().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_and_terminal() {
        let result = AsyncResult::new(policy(Filter::AllWithAck, Checker::NoCheck, 1));
        let handler = result.handler();
        handler.process(entry(1, 0));
        handler.complete(None);

        let seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (s, d) = (seen.clone(), done.clone());
        result.connect(
            move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_drops_but_checker_still_counts() {
        // Negative filter hides successes from subscribers, yet the checker
        // judges the raw stream and reports overall success.
        let result = AsyncResult::new(policy(Filter::Negative, Checker::AtLeastOne, 2));
        let handler = result.handler();
        handler.process(entry(1, 0));
        handler.process(entry(2, -2));
        handler.complete(None);

        let entries = result.get().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status(), -2);
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn checker_failure_synthesizes_terminal_error() {
        let result = AsyncResult::new(policy(Filter::AllWithAck, Checker::All, 2));
        let handler = result.handler();
        handler.process(entry(1, 0));
        handler.process(entry(2, -2));
        handler.complete(None);

        let err = result.get().await.unwrap_err();
        assert_eq!(err.status(), -2);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let result = AsyncResult::new(policy(Filter::AllWithAck, Checker::NoCheck, 1));
        let handler = result.handler();
        handler.complete(None);
        handler.complete(Some(Error::new(ErrorCode::TimedOut, "late")));
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn no_exception_policy_returns_ok_with_error_kept() {
        let result = AsyncResult::new(Policy {
            filter: Filter::AllWithAck,
            checker: Checker::AtLeastOne,
            exceptions: ExceptionSet::NO_EXCEPTIONS,
            total_groups: 1,
        });
        let handler = result.handler();
        handler.process(synthetic_entry(
            CommandHeader::new(Opcode::Read, KeyId::ZERO, 1),
            None,
            ErrorCode::NotFound,
            "missing",
        ));
        handler.complete(None);

        // get() does not raise, the terminal error stays observable.
        assert_eq!(result.get().await.unwrap().len(), 1);
        assert!(result.error().unwrap().is(ErrorCode::NotFound));
    }

    #[test]
    fn blocking_get_wakes_from_another_thread() {
        let result = AsyncResult::new(policy(Filter::AllWithAck, Checker::NoCheck, 1));
        let handler = result.handler();
        let waiter = {
            let result = result.clone();
            std::thread::spawn(move || result.get_blocking().map(|v| v.len()))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        handler.process(entry(1, 0));
        handler.complete(None);
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
    }
}
