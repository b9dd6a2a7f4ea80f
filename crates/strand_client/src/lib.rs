//! Client-side request engine for the strand distributed object store.
//!
//! The engine fans logical operations out to the backend nodes of one or
//! more replica groups, collects partial results as they arrive, applies
//! filter and checker policies, enforces deadlines and surfaces a unified
//! asynchronous result per operation.
//!
//! Entry points: [`Cluster::connect`] for the shared transport and routing
//! table, then [`Session`] for policy and operations.

pub mod aggregator;
pub mod async_result;
pub mod bulk;
pub mod cluster;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod handler;
pub mod policy;
pub mod route;
pub mod session;
pub mod stream_io;
pub mod transport;

pub use async_result::{AsyncResult, ResultHandler, TypedResult};
pub use cluster::Cluster;
pub use entry::{
    IteratorEntry, LookupEntry, ReadEntry, RemoveEntry, ResultEntry, StatEntry, WriteEntry,
};
pub use error::{Error, Result};
pub use policy::{Checker, ExceptionSet, Filter, Policy};
pub use session::{
    AsyncIteratorResult, AsyncLookupResult, AsyncReadResult, AsyncRemoveResult, AsyncStatResult,
    AsyncWriteResult, Key, Session,
};
pub use stream_io::{StreamClient, StreamReadResult};
