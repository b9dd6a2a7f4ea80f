//! Server-side queue-timeout behavior.
//!
//! One node, one i/o worker per backend. A request that waits in the i/o
//! queue longer than the backend's queue timeout is dropped with a TIMEDOUT
//! ack at decouple time, so the client learns about the overload well before
//! its own session deadline.

mod common;

use std::time::{Duration, Instant};

use strand_client::{Checker, Filter};
use strand_node::config::{BackendConfig, NodeConfig};
use strand_proto::{cflags, ErrorCode};

const GROUP: u32 = 1;
const BACKEND_ID: u32 = 1;

const GROUP_WITH_OVERRIDE: u32 = 2;
const BACKEND_WITH_OVERRIDE: u32 = 2;

fn node_config() -> NodeConfig {
    let mut config = NodeConfig::for_groups(&[]);
    config.io_thread_num = 1;
    config.nonblocking_io_thread_num = 1;
    config.caches_number = 1;
    config.queue_timeout = 1;
    config.backends = vec![
        BackendConfig {
            backend_id: BACKEND_ID,
            group: GROUP,
            enable: true,
            queue_timeout: None,
        },
        BackendConfig {
            backend_id: BACKEND_WITH_OVERRIDE,
            group: GROUP_WITH_OVERRIDE,
            enable: true,
            queue_timeout: Some(2),
        },
    ];
    config
}

/// Write a key, slow the backend to 1.5 s per request and issue two reads
/// back to back with a 5 s session timeout. The first read fits the timeout;
/// the second waits 1.5 s in the queue, past the 1 s queue timeout, and is
/// dropped with TIMEDOUT. A third read succeeds: no aftereffect.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_timeout_drops_queued_request() {
    let cluster = common::start_cluster_with(vec![node_config()]).await;
    let mut session = cluster.session(&[GROUP]);
    session.set_timeout(Duration::from_secs(5));
    session.set_trace_id(rand::random::<u32>() & !(1 << 31));

    let key = "queue timeout test key";
    let data = b"queue timeout test data".to_vec();
    session
        .write(key, Vec::new(), 0, data.clone(), 0)
        .await
        .wait()
        .await
        .expect("test key written");

    session
        .set_delay(cluster.addr(0), BACKEND_ID, 1500)
        .await
        .wait()
        .await
        .expect("delay set");

    let first = session.read(key, 0, 0).await;
    let second = session.read(key, 0, 0).await;

    let entries = first.get().await.expect("first read fits the timeout");
    assert_eq!(entries[0].payload(), data.as_slice());

    let err = second.get().await.expect_err("second read is dropped");
    assert!(err.is(ErrorCode::TimedOut), "unexpected error {err}");

    let entries = session
        .read(key, 0, 0)
        .await
        .get()
        .await
        .expect("no aftereffect");
    assert_eq!(entries[0].payload(), data.as_slice());
}

/// The dropped request is answered with an explicit TIMEDOUT ack, so the
/// client is informed right after the queue decouples it, not at its own
/// session deadline.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_timeout_acks_instead_of_staying_silent() {
    let cluster = common::start_cluster_with(vec![node_config()]).await;
    let mut session = cluster.observing_session(&[GROUP]);
    session.set_timeout(Duration::from_secs(10));
    session.set_filter(Filter::AllWithAck);
    session.set_checker(Checker::AtLeastOne);

    let delay_ms = 2000u64;
    session
        .set_delay(cluster.addr(0), BACKEND_ID, delay_ms)
        .await
        .wait()
        .await
        .unwrap();

    let started = Instant::now();
    let first = session.lookup("queue timeout reply test key").await;
    let second = session.lookup("queue timeout reply test key").await;

    first.wait().await.unwrap();
    assert!(first.error().expect("missing key").is(ErrorCode::NotFound));

    let entries = second.raw().get().await.unwrap();
    let err = second.error().expect("second lookup dropped");
    assert!(err.is(ErrorCode::TimedOut));
    // The TIMEDOUT ack is a real reply from the server.
    assert!(entries.iter().any(|e| e.cmd.flags & cflags::REPLY != 0
        && e.status() == ErrorCode::TimedOut.status()));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(delay_ms));
    assert!(elapsed < Duration::from_millis(2 * delay_ms));
}

/// Same shape as `queue_timeout_drops_queued_request` but against the
/// backend whose queue timeout is overridden to 2 s: a 1.5 s delay no longer
/// drops the queued request, a 2.5 s delay does.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overridden_queue_timeout_is_honored() {
    let cluster = common::start_cluster_with(vec![node_config()]).await;
    let mut session = cluster.session(&[GROUP_WITH_OVERRIDE]);

    let key = "overridden queue timeout test key";
    let data = b"overridden queue timeout test data".to_vec();
    session
        .write(key, Vec::new(), 0, data.clone(), 0)
        .await
        .wait()
        .await
        .unwrap();

    // First part: 1.5 s delay fits the overridden 2 s queue timeout.
    {
        session
            .set_delay(cluster.addr(0), BACKEND_WITH_OVERRIDE, 1500)
            .await
            .wait()
            .await
            .unwrap();
        session.set_timeout(Duration::from_secs(5));

        let first = session.read(key, 0, 0).await;
        let second = session.read(key, 0, 0).await;

        assert_eq!(first.get().await.unwrap()[0].payload(), data.as_slice());
        assert_eq!(
            second.get().await.expect("override keeps the queued read alive")[0].payload(),
            data.as_slice()
        );
    }

    // Second part: 2.5 s delay exceeds even the override.
    {
        session
            .set_delay(cluster.addr(0), BACKEND_WITH_OVERRIDE, 2500)
            .await
            .wait()
            .await
            .unwrap();
        session.set_timeout(Duration::from_secs(6));

        let first = session.read(key, 0, 0).await;
        let second = session.read(key, 0, 0).await;

        assert_eq!(first.get().await.unwrap()[0].payload(), data.as_slice());
        let err = second.get().await.unwrap_err();
        assert!(err.is(ErrorCode::TimedOut));

        assert_eq!(
            session.read(key, 0, 0).await.get().await.unwrap()[0].payload(),
            data.as_slice()
        );
    }
}
