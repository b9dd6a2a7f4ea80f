//! Forwarding: a session addresses one node which dispatches on the
//! client's behalf and relays every reply, applying its own wait timeout as
//! the forwarded deadline.

mod common;

use std::time::{Duration, Instant};

use strand_client::{Checker, Filter, Key};
use strand_node::config::NodeConfig;
use strand_proto::{ErrorCode, Id};

/// Three nodes, one group each. The third node carries a tight forward
/// deadline for the proxy-timeout scenario.
fn configs() -> Vec<NodeConfig> {
    let mut configs = vec![
        NodeConfig::for_groups(&[1]),
        NodeConfig::for_groups(&[2]),
        NodeConfig::for_groups(&[3]),
    ];
    configs[0].wait_timeout = 3;
    configs[1].wait_timeout = 3;
    configs[2].wait_timeout = 1;
    configs
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_lookup_relays_every_group() {
    let cluster = common::start_cluster_with(configs()).await;
    let forward = cluster.addr(0);

    let mut session = cluster.observing_session(&[1, 2, 3]);
    session.set_filter(Filter::AllFinal);
    session.set_forward(Some(forward));

    // Nothing written yet: every group's verdict arrives from the forward.
    let entries = session.lookup("some_key").await.get().await.unwrap();
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(entry.status(), ErrorCode::NotFound.status());
        assert_eq!(entry.address(), Some(forward));
    }

    // Write one replica through the forward, group 2.
    let json = br#"{"key": "data"}"#.to_vec();
    let data = b"data".to_vec();
    let id = Id::new(session.transform(&Key::from("some_key")), 2);
    session
        .write(id, json.clone(), 0, data.clone(), 0)
        .await
        .wait()
        .await
        .expect("forwarded write lands");

    // Now exactly the successful replica reports, still via the forward.
    let entries = session.lookup("some_key").await.get().await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.status(), 0);
    assert_eq!(entry.address(), Some(forward));
    let info = entry.record_info().expect("record info relayed");
    assert_eq!(info.json_size, json.len() as u64);
    assert_eq!(info.data_size, data.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_refuses_unknown_groups() {
    let cluster = common::start_cluster_with(configs()).await;
    let forward = cluster.addr(0);

    let mut session = cluster.observing_session(&[5, 6, 7]);
    session.set_filter(Filter::AllFinal);
    session.set_forward(Some(forward));

    let entries = session.lookup("nonexistent key").await.get().await.unwrap();
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(entry.status(), ErrorCode::NotSupported.status());
        assert_eq!(entry.address(), Some(forward));
    }
    let mut groups: Vec<u32> = entries.iter().map(|e| e.cmd.group).collect();
    groups.sort_unstable();
    assert_eq!(groups, vec![5, 6, 7]);
}

/// The forward node's own deadline fires long before the client's generous
/// session timeout: the client sees TIMEDOUT from the forward address within
/// roughly the forward's wait timeout.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_deadline_fires_at_proxy() {
    let cluster = common::start_cluster_with(configs()).await;
    let forward = cluster.addr(2);
    let delayed_owner = cluster.addr(1);

    let mut session = cluster.observing_session(&[2]);
    session.set_filter(Filter::AllFinal);
    session.set_checker(Checker::AtLeastOne);

    // Slow the group-2 backend past the forward's 1 s wait timeout.
    session
        .set_delay(delayed_owner, 1, 2000)
        .await
        .wait()
        .await
        .unwrap();

    // Client-side deadline is enormous; only the proxy deadline can fire
    // this fast.
    session.set_timeout(Duration::from_secs(50));
    session.set_forward(Some(forward));

    let started = Instant::now();
    let entries = session.lookup("nonexistent key").await.get().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status(), ErrorCode::TimedOut.status());
    assert_eq!(entries[0].address(), Some(forward));
    assert!(
        elapsed < Duration::from_secs(5),
        "proxy deadline should fire in ~1s, took {elapsed:?}"
    );

    // Reset the delay through a direct session.
    let mut admin = cluster.observing_session(&[2]);
    admin.set_timeout(Duration::from_secs(5));
    admin.set_delay(delayed_owner, 1, 0).await.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarded_read_and_write_round_trip() {
    let cluster = common::start_cluster_with(configs()).await;
    let forward = cluster.addr(0);

    let mut session = cluster.session(&[3]);
    session.set_forward(Some(forward));

    session
        .write("proxied", Vec::new(), 0, b"via proxy".to_vec(), 0)
        .await
        .wait()
        .await
        .expect("forwarded write");

    let entries = session.read("proxied", 0, 0).await.get().await.unwrap();
    assert_eq!(entries[0].payload(), b"via proxy");
    assert_eq!(entries[0].address(), Some(forward));

    // The same key is readable without the forward, directly from group 3.
    let direct = cluster.session(&[3]);
    let entries = direct.read("proxied", 0, 0).await.get().await.unwrap();
    assert_eq!(entries[0].payload(), b"via proxy");
    assert_ne!(entries[0].address(), Some(forward));
}
