//! End-to-end API behavior against embedded nodes.

mod common;

use std::time::Duration;

use strand_client::{Checker, ExceptionSet, Filter, Key};
use strand_proto::{ErrorCode, Id, KeyId, Time};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_then_read_round_trip() {
    let cluster = common::start_cluster(&[&[1, 2]]).await;
    let session = cluster.session(&[1, 2]);

    session
        .write("round trip", br#"{"kind":"test"}"#.to_vec(), 0, b"payload".to_vec(), 0)
        .await
        .wait()
        .await
        .expect("write succeeds");

    let entries = session
        .read("round trip", 0, 0)
        .await
        .get()
        .await
        .expect("read succeeds");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].json(), br#"{"kind":"test"}"#);
    assert_eq!(entries[0].payload(), b"payload");

    // Lookup reports matching sizes from every replica that has the record.
    let lookups = session.lookup("round trip").await.get().await.unwrap();
    assert_eq!(lookups.len(), 2);
    for entry in lookups {
        let info = entry.record_info().expect("record info");
        assert_eq!(info.data_size, 7);
        assert_eq!(info.json_size, 15);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_makes_key_unreadable() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);

    session
        .write("ephemeral key", Vec::new(), 0, b"soon gone".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();
    session.remove("ephemeral key").await.wait().await.unwrap();

    let err = session.read("ephemeral key", 0, 0).await.get().await.unwrap_err();
    assert!(err.is(ErrorCode::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookup_unwritten_reports_not_found_per_group() {
    let cluster = common::start_cluster(&[&[1], &[2], &[3]]).await;
    let mut session = cluster.observing_session(&[1, 2, 3]);
    session.set_filter(Filter::AllFinal);

    let entries = session.lookup("never written").await.get().await.unwrap();
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(entry.status(), ErrorCode::NotFound.status());
    }
    let mut groups: Vec<u32> = entries.iter().map(|e| e.cmd.group).collect();
    groups.sort_unstable();
    assert_eq!(groups, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offset_reads_and_partial_windows() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);

    session
        .write("window", Vec::new(), 0, b"0123456789".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();

    let entries = session.read("window", 3, 4).await.get().await.unwrap();
    assert_eq!(entries[0].payload(), b"3456");

    let rest = session.read("window", 5, 0).await.get().await.unwrap();
    assert_eq!(rest[0].payload(), b"56789");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_write_equals_single_write() {
    let cluster = common::start_cluster(&[&[1, 2]]).await;

    let data: Vec<u8> = (0u32..4096).flat_map(|v| v.to_le_bytes()).collect();

    let plain = cluster.session(&[1, 2]);
    plain
        .write("one shot", Vec::new(), 0, data.clone(), 0)
        .await
        .wait()
        .await
        .unwrap();

    let mut chunked = cluster.session(&[1, 2]);
    chunked.set_chunk_size(1000);
    chunked
        .write("chunked", br#"{"v":1}"#.to_vec(), 0, data.clone(), 0)
        .await
        .wait()
        .await
        .unwrap();

    for key in ["one shot", "chunked"] {
        let entries = plain.read(key, 0, 0).await.get().await.unwrap();
        assert_eq!(entries[0].payload(), &data[..], "key {key}");
    }

    // Uncommitted records stay invisible: prepare without commit.
    let staged = cluster.session(&[1]);
    staged
        .write_prepare("staged only", Vec::new(), 0, b"part".to_vec(), 0, 64)
        .await
        .wait()
        .await
        .unwrap();
    let err = staged.lookup("staged only").await.get().await.unwrap_err();
    assert!(err.is(ErrorCode::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_json_and_capacity_limits() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);

    session
        .write("json holder", br#"{"a":1}"#.to_vec(), 16, b"data".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();

    session
        .update_json("json holder", br#"{"a":2,"b":3}"#.to_vec())
        .await
        .wait()
        .await
        .unwrap();
    let entries = session.read_json("json holder").await.get().await.unwrap();
    assert_eq!(entries[0].json(), br#"{"a":2,"b":3}"#);

    let oversized = vec![b'x'; 64];
    let err = session
        .update_json("json holder", oversized)
        .await
        .wait()
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::TooBig));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_cas_guards_and_retries() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);

    session
        .write("cas", Vec::new(), 0, b"v1".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();

    // Wrong expected checksum is refused.
    let err = session
        .write_cas("cas", Vec::new(), b"v2".to_vec(), 0xdead_beef)
        .await
        .wait()
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::BadChecksum));

    // Correct checksum lands.
    session
        .write_cas("cas", Vec::new(), b"v2".to_vec(), crc32fast::hash(b"v1"))
        .await
        .wait()
        .await
        .unwrap();
    let entries = session.read("cas", 0, 0).await.get().await.unwrap();
    assert_eq!(entries[0].payload(), b"v2");

    // Read-modify-write converter appends a suffix.
    session
        .write_cas_with(
            "cas",
            |mut old| {
                old.extend_from_slice(b"+new");
                old
            },
            3,
        )
        .await
        .wait()
        .await
        .unwrap();
    let entries = session.read("cas", 0, 0).await.get().await.unwrap();
    assert_eq!(entries[0].payload(), b"v2+new");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_latest_prefers_fresher_replica() {
    let cluster = common::start_cluster(&[&[1], &[2]]).await;
    let key = Key::from("versioned");

    // Stale copy in group 1, fresh copy in group 2.
    let mut stale = cluster.session(&[1]);
    stale.set_timestamp(Time { sec: 100, nsec: 0 });
    let id = Id::new(stale.transform(&key), 1);
    stale
        .write(id, Vec::new(), 0, b"old".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();

    let mut fresh = cluster.session(&[2]);
    fresh.set_timestamp(Time { sec: 200, nsec: 0 });
    let id = Id::new(fresh.transform(&key), 2);
    fresh
        .write(id, Vec::new(), 0, b"new".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();

    let session = cluster.session(&[1, 2]);
    let entries = session.read_latest("versioned", 0, 0).await.get().await.unwrap();
    assert_eq!(entries[0].payload(), b"new");
    assert_eq!(entries[0].cmd.group, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn range_read_and_remove() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);

    let mut ids: Vec<KeyId> = Vec::new();
    for i in 0..20u8 {
        let key = format!("range key {i:02}");
        session
            .write(key.as_str(), Vec::new(), 0, vec![i], 0)
            .await
            .wait()
            .await
            .unwrap();
        ids.push(session.transform(&Key::from(key.as_str())));
    }
    ids.sort_unstable();

    // Interval covering the middle of the id space.
    let range = strand_proto::body::KeyRange {
        begin: ids[5],
        end: ids[15],
    };
    let entries = session
        .read_data_range(range, 1, 0)
        .await
        .get()
        .await
        .unwrap();
    assert_eq!(entries.len(), 10);

    session
        .remove_data_range(range, 1)
        .await
        .wait()
        .await
        .unwrap();
    let after = session.read_data_range(range, 1, 0).await.get().await;
    // Every key in the interval is gone; the range read has nothing to
    // deliver and fails the default checker.
    assert!(after.is_err() || after.unwrap().is_empty());

    // Keys outside the interval survived.
    let all = strand_proto::body::KeyRange {
        begin: KeyId::ZERO,
        end: KeyId([0xff; strand_proto::KEY_SIZE]),
    };
    let survivors = session.read_data_range(all, 1, 0).await.get().await.unwrap();
    assert_eq!(survivors.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stat_log_and_status() {
    let cluster = common::start_cluster(&[&[1], &[2]]).await;
    let session = cluster.observing_session(&[1, 2]);

    session
        .write("stat fodder", Vec::new(), 0, b"x".to_vec(), 0)
        .await
        .wait()
        .await
        .unwrap();

    let stats = session.stat_log().await.get().await.unwrap();
    let with_payload: Vec<_> = stats.iter().filter(|e| e.stat_info().is_some()).collect();
    assert_eq!(with_payload.len(), 2);
    for entry in with_payload {
        let payload = entry.json().expect("stat payload is json");
        assert!(payload["backends"].is_array());
        assert!(payload["io_queues"].is_array());
    }

    // Per-backend stats from one node.
    let node_stats = session.stat_log_on(cluster.addr(0)).await.get().await.unwrap();
    let backend_payloads: Vec<_> = node_stats
        .iter()
        .filter_map(|entry| entry.json())
        .collect();
    assert_eq!(backend_payloads.len(), 1);
    assert_eq!(backend_payloads[0]["backends"][0]["backend_id"], 1);

    let counters = session.stat_log_count().await.get().await.unwrap();
    let commands = counters
        .iter()
        .filter_map(|e| e.json())
        .map(|payload| payload["commands"].clone())
        .collect::<Vec<_>>();
    assert!(commands.iter().any(|c| c.get("write").is_some()));

    // Status round trip, direct to one node.
    let entries = session
        .update_status(cluster.addr(0), Some(0x5))
        .await
        .get()
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let read_back = session
        .update_status(cluster.addr(0), None)
        .await
        .get()
        .await
        .unwrap();
    let response: strand_proto::body::StatusResponse =
        strand_proto::decode_body(&read_back[0].data).unwrap();
    assert_eq!(response.status, 0x5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checker_all_and_quorum_outcomes() {
    let cluster = common::start_cluster(&[&[1], &[2], &[3]]).await;

    // Write to two of three groups only.
    for group in [1u32, 2] {
        let session = cluster.session(&[group]);
        let id = Id::new(session.transform(&Key::from("partial")), group);
        session
            .write(id, Vec::new(), 0, b"data".to_vec(), 0)
            .await
            .wait()
            .await
            .unwrap();
    }

    let mut quorum = cluster.session(&[1, 2, 3]);
    quorum
        .set_checker(Checker::Quorum)
        .set_exceptions(ExceptionSet::DEFAULT);
    quorum.lookup("partial").await.wait().await.expect("2 of 3 is a quorum");

    let mut all = cluster.session(&[1, 2, 3]);
    all.set_checker(Checker::All);
    let err = all.lookup("partial").await.wait().await.unwrap_err();
    // The failing group's error entry is suppressed by the successful ones,
    // so the checker synthesizes the no-successful-replies outcome.
    assert!(err.is(ErrorCode::NoRoute));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_timeout_bounds_unreachable_group(){
    // A group route pointing at a black-hole address must resolve within
    // the session timeout with a terminal per-entry error.
    let cluster = common::start_cluster(&[&[1]]).await;
    let mut session = cluster.observing_session(&[1]);
    session.set_timeout(Duration::from_secs(1));
    // 198.51.100.0/24 is reserved for documentation; connections hang.
    session.set_direct(Some("198.51.100.1:4150".parse().unwrap()));

    let started = std::time::Instant::now();
    let result = session.read("anything", 0, 0).await;
    result.wait().await.unwrap();
    let error = result.error().expect("read must fail");
    assert!(
        error.is(ErrorCode::TimedOut) || error.is(ErrorCode::ConnectionReset),
        "unexpected error {error}"
    );
    assert!(started.elapsed() < Duration::from_secs(8));
}
