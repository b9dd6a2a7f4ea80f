//! Server-resident iterators: start, pause, continue, cancel.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_client::{IteratorEntry, Key};
use strand_proto::body::iterator_flags;
use strand_proto::Time;

const BACKEND_ID: u32 = 1;

async fn populate(session: &strand_client::Session, count: u32) {
    for i in 0..count {
        session
            .write(
                format!("iter key {i:03}").as_str(),
                format!("{{\"i\":{i}}}").into_bytes(),
                0,
                format!("value {i}").into_bytes(),
                0,
            )
            .await
            .wait()
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iterator_streams_every_record() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);
    populate(&session, 25).await;

    let entries = session
        .start_iterator(
            cluster.addr(0),
            BACKEND_ID,
            iterator_flags::JSON | iterator_flags::DATA,
            Vec::new(),
            (Time::ZERO, Time::ZERO),
        )
        .await
        .get()
        .await
        .unwrap();

    assert_eq!(entries.len(), 25);
    let total = entries[0].iterator_info().unwrap().total_keys;
    assert_eq!(total, 25);
    for entry in &entries {
        let info = entry.iterator_info().unwrap();
        assert!(!info.data.is_empty());
        assert!(info.iterated_keys >= 1 && info.iterated_keys <= total);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iterator_respects_key_range_filter() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let session = cluster.session(&[1]);
    populate(&session, 20).await;

    let mut ids: Vec<_> = (0..20u32)
        .map(|i| session.transform(&Key::from(format!("iter key {i:03}").as_str())))
        .collect();
    ids.sort_unstable();
    let range = strand_proto::body::KeyRange {
        begin: ids[4],
        end: ids[12],
    };

    let entries = session
        .start_iterator(
            cluster.addr(0),
            BACKEND_ID,
            iterator_flags::KEY_RANGE,
            vec![range],
            (Time::ZERO, Time::ZERO),
        )
        .await
        .get()
        .await
        .unwrap();

    assert_eq!(entries.len(), 8);
    for entry in &entries {
        assert!(range.contains(&entry.iterator_info().unwrap().key));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iterator_pause_continue_cancel() {
    let cluster = common::start_cluster(&[&[1]]).await;
    let mut session = cluster.session(&[1]);
    session.set_timeout(Duration::from_secs(30));
    populate(&session, 40).await;

    // Pace the stream so control commands can interleave.
    session
        .set_delay(cluster.addr(0), BACKEND_ID, 50)
        .await
        .wait()
        .await
        .unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let (first_tx, first_rx) = tokio::sync::oneshot::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let result = session
        .start_iterator(
            cluster.addr(0),
            BACKEND_ID,
            0,
            Vec::new(),
            (Time::ZERO, Time::ZERO),
        )
        .await;
    {
        let received = received.clone();
        let first_tx = std::sync::Mutex::new(Some(first_tx));
        result.connect(
            move |entry: IteratorEntry| {
                received.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = first_tx.lock().unwrap().take() {
                    let _ = tx.send(entry.iterator_info().unwrap().iterator_id);
                }
            },
            move |_| {
                let _ = done_tx.send(());
            },
        );
    }

    let iterator_id = tokio::time::timeout(Duration::from_secs(10), first_rx)
        .await
        .expect("first entry arrives")
        .unwrap();

    // Pause and verify the stream stalls.
    session
        .pause_iterator(cluster.addr(0), BACKEND_ID, iterator_id)
        .await
        .wait()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let at_pause = received.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    // One in-flight entry may still land after the pause command.
    assert!(
        received.load(Ordering::SeqCst) <= at_pause + 1,
        "stream kept flowing while paused"
    );

    // Resume briefly, then cancel before the end.
    session
        .continue_iterator(cluster.addr(0), BACKEND_ID, iterator_id)
        .await
        .wait()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    session
        .cancel_iterator(cluster.addr(0), BACKEND_ID, iterator_id)
        .await
        .wait()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), done_rx)
        .await
        .expect("cancelled iterator completes")
        .unwrap();
    let total = received.load(Ordering::SeqCst);
    assert!(total < 40, "cancel stopped the stream early, got {total}");
}
