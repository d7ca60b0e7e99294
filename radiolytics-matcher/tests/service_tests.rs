//! Service lifecycle tests against the filesystem collaborators

use radiolytics_common::time::unix_now_secs;
use radiolytics_matcher::config::MatcherConfig;
use radiolytics_matcher::fingerprint::record::FingerprintRecord;
use radiolytics_matcher::fingerprint::{FingerprintFrame, FingerprintSequence};
use radiolytics_matcher::storage::fs::{FsResultSink, FsWorkQueue};
use radiolytics_matcher::storage::{ObjectHandle, WorkQueue};
use radiolytics_matcher::MatcherService;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sequence(source: &str, ts: i64) -> FingerprintSequence {
    FingerprintSequence::new(source, ts, vec![FingerprintFrame::new(0.5, 0.5, 0.5, -5.0); 20])
}

#[tokio::test]
async fn test_service_matches_queued_query() {
    let temp = TempDir::new().unwrap();
    let queue = Arc::new(FsWorkQueue::new(temp.path().join("queue")));
    let sink = Arc::new(FsResultSink::new(temp.path().join("results")));

    let now = unix_now_secs();
    queue
        .put(
            &ObjectHandle::new(format!("reference_fingerprints/{}_KFM.json", now - 5)),
            &FingerprintRecord::reference(&sequence("KFM", now - 5)).to_json_bytes(),
        )
        .await
        .unwrap();
    queue
        .put(
            &ObjectHandle::new(format!("incoming_fingerprints/{}_phone-1.json", now)),
            &FingerprintRecord::query(&sequence("phone-1", now)).to_json_bytes(),
        )
        .await
        .unwrap();

    let config = MatcherConfig {
        poll_interval_secs: 1,
        ..MatcherConfig::with_stations(["KFM"])
    };
    let service = MatcherService::new(config, queue.clone(), sink.clone());
    assert!(service.start());

    // Step 1: Wait for the first cycle to write the result
    let deadline = Instant::now() + Duration::from_secs(5);
    let result = loop {
        if let Some(result) = sink.get(&now.to_string()).await.unwrap() {
            break result;
        }
        assert!(Instant::now() < deadline, "no result written within 5s");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(result.station, "KFM");
    assert!(result.confidence >= 0.75);

    // Step 2: The query leaves the incoming prefix
    let deadline = Instant::now() + Duration::from_secs(5);
    while !queue.list("incoming_fingerprints/").await.unwrap().is_empty() {
        assert!(Instant::now() < deadline, "query not archived within 5s");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(queue.list("processed_fingerprints/").await.unwrap().len(), 1);

    // Step 3: References survive a restart
    assert!(service.stop().await);
    assert_eq!(service.buffer().len(), 1);
    assert!(service.start());
    assert!(service.stop().await);
    assert_eq!(service.buffer().len(), 1);
}

#[tokio::test]
async fn test_stop_is_prompt_while_idle() {
    let temp = TempDir::new().unwrap();
    let config = MatcherConfig {
        poll_interval_secs: 60,
        ..MatcherConfig::with_stations(["KFM"])
    };
    let service = MatcherService::new(
        config,
        Arc::new(FsWorkQueue::new(temp.path().join("queue"))),
        Arc::new(FsResultSink::new(temp.path().join("results"))),
    );

    assert!(service.start());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert!(service.stop().await);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_restart_does_not_match_superseded_queries() {
    let temp = TempDir::new().unwrap();
    let queue = Arc::new(FsWorkQueue::new(temp.path().join("queue")));
    let sink = Arc::new(FsResultSink::new(temp.path().join("results")));

    let now = unix_now_secs();
    queue
        .put(
            &ObjectHandle::new(format!("reference_fingerprints/{}_KFM.json", now - 5)),
            &FingerprintRecord::reference(&sequence("KFM", now - 5)).to_json_bytes(),
        )
        .await
        .unwrap();
    for ts in [now - 2, now - 1, now] {
        queue
            .put(
                &ObjectHandle::new(format!("incoming_fingerprints/{}_phone-1.json", ts)),
                &FingerprintRecord::query(&sequence("phone-1", ts)).to_json_bytes(),
            )
            .await
            .unwrap();
    }

    let config = MatcherConfig {
        poll_interval_secs: 1,
        ..MatcherConfig::with_stations(["KFM"])
    };
    let service = MatcherService::new(config, queue.clone(), sink.clone());
    assert!(service.start());

    let deadline = Instant::now() + Duration::from_secs(5);
    while queue.list("processed_fingerprints/").await.unwrap().is_empty() {
        assert!(Instant::now() < deadline, "newest query not archived within 5s");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(service.stop().await);

    // The first tick after a restart runs a cycle straight away
    assert!(service.start());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(service.stop().await);

    assert!(sink.get(&now.to_string()).await.unwrap().is_some());
    assert!(sink.get(&(now - 1).to_string()).await.unwrap().is_none());
    assert!(sink.get(&(now - 2).to_string()).await.unwrap().is_none());
    assert_eq!(queue.list("incoming_fingerprints/").await.unwrap().len(), 2);
}
