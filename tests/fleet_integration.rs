//! Integration tests for the engine, local fleet and worker agents.
//!
//! Each test runs real `sh` subprocesses on an in-process fleet backed by the
//! in-memory broker and object store, with short grace and lease timings.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use turbine::config::{EngineConfig, RetryPolicy, TerminationPolicy, WorkerConfig};
use turbine::error::{Error, FleetError};
use turbine::fleet::{ComputeFleet, LocalFleet};
use turbine::queue::{InMemoryBroker, RedeliveryPolicy};
use turbine::staging::InMemoryObjectStore;
use turbine::task::{FileMapping, TaskEnvelope};
use turbine::{Engine, StartRequest};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

const NO_FILES: [FileMapping; 0] = [];

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryObjectStore>,
    fleet: Arc<LocalFleet>,
    engine: Engine,
    scratch: TempDir,
}

fn worker_config(scratch: &TempDir) -> WorkerConfig {
    WorkerConfig {
        pull_wait: Duration::from_millis(100),
        lease_extension_interval: Duration::from_millis(200),
        lease_extension: Duration::from_secs(1),
        script_timeout: Duration::from_secs(30),
        transfer_timeout: Duration::from_secs(5),
        scratch_root: scratch.path().join("work"),
        termination: TerminationPolicy {
            grace_interval: Duration::from_millis(200),
            confirmations: 3,
        },
        retry: RetryPolicy::default(),
    }
}

async fn harness(name: &str, redelivery: RedeliveryPolicy) -> Harness {
    let scratch = TempDir::new().unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryObjectStore::new());
    let fleet = LocalFleet::new(broker.clone(), store.clone(), worker_config(&scratch));
    let engine = Engine::new(
        name,
        "turbine:test",
        broker.clone(),
        fleet.clone(),
        EngineConfig {
            redelivery,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    Harness {
        broker,
        store,
        fleet,
        engine,
        scratch,
    }
}

fn short_leases() -> RedeliveryPolicy {
    RedeliveryPolicy {
        max_attempts: 5,
        ack_deadline: Duration::from_secs(1),
        dead_letter_topic: None,
    }
}

async fn drain(h: &Harness) {
    let drained = h
        .engine
        .wait_until_drained(Duration::from_millis(50), TEST_TIMEOUT)
        .await
        .unwrap();
    assert!(drained, "fleet did not scale to zero");
}

#[tokio::test]
async fn word_count_end_to_end() {
    let h = harness("wc", short_leases()).await;
    h.store.insert("bucket", "seed.txt", "a b c\n").await;

    let id = h
        .engine
        .add_task(
            "wc in.txt > out.txt",
            [("in.txt", "mem://bucket/seed.txt")],
            [("out.txt", "mem://bucket/result.txt")],
        )
        .await
        .unwrap();
    h.engine.start(&StartRequest::new(1, "local")).await.unwrap();
    drain(&h).await;

    let result = h.store.get_text("bucket", "result.txt").await.unwrap();
    let fields: Vec<_> = result.split_whitespace().collect();
    assert_eq!(fields, vec!["1", "3", "6", "in.txt"]);
    assert_eq!(h.broker.ack_count(&id).await, 1);

    h.engine.stop().await.unwrap();
    h.engine.cleanup().await.unwrap();
}

#[tokio::test]
async fn every_task_acknowledged_once_across_workers() {
    let h = harness("many", short_leases()).await;
    let envelopes = (0..8).map(|i| {
        TaskEnvelope::new(format!("echo {i} > out.txt"))
            .with_output("out.txt", format!("mem://bucket/out-{i}.txt"))
    });
    let ids = h.engine.add_tasks(envelopes).await.unwrap();

    h.engine.start(&StartRequest::new(3, "local")).await.unwrap();
    drain(&h).await;

    for id in &ids {
        assert_eq!(h.broker.ack_count(id).await, 1, "message {id}");
    }
    for i in 0..8 {
        let out = h.store.get_text("bucket", &format!("out-{i}.txt")).await;
        assert_eq!(out.as_deref().map(str::trim), Some(i.to_string().as_str()));
    }
    let status = h.engine.workers().await.unwrap().unwrap();
    assert_eq!(status.target_size, 0);
    assert!(h.broker.dead_letters().await.is_empty());
}

#[tokio::test]
async fn preempted_attempt_is_redelivered_into_fresh_directory() {
    let h = harness("crash", short_leases()).await;
    let log = h.scratch.path().join("attempts.log");
    let script = format!(
        "ls > seen.txt\necho \"$PWD\" >> {log}\ntouch partial.txt\nsleep 1\ncp seen.txt out.txt",
        log = log.display()
    );
    let id = h
        .engine
        .add_task(script, NO_FILES, [("out.txt", "mem://bucket/seen.txt")])
        .await
        .unwrap();
    h.engine.start(&StartRequest::new(1, "local")).await.unwrap();

    // Preempt the instance while the first attempt is executing; the fleet
    // heals on its own.
    let started = timeout(TEST_TIMEOUT, async {
        while !log.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(started.is_ok(), "first attempt never started");
    h.fleet
        .kill_instance("crash-group", "crash-group-0")
        .await
        .unwrap();

    let healed = timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(status) = h.engine.workers().await.unwrap() {
                if status.instances.iter().any(|i| i.name == "crash-group-1") {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("lost instance was never replaced");
    assert_eq!(healed.target_size, 1);

    drain(&h).await;

    let attempts = std::fs::read_to_string(&log).unwrap();
    let dirs: Vec<_> = attempts.lines().collect();
    assert_eq!(dirs.len(), 2, "expected exactly two attempts: {attempts}");
    assert_ne!(dirs[0], dirs[1]);
    assert!(dirs[1].contains(&format!("{id}-2-")));

    let seen = h.store.get_text("bucket", "seen.txt").await.unwrap();
    assert!(!seen.contains("partial.txt"), "stale state leaked: {seen}");
    assert_eq!(h.broker.ack_count(&id).await, 1);
}

#[tokio::test]
async fn idle_worker_waits_for_peer_lease() {
    let h = harness("peer", short_leases()).await;
    h.engine
        .add_task(
            "sleep 1.5; echo ok > out.txt",
            NO_FILES,
            [("out.txt", "mem://bucket/ok.txt")],
        )
        .await
        .unwrap();
    h.engine.start(&StartRequest::new(2, "local")).await.unwrap();

    // Past the idle worker's full grace window, the task is still running.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let status = h.engine.workers().await.unwrap().unwrap();
    assert_eq!(status.target_size, 2);
    assert!(h.store.get_text("bucket", "ok.txt").await.is_none());

    drain(&h).await;
    assert_eq!(
        h.store.get_text("bucket", "ok.txt").await.as_deref(),
        Some("ok\n")
    );
}

#[tokio::test]
async fn exhausted_task_is_dead_lettered_and_fleet_drains() {
    let h = harness(
        "dead",
        RedeliveryPolicy {
            max_attempts: 2,
            ack_deadline: Duration::from_millis(300),
            dead_letter_topic: None,
        },
    )
    .await;
    let id = h
        .engine
        .add_task(
            "cat in.txt",
            [("in.txt", "mem://bucket/never-uploaded.txt")],
            NO_FILES,
        )
        .await
        .unwrap();
    h.engine.start(&StartRequest::new(1, "local")).await.unwrap();
    drain(&h).await;

    let dead = h.broker.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(h.broker.ack_count(&id).await, 0);
}

#[tokio::test]
async fn stop_then_cleanup_leaves_nothing_behind() {
    let h = harness("tidy", short_leases()).await;
    h.engine
        .start(&StartRequest::new(2, "local").delete_when_done(false))
        .await
        .unwrap();

    let err = h.engine.cleanup().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Fleet(FleetError::LiveWorkers { count: 2, .. })
    ));
    assert!(h.broker.has_subscription("tidy-sub").await);

    h.engine.stop().await.unwrap();
    h.engine.stop().await.unwrap();
    h.engine.cleanup().await.unwrap();

    assert!(!h.broker.has_subscription("tidy-sub").await);
    assert!(!h.broker.has_topic("tidy-topic").await);
    assert!(h.fleet.template("tidy-template").await.is_none());
    assert!(h.fleet.describe_group("tidy-group").await.unwrap().is_none());
}

#[tokio::test]
async fn queued_work_survives_stop_for_the_next_fleet() {
    let h = harness("later", short_leases()).await;
    h.engine
        .start(&StartRequest::new(1, "local").delete_when_done(false))
        .await
        .unwrap();
    h.engine.stop().await.unwrap();

    let id = h
        .engine
        .add_task("echo hi > out.txt", NO_FILES, [("out.txt", "mem://bucket/hi.txt")])
        .await
        .unwrap();
    assert_eq!(h.engine.queue().approximate_depth().await.unwrap(), 1);

    h.engine.start(&StartRequest::new(1, "local")).await.unwrap();
    drain(&h).await;
    assert_eq!(h.broker.ack_count(&id).await, 1);
    assert_eq!(
        h.store.get_text("bucket", "hi.txt").await.as_deref(),
        Some("hi\n")
    );
}
