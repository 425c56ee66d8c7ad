// tests/scheduler_tick.rs
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;

use slotwatch::notify::{MemoryChannel, Notifier};
use slotwatch::scheduler::Scheduler;
use slotwatch::snapshot::{Entry, Snapshot};
use slotwatch::sources::{SourceAdapter, SourceRegistry};
use slotwatch::store::SnapshotStore;

const INTERVAL: Duration = Duration::from_secs(300);

struct StubAdapter {
    name: String,
    snapshot: std::sync::Mutex<Snapshot>,
    fetches: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    started: Arc<Notify>,
    gate: Option<Arc<Notify>>,
}

#[derive(Clone)]
struct StubHandles {
    fetches: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    started: Arc<Notify>,
}

fn stub(name: &str, snapshot: Snapshot) -> (StubAdapter, StubHandles) {
    let handles = StubHandles {
        fetches: Arc::new(AtomicUsize::new(0)),
        fail: Arc::new(AtomicBool::new(false)),
        started: Arc::new(Notify::new()),
    };
    let adapter = StubAdapter {
        name: name.to_string(),
        snapshot: std::sync::Mutex::new(snapshot),
        fetches: handles.fetches.clone(),
        fail: handles.fail.clone(),
        started: handles.started.clone(),
        gate: None,
    };
    (adapter, handles)
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Snapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("stub fetch refused"));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn render_message(&self, diff: &Snapshot) -> String {
        format!("*{}*\n{}", self.name, diff.len())
    }
}

fn entry(id: &str) -> Entry {
    Entry::new(id, json!({}))
}

async fn open_store(tmp: &tempfile::TempDir) -> Arc<SnapshotStore> {
    Arc::new(
        SnapshotStore::open(tmp.path().to_str().unwrap())
            .await
            .unwrap(),
    )
}

fn scheduler(
    store: &Arc<SnapshotStore>,
    registry: SourceRegistry,
    channel: &Arc<MemoryChannel>,
) -> Arc<Scheduler> {
    let notifier = Arc::new(Notifier::with_stagger(channel.clone(), Duration::ZERO));
    Arc::new(Scheduler::new(
        store.clone(),
        Arc::new(registry),
        notifier,
        Duration::from_secs(10),
    ))
}

#[tokio::test]
async fn due_source_is_fetched_committed_and_notified() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store.add_recipient("7").await.unwrap();

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(store.snapshot("pool-a").await.unwrap(), vec![entry("x")]);
    assert!(store.poll_state("pool-a").await.is_some());
    let msgs = channel.messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].recipient, "7");
    assert_eq!(msgs[0].text, "*pool-a*\n1");
}

#[tokio::test]
async fn fresh_claim_keeps_source_idle() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store
        .claim_poll_timestamp("pool-a", Utc::now().timestamp_millis() - 60_000)
        .await
        .unwrap();

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 0);
    assert!(channel.messages().is_empty());
}

#[tokio::test]
async fn stale_claim_is_polled_again() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store
        .claim_poll_timestamp("pool-a", Utc::now().timestamp_millis() - 301_000)
        .await
        .unwrap();

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn consecutive_ticks_fetch_once() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;
    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_fetch_is_claimed_once() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store.add_recipient("7").await.unwrap();

    let (mut adapter, handles) = stub("pool-a", vec![entry("x")]);
    let gate = Arc::new(Notify::new());
    adapter.gate = Some(gate.clone());
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    let first = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.tick().await })
    };
    handles.started.notified().await;

    // The fetch is parked mid-flight; a second sweep must not schedule it
    // again because the claim is already on disk.
    sched.tick().await;
    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);

    gate.notify_one();
    first.await.unwrap();

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(channel.messages().len(), 1);
}

#[tokio::test]
async fn failing_source_does_not_block_others() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store.add_recipient("7").await.unwrap();

    let (adapter_a, handles_a) = stub("pool-a", vec![entry("x")]);
    handles_a.fail.store(true, Ordering::SeqCst);
    let (adapter_b, handles_b) = stub("pool-b", vec![entry("z")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter_a));
    registry.register(INTERVAL, Box::new(adapter_b));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;

    assert_eq!(handles_a.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(handles_b.fetches.load(Ordering::SeqCst), 1);
    assert!(store.snapshot("pool-a").await.is_none());
    assert_eq!(store.snapshot("pool-b").await.unwrap(), vec![entry("z")]);
    let msgs = channel.messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].text, "*pool-b*\n1");
}

#[tokio::test]
async fn fetch_failure_skips_commit_and_keeps_claim() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store.add_recipient("7").await.unwrap();

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    handles.fail.store(true, Ordering::SeqCst);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);
    assert!(store.snapshot("pool-a").await.is_none());
    assert!(channel.messages().is_empty());

    // The claim stays; the source waits out its interval before a retry.
    sched.tick().await;
    assert_eq!(handles.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unchanged_refetch_notifies_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store.add_recipient("7").await.unwrap();

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;
    assert_eq!(channel.messages().len(), 1);

    store
        .claim_poll_timestamp("pool-a", Utc::now().timestamp_millis() - 301_000)
        .await
        .unwrap();
    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(channel.messages().len(), 1);
}

#[tokio::test]
async fn claim_failure_aborts_before_fetch() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp).await;
    store.add_recipient("7").await.unwrap();
    std::fs::remove_dir_all(tmp.path()).unwrap();

    let (adapter, handles) = stub("pool-a", vec![entry("x")]);
    let mut registry = SourceRegistry::new();
    registry.register(INTERVAL, Box::new(adapter));
    let channel = Arc::new(MemoryChannel::new());
    let sched = scheduler(&store, registry, &channel);

    sched.tick().await;

    assert_eq!(handles.fetches.load(Ordering::SeqCst), 0);
    assert!(channel.messages().is_empty());
    assert!(store.poll_state("pool-a").await.is_none());
}
