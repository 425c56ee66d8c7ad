// src/scheduler.rs
//! The tick loop: a fixed-period sweep over all registered sources, each
//! evaluated and polled independently of the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::sources::{Source, SourceRegistry};
use crate::store::{RecipientId, SnapshotStore};

/// One-time metrics registration.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("poll_ticks_total", "Scheduler ticks executed.");
        describe_counter!("poll_fetches_total", "Source fetches started.");
        describe_counter!("poll_fetch_errors_total", "Source fetch failures.");
        describe_counter!("store_write_errors_total", "Durable store write failures.");
        describe_counter!(
            "notify_events_total",
            "Notification events with at least one delivery attempt."
        );
        describe_counter!(
            "notify_deliveries_total",
            "Messages handed to the delivery channel."
        );
        describe_counter!(
            "notify_delivery_errors_total",
            "Per-recipient delivery failures."
        );
        describe_counter!("source_entries_total", "Entries parsed from sources.");
        describe_histogram!("source_parse_ms", "Source parse time in milliseconds.");
        describe_gauge!("poll_last_tick_ts", "Unix ts when the last tick completed.");
    });
}

pub struct Scheduler {
    store: Arc<SnapshotStore>,
    registry: Arc<SourceRegistry>,
    notifier: Arc<Notifier>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<SnapshotStore>,
        registry: Arc<SourceRegistry>,
        notifier: Arc<Notifier>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            tick_interval,
        }
    }

    /// Spawn the tick driver. The next tick is scheduled only after the
    /// current tick's work has settled, so a slow sweep stretches the period
    /// instead of stacking up.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::time::sleep(self.tick_interval).await;
            }
        })
    }

    /// One sweep: read the recipient set once, then evaluate every source
    /// concurrently and wait for all of them to settle.
    pub async fn tick(&self) {
        ensure_metrics_described();

        let recipients = Arc::new(self.store.recipients().await);
        let mut handles = Vec::with_capacity(self.registry.len());
        for source in self.registry.sources() {
            let source = Arc::clone(source);
            let store = Arc::clone(&self.store);
            let notifier = Arc::clone(&self.notifier);
            let recipients = Arc::clone(&recipients);
            handles.push(tokio::spawn(async move {
                poll_source(&store, &notifier, &recipients, &source).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = ?e, "source task aborted");
            }
        }

        counter!("poll_ticks_total").increment(1);
        gauge!("poll_last_tick_ts").set(Utc::now().timestamp() as f64);
    }
}

/// claim → fetch → commit → notify for one source. Every failure point is
/// local to this source: it is logged, the poll ends, and the next due tick
/// starts a fresh cycle.
async fn poll_source(
    store: &SnapshotStore,
    notifier: &Notifier,
    recipients: &[RecipientId],
    source: &Source,
) {
    let now_ms = Utc::now().timestamp_millis();
    let last = store
        .poll_state(&source.name)
        .await
        .map(|s| s.timestamp)
        .unwrap_or(0);
    if now_ms - last < source.interval_ms() {
        return;
    }

    info!(source = source.name.as_str(), "fetching data");
    // Claim before fetching: a fetch outlasting the next tick must not be
    // scheduled twice.
    if let Err(e) = store.claim_poll_timestamp(&source.name, now_ms).await {
        counter!("store_write_errors_total").increment(1);
        warn!(error = ?e, source = source.name.as_str(), "claiming poll timestamp failed");
        return;
    }

    counter!("poll_fetches_total").increment(1);
    let current = match source.adapter.fetch().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            counter!("poll_fetch_errors_total").increment(1);
            warn!(error = ?e, source = source.name.as_str(), "fetch failed");
            return;
        }
    };

    let previous = store.snapshot(&source.name).await;
    if let Err(e) = store.commit_snapshot(&source.name, current.clone()).await {
        counter!("store_write_errors_total").increment(1);
        warn!(
            error = ?e,
            source = source.name.as_str(),
            "committing snapshot failed, skipping notification"
        );
        return;
    }

    let sent = notifier
        .notify(recipients, previous.as_ref(), &current, source)
        .await;
    if sent {
        info!(source = source.name.as_str(), "messages sent");
    } else {
        info!(source = source.name.as_str(), "nothing to send");
    }
}
