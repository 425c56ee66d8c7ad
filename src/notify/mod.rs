// src/notify/mod.rs
//! Notification fan-out: one formatted message per changed source, delivered
//! to every recipient with a fixed delay between sends.

pub mod telegram;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use metrics::counter;
use tracing::warn;

use crate::snapshot::{diff, Snapshot};
use crate::sources::Source;
use crate::store::RecipientId;

/// Outbound message transport. `text` is display-ready Markdown. Failures
/// are per-recipient and carry no retry obligation.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<()>;
}

/// Delay between two deliveries of the same notification event.
pub const STAGGER: Duration = Duration::from_secs(1);

pub struct Notifier {
    channel: Arc<dyn DeliveryChannel>,
    stagger: Duration,
}

impl Notifier {
    pub fn new(channel: Arc<dyn DeliveryChannel>) -> Self {
        Self {
            channel,
            stagger: STAGGER,
        }
    }

    pub fn with_stagger(channel: Arc<dyn DeliveryChannel>, stagger: Duration) -> Self {
        Self { channel, stagger }
    }

    /// Compare snapshots, format once, deliver to each recipient in order.
    ///
    /// Nothing is sent when `current` equals `previous` wholesale. When they
    /// differ, the message covers exactly the diff; a reshuffle with no new
    /// identity keys still produces the header-only message. Dispatch starts
    /// after a per-source offset (`source.index` ms) and waits one stagger
    /// unit between recipients; a failed send is logged and the remaining
    /// recipients still get theirs.
    ///
    /// Returns `true` when the recipient set was non-empty and deliveries
    /// were attempted.
    pub async fn notify(
        &self,
        recipients: &[RecipientId],
        previous: Option<&Snapshot>,
        current: &Snapshot,
        source: &Source,
    ) -> bool {
        if previous == Some(current) {
            return false;
        }
        if recipients.is_empty() {
            return false;
        }

        let fresh = diff(previous.map(|s| s.as_slice()), current);
        let text = source.adapter.render_message(&fresh);

        counter!("notify_events_total").increment(1);
        tokio::time::sleep(Duration::from_millis(source.index as u64)).await;
        for (i, recipient) in recipients.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            match self.channel.send(recipient, &text).await {
                Ok(()) => {
                    counter!("notify_deliveries_total").increment(1);
                }
                Err(e) => {
                    counter!("notify_delivery_errors_total").increment(1);
                    warn!(
                        error = ?e,
                        recipient = recipient.as_str(),
                        source = source.name.as_str(),
                        "delivery failed"
                    );
                }
            }
        }
        true
    }
}

// --- Test helper ---

/// What a [`MemoryChannel`] recorded for one send.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipient: RecipientId,
    pub text: String,
    pub at: tokio::time::Instant,
}

/// Recording channel for tests: captures every send, optionally failing
/// for chosen recipients.
#[derive(Default)]
pub struct MemoryChannel {
    sent: std::sync::Mutex<Vec<SentMessage>>,
    failing: std::sync::Mutex<HashSet<RecipientId>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_recipient(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for MemoryChannel {
    async fn send(&self, recipient: &str, text: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(recipient) {
            anyhow::bail!("simulated delivery failure for {recipient}");
        }
        self.sent.lock().unwrap().push(SentMessage {
            recipient: recipient.to_string(),
            text: text.to_string(),
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }
}
