// src/onboarding.rs
//! First contact: register the recipient, acknowledge, and send them the
//! current snapshot of every source as a baseline.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::notify::{DeliveryChannel, Notifier, STAGGER};
use crate::sources::SourceRegistry;
use crate::store::SnapshotStore;

const WELCOME_REPLY: &str = "Welcome";
const KNOWN_REPLY: &str = "I know you (≖_≖) ";

pub struct Onboarding {
    store: Arc<SnapshotStore>,
    registry: Arc<SourceRegistry>,
    channel: Arc<dyn DeliveryChannel>,
    notifier: Arc<Notifier>,
}

impl Onboarding {
    pub fn new(
        store: Arc<SnapshotStore>,
        registry: Arc<SourceRegistry>,
        channel: Arc<dyn DeliveryChannel>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            channel,
            notifier,
        }
    }

    /// Handle one contact event. Idempotent: a known id only gets the
    /// already-known acknowledgment, never a second welcome or baseline.
    /// A failed registration is logged and acknowledged the same way, so a
    /// recipient the store never recorded is not greeted as new.
    pub async fn handle_contact(&self, recipient: &str) {
        match self.store.add_recipient(recipient).await {
            Ok(true) => {
                info!(recipient, "adding new recipient");
                self.reply(recipient, WELCOME_REPLY).await;
                self.spawn_welcome(recipient.to_string());
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = ?e, recipient, "failed to register recipient");
            }
        }
        self.reply(recipient, KNOWN_REPLY).await;
    }

    async fn reply(&self, recipient: &str, text: &str) {
        if let Err(e) = self.channel.send(recipient, text).await {
            warn!(error = ?e, recipient, "acknowledgment failed");
        }
    }

    /// Walk the registry in order, one source per stagger unit, sending each
    /// stored snapshot to the new recipient as a full diff. Sources that
    /// were never polled successfully are skipped.
    fn spawn_welcome(&self, recipient: String) {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let targets = vec![recipient];
            for (i, source) in registry.sources().iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(STAGGER).await;
                }
                let Some(snapshot) = store.snapshot(&source.name).await else {
                    debug!(source = source.name.as_str(), "no snapshot yet, skipping");
                    continue;
                };
                let sent = notifier.notify(&targets, None, &snapshot, source).await;
                if sent {
                    info!(
                        source = source.name.as_str(),
                        recipient = targets[0].as_str(),
                        "messages sent"
                    );
                } else {
                    info!(source = source.name.as_str(), "nothing to send");
                }
            }
        });
    }
}
