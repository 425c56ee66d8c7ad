//! slotwatch — binary entrypoint.
//! Wires the store, source registry, Telegram channel, scheduler, and
//! onboarding loop; runs until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slotwatch::config::Config;
use slotwatch::notify::telegram::TelegramChannel;
use slotwatch::notify::{DeliveryChannel, Notifier};
use slotwatch::onboarding::Onboarding;
use slotwatch::scheduler::Scheduler;
use slotwatch::sources::SourceRegistry;
use slotwatch::store::SnapshotStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("slotwatch=info,warn")),
        )
        .compact()
        .init();

    let config = Config::from_env()?;
    let store = Arc::new(
        SnapshotStore::open(&config.storage_dir)
            .await
            .context("opening store")?,
    );
    let registry = Arc::new(SourceRegistry::builtin(&config));

    // Channel validation is the launch gate: a bad token ends the process
    // before any polling starts.
    let telegram = Arc::new(
        TelegramChannel::launch(&config.bot_token)
            .await
            .context("failed to launch delivery channel")?,
    );
    let channel: Arc<dyn DeliveryChannel> = telegram.clone();
    let notifier = Arc::new(Notifier::new(channel.clone()));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        notifier.clone(),
        config.tick_interval(),
    ));
    scheduler.spawn();

    let onboarding = Arc::new(Onboarding::new(store, registry, channel, notifier));

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let updates = {
        let telegram = telegram.clone();
        tokio::spawn(async move { telegram.run_updates(events_tx).await })
    };
    let contacts = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            onboarding.handle_contact(&event.recipient).await;
        }
    });

    info!("start");
    shutdown_signal().await;
    info!("shutdown signal received, stopping delivery channel");

    // Stopping the channel ends run_updates; dropping its sender then winds
    // down the contact consumer. The tick loop is simply dropped with the
    // runtime.
    telegram.stop();
    let _ = updates.await;
    let _ = contacts.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = ?e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
