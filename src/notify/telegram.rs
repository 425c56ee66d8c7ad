// src/notify/telegram.rs
//! Telegram Bot API transport: outbound `sendMessage` plus a long-polling
//! `getUpdates` loop that surfaces first contacts (`/start`).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::DeliveryChannel;
use crate::store::RecipientId;

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the API may hold an empty `getUpdates` before answering.
const POLL_HOLD_SECS: u64 = 30;
const POLL_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// A recipient opened a conversation with the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEvent {
    pub recipient: RecipientId,
}

pub struct TelegramChannel {
    client: Client,
    base: String,
    stop_tx: watch::Sender<bool>,
}

impl TelegramChannel {
    /// Validate the token against the API and build the channel. A failure
    /// here is fatal to the caller; the engine cannot run undelivered.
    pub async fn launch(token: &str) -> Result<Self> {
        let client = Client::new();
        let base = format!("{API_BASE}/bot{token}");
        let reply: ApiReply<BotInfo> = client
            .get(format!("{base}/getMe"))
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .context("getMe request failed")?
            .json()
            .await
            .context("getMe returned unreadable body")?;
        if !reply.ok {
            return Err(anyhow!(
                "getMe rejected: {}",
                reply.description.unwrap_or_default()
            ));
        }
        let username = reply
            .result
            .and_then(|b| b.username)
            .unwrap_or_default();
        info!(bot = username.as_str(), "delivery channel launched");

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            client,
            base,
            stop_tx,
        })
    }

    /// Ask the update loop to wind down after its in-flight request.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Long-poll `getUpdates` until [`stop`](Self::stop) is called, pushing
    /// a [`ContactEvent`] for every `/start` message. Transient API errors
    /// are logged and retried after a short pause.
    pub async fn run_updates(&self, events: mpsc::Sender<ContactEvent>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut offset: i64 = 0;
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let updates = tokio::select! {
                res = self.poll_updates(offset) => match res {
                    Ok(u) => u,
                    Err(e) => {
                        warn!(error = ?e, "getUpdates failed");
                        tokio::time::sleep(POLL_RETRY_PAUSE).await;
                        continue;
                    }
                },
                _ = stop_rx.changed() => break,
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else { continue };
                if message.text.as_deref() != Some("/start") {
                    continue;
                }
                let Some(from) = message.from else { continue };
                let event = ContactEvent {
                    recipient: from.id.to_string(),
                };
                if events.send(event).await.is_err() {
                    // Consumer gone; nothing left to deliver to.
                    return;
                }
            }
        }
        info!("update polling stopped");
    }

    async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let reply: ApiReply<Vec<Update>> = self
            .client
            .get(format!("{}/getUpdates", self.base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_HOLD_SECS.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(Duration::from_secs(POLL_HOLD_SECS + 10))
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates returned unreadable body")?;
        if !reply.ok {
            return Err(anyhow!(
                "getUpdates rejected: {}",
                reply.description.unwrap_or_default()
            ));
        }
        Ok(reply.result.unwrap_or_default())
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send(&self, recipient: &str, text: &str) -> Result<()> {
        let body = SendMessageBody {
            chat_id: recipient,
            text,
            parse_mode: "Markdown",
        };
        let resp = self
            .client
            .post(format!("{}/sendMessage", self.base))
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?;
        resp.error_for_status()
            .context("sendMessage returned error status")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BotInfo {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: Option<User>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}
