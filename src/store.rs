// src/store.rs
//! Durable state for the whole engine: one JSON document (`db.json`) holding
//! the last committed snapshot per source, the recipient registry, and the
//! per-source poll state.
//!
//! Reads are served from the in-memory root. Every mutation rewrites the
//! full document before returning; a failed write rolls the in-memory root
//! back so memory never claims state the disk does not have.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::snapshot::Snapshot;

const DB_FILE: &str = "db.json";

pub type RecipientId = String;

/// Subscription record. Carries nothing beyond the id today; kept as a
/// struct so the stored shape can grow without a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
}

/// Last claimed poll time for one source, milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollState {
    pub timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistentRoot {
    #[serde(default)]
    data: BTreeMap<String, Snapshot>,
    #[serde(default)]
    users: BTreeMap<RecipientId, Recipient>,
    #[serde(default)]
    state: BTreeMap<String, PollState>,
}

pub struct SnapshotStore {
    path: PathBuf,
    root: Mutex<PersistentRoot>,
}

impl SnapshotStore {
    /// Open `db.json` under `dir`, creating it with empty defaults if it
    /// does not exist yet. `dir` may be empty (current directory).
    pub async fn open(dir: &str) -> Result<Self> {
        let path = db_path(dir);
        let root = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing store at {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => PersistentRoot::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading store at {}", path.display()))
            }
        };
        let store = Self {
            path,
            root: Mutex::new(root),
        };
        // Write-through on open so the file exists from startup on, with any
        // missing top-level sections filled in.
        {
            let root = store.root.lock().await;
            store.flush(&root).await?;
        }
        Ok(store)
    }

    /// Last committed snapshot for `source`, if it was ever polled
    /// successfully. An absent snapshot is distinct from an empty one.
    pub async fn snapshot(&self, source: &str) -> Option<Snapshot> {
        self.root.lock().await.data.get(source).cloned()
    }

    /// Replace the stored snapshot for `source` wholesale.
    pub async fn commit_snapshot(&self, source: &str, snapshot: Snapshot) -> Result<()> {
        let mut root = self.root.lock().await;
        let previous = root.data.insert(source.to_string(), snapshot);
        if let Err(e) = self.flush(&root).await {
            match previous {
                Some(p) => root.data.insert(source.to_string(), p),
                None => root.data.remove(source),
            };
            return Err(e);
        }
        Ok(())
    }

    pub async fn poll_state(&self, source: &str) -> Option<PollState> {
        self.root.lock().await.state.get(source).copied()
    }

    /// Record `timestamp` as the moment `source` was claimed for polling.
    /// Written before the fetch starts, so a slow fetch cannot be scheduled
    /// twice.
    pub async fn claim_poll_timestamp(&self, source: &str, timestamp: i64) -> Result<()> {
        let mut root = self.root.lock().await;
        let previous = root.state.insert(source.to_string(), PollState { timestamp });
        if let Err(e) = self.flush(&root).await {
            match previous {
                Some(p) => root.state.insert(source.to_string(), p),
                None => root.state.remove(source),
            };
            return Err(e);
        }
        Ok(())
    }

    /// All registered recipient ids, in stable (sorted) order.
    pub async fn recipients(&self) -> Vec<RecipientId> {
        self.root.lock().await.users.keys().cloned().collect()
    }

    /// Register a recipient. Returns `true` if the id was newly added;
    /// a known id is a no-op without a disk write.
    pub async fn add_recipient(&self, id: &str) -> Result<bool> {
        let mut root = self.root.lock().await;
        if root.users.contains_key(id) {
            return Ok(false);
        }
        root.users
            .insert(id.to_string(), Recipient { id: id.to_string() });
        if let Err(e) = self.flush(&root).await {
            root.users.remove(id);
            return Err(e);
        }
        Ok(true)
    }

    async fn flush(&self, root: &PersistentRoot) -> Result<()> {
        let raw = serde_json::to_vec_pretty(root).context("serializing store")?;
        fs::write(&self.path, raw)
            .await
            .with_context(|| format!("writing store at {}", self.path.display()))
    }
}

fn db_path(dir: &str) -> PathBuf {
    let dir = dir.trim();
    if dir.is_empty() {
        PathBuf::from(DB_FILE)
    } else {
        Path::new(dir).join(DB_FILE)
    }
}
