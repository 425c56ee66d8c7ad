// src/snapshot.rs
//! Snapshot values and the identity-key diff.
//!
//! The engine never interprets payloads. The only field it reads is the
//! `identity` string an adapter derives from whatever fields it considers
//! identifying; payloads ride along for the adapter's own rendering.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// One record of a source snapshot.
///
/// Two entries with equal `identity` are the same entry regardless of what
/// their payloads say. An entry whose payload changed without changing its
/// identity key is therefore invisible to [`diff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub identity: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Entry {
    pub fn new(identity: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            identity: identity.into(),
            payload,
        }
    }
}

/// A full fetch result for one source, in the order the adapter produced it.
pub type Snapshot = Vec<Entry>;

/// Entries of `current` whose identity key is absent from `previous`.
///
/// Entries only present in `previous` (disappearances) are ignored. The
/// relative order of `current` is preserved, so equal inputs always produce
/// the same output. `previous = None` means the source has never been polled
/// successfully and everything in `current` counts as new.
pub fn diff(previous: Option<&[Entry]>, current: &[Entry]) -> Snapshot {
    let known: HashSet<&str> = previous
        .unwrap_or_default()
        .iter()
        .map(|e| e.identity.as_str())
        .collect();
    current
        .iter()
        .filter(|e| !known.contains(e.identity.as_str()))
        .cloned()
        .collect()
}
