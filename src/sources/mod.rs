// src/sources/mod.rs
//! Pollable sources: the adapter trait plus the process-wide registry.

pub mod reservi;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::snapshot::Snapshot;

/// One pollable data feed.
///
/// Implementations fetch a full snapshot of the external system and render a
/// display message from a diff. Scheduling, storage, diffing and fan-out are
/// the engine's business; adapters stay pure I/O plus formatting.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable source name; the key for all stored state.
    fn name(&self) -> &str;

    /// Fetch the current full snapshot. Failures are per-poll and carry no
    /// retry obligation.
    async fn fetch(&self) -> Result<Snapshot>;

    /// Render one display-ready message for `diff`. Must be pure; an empty
    /// diff still yields the source header.
    fn render_message(&self, diff: &Snapshot) -> String;
}

/// Registry entry: an adapter plus its schedule and registration index.
/// The index feeds the per-source delivery offset.
pub struct Source {
    pub name: String,
    pub polling_interval: Duration,
    pub index: usize,
    pub adapter: Box<dyn SourceAdapter>,
}

impl Source {
    pub fn interval_ms(&self) -> i64 {
        self.polling_interval.as_millis() as i64
    }
}

/// All sources the scheduler sweeps, built once at startup. Order is
/// registration order and stays fixed afterwards.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin registry: one booking-calendar source per configured pool.
    pub fn builtin(config: &Config) -> Self {
        let mut registry = Self::new();
        for pool in reservi::POOLS {
            registry.register(
                config.polling_interval(pool.slug),
                Box::new(reservi::ReserviAdapter::from_pool(pool)),
            );
        }
        registry
    }

    /// Append a source; its name comes from the adapter.
    pub fn register(&mut self, polling_interval: Duration, adapter: Box<dyn SourceAdapter>) {
        let name = adapter.name().to_string();
        self.sources.push(Arc::new(Source {
            name,
            polling_interval,
            index: self.sources.len(),
            adapter,
        }));
    }

    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Source>> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
