// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod config;
pub mod notify;
pub mod onboarding;
pub mod scheduler;
pub mod snapshot;
pub mod sources;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::notify::telegram::{ContactEvent, TelegramChannel};
pub use crate::notify::{DeliveryChannel, MemoryChannel, Notifier};
pub use crate::onboarding::Onboarding;
pub use crate::scheduler::Scheduler;
pub use crate::snapshot::{diff, Entry, Snapshot};
pub use crate::sources::{Source, SourceAdapter, SourceRegistry};
pub use crate::store::{PollState, RecipientId, SnapshotStore};
