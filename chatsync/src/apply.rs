//! The sink updates are handed to once ordering has been resolved.
//!
//! The concrete database/ORM behind this sink is an external collaborator,
//! out of scope here (§1) — only the trait boundary and an in-memory test
//! double live in this crate.

use async_trait::async_trait;
use chatsync_rpc::wire::{BucketKey, Update};

/// Where an applied batch came from, for diagnostics and to let a sink
/// distinguish best-effort realtime application from an authoritative
/// catch-up replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplySource {
    /// Delivered in order as it arrived over the push channel.
    Realtime,
    /// Delivered as the result of a `getUpdates` catch-up fetch.
    SyncCatchup,
}

/// The external sink that materializes updates into local application state.
#[async_trait]
pub trait ApplyUpdates: Send + Sync + 'static {
    /// Apply a batch of updates, already in final delivery order, that
    /// resolved to `bucket` (or `None` for direct/unsequenced updates).
    async fn apply(&self, bucket: Option<BucketKey>, updates: Vec<Update>, source: ApplySource);
}

/// An in-memory recorder used in tests to assert what was applied and in
/// what order, without a real database/ORM behind it.
#[derive(Default)]
pub struct RecordingSink {
    calls: tokio::sync::Mutex<Vec<(Option<BucketKey>, Vec<Update>, ApplySource)>>,
}

impl RecordingSink {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded `apply` calls, oldest first.
    pub async fn calls(&self) -> Vec<(Option<BucketKey>, Vec<Update>, ApplySource)> {
        self.calls.lock().await.clone()
    }

    /// Every update applied so far for `bucket`, in call order, flattened.
    pub async fn applied_for(&self, bucket: Option<BucketKey>) -> Vec<Update> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(b, _, _)| *b == bucket)
            .flat_map(|(_, updates, _)| updates.clone())
            .collect()
    }
}

#[async_trait]
impl ApplyUpdates for RecordingSink {
    async fn apply(&self, bucket: Option<BucketKey>, updates: Vec<Update>, source: ApplySource) {
        self.calls.lock().await.push((bucket, updates, source));
    }
}
