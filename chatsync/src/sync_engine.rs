//! Top-level update router (§4.7): classifies inbound updates, routes
//! sequenced ones to their owning `BucketEngine`, applies direct updates
//! immediately, and drives bootstrap and the `lastSyncDate` watermark.

use crate::apply::{ApplySource, ApplyUpdates};
use crate::bucket_engine::{BucketEngine, SyncEngineHandle};
use crate::bucket_store::{BucketCursor, BucketStore, GlobalSyncState};
use crate::config::SyncConfig;
use crate::fetch_limiter::FetchLimiter;
use async_trait::async_trait;
use chatsync_rpc::wire::{BucketKey, GetUpdatesStateInput, GetUpdatesStateOutput, Update, UpdateKind};
use chatsync_rpc::RpcTransport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Counters tracking protocol-level conditions that are never thrown across
/// the engine's public surface (§7), only recorded here and logged.
#[derive(Default)]
pub struct SyncStats {
    pub bucket_updates_duplicate_skipped: AtomicU64,
    pub bucket_fetch_too_long: AtomicU64,
    pub bucket_fetch_retry: AtomicU64,
}

impl SyncStats {
    /// A point-in-time snapshot of the counters, for assertions and metrics export.
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            bucket_updates_duplicate_skipped: self.bucket_updates_duplicate_skipped.load(Ordering::Relaxed),
            bucket_fetch_too_long: self.bucket_fetch_too_long.load(Ordering::Relaxed),
            bucket_fetch_retry: self.bucket_fetch_retry.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub bucket_updates_duplicate_skipped: u64,
    pub bucket_fetch_too_long: u64,
    pub bucket_fetch_retry: u64,
}

/// Shared state behind the [`SyncEngineHandle`] a `BucketEngine` calls back
/// into. Deliberately holds none of the bucket map itself, so handing it out
/// as `Arc<dyn SyncEngineHandle>` creates no reference cycle with `SyncEngine`.
struct Shared {
    apply: Arc<dyn ApplyUpdates>,
    bucket_store: Arc<BucketStore>,
    stats: Arc<SyncStats>,
    config: SyncConfig,
    last_sync_date: Mutex<i64>,
}

#[async_trait]
impl SyncEngineHandle for Shared {
    async fn apply_updates_from_bucket(&self, bucket: BucketKey, updates: Vec<Update>, source: ApplySource) {
        self.apply.apply(Some(bucket), updates, source).await;
    }

    async fn save_bucket_state(&self, bucket: BucketKey, cursor: BucketCursor) {
        if let Err(e) = self.bucket_store.set_cursor(&bucket, cursor).await {
            tracing::warn!(%bucket, "failed to persist bucket cursor: {e}");
        }
    }

    fn record_bucket_fetch_too_long(&self, bucket: BucketKey) {
        self.stats.bucket_fetch_too_long.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%bucket, "getUpdates reported tooLong; cursor fast-forwarded");
    }

    fn record_bucket_fetch_duplicate_skipped(&self, bucket: BucketKey) {
        self.stats
            .bucket_updates_duplicate_skipped
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%bucket, "dropped duplicate update");
    }

    fn record_bucket_fetch_retry(&self, bucket: BucketKey) {
        self.stats.bucket_fetch_retry.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%bucket, "catch-up fetch failed; retry scheduled");
    }

    async fn update_last_sync_date(&self, applied_max_date: i64) {
        let proposed = (applied_max_date - self.config.safety_gap_secs).max(0);
        let mut guard = self.last_sync_date.lock().await;
        if proposed > *guard {
            *guard = proposed;
            drop(guard);
            if let Err(e) = self
                .bucket_store
                .set_global(GlobalSyncState { last_sync_date: proposed })
                .await
            {
                tracing::warn!("failed to persist lastSyncDate watermark: {e}");
            }
        }
    }
}

/// Top-level router holding the bucket map, the `FetchLimiter`, the
/// `SyncConfig`, and the `SyncStats` counters.
pub struct SyncEngine {
    shared: Arc<Shared>,
    buckets: Mutex<HashMap<BucketKey, Arc<BucketEngine>>>,
    transport: Arc<RpcTransport>,
    limiter: Arc<FetchLimiter>,
    bucket_store: Arc<BucketStore>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Build a sync engine. `bucket_store` backs both bucket cursor
    /// rehydration and the global watermark.
    pub fn new(
        transport: Arc<RpcTransport>,
        bucket_store: Arc<BucketStore>,
        apply: Arc<dyn ApplyUpdates>,
        config: SyncConfig,
    ) -> Self {
        let limiter = Arc::new(FetchLimiter::new(config.fetch_limiter_capacity));
        Self {
            shared: Arc::new(Shared {
                apply,
                bucket_store: bucket_store.clone(),
                stats: Arc::new(SyncStats::default()),
                config: config.clone(),
                last_sync_date: Mutex::new(0),
            }),
            buckets: Mutex::new(HashMap::new()),
            transport,
            limiter,
            bucket_store,
            config,
        }
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> SyncStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The monotonically non-decreasing sync watermark.
    pub async fn last_sync_date(&self) -> i64 {
        *self.shared.last_sync_date.lock().await
    }

    async fn get_or_create_bucket(&self, key: BucketKey) -> Arc<BucketEngine> {
        let mut buckets = self.buckets.lock().await;
        if let Some(engine) = buckets.get(&key) {
            return engine.clone();
        }
        let cursor = self
            .bucket_store
            .get_cursor(&key)
            .await
            .unwrap_or(BucketCursor::COLD_START);
        let engine = BucketEngine::new(
            key,
            cursor,
            self.shared.clone(),
            self.transport.clone(),
            self.limiter.clone(),
            self.config.clone(),
        );
        buckets.insert(key, engine.clone());
        engine
    }

    /// §4.7 `process`: partition inbound updates and route each group.
    pub async fn process(&self, updates: Vec<Update>) {
        let mut signals = Vec::new();
        let mut sequenced: HashMap<BucketKey, Vec<Update>> = HashMap::new();
        let mut direct = Vec::new();

        for update in updates {
            match &update.kind {
                UpdateKind::ChatHasNewUpdates { peer, update_seq } => {
                    signals.push((BucketKey::Chat(*peer), *update_seq));
                }
                UpdateKind::SpaceHasNewUpdates { space_id, update_seq } => {
                    signals.push((BucketKey::Space(*space_id), *update_seq));
                }
                _ => {
                    let bucket = update.kind.bucket_key();
                    let seq = update.seq.unwrap_or(0);
                    match bucket {
                        Some(key) if seq > 0 => {
                            sequenced.entry(key).or_default().push(update);
                        }
                        _ => direct.push((bucket, update)),
                    }
                }
            }
        }

        for (bucket, up_to_seq) in signals {
            let engine = self.get_or_create_bucket(bucket).await;
            engine.note_has_new_updates(up_to_seq).await;
        }

        if !direct.is_empty() {
            let max_date = direct.iter().map(|(_, u)| u.date).max().unwrap_or(0);
            for (bucket, update) in &direct {
                let seq = update.seq.unwrap_or(0);
                if let Some(key) = bucket {
                    if seq > 0 {
                        let cursor = BucketCursor {
                            seq,
                            date: update.date,
                        };
                        let existing = self.bucket_store.get_cursor(key).await.unwrap_or_default();
                        if cursor.seq > existing.seq {
                            let _ = self.bucket_store.set_cursor(key, cursor).await;
                        }
                    }
                }
            }
            let updates: Vec<Update> = direct.into_iter().map(|(_, u)| u).collect();
            self.shared.apply.apply(None, updates, ApplySource::Realtime).await;
            self.shared.update_last_sync_date(max_date).await;
        }

        for (bucket, updates) in sequenced {
            let engine = self.get_or_create_bucket(bucket).await;
            engine.process_realtime(updates).await;
        }
    }

    /// §4.7 `connectionStateChanged(connected)`: fire a `user` bucket fetch
    /// and bootstrap via `getUpdatesState`, applying the rollout backstop
    /// and staleness-reset rules.
    pub async fn on_connected(&self) {
        let user_engine = self.get_or_create_bucket(BucketKey::User).await;
        user_engine.note_has_new_updates(0).await;

        let global = self.bucket_store.get_global().await.unwrap_or_default();
        let now = now_unix();

        let is_reset = global.last_sync_date == 0
            || now - global.last_sync_date > self.config.staleness_reset_secs;
        let effective_date = if global.last_sync_date == 0 {
            now - self.config.rollout_backstop_secs
        } else if is_reset {
            tracing::warn!("lastSyncDate is stale beyond the incremental catch-up horizon; resetting to now");
            now
        } else {
            global.last_sync_date
        };

        if effective_date != global.last_sync_date {
            let _ = self
                .bucket_store
                .set_global(GlobalSyncState {
                    last_sync_date: effective_date,
                })
                .await;
        }

        // Only the seed (cold start) and staleness-reset cases may move the
        // in-memory watermark backward; otherwise a reconnect must never
        // regress progress already made this process's lifetime.
        let mut guard = self.shared.last_sync_date.lock().await;
        if is_reset || effective_date > *guard {
            *guard = effective_date;
        }
        drop(guard);

        let input = GetUpdatesStateInput { date: effective_date };
        let call = self.transport.request(
            "getUpdatesState",
            serde_json::to_value(input).expect("GetUpdatesStateInput always serializes"),
        );
        match tokio::time::timeout(self.config.bootstrap_rpc_timeout, call).await {
            Ok(Ok(value)) => {
                if let Ok(output) = serde_json::from_value::<GetUpdatesStateOutput>(value) {
                    tracing::debug!(date = output.date, "bootstrap getUpdatesState completed");
                }
            }
            Ok(Err(e)) => tracing::warn!("bootstrap getUpdatesState failed: {e}"),
            Err(_) => tracing::warn!("bootstrap getUpdatesState timed out; best-effort call, continuing"),
        }
    }

    /// §4.7 `clearSyncState`: zero counters, drop the bucket map, and clear
    /// persistent stores. Idempotent.
    pub async fn clear_sync_state(&self) {
        let buckets: Vec<Arc<BucketEngine>> = self.buckets.lock().await.drain().map(|(_, v)| v).collect();
        for bucket in buckets {
            bucket.abort_retry().await;
        }
        self.shared
            .stats
            .bucket_updates_duplicate_skipped
            .store(0, Ordering::Relaxed);
        self.shared.stats.bucket_fetch_too_long.store(0, Ordering::Relaxed);
        self.shared.stats.bucket_fetch_retry.store(0, Ordering::Relaxed);
        *self.shared.last_sync_date.lock().await = 0;
        if let Err(e) = self.bucket_store.clear_all().await {
            tracing::warn!("failed to clear persistent bucket store: {e}");
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
