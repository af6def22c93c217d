//! Per-bucket ordering, buffering, gap detection, and catch-up (§4.6). This
//! is the core of the sync engine.
//!
//! A `BucketEngine` strongly owns nothing that would keep its parent alive —
//! it only holds a narrow callback handle back to `SyncEngine`
//! (`apply_updates_from_bucket`, `save_bucket_state`, `record_bucket_fetch_*`,
//! `update_last_sync_date`), per the design note replacing the source's weak
//! back-reference. The transport, by contrast, is held strongly (open
//! question #2): a weak reference there was a bug in the source.

use crate::apply::ApplySource;
use crate::bucket_store::BucketCursor;
use crate::config::SyncConfig;
use crate::fetch_limiter::FetchLimiter;
use async_trait::async_trait;
use chatsync_rpc::wire::{BucketKey, GetUpdatesInput, GetUpdatesOutput, GetUpdatesResultType, Update};
use chatsync_rpc::RpcTransport;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The narrow callback interface a `BucketEngine` uses to report back to its
/// owning `SyncEngine`, instead of holding a strong (or, worse, a silently
/// stale weak) reference to it.
#[async_trait]
pub trait SyncEngineHandle: Send + Sync + 'static {
    /// Hand an ordered batch of updates, resolved to `bucket`, to the
    /// application's sink.
    async fn apply_updates_from_bucket(&self, bucket: BucketKey, updates: Vec<Update>, source: ApplySource);
    /// Durably persist `bucket`'s new cursor. Never regresses.
    async fn save_bucket_state(&self, bucket: BucketKey, cursor: BucketCursor);
    /// A `getUpdates` reply reported `resultType = tooLong`.
    fn record_bucket_fetch_too_long(&self, bucket: BucketKey);
    /// An inbound update was dropped as a duplicate (`seq <= cursor.seq`).
    fn record_bucket_fetch_duplicate_skipped(&self, bucket: BucketKey);
    /// A catch-up fetch failed and a retry was scheduled.
    fn record_bucket_fetch_retry(&self, bucket: BucketKey);
    /// Propose advancing the global `lastSyncDate` watermark from an applied
    /// update's date. The handle applies the safety-gap/monotonicity rule and
    /// persists the watermark when it advances.
    async fn update_last_sync_date(&self, applied_max_date: i64);
}

#[derive(Default)]
struct State {
    cursor: BucketCursor,
    fetch_seq_end: Option<i64>,
    buffered: BTreeMap<i64, Update>,
    is_fetching: bool,
    needs_fetch: bool,
    retry_attempt: u32,
}

/// Per-bucket state machine. Created lazily on first reference to its key
/// (§3 Lifecycle); survives until `clearSyncState` or process exit.
pub struct BucketEngine {
    key: BucketKey,
    state: Mutex<State>,
    handle: Arc<dyn SyncEngineHandle>,
    transport: Arc<RpcTransport>,
    limiter: Arc<FetchLimiter>,
    config: SyncConfig,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl BucketEngine {
    /// Construct a bucket engine rehydrated at `cursor` (read from
    /// `BucketStore` by the caller; in-memory engines don't themselves
    /// survive restarts).
    pub fn new(
        key: BucketKey,
        cursor: BucketCursor,
        handle: Arc<dyn SyncEngineHandle>,
        transport: Arc<RpcTransport>,
        limiter: Arc<FetchLimiter>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(State {
                cursor,
                ..State::default()
            }),
            handle,
            transport,
            limiter,
            config,
            retry_task: Mutex::new(None),
        })
    }

    /// This bucket's key.
    pub fn key(&self) -> BucketKey {
        self.key
    }

    /// The last applied cursor.
    pub async fn cursor(&self) -> BucketCursor {
        self.state.lock().await.cursor
    }

    /// §4.6 `processRealtime`: buffer out-of-order realtime updates, drain
    /// the longest contiguous prefix starting at `cursor.seq + 1`, and
    /// schedule a catch-up fetch if a gap remains.
    pub async fn process_realtime(self: &Arc<Self>, updates: Vec<Update>) {
        let mut to_apply = Vec::new();
        let mut schedule_fetch = false;

        {
            let mut state = self.state.lock().await;
            for update in updates {
                let seq = update.seq.unwrap_or(0);
                if seq <= state.cursor.seq {
                    self.handle.record_bucket_fetch_duplicate_skipped(self.key);
                    continue;
                }
                state.buffered.insert(seq, update);
            }

            if state.is_fetching {
                // A catch-up batch is pending application; defer draining.
            } else {
                let mut next = state.cursor.seq + 1;
                while let Some(update) = state.buffered.remove(&next) {
                    state.cursor = BucketCursor {
                        seq: next,
                        date: update.date,
                    };
                    to_apply.push(update);
                    next += 1;
                }
                if !state.buffered.is_empty() {
                    schedule_fetch = true;
                }
            }
        }

        if !to_apply.is_empty() {
            let max_date = to_apply.iter().map(|u| u.date).max().unwrap_or(0);
            let cursor = self.cursor().await;
            self.handle
                .apply_updates_from_bucket(self.key, to_apply, ApplySource::Realtime)
                .await;
            self.handle.save_bucket_state(self.key, cursor).await;
            self.handle.update_last_sync_date(max_date).await;
        }

        if schedule_fetch {
            self.trigger_fetch(None).await;
        }
    }

    /// §4.6 `noteHasNewUpdates`: record a server hint and trigger a fetch.
    /// Stale hints are ignored, except `upToSeq == 0` which still runs a
    /// fetch as a safety net.
    pub async fn note_has_new_updates(self: &Arc<Self>, up_to_seq: i64) {
        let cursor_seq = self.state.lock().await.cursor.seq;
        if up_to_seq != 0 && up_to_seq <= cursor_seq {
            return;
        }
        self.trigger_fetch(Some(up_to_seq)).await;
    }

    async fn trigger_fetch(self: &Arc<Self>, hint: Option<i64>) {
        let should_spawn = {
            let mut state = self.state.lock().await;
            if let Some(up_to_seq) = hint {
                if up_to_seq > state.fetch_seq_end.unwrap_or(0) {
                    state.fetch_seq_end = Some(up_to_seq);
                }
            }
            if state.is_fetching {
                state.needs_fetch = true;
                false
            } else {
                state.is_fetching = true;
                true
            }
        };

        if should_spawn {
            self.abort_retry().await;
            let engine = self.clone();
            tokio::spawn(async move { engine.fetch_loop().await });
        }
    }

    /// The catch-up fetch loop (§4.6 steps 1–8). Runs until no more work is
    /// pending; reschedules itself via a retry task on failure.
    async fn fetch_loop(self: Arc<Self>) {
        loop {
            let cold_start = self.state.lock().await.cursor == BucketCursor::COLD_START;
            let permit = self.limiter.acquire().await;
            let result = self.fetch_once(cold_start).await;
            drop(permit);

            match result {
                FetchOutcome::Progress => {
                    self.state.lock().await.retry_attempt = 0;
                }
                FetchOutcome::Stop => {
                    self.state.lock().await.retry_attempt = 0;
                }
                FetchOutcome::Retry => {
                    self.handle.record_bucket_fetch_retry(self.key);
                    let attempt = {
                        let mut state = self.state.lock().await;
                        state.retry_attempt += 1;
                        state.retry_attempt
                    };
                    self.schedule_retry(attempt - 1);
                    return;
                }
            }

            let mut state = self.state.lock().await;
            if state.needs_fetch || !state.buffered.is_empty() {
                state.needs_fetch = false;
                continue;
            }
            state.is_fetching = false;
            break;
        }
    }

    fn schedule_retry(self: &Arc<Self>, attempt: u32) {
        let engine = self.clone();
        let delay = self.config.fetch_retry_delay(attempt);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_fetching = {
                let mut state = engine.state.lock().await;
                if state.is_fetching {
                    true
                } else {
                    state.is_fetching = true;
                    true
                }
            };
            if still_fetching {
                engine.fetch_loop().await;
            }
        });
        if let Ok(mut guard) = self.retry_task.try_lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
    }

    /// One `getUpdates` round. Returns whether the loop made progress,
    /// should stop outright, or should retry with backoff.
    async fn fetch_once(self: &Arc<Self>, cold_start: bool) -> FetchOutcome {
        let (start_seq, seq_end) = {
            let state = self.state.lock().await;
            (state.cursor.seq, state.fetch_seq_end)
        };
        let total_limit = if cold_start {
            self.config.cold_start_fetch_limit
        } else {
            self.config.warm_fetch_limit
        };

        let input = GetUpdatesInput {
            bucket: self.key,
            start_seq,
            seq_end,
            total_limit,
        };
        let response = self
            .transport
            .request(
                "getUpdates",
                serde_json::to_value(&input).expect("GetUpdatesInput always serializes"),
            )
            .await;

        let output: GetUpdatesOutput = match response {
            Ok(value) => match serde_json::from_value(value) {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(bucket = %self.key, "malformed getUpdates reply: {e}");
                    return FetchOutcome::Retry;
                }
            },
            Err(e) => {
                tracing::warn!(bucket = %self.key, "getUpdates failed: {e}");
                return FetchOutcome::Retry;
            }
        };

        if output.seq == start_seq && !output.r#final {
            // Loop-guard: the server made no progress. Treat as transient.
            return FetchOutcome::Retry;
        }

        match output.result_type {
            GetUpdatesResultType::Ok => {
                if output.seq < start_seq {
                    tracing::warn!(bucket = %self.key, "getUpdates returned a seq behind cursor; stopping without retry");
                    return FetchOutcome::Stop;
                }
                self.apply_catch_up_batch(output.updates, output.seq, output.date)
                    .await;
                FetchOutcome::Progress
            }
            GetUpdatesResultType::TooLong => {
                if cold_start {
                    let hard_end = {
                        let state = self.state.lock().await;
                        state.fetch_seq_end
                    };
                    let new_seq = hard_end.unwrap_or(output.seq);
                    self.fast_forward(new_seq, output.date).await;
                    self.handle.record_bucket_fetch_too_long(self.key);
                    FetchOutcome::Progress
                } else {
                    {
                        let mut state = self.state.lock().await;
                        state.fetch_seq_end = Some(output.seq);
                    }
                    self.handle.record_bucket_fetch_too_long(self.key);
                    FetchOutcome::Retry
                }
            }
            GetUpdatesResultType::Slice => {
                self.apply_catch_up_batch(output.updates, output.seq, output.date)
                    .await;
                FetchOutcome::Progress
            }
        }
    }

    /// Filter (drop duplicates, apply `shouldProcessUpdate`), sort by `seq`,
    /// apply, and commit the advanced cursor (§4.6 steps 4–6). Never
    /// regresses the cursor.
    async fn apply_catch_up_batch(self: &Arc<Self>, mut updates: Vec<Update>, final_seq: i64, final_date: i64) {
        let cursor_seq = self.state.lock().await.cursor.seq;
        let enable_messages = self.config.enable_message_updates_in_catch_up;
        updates.retain(|u| u.seq.unwrap_or(0) > cursor_seq && should_process_update(u, enable_messages));
        updates.sort_by_key(|u| u.seq.unwrap_or(0));

        if !updates.is_empty() {
            self.handle
                .apply_updates_from_bucket(self.key, updates, ApplySource::SyncCatchup)
                .await;
        }

        let new_cursor = {
            let mut state = self.state.lock().await;
            let new_seq = state.cursor.seq.max(final_seq);
            state.cursor = BucketCursor {
                seq: new_seq,
                date: final_date,
            };
            // A now-contiguous prefix of buffered realtime updates can drain.
            let mut next = state.cursor.seq + 1;
            let mut drained = Vec::new();
            while let Some(update) = state.buffered.remove(&next) {
                state.cursor = BucketCursor { seq: next, date: update.date };
                drained.push(update);
                next += 1;
            }
            (state.cursor, drained)
        };

        self.handle.save_bucket_state(self.key, new_cursor.0).await;
        self.handle.update_last_sync_date(new_cursor.0.date).await;
        if !new_cursor.1.is_empty() {
            self.handle
                .apply_updates_from_bucket(self.key, new_cursor.1, ApplySource::Realtime)
                .await;
        }
    }

    async fn fast_forward(self: &Arc<Self>, seq: i64, date: i64) {
        let mut state = self.state.lock().await;
        state.cursor = BucketCursor { seq, date };
        state.buffered.clear();
        drop(state);
        self.handle.save_bucket_state(self.key, BucketCursor { seq, date }).await;
        self.handle.update_last_sync_date(date).await;
    }

    /// Abort a pending retry sleep, if one is scheduled. Called on
    /// `clearSyncState` and whenever a fresh fetch cycle supersedes it.
    pub(crate) async fn abort_retry(&self) {
        if let Some(handle) = self.retry_task.lock().await.take() {
            handle.abort();
        }
    }
}

enum FetchOutcome {
    Progress,
    Stop,
    Retry,
}

/// Admits structural updates (membership, chat metadata, pinned, dialog
/// flags) unconditionally; message/reaction/attachment updates are admitted
/// only when `enable_messages` is set. Catch-up only — realtime delivery
/// via `process_realtime` never calls this filter.
fn should_process_update(update: &Update, enable_messages: bool) -> bool {
    use chatsync_rpc::wire::UpdateKind::*;
    let is_message_shaped = matches!(
        update.kind,
        NewMessage { .. }
            | EditMessage { .. }
            | DeleteMessages { .. }
            | MessageAttachment { .. }
            | UpdateReaction { .. }
            | DeleteReaction { .. }
    );
    !is_message_shaped || enable_messages
}
