//! Tunables for the sync engine, collected into one immutable [`SyncConfig`]
//! built via [`SyncConfigBuilder`] the way `subxt`'s client builders expose
//! their defaults.

use std::time::Duration;

/// Tunables governing bucket catch-up, staleness recovery, and state
/// persistence. Every field has a spec-mandated default; override only the
/// ones a deployment actually needs to change.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Seconds subtracted from the newest applied `date` before advancing
    /// `lastSyncDate`, to tolerate clock skew and missing tail updates.
    pub safety_gap_secs: i64,
    /// Global concurrency cap shared by every bucket's catch-up fetch.
    pub fetch_limiter_capacity: usize,
    /// `totalLimit` used for a bucket's first (cold-start) `getUpdates` call.
    pub cold_start_fetch_limit: i32,
    /// `totalLimit` used for subsequent (warm) `getUpdates` calls.
    pub warm_fetch_limit: i32,
    /// Base delay for a bucket's fetch-retry backoff (doubles per attempt, capped).
    pub fetch_retry_base: Duration,
    /// Cap on a bucket's fetch-retry backoff delay.
    pub fetch_retry_max: Duration,
    /// Initial delay for the locked-secret-store retry loop.
    pub locked_retry_initial: Duration,
    /// Cap on the locked-secret-store retry loop's delay.
    pub locked_retry_max: Duration,
    /// Maximum attempts of the locked-secret-store retry loop before giving up.
    pub locked_retry_max_attempts: u32,
    /// Debounce interval for `SdkClient` state persistence.
    pub state_save_debounce: Duration,
    /// Per-call deadline for bootstrap RPCs (`getUpdatesState`), which are best-effort.
    pub bootstrap_rpc_timeout: Duration,
    /// If `lastSyncDate == 0` on first connect, seed it to `now - this many seconds`.
    pub rollout_backstop_secs: i64,
    /// If `now - lastSyncDate` exceeds this, staleness is unrecoverable by
    /// incremental catch-up and `lastSyncDate` resets to `now`.
    pub staleness_reset_secs: i64,
    /// Whether a bucket's catch-up filter (`shouldProcessUpdate`) admits
    /// message-shaped updates. Structural updates (membership, chat
    /// metadata, pinned, dialog flags) are always admitted; this only gates
    /// messages, reactions, and attachments during catch-up specifically —
    /// realtime delivery is never filtered. Off by default: callers that
    /// refetch message history via a dedicated API don't need catch-up to
    /// replay it too.
    pub enable_message_updates_in_catch_up: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            safety_gap_secs: 5,
            fetch_limiter_capacity: 4,
            cold_start_fetch_limit: 50,
            warm_fetch_limit: 1000,
            fetch_retry_base: Duration::from_secs(1),
            fetch_retry_max: Duration::from_secs(30),
            locked_retry_initial: Duration::from_millis(300),
            locked_retry_max: Duration::from_secs(5),
            locked_retry_max_attempts: 30,
            state_save_debounce: Duration::from_millis(250),
            bootstrap_rpc_timeout: Duration::from_millis(1500),
            rollout_backstop_secs: 5 * 24 * 3600,
            staleness_reset_secs: 14 * 24 * 3600,
            enable_message_updates_in_catch_up: false,
        }
    }
}

impl SyncConfig {
    /// Start building a config from the defaults above.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder(SyncConfig::default())
    }

    /// The bucket fetch-retry delay for a given attempt number, per §4.6 step 8:
    /// `min(fetch_retry_max, fetch_retry_base * 2^min(attempt,5))`.
    pub fn fetch_retry_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.fetch_retry_base.as_secs();
        let secs = base_secs.checked_shl(attempt.min(5)).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.fetch_retry_max)
    }

    /// The locked-retry delay for a given attempt number: `0.3s → 0.6s → 1.2s
    /// → …` capped at `locked_retry_max`, per §4.2.
    pub fn locked_retry_delay(&self, attempt: u32) -> Duration {
        let millis = self
            .locked_retry_initial
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16));
        Duration::from_millis(millis.min(u128::from(u64::MAX)) as u64).min(self.locked_retry_max)
    }
}

/// Builder for [`SyncConfig`].
#[derive(Clone, Debug)]
pub struct SyncConfigBuilder(SyncConfig);

impl SyncConfigBuilder {
    /// Override the safety gap (seconds).
    pub fn safety_gap_secs(mut self, secs: i64) -> Self {
        self.0.safety_gap_secs = secs;
        self
    }

    /// Override the global fetch concurrency cap.
    pub fn fetch_limiter_capacity(mut self, capacity: usize) -> Self {
        self.0.fetch_limiter_capacity = capacity;
        self
    }

    /// Override the cold-start `getUpdates` page size.
    pub fn cold_start_fetch_limit(mut self, limit: i32) -> Self {
        self.0.cold_start_fetch_limit = limit;
        self
    }

    /// Override the warm `getUpdates` page size.
    pub fn warm_fetch_limit(mut self, limit: i32) -> Self {
        self.0.warm_fetch_limit = limit;
        self
    }

    /// Override the state-save debounce interval.
    pub fn state_save_debounce(mut self, interval: Duration) -> Self {
        self.0.state_save_debounce = interval;
        self
    }

    /// Override the bootstrap RPC deadline.
    pub fn bootstrap_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.0.bootstrap_rpc_timeout = timeout;
        self
    }

    /// Let catch-up fetches replay message/reaction/attachment updates too.
    pub fn enable_message_updates_in_catch_up(mut self, enable: bool) -> Self {
        self.0.enable_message_updates_in_catch_up = enable;
        self
    }

    /// Finish building.
    pub fn build(self) -> SyncConfig {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_retry_delay_doubles_then_caps() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.fetch_retry_delay(0), Duration::from_secs(1));
        assert_eq!(cfg.fetch_retry_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.fetch_retry_delay(5), Duration::from_secs(30));
        assert_eq!(cfg.fetch_retry_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn locked_retry_delay_doubles_then_caps() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.locked_retry_delay(0), Duration::from_millis(300));
        assert_eq!(cfg.locked_retry_delay(1), Duration::from_millis(600));
        assert_eq!(cfg.locked_retry_delay(2), Duration::from_millis(1200));
        assert_eq!(cfg.locked_retry_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = SyncConfig::builder().safety_gap_secs(10).build();
        assert_eq!(cfg.safety_gap_secs, 10);
        assert_eq!(cfg.fetch_limiter_capacity, 4);
    }
}
