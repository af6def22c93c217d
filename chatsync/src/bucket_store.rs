//! Durable `BucketKey → BucketCursor` map plus the singleton
//! `GlobalSyncState`, backed by [`sled`] the way `ControlDb` backs
//! SpacetimeDB's control plane: one tree per domain, committed durably
//! before the call returns.

use crate::error::StoreError;
use chatsync_rpc::wire::BucketKey;
use std::collections::HashMap;

/// Per-bucket durable cursor. A cursor of `(0, 0)` means "cold start".
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BucketCursor {
    pub seq: i64,
    pub date: i64,
}

impl BucketCursor {
    /// The cursor a bucket starts at before its first successful fetch.
    pub const COLD_START: BucketCursor = BucketCursor { seq: 0, date: 0 };
}

impl Default for BucketCursor {
    fn default() -> Self {
        Self::COLD_START
    }
}

/// Monotonic watermark used to bootstrap the engine across process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct GlobalSyncState {
    pub last_sync_date: i64,
}

const TREE_BUCKETS: &str = "bucket_cursors";
const TREE_GLOBAL: &str = "global_sync_state";
const GLOBAL_KEY: &str = "global";

/// Durable cursor storage. All writes are `flush_async`ed before the call
/// returns — batching is an optimization, not a correctness requirement.
pub struct BucketStore {
    buckets: sled::Tree,
    global: sled::Tree,
}

impl BucketStore {
    /// Open (or create) the bucket store backed by the given [`sled::Db`].
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            buckets: db.open_tree(TREE_BUCKETS)?,
            global: db.open_tree(TREE_GLOBAL)?,
        })
    }

    fn bucket_key_bytes(key: &BucketKey) -> Vec<u8> {
        key.to_string().into_bytes()
    }

    /// Read a bucket's cursor; `COLD_START` if never written.
    pub async fn get_cursor(&self, key: &BucketKey) -> Result<BucketCursor, StoreError> {
        match self.buckets.get(Self::bucket_key_bytes(key))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BucketCursor::COLD_START),
        }
    }

    /// Durably persist a bucket's cursor.
    pub async fn set_cursor(&self, key: &BucketKey, cursor: BucketCursor) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&cursor)?;
        self.buckets.insert(Self::bucket_key_bytes(key), bytes)?;
        self.buckets.flush_async().await?;
        Ok(())
    }

    /// Durably persist several cursors as one flush. A batching optimization
    /// over repeated `set_cursor` calls; not required for correctness.
    pub async fn set_cursors_batch(
        &self,
        cursors: &HashMap<BucketKey, BucketCursor>,
    ) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for (key, cursor) in cursors {
            batch.insert(Self::bucket_key_bytes(key), serde_json::to_vec(cursor)?);
        }
        self.buckets.apply_batch(batch)?;
        self.buckets.flush_async().await?;
        Ok(())
    }

    /// Read the global sync watermark.
    pub async fn get_global(&self) -> Result<GlobalSyncState, StoreError> {
        match self.global.get(GLOBAL_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(GlobalSyncState::default()),
        }
    }

    /// Durably persist the global sync watermark.
    pub async fn set_global(&self, state: GlobalSyncState) -> Result<(), StoreError> {
        self.global.insert(GLOBAL_KEY, serde_json::to_vec(&state)?)?;
        self.global.flush_async().await?;
        Ok(())
    }

    /// Drop all bucket cursors and the global watermark. Idempotent.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.buckets.clear()?;
        self.global.clear()?;
        self.buckets.flush_async().await?;
        self.global.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_rpc::wire::Peer;

    fn temp_store() -> (tempfile::TempDir, BucketStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = BucketStore::open(&db).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn cold_start_cursor_is_zero_zero() {
        let (_dir, store) = temp_store();
        let key = BucketKey::Chat(Peer::Chat(7));
        assert_eq!(store.get_cursor(&key).await.unwrap(), BucketCursor::COLD_START);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (_dir, store) = temp_store();
        let key = BucketKey::Space(3);
        let cursor = BucketCursor { seq: 9, date: 123 };
        store.set_cursor(&key, cursor).await.unwrap();
        assert_eq!(store.get_cursor(&key).await.unwrap(), cursor);
    }

    #[tokio::test]
    async fn clear_all_resets_to_cold_start() {
        let (_dir, store) = temp_store();
        let key = BucketKey::User;
        store
            .set_cursor(&key, BucketCursor { seq: 5, date: 5 })
            .await
            .unwrap();
        store.set_global(GlobalSyncState { last_sync_date: 99 }).await.unwrap();

        store.clear_all().await.unwrap();

        assert_eq!(store.get_cursor(&key).await.unwrap(), BucketCursor::COLD_START);
        assert_eq!(store.get_global().await.unwrap(), GlobalSyncState::default());
    }
}
