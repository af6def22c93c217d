//! Scoped acquisition of persistent credentials and the local database key.
//!
//! The real keychain/secret-platform API is an external collaborator — out
//! of scope here (§1) — so this module defines the trait contract plus a
//! [`sled`]-backed reference implementation usable in tests and in any
//! deployment that doesn't have its own platform keychain binding.

use crate::error::SecretError;
use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;

/// The four-variant outcome every [`SecretStore`] operation returns. All
/// operations are total: no exceptions escape, failures surface as `Error`.
#[derive(Debug, Clone)]
pub enum SecretOutcome<T> {
    /// The value was present and readable.
    Available(T),
    /// The secret store exists but is temporarily unreadable (e.g.
    /// before-first-unlock). Distinct from [`SecretOutcome::NotFound`] — must
    /// never be downgraded to it.
    Locked,
    /// The value was never written.
    NotFound,
    /// Some other failure occurred reading or writing the store.
    Error(SecretError),
}

impl<T> SecretOutcome<T> {
    /// True for [`SecretOutcome::Available`].
    pub fn is_available(&self) -> bool {
        matches!(self, SecretOutcome::Available(_))
    }

    /// True for [`SecretOutcome::Locked`].
    pub fn is_locked(&self) -> bool {
        matches!(self, SecretOutcome::Locked)
    }
}

/// Credentials as stored by the secret store: `(userId, token, createdAt)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub user_id: i64,
    pub token: String,
    pub created_at: i64,
}

/// A 32-byte random key used to encrypt the local database.
pub type DatabaseKey = [u8; 32];

/// Scoped acquisition of persistent credentials and the local database key.
///
/// Implementors must not downgrade [`SecretOutcome::Locked`] to
/// [`SecretOutcome::NotFound`] — `SessionStore` relies on that distinction to
/// avoid triggering destructive local recovery on transient unavailability.
#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Load the stored credentials, if any.
    async fn load_credentials(&self) -> SecretOutcome<Credentials>;

    /// Persist credentials, replacing any previous value.
    async fn save_credentials(&self, credentials: &Credentials) -> SecretOutcome<()>;

    /// Remove any stored credentials.
    async fn clear_credentials(&self) -> SecretOutcome<()>;

    /// Load the local database key, if one has been generated.
    async fn load_database_key(&self) -> SecretOutcome<DatabaseKey>;

    /// Load the database key, generating and persisting a fresh
    /// cryptographically random one if none exists yet. Returns `Locked` if
    /// the store isn't currently writable.
    async fn ensure_database_key(&self) -> SecretOutcome<DatabaseKey>;
}

const NS_PRIMARY: &str = "primary";
const NS_FALLBACK: &str = "fallback_legacy";
const KEY_CREDENTIALS: &str = "credentials_v2";
const KEY_DB_KEY: &str = "dbKey_v1";

/// A [`sled`]-backed [`SecretStore`], with an optional legacy fallback
/// namespace consulted on read and migrated into the primary namespace on
/// successful recovery (§4.1: "the fallback copy is deleted only if the
/// primary write succeeded").
pub struct FileSecretStore {
    primary: sled::Tree,
    fallback: sled::Tree,
    writable: std::sync::atomic::AtomicBool,
}

impl FileSecretStore {
    /// Open (or create) the secret store backed by the given [`sled::Db`].
    pub fn open(db: &sled::Db) -> Result<Self, SecretError> {
        let primary = db.open_tree(NS_PRIMARY).map_err(sled_err)?;
        let fallback = db.open_tree(NS_FALLBACK).map_err(sled_err)?;
        Ok(Self {
            primary,
            fallback,
            writable: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// Force subsequent writes to report `Locked`, simulating a
    /// before-first-unlock platform keychain. Reads are unaffected.
    pub fn set_writable(&self, writable: bool) {
        self.writable
            .store(writable, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_writable(&self) -> bool {
        self.writable.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> SecretOutcome<T> {
        match self.primary.get(key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => return SecretOutcome::Available(value),
                Err(e) => return SecretOutcome::Error(SecretError(e.to_string())),
            },
            Ok(None) => {}
            Err(e) => return SecretOutcome::Error(sled_err(e)),
        }

        match self.fallback.get(key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    if self.is_writable() {
                        if self.primary.insert(key, bytes.as_ref()).is_ok() {
                            let _ = self.fallback.remove(key);
                        }
                    }
                    SecretOutcome::Available(value)
                }
                Err(e) => SecretOutcome::Error(SecretError(e.to_string())),
            },
            Ok(None) => SecretOutcome::NotFound,
            Err(e) => SecretOutcome::Error(sled_err(e)),
        }
    }

    fn write<T: serde::Serialize>(&self, key: &str, value: &T) -> SecretOutcome<()> {
        if !self.is_writable() {
            return SecretOutcome::Locked;
        }
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => return SecretOutcome::Error(SecretError(e.to_string())),
        };
        match self.primary.insert(key, bytes) {
            Ok(_) => SecretOutcome::Available(()),
            Err(e) => SecretOutcome::Error(sled_err(e)),
        }
    }
}

fn sled_err(e: sled::Error) -> SecretError {
    SecretError(e.to_string())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn load_credentials(&self) -> SecretOutcome<Credentials> {
        self.read(KEY_CREDENTIALS)
    }

    async fn save_credentials(&self, credentials: &Credentials) -> SecretOutcome<()> {
        self.write(KEY_CREDENTIALS, credentials)
    }

    async fn clear_credentials(&self) -> SecretOutcome<()> {
        if !self.is_writable() {
            return SecretOutcome::Locked;
        }
        match self.primary.remove(KEY_CREDENTIALS) {
            Ok(_) => {
                let _ = self.fallback.remove(KEY_CREDENTIALS);
                SecretOutcome::Available(())
            }
            Err(e) => SecretOutcome::Error(sled_err(e)),
        }
    }

    async fn load_database_key(&self) -> SecretOutcome<DatabaseKey> {
        match self.read::<Vec<u8>>(KEY_DB_KEY) {
            SecretOutcome::Available(bytes) => match <[u8; 32]>::try_from(bytes.as_slice()) {
                Ok(key) => SecretOutcome::Available(key),
                Err(_) => SecretOutcome::Error(SecretError("stored db key has wrong length".into())),
            },
            SecretOutcome::Locked => SecretOutcome::Locked,
            SecretOutcome::NotFound => SecretOutcome::NotFound,
            SecretOutcome::Error(e) => SecretOutcome::Error(e),
        }
    }

    async fn ensure_database_key(&self) -> SecretOutcome<DatabaseKey> {
        match self.load_database_key().await {
            SecretOutcome::Available(key) => SecretOutcome::Available(key),
            SecretOutcome::NotFound => {
                if !self.is_writable() {
                    return SecretOutcome::Locked;
                }
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                match self.write(KEY_DB_KEY, &key.to_vec()) {
                    SecretOutcome::Available(()) => SecretOutcome::Available(key),
                    SecretOutcome::Locked => SecretOutcome::Locked,
                    SecretOutcome::Error(e) => SecretOutcome::Error(e),
                    SecretOutcome::NotFound => unreachable!("write never returns NotFound"),
                }
            }
            other => other,
        }
    }
}

/// A test double that always returns a fixed outcome, used to exercise
/// `SessionStore`'s locked-retry loop deterministically.
pub struct FailingSecretStore {
    credentials: Arc<std::sync::Mutex<SecretOutcome<Credentials>>>,
}

impl FailingSecretStore {
    /// Build a double that always answers `load_credentials` with `outcome`.
    pub fn new(outcome: SecretOutcome<Credentials>) -> Self {
        Self {
            credentials: Arc::new(std::sync::Mutex::new(outcome)),
        }
    }

    /// Swap the outcome future `load_credentials` calls will return.
    pub fn set_outcome(&self, outcome: SecretOutcome<Credentials>) {
        *self.credentials.lock().expect("poisoned") = outcome;
    }
}

#[async_trait]
impl SecretStore for FailingSecretStore {
    async fn load_credentials(&self) -> SecretOutcome<Credentials> {
        self.credentials.lock().expect("poisoned").clone()
    }

    async fn save_credentials(&self, credentials: &Credentials) -> SecretOutcome<()> {
        *self.credentials.lock().expect("poisoned") = SecretOutcome::Available(credentials.clone());
        SecretOutcome::Available(())
    }

    async fn clear_credentials(&self) -> SecretOutcome<()> {
        *self.credentials.lock().expect("poisoned") = SecretOutcome::NotFound;
        SecretOutcome::Available(())
    }

    async fn load_database_key(&self) -> SecretOutcome<DatabaseKey> {
        SecretOutcome::NotFound
    }

    async fn ensure_database_key(&self) -> SecretOutcome<DatabaseKey> {
        SecretOutcome::Available([7u8; 32])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FileSecretStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = FileSecretStore::open(&db).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trips_credentials() {
        let (_dir, store) = temp_store();
        let creds = Credentials {
            user_id: 42,
            token: "tok".into(),
            created_at: 100,
        };
        assert!(store.save_credentials(&creds).await.is_available());
        let loaded = store.load_credentials().await;
        assert_matches::assert_matches!(loaded, SecretOutcome::Available(c) if c == creds);
    }

    #[tokio::test]
    async fn missing_credentials_is_not_found() {
        let (_dir, store) = temp_store();
        assert_matches::assert_matches!(store.load_credentials().await, SecretOutcome::NotFound);
    }

    #[tokio::test]
    async fn write_while_locked_returns_locked_not_not_found() {
        let (_dir, store) = temp_store();
        store.set_writable(false);
        let creds = Credentials {
            user_id: 1,
            token: "t".into(),
            created_at: 0,
        };
        assert!(store.save_credentials(&creds).await.is_locked());
    }

    #[tokio::test]
    async fn ensure_database_key_generates_and_persists() {
        let (_dir, store) = temp_store();
        let first = store.ensure_database_key().await;
        let SecretOutcome::Available(key1) = first else {
            panic!("expected Available")
        };
        let second = store.ensure_database_key().await;
        let SecretOutcome::Available(key2) = second else {
            panic!("expected Available")
        };
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn fallback_value_is_migrated_to_primary_on_read() {
        let (_dir, store) = temp_store();
        let creds = Credentials {
            user_id: 9,
            token: "legacy".into(),
            created_at: 5,
        };
        store
            .fallback
            .insert(KEY_CREDENTIALS, serde_json::to_vec(&creds).unwrap())
            .unwrap();

        let loaded = store.load_credentials().await;
        assert_matches::assert_matches!(loaded, SecretOutcome::Available(c) if c == creds);
        assert!(store.primary.get(KEY_CREDENTIALS).unwrap().is_some());
        assert!(store.fallback.get(KEY_CREDENTIALS).unwrap().is_none());
    }
}
