//! Single source of truth for [`SessionStatus`]: the credential lifecycle
//! that gates `SyncEngine` startup.

use crate::config::SyncConfig;
use crate::secret_store::{Credentials, SecretOutcome, SecretStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::Stream;

/// The credential lifecycle. `authenticated` is the only state from which the
/// sync engine may issue authenticated RPCs; `locked` must never be treated
/// as `unauthenticated`, since that would trigger destructive local recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// The initial state, before the constructor's synchronous read completes.
    Hydrating,
    /// No credentials are stored.
    Unauthenticated,
    /// Credentials exist but are temporarily unreadable.
    Locked {
        /// Best-effort recovery hint recovered from a previous session, if any.
        user_id_hint: Option<i64>,
    },
    /// Credentials were readable once but are now rejected by the server.
    ReauthRequired {
        /// Best-effort recovery hint.
        user_id_hint: Option<i64>,
    },
    /// A valid, currently-usable credential set.
    Authenticated(Credentials),
}

impl SessionStatus {
    /// True for [`SessionStatus::Authenticated`].
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionStatus::Authenticated(_))
    }
}

/// `(status, didHydrate)` — exactly one snapshot is the current truth at any
/// moment. `did_hydrate` flips to `true` on the first complete read of
/// persistent storage and never back.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub status: SessionStatus,
    pub did_hydrate: bool,
}

/// Emitted on authentication-state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `(!authenticated) → authenticated`.
    Login {
        user_id: i64,
        token: String,
    },
    /// `(authenticated) → (!authenticated)`.
    Logout,
}

/// Owns the credential snapshot cache. Readers see immutable copies only.
pub struct SessionStore {
    secret_store: Arc<dyn SecretStore>,
    config: SyncConfig,
    current: Arc<Mutex<Snapshot>>,
    snapshots_tx: watch::Sender<Snapshot>,
    events_tx: broadcast::Sender<Event>,
    /// Bumped on every transition; a spawned locked-retry loop compares its
    /// captured generation before each tick and exits on mismatch, giving
    /// idempotent, race-free cancellation.
    generation: Arc<AtomicU64>,
}

impl SessionStore {
    /// Synchronously read `secret_store` and emit the initial snapshot before
    /// returning, so downstream sync components observe a defined state from
    /// their very first read. (The read itself is unavoidably `async` here —
    /// `SecretStore` is an async trait — so the constructor is `async fn`,
    /// completing that read before handing back a usable store.)
    pub async fn new(secret_store: Arc<dyn SecretStore>, config: SyncConfig) -> Self {
        let initial = Snapshot {
            status: SessionStatus::Hydrating,
            did_hydrate: false,
        };
        let (snapshots_tx, _) = watch::channel(initial.clone());
        let (events_tx, _) = broadcast::channel(8);

        let store = Self {
            secret_store,
            config,
            current: Arc::new(Mutex::new(initial)),
            snapshots_tx,
            events_tx,
            generation: Arc::new(AtomicU64::new(0)),
        };

        store.refresh_from_storage().await;
        store
    }

    /// Synchronous, lock-guarded read of the current state.
    pub fn snapshot(&self) -> Snapshot {
        self.current.lock().expect("poisoned").clone()
    }

    /// Replayable newest-wins stream of snapshots, buffer 1.
    pub fn snapshots(&self) -> impl Stream<Item = Snapshot> {
        WatchStream::new(self.snapshots_tx.subscribe())
    }

    /// Small, drop-oldest stream of login/logout events.
    pub fn events(&self) -> impl Stream<Item = Event> {
        BroadcastStream::new(self.events_tx.subscribe()).filter_map(|r| async move { r.ok() })
    }

    /// Persist new credentials and transition to `authenticated`.
    pub async fn save_credentials(&self, token: String, user_id: i64) {
        let credentials = Credentials {
            user_id,
            token: token.clone(),
            created_at: now_unix(),
        };
        let _ = self.secret_store.save_credentials(&credentials).await;
        self.transition(SessionStatus::Authenticated(credentials), true);
    }

    /// Clear credentials and transition to `unauthenticated`.
    pub async fn log_out(&self) {
        let _ = self.secret_store.clear_credentials().await;
        self.transition(SessionStatus::Unauthenticated, true);
    }

    /// Re-read the secret store and update the snapshot accordingly.
    ///
    /// Critical rule (§4.2): if the in-memory state is `authenticated` and
    /// the refresh observes `Locked`, the authenticated snapshot is kept and
    /// a warning is logged — transient secret-store unavailability must never
    /// cascade into treating the session as logged out.
    pub async fn refresh_from_storage(&self) {
        let outcome = self.secret_store.load_credentials().await;
        let was_authenticated = self.snapshot().status.is_authenticated();

        match outcome {
            SecretOutcome::Available(credentials) => {
                self.transition(SessionStatus::Authenticated(credentials), true);
                self.cancel_locked_retry();
            }
            SecretOutcome::Locked => {
                if was_authenticated {
                    tracing::warn!(
                        "secret store returned locked while authenticated; keeping authenticated snapshot"
                    );
                    self.mark_hydrated();
                } else {
                    let hint = self.user_id_hint();
                    self.transition(SessionStatus::Locked { user_id_hint: hint }, true);
                    self.spawn_locked_retry();
                }
            }
            SecretOutcome::NotFound => {
                let hint = self.user_id_hint();
                let status = match hint {
                    Some(user_id_hint) => SessionStatus::ReauthRequired {
                        user_id_hint: Some(user_id_hint),
                    },
                    None => SessionStatus::Unauthenticated,
                };
                self.transition(status, true);
                self.cancel_locked_retry();
            }
            SecretOutcome::Error(e) => {
                tracing::warn!("secret store read failed: {e}");
                self.mark_hydrated();
            }
        }
    }

    fn user_id_hint(&self) -> Option<i64> {
        match &self.snapshot().status {
            SessionStatus::Authenticated(c) => Some(c.user_id),
            SessionStatus::Locked { user_id_hint } | SessionStatus::ReauthRequired { user_id_hint } => {
                *user_id_hint
            }
            _ => None,
        }
    }

    fn mark_hydrated(&self) {
        let mut guard = self.current.lock().expect("poisoned");
        if !guard.did_hydrate {
            guard.did_hydrate = true;
            let snapshot = guard.clone();
            drop(guard);
            let _ = self.snapshots_tx.send(snapshot);
        }
    }

    /// Apply a new status, emitting `login`/`logout` per the transition
    /// table in §4.2, and publish the updated snapshot before returning (so
    /// the snapshot stream and event stream preserve causal order, per §5).
    fn transition(&self, status: SessionStatus, did_hydrate: bool) {
        let was_authenticated = self.snapshot().status.is_authenticated();
        let is_authenticated = status.is_authenticated();

        let snapshot = {
            let mut guard = self.current.lock().expect("poisoned");
            guard.status = status;
            guard.did_hydrate = guard.did_hydrate || did_hydrate;
            guard.clone()
        };

        let _ = self.snapshots_tx.send(snapshot.clone());

        if !was_authenticated && is_authenticated {
            if let SessionStatus::Authenticated(c) = &snapshot.status {
                let _ = self.events_tx.send(Event::Login {
                    user_id: c.user_id,
                    token: c.token.clone(),
                });
            }
        } else if was_authenticated && !is_authenticated {
            let _ = self.events_tx.send(Event::Logout);
        }
    }

    fn spawn_locked_retry(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let gen_ref = self.generation.clone();
        let secret_store = self.secret_store.clone();
        let current = self.current.clone();
        let snapshots_tx = self.snapshots_tx.clone();
        let events_tx = self.events_tx.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            for attempt in 0..config.locked_retry_max_attempts {
                tokio::time::sleep(config.locked_retry_delay(attempt)).await;
                if gen_ref.load(Ordering::SeqCst) != generation {
                    return;
                }

                let outcome = secret_store.load_credentials().await;
                if gen_ref.load(Ordering::SeqCst) != generation {
                    return;
                }

                match outcome {
                    SecretOutcome::Locked => continue,
                    SecretOutcome::Available(credentials) => {
                        let snapshot = {
                            let mut guard = current.lock().expect("poisoned");
                            let was_authenticated = guard.status.is_authenticated();
                            guard.status = SessionStatus::Authenticated(credentials.clone());
                            guard.did_hydrate = true;
                            if !was_authenticated {
                                let _ = events_tx.send(Event::Login {
                                    user_id: credentials.user_id,
                                    token: credentials.token.clone(),
                                });
                            }
                            guard.clone()
                        };
                        let _ = snapshots_tx.send(snapshot);
                        return;
                    }
                    SecretOutcome::NotFound | SecretOutcome::Error(_) => {
                        let snapshot = {
                            let mut guard = current.lock().expect("poisoned");
                            guard.status = SessionStatus::Unauthenticated;
                            guard.did_hydrate = true;
                            guard.clone()
                        };
                        let _ = snapshots_tx.send(snapshot);
                        return;
                    }
                }
            }
            tracing::warn!("locked-retry loop exhausted its attempt budget");
        });
    }

    fn cancel_locked_retry(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::FailingSecretStore;
    use futures::StreamExt;

    #[tokio::test]
    async fn emits_login_event_on_save_credentials() {
        let store = Arc::new(FailingSecretStore::new(SecretOutcome::NotFound));
        let session = SessionStore::new(store, SyncConfig::default()).await;
        assert!(!session.snapshot().status.is_authenticated());

        let mut events = Box::pin(session.events());
        session.save_credentials("tok".into(), 7).await;

        assert_eq!(
            events.next().await,
            Some(Event::Login {
                user_id: 7,
                token: "tok".into()
            })
        );
        assert!(session.snapshot().status.is_authenticated());
    }

    #[tokio::test]
    async fn does_not_downgrade_authenticated_to_locked_on_refresh() {
        let store = Arc::new(FailingSecretStore::new(SecretOutcome::Available(Credentials {
            user_id: 42,
            token: "tok".into(),
            created_at: 0,
        })));
        let session = SessionStore::new(store.clone(), SyncConfig::default()).await;
        assert!(session.snapshot().status.is_authenticated());

        store.set_outcome(SecretOutcome::Locked);
        for _ in 0..5 {
            session.refresh_from_storage().await;
        }

        match session.snapshot().status {
            SessionStatus::Authenticated(c) => assert_eq!(c.user_id, 42),
            other => panic!("expected Authenticated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn logout_emits_logout_event() {
        let store = Arc::new(FailingSecretStore::new(SecretOutcome::Available(Credentials {
            user_id: 1,
            token: "t".into(),
            created_at: 0,
        })));
        let session = SessionStore::new(store, SyncConfig::default()).await;
        let mut events = Box::pin(session.events());

        session.log_out().await;
        assert_eq!(events.next().await, Some(Event::Logout));
        assert!(!session.snapshot().status.is_authenticated());
    }
}
