//! A small channel pair that lets callers await "a reconnect has started" and
//! "a reconnect has completed", and read how many reconnects have happened.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Shared {
    started: Notify,
    finished: Notify,
    count: AtomicUsize,
}

/// Handed to the background task; signals reconnect lifecycle events.
#[derive(Clone)]
pub(crate) struct ReconnectTx(Arc<Shared>);

/// Handed to the client handle; lets callers observe reconnects.
#[derive(Clone, Debug)]
pub struct ReconnectRx(Arc<Shared>);

impl std::fmt::Debug for ReconnectTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectTx").finish()
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) fn reconnect_channel() -> (ReconnectTx, ReconnectRx) {
    let shared = Arc::new(Shared {
        started: Notify::new(),
        finished: Notify::new(),
        count: AtomicUsize::new(0),
    });
    (ReconnectTx(shared.clone()), ReconnectRx(shared))
}

impl ReconnectTx {
    pub(crate) fn reconnect_initiated(&self) {
        self.0.started.notify_waiters();
    }

    pub(crate) fn reconnected(&self) {
        self.0.count.fetch_add(1, Ordering::Relaxed);
        self.0.finished.notify_waiters();
    }
}

impl ReconnectRx {
    pub(crate) async fn reconnect_started(&self) {
        self.0.started.notified().await;
    }

    pub(crate) async fn reconnected(&self) {
        self.0.finished.notified().await;
    }

    /// How many times the transport has reconnected successfully.
    pub fn count(&self) -> usize {
        self.0.count.load(Ordering::Relaxed)
    }
}
