//! A global concurrency gate for catch-up fetches (§4.4): many buckets can
//! discover "new updates" simultaneously on reconnect, and without a shared
//! cap the client would stampede the server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// A counting semaphore with a live-adjustable capacity.
///
/// [`tokio::sync::Semaphore`] can only grow (`add_permits`), never shrink, so
/// [`FetchLimiter::set_limit`] shrinking the cap is implemented by tracking
/// "shrink debt": permits returned by a dropped guard are withheld from the
/// semaphore (not re-added) until the debt is paid off, rather than being
/// forwarded straight back in.
pub struct FetchLimiter {
    semaphore: Arc<Semaphore>,
    /// Permits to withhold the next time a guard would otherwise return one.
    shrink_debt: Arc<AtomicUsize>,
    /// The configured capacity, tracked independently of live permit counts
    /// (which dip while permits are held out and so can't be used to derive
    /// how much a `set_limit` grow/shrink should adjust by).
    limit: AtomicUsize,
}

/// A held permit. Dropping it releases the slot (or pays down shrink debt).
pub struct FetchPermit<'a> {
    inner: Option<SemaphorePermit<'a>>,
    shrink_debt: Arc<AtomicUsize>,
}

impl FetchLimiter {
    /// Create a limiter with `limit` initial permits.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            shrink_debt: Arc::new(AtomicUsize::new(0)),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Suspend until a permit is available, FIFO.
    pub async fn acquire(&self) -> FetchPermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");
        FetchPermit {
            inner: Some(permit),
            shrink_debt: self.shrink_debt.clone(),
        }
    }

    /// Adjust capacity live. Growing releases waiters immediately; shrinking
    /// records debt that future permit releases pay down instead of
    /// returning the permit to the pool.
    pub fn set_limit(&self, new_limit: usize) {
        let current = self.limit.swap(new_limit, Ordering::SeqCst);
        match new_limit.cmp(&current) {
            std::cmp::Ordering::Greater => {
                self.semaphore.add_permits(new_limit - current);
            }
            std::cmp::Ordering::Less => {
                self.shrink_debt
                    .fetch_add(current - new_limit, Ordering::SeqCst);
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    /// The configured capacity, independent of how many permits are
    /// currently held out or available.
    pub fn capacity(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }
}

impl Drop for FetchPermit<'_> {
    fn drop(&mut self) {
        let Some(permit) = self.inner.take() else {
            return;
        };

        // Pay down one unit of shrink debt by forgetting the permit instead
        // of letting it return to the semaphore's pool — this is how
        // `set_limit` shrinking actually takes effect.
        loop {
            let debt = self.shrink_debt.load(Ordering::SeqCst);
            if debt == 0 {
                drop(permit);
                return;
            }
            if self
                .shrink_debt
                .compare_exchange(debt, debt - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                permit.forget();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_configured_limit() {
        let limiter = Arc::new(FetchLimiter::new(2));
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;

        let limiter2 = limiter.clone();
        let acquired_third = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_millis(50), limiter2.acquire())
                .await
                .is_ok()
        });

        assert!(!acquired_third.await.unwrap());
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn grow_releases_waiters() {
        let limiter = Arc::new(FetchLimiter::new(1));
        let _a = limiter.acquire().await;
        limiter.set_limit(2);

        let acquired = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(acquired.is_ok());
    }
}
