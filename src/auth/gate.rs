// src/auth/gate.rs
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::error::RefreshError;

// --- Type Aliases ---

/// The outcome every waiter of one refresh receives.
/// Both sides are wrapped in `Arc` so all waiters share one value.
pub type RefreshOutcome<T> = Result<Arc<T>, Arc<RefreshError>>;

/// A cloneable handle on the refresh currently in flight.
type SharedRefresh<T> = Shared<BoxFuture<'static, RefreshOutcome<T>>>;

// --- Statistics ---

/// Counters for monitoring the refresh gate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    /// Upstream refresh calls started.
    pub initiated: usize,
    /// Callers that joined a refresh already in flight.
    pub coalesced: usize,
    /// Refresh calls that failed (excluding timeouts).
    pub failed: usize,
    /// Refresh calls that hit the timeout.
    pub timed_out: usize,
    /// Callers that found a refresh had already settled.
    pub skipped: usize,
}

// --- Gate Implementation ---

/// Serialises refresh attempts so at most one upstream call is outstanding.
///
/// Every caller that arrives while a refresh is in flight awaits that same
/// refresh and receives its outcome. The in-flight slot is cleared when the
/// call settles, whatever the outcome.
pub struct RefreshGate<T>
where
    T: Send + Sync + 'static,
{
    /// The refresh currently in flight, if any.
    in_flight: Arc<Mutex<Option<SharedRefresh<T>>>>,
    /// Optional upper bound for one refresh call.
    timeout: Option<Duration>,
    stats: Arc<Mutex<RefreshStats>>,
}

impl<T> RefreshGate<T>
where
    T: Send + Sync + 'static,
{
    /// Create a gate without a timeout.
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(None)),
            timeout: None,
            stats: Arc::new(Mutex::new(RefreshStats::default())),
        }
    }

    /// Create a gate whose refresh calls fail with
    /// [`RefreshError::TimedOut`] after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(None)),
            timeout: Some(timeout),
            stats: Arc::new(Mutex::new(RefreshStats::default())),
        }
    }

    /// Run `operation` unless a refresh is already in flight, in which case
    /// wait for that one instead.
    ///
    /// The check and the installation of a new refresh happen under one lock
    /// with no await in between. The operation runs on its own task, so it
    /// settles and clears the slot even if every caller stops waiting.
    pub async fn run<F, Fut>(&self, operation: F) -> RefreshOutcome<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, RefreshError>> + Send + 'static,
    {
        self.run_unless(|| None, operation, |_| {}).await
    }

    /// Like [`run`](Self::run), but first asks `settled` whether a refresh
    /// the caller has not seen yet already completed.
    ///
    /// `settled` runs under the slot lock. When this call starts the refresh,
    /// `on_failure` runs on the refresh task before the slot is emptied. A
    /// refresh therefore publishes its outcome (a new session, or a cleared
    /// one) before another caller can find the slot empty.
    #[instrument(skip_all)]
    pub async fn run_unless<S, F, Fut, H>(
        &self,
        settled: S,
        operation: F,
        on_failure: H,
    ) -> RefreshOutcome<T>
    where
        S: FnOnce() -> Option<Arc<T>> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, RefreshError>> + Send + 'static,
        H: FnOnce(&RefreshError) + Send + 'static,
    {
        let (shared, initiated) = {
            let mut slot = self.in_flight.lock();
            if slot.is_none() {
                if let Some(current) = settled() {
                    debug!("Refresh already settled, using its result.");
                    self.stats.lock().skipped += 1;
                    return Ok(current);
                }
            }
            if let Some(existing) = slot.as_ref() {
                debug!("Refresh already in flight, joining it.");
                self.stats.lock().coalesced += 1;
                (existing.clone(), false)
            } else {
                info!("Starting upstream refresh.");
                self.stats.lock().initiated += 1;

                let slot_handle = Arc::clone(&self.in_flight);
                let stats = Arc::clone(&self.stats);
                let limit = self.timeout;
                let refresh = operation();

                let task = tokio::spawn(
                    async move {
                        let result = match limit {
                            Some(dur) => match timeout(dur, refresh).await {
                                Ok(res) => res,
                                Err(_) => {
                                    warn!("Refresh timed out after {:?}", dur);
                                    stats.lock().timed_out += 1;
                                    Err(RefreshError::TimedOut(dur))
                                }
                            },
                            None => refresh.await,
                        };

                        if let Err(e) = &result {
                            if !matches!(e, RefreshError::TimedOut(_)) {
                                error!("Refresh failed: {}", e);
                                stats.lock().failed += 1;
                            }
                            on_failure(e);
                        }

                        debug!("Refresh settled, clearing in-flight slot.");
                        slot_handle.lock().take();

                        result.map(Arc::new).map_err(Arc::new)
                    }
                    .instrument(info_span!("refresh_worker")),
                );

                let shared = async move {
                    task.await
                        .unwrap_or_else(|_| Err(Arc::new(RefreshError::Aborted)))
                }
                .boxed()
                .shared();

                *slot = Some(shared.clone());
                (shared, true)
            }
        };

        if initiated {
            debug!("Waiting for the refresh this call started.");
        } else {
            debug!("Waiting for the shared refresh.");
        }

        shared.await
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Snapshot of the current statistics.
    pub fn stats(&self) -> RefreshStats {
        self.stats.lock().clone()
    }

    /// Reset all statistics to zero.
    pub fn reset_stats(&self) {
        *self.stats.lock() = RefreshStats::default();
    }
}

// --- Clone, Default & Debug Implementations ---

impl<T> Clone for RefreshGate<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
            timeout: self.timeout,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> Default for RefreshGate<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for RefreshGate<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshGate")
            .field("refreshing", &self.is_refreshing())
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}
