//! Generic time-bounded single-value cache with de-duplicated refresh.
//!
//! [`CacheRefresher`] owns one value and an expiry deadline on a monotonic
//! clock. Reads on the fast path take a brief shared lock and no await;
//! when the deadline has passed, exactly one of N racing callers runs the
//! updater while the rest wait and then observe the freshly computed value.
//!
//! The refresher carries no knowledge of what it caches: the token
//! directory scan cache and the JWKS key-set cache are both built on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

type Updater<T, E> =
    Box<dyn Fn(Option<Arc<T>>) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send + Sync>;

struct State<T> {
    value: Option<Arc<T>>,
    expires_at: Option<Instant>,
    /// Bumped on every successful refresh. Lets a caller that observed a
    /// stale or missing value detect that somebody else already refreshed
    /// while it waited for the critical section.
    generation: u64,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            value: None,
            expires_at: None,
            generation: 0,
        }
    }
}

/// Thread-safe cache of a single value, recomputed at most once per expiry
/// window regardless of caller concurrency.
pub struct CacheRefresher<T, E> {
    interval: Duration,
    updater: Updater<T, E>,
    state: RwLock<State<T>>,
    /// Serializes recomputation. Never held across the fast path, and the
    /// updater future runs outside any `state` lock.
    gate: Mutex<()>,
}

impl<T, E> CacheRefresher<T, E>
where
    T: Send + Sync + 'static,
{
    /// Create a refresher that recomputes via `updater` once per `interval`.
    ///
    /// The updater receives the previous value (`None` before the first
    /// successful refresh) and produces the replacement. Its failures
    /// propagate to the caller that triggered the refresh; the deadline is
    /// left unadvanced so the next call retries.
    pub fn new<F, Fut>(interval: Duration, updater: F) -> Self
    where
        F: Fn(Option<Arc<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            interval,
            updater: Box::new(move |previous| Box::pin(updater(previous))),
            state: RwLock::new(State::default()),
            gate: Mutex::new(()),
        }
    }

    /// Get the cached value, refreshing it first if the deadline passed.
    ///
    /// # Errors
    ///
    /// Propagates the updater's error when this call triggered a refresh
    /// and the refresh failed.
    pub async fn get(&self) -> Result<Arc<T>, E> {
        self.get_or_refresh(|_| false).await
    }

    /// Get the cached value, additionally forcing a refresh when `miss`
    /// holds for the current value even though its deadline has not passed.
    ///
    /// After one (de-duplicated) forced refresh the new value is returned
    /// regardless of whether `miss` still holds for it; callers re-test and
    /// treat a second miss as terminal.
    ///
    /// # Errors
    ///
    /// Propagates the updater's error when this call triggered the refresh.
    pub async fn get_or_refresh<P>(&self, miss: P) -> Result<Arc<T>, E>
    where
        P: Fn(&T) -> bool,
    {
        let observed = {
            let state = self.read_state();
            if let Some(value) = fresh_value(&state, &miss) {
                return Ok(value);
            }
            state.generation
        };

        let _gate = self.gate.lock().await;

        // Double-checked: somebody may have refreshed while we waited.
        let previous = {
            let state = self.read_state();
            if state.generation != observed {
                if let Some(value) = &state.value {
                    return Ok(Arc::clone(value));
                }
            }
            state.value.clone()
        };

        debug!(target: "k8s_tokens.refresh", "Cache expired or missed, running updater");
        let value = Arc::new((self.updater)(previous).await?);

        // Deadline measured from completion time, not from the previous
        // deadline, so refresh cost does not compound.
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        state.value = Some(Arc::clone(&value));
        state.expires_at = Some(Instant::now() + self.interval);
        state.generation = state.generation.wrapping_add(1);

        Ok(value)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fresh_value<T, P>(state: &State<T>, miss: &P) -> Option<Arc<T>>
where
    P: Fn(&T) -> bool,
{
    let expires_at = state.expires_at?;
    if expires_at <= Instant::now() {
        return None;
    }
    let value = state.value.as_ref()?;
    if miss(value) {
        return None;
    }
    Some(Arc::clone(value))
}
