use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{fingerprint, Clock, EvictionPolicy, EvictionSet, Fingerprint};

/// How long a [`Decision`] may be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiration {
    /// The decision must not be reused by later lookups.
    ///
    /// Callers that were already waiting for the decision still receive it.
    Uncacheable,
    /// The decision may be reused until, but not including, the given point in time.
    At(SystemTime),
}

impl Expiration {
    /// Whether a decision with this expiration may still be served at `now`.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        match self {
            Self::Uncacheable => false,
            Self::At(expiration) => *expiration > now,
        }
    }
}

/// The outcome of a remote decision, as published to all callers sharing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision<V, E> {
    pub result: Result<V, E>,
    pub expiration: Expiration,
}

impl<V, E> Decision<V, E> {
    pub fn new(result: Result<V, E>, expiration: Expiration) -> Self {
        Self { result, expiration }
    }

    /// A decision that is shared with concurrent callers only.
    pub fn uncacheable(result: Result<V, E>) -> Self {
        Self::new(result, Expiration::Uncacheable)
    }
}

/// The reasons a lookup can end without a published decision.
///
/// The error type of a [`DecisionCache`] must be constructible from this, so that these can be
/// reported through the same channel as the errors of the remote service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Interrupted {
    /// The caller's cancellation token fired before the decision was published.
    #[error("cancelled while waiting for a remote decision")]
    Cancelled,
    /// The computation stopped without publishing a decision, for example because it panicked.
    #[error("remote decision was abandoned")]
    Abandoned,
}

/// Configuration of a [`DecisionCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecisionCacheConfig {
    /// Maximum number of entries, both pending and ready.
    ///
    /// Defaults to `10_000`.
    pub maximum_size: usize,
    /// Which entry to drop when the cache is full.
    ///
    /// Defaults to `lru`.
    pub eviction_policy: EvictionPolicy,
}

impl Default for DecisionCacheConfig {
    fn default() -> Self {
        Self {
            maximum_size: 10_000,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

type Outcome<V, E> = Arc<OnceLock<Decision<V, E>>>;

/// A cache entry. It is pending until `ready` fires, after which `outcome` is set and never
/// changes again.
struct Entry<V, E> {
    outcome: Outcome<V, E>,
    ready: Shared<oneshot::Receiver<()>>,
}

impl<V, E> Clone for Entry<V, E> {
    fn clone(&self) -> Self {
        Self {
            outcome: Arc::clone(&self.outcome),
            ready: self.ready.clone(),
        }
    }
}

impl<V, E> Entry<V, E> {
    fn pending() -> (Self, Publisher<V, E>)
    where
        E: From<Interrupted>,
    {
        let (sender, receiver) = oneshot::channel();
        let outcome = Arc::new(OnceLock::new());
        let entry = Self {
            outcome: Arc::clone(&outcome),
            ready: receiver.shared(),
        };
        let publisher = Publisher {
            outcome,
            sender: Some(sender),
        };
        (entry, publisher)
    }

    fn is_ready(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Pending entries have not expired by definition.
    fn has_expired(&self, now: SystemTime) -> bool {
        self.outcome
            .get()
            .is_some_and(|decision| !decision.expiration.is_valid_at(now))
    }
}

/// The writing half of a pending [`Entry`].
///
/// Dropping the publisher fires the ready signal. If no decision was published up to that point,
/// an uncacheable [`Interrupted::Abandoned`] error is published instead, so that waiters are never
/// left hanging.
struct Publisher<V, E: From<Interrupted>> {
    outcome: Outcome<V, E>,
    sender: Option<oneshot::Sender<()>>,
}

impl<V, E: From<Interrupted>> Publisher<V, E> {
    fn publish(self, decision: Decision<V, E>) {
        if self.outcome.set(decision).is_err() {
            tracing::error!("decision was published twice");
        }
    }
}

impl<V, E: From<Interrupted>> Drop for Publisher<V, E> {
    fn drop(&mut self) {
        if self.outcome.get().is_none() {
            let abandoned = Decision::uncacheable(Err(E::from(Interrupted::Abandoned)));
            self.outcome.set(abandoned).ok();
        }
        if let Some(sender) = self.sender.take() {
            sender.send(()).ok();
        }
    }
}

struct State<V, E> {
    entries: HashMap<Fingerprint, Entry<V, E>>,
    eviction: Box<dyn EvictionSet<Fingerprint>>,
}

/// An in-memory cache of remote decisions.
///
/// The cache deduplicates concurrent lookups of the same request into a single computation,
/// reuses decisions until the expiration handed out along with them, and holds at most
/// [`maximum_size`](DecisionCacheConfig::maximum_size) entries.
///
/// A single lock protects the entries and the eviction set. It is only held for bookkeeping and
/// never across a computation or a wait, so lookups of distinct requests never block each other.
pub struct DecisionCache<V, E> {
    name: &'static str,
    maximum_size: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<State<V, E>>,
}

impl<V, E> fmt::Debug for DecisionCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .state
            .try_lock()
            .map(|state| state.entries.len())
            .unwrap_or_default();
        f.debug_struct("DecisionCache")
            .field("name", &self.name)
            .field("maximum_size", &self.maximum_size)
            .field("entries", &entries)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<V, E> DecisionCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<Interrupted> + 'static,
{
    /// Creates an empty cache.
    ///
    /// The `name` is used to tag metrics and logs. A `maximum_size` of zero is treated as one.
    pub fn new(name: &'static str, config: DecisionCacheConfig, clock: Arc<dyn Clock>) -> Self {
        if config.maximum_size == 0 {
            tracing::warn!(cache = name, "maximum cache size of 0 raised to 1");
        }
        Self {
            name,
            maximum_size: config.maximum_size.max(1),
            clock,
            state: Mutex::new(State {
                entries: HashMap::new(),
                eviction: config.eviction_policy.create_set(),
            }),
        }
    }

    /// Returns the decision for `request`, computing it if necessary.
    ///
    /// The request is identified by its [`fingerprint`]. If a valid decision for it is cached,
    /// that decision is returned. If another caller is already computing it, this waits for that
    /// computation. Otherwise `compute` is invoked with a clone of `cancel` and the request, and
    /// its decision is published to everyone waiting for it.
    ///
    /// The computation runs as a separate task on the current tokio runtime, so it completes and
    /// publishes its decision even if this future is dropped. Outside of a runtime the
    /// computation cannot be started, and [`Interrupted::Abandoned`] is published instead.
    ///
    /// # Errors
    ///
    /// Errors of the computation are returned as they were published, and are cached by the same
    /// rules as successful decisions. If `cancel` fires before the decision is available,
    /// [`Interrupted::Cancelled`] is returned to this caller only, and the computation carries on
    /// for everyone else.
    pub async fn get<F, Fut>(
        &self,
        cancel: &CancellationToken,
        request: Bytes,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce(CancellationToken, Bytes) -> Fut,
        Fut: Future<Output = Decision<V, E>> + Send + 'static,
    {
        let key = fingerprint(&request);
        metric!(counter("decisions.access") += 1, "cache" => self.name);

        let (entry, publisher) = self.lookup(key);
        if let Some(publisher) = publisher {
            metric!(counter("decisions.computation") += 1, "cache" => self.name);
            tracing::trace!(cache = self.name, %key, "computing remote decision");

            let computation = compute(cancel.clone(), request);
            let task = async move {
                let decision = computation.await;
                publisher.publish(decision);
            }
            .in_current_span()
            .bind_hub(Hub::new_from_top(Hub::current()));
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(task);
                }
                Err(error) => {
                    // Dropping the task drops its publisher, which abandons the entry.
                    tracing::error!(cache = self.name, %error, "no runtime to compute decision on");
                }
            }
        }

        wait(entry, cancel).await
    }

    /// Looks up the entry for `key`, and creates a pending one if none is usable.
    ///
    /// A [`Publisher`] is returned iff the caller has to compute the decision.
    fn lookup(&self, key: Fingerprint) -> (Entry<V, E>, Option<Publisher<V, E>>) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.entries.get(&key) {
            Some(entry) if !entry.has_expired(now) => {
                if entry.is_ready() {
                    metric!(counter("decisions.hit") += 1, "cache" => self.name);
                } else {
                    metric!(counter("decisions.dedup") += 1, "cache" => self.name);
                }
                state.eviction.touch(&key);
                return (entry.clone(), None);
            }
            Some(_) => {
                // The expired entry is superseded below, its key stays registered.
                metric!(counter("decisions.superseded") += 1, "cache" => self.name);
                state.eviction.touch(&key);
            }
            None => {
                while state.entries.len() >= self.maximum_size {
                    let Some(victim) = state.eviction.peek() else {
                        tracing::error!(cache = self.name, "eviction set ran out of keys");
                        break;
                    };
                    state.eviction.remove();
                    state.entries.remove(&victim);
                    metric!(counter("decisions.eviction") += 1, "cache" => self.name);
                }
                state.eviction.insert(key);
            }
        }

        let (entry, publisher) = Entry::pending();
        state.entries.insert(key, entry.clone());
        metric!(gauge("decisions.size") = state.entries.len() as u64, "cache" => self.name);

        (entry, Some(publisher))
    }

    /// The number of entries, both pending and ready.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of keys tracked by the eviction set, which always equals [`len`](Self::len)
    /// outside of the lock.
    #[cfg(test)]
    pub(super) fn tracked_keys(&self) -> usize {
        self.state.lock().eviction.len()
    }
}

/// Waits for `entry` to become ready, or for `cancel` to fire.
async fn wait<V, E>(entry: Entry<V, E>, cancel: &CancellationToken) -> Result<V, E>
where
    V: Clone,
    E: Clone + From<Interrupted>,
{
    let signal = tokio::select! {
        biased;
        signal = entry.ready.clone() => signal,
        _ = cancel.cancelled() => return Err(Interrupted::Cancelled.into()),
    };

    match (signal, entry.outcome.get()) {
        (Ok(()), Some(decision)) => decision.result.clone(),
        _ => Err(Interrupted::Abandoned.into()),
    }
}
