//! # Decision caching
//!
//! Every inbound request passes through at least one remote decision: authentication of the
//! request headers, and authorization of the authenticated identity for an instance name. Both
//! are network round trips to a remote service, so their verdicts are cached in memory.
//!
//! ## Layers
//!
//! A lookup goes through the following steps:
//!
//! - The serialized request is hashed into a [`Fingerprint`]. Only the fingerprint is retained,
//!   which bounds the memory per entry and keeps credentials out of the cache.
//! - A [`DecisionCache`] looks up the fingerprint. A ready and unexpired entry is served
//!   directly. A pending entry is awaited. A missing or expired entry triggers a computation.
//! - The computation asks the remote service. Its verdict, or its error, is published to all
//!   callers that are waiting for it, together with the expiration time chosen by the remote
//!   service.
//!
//! ## Expiration
//!
//! The remote service decides how long a verdict may be reused, by returning an absolute
//! [`Expiration`]. A verdict is reused only while its expiration lies strictly in the future. An
//! [`Expiration::Uncacheable`] verdict is only shared with callers that were already waiting for
//! it, the next lookup computes it again. Errors follow the exact same rules as successes.
//!
//! ## Eviction
//!
//! The number of entries is bounded by [`DecisionCacheConfig::maximum_size`]. Which entry to
//! drop is decided by an [`EvictionSet`], which only ever sees fingerprints. Eviction happens
//! right before a new fingerprint is inserted.
//!
//! ### Metrics
//!
//! Each of these is tagged with a `cache` field naming the cache:
//!
//! - `decisions.access`: All lookups.
//! - `decisions.hit`: Lookups served by a ready entry.
//! - `decisions.dedup`: Lookups that waited for a computation started by another caller.
//! - `decisions.computation`: Remote computations being started.
//! - `decisions.superseded`: Expired entries that were replaced by a new computation.
//! - `decisions.eviction`: Entries dropped to enforce the size bound.
//! - `decisions.size`: A gauge of the number of entries after each insertion.

mod clock;
mod decision;
mod eviction;
mod fingerprint;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, DecisionCache, DecisionCacheConfig, Expiration, Interrupted};
pub use eviction::{EvictionPolicy, EvictionSet, FifoSet, LruSet, RandomSet};
pub use fingerprint::{fingerprint, Fingerprint};
