//! # Bifrost Cache
//!
//! [`BusCache`] is a keyed in-memory store layered on the event bus.
//! Every `encache` and `remove` is broadcast as a [`CacheChange`] on the
//! cache's change channel, so any component holding the same bus can follow
//! an object through [`CacheStream`]s without a reference to the cache.
//!
//! Writers that do not own the data go through the mutation protocol:
//! `mutate()` sends a [`MutationRequest`] to whichever service registered a
//! [`MutateStream`] for that type tag, and exactly one of the caller's
//! success or error callbacks runs with the answer.
//!
//! ```text
//! encache/remove ──► changes channel ──► CacheStream (id | type tag, states)
//! mutate ──────────► mutations channel ─► MutateStream ── success/error ─┐
//!   ▲                                                                    │
//!   └──────────────────────── correlated reply ◄─────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod model;
pub mod stream;

pub use cache::BusCache;
pub use error::CacheError;
pub use model::{CacheChange, CacheEntry, CacheItem, MutationRequest, Tag};
pub use stream::{CacheStream, ChangeSelector, MutateStream};
