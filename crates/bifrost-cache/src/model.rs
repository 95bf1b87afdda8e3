//! Cache data model: items, entries, change events and mutation requests.

use bifrost_types::CorrelationId;
use std::fmt;
use uuid::Uuid;

/// A value that can live in a [`BusCache`](crate::BusCache).
///
/// The type tag identifies the kind of object for `on_all_changes` and for
/// routing mutation requests.
pub trait CacheItem: Clone + Send + Sync + 'static {
    fn type_tag(&self) -> &str;
}

/// Bounds shared by state tags and mutation types.
pub trait Tag: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<X> Tag for X where X: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// One stored value with the state tag of its last change.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T, S> {
    pub id: Uuid,
    pub value: T,
    /// `None` for entries loaded through `populate`.
    pub state: Option<S>,
}

/// Broadcast on the cache's change channel after every modification.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheChange<T, S> {
    pub id: Uuid,
    /// The stored value, or the removed one for deletions.
    pub value: T,
    pub state: S,
}

impl<T, S> CacheChange<T, S>
where
    T: CacheItem,
    S: Tag,
{
    /// Whether `state` is one of `states`. An empty list matches any state.
    #[must_use]
    pub fn state_in(&self, states: &[S]) -> bool {
        states.is_empty() || states.contains(&self.state)
    }
}

/// Asks a mutation handler to change a cached value.
#[derive(Clone)]
pub struct MutationRequest<T, M> {
    /// Correlation id routing the single answer back to `mutate()`.
    pub id: CorrelationId,
    pub value: T,
    pub mutation_type: M,
    pub type_tag: String,
}

impl<T, M: fmt::Debug> fmt::Debug for MutationRequest<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRequest")
            .field("id", &self.id)
            .field("mutation_type", &self.mutation_type)
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

/// Which mutation requests a handler accepts.
#[derive(Debug, Clone)]
pub(crate) struct MutationMatcher<M> {
    pub(crate) type_tag: String,
    /// Empty matches every mutation type.
    pub(crate) mutation_types: Vec<M>,
}

impl<M: Tag> MutationMatcher<M> {
    pub(crate) fn matches(&self, type_tag: &str, mutation_type: &M) -> bool {
        self.type_tag == type_tag
            && (self.mutation_types.is_empty() || self.mutation_types.contains(mutation_type))
    }
}
