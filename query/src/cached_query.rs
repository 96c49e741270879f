use std::{any::Any, rc::Rc};

use serde_json::Value;

use crate::{query_options::OnError, QueryKind, QueryState, QueryStatus};

/// Callbacks for a single [`sync`](crate::Query::sync) call.
pub struct SyncParams<V, E> {
    pub(crate) on_success: Option<Box<dyn FnOnce(V)>>,
    pub(crate) on_error: Option<Box<dyn FnOnce(E)>>,
}

impl<V, E> Default for SyncParams<V, E> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }
}

impl<V, E> SyncParams<V, E> {
    /// Called with the result once the sync succeeds, or right away with cached data.
    pub fn set_on_success(self, on_success: impl FnOnce(V) + 'static) -> Self {
        Self {
            on_success: Some(Box::new(on_success)),
            ..self
        }
    }

    /// Called instead of the default error handler if the sync fails.
    pub fn set_on_error(self, on_error: impl FnOnce(E) + 'static) -> Self {
        Self {
            on_error: Some(Box::new(on_error)),
            ..self
        }
    }
}

/// Sends a failed request's error to the per-call handler, else the default one.
/// Without either, the error only lives in the status cell.
pub(crate) fn route_error<E>(
    error: E,
    on_error: Option<Box<dyn FnOnce(E)>>,
    default: Option<&OnError<E>>,
) {
    match (on_error, default) {
        (Some(on_error), _) => on_error(error),
        (None, Some(default)) => default(&error),
        (None, None) => {}
    }
}

/// Lifecycle callbacks wired by the client into every query it creates.
#[derive(Clone)]
pub(crate) struct QueryHooks {
    /// Data became valid, by a request or a forced update.
    pub(crate) on_validated: Rc<dyn Fn()>,
    /// The query was invalidated by its owner.
    pub(crate) on_invalidated: Rc<dyn Fn()>,
}

impl Default for QueryHooks {
    fn default() -> Self {
        Self {
            on_validated: Rc::new(|| {}),
            on_invalidated: Rc::new(|| {}),
        }
    }
}

/// The operations shared by [`Query`](crate::Query) and [`InfiniteQuery`](crate::InfiniteQuery).
pub trait QueryContainer<E> {
    /// The value held in the data cell, as presented to callers.
    type Data;

    /// Reads the current data, scheduling a fetch if needed. Tracked.
    fn data(&self) -> Option<Self::Data>;

    /// Foreground status. Tracked.
    fn statuses(&self) -> QueryStatus<E>;

    /// Lifecycle state derived from the foreground status. Tracked.
    fn state(&self) -> QueryState {
        self.statuses().state()
    }

    /// Whether the query refreshes behind a separate status cell.
    fn is_background(&self) -> bool;

    /// Forces the next access to refetch.
    fn invalidate(&self);

    /// Replaces the data without a request.
    fn force_update(&self, data: Self::Data);
}

/// Type-erased view of a cached query, as held by the client.
pub trait CachedQuery<E> {
    /// Which container this is.
    fn kind(&self) -> QueryKind;

    /// Sets the invalid flag without notifying the client.
    fn mark_invalid(&self);

    /// Untracked.
    fn is_invalid(&self) -> bool;

    /// Whether the query refreshes behind a separate status cell.
    fn is_background(&self) -> bool;

    /// Untracked foreground status.
    fn statuses(&self) -> QueryStatus<E>;

    /// Untracked background status, if the query has one.
    fn background_statuses(&self) -> Option<QueryStatus<E>>;

    /// JSON snapshot of the data cell.
    fn data_snapshot(&self) -> Option<Value>;

    #[doc(hidden)]
    fn as_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Recovers a typed handle from an erased cached query.
pub(crate) trait FromCached<E>: Sized {
    fn from_cached(query: Rc<dyn CachedQuery<E>>) -> Option<Self>;
}
