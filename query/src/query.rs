use std::{any::Any, rc::Rc};

use futures::{
    future::{self, LocalBoxFuture},
    FutureExt,
};
use serde_json::Value;

use crate::{
    auxiliary_query::{AuxiliaryQuery, SharedRequest},
    cached_query::{route_error, FromCached, QueryHooks},
    query_options::{OnError, ResolvedOptions},
    storage::SyncableStorage,
    util::spawn_local,
    CachedQuery, DataStorage, FetchPolicy, KeyHash, QueryContainer, QueryErrorValue, QueryKind,
    QueryState, QueryStatus, QueryValue, SyncParams,
};

/// Caller supplied request of a [`Query`].
pub type QueryExecutor<V, E> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<V, E>>>;

/// A cached asynchronous read.
///
/// Handles are cheap to clone and share one instance. The instance stays cached while any
/// handle exists, or while the client retains it after a successful cache-first fetch.
pub struct Query<V: 'static, E: 'static> {
    inner: Rc<QueryInner<V, E>>,
}

impl<V, E> Clone for Query<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> PartialEq for Query<V, E> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<V, E> Eq for Query<V, E> {}

impl<V, E> std::fmt::Debug for Query<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key_hash", &self.inner.key_hash)
            .field("fetch_policy", &self.inner.fetch_policy)
            .finish()
    }
}

pub(crate) struct QueryInner<V: 'static, E: 'static> {
    key_hash: KeyHash,
    executor: QueryExecutor<V, E>,
    storage: DataStorage<V>,
    aux: AuxiliaryQuery<V, E>,
    fetch_policy: FetchPolicy,
    enabled_auto_fetch: bool,
    on_error: Option<OnError<E>>,
    hooks: QueryHooks,
}

impl<V, E> Query<V, E>
where
    V: QueryValue,
    E: QueryErrorValue,
{
    pub(crate) fn new(
        key_hash: KeyHash,
        executor: QueryExecutor<V, E>,
        storage: DataStorage<V>,
        aux: AuxiliaryQuery<V, E>,
        options: &ResolvedOptions<E>,
        hooks: QueryHooks,
    ) -> Self {
        Self {
            inner: Rc::new(QueryInner {
                key_hash,
                executor,
                storage,
                aux,
                fetch_policy: options.fetch_policy,
                enabled_auto_fetch: options.enabled_auto_fetch,
                on_error: options.on_error.clone(),
                hooks,
            }),
        }
    }

    pub(crate) fn erased(&self) -> Rc<dyn CachedQuery<E>> {
        self.inner.clone()
    }

    /// Hash identifying this instance in the client.
    pub fn key_hash(&self) -> &KeyHash {
        &self.inner.key_hash
    }

    /// The fetch policy this instance was created with.
    pub fn fetch_policy(&self) -> FetchPolicy {
        self.inner.fetch_policy
    }

    /// Current data. Tracked.
    ///
    /// Schedules a sync on the next tick if the query is invalid, or if auto fetch is on and
    /// nothing was requested yet. The cached value is returned right away either way.
    pub fn data(&self) -> Option<V> {
        self.refetch_if_needed();
        self.inner.storage.data()
    }

    /// Reads the current data by reference. Same scheduling as [`data`](Self::data).
    pub fn with_data<T>(&self, func: impl FnOnce(Option<&V>) -> T) -> T {
        self.refetch_if_needed();
        self.inner.storage.with(func)
    }

    /// Fetches unless a valid cache-first success is already in place.
    ///
    /// While a request is pending the call joins it. On a valid cache-first success,
    /// `on_success` runs synchronously with the cached data.
    pub fn sync(&self, params: SyncParams<V, E>) {
        if self.needs_request() {
            self.proceed_sync(params);
            return;
        }

        if let Some(on_success) = params.on_success {
            if let Some(data) = self.inner.storage.data_untracked() {
                on_success(data);
            }
        }
    }

    /// Awaitable flavour of [`sync`](Self::sync).
    ///
    /// Failures are returned to the caller instead of the error handlers.
    pub fn fetch(&self) -> LocalBoxFuture<'static, Result<V, E>> {
        if !self.needs_request() {
            if let Some(data) = self.inner.storage.data_untracked() {
                return future::ready(Ok(data)).boxed_local();
            }
        }
        self.request().boxed_local()
    }

    /// Replaces the data without a request and marks the query valid.
    pub fn force_update(&self, data: V) {
        self.force_update_with(move |_| data);
    }

    /// Computes new data from the current value, without a request.
    pub fn force_update_with(&self, updater: impl FnOnce(Option<V>) -> V) {
        self.inner.aux.submit_success();
        self.inner.storage.update_data(updater);
        (self.inner.hooks.on_validated)();
    }

    /// Marks the query invalid and releases the client's hold on it.
    pub fn invalidate(&self) {
        self.inner.aux.invalidate();
        (self.inner.hooks.on_invalidated)();
    }

    /// Foreground status. Tracked.
    pub fn statuses(&self) -> QueryStatus<E> {
        self.inner.aux.status().statuses()
    }

    /// Background status, if the query runs in background mode. Tracked.
    pub fn background(&self) -> Option<QueryStatus<E>> {
        self.inner.aux.background().map(|status| status.statuses())
    }

    /// Tracked.
    pub fn is_loading(&self) -> bool {
        self.inner.aux.status().is_loading()
    }

    /// Tracked.
    pub fn is_success(&self) -> bool {
        self.inner.aux.status().is_success()
    }

    /// Tracked.
    pub fn is_error(&self) -> bool {
        self.inner.aux.status().is_error()
    }

    /// Error of the last failed request. Tracked.
    pub fn error(&self) -> Option<E> {
        self.inner.aux.status().error()
    }

    /// Tracked.
    pub fn is_invalid(&self) -> bool {
        self.inner.aux.is_invalid()
    }

    /// Whether the query refreshes behind a separate status cell.
    pub fn is_background(&self) -> bool {
        self.inner.aux.background().is_some()
    }

    fn needs_request(&self) -> bool {
        let inner = &self.inner;
        inner.fetch_policy == FetchPolicy::NetworkOnly
            || inner.aux.is_invalid_untracked()
            || inner.aux.has_pending()
            || !inner.aux.status().is_success_untracked()
    }

    fn should_auto_sync(&self) -> bool {
        let inner = &self.inner;
        let status = inner.aux.status().statuses_untracked();
        inner.enabled_auto_fetch && status.state() == QueryState::Idle
    }

    fn refetch_if_needed(&self) {
        // The invalid flag is read tracked so observers come back here once it flips.
        if self.inner.aux.is_invalid() || self.should_auto_sync() {
            let query = self.clone();
            // Deferred so a read never mutates state while observers run.
            spawn_local(async move {
                if query.inner.aux.is_invalid_untracked() || query.should_auto_sync() {
                    query.proceed_sync(SyncParams::default());
                }
            });
        }
    }

    fn request(&self) -> SharedRequest<V, E> {
        let executor = self.inner.executor.clone();
        let storage = self.inner.storage.clone();
        let on_validated = self.inner.hooks.on_validated.clone();
        self.inner.aux.unified(
            move || executor(),
            move |data| {
                storage.set_data(data.clone());
                on_validated();
            },
        )
    }

    fn proceed_sync(&self, params: SyncParams<V, E>) {
        let request = self.request();
        let default_on_error = self.inner.on_error.clone();
        spawn_local(async move {
            match request.await {
                Ok(data) => {
                    if let Some(on_success) = params.on_success {
                        on_success(data);
                    }
                }
                Err(error) => route_error(error, params.on_error, default_on_error.as_ref()),
            }
        });
    }
}

impl<V, E> QueryContainer<E> for Query<V, E>
where
    V: QueryValue,
    E: QueryErrorValue,
{
    type Data = V;

    fn data(&self) -> Option<V> {
        Query::data(self)
    }

    fn statuses(&self) -> QueryStatus<E> {
        Query::statuses(self)
    }

    fn is_background(&self) -> bool {
        Query::is_background(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn force_update(&self, data: V) {
        Query::force_update(self, data)
    }
}

impl<V, E> CachedQuery<E> for QueryInner<V, E>
where
    V: QueryValue,
    E: QueryErrorValue,
{
    fn kind(&self) -> QueryKind {
        QueryKind::Query
    }

    fn mark_invalid(&self) {
        self.aux.invalidate();
    }

    fn is_invalid(&self) -> bool {
        self.aux.is_invalid_untracked()
    }

    fn is_background(&self) -> bool {
        self.aux.background().is_some()
    }

    fn statuses(&self) -> QueryStatus<E> {
        self.aux.status().statuses_untracked()
    }

    fn background_statuses(&self) -> Option<QueryStatus<E>> {
        self.aux.background().map(|status| status.statuses_untracked())
    }

    fn data_snapshot(&self) -> Option<Value> {
        self.storage.snapshot().ok()
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

impl<V, E> FromCached<E> for Query<V, E>
where
    V: QueryValue,
    E: QueryErrorValue,
{
    fn from_cached(query: Rc<dyn CachedQuery<E>>) -> Option<Self> {
        query
            .as_any()
            .downcast::<QueryInner<V, E>>()
            .ok()
            .map(|inner| Query { inner })
    }
}
