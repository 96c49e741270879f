use std::{any::Any, cell::Cell, rc::Rc};

use futures::{
    future::{self, LocalBoxFuture},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    auxiliary_query::AuxiliaryQuery,
    cached_query::{route_error, FromCached, QueryHooks},
    query_options::{OnError, ResolvedOptions},
    storage::SyncableStorage,
    util::spawn_local,
    CachedQuery, DataStorage, FetchPolicy, KeyHash, QueryContainer, QueryErrorValue, QueryKind,
    QueryState, QueryStatus, QueryValue, SyncParams,
};

/// Page request passed to an infinite query's executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfiniteParams {
    /// Index of the first requested item.
    pub offset: usize,
    /// Number of requested items.
    pub count: usize,
}

/// Accumulated pages of an infinite query, as held in its data cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData<T> {
    /// Every item loaded so far.
    pub data: Vec<T>,
    /// Offset of the last requested page.
    pub offset: usize,
    /// The last page came back shorter than requested.
    pub is_end_reached: bool,
}

/// Caller supplied page request of an [`InfiniteQuery`].
pub type InfiniteExecutor<T, E> =
    Rc<dyn Fn(InfiniteParams) -> LocalBoxFuture<'static, Result<Vec<T>, E>>>;

/// A cached paginated read accumulating pages into one list.
///
/// [`sync`](Self::sync) and [`fetch`](Self::fetch) load the first page and replace the
/// list, [`fetch_more`](Self::fetch_more) appends the next one.
pub struct InfiniteQuery<T: 'static, E: 'static> {
    inner: Rc<InfiniteQueryInner<T, E>>,
}

impl<T, E> Clone for InfiniteQuery<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> PartialEq for InfiniteQuery<T, E> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> Eq for InfiniteQuery<T, E> {}

impl<T, E> std::fmt::Debug for InfiniteQuery<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQuery")
            .field("key_hash", &self.inner.key_hash)
            .field("fetch_policy", &self.inner.fetch_policy)
            .field("increment_count", &self.inner.increment_count)
            .finish()
    }
}

pub(crate) struct InfiniteQueryInner<T: 'static, E: 'static> {
    key_hash: KeyHash,
    executor: InfiniteExecutor<T, E>,
    storage: DataStorage<InfiniteData<T>>,
    aux: AuxiliaryQuery<Vec<T>, E>,
    loading_more: Rc<Cell<bool>>,
    fetch_policy: FetchPolicy,
    enabled_auto_fetch: bool,
    increment_count: usize,
    on_error: Option<OnError<E>>,
    hooks: QueryHooks,
}

impl<T, E> InfiniteQuery<T, E>
where
    T: QueryValue,
    E: QueryErrorValue,
{
    pub(crate) fn new(
        key_hash: KeyHash,
        executor: InfiniteExecutor<T, E>,
        storage: DataStorage<InfiniteData<T>>,
        aux: AuxiliaryQuery<Vec<T>, E>,
        options: &ResolvedOptions<E>,
        hooks: QueryHooks,
    ) -> Self {
        Self {
            inner: Rc::new(InfiniteQueryInner {
                key_hash,
                executor,
                storage,
                aux,
                loading_more: Rc::new(Cell::new(false)),
                fetch_policy: options.fetch_policy,
                enabled_auto_fetch: options.enabled_auto_fetch,
                increment_count: options.increment_count,
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

    /// Page size.
    pub fn increment_count(&self) -> usize {
        self.inner.increment_count
    }

    /// Every item loaded so far. Tracked.
    ///
    /// Schedules a sync on the next tick if the query is invalid, or if auto fetch is on and
    /// nothing was requested yet.
    pub fn data(&self) -> Option<Vec<T>> {
        self.refetch_if_needed();
        self.inner
            .storage
            .with(|current| current.map(|current| current.data.clone()))
    }

    /// Whether the last page came back shorter than the page size. Tracked.
    pub fn is_end_reached(&self) -> bool {
        self.inner
            .storage
            .with(|current| current.map(|current| current.is_end_reached))
            .unwrap_or(false)
    }

    /// Loads the first page unless a valid cache-first success is already in place.
    pub fn sync(&self, params: SyncParams<Vec<T>, E>) {
        if self.needs_request() {
            self.proceed_sync(params);
            return;
        }

        if let Some(on_success) = params.on_success {
            if let Some(data) = self.data_untracked() {
                on_success(data);
            }
        }
    }

    /// Awaitable flavour of [`sync`](Self::sync).
    ///
    /// Failures are returned to the caller instead of the error handlers.
    pub fn fetch(&self) -> LocalBoxFuture<'static, Result<Vec<T>, E>> {
        if !self.needs_request() {
            if let Some(data) = self.data_untracked() {
                return future::ready(Ok(data)).boxed_local();
            }
        }
        self.first_page()
    }

    /// Requests the next page and appends it.
    ///
    /// Ignored once the end is reached, before the first page, or while any request is
    /// pending.
    pub fn fetch_more(&self) {
        let inner = &self.inner;
        if inner.aux.has_pending() {
            return;
        }

        let count = inner.increment_count;
        let mut offset = None;
        inner.storage.update_existing(|current| {
            if !current.is_end_reached {
                current.offset += count;
                offset = Some(current.offset);
            }
        });
        let Some(offset) = offset else {
            return;
        };

        let executor = inner.executor.clone();
        let storage = inner.storage.clone();
        let on_validated = inner.hooks.on_validated.clone();
        let loading_more = inner.loading_more.clone();
        loading_more.set(true);
        let request = inner.aux.unified(
            move || {
                let request = executor(InfiniteParams { offset, count });
                async move {
                    let result = request.await;
                    loading_more.set(false);
                    result
                }
                .boxed_local()
            },
            move |page| {
                let is_end_reached = page.len() < count;
                storage.update_existing(|current| {
                    current.data.extend(page.iter().cloned());
                    current.is_end_reached = is_end_reached;
                });
                on_validated();
            },
        );

        let default_on_error = inner.on_error.clone();
        spawn_local(async move {
            if let Err(error) = request.await {
                route_error(error, None, default_on_error.as_ref());
            }
        });
    }

    /// Replaces the whole list without a request and marks the query valid.
    pub fn force_update(&self, data: Vec<T>) {
        self.force_update_with(move |_| data);
    }

    /// Computes a new list from the current one, without a request.
    pub fn force_update_with(&self, updater: impl FnOnce(Option<Vec<T>>) -> Vec<T>) {
        self.inner.aux.submit_success();
        self.inner.storage.update_data(|current| match current {
            Some(current) => InfiniteData {
                data: updater(Some(current.data)),
                ..current
            },
            None => InfiniteData {
                data: updater(None),
                offset: 0,
                is_end_reached: false,
            },
        });
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

    fn data_untracked(&self) -> Option<Vec<T>> {
        self.inner
            .storage
            .with_untracked(|current| current.map(|current| current.data.clone()))
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
        if self.inner.aux.is_invalid() || self.should_auto_sync() {
            let query = self.clone();
            spawn_local(async move {
                if query.inner.aux.is_invalid_untracked() || query.should_auto_sync() {
                    query.proceed_sync(SyncParams::default());
                }
            });
        }
    }

    /// Restarts pagination from offset zero, keeping the loaded list until the page arrives.
    ///
    /// Joins a pending first page. A pending `fetch_more` is awaited first, then the first
    /// page is requested on its own.
    fn first_page(&self) -> LocalBoxFuture<'static, Result<Vec<T>, E>> {
        let inner = &self.inner;
        if inner.loading_more.get() {
            let pending = inner.aux.pending();
            let query = self.clone();
            return async move {
                if let Some(pending) = pending {
                    let _ = pending.await;
                }
                query.first_page().await
            }
            .boxed_local();
        }

        let count = inner.increment_count;
        if !inner.aux.has_pending() {
            inner.storage.update_existing(|current| {
                current.offset = 0;
                current.is_end_reached = false;
            });
        }

        let executor = inner.executor.clone();
        let storage = inner.storage.clone();
        let on_validated = inner.hooks.on_validated.clone();
        inner.aux.unified(
            move || executor(InfiniteParams { offset: 0, count }),
            move |page| {
                storage.set_data(InfiniteData {
                    data: page.clone(),
                    offset: 0,
                    is_end_reached: page.len() < count,
                });
                on_validated();
            },
        )
        .boxed_local()
    }

    fn proceed_sync(&self, params: SyncParams<Vec<T>, E>) {
        let request = self.first_page();
        let storage = self.inner.storage.clone();
        let is_background = self.is_background();
        let default_on_error = self.inner.on_error.clone();
        spawn_local(async move {
            match request.await {
                Ok(data) => {
                    if let Some(on_success) = params.on_success {
                        on_success(data);
                    }
                }
                Err(error) => {
                    // Background queries keep showing the previous list through a failed refresh.
                    if !is_background {
                        storage.clean_data();
                    }
                    route_error(error, params.on_error, default_on_error.as_ref());
                }
            }
        });
    }
}

impl<T, E> QueryContainer<E> for InfiniteQuery<T, E>
where
    T: QueryValue,
    E: QueryErrorValue,
{
    type Data = Vec<T>;

    fn data(&self) -> Option<Vec<T>> {
        InfiniteQuery::data(self)
    }

    fn statuses(&self) -> QueryStatus<E> {
        InfiniteQuery::statuses(self)
    }

    fn is_background(&self) -> bool {
        InfiniteQuery::is_background(self)
    }

    fn invalidate(&self) {
        InfiniteQuery::invalidate(self)
    }

    fn force_update(&self, data: Vec<T>) {
        InfiniteQuery::force_update(self, data)
    }
}

impl<T, E> CachedQuery<E> for InfiniteQueryInner<T, E>
where
    T: QueryValue,
    E: QueryErrorValue,
{
    fn kind(&self) -> QueryKind {
        QueryKind::InfiniteQuery
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

impl<T, E> FromCached<E> for InfiniteQuery<T, E>
where
    T: QueryValue,
    E: QueryErrorValue,
{
    fn from_cached(query: Rc<dyn CachedQuery<E>>) -> Option<Self> {
        query
            .as_any()
            .downcast::<InfiniteQueryInner<T, E>>()
            .ok()
            .map(|inner| InfiniteQuery { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        time::Duration,
    };

    use leptos::*;

    use super::*;
    use crate::{cache_key, util::settle, ClientOptions, QueryClient, QueryOptions};

    type Pages = Rc<RefCell<Vec<Result<Vec<String>, String>>>>;

    /// Serves scripted pages in order and records the params of every request.
    fn scripted_executor(
        pages: Pages,
        requests: Rc<RefCell<Vec<InfiniteParams>>>,
    ) -> impl Fn(InfiniteParams) -> LocalBoxFuture<'static, Result<Vec<String>, String>> + 'static
    {
        move |params| {
            requests.borrow_mut().push(params);
            let page = if pages.borrow().is_empty() {
                Ok(Vec::new())
            } else {
                pages.borrow_mut().remove(0)
            };
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                page
            }
            .boxed_local()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn client() -> QueryClient<String> {
        QueryClient::with_capabilities(ClientOptions::default(), None, None)
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_more_appends_until_short_page() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let client = client();
                let pages: Pages = Rc::new(RefCell::new(vec![
                    Ok(strings(&["x", "y"])),
                    Ok(strings(&["a", "b"])),
                    Ok(strings(&["c"])),
                ]));
                let requests = Rc::new(RefCell::new(Vec::new()));
                let query = client.create_infinite_query_with_options(
                    cache_key!["list"],
                    scripted_executor(pages, requests.clone()),
                    QueryOptions::default().set_increment_count(2),
                );

                // Nothing to extend before the first page.
                query.fetch_more();
                settle().await;
                assert!(requests.borrow().is_empty());

                assert_eq!(query.fetch().await, Ok(strings(&["x", "y"])));
                assert!(!query.is_end_reached());

                query.fetch_more();
                // Ignored while the previous page is in flight.
                query.fetch_more();
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(query.data(), Some(strings(&["x", "y", "a", "b"])));
                assert!(!query.is_end_reached());

                query.fetch_more();
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(query.data(), Some(strings(&["x", "y", "a", "b", "c"])));
                assert!(query.is_end_reached());

                query.fetch_more();
                settle().await;
                assert_eq!(
                    *requests.borrow(),
                    vec![
                        InfiniteParams { offset: 0, count: 2 },
                        InfiniteParams { offset: 2, count: 2 },
                        InfiniteParams { offset: 4, count: 2 },
                    ]
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn sync_restarts_from_first_page() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let client = client();
                let pages: Pages = Rc::new(RefCell::new(vec![
                    Ok(strings(&["a"])),
                    Ok(strings(&["z", "y"])),
                ]));
                let requests = Rc::new(RefCell::new(Vec::new()));
                let query = client.create_infinite_query_with_options(
                    cache_key!["list"],
                    scripted_executor(pages, requests.clone()),
                    QueryOptions::default()
                        .set_increment_count(2)
                        .set_fetch_policy(FetchPolicy::NetworkOnly),
                );

                query.fetch().await.unwrap();
                assert!(query.is_end_reached());

                let seen = Rc::new(RefCell::new(None));
                query.sync(SyncParams::default().set_on_success({
                    let seen = seen.clone();
                    move |data| *seen.borrow_mut() = Some(data)
                }));
                // The loaded list stays readable while the first page reloads.
                assert_eq!(query.data(), Some(strings(&["a"])));
                assert!(!query.is_end_reached());

                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(query.data(), Some(strings(&["z", "y"])));
                assert_eq!(*seen.borrow(), Some(strings(&["z", "y"])));
                assert_eq!(requests.borrow().last(), Some(&InfiniteParams { offset: 0, count: 2 }));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_clears_data_unless_background() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let client = client();
                let errors = Rc::new(Cell::new(0));

                for is_background in [false, true] {
                    let pages: Pages = Rc::new(RefCell::new(vec![
                        Ok(strings(&["a"])),
                        Err("offline".to_string()),
                    ]));
                    let query = client.create_infinite_query_with_options(
                        cache_key!["list", is_background],
                        scripted_executor(pages, Default::default()),
                        QueryOptions::default().set_is_background(is_background),
                    );
                    query.fetch().await.unwrap();

                    query.invalidate();
                    query.sync(SyncParams::default().set_on_error({
                        let errors = errors.clone();
                        move |_| errors.set(errors.get() + 1)
                    }));
                    tokio::time::sleep(Duration::from_millis(20)).await;

                    let data = query.data_untracked();
                    if is_background {
                        assert_eq!(data, Some(strings(&["a"])));
                        assert!(query.background().unwrap().is_error);
                    } else {
                        assert_eq!(data, None);
                        assert!(query.is_error());
                    }
                }
                assert_eq!(errors.get(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_refetch_settles_after_clearing_data() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let client = client();
                let calls = Rc::new(Cell::new(0));
                let query = client.create_infinite_query(cache_key!["list"], {
                    let calls = calls.clone();
                    move |_: InfiniteParams| {
                        calls.set(calls.get() + 1);
                        let page = if calls.get() == 1 {
                            Ok(strings(&["a"]))
                        } else {
                            Err("offline".to_string())
                        };
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            page
                        }
                        .boxed_local()
                    }
                });
                query.fetch().await.unwrap();

                create_isomorphic_effect({
                    let query = query.clone();
                    move |_| {
                        query.data();
                    }
                });
                query.invalidate();

                tokio::time::sleep(Duration::from_millis(100)).await;
                let after_failure = calls.get();
                assert!(after_failure <= 3, "{after_failure} requests");
                assert_eq!(query.data_untracked(), None);
                assert!(query.is_error());

                tokio::time::sleep(Duration::from_millis(500)).await;
                assert_eq!(calls.get(), after_failure);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn sync_during_fetch_more_reloads_first_page() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let client = client();
                let pages: Pages = Rc::new(RefCell::new(vec![
                    Ok(strings(&["x", "y"])),
                    Ok(strings(&["a", "b"])),
                    Ok(strings(&["z"])),
                ]));
                let requests = Rc::new(RefCell::new(Vec::new()));
                let query = client.create_infinite_query_with_options(
                    cache_key!["list"],
                    scripted_executor(pages, requests.clone()),
                    QueryOptions::default()
                        .set_increment_count(2)
                        .set_fetch_policy(FetchPolicy::NetworkOnly),
                );

                query.fetch().await.unwrap();
                query.fetch_more();

                let seen = Rc::new(RefCell::new(None));
                query.sync(SyncParams::default().set_on_success({
                    let seen = seen.clone();
                    move |data| *seen.borrow_mut() = Some(data)
                }));

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(
                    *requests.borrow(),
                    vec![
                        InfiniteParams { offset: 0, count: 2 },
                        InfiniteParams { offset: 2, count: 2 },
                        InfiniteParams { offset: 0, count: 2 },
                    ]
                );
                assert_eq!(*seen.borrow(), Some(strings(&["z"])));
                assert_eq!(query.data_untracked(), Some(strings(&["z"])));
                assert!(query.is_end_reached());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn force_update_replaces_list() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let client = client();
                let requests = Rc::new(RefCell::new(Vec::new()));
                let query = client.create_infinite_query(
                    cache_key!["list"],
                    scripted_executor(Default::default(), requests.clone()),
                );

                query.force_update(strings(&["a"]));
                query.force_update_with(|current| {
                    let mut current = current.unwrap_or_default();
                    current.push("b".to_string());
                    current
                });
                assert_eq!(query.data(), Some(strings(&["a", "b"])));
                assert!(query.is_success());
                settle().await;
                assert!(requests.borrow().is_empty());
            })
            .await;
    }
}
