use std::{
    any::type_name,
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::future::LocalBoxFuture;
use leptos::{logging::debug_warn, provide_context, use_context};
use serde::Serialize;
use serde_json::json;

use crate::{
    adaptable_map::AdaptableMap,
    auxiliary_query::AuxiliaryQuery,
    cache_key::serialize_segment,
    cached_query::{FromCached, QueryHooks},
    infinite_query::InfiniteExecutor,
    instant::Instant,
    mutation::MutationExecutor,
    polling::PollingService,
    query::QueryExecutor,
    query_options::ResolvedOptions,
    storage::StorageFactory,
    synchronization::SynchronizationService,
    BroadcastChannel, CacheKey, CachedQuery, ClientOptions, DataStorage, DocumentVisibility,
    FetchPolicy, InfiniteData, InfiniteParams, InfiniteQuery, InfiniteQuerySet,
    InfiniteQuerySetEntry, InspectedQuery, InvalidateStrategy, KeyHash, Keys, Mutation,
    MutationOptions, MutationSet, Query, QueryErrorValue, QueryKind, QueryOptions, QuerySet,
    QuerySetConfig, QuerySetEntry, QueryValue, StatusStorage,
};

/// Provides a [`QueryClient`] to the current scope.
pub fn provide_query_client<E: QueryErrorValue>(options: ClientOptions<E>) {
    provide_context(QueryClient::new(options));
}

/// Retrieves the [`QueryClient`] of the current scope.
pub fn use_query_client<E: QueryErrorValue>() -> QueryClient<E> {
    use_context::<QueryClient<E>>().expect("Query Client Missing.")
}

/// The cache of every query created through it.
///
/// Queries are keyed by caller supplied [`CacheKey`]s. Creating a query twice with the same
/// key and configuration returns the same instance. A query is held weakly until its first
/// successful cache-first fetch, strongly afterwards, and weakly again once invalidated.
///
/// Queries can be:
/// - Created with [`create_query`](Self::create_query) or [`create_infinite_query`](Self::create_infinite_query)
/// - Grouped under one configurator with [`create_query_set`](Self::create_query_set)
/// - [Invalidated](Self::invalidate) by matching key segments
/// - [Inspected](Self::inspect) without side effects
///
/// `E` is the error type shared by every executor of this client.
pub struct QueryClient<E: 'static> {
    inner: Rc<ClientInner<E>>,
}

impl<E> Clone for QueryClient<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<E: 'static> {
    keys: RefCell<HashMap<KeyHash, CacheKey>>,
    queries: AdaptableMap<dyn CachedQuery<E>>,
    data_storage: StorageFactory,
    status_storage: StorageFactory,
    options: ClientOptions<E>,
    polling: PollingService,
    synchronization: SynchronizationService<E>,
}

impl<E> QueryClient<E>
where
    E: QueryErrorValue,
{
    /// Creates a client with the runtime's own capabilities.
    ///
    /// In the browser (`csr`) these are the `BroadcastChannel` and the document visibility.
    /// Elsewhere synchronization is off and the page counts as always visible.
    pub fn new(options: ClientOptions<E>) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "csr")] {
                let channel = crate::WebBroadcastChannel::new()
                    .map(|channel| Rc::new(channel) as Rc<dyn BroadcastChannel>);
                let visibility = crate::WebVisibility::new()
                    .map(|visibility| Rc::new(visibility) as Rc<dyn DocumentVisibility>);
                Self::with_capabilities(options, channel, visibility)
            } else {
                Self::with_capabilities(options, None, None)
            }
        }
    }

    /// Creates a client with explicit capabilities. `None` disables the matching feature.
    pub fn with_capabilities(
        options: ClientOptions<E>,
        channel: Option<Rc<dyn BroadcastChannel>>,
        visibility: Option<Rc<dyn DocumentVisibility>>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<ClientInner<E>>| {
            let polling = PollingService::new(
                {
                    let weak = weak.clone();
                    move |key_hash| {
                        weak.upgrade()
                            .map(|inner| inner.queries.has(key_hash))
                            .unwrap_or(false)
                    }
                },
                {
                    let weak = weak.clone();
                    move |key_hash| {
                        if let Some(inner) = weak.upgrade() {
                            QueryClient { inner }.invalidate_by_key_hash(key_hash);
                        }
                    }
                },
                visibility,
            );
            let data_storage = StorageFactory::new();
            let status_storage = StorageFactory::new();
            let synchronization = SynchronizationService::new(
                channel,
                data_storage.clone(),
                status_storage.clone(),
                polling.clone(),
            );

            ClientInner {
                keys: RefCell::new(HashMap::new()),
                queries: AdaptableMap::default(),
                data_storage,
                status_storage,
                options,
                polling,
                synchronization,
            }
        });

        Self { inner }
    }

    /// The defaults every query of this client falls back to.
    pub fn options(&self) -> &ClientOptions<E> {
        &self.inner.options
    }

    /// Creates (or reuses) a query with client defaults.
    ///
    /// Example:
    /// ```
    /// use futures::FutureExt;
    /// use leptos_query_cache::*;
    ///
    /// # let _ = leptos::create_runtime();
    /// let client = QueryClient::<String>::new(ClientOptions::default());
    /// let user = client.create_query(cache_key!["user", 1], || {
    ///     async { Ok::<_, String>("Ann".to_string()) }.boxed_local()
    /// });
    /// assert_eq!(user, client.create_query(cache_key!["user", 1], || {
    ///     async { Ok::<_, String>("Ann".to_string()) }.boxed_local()
    /// }));
    /// ```
    pub fn create_query<V>(
        &self,
        key: CacheKey,
        executor: impl Fn() -> LocalBoxFuture<'static, Result<V, E>> + 'static,
    ) -> Query<V, E>
    where
        V: QueryValue,
    {
        self.create_query_with_options(key, executor, QueryOptions::default())
    }

    /// Creates (or reuses) a query with its own options.
    ///
    /// Options that shape the instance (fetch policy, background mode) are part of its identity.
    pub fn create_query_with_options<V>(
        &self,
        key: CacheKey,
        executor: impl Fn() -> LocalBoxFuture<'static, Result<V, E>> + 'static,
        options: QueryOptions<E>,
    ) -> Query<V, E>
    where
        V: QueryValue,
    {
        self.create_query_from_executor(key, Rc::new(executor), options)
    }

    pub(crate) fn create_query_from_executor<V>(
        &self,
        key: CacheKey,
        executor: QueryExecutor<V, E>,
        options: QueryOptions<E>,
    ) -> Query<V, E>
    where
        V: QueryValue,
    {
        let resolved = options.resolve(&self.inner.options);
        let keys = self.make_keys(key, &resolved, QueryKind::Query, type_name::<V>());
        if let Some(query) = self.cached::<Query<V, E>>(&keys.query_key_hash) {
            return query;
        }

        let query = Query::new(
            keys.query_key_hash.clone(),
            executor,
            self.inner
                .data_storage
                .get_storage::<DataStorage<V>>(&keys.data_key_hash),
            self.auxiliary(&keys, resolved.is_background),
            &resolved,
            self.hooks(&keys, &resolved),
        );
        self.track(&keys, &query.erased());
        query
    }

    /// Creates (or reuses) an infinite query with client defaults.
    pub fn create_infinite_query<T>(
        &self,
        key: CacheKey,
        executor: impl Fn(InfiniteParams) -> LocalBoxFuture<'static, Result<Vec<T>, E>> + 'static,
    ) -> InfiniteQuery<T, E>
    where
        T: QueryValue,
    {
        self.create_infinite_query_with_options(key, executor, QueryOptions::default())
    }

    /// Creates (or reuses) an infinite query with its own options.
    pub fn create_infinite_query_with_options<T>(
        &self,
        key: CacheKey,
        executor: impl Fn(InfiniteParams) -> LocalBoxFuture<'static, Result<Vec<T>, E>> + 'static,
        options: QueryOptions<E>,
    ) -> InfiniteQuery<T, E>
    where
        T: QueryValue,
    {
        self.create_infinite_query_from_executor(key, Rc::new(executor), options)
    }

    pub(crate) fn create_infinite_query_from_executor<T>(
        &self,
        key: CacheKey,
        executor: InfiniteExecutor<T, E>,
        options: QueryOptions<E>,
    ) -> InfiniteQuery<T, E>
    where
        T: QueryValue,
    {
        let resolved = options.resolve(&self.inner.options);
        let keys = self.make_keys(key, &resolved, QueryKind::InfiniteQuery, type_name::<T>());
        if let Some(query) = self.cached::<InfiniteQuery<T, E>>(&keys.query_key_hash) {
            return query;
        }

        let query = InfiniteQuery::new(
            keys.query_key_hash.clone(),
            executor,
            self.inner
                .data_storage
                .get_storage::<DataStorage<InfiniteData<T>>>(&keys.data_key_hash),
            self.auxiliary(&keys, resolved.is_background),
            &resolved,
            self.hooks(&keys, &resolved),
        );
        self.track(&keys, &query.erased());
        query
    }

    /// Creates a mutation. Mutations are never cached.
    pub fn create_mutation<P, V>(
        &self,
        executor: impl Fn(P) -> LocalBoxFuture<'static, Result<V, E>> + 'static,
    ) -> Mutation<P, V, E>
    where
        P: 'static,
        V: Clone + 'static,
    {
        self.create_mutation_with_options(executor, MutationOptions::default())
    }

    /// Creates a mutation with its own options.
    pub fn create_mutation_with_options<P, V>(
        &self,
        executor: impl Fn(P) -> LocalBoxFuture<'static, Result<V, E>> + 'static,
        options: MutationOptions<E>,
    ) -> Mutation<P, V, E>
    where
        P: 'static,
        V: Clone + 'static,
    {
        self.create_mutation_from_executor(Rc::new(executor), options)
    }

    pub(crate) fn create_mutation_from_executor<P, V>(
        &self,
        executor: MutationExecutor<P, V, E>,
        options: MutationOptions<E>,
    ) -> Mutation<P, V, E>
    where
        P: 'static,
        V: Clone + 'static,
    {
        let options = MutationOptions {
            on_error: options
                .on_error
                .or_else(|| self.inner.options.on_error.clone()),
        };
        Mutation::new(executor, options)
    }

    /// Groups queries under one configurator, keyed by the configurator's parameters.
    pub fn create_query_set<P, V, F>(&self, configurator: F) -> QuerySet<P, V, E>
    where
        P: Serialize + 'static,
        V: QueryValue,
        F: Fn(&P) -> QuerySetEntry<V, E> + 'static,
    {
        self.create_query_set_with_config(QuerySetConfig::default(), configurator)
    }

    /// [`create_query_set`](Self::create_query_set) with an explicit set name.
    pub fn create_query_set_with_config<P, V, F>(
        &self,
        config: QuerySetConfig,
        configurator: F,
    ) -> QuerySet<P, V, E>
    where
        P: Serialize + 'static,
        V: QueryValue,
        F: Fn(&P) -> QuerySetEntry<V, E> + 'static,
    {
        QuerySet::new(self.clone(), configurator, config)
    }

    /// Groups infinite queries under one configurator.
    pub fn create_infinite_query_set<P, T, F>(&self, configurator: F) -> InfiniteQuerySet<P, T, E>
    where
        P: Serialize + 'static,
        T: QueryValue,
        F: Fn(&P) -> InfiniteQuerySetEntry<T, E> + 'static,
    {
        self.create_infinite_query_set_with_config(QuerySetConfig::default(), configurator)
    }

    /// [`create_infinite_query_set`](Self::create_infinite_query_set) with an explicit set name.
    pub fn create_infinite_query_set_with_config<P, T, F>(
        &self,
        config: QuerySetConfig,
        configurator: F,
    ) -> InfiniteQuerySet<P, T, E>
    where
        P: Serialize + 'static,
        T: QueryValue,
        F: Fn(&P) -> InfiniteQuerySetEntry<T, E> + 'static,
    {
        InfiniteQuerySet::new(self.clone(), configurator, config)
    }

    /// Hands out mutations sharing `executor`.
    pub fn create_mutation_set<P, V>(
        &self,
        executor: impl Fn(P) -> LocalBoxFuture<'static, Result<V, E>> + 'static,
    ) -> MutationSet<P, V, E>
    where
        P: 'static,
        V: Clone + 'static,
    {
        MutationSet::new(self.clone(), Rc::new(executor))
    }

    /// Invalidates every live query whose key matches `keys` under `strategy`.
    ///
    /// Example:
    /// ```
    /// use leptos_query_cache::*;
    ///
    /// # let _ = leptos::create_runtime();
    /// let client = QueryClient::<String>::new(ClientOptions::default());
    /// // Every query containing the segment "users" or the segment 1.
    /// client.invalidate(&cache_key!["users", 1], InvalidateStrategy::PartialMatch);
    /// // Only queries containing both segments.
    /// client.invalidate(&cache_key!["users", 1], InvalidateStrategy::ChainMatch);
    /// ```
    pub fn invalidate(&self, keys: &CacheKey, strategy: InvalidateStrategy) {
        for key_hash in self.exists_key_hashes(keys, strategy) {
            self.invalidate_by_key_hash(&key_hash);
        }
    }

    /// Invalidates every tracked query.
    pub fn invalidate_queries(&self) {
        let key_hashes = self
            .inner
            .keys
            .try_borrow()
            .expect("invalidate_queries borrow")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        for key_hash in key_hashes {
            self.invalidate_by_key_hash(&key_hash);
        }
    }

    /// Live queries whose key matches `keys` under `strategy`.
    pub fn get_exists_queries(
        &self,
        keys: &CacheKey,
        strategy: InvalidateStrategy,
    ) -> Vec<Rc<dyn CachedQuery<E>>> {
        self.exists_key_hashes(keys, strategy)
            .iter()
            .filter_map(|key_hash| self.inner.queries.get(key_hash))
            .collect()
    }

    pub(crate) fn get_exists_typed<Q>(&self, keys: &CacheKey, strategy: InvalidateStrategy) -> Vec<Q>
    where
        Q: FromCached<E>,
    {
        self.get_exists_queries(keys, strategy)
            .into_iter()
            .filter_map(Q::from_cached)
            .collect()
    }

    /// Every live query with its key and retention, ordered by key hash.
    pub fn inspect(&self) -> Vec<InspectedQuery<E>> {
        let keys = self.inner.keys.try_borrow().expect("inspect borrow");
        let mut inspected = keys
            .iter()
            .filter_map(|(key_hash, key)| {
                let query = self.inner.queries.get(key_hash)?;
                let retention = self.inner.queries.retention(key_hash)?;
                Some(InspectedQuery {
                    key_hash: key_hash.clone(),
                    key: key.clone(),
                    retention,
                    query,
                })
            })
            .collect::<Vec<_>>();
        inspected.sort_by(|a, b| a.key_hash.cmp(&b.key_hash));
        inspected
    }

    /// Number of live queries.
    pub fn size(&self) -> usize {
        self.inner.queries.hashes().len()
    }

    fn invalidate_by_key_hash(&self, key_hash: &KeyHash) {
        let query = self.inner.queries.get(key_hash);
        if let Some(query) = query.as_ref() {
            query.mark_invalid();
        }
        self.inner.queries.convert_to_weak(key_hash);
        self.inner.polling.clean(key_hash);
    }

    fn exists_key_hashes(&self, keys: &CacheKey, strategy: InvalidateStrategy) -> Vec<KeyHash> {
        let invalidated = keys
            .segments()
            .iter()
            .map(serialize_segment)
            .collect::<Vec<_>>();

        let mut key_hashes = self
            .inner
            .keys
            .try_borrow()
            .expect("exists_key_hashes borrow")
            .iter()
            .filter(|(_, query_key)| is_touched(&invalidated, query_key, strategy))
            .map(|(key_hash, _)| key_hash.clone())
            .collect::<Vec<_>>();
        key_hashes.retain(|key_hash| self.inner.queries.has(key_hash));
        key_hashes.sort();
        key_hashes
    }

    fn make_keys(
        &self,
        root: CacheKey,
        options: &ResolvedOptions<E>,
        kind: QueryKind,
        value_type: &'static str,
    ) -> Keys {
        // Network-only instances created within one window share an identity, so a component
        // set up twice in a row does not fire two requests.
        let date = match options.fetch_policy {
            FetchPolicy::NetworkOnly => {
                Some(Instant::now().bucket(self.inner.options.network_only_window))
            }
            FetchPolicy::CacheFirst => None,
        };

        let query_key = root.clone().with(json!({
            "fetchPolicy": options.fetch_policy,
            "date": date,
            "isBackground": options.is_background,
            "type": kind,
            "value": value_type,
        }));
        let data_key = root.clone().with(json!({
            "type": kind,
            "value": value_type,
        }));
        let status_key = root.clone().with(json!({
            "type": kind,
            "date": date,
        }));
        let background_status_key = root.with(json!({
            "type": kind,
            "isBackground": options.is_background,
            "date": date,
        }));

        Keys {
            query_key_hash: query_key.hash(),
            query_key,
            data_key_hash: data_key.hash(),
            status_key_hash: status_key.hash(),
            background_status_key_hash: background_status_key.hash(),
        }
    }

    fn cached<Q: FromCached<E>>(&self, key_hash: &KeyHash) -> Option<Q> {
        let query = self.inner.queries.get(key_hash)?;
        let typed = Q::from_cached(query);
        if typed.is_none() {
            debug_warn!("Cached query {} has another type, replacing it.", key_hash);
        }
        typed
    }

    fn auxiliary<R>(&self, keys: &Keys, is_background: bool) -> AuxiliaryQuery<R, E>
    where
        R: Clone + 'static,
    {
        let status = self
            .inner
            .status_storage
            .get_storage::<StatusStorage<E>>(&keys.status_key_hash);
        let background = is_background.then(|| {
            self.inner
                .status_storage
                .get_storage::<StatusStorage<E>>(&keys.background_status_key_hash)
        });
        AuxiliaryQuery::new(status, background)
    }

    fn hooks(&self, keys: &Keys, options: &ResolvedOptions<E>) -> QueryHooks {
        let weak = Rc::downgrade(&self.inner);

        let on_validated = {
            let weak = weak.clone();
            let keys = keys.clone();
            let is_cacheable = options.fetch_policy != FetchPolicy::NetworkOnly;
            let enabled_synchronization = options.enabled_synchronization;
            let polling_time = options.polling_time;
            Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    QueryClient { inner }.submit_validity(
                        &keys,
                        is_cacheable,
                        enabled_synchronization,
                        polling_time,
                    );
                }
            })
        };

        let on_invalidated = {
            let key_hash = keys.query_key_hash.clone();
            Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.queries.convert_to_weak(&key_hash);
                    inner.polling.clean(&key_hash);
                }
            })
        };

        QueryHooks {
            on_validated,
            on_invalidated,
        }
    }

    fn submit_validity(
        &self,
        keys: &Keys,
        is_cacheable: bool,
        enabled_synchronization: bool,
        polling_time: Option<Duration>,
    ) {
        if enabled_synchronization {
            self.inner.synchronization.emit(keys);
        }

        if let Some(polling_time) = polling_time {
            self.inner
                .polling
                .setup_timer(&keys.query_key_hash, polling_time);
        }

        // Network-only queries stay weak and go away with their last handle.
        if is_cacheable {
            self.inner.queries.convert_to_strong(&keys.query_key_hash);
        }
    }

    fn track(&self, keys: &Keys, query: &Rc<dyn CachedQuery<E>>) {
        let purged = self.inner.queries.purge();
        let mut tracked = self.inner.keys.try_borrow_mut().expect("track borrow_mut");
        for key_hash in purged {
            tracked.remove(&key_hash);
        }
        tracked.insert(keys.query_key_hash.clone(), keys.query_key.clone());
        drop(tracked);

        self.inner.queries.set(keys.query_key_hash.clone(), query);
    }

    #[cfg(test)]
    fn retention(&self, key_hash: &KeyHash) -> Option<crate::Retention> {
        self.inner.queries.retention(key_hash)
    }
}

fn is_touched(invalidated: &[String], query_key: &CacheKey, strategy: InvalidateStrategy) -> bool {
    let query_segments = query_key
        .segments()
        .iter()
        .map(serialize_segment)
        .collect::<Vec<_>>();

    match strategy {
        InvalidateStrategy::ChainMatch => invalidated
            .iter()
            .all(|segment| query_segments.contains(segment)),
        InvalidateStrategy::PartialMatch => query_segments
            .iter()
            .any(|segment| invalidated.contains(segment)),
    }
}
