use std::{
    any::TypeId,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    rc::Rc,
};

use futures::future::LocalBoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::{
    infinite_query::InfiniteExecutor, mutation::MutationExecutor, query::QueryExecutor, CacheKey,
    InfiniteParams, InfiniteQuery, InvalidateStrategy, Mutation, MutationOptions, Query,
    QueryClient, QueryErrorValue, QueryOptions, QuerySetConfig, QueryValue,
};

/// What a [`QuerySet`] configurator returns for one set of parameters.
pub struct QuerySetEntry<V: 'static, E: 'static> {
    /// Sub-keys to use instead of the parameters.
    pub keys: Option<CacheKey>,
    /// The request.
    pub execute: QueryExecutor<V, E>,
}

impl<V, E> QuerySetEntry<V, E> {
    /// Entry keyed by the set's parameters.
    pub fn new(execute: impl Fn() -> LocalBoxFuture<'static, Result<V, E>> + 'static) -> Self {
        Self {
            keys: None,
            execute: Rc::new(execute),
        }
    }

    /// Derive sub-keys from `keys` rather than from the parameters.
    pub fn with_keys(self, keys: CacheKey) -> Self {
        Self {
            keys: Some(keys),
            ..self
        }
    }
}

/// What an [`InfiniteQuerySet`] configurator returns for one set of parameters.
pub struct InfiniteQuerySetEntry<T: 'static, E: 'static> {
    /// Sub-keys to use instead of the parameters.
    pub keys: Option<CacheKey>,
    /// The page request.
    pub execute: InfiniteExecutor<T, E>,
}

impl<T, E> InfiniteQuerySetEntry<T, E> {
    /// Entry keyed by the set's parameters.
    pub fn new(
        execute: impl Fn(InfiniteParams) -> LocalBoxFuture<'static, Result<Vec<T>, E>> + 'static,
    ) -> Self {
        Self {
            keys: None,
            execute: Rc::new(execute),
        }
    }

    /// Derive sub-keys from `keys` rather than from the parameters.
    pub fn with_keys(self, keys: CacheKey) -> Self {
        Self {
            keys: Some(keys),
            ..self
        }
    }
}

/// Base key of a set: the configured name, else a hash of the configurator's type.
fn base_key<F: 'static>(config: &QuerySetConfig) -> String {
    if let Some(name) = config.name.as_ref() {
        return name.clone();
    }
    let mut hasher = DefaultHasher::new();
    std::any::type_name::<F>().hash(&mut hasher);
    TypeId::of::<F>().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Builds `[base, sub-keys...]` from parameters.
///
/// A serialized array is a list of parameters. Every object parameter becomes one
/// `[base, field, value]` segment per non-null field, other parameters are used as is.
pub(crate) fn generate_keys(base_key: &str, params: Value) -> CacheKey {
    let params = match params {
        Value::Array(params) => params,
        Value::Null => Vec::new(),
        param => vec![param],
    };

    let mut keys = CacheKey::new().with(base_key);
    for param in params {
        match param {
            Value::Object(fields) => {
                let mut fields = fields
                    .into_iter()
                    .filter(|(_, value)| !value.is_null())
                    .collect::<Vec<_>>();
                fields.sort_by(|(a, _), (b, _)| a.cmp(b));
                for (field, value) in fields {
                    keys.push(Value::Array(vec![
                        Value::String(base_key.to_string()),
                        Value::String(field),
                        value,
                    ]));
                }
            }
            param => keys.push(param),
        }
    }
    keys
}

fn params_value(params: impl Serialize) -> Value {
    serde_json::to_value(params).unwrap_or_else(|error| {
        leptos::logging::debug_warn!("Query set parameters failed to serialize: {}", error);
        Value::Null
    })
}

/// A family of queries sharing one configurator, addressable together for invalidation.
pub struct QuerySet<P: 'static, V: 'static, E: 'static> {
    client: QueryClient<E>,
    configurator: Rc<dyn Fn(&P) -> QuerySetEntry<V, E>>,
    base_key: String,
}

impl<P, V, E> Clone for QuerySet<P, V, E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            configurator: self.configurator.clone(),
            base_key: self.base_key.clone(),
        }
    }
}

impl<P, V, E> QuerySet<P, V, E>
where
    P: Serialize + 'static,
    V: QueryValue,
    E: QueryErrorValue,
{
    pub(crate) fn new<F>(client: QueryClient<E>, configurator: F, config: QuerySetConfig) -> Self
    where
        F: Fn(&P) -> QuerySetEntry<V, E> + 'static,
    {
        Self {
            client,
            base_key: base_key::<F>(&config),
            configurator: Rc::new(configurator),
        }
    }

    /// The key shared by every query of this set.
    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    /// Creates (or reuses) the query for `params` with client defaults.
    pub fn create(&self, params: &P) -> Query<V, E> {
        self.create_with_config(QueryOptions::default(), params)
    }

    /// Creates (or reuses) the query for `params` with its own options.
    pub fn create_with_config(&self, options: QueryOptions<E>, params: &P) -> Query<V, E> {
        let (keys, execute) = self.configure(params);
        self.client.create_query_from_executor(keys, execute, options)
    }

    /// Invalidates every query ever created from this set.
    pub fn invalidate_all(&self) {
        self.client.invalidate(
            &CacheKey::new().with(&self.base_key),
            InvalidateStrategy::PartialMatch,
        );
    }

    /// Invalidates the queries whose keys contain every key derived from `params`.
    pub fn invalidate(&self, params: &P) {
        let (keys, _) = self.configure(params);
        self.client.invalidate(&keys, InvalidateStrategy::ChainMatch);
    }

    /// Invalidates the queries matching a subset of parameter fields, e.g. `json!({"id": 1})`.
    pub fn invalidate_matching(&self, partial: impl Serialize) {
        let keys = generate_keys(&self.base_key, params_value(partial));
        self.client.invalidate(&keys, InvalidateStrategy::ChainMatch);
    }

    /// Rewrites the data of every existing query of `params`, without a request.
    pub fn force_update(&self, updater: impl Fn(Option<V>) -> V, params: &P) {
        let (keys, _) = self.configure(params);
        self.force_update_keys(updater, &keys);
    }

    /// Rewrites the data of every existing query matching a subset of parameter fields.
    pub fn force_update_matching(&self, updater: impl Fn(Option<V>) -> V, partial: impl Serialize) {
        let keys = generate_keys(&self.base_key, params_value(partial));
        self.force_update_keys(updater, &keys);
    }

    fn force_update_keys(&self, updater: impl Fn(Option<V>) -> V, keys: &CacheKey) {
        for query in self
            .client
            .get_exists_typed::<Query<V, E>>(keys, InvalidateStrategy::ChainMatch)
        {
            query.force_update_with(&updater);
        }
    }

    fn configure(&self, params: &P) -> (CacheKey, QueryExecutor<V, E>) {
        let entry = (self.configurator)(params);
        let keys = match entry.keys {
            Some(keys) => generate_keys(&self.base_key, Value::Array(keys.0)),
            None => generate_keys(&self.base_key, params_value(params)),
        };
        (keys, entry.execute)
    }
}

/// A family of infinite queries sharing one configurator.
pub struct InfiniteQuerySet<P: 'static, T: 'static, E: 'static> {
    client: QueryClient<E>,
    configurator: Rc<dyn Fn(&P) -> InfiniteQuerySetEntry<T, E>>,
    base_key: String,
}

impl<P, T, E> Clone for InfiniteQuerySet<P, T, E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            configurator: self.configurator.clone(),
            base_key: self.base_key.clone(),
        }
    }
}

impl<P, T, E> InfiniteQuerySet<P, T, E>
where
    P: Serialize + 'static,
    T: QueryValue,
    E: QueryErrorValue,
{
    pub(crate) fn new<F>(client: QueryClient<E>, configurator: F, config: QuerySetConfig) -> Self
    where
        F: Fn(&P) -> InfiniteQuerySetEntry<T, E> + 'static,
    {
        Self {
            client,
            base_key: base_key::<F>(&config),
            configurator: Rc::new(configurator),
        }
    }

    /// The key shared by every query of this set.
    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    /// Creates (or reuses) the infinite query for `params` with client defaults.
    pub fn create(&self, params: &P) -> InfiniteQuery<T, E> {
        self.create_with_config(QueryOptions::default(), params)
    }

    /// Creates (or reuses) the infinite query for `params` with its own options.
    pub fn create_with_config(&self, options: QueryOptions<E>, params: &P) -> InfiniteQuery<T, E> {
        let (keys, execute) = self.configure(params);
        self.client
            .create_infinite_query_from_executor(keys, execute, options)
    }

    /// Invalidates every infinite query ever created from this set.
    pub fn invalidate_all(&self) {
        self.client.invalidate(
            &CacheKey::new().with(&self.base_key),
            InvalidateStrategy::PartialMatch,
        );
    }

    /// Invalidates the infinite queries whose keys contain every key derived from `params`.
    pub fn invalidate(&self, params: &P) {
        let (keys, _) = self.configure(params);
        self.client.invalidate(&keys, InvalidateStrategy::ChainMatch);
    }

    /// Invalidates the infinite queries matching a subset of parameter fields.
    pub fn invalidate_matching(&self, partial: impl Serialize) {
        let keys = generate_keys(&self.base_key, params_value(partial));
        self.client.invalidate(&keys, InvalidateStrategy::ChainMatch);
    }

    /// Rewrites the list of every existing infinite query of `params`, without a request.
    pub fn force_update(&self, updater: impl Fn(Option<Vec<T>>) -> Vec<T>, params: &P) {
        let (keys, _) = self.configure(params);
        for query in self
            .client
            .get_exists_typed::<InfiniteQuery<T, E>>(&keys, InvalidateStrategy::ChainMatch)
        {
            query.force_update_with(&updater);
        }
    }

    fn configure(&self, params: &P) -> (CacheKey, InfiniteExecutor<T, E>) {
        let entry = (self.configurator)(params);
        let keys = match entry.keys {
            Some(keys) => generate_keys(&self.base_key, Value::Array(keys.0)),
            None => generate_keys(&self.base_key, params_value(params)),
        };
        (keys, entry.execute)
    }
}

/// Hands out mutations sharing one executor.
pub struct MutationSet<P: 'static, V: 'static, E: 'static> {
    client: QueryClient<E>,
    executor: MutationExecutor<P, V, E>,
}

impl<P, V, E> Clone for MutationSet<P, V, E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<P, V, E> MutationSet<P, V, E>
where
    P: 'static,
    V: Clone + 'static,
    E: QueryErrorValue,
{
    pub(crate) fn new(client: QueryClient<E>, executor: MutationExecutor<P, V, E>) -> Self {
        Self { client, executor }
    }

    /// A new mutation with its own status.
    pub fn create(&self) -> Mutation<P, V, E> {
        self.create_with_options(MutationOptions::default())
    }

    /// A new mutation with its own status and options.
    pub fn create_with_options(&self, options: MutationOptions<E>) -> Mutation<P, V, E> {
        self.client
            .create_mutation_from_executor(self.executor.clone(), options)
    }
}
