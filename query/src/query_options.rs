use std::{rc::Rc, time::Duration};

use serde::{Deserialize, Serialize};

/// Default error handler, used when a call does not provide its own.
pub type OnError<E> = Rc<dyn Fn(&E)>;

/// How a query treats a previous successful result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve the cached success, only refetch after invalidation.
    #[default]
    CacheFirst,
    /// Refetch on every sync. The instance is never strongly retained.
    NetworkOnly,
}

/// How invalidation keys are matched against tracked query keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidateStrategy {
    /// Any segment of the invalidation keys appears in the query key.
    #[default]
    PartialMatch,
    /// Every segment of the invalidation keys appears in the query key.
    ChainMatch,
}

/// Default options for all queries under a client.
pub struct ClientOptions<E> {
    /// Default fetch policy.
    pub fetch_policy: FetchPolicy,
    /// Default error handler.
    pub on_error: Option<OnError<E>>,
    /// Fetch automatically on the first read of `data`.
    pub enabled_auto_fetch: bool,
    /// Mirror successful fetches to other tabs.
    pub enabled_synchronization: bool,
    /// Window within which repeated creation of the same network-only query returns the
    /// same instance. Zero disables the sharing.
    pub network_only_window: Duration,
}

const DEFAULT_NETWORK_ONLY_WINDOW: Duration = Duration::from_secs(1);

impl<E> Default for ClientOptions<E> {
    fn default() -> Self {
        Self {
            fetch_policy: FetchPolicy::default(),
            on_error: None,
            enabled_auto_fetch: false,
            enabled_synchronization: false,
            network_only_window: DEFAULT_NETWORK_ONLY_WINDOW,
        }
    }
}

impl<E> Clone for ClientOptions<E> {
    fn clone(&self) -> Self {
        Self {
            fetch_policy: self.fetch_policy,
            on_error: self.on_error.clone(),
            enabled_auto_fetch: self.enabled_auto_fetch,
            enabled_synchronization: self.enabled_synchronization,
            network_only_window: self.network_only_window,
        }
    }
}

impl<E> std::fmt::Debug for ClientOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("fetch_policy", &self.fetch_policy)
            .field("on_error", &self.on_error.is_some())
            .field("enabled_auto_fetch", &self.enabled_auto_fetch)
            .field("enabled_synchronization", &self.enabled_synchronization)
            .field("network_only_window", &self.network_only_window)
            .finish()
    }
}

impl<E> ClientOptions<E> {
    /// Set the default fetch policy.
    pub fn set_fetch_policy(self, fetch_policy: FetchPolicy) -> Self {
        Self {
            fetch_policy,
            ..self
        }
    }

    /// Set the default error handler.
    pub fn set_on_error(self, on_error: impl Fn(&E) + 'static) -> Self {
        Self {
            on_error: Some(Rc::new(on_error)),
            ..self
        }
    }

    /// Set auto fetch on first read.
    pub fn set_enabled_auto_fetch(self, enabled_auto_fetch: bool) -> Self {
        Self {
            enabled_auto_fetch,
            ..self
        }
    }

    /// Set cross-tab synchronization.
    pub fn set_enabled_synchronization(self, enabled_synchronization: bool) -> Self {
        Self {
            enabled_synchronization,
            ..self
        }
    }

    /// Set the network-only creation window.
    pub fn set_network_only_window(self, network_only_window: Duration) -> Self {
        Self {
            network_only_window,
            ..self
        }
    }
}

/**
 * Options for a single query creation call.
 *
 * Unset fields fall back to the client's [`ClientOptions`].
 */
pub struct QueryOptions<E> {
    /// Fetch policy of this query.
    pub fetch_policy: Option<FetchPolicy>,
    /// Fetch automatically on the first read of `data`.
    pub enabled_auto_fetch: Option<bool>,
    /// Mirror successful fetches to other tabs.
    pub enabled_synchronization: Option<bool>,
    /// Invalidate the query this long after each successful fetch.
    pub polling_time: Option<Duration>,
    /// Refresh behind a separate status cell once data was loaded.
    pub is_background: bool,
    /// Error handler of this query.
    pub on_error: Option<OnError<E>>,
    /// Page size of an infinite query.
    pub increment_count: Option<usize>,
}

impl<E> Default for QueryOptions<E> {
    fn default() -> Self {
        Self {
            fetch_policy: None,
            enabled_auto_fetch: None,
            enabled_synchronization: None,
            polling_time: None,
            is_background: false,
            on_error: None,
            increment_count: None,
        }
    }
}

impl<E> Clone for QueryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            fetch_policy: self.fetch_policy,
            enabled_auto_fetch: self.enabled_auto_fetch,
            enabled_synchronization: self.enabled_synchronization,
            polling_time: self.polling_time,
            is_background: self.is_background,
            on_error: self.on_error.clone(),
            increment_count: self.increment_count,
        }
    }
}

impl<E> std::fmt::Debug for QueryOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("fetch_policy", &self.fetch_policy)
            .field("enabled_auto_fetch", &self.enabled_auto_fetch)
            .field("enabled_synchronization", &self.enabled_synchronization)
            .field("polling_time", &self.polling_time)
            .field("is_background", &self.is_background)
            .field("on_error", &self.on_error.is_some())
            .field("increment_count", &self.increment_count)
            .finish()
    }
}

impl<E> QueryOptions<E> {
    /// Set the fetch policy.
    pub fn set_fetch_policy(self, fetch_policy: FetchPolicy) -> Self {
        Self {
            fetch_policy: Some(fetch_policy),
            ..self
        }
    }

    /// Set auto fetch on first read.
    pub fn set_enabled_auto_fetch(self, enabled_auto_fetch: bool) -> Self {
        Self {
            enabled_auto_fetch: Some(enabled_auto_fetch),
            ..self
        }
    }

    /// Set cross-tab synchronization.
    pub fn set_enabled_synchronization(self, enabled_synchronization: bool) -> Self {
        Self {
            enabled_synchronization: Some(enabled_synchronization),
            ..self
        }
    }

    /// Set the polling time.
    pub fn set_polling_time(self, polling_time: Duration) -> Self {
        Self {
            polling_time: Some(polling_time),
            ..self
        }
    }

    /// Set background mode.
    pub fn set_is_background(self, is_background: bool) -> Self {
        Self {
            is_background,
            ..self
        }
    }

    /// Set the error handler.
    pub fn set_on_error(self, on_error: impl Fn(&E) + 'static) -> Self {
        Self {
            on_error: Some(Rc::new(on_error)),
            ..self
        }
    }

    /// Set the page size of an infinite query.
    pub fn set_increment_count(self, increment_count: usize) -> Self {
        Self {
            increment_count: Some(increment_count),
            ..self
        }
    }

    pub(crate) fn resolve(&self, defaults: &ClientOptions<E>) -> ResolvedOptions<E> {
        ResolvedOptions {
            fetch_policy: self.fetch_policy.unwrap_or(defaults.fetch_policy),
            enabled_auto_fetch: self
                .enabled_auto_fetch
                .unwrap_or(defaults.enabled_auto_fetch),
            enabled_synchronization: self
                .enabled_synchronization
                .unwrap_or(defaults.enabled_synchronization),
            polling_time: self.polling_time.filter(|time| !time.is_zero()),
            is_background: self.is_background,
            on_error: self.on_error.clone().or_else(|| defaults.on_error.clone()),
            increment_count: match self.increment_count {
                Some(0) => {
                    leptos::logging::debug_warn!(
                        "increment_count of 0 would never reach the end. Using {} instead.",
                        DEFAULT_INCREMENT_COUNT
                    );
                    DEFAULT_INCREMENT_COUNT
                }
                Some(count) => count,
                None => DEFAULT_INCREMENT_COUNT,
            },
        }
    }
}

pub(crate) const DEFAULT_INCREMENT_COUNT: usize = 30;

/// Per-query options after client defaults were applied.
pub(crate) struct ResolvedOptions<E> {
    pub(crate) fetch_policy: FetchPolicy,
    pub(crate) enabled_auto_fetch: bool,
    pub(crate) enabled_synchronization: bool,
    pub(crate) polling_time: Option<Duration>,
    pub(crate) is_background: bool,
    pub(crate) on_error: Option<OnError<E>>,
    pub(crate) increment_count: usize,
}

/// Options for a mutation.
pub struct MutationOptions<E> {
    /// Error handler used when a call does not provide its own.
    pub on_error: Option<OnError<E>>,
}

impl<E> Default for MutationOptions<E> {
    fn default() -> Self {
        Self { on_error: None }
    }
}

impl<E> Clone for MutationOptions<E> {
    fn clone(&self) -> Self {
        Self {
            on_error: self.on_error.clone(),
        }
    }
}

impl<E> MutationOptions<E> {
    /// Set the error handler.
    pub fn set_on_error(self, on_error: impl Fn(&E) + 'static) -> Self {
        Self {
            on_error: Some(Rc::new(on_error)),
        }
    }
}

/// Options for a query, infinite query or mutation set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySetConfig {
    /// Explicit base key. Defaults to a hash of the configurator type.
    pub name: Option<String>,
}

impl QuerySetConfig {
    /// Set the base key.
    pub fn set_name(self, name: impl Into<String>) -> Self {
        QuerySetConfig {
            name: Some(name.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn unset_fields_fall_back_to_client() {
        let _ = leptos::create_runtime();
        let defaults = ClientOptions::<String>::default()
            .set_fetch_policy(FetchPolicy::NetworkOnly)
            .set_enabled_auto_fetch(true)
            .set_on_error(|_| {});

        let resolved = QueryOptions::<String>::default().resolve(&defaults);
        assert_eq!(resolved.fetch_policy, FetchPolicy::NetworkOnly);
        assert!(resolved.enabled_auto_fetch);
        assert!(!resolved.enabled_synchronization);
        assert!(resolved.on_error.is_some());
        assert_eq!(resolved.increment_count, DEFAULT_INCREMENT_COUNT);
        assert_eq!(resolved.polling_time, None);
    }

    #[test]
    fn query_options_override_client() {
        let _ = leptos::create_runtime();
        let client_calls = Rc::new(Cell::new(0));
        let query_calls = Rc::new(Cell::new(0));
        let defaults = ClientOptions::<String>::default().set_on_error({
            let client_calls = client_calls.clone();
            move |_| client_calls.set(client_calls.get() + 1)
        });

        let resolved = QueryOptions::<String>::default()
            .set_fetch_policy(FetchPolicy::CacheFirst)
            .set_enabled_auto_fetch(false)
            .set_polling_time(Duration::from_millis(250))
            .set_increment_count(2)
            .set_on_error({
                let query_calls = query_calls.clone();
                move |_| query_calls.set(query_calls.get() + 1)
            })
            .resolve(&defaults);

        (resolved.on_error.unwrap())(&"boom".to_string());
        assert_eq!(query_calls.get(), 1);
        assert_eq!(client_calls.get(), 0);
        assert_eq!(resolved.polling_time, Some(Duration::from_millis(250)));
        assert_eq!(resolved.increment_count, 2);
    }

    #[test]
    fn zero_values_are_normalized() {
        let _ = leptos::create_runtime();
        let resolved = QueryOptions::<String>::default()
            .set_polling_time(Duration::ZERO)
            .set_increment_count(0)
            .resolve(&ClientOptions::default());

        assert_eq!(resolved.polling_time, None);
        assert_eq!(resolved.increment_count, DEFAULT_INCREMENT_COUNT);
    }

    #[test]
    fn fetch_policy_wire_names() {
        assert_eq!(
            serde_json::to_value(FetchPolicy::CacheFirst).unwrap(),
            serde_json::json!("cache-first")
        );
        assert_eq!(
            serde_json::to_value(FetchPolicy::NetworkOnly).unwrap(),
            serde_json::json!("network-only")
        );
    }
}
