#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Query Cache
//!
//! Leptos Query Cache is a keyed, client side cache for asynchronous reads and writes,
//! built on [Leptos](https://github.com/leptos-rs/leptos) signals.
//!
//! A [`QueryClient`] provides:
//! - caching by caller supplied keys
//! - de-duplication of concurrent requests
//! - weak retention of unused or invalidated queries
//! - invalidation by key segments (partial or chain match)
//! - background refreshing
//! - polling that pauses while the page is hidden
//! - paginated (infinite) queries
//! - cross-tab synchronization
//!
//! ## The main entry points are:
//! - [`QueryClient::create_query`] - A cached read.
//! - [`QueryClient::create_infinite_query`] - A cached read accumulating pages.
//! - [`QueryClient::create_mutation`] - An uncached write with its own status.
//! - [`QueryClient::create_query_set`] - A family of queries keyed by parameters.
//!
//! # Feature Flags
//! - `csr` Client-side rendering: browser timers, `BroadcastChannel` and document visibility.
//!
//! Without `csr` the crate runs on a tokio current-thread runtime inside a
//! [`LocalSet`](tokio::task::LocalSet).
//!
//! # A Simple Example
//!
//! ```
//! use futures::FutureExt;
//! use leptos_query_cache::*;
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Track {
//!     name: String,
//! }
//!
//! async fn get_track(id: u32) -> Result<Track, String> {
//!     Ok(Track { name: format!("track {id}") })
//! }
//!
//! # let _ = leptos::create_runtime();
//! let client = QueryClient::<String>::new(ClientOptions::default());
//!
//! let tracks = client.create_query_set(|id: &u32| {
//!     let id = *id;
//!     QuerySetEntry::new(move || get_track(id).boxed_local())
//! });
//!
//! let track = tracks.create(&1);
//! // Read inside a reactive scope, refetches once invalidated.
//! let _ = track.data();
//!
//! // Every query of the set refetches on next read.
//! tracks.invalidate_all();
//! ```

mod adaptable_map;
mod auxiliary_query;
mod broadcast;
mod cache_key;
mod cached_query;
mod error;
mod infinite_query;
mod inspection;
mod instant;
mod mutation;
mod polling;
mod query;
mod query_client;
mod query_options;
mod query_set;
mod query_state;
mod storage;
mod synchronization;
mod util;
mod visibility;

pub use adaptable_map::Retention;
pub use broadcast::*;
pub use cache_key::*;
pub use cached_query::{CachedQuery, QueryContainer, SyncParams};
pub use error::SyncError;
pub use infinite_query::*;
pub use inspection::*;
pub use instant::*;
pub use mutation::*;
pub use query::*;
pub use query_client::*;
pub use query_options::*;
pub use query_set::*;
pub use query_state::*;
pub use storage::{DataStorage, StatusStorage};
pub use visibility::*;

#[doc(hidden)]
pub use serde_json as __serde_json;

/// Convenience trait for query value requirements.
pub trait QueryValue:
    std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}
impl<V> QueryValue for V where
    V: std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

/// Convenience trait for the error type shared by a client's executors.
pub trait QueryErrorValue:
    std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}
impl<E> QueryErrorValue for E where
    E: std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

/// Builds a [`CacheKey`] from heterogeneous segments.
///
/// Each segment is a JSON literal as accepted by `serde_json::json!`.
///
/// ```
/// use leptos_query_cache::*;
///
/// let key = cache_key!["users", 1, { "active": true }];
/// assert_eq!(key.hash().as_str(), r#"["users",1,{"active":true}]"#);
/// ```
#[macro_export]
macro_rules! cache_key {
    ($($segment:tt),* $(,)?) => {
        $crate::CacheKey(vec![$($crate::__serde_json::json!($segment)),*])
    };
}
