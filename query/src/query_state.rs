use serde::{Deserialize, Serialize};

/// Status flags of a query or mutation, shared by status-key hash.
///
/// Serialized field names follow the cross-tab wire format
/// (`isLoading`, `isError`, `error`, `isSuccess`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatus<E> {
    /// A request is in flight.
    pub is_loading: bool,
    /// The last request failed.
    pub is_error: bool,
    /// The error of the last failed request. Missing on the wire means `None`.
    pub error: Option<E>,
    /// The last request succeeded.
    pub is_success: bool,
}

impl<E> Default for QueryStatus<E> {
    fn default() -> Self {
        Self {
            is_loading: false,
            is_error: false,
            error: None,
            is_success: false,
        }
    }
}

impl<E> QueryStatus<E> {
    pub(crate) fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }

    pub(crate) fn success() -> Self {
        Self {
            is_success: true,
            ..Self::default()
        }
    }

    pub(crate) fn failure(error: E) -> Self {
        Self {
            is_error: true,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Collapses the flags into a lifecycle state.
    pub fn state(&self) -> QueryState {
        if self.is_loading {
            QueryState::Loading
        } else if self.is_error {
            QueryState::Error
        } else if self.is_success {
            QueryState::Success
        } else {
            QueryState::Idle
        }
    }
}

impl<E> std::fmt::Debug for QueryStatus<E>
where
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStatus")
            .field("is_loading", &self.is_loading)
            .field("is_error", &self.is_error)
            .field("error", &self.error)
            .field("is_success", &self.is_success)
            .finish()
    }
}

/// The lifecycle of a query.
///
/// Invalidation is not a state of its own: it overlays any state and forces the next
/// access back into [`Loading`](QueryState::Loading).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryState {
    /// The initial state of a Query upon its creation.
    ///
    /// No request has been issued yet.
    #[default]
    Idle,

    /// A request is in flight.
    ///
    /// Previously loaded data, if any, stays readable while loading.
    Loading,

    /// The last request completed successfully.
    Success,

    /// The last request failed. The error is available on the status cell.
    Error,
}
