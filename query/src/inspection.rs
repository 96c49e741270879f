use std::rc::Rc;

use serde_json::Value;

use crate::{CacheKey, CachedQuery, KeyHash, QueryKind, QueryStatus, Retention};

/// A live query as seen by external tooling.
///
/// Reading an inspected query never triggers a fetch or changes retention.
#[derive(Clone)]
pub struct InspectedQuery<E: 'static> {
    /// Hash of the full instance key.
    pub key_hash: KeyHash,
    /// The full instance key, root segments plus the configuration descriptor.
    pub key: CacheKey,
    /// Whether the client currently keeps the query alive on its own.
    pub retention: Retention,
    /// The live instance.
    pub query: Rc<dyn CachedQuery<E>>,
}

impl<E: 'static> InspectedQuery<E> {
    /// Which container this is.
    pub fn kind(&self) -> QueryKind {
        self.query.kind()
    }

    /// Untracked foreground status.
    pub fn statuses(&self) -> QueryStatus<E> {
        self.query.statuses()
    }

    /// JSON snapshot of the data cell.
    pub fn data(&self) -> Option<Value> {
        self.query.data_snapshot()
    }

    /// Untracked.
    pub fn is_invalid(&self) -> bool {
        self.query.is_invalid()
    }
}

impl<E: 'static> std::fmt::Debug for InspectedQuery<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectedQuery")
            .field("key_hash", &self.key_hash)
            .field("kind", &self.query.kind())
            .field("retention", &self.retention)
            .finish()
    }
}
