/// Failures of the cross-tab synchronization wire. Logged, never surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A message or a cell snapshot could not be encoded or decoded.
    #[error("malformed sync payload: {0}")]
    Payload(#[from] serde_json::Error),
}
