use std::{marker::PhantomData, rc::Rc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::SyncError,
    polling::PollingService,
    storage::{StorageFactory, SyncableStorage},
    util::spawn_local,
    BroadcastChannel, KeyHash, Keys, QueryErrorValue, StatusStorage,
};

/// Cross-tab wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncMessage {
    data_key_hash: String,
    status_key_hash: String,
    query_key_hash: String,
    data: Value,
    statuses: Value,
}

/// Mirrors data and status cells to other tabs, best effort.
///
/// Without a channel every operation is a no-op.
pub(crate) struct SynchronizationService<E> {
    channel: Option<Rc<dyn BroadcastChannel>>,
    data: StorageFactory,
    statuses: StorageFactory,
    _error: PhantomData<E>,
}

impl<E> SynchronizationService<E>
where
    E: QueryErrorValue,
{
    pub(crate) fn new(
        channel: Option<Rc<dyn BroadcastChannel>>,
        data: StorageFactory,
        statuses: StorageFactory,
        polling: PollingService,
    ) -> Self {
        if let Some(channel) = channel.as_ref() {
            let data = data.clone();
            let statuses = statuses.clone();
            channel.subscribe(Rc::new(move |message: &str| {
                if let Err(error) = receive(message, &data, &statuses, &polling) {
                    leptos::logging::warn!("Dropped cache update from another tab: {}", error);
                }
            }));
        }

        Self {
            channel,
            data,
            statuses,
            _error: PhantomData,
        }
    }

    /// Broadcasts the cells of `keys` once their status settles.
    ///
    /// Background queries refresh behind their background cell, so that one is awaited too.
    pub(crate) fn emit(&self, keys: &Keys) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        let status = self
            .statuses
            .get_storage::<StatusStorage<E>>(&keys.status_key_hash);
        let background = self
            .statuses
            .find(&keys.background_status_key_hash)
            .and_then(|storage| storage.as_any().downcast_ref::<StatusStorage<E>>().cloned());
        let data = self.data.clone();
        let keys = keys.clone();
        spawn_local(async move {
            status.settled().await;
            if let Some(background) = background {
                background.settled().await;
            }
            match encode(&keys, &data, &status) {
                Ok(message) => channel.post_message(&message),
                Err(error) => {
                    leptos::logging::warn!("Failed to encode cache update: {}", error);
                }
            }
        });
    }
}

fn encode<E: QueryErrorValue>(
    keys: &Keys,
    data: &StorageFactory,
    status: &StatusStorage<E>,
) -> Result<String, SyncError> {
    let data = match data.find(&keys.data_key_hash) {
        Some(storage) => storage.snapshot()?,
        None => Value::Null,
    };
    let message = SyncMessage {
        data_key_hash: keys.data_key_hash.to_string(),
        status_key_hash: keys.status_key_hash.to_string(),
        query_key_hash: keys.query_key_hash.to_string(),
        data,
        statuses: status.snapshot()?,
    };
    Ok(serde_json::to_string(&message)?)
}

fn receive(
    message: &str,
    data: &StorageFactory,
    statuses: &StorageFactory,
    polling: &PollingService,
) -> Result<(), SyncError> {
    let message = serde_json::from_str::<SyncMessage>(message)?;

    // Only cells this tab already uses are updated.
    if let Some(storage) = data.find(&KeyHash(message.data_key_hash)) {
        storage.restore(message.data)?;
    }
    if let Some(storage) = statuses.find(&KeyHash(message.status_key_hash)) {
        storage.restore(message.statuses)?;
    }
    polling.restart(&KeyHash(message.query_key_hash));
    Ok(())
}
