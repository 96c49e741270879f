use std::{
    any::Any,
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    rc::Rc,
};

use futures_channel::oneshot;
use leptos::*;
use serde_json::Value;

use crate::{KeyHash, QueryErrorValue, QueryStatus, QueryValue};

/// A reactive cell that can be mirrored across tabs.
///
/// Object safe so factories can hold cells of different value types and the
/// synchronization service can reach them by hash alone.
pub(crate) trait SyncableStorage {
    fn as_any(&self) -> &dyn Any;
    fn snapshot(&self) -> Result<Value, serde_json::Error>;
    fn restore(&self, value: Value) -> Result<(), serde_json::Error>;
}

/// Reactive data cell, shared by data-key hash.
#[derive(Clone)]
pub struct DataStorage<V: 'static> {
    data: RwSignal<Option<V>>,
}

impl<V: QueryValue> Default for DataStorage<V> {
    fn default() -> Self {
        Self {
            data: RwSignal::new(None),
        }
    }
}

impl<V: QueryValue> DataStorage<V> {
    /// Current value. Tracked.
    pub fn data(&self) -> Option<V> {
        self.data.get()
    }

    /// Current value without subscribing.
    pub fn data_untracked(&self) -> Option<V> {
        self.data.get_untracked()
    }

    /// Reads the current value by reference. Tracked.
    pub fn with<T>(&self, func: impl FnOnce(Option<&V>) -> T) -> T {
        self.data.with(|data| func(data.as_ref()))
    }

    pub(crate) fn with_untracked<T>(&self, func: impl FnOnce(Option<&V>) -> T) -> T {
        self.data.with_untracked(|data| func(data.as_ref()))
    }

    /// Replaces the value.
    pub fn set_data(&self, data: V) {
        self.data.set(Some(data));
    }

    /// Computes the next value from the current one.
    pub fn update_data(&self, updater: impl FnOnce(Option<V>) -> V) {
        self.data.update(|data| {
            let next = updater(data.take());
            *data = Some(next);
        });
    }

    /// Mutates the value in place if present. Returns whether it was present.
    ///
    /// An empty cell is left untouched and does not notify subscribers.
    pub(crate) fn update_existing(&self, updater: impl FnOnce(&mut V)) -> bool {
        if !self.data.with_untracked(Option::is_some) {
            return false;
        }
        self.data.update(|data| {
            if let Some(data) = data.as_mut() {
                updater(data);
            }
        });
        true
    }

    /// Drops the value. Does not notify if the cell is already empty.
    pub fn clean_data(&self) {
        if self.data.with_untracked(Option::is_some) {
            self.data.set(None);
        }
    }
}

impl<V: QueryValue> SyncableStorage for DataStorage<V> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn snapshot(&self) -> Result<Value, serde_json::Error> {
        self.data.with_untracked(|data| serde_json::to_value(data))
    }

    fn restore(&self, value: Value) -> Result<(), serde_json::Error> {
        let data = serde_json::from_value::<Option<V>>(value)?;
        self.data.set(data);
        Ok(())
    }
}

/// Reactive status cell, shared by status-key hash.
pub struct StatusStorage<E: 'static> {
    statuses: RwSignal<QueryStatus<E>>,
    waiters: Rc<RefCell<Vec<oneshot::Sender<()>>>>,
}

impl<E: 'static> Clone for StatusStorage<E> {
    fn clone(&self) -> Self {
        Self {
            statuses: self.statuses,
            waiters: self.waiters.clone(),
        }
    }
}

impl<E: QueryErrorValue> Default for StatusStorage<E> {
    fn default() -> Self {
        Self {
            statuses: RwSignal::new(QueryStatus::default()),
            waiters: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<E: QueryErrorValue> StatusStorage<E> {
    /// Current flags. Tracked.
    pub fn statuses(&self) -> QueryStatus<E> {
        self.statuses.get()
    }

    /// Current flags without subscribing.
    pub fn statuses_untracked(&self) -> QueryStatus<E> {
        self.statuses.get_untracked()
    }

    /// Tracked.
    pub fn is_loading(&self) -> bool {
        self.statuses.with(|s| s.is_loading)
    }

    /// Tracked.
    pub fn is_success(&self) -> bool {
        self.statuses.with(|s| s.is_success)
    }

    /// Tracked.
    pub fn is_error(&self) -> bool {
        self.statuses.with(|s| s.is_error)
    }

    /// Tracked.
    pub fn error(&self) -> Option<E> {
        self.statuses.with(|s| s.error.clone())
    }

    pub(crate) fn is_loading_untracked(&self) -> bool {
        self.statuses.with_untracked(|s| s.is_loading)
    }

    pub(crate) fn is_success_untracked(&self) -> bool {
        self.statuses.with_untracked(|s| s.is_success)
    }

    /// Overwrites every flag at once.
    pub fn set_statuses(&self, statuses: QueryStatus<E>) {
        let settled = !statuses.is_loading;
        self.statuses.set(statuses);
        if settled {
            self.wake_waiters();
        }
    }

    /// Resolves once the cell is no longer loading.
    pub async fn settled(&self) {
        loop {
            if !self.is_loading_untracked() {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            self.waiters
                .try_borrow_mut()
                .expect("settled borrow_mut")
                .push(sender);
            // A dropped sender means the cell went away, nothing left to wait for.
            if receiver.await.is_err() {
                return;
            }
        }
    }

    fn wake_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

impl<E: QueryErrorValue> SyncableStorage for StatusStorage<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn snapshot(&self) -> Result<Value, serde_json::Error> {
        self.statuses.with_untracked(|statuses| serde_json::to_value(statuses))
    }

    fn restore(&self, value: Value) -> Result<(), serde_json::Error> {
        let statuses = serde_json::from_value::<QueryStatus<E>>(value)?;
        self.set_statuses(statuses);
        Ok(())
    }
}

/// Lazily creates one cell per key hash and hands out the same cell on every lookup.
#[derive(Clone, Default)]
pub(crate) struct StorageFactory {
    storages: Rc<RefCell<HashMap<KeyHash, Rc<dyn SyncableStorage>>>>,
}

impl StorageFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_storage<S>(&self, key_hash: &KeyHash) -> S
    where
        S: SyncableStorage + Default + Clone + 'static,
    {
        let mut storages = self
            .storages
            .try_borrow_mut()
            .expect("get_storage borrow_mut");

        match storages.entry(key_hash.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(storage) = entry.get().as_any().downcast_ref::<S>() {
                    return storage.clone();
                }
                logging::debug_warn!(
                    "Storage type mismatch for key {}. Replacing the cell.",
                    key_hash
                );
                let storage = S::default();
                entry.insert(Rc::new(storage.clone()));
                storage
            }
            Entry::Vacant(entry) => {
                let storage = S::default();
                entry.insert(Rc::new(storage.clone()));
                storage
            }
        }
    }

    /// Finds an existing cell without creating one.
    pub(crate) fn find(&self, key_hash: &KeyHash) -> Option<Rc<dyn SyncableStorage>> {
        self.storages
            .try_borrow()
            .expect("find borrow")
            .get(key_hash)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.storages.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::settle;

    fn hash(s: &str) -> KeyHash {
        KeyHash(s.to_string())
    }

    #[test]
    fn factory_shares_cells_by_hash() {
        let _ = create_runtime();
        let factory = StorageFactory::new();

        let a = factory.get_storage::<DataStorage<u32>>(&hash("a"));
        let a_again = factory.get_storage::<DataStorage<u32>>(&hash("a"));
        let b = factory.get_storage::<DataStorage<u32>>(&hash("b"));

        a.set_data(7);
        assert_eq!(a_again.data_untracked(), Some(7));
        assert_eq!(b.data_untracked(), None);
        assert_eq!(factory.len(), 2);
    }

    #[test]
    fn factory_replaces_mismatched_cell() {
        let _ = create_runtime();
        let factory = StorageFactory::new();

        let numbers = factory.get_storage::<DataStorage<u32>>(&hash("a"));
        numbers.set_data(1);
        let strings = factory.get_storage::<DataStorage<String>>(&hash("a"));

        assert_eq!(strings.data_untracked(), None);
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn data_update_and_clean() {
        let _ = create_runtime();
        let storage = DataStorage::<Vec<u32>>::default();

        assert!(!storage.update_existing(|data| data.push(1)));
        storage.update_data(|current| {
            assert!(current.is_none());
            vec![1]
        });
        assert!(storage.update_existing(|data| data.push(2)));
        assert_eq!(storage.data_untracked(), Some(vec![1, 2]));

        storage.clean_data();
        assert_eq!(storage.data_untracked(), None);
    }

    #[test]
    fn snapshot_and_restore() {
        let _ = create_runtime();
        let source = DataStorage::<Vec<String>>::default();
        let target = DataStorage::<Vec<String>>::default();
        source.set_data(vec!["a".into()]);

        target.restore(source.snapshot().unwrap()).unwrap();
        assert_eq!(target.data_untracked(), Some(vec!["a".to_string()]));

        assert!(target.restore(serde_json::json!({"not": "a list"})).is_err());
        assert_eq!(target.data_untracked(), Some(vec!["a".to_string()]));

        let statuses = StatusStorage::<String>::default();
        statuses
            .restore(serde_json::json!({
                "isLoading": false,
                "isError": true,
                "error": "offline",
                "isSuccess": false,
            }))
            .unwrap();
        assert_eq!(statuses.error(), Some("offline".to_string()));
    }

    #[test]
    fn effects_track_cells() {
        let _ = create_runtime();
        let storage = DataStorage::<u32>::default();
        let runs = Rc::new(std::cell::Cell::new(0));

        create_isomorphic_effect({
            let storage = storage.clone();
            let runs = runs.clone();
            move |_| {
                storage.data();
                runs.set(runs.get() + 1);
            }
        });

        storage.set_data(1);
        storage.set_data(2);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn empty_cell_writes_do_not_notify() {
        let _ = create_runtime();
        let storage = DataStorage::<Vec<u32>>::default();
        let runs = Rc::new(std::cell::Cell::new(0));

        create_isomorphic_effect({
            let storage = storage.clone();
            let runs = runs.clone();
            move |_| {
                storage.data();
                runs.set(runs.get() + 1);
            }
        });

        storage.clean_data();
        assert!(!storage.update_existing(|data| data.push(1)));
        assert_eq!(runs.get(), 1);

        storage.set_data(vec![1]);
        storage.clean_data();
        storage.clean_data();
        assert_eq!(runs.get(), 3);
    }

    #[tokio::test]
    async fn settled_waits_for_loading_to_end() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let status = StatusStorage::<String>::default();
                status.set_statuses(QueryStatus::loading());

                let done = Rc::new(std::cell::Cell::new(false));
                crate::util::spawn_local({
                    let status = status.clone();
                    let done = done.clone();
                    async move {
                        status.settled().await;
                        done.set(true);
                    }
                });

                settle().await;
                assert!(!done.get());

                status.set_statuses(QueryStatus::success());
                settle().await;
                assert!(done.get());
            })
            .await;
    }
}
