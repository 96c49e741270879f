use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use crate::KeyHash;

/// Retention mode of one map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// The map itself keeps the value alive.
    Strong,
    /// The value lives only as long as something outside the map holds it.
    Weak,
}

enum Slot<T: ?Sized> {
    Strong(Rc<T>),
    Weak(Weak<T>),
}

impl<T: ?Sized> Slot<T> {
    fn upgrade(&self) -> Option<Rc<T>> {
        match self {
            Slot::Strong(value) => Some(value.clone()),
            Slot::Weak(value) => value.upgrade(),
        }
    }

    fn retention(&self) -> Retention {
        match self {
            Slot::Strong(_) => Retention::Strong,
            Slot::Weak(_) => Retention::Weak,
        }
    }
}

/// Stores values by hash, each entry independently strongly or weakly retained.
///
/// Weak entries whose value has been dropped read as absent and are swept on the next insert.
pub(crate) struct AdaptableMap<T: ?Sized> {
    entries: RefCell<HashMap<KeyHash, Slot<T>>>,
}

impl<T: ?Sized> Default for AdaptableMap<T> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
        }
    }
}

impl<T: ?Sized> AdaptableMap<T> {
    pub(crate) fn get(&self, key_hash: &KeyHash) -> Option<Rc<T>> {
        self.entries
            .try_borrow()
            .expect("adaptable map get borrow")
            .get(key_hash)
            .and_then(Slot::upgrade)
    }

    pub(crate) fn has(&self, key_hash: &KeyHash) -> bool {
        self.get(key_hash).is_some()
    }

    /// Inserts weakly. The caller must keep its own strong handle.
    pub(crate) fn set(&self, key_hash: KeyHash, value: &Rc<T>) {
        self.purge();
        self.entries
            .try_borrow_mut()
            .expect("adaptable map set borrow_mut")
            .insert(key_hash, Slot::Weak(Rc::downgrade(value)));
    }

    /// Makes the map an owner of the entry. No-op if the value is gone.
    pub(crate) fn convert_to_strong(&self, key_hash: &KeyHash) {
        let mut entries = self
            .entries
            .try_borrow_mut()
            .expect("convert_to_strong borrow_mut");
        let upgraded = match entries.get(key_hash) {
            Some(Slot::Weak(weak)) => weak.upgrade(),
            _ => return,
        };
        match upgraded {
            Some(value) => {
                entries.insert(key_hash.clone(), Slot::Strong(value));
            }
            None => {
                entries.remove(key_hash);
            }
        }
    }

    /// Releases the map's ownership of the entry.
    pub(crate) fn convert_to_weak(&self, key_hash: &KeyHash) {
        let released = {
            let mut entries = self
                .entries
                .try_borrow_mut()
                .expect("convert_to_weak borrow_mut");
            let weak = match entries.get(key_hash) {
                Some(Slot::Strong(value)) => Rc::downgrade(value),
                _ => return,
            };
            entries.insert(key_hash.clone(), Slot::Weak(weak))
        };
        // Dropped outside the borrow, the value may run arbitrary drop glue.
        drop(released);
    }

    pub(crate) fn retention(&self, key_hash: &KeyHash) -> Option<Retention> {
        let entries = self
            .entries
            .try_borrow()
            .expect("adaptable map retention borrow");
        let slot = entries.get(key_hash)?;
        slot.upgrade().map(|_| slot.retention())
    }

    /// Hashes of every live entry.
    pub(crate) fn hashes(&self) -> Vec<KeyHash> {
        self.entries
            .try_borrow()
            .expect("adaptable map hashes borrow")
            .iter()
            .filter(|(_, slot)| slot.upgrade().is_some())
            .map(|(key_hash, _)| key_hash.clone())
            .collect()
    }

    /// Drops weak entries whose value is gone. Returns the removed hashes.
    pub(crate) fn purge(&self) -> Vec<KeyHash> {
        let mut entries = self
            .entries
            .try_borrow_mut()
            .expect("adaptable map purge borrow_mut");
        let dead = entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Weak(weak) if weak.strong_count() == 0))
            .map(|(key_hash, _)| key_hash.clone())
            .collect::<Vec<_>>();
        for key_hash in dead.iter() {
            entries.remove(key_hash);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(s: &str) -> KeyHash {
        KeyHash(s.to_string())
    }

    #[test]
    fn weak_entries_follow_external_owners() {
        let map = AdaptableMap::<String>::default();
        let value = Rc::new("a".to_string());
        map.set(hash("a"), &value);

        assert!(map.has(&hash("a")));
        assert_eq!(map.retention(&hash("a")), Some(Retention::Weak));

        drop(value);
        assert!(!map.has(&hash("a")));
        assert_eq!(map.retention(&hash("a")), None);
        assert_eq!(map.purge(), vec![hash("a")]);
    }

    #[test]
    fn strong_entries_outlive_external_owners() {
        let map = AdaptableMap::<String>::default();
        let value = Rc::new("a".to_string());
        map.set(hash("a"), &value);
        map.convert_to_strong(&hash("a"));
        drop(value);

        assert_eq!(map.get(&hash("a")).as_deref(), Some(&"a".to_string()));
        assert_eq!(map.retention(&hash("a")), Some(Retention::Strong));
        assert!(map.purge().is_empty());
    }

    #[test]
    fn demoted_entries_become_collectable() {
        let map = AdaptableMap::<String>::default();
        let value = Rc::new("a".to_string());
        map.set(hash("a"), &value);
        map.convert_to_strong(&hash("a"));
        drop(value);

        map.convert_to_weak(&hash("a"));
        assert!(!map.has(&hash("a")));
        assert!(map.hashes().is_empty());
    }

    #[test]
    fn demoted_entries_survive_while_held() {
        let map = AdaptableMap::<String>::default();
        let value = Rc::new("a".to_string());
        map.set(hash("a"), &value);
        map.convert_to_strong(&hash("a"));
        map.convert_to_weak(&hash("a"));

        assert!(map.has(&hash("a")));
        assert_eq!(map.retention(&hash("a")), Some(Retention::Weak));
    }

    #[test]
    fn set_sweeps_dead_entries() {
        let map = AdaptableMap::<String>::default();
        let dead = Rc::new("dead".to_string());
        map.set(hash("dead"), &dead);
        drop(dead);

        let alive = Rc::new("alive".to_string());
        map.set(hash("alive"), &alive);

        assert_eq!(map.hashes(), vec![hash("alive")]);
        assert!(map.purge().is_empty());
    }
}
