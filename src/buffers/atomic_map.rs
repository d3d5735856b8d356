use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// A copy-on-write map behind an atomic pointer: reads are lock-free snapshots, updates
///  clone the map and swap it in with a CAS loop.
///
/// This fits registries that are read often and updated rarely - here, the set of live
///  child channels of a server, appended to by the accept/receive loop and shrunk
///  concurrently when a child closes itself.
pub struct AtomicMap<K, V> {
    map: AtomicPtr<Arc<FxHashMap<K, V>>>,
}
impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        let map = Arc::new(FxHashMap::<K, V>::default());
        let raw = Box::into_raw(Box::new(map));

        AtomicMap {
            map: AtomicPtr::new(raw),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        unsafe {
            (*self.map.load(Ordering::Acquire))
                .get(key)
                .cloned()
        }
    }

    /// a point-in-time snapshot of the whole map, for iteration
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        unsafe {
            (*self.map.load(Ordering::Acquire)).clone()
        }
    }

    pub fn len(&self) -> usize {
        unsafe {
            (*self.map.load(Ordering::Acquire)).len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            let mut map: FxHashMap<K, V> = unsafe { (**old).clone() };
            f(&mut map);
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self.map.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => {
                    unsafe { drop(Box::from_raw(prev)); }
                    return;
                }
                Err(_) => {
                    unsafe { drop(Box::from_raw(new)); }
                }
            }
        }
    }
}

impl<K, V> Drop for AtomicMap<K, V> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.map.load(Ordering::Acquire);
            drop(Box::from_raw(raw));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(1, map.len());

        map.update(|m| {
            m.remove(&1);
        });
        assert_eq!(None, map.get(&1));
        assert!(map.is_empty());
    }

    #[test]
    fn test_load_snapshot() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| {
            m.insert(1, 2);
            m.insert(3, 4);
        });

        let snapshot = map.load();
        map.update(|m| {
            m.remove(&1);
        });

        assert_eq!(snapshot.len(), 2);
        assert_eq!(map.len(), 1);
    }
}
