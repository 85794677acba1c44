use std::{
    hash::Hash,
    sync::{Arc, Weak},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

/// A keyed factory holding its values weakly.
///
/// The first access for a key synthesizes the value; while any caller still
/// holds the returned `Arc`, later accesses return the same value. Once
/// every outside holder is gone the slot is dead, the table drops it on a
/// later access, and the key gets a fresh value next time it is asked for.
///
/// Per-identity primitives get exactly this lifetime: they persist across
/// overlapping requests for the same identity, and one-off identities cost
/// nothing once their last request completes.
///
/// # Test
///
/// ```
/// use std::sync::Arc;
/// use firewall::keyed::WeakTable;
///
/// let table: WeakTable<String, u64> = WeakTable::new(|_| Arc::new(42));
///
/// let one = table.get(&"a".to_string());
/// let two = table.get(&"a".to_string());
///
/// assert!(Arc::ptr_eq(&one, &two));
/// assert_eq!(table.len(), 1);
///
/// drop((one, two));
/// assert_eq!(table.len(), 0);
/// ```
pub struct WeakTable<K, V> {
    factory: Box<dyn Fn(&K) -> Arc<V> + Send + Sync>,
    slots: Mutex<HashMap<K, Weak<V>>>,
}

impl<K, V> WeakTable<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(factory: impl Fn(&K) -> Arc<V> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The value for `key`, synthesized on first access.
    ///
    /// Holding the table lock across construction is what collapses
    /// concurrent first accesses for one key into a single factory call.
    pub fn get(&self, key: &K) -> Arc<V> {
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| slot.strong_count() > 0);

        if let Some(value) = slots.get(key).and_then(Weak::upgrade) {
            return value;
        }

        let value = (self.factory)(key);
        slots.insert(key.clone(), Arc::downgrade(&value));
        value
    }

    /// The number of live slots.
    pub fn len(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| slot.strong_count() > 0);
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
