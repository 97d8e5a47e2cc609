//! Reference implementations of the storage contract.

use ahash::AHashMap as HashMap;

use crate::btree::BPTree;
use crate::id::EntityId;
use crate::list::List;
use crate::storage::Storage;

/// `HashMap`-based storage. Best suited for rare components.
///
/// References are invalidated by any `add`, `remove` or `refresh` on
/// the same storage.
pub struct HashMapStorage<T>(HashMap<EntityId, T>);

impl<T> Default for HashMapStorage<T> {
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<T: Send + Sync + 'static> Storage<T> for HashMapStorage<T> {
    fn add(&mut self, id: EntityId, value: T) -> &mut T {
        match self.0.entry(id) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.insert(value);
                e.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(v) => v.insert(value),
        }
    }

    fn get(&self, id: EntityId) -> Option<&T> {
        self.0.get(&id)
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.0.get_mut(&id)
    }

    fn has(&self, id: EntityId) -> bool {
        self.0.contains_key(&id)
    }

    fn remove(&mut self, id: EntityId) -> bool {
        self.0.remove(&id).is_some()
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Dense storage with a redirection table between entity ids and
/// value slots.
///
/// Values live in a contiguous list; removing one parks its slot on a
/// free list for reuse instead of shifting the tail. The `refresh`
/// hook compacts the list once more than half of its slots are free,
/// rewriting the index map.
pub struct DenseListStorage<T> {
    index_of: HashMap<EntityId, usize>,
    values: List<Option<T>>,
    free_slots: List<usize>,
}

impl<T> Default for DenseListStorage<T> {
    fn default() -> Self {
        DenseListStorage {
            index_of: Default::default(),
            values: List::new(),
            free_slots: List::new(),
        }
    }
}

impl<T: Send + Sync + 'static> Storage<T> for DenseListStorage<T> {
    fn add(&mut self, id: EntityId, value: T) -> &mut T {
        let slot = match self.index_of.get(&id) {
            Some(&slot) => {
                self.values[slot] = Some(value);
                slot
            }
            None => {
                let slot = match self.free_slots.pop() {
                    Some(slot) => {
                        self.values[slot] = Some(value);
                        slot
                    }
                    None => {
                        self.values.push(Some(value));
                        self.values.len() - 1
                    }
                };
                self.index_of.insert(id, slot);
                slot
            }
        };
        self.values[slot].as_mut().expect("slot was just filled")
    }

    fn get(&self, id: EntityId) -> Option<&T> {
        let slot = *self.index_of.get(&id)?;
        self.values[slot].as_ref()
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        let slot = *self.index_of.get(&id)?;
        self.values[slot].as_mut()
    }

    fn has(&self, id: EntityId) -> bool {
        self.index_of.contains_key(&id)
    }

    fn remove(&mut self, id: EntityId) -> bool {
        match self.index_of.remove(&id) {
            Some(slot) => {
                self.values[slot] = None;
                self.free_slots.push(slot);
                true
            }
            None => false,
        }
    }

    fn refresh(&mut self) {
        if self.free_slots.len() <= self.values.len() / 2 {
            return;
        }
        // Compact: move live values into a fresh dense list and
        // rewrite the redirection table.
        let mut compacted = List::with_capacity(self.index_of.len());
        for (_, slot) in self.index_of.iter_mut() {
            let value = self.values[*slot].take().expect("index map points at a live slot");
            compacted.push(Some(value));
            *slot = compacted.len() - 1;
        }
        self.values = compacted;
        self.free_slots.clear();
        self.free_slots.shrink_to_fit();
    }

    fn clear(&mut self) {
        self.index_of.clear();
        self.values.clear();
        self.free_slots.clear();
    }

    fn len(&self) -> usize {
        self.index_of.len()
    }
}

/// Ordered storage over the cache-line B+ tree.
///
/// Keeps components sorted by entity id, which makes whole-storage
/// sweeps follow group iteration order.
pub struct BPTreeStorage<T>(BPTree<EntityId, T>);

impl<T> Default for BPTreeStorage<T> {
    fn default() -> Self {
        Self(BPTree::new())
    }
}

impl<T> BPTreeStorage<T> {
    /// Read access to the backing tree, mainly for its statistics.
    pub fn tree(&self) -> &BPTree<EntityId, T> {
        &self.0
    }
}

impl<T: Send + Sync + 'static> Storage<T> for BPTreeStorage<T> {
    fn add(&mut self, id: EntityId, value: T) -> &mut T {
        self.0.insert(id, value);
        self.0.search_mut(&id).expect("key was just inserted")
    }

    fn get(&self, id: EntityId) -> Option<&T> {
        self.0.search(&id)
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.0.search_mut(&id)
    }

    fn has(&self, id: EntityId) -> bool {
        self.0.search(&id).is_some()
    }

    fn remove(&mut self, id: EntityId) -> bool {
        self.0.remove(&id).is_some()
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}
