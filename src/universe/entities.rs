//! The entity record table.
//!
//! One [`EntityRecord`] per allocated index: current generation, the
//! component-presence mask and the group-membership mask (bit 0 of
//! which is the activity flag). Destroyed indexes queue on a FIFO
//! free list threaded through the records and are only reused once at
//! least [`ENT_MIN_FREE`] of them are pending, so stale ids get a
//! window to fail their generation check.

use crate::bitset::{ComponentMask, GroupMask};
use crate::error::Error;
use crate::group::Filter;
use crate::id::{EIdType, EntityId, MAX_ENTITIES, TEMP_ENTITY_GEN};
use crate::list::{List, SortedList};
use crate::{ENT_MIN_FREE, MAX_GROUPS};

/// Free-list terminator.
const END_OF_CHAIN: EIdType = EIdType::MAX;

/// Metadata record of a single entity index.
///
/// The original design overlays the component mask and the free-list
/// link in one union; here they are separate fields and `next_free`
/// is only meaningful while the record sits on the free list.
#[derive(Clone)]
pub(crate) struct EntityRecord {
    /// Generation currently owning this index. `TEMP_ENTITY_GEN`
    /// marks a retired index.
    generation: EIdType,
    /// Which component types this entity carries.
    components: ComponentMask,
    /// Group membership; bit 0 is the activity flag.
    groups: GroupMask,
    /// Next index in the free chain.
    next_free: EIdType,
}

impl EntityRecord {
    fn new() -> Self {
        EntityRecord {
            generation: 0,
            components: ComponentMask::new(),
            groups: GroupMask::new(),
            next_free: END_OF_CHAIN,
        }
    }

    #[inline]
    fn active(&self) -> bool {
        self.groups.test(0)
    }
}

/// The entity table: records, the free chain through them, and the
/// allocator for group bit columns.
pub(crate) struct EntityTable {
    records: List<EntityRecord>,
    /// Head of the free chain, `END_OF_CHAIN` when empty.
    first_free: EIdType,
    /// Tail of the free chain.
    last_free: EIdType,
    /// Length of the free chain.
    num_free: usize,
    /// Recycled group ids, handed out smallest-first to keep the bit
    /// columns dense.
    free_group_ids: SortedList<usize>,
    /// First group id never used yet.
    next_group_id: usize,
}

impl EntityTable {
    pub fn new() -> Self {
        EntityTable {
            records: List::new(),
            first_free: END_OF_CHAIN,
            last_free: END_OF_CHAIN,
            num_free: 0,
            free_group_ids: SortedList::new(),
            next_group_id: 0,
        }
    }

    /// Number of allocated records, live or freed.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Creates a new entity and returns its id.
    ///
    /// A freed index is reused once enough of them are pending; when
    /// the table is saturated the free chain is drained regardless.
    pub fn create(&mut self) -> Result<EntityId, Error> {
        if self.num_free > ENT_MIN_FREE {
            return Ok(self.pop_free().expect("free chain is non-empty"));
        }
        if self.records.len() < MAX_ENTITIES {
            let index = self.records.len() as EIdType;
            self.records.push(EntityRecord::new());
            return Ok(EntityId::new(index, 0));
        }
        // Table saturated; fall back to the chain even under the
        // reuse threshold.
        self.pop_free().ok_or(Error::NoFreeEntities)
    }

    /// Destroys `id`. Returns `false` if the id is already dead.
    pub fn destroy(&mut self, id: EntityId) -> bool {
        if !self.valid(id) {
            return false;
        }
        let index = id.index();
        let record = &mut self.records[index as usize];
        record.components.reset_all();
        record.groups.reset_all();
        record.generation += 1;
        if record.generation >= TEMP_ENTITY_GEN {
            // Generation space exhausted: retire the index for good
            // rather than risk ABA on long-lived stale ids.
            record.generation = TEMP_ENTITY_GEN;
        } else {
            self.push_free(index);
        }
        true
    }

    /// Whether `id` names a live entity.
    #[inline]
    pub fn valid(&self, id: EntityId) -> bool {
        if id.is_temp() {
            return false;
        }
        match self.records.get(id.index() as usize) {
            Some(record) => {
                record.generation == id.generation() && !self.on_free_list(id.index())
            }
            None => false,
        }
    }

    /// Whether `id` is live and active.
    #[inline]
    pub fn active(&self, id: EntityId) -> bool {
        self.valid(id) && self.records[id.index() as usize].active()
    }

    /// Sets the activity flag; returns whether it actually changed.
    pub fn set_activity(&mut self, id: EntityId, activity: bool) -> bool {
        if !self.valid(id) {
            return false;
        }
        let record = &mut self.records[id.index() as usize];
        if record.active() == activity {
            return false;
        }
        if activity {
            record.groups.set(0);
        } else {
            record.groups.reset(0);
        }
        true
    }

    /// Marks component `comp` as present. No storage I/O happens
    /// here; the caller owns that.
    #[inline]
    pub fn add_component(&mut self, id: EntityId, comp: usize) {
        debug_assert!(self.valid(id));
        self.records[id.index() as usize].components.set(comp);
    }

    /// Marks component `comp` as absent. Idempotent.
    #[inline]
    pub fn remove_component(&mut self, id: EntityId, comp: usize) {
        debug_assert!(self.valid(id));
        self.records[id.index() as usize].components.reset(comp);
    }

    /// Whether component `comp` is marked present for `id`.
    #[inline]
    pub fn has_component(&self, id: EntityId, comp: usize) -> bool {
        self.valid(id) && self.records[id.index() as usize].components.test(comp)
    }

    /// Component mask of a live record.
    #[inline]
    pub fn components(&self, id: EntityId) -> &ComponentMask {
        &self.records[id.index() as usize].components
    }

    /// Group mask of a live record.
    #[inline]
    pub fn groups(&self, id: EntityId) -> &GroupMask {
        &self.records[id.index() as usize].groups
    }

    /// Sets the membership bit of group `group_id` (bit 0 is
    /// reserved, so group `g` lives at bit `g + 1`).
    #[inline]
    pub fn set_group(&mut self, id: EntityId, group_id: usize) {
        self.records[id.index() as usize].groups.set(group_id + 1);
    }

    /// Clears the membership bit of group `group_id`.
    #[inline]
    pub fn reset_group(&mut self, id: EntityId, group_id: usize) {
        self.records[id.index() as usize].groups.reset(group_id + 1);
    }

    /// Whether `id` is a member of group `group_id`.
    #[inline]
    pub fn in_group(&self, id: EntityId, group_id: usize) -> bool {
        self.valid(id) && self.records[id.index() as usize].groups.test(group_id + 1)
    }

    /// Packs the filter test for `index` into a single bit.
    #[inline]
    pub fn compress_info(&self, filter: &Filter, index: EIdType) -> bool {
        filter.matches(&self.records[index as usize].components)
    }

    /// Allocates a group bit column, recycling the smallest freed id
    /// first.
    pub fn add_group(&mut self) -> Result<usize, Error> {
        if let Some(group_id) = self.free_group_ids.pop_first() {
            return Ok(group_id);
        }
        if self.next_group_id >= MAX_GROUPS {
            return Err(Error::TooManyGroups);
        }
        let group_id = self.next_group_id;
        self.next_group_id += 1;
        Ok(group_id)
    }

    /// Recycles a group bit column, clearing its bit in every record.
    pub fn remove_group(&mut self, group_id: usize) {
        for record in self.records.iter_mut() {
            record.groups.reset(group_id + 1);
        }
        self.free_group_ids.insert_unique(group_id);
    }

    /// Ids of all live, active entities, in index order.
    pub fn active_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.records.iter().enumerate().filter_map(|(index, record)| {
            if record.active() && record.generation != TEMP_ENTITY_GEN {
                Some(EntityId::new(index as EIdType, record.generation))
            } else {
                None
            }
        })
    }

    /// Drops every record and recycled id.
    pub fn reset(&mut self) {
        self.records.clear();
        self.first_free = END_OF_CHAIN;
        self.last_free = END_OF_CHAIN;
        self.num_free = 0;
        self.free_group_ids.clear();
        self.next_group_id = 0;
    }

    /// Whether `index` currently sits on the free chain.
    ///
    /// Freed records have had their generation bumped, so any id a
    /// caller can still hold fails the generation test first; this
    /// walkless check only guards the window between a destroy and
    /// the reuse of the same index with the new generation.
    #[inline]
    fn on_free_list(&self, index: EIdType) -> bool {
        let record = &self.records[index as usize];
        record.next_free != END_OF_CHAIN || self.last_free == index
    }

    fn push_free(&mut self, index: EIdType) {
        debug_assert!(self.records[index as usize].next_free == END_OF_CHAIN);
        if self.last_free == END_OF_CHAIN {
            self.first_free = index;
        } else {
            self.records[self.last_free as usize].next_free = index;
        }
        self.last_free = index;
        self.num_free += 1;
    }

    fn pop_free(&mut self) -> Option<EntityId> {
        if self.first_free == END_OF_CHAIN {
            return None;
        }
        let index = self.first_free;
        let record = &mut self.records[index as usize];
        self.first_free = record.next_free;
        record.next_free = END_OF_CHAIN;
        if self.first_free == END_OF_CHAIN {
            self.last_free = END_OF_CHAIN;
        }
        self.num_free -= 1;
        Some(EntityId::new(index, self.records[index as usize].generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_starts_at_zero() {
        let mut table = EntityTable::new();
        let id = table.create().unwrap();
        assert_eq!(id.index(), 0);
        assert_eq!(id.generation(), 0);
        assert!(table.valid(id));
        assert!(!table.active(id));
    }

    #[test]
    fn destroy_invalidates_and_bumps_generation() {
        let mut table = EntityTable::new();
        let id = table.create().unwrap();
        assert!(table.destroy(id));
        assert!(!table.valid(id));
        assert!(!table.destroy(id));

        // Push enough other indexes through the chain to trigger
        // reuse of index 0.
        let mut reused = None;
        for _ in 0..(ENT_MIN_FREE * 4) {
            let e = table.create().unwrap();
            if e.index() == id.index() {
                reused = Some(e);
                break;
            }
            table.destroy(e);
        }
        let reused = reused.expect("index should be recycled");
        assert_ne!(reused.generation(), id.generation());
        assert!(!table.valid(id));
        assert!(table.valid(reused));
    }

    #[test]
    fn free_list_is_fifo_with_min_length() {
        let mut table = EntityTable::new();
        let ids: Vec<_> = (0..ENT_MIN_FREE + 1)
            .map(|_| table.create().unwrap())
            .collect();
        for &id in &ids {
            table.destroy(id);
        }
        // Chain holds ENT_MIN_FREE + 1 indexes, which is just over
        // the threshold: the next create must reuse the oldest freed
        // index, the one after must append instead.
        let reused = table.create().unwrap();
        assert_eq!(reused.index(), ids[0].index());
        let fresh = table.create().unwrap();
        assert_eq!(fresh.index(), ids.len() as EIdType);
    }

    #[test]
    fn activity_toggles_report_changes() {
        let mut table = EntityTable::new();
        let id = table.create().unwrap();
        assert!(table.set_activity(id, true));
        assert!(!table.set_activity(id, true));
        assert!(table.active(id));
        assert!(table.set_activity(id, false));
        assert!(!table.active(id));
    }

    #[test]
    fn group_ids_recycle_smallest_first() {
        let mut table = EntityTable::new();
        assert_eq!(table.add_group().unwrap(), 0);
        assert_eq!(table.add_group().unwrap(), 1);
        assert_eq!(table.add_group().unwrap(), 2);
        table.remove_group(2);
        table.remove_group(0);
        assert_eq!(table.add_group().unwrap(), 0);
        assert_eq!(table.add_group().unwrap(), 2);
        assert_eq!(table.add_group().unwrap(), 3);
    }
}
