//! The universe: top-level owner of all runtime state.
//!
//! A [`Universe`] exclusively owns its entity table, component
//! registry, group catalogue, system registry and actions cache. The
//! scheduling model is single-writer, multi-reader, multi-stager: at
//! most one thread mutates the universe at a time, any number of
//! threads stage deferred mutations through their own change sets,
//! and [`Universe::refresh`] is the single-writer phase that
//! reconciles everything: it commits change sets, re-checks group
//! membership for every touched entity, finalises the double-buffered
//! group lists and runs the per-storage maintenance hooks.

pub use self::comp::{CompId, Component};
pub use self::entity::{Entity, TempEntity};

pub(crate) use self::comp::Components;
pub(crate) use self::entities::EntityTable;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bitset::GroupMask;
use crate::changeset::{ActionsCache, ChangeSet};
use crate::error::Error;
use crate::group::{ComponentList, Filter, Group, GroupId, GroupManager};
use crate::id::EntityId;
use crate::list::{List, SortedList};
use crate::storage::Storage;
use crate::system::{System, SystemEntry, SystemManager};

mod comp;
mod entities;
mod entity;
#[cfg(test)]
mod tests;

/// Source of unique universe ids, used to key the per-thread change
/// sets.
static NEXT_UNIVERSE_ID: AtomicU64 = AtomicU64::new(0);

/// Counters describing what the universe has done so far. Handy in
/// tests and debug overlays.
#[derive(Clone, Copy, Debug, Default)]
pub struct UniverseStats {
    /// Completed refresh cycles.
    pub refreshes: u64,
    /// Entities created, immediate and deferred.
    pub entities_created: u64,
    /// Entities destroyed, immediate and deferred.
    pub entities_destroyed: u64,
    /// Change sets replayed by refresh.
    pub change_sets_committed: u64,
    /// Deferred actions dropped because their target was gone.
    pub actions_skipped: u64,
}

/// Shared context threaded through change-set application.
pub(crate) struct CommitCtx<'a> {
    pub entities: &'a mut EntityTable,
    pub components: &'a mut Components,
    pub temp_map: &'a List<EntityId>,
    pub changed: &'a mut SortedList<EntityId>,
    pub skipped: &'a mut u64,
}

impl CommitCtx<'_> {
    /// Translates a temporary id through the mapping resolved at the
    /// start of the set's application. `None` for cancelled temps.
    pub fn resolve_temp(&self, temp: EntityId) -> Option<EntityId> {
        debug_assert!(temp.is_temp());
        let mapped = self.temp_map.get(temp.index() as usize).copied()?;
        if mapped.is_temp() {
            None
        } else {
            Some(mapped)
        }
    }
}

/// The Orrery ECS universe.
///
/// ```
/// use orrery::{Component, HashMapStorage, Universe};
///
/// struct Position { x: f32, y: f32 }
///
/// impl Component for Position {
///     type Storage = HashMapStorage<Self>;
/// }
///
/// let mut universe = Universe::new();
/// universe.register::<Position>().unwrap();
///
/// let id = universe.create_entity().unwrap();
/// universe.add_component(id, Position { x: 1.0, y: 2.0 });
/// let group = universe.add_get_group::<(Position,), ()>().unwrap();
/// universe.refresh();
///
/// for entity in universe.group(group).iter() {
///     let pos = entity.get::<Position>().unwrap();
///     assert_eq!(pos.x, 1.0);
/// }
/// ```
pub struct Universe {
    entities: EntityTable,
    components: Components,
    groups: GroupManager,
    systems: SystemManager,
    actions: ActionsCache,
    /// Entities touched since the last refresh, pending group
    /// re-checks.
    changed: SortedList<EntityId>,
    /// Destroyed entities and the group masks they died with. Their
    /// exits reach the group delta lists during the next refresh,
    /// after the previous cycle's deltas have been cleared.
    pending_exits: Vec<(EntityId, GroupMask)>,
    stats: UniverseStats,
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl Universe {
    /// Creates an empty universe.
    pub fn new() -> Self {
        let universe_id = NEXT_UNIVERSE_ID.fetch_add(1, Ordering::Relaxed);
        Universe {
            entities: EntityTable::new(),
            components: Components::new(),
            groups: GroupManager::new(),
            systems: SystemManager::new(),
            actions: ActionsCache::new(universe_id),
            changed: SortedList::new(),
            pending_exits: Vec::new(),
            stats: UniverseStats::default(),
        }
    }

    /// Finishes setup after component and system registration.
    ///
    /// Optional; registration works lazily. This only logs the
    /// configured shape once so startup problems show up early.
    pub fn init(&self) {
        log::trace!(
            "universe initialised with {} component types",
            self.components.len()
        );
    }

    /// Counters describing what this universe has done so far.
    pub fn stats(&self) -> &UniverseStats {
        &self.stats
    }

    // --- Component registration -------------------------------------------

    /// Registers component type `C` with a default-constructed
    /// storage, returning its id.
    pub fn register<C>(&mut self) -> Result<CompId, Error>
    where
        C: Component,
        C::Storage: Default,
    {
        self.components.register::<C>()
    }

    /// Registers component type `C` with a caller-built storage
    /// instance.
    pub fn register_with<C: Component>(&mut self, storage: C::Storage) -> Result<CompId, Error> {
        self.components.register_with::<C>(storage)
    }

    /// The id assigned to `C`, if registered.
    pub fn component_id<C: Component>(&self) -> Option<CompId> {
        self.components.id::<C>()
    }

    /// Whether `C` has been registered in this universe.
    pub fn component_registered<C: Component>(&self) -> bool {
        self.components.registered::<C>()
    }

    /// Read access to the storage registered for `C`, e.g. for the
    /// B+ tree statistics or a flagged storage's event readers.
    pub fn component_storage<C: Component>(&self) -> Option<&C::Storage> {
        self.components.storage::<C>()
    }

    /// Mutable access to the storage registered for `C`.
    pub fn component_storage_mut<C: Component>(&mut self) -> Option<&mut C::Storage> {
        self.components.storage_mut::<C>()
    }

    // --- Immediate entity API ---------------------------------------------

    /// Creates an entity immediately. New entities start active and
    /// carry no components.
    pub fn create_entity(&mut self) -> Result<EntityId, Error> {
        let id = self.entities.create()?;
        self.entities.set_activity(id, true);
        self.changed.insert_unique(id);
        self.stats.entities_created += 1;
        Ok(id)
    }

    /// Wraps an id in a borrowing handle.
    pub fn entity(&self, id: EntityId) -> Entity<'_> {
        Entity::new(self, id)
    }

    /// Whether `id` names a live entity.
    #[inline]
    pub fn entity_valid(&self, id: EntityId) -> bool {
        self.entities.valid(id)
    }

    /// Whether `id` is live and active.
    #[inline]
    pub fn entity_active(&self, id: EntityId) -> bool {
        self.entities.active(id)
    }

    /// Activates `id` immediately.
    pub fn activate_entity(&mut self, id: EntityId) {
        self.set_entity_activity(id, true);
    }

    /// Deactivates `id` immediately.
    pub fn deactivate_entity(&mut self, id: EntityId) {
        self.set_entity_activity(id, false);
    }

    /// Sets the activity flag of `id`; returns whether it changed.
    /// Group membership follows on the next refresh.
    pub fn set_entity_activity(&mut self, id: EntityId, activity: bool) -> bool {
        let changed = self.entities.set_activity(id, activity);
        if changed {
            self.changed.insert_unique(id);
        }
        changed
    }

    /// Destroys `id` immediately: drops its components from every
    /// storage, records its exit from all groups, and recycles the
    /// index through the free list. Returns `false` if `id` is
    /// already dead.
    pub fn destroy_entity(&mut self, id: EntityId) -> bool {
        if !self.entities.valid(id) {
            return false;
        }
        let group_mask = *self.entities.groups(id);
        self.pending_exits.push((id, group_mask));
        let comp_mask = *self.entities.components(id);
        for comp_id in 0..self.components.len() {
            if comp_mask.test(comp_id) {
                self.components.holder_mut(comp_id).remove_any(id);
            }
        }
        self.entities.destroy(id);
        self.changed.insert_unique(id);
        self.stats.entities_destroyed += 1;
        true
    }

    // --- Immediate component API ------------------------------------------

    /// Adds `value` as component `C` of `id` immediately, replacing
    /// any previous value. Returns `None` when `id` is dead.
    ///
    /// # Panics
    ///
    /// Panics if `C` is not registered; that is a contract breach,
    /// not a runtime condition.
    pub fn add_component<C: Component>(&mut self, id: EntityId, value: C) -> Option<&mut C> {
        let comp_id = self
            .components
            .id::<C>()
            .unwrap_or_else(|| panic!("component {} is not registered", std::any::type_name::<C>()));
        if !self.entities.valid(id) {
            log::warn!("add_component on dead entity {:?}", id);
            return None;
        }
        self.entities.add_component(id, comp_id);
        self.changed.insert_unique(id);
        Some(self.components.storage_mut_by_id::<C>(comp_id).add(id, value))
    }

    /// Removes component `C` from `id` immediately. Idempotent;
    /// returns whether a component was actually removed.
    pub fn remove_component<C: Component>(&mut self, id: EntityId) -> bool {
        let comp_id = match self.components.id::<C>() {
            Some(comp_id) => comp_id,
            None => return false,
        };
        if !self.entities.valid(id) {
            return false;
        }
        self.entities.remove_component(id, comp_id);
        self.changed.insert_unique(id);
        self.components.storage_mut_by_id::<C>(comp_id).remove(id)
    }

    /// The `C` component of `id`, if the entity is live and carries
    /// one.
    pub fn get_component<C: Component>(&self, id: EntityId) -> Option<&C> {
        if !self.entities.valid(id) {
            return None;
        }
        self.components.storage::<C>()?.get(id)
    }

    /// Mutable access to the `C` component of `id`.
    pub fn get_component_mut<C: Component>(&mut self, id: EntityId) -> Option<&mut C> {
        if !self.entities.valid(id) {
            return None;
        }
        self.components.storage_mut::<C>()?.get_mut(id)
    }

    /// Whether live entity `id` carries component `C`, per the
    /// metadata bitmask.
    pub fn has_component<C: Component>(&self, id: EntityId) -> bool {
        match self.components.id::<C>() {
            Some(comp_id) => self.entities.has_component(id, comp_id),
            None => false,
        }
    }

    // --- Deferred API ------------------------------------------------------

    /// Creates a temporary entity through the calling thread's change
    /// set. The concrete entity materialises on refresh after
    /// [`Universe::commit_change_set`].
    pub fn create_entity_d(&self) -> TempEntity<'_> {
        let id = self.actions.with_set(|set| set.create_entity());
        TempEntity::new(self, id)
    }

    /// Stages adding `value` as component `C` of `id`.
    pub fn add_component_d<C: Component>(&self, id: EntityId, value: C) {
        self.actions.with_set(|set| {
            set.add_component(id, value);
        });
    }

    /// Stages adding `value` as component `C` of temporary `id`.
    pub fn add_component_temp_d<C: Component>(&self, id: EntityId, value: C) {
        self.actions.with_set(|set| {
            set.add_component_temp(id, value);
        });
    }

    /// Stages removing component `C` from `id`.
    pub fn remove_component_d<C: Component>(&self, id: EntityId) {
        self.actions.with_set(|set| set.remove_component::<C>(id));
    }

    /// Stages removing component `C` from temporary `id`.
    pub fn remove_component_temp_d<C: Component>(&self, id: EntityId) {
        self.actions
            .with_set(|set| set.remove_component_temp::<C>(id));
    }

    /// Whether the calling thread's change set has an add of `C`
    /// staged for `id`.
    pub fn has_component_d<C: Component>(&self, id: EntityId) -> bool {
        self.actions.with_set(|set| set.has_component::<C>(id))
    }

    /// Runs `f` on the staged `C` value for `id` in the calling
    /// thread's change set, if one is pending.
    pub fn with_staged_component<C: Component, R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&C) -> R,
    ) -> Option<R> {
        self.actions
            .with_set(|set| set.get_component::<C>(id).map(f))
    }

    /// Runs `f` on the staged `C` value for `id`, mutably.
    pub fn with_staged_component_mut<C: Component, R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut C) -> R,
    ) -> Option<R> {
        self.actions
            .with_set(|set| set.get_component_mut::<C>(id).map(f))
    }

    /// Stages activation of `id`.
    pub fn activate_entity_d(&self, id: EntityId) {
        self.actions.with_set(|set| set.activate_entity(id));
    }

    /// Stages deactivation of `id`.
    pub fn deactivate_entity_d(&self, id: EntityId) {
        self.actions.with_set(|set| set.deactivate_entity(id));
    }

    /// Stages destruction of `id`; returns `false` when the entity is
    /// already dead at staging time.
    pub fn destroy_entity_d(&self, id: EntityId) -> bool {
        if !self.entities.valid(id) {
            return false;
        }
        self.actions.with_set(|set| set.destroy_entity(id));
        true
    }

    /// Stages activation of temporary `id`.
    pub fn activate_temp_entity_d(&self, id: EntityId) {
        self.actions.with_set(|set| set.activate_temp_entity(id));
    }

    /// Stages deactivation of temporary `id`.
    pub fn deactivate_temp_entity_d(&self, id: EntityId) {
        self.actions.with_set(|set| set.deactivate_temp_entity(id));
    }

    /// Cancels temporary `id` within the calling thread's change set.
    pub fn destroy_temp_entity_d(&self, id: EntityId) {
        self.actions.with_set(|set| set.destroy_temp_entity(id));
    }

    /// Commits the calling thread's change set: the set is detached,
    /// appended to the committed list (the commit mutex acquisition
    /// order is the replay order), and a fresh set takes its place on
    /// next use.
    pub fn commit_change_set(&self) {
        self.actions.commit();
    }

    /// Commits a user-owned change set built outside the thread-local
    /// machinery.
    pub fn commit(&self, set: ChangeSet) {
        self.actions.commit_owned(set);
    }

    /// Discards the calling thread's uncommitted change set.
    pub fn reset_change_set(&self) {
        self.actions.reset_thread();
    }

    // --- Groups ------------------------------------------------------------

    /// Returns the group for the filter built from the `R`equire and
    /// `J`eject component lists, creating it on first request. Each
    /// call bumps the group's usage counter; pair it with
    /// [`Universe::abandon_group`].
    pub fn add_get_group<R: ComponentList, J: ComponentList>(&mut self) -> Result<GroupId, Error> {
        let filter = self.build_filter::<R, J>();
        let (id, created) = self.groups.add_get(filter, &mut self.entities)?;
        if created {
            // Entities settled before the group existed still have
            // to be evaluated against its filter.
            for active in self.entities.active_ids() {
                self.changed.insert_unique(active);
            }
        }
        Ok(id)
    }

    /// Decrements the usage counter of the `R`/`J` group. Returns
    /// `true` the first time the counter reaches zero; the group is
    /// collected on the next refresh.
    pub fn abandon_group<R: ComponentList, J: ComponentList>(&mut self) -> bool {
        let filter = self.build_filter::<R, J>();
        match self.groups.find_mut(&filter) {
            Some(group) => group.drop_usage(),
            None => false,
        }
    }

    /// Borrows a group by the token [`Universe::add_get_group`]
    /// returned.
    ///
    /// # Panics
    ///
    /// Panics if the token refers to a collected group.
    pub fn group(&self, id: GroupId) -> Group<'_> {
        self.try_group(id)
            .expect("group token refers to a collected group")
    }

    /// Borrows a group, or `None` if the token went stale.
    pub fn try_group(&self, id: GroupId) -> Option<Group<'_>> {
        self.groups.get(id).map(|group| Group::new(self, group))
    }

    /// Builds the filter the `R`/`J` component lists describe.
    pub fn build_filter<R: ComponentList, J: ComponentList>(&self) -> Filter {
        Filter::new(R::mask(&self.components), J::mask(&self.components))
    }

    // --- Systems -----------------------------------------------------------

    /// Registers a system, binding it to the group its `Require` and
    /// `Reject` lists describe. Replaces (and returns) a previous
    /// instance of the same type.
    pub fn add_system<S: System>(&mut self, system: S) -> Result<Option<S>, Error> {
        let group = self.add_get_group::<S::Require, S::Reject>()?;
        let replaced = self.systems.insert::<S>(SystemEntry {
            system: Box::new(system),
            group,
        });
        Ok(replaced.map(|entry| {
            self.groups.abandon_by_id(entry.group);
            *entry
                .system
                .downcast::<S>()
                .expect("system type is fixed by its TypeId key")
        }))
    }

    /// Borrows a registered system.
    pub fn get_system<S: System>(&self) -> Option<&S> {
        self.systems.get::<S>()
    }

    /// Mutably borrows a registered system.
    pub fn get_system_mut<S: System>(&mut self) -> Option<&mut S> {
        self.systems.get_mut::<S>()
    }

    /// Removes a registered system, abandoning its group. Returns the
    /// system instance.
    pub fn remove_system<S: System>(&mut self) -> Option<S> {
        let entry = self.systems.remove::<S>()?;
        self.groups.abandon_by_id(entry.group);
        Some(
            *entry
                .system
                .downcast::<S>()
                .expect("system type is fixed by its TypeId key"),
        )
    }

    /// Runs a registered system over its group. Returns `false` if no
    /// such system is registered.
    pub fn run_system<S: System>(&mut self) -> bool {
        let mut entry = match self.systems.remove::<S>() {
            Some(entry) => entry,
            None => return false,
        };
        {
            let system = entry
                .system
                .downcast_mut::<S>()
                .expect("system type is fixed by its TypeId key");
            let group = self.group(entry.group);
            system.run(self, group);
        }
        self.systems.attach::<S>(entry);
        true
    }

    // --- Refresh -----------------------------------------------------------

    /// The single-writer reconciliation phase.
    ///
    /// In order: collect abandoned groups, replay committed change
    /// sets (in commit order), re-check groups for every touched
    /// entity, finalise group buffers, and run the storage
    /// maintenance hooks.
    pub fn refresh(&mut self) {
        log::trace!("refresh: begin");

        // Deltas describe the previous cycle until now; collection
        // happens before new deltas accumulate.
        self.groups.refresh_groups();
        self.groups.collect_abandoned(&mut self.entities);

        let sets = self.actions.take_committed();
        self.stats.change_sets_committed += sets.len() as u64;
        for mut set in sets {
            self.apply_change_set(&mut set);
        }

        // Destroyed entities left their groups with their masks
        // already wiped, so the re-check below cannot see those
        // memberships; their exits were queued at destroy time.
        for (id, mask) in std::mem::take(&mut self.pending_exits) {
            self.groups.note_destroyed(id, &mask);
        }

        let changed = std::mem::take(&mut self.changed);
        log::trace!("refresh: {} entities to re-check", changed.len());
        for &id in changed.iter() {
            self.groups.check_entity(id, &mut self.entities);
        }

        self.groups.finalize_groups();
        self.components.refresh_all();

        self.stats.refreshes += 1;
        log::trace!("refresh: done");
    }

    /// Resets the universe to its initial state: every entity,
    /// component registration, group and staged action is dropped.
    pub fn reset(&mut self) {
        self.entities.reset();
        self.components = Components::new();
        self.groups.reset();
        self.systems.reset();
        self.actions.reset();
        self.changed.clear();
        self.pending_exits.clear();
        self.stats = UniverseStats::default();
    }

    /// Ids of all live, active entities, ascending.
    pub fn active_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.active_ids()
    }

    /// Replays one change set against the universe state.
    fn apply_change_set(&mut self, set: &mut ChangeSet) {
        // 1. Materialise temporary entities, writing concrete ids
        //    back into the mapping.
        let created = set.resolve_temps(&mut self.entities, &mut self.changed);
        self.stats.entities_created += created;

        // 2. Destroys come first so later component mutations on the
        //    same id fail their generation checks and are skipped.
        for id in set.destroyed() {
            if self.destroy_entity(id) {
                continue;
            }
            log::warn!("skipping destroy of dead entity {:?}", id);
            self.stats.actions_skipped += 1;
        }

        // 3. Component actions and activity changes.
        let temp_map = std::mem::take(set.temp_entities_mut());
        let mut ctx = CommitCtx {
            entities: &mut self.entities,
            components: &mut self.components,
            temp_map: &temp_map,
            changed: &mut self.changed,
            skipped: &mut self.stats.actions_skipped,
        };
        set.apply(&mut ctx);
    }
}
