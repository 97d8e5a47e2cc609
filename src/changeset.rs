//! Deferred mutation logs and their commit cache.
//!
//! A [`ChangeSet`] records entity mutations without touching the
//! universe: component adds and removes, activity changes, destroys,
//! and the creation of *temporary* entities that only obtain a real
//! id when the log is applied. Each thread writes its own set; the
//! [`ActionsCache`] collects committed sets under a mutex, and the
//! single-writer refresh replays them in commit order.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::sync::Mutex;

use ahash::AHashMap as HashMap;

use crate::id::{EIdType, EntityId};
use crate::list::{List, SortedList};
use crate::storage::Storage;
use crate::universe::{CommitCtx, Component};

/// One staged component value, ordered by its owner id.
struct ComponentChange<C> {
    id: EntityId,
    value: C,
}

impl<C> PartialEq for ComponentChange<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<C> Eq for ComponentChange<C> {}

impl<C> PartialOrd for ComponentChange<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for ComponentChange<C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

/// Type-erased per-component action container.
pub(crate) trait AnyActions: Send {
    /// Applies the staged actions to the universe.
    fn commit(&mut self, ctx: &mut CommitCtx<'_>);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Staged actions for one component type: sorted add and remove
/// lists, plus the analogous lists keyed by temporary ids.
struct ComponentActions<C: Component> {
    added: SortedList<ComponentChange<C>>,
    removed: SortedList<EntityId>,
    temp_added: SortedList<ComponentChange<C>>,
    temp_removed: SortedList<EntityId>,
}

impl<C: Component> ComponentActions<C> {
    fn new() -> Self {
        ComponentActions {
            added: SortedList::new(),
            removed: SortedList::new(),
            temp_added: SortedList::new(),
            temp_removed: SortedList::new(),
        }
    }

    fn stage_add(&mut self, id: EntityId, value: C) -> &mut C {
        debug_assert!(!id.is_temp());
        self.removed.erase(&id);
        let change = ComponentChange { id, value };
        let index = match self.added.binary_search(&change) {
            Ok(i) => {
                *self.added.get_mut(i).expect("index from binary_search") = change;
                i
            }
            Err(_) => {
                let (i, _) = self.added.insert_unique(change);
                i
            }
        };
        &mut self.added.get_mut(index).expect("just inserted").value
    }

    fn stage_add_temp(&mut self, id: EntityId, value: C) -> &mut C {
        debug_assert!(id.is_temp());
        self.temp_removed.erase(&id);
        let change = ComponentChange { id, value };
        let index = match self.temp_added.binary_search(&change) {
            Ok(i) => {
                *self.temp_added.get_mut(i).expect("index from binary_search") = change;
                i
            }
            Err(_) => {
                let (i, _) = self.temp_added.insert_unique(change);
                i
            }
        };
        &mut self.temp_added.get_mut(index).expect("just inserted").value
    }
}

impl<C: Component> AnyActions for ComponentActions<C> {
    fn commit(&mut self, ctx: &mut CommitCtx<'_>) {
        let comp_id = match ctx.components.id::<C>() {
            Some(comp_id) => comp_id,
            None => {
                log::warn!(
                    "dropping staged actions for unregistered component {}",
                    std::any::type_name::<C>()
                );
                *ctx.skipped += (self.added.len()
                    + self.removed.len()
                    + self.temp_added.len()
                    + self.temp_removed.len()) as u64;
                return;
            }
        };

        for id in std::mem::take(&mut self.removed) {
            if !ctx.entities.valid(id) {
                log::warn!(
                    "skipping {} remove on dead entity {:?}",
                    ctx.components.name(comp_id),
                    id
                );
                *ctx.skipped += 1;
                continue;
            }
            ctx.entities.remove_component(id, comp_id);
            ctx.components.storage_mut_by_id::<C>(comp_id).remove(id);
            ctx.changed.insert_unique(id);
        }

        for change in std::mem::take(&mut self.added) {
            if !ctx.entities.valid(change.id) {
                log::warn!(
                    "skipping {} add on dead entity {:?}",
                    ctx.components.name(comp_id),
                    change.id
                );
                *ctx.skipped += 1;
                continue;
            }
            ctx.entities.add_component(change.id, comp_id);
            ctx.components
                .storage_mut_by_id::<C>(comp_id)
                .add(change.id, change.value);
            ctx.changed.insert_unique(change.id);
        }

        for temp in std::mem::take(&mut self.temp_removed) {
            let id = ctx.resolve_temp(temp);
            match id {
                Some(id) => {
                    ctx.entities.remove_component(id, comp_id);
                    ctx.components.storage_mut_by_id::<C>(comp_id).remove(id);
                    ctx.changed.insert_unique(id);
                }
                None => *ctx.skipped += 1,
            }
        }

        for change in std::mem::take(&mut self.temp_added) {
            let id = ctx.resolve_temp(change.id);
            match id {
                Some(id) => {
                    ctx.entities.add_component(id, comp_id);
                    ctx.components
                        .storage_mut_by_id::<C>(comp_id)
                        .add(id, change.value);
                    ctx.changed.insert_unique(id);
                }
                None => *ctx.skipped += 1,
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One staged activity change, ordered by id; the latest staged state
/// wins.
#[derive(Clone, Copy)]
struct ActivityChange {
    id: EntityId,
    activity: bool,
}

impl PartialEq for ActivityChange {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActivityChange {}

impl PartialOrd for ActivityChange {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActivityChange {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

/// Staged entity-metadata actions.
#[derive(Default)]
pub(crate) struct MetadataActions {
    changes: SortedList<ActivityChange>,
    temp_changes: SortedList<ActivityChange>,
    destroyed: SortedList<EntityId>,
    temp_destroyed: SortedList<EntityId>,
}

impl MetadataActions {
    fn set_activity(&mut self, id: EntityId, activity: bool) {
        let change = ActivityChange { id, activity };
        match self.changes.binary_search(&change) {
            Ok(i) => self.changes.get_mut(i).expect("found").activity = activity,
            Err(_) => {
                self.changes.insert_unique(change);
            }
        }
    }

    fn set_activity_temp(&mut self, id: EntityId, activity: bool) {
        let change = ActivityChange { id, activity };
        match self.temp_changes.binary_search(&change) {
            Ok(i) => self.temp_changes.get_mut(i).expect("found").activity = activity,
            Err(_) => {
                self.temp_changes.insert_unique(change);
            }
        }
    }
}

/// A thread-local, replayable log of deferred mutations.
///
/// A set never shares mutable state with another thread: either it is
/// owned by user code directly, or it lives in thread-local storage
/// behind the universe's `*_d` API. Committing transfers ownership to
/// the universe, which replays sets in commit order during refresh.
pub struct ChangeSet {
    actions: HashMap<TypeId, Box<dyn AnyActions>>,
    metadata: MetadataActions,
    /// Maps each temporary index to the concrete id issued by
    /// refresh; until then entries keep their temp sentinel.
    temp_entities: List<EntityId>,
}

impl Default for ChangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSet {
    /// Creates an empty change set.
    pub fn new() -> Self {
        ChangeSet {
            actions: HashMap::default(),
            metadata: MetadataActions::default(),
            temp_entities: List::new(),
        }
    }

    /// Creates a temporary entity local to this set. Its generation
    /// equals the reserved temp value; the concrete entity appears on
    /// refresh.
    pub fn create_entity(&mut self) -> EntityId {
        let index = self.temp_entities.len() as EIdType;
        let id = EntityId::temp(index);
        self.temp_entities.push(id);
        id
    }

    /// Stages `value` as component `C` of `id`, returning a reference
    /// to the staged instance. A later [`ChangeSet::add_component`]
    /// of the same type may invalidate the reference.
    pub fn add_component<C: Component>(&mut self, id: EntityId, value: C) -> &mut C {
        debug_assert!(!id.is_temp(), "use add_component_temp for temporary ids");
        self.typed_actions::<C>().stage_add(id, value)
    }

    /// Stages `value` as component `C` of the temporary entity `id`.
    pub fn add_component_temp<C: Component>(&mut self, id: EntityId, value: C) -> &mut C {
        debug_assert!(id.is_temp(), "expected a temporary id");
        self.typed_actions::<C>().stage_add_temp(id, value)
    }

    /// Stages removal of component `C` from `id`. Idempotent; cancels
    /// a staged add of the same component.
    pub fn remove_component<C: Component>(&mut self, id: EntityId) {
        debug_assert!(!id.is_temp());
        let actions = self.typed_actions::<C>();
        actions.added.erase_by(|c| c.id.cmp(&id));
        actions.removed.insert_unique(id);
    }

    /// Stages removal of component `C` from the temporary entity
    /// `id`.
    pub fn remove_component_temp<C: Component>(&mut self, id: EntityId) {
        debug_assert!(id.is_temp());
        let actions = self.typed_actions::<C>();
        actions.temp_added.erase_by(|c| c.id.cmp(&id));
        actions.temp_removed.insert_unique(id);
    }

    /// Whether a staged add of `C` for `id` is pending in this set.
    pub fn has_component<C: Component>(&self, id: EntityId) -> bool {
        self.get_component::<C>(id).is_some()
    }

    /// The staged value of component `C` for `id`, if an add is
    /// pending in this set.
    pub fn get_component<C: Component>(&self, id: EntityId) -> Option<&C> {
        let actions = self.find_actions::<C>()?;
        let list = if id.is_temp() {
            &actions.temp_added
        } else {
            &actions.added
        };
        let index = list.binary_search_by(|c| c.id.cmp(&id)).ok()?;
        Some(&list.get(index)?.value)
    }

    /// Mutable access to the staged value of component `C` for `id`.
    pub fn get_component_mut<C: Component>(&mut self, id: EntityId) -> Option<&mut C> {
        let actions = self.find_actions_mut::<C>()?;
        let list = if id.is_temp() {
            &mut actions.temp_added
        } else {
            &mut actions.added
        };
        let index = list.binary_search_by(|c| c.id.cmp(&id)).ok()?;
        Some(&mut list.get_mut(index)?.value)
    }

    /// Stages activation of `id`.
    pub fn activate_entity(&mut self, id: EntityId) {
        debug_assert!(!id.is_temp());
        self.metadata.set_activity(id, true);
    }

    /// Stages deactivation of `id`.
    pub fn deactivate_entity(&mut self, id: EntityId) {
        debug_assert!(!id.is_temp());
        self.metadata.set_activity(id, false);
    }

    /// Stages destruction of `id`.
    pub fn destroy_entity(&mut self, id: EntityId) {
        debug_assert!(!id.is_temp());
        self.metadata.destroyed.insert_unique(id);
    }

    /// Stages activation of the temporary entity `id`.
    pub fn activate_temp_entity(&mut self, id: EntityId) {
        debug_assert!(id.is_temp());
        self.metadata.set_activity_temp(id, true);
    }

    /// Stages deactivation of the temporary entity `id`.
    pub fn deactivate_temp_entity(&mut self, id: EntityId) {
        debug_assert!(id.is_temp());
        self.metadata.set_activity_temp(id, false);
    }

    /// Cancels the temporary entity `id`: it will never be
    /// materialised and its staged actions are dropped on commit.
    pub fn destroy_temp_entity(&mut self, id: EntityId) {
        debug_assert!(id.is_temp());
        self.metadata.temp_destroyed.insert_unique(id);
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.temp_entities.is_empty()
            && self.metadata.changes.is_empty()
            && self.metadata.destroyed.is_empty()
    }

    /// Drops everything staged in this set.
    pub fn clear(&mut self) {
        self.actions.clear();
        self.metadata = MetadataActions::default();
        self.temp_entities.clear();
    }

    /// Applies this set to the universe. Called by the refresh, in
    /// commit order, with the temp mapping already resolved into
    /// `self.temp_entities`.
    pub(crate) fn apply(&mut self, ctx: &mut CommitCtx<'_>) {
        for actions in self.actions.values_mut() {
            actions.commit(ctx);
        }

        for change in std::mem::take(&mut self.metadata.changes) {
            if ctx.entities.set_activity(change.id, change.activity) {
                ctx.changed.insert_unique(change.id);
            } else if !ctx.entities.valid(change.id) {
                log::warn!("skipping activity change on dead entity {:?}", change.id);
                *ctx.skipped += 1;
            }
        }

        for change in std::mem::take(&mut self.metadata.temp_changes) {
            match ctx.resolve_temp(change.id) {
                Some(id) => {
                    if ctx.entities.set_activity(id, change.activity) {
                        ctx.changed.insert_unique(id);
                    }
                }
                None => *ctx.skipped += 1,
            }
        }
    }

    /// Materialises every temporary entity through the entity table,
    /// writing the concrete ids back into the mapping. Cancelled
    /// temps keep their sentinel. Returns how many entities were
    /// created.
    pub(crate) fn resolve_temps(
        &mut self,
        entities: &mut crate::universe::EntityTable,
        changed: &mut SortedList<EntityId>,
    ) -> u64 {
        let mut created = 0;
        for i in 0..self.temp_entities.len() {
            let temp = EntityId::temp(i as EIdType);
            if self.metadata.temp_destroyed.contains(&temp) {
                continue;
            }
            match entities.create() {
                Ok(id) => {
                    entities.set_activity(id, true);
                    self.temp_entities[i] = id;
                    changed.insert_unique(id);
                    created += 1;
                }
                Err(err) => {
                    log::error!("failed to materialise temporary entity {}: {}", i, err);
                }
            }
        }
        created
    }

    /// Destroys staged by this set; the refresh applies these before
    /// any component action.
    pub(crate) fn destroyed(&mut self) -> SortedList<EntityId> {
        std::mem::take(&mut self.metadata.destroyed)
    }

    /// Temp indexes cancelled via [`ChangeSet::destroy_temp_entity`].
    pub(crate) fn temp_destroyed(&self) -> &SortedList<EntityId> {
        &self.metadata.temp_destroyed
    }

    /// The list mapping temporary indexes to concrete ids.
    pub(crate) fn temp_entities_mut(&mut self) -> &mut List<EntityId> {
        &mut self.temp_entities
    }

    fn typed_actions<C: Component>(&mut self) -> &mut ComponentActions<C> {
        self.actions
            .entry(TypeId::of::<C>())
            .or_insert_with(|| Box::new(ComponentActions::<C>::new()))
            .as_any_mut()
            .downcast_mut::<ComponentActions<C>>()
            .expect("actions type is fixed by its TypeId key")
    }

    fn find_actions<C: Component>(&self) -> Option<&ComponentActions<C>> {
        self.actions
            .get(&TypeId::of::<C>())
            .map(|a| {
                a.as_any()
                    .downcast_ref::<ComponentActions<C>>()
                    .expect("actions type is fixed by its TypeId key")
            })
    }

    fn find_actions_mut<C: Component>(&mut self) -> Option<&mut ComponentActions<C>> {
        self.actions
            .get_mut(&TypeId::of::<C>())
            .map(|a| {
                a.as_any_mut()
                    .downcast_mut::<ComponentActions<C>>()
                    .expect("actions type is fixed by its TypeId key")
            })
    }
}

/// Collects committed change sets from all threads of one universe.
///
/// The per-thread working sets live in thread-local storage keyed by
/// the universe id; committing detaches the current thread's set and
/// appends it to the shared list under the commit mutex, which also
/// defines the total commit order.
pub(crate) struct ActionsCache {
    universe_id: u64,
    committed: Mutex<Vec<ChangeSet>>,
}

thread_local! {
    /// Working change sets of this thread, one per universe.
    static WORKING_SETS: RefCell<HashMap<u64, ChangeSet>> = RefCell::new(HashMap::default());
}

impl ActionsCache {
    pub fn new(universe_id: u64) -> Self {
        ActionsCache {
            universe_id,
            committed: Mutex::new(Vec::new()),
        }
    }

    /// Runs `f` on the calling thread's working set.
    pub fn with_set<R>(&self, f: impl FnOnce(&mut ChangeSet) -> R) -> R {
        WORKING_SETS.with(|sets| {
            let mut sets = sets.borrow_mut();
            let set = sets.entry(self.universe_id).or_insert_with(ChangeSet::new);
            f(set)
        })
    }

    /// Detaches the calling thread's working set and appends it to
    /// the committed list. A thread with nothing staged is a no-op.
    pub fn commit(&self) {
        let set = WORKING_SETS.with(|sets| sets.borrow_mut().remove(&self.universe_id));
        if let Some(set) = set {
            if !set.is_empty() {
                self.committed
                    .lock()
                    .expect("commit mutex poisoned")
                    .push(set);
            }
        }
    }

    /// Appends a user-owned set to the committed list.
    pub fn commit_owned(&self, set: ChangeSet) {
        if !set.is_empty() {
            self.committed
                .lock()
                .expect("commit mutex poisoned")
                .push(set);
        }
    }

    /// Drops the calling thread's uncommitted working set.
    pub fn reset_thread(&self) {
        WORKING_SETS.with(|sets| {
            sets.borrow_mut().remove(&self.universe_id);
        });
    }

    /// Takes every committed set, in commit order.
    pub fn take_committed(&self) -> Vec<ChangeSet> {
        std::mem::take(&mut *self.committed.lock().expect("commit mutex poisoned"))
    }

    /// Drops all committed sets and the calling thread's working set.
    pub fn reset(&self) {
        self.reset_thread();
        self.committed
            .lock()
            .expect("commit mutex poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HashMapStorage;

    #[derive(Debug, PartialEq)]
    struct Health(i32);

    impl Component for Health {
        type Storage = HashMapStorage<Self>;
    }

    fn id(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    #[test]
    fn staged_adds_are_readable_and_sorted() {
        let mut set = ChangeSet::new();
        set.add_component(id(5), Health(50));
        set.add_component(id(1), Health(10));
        assert!(set.has_component::<Health>(id(1)));
        assert!(!set.has_component::<Health>(id(3)));
        assert_eq!(set.get_component::<Health>(id(5)), Some(&Health(50)));

        // Re-staging the same id overwrites the staged value.
        set.add_component(id(5), Health(99));
        assert_eq!(set.get_component::<Health>(id(5)), Some(&Health(99)));

        set.get_component_mut::<Health>(id(1)).unwrap().0 = 11;
        assert_eq!(set.get_component::<Health>(id(1)), Some(&Health(11)));
    }

    #[test]
    fn remove_cancels_staged_add() {
        let mut set = ChangeSet::new();
        set.add_component(id(2), Health(1));
        set.remove_component::<Health>(id(2));
        assert!(!set.has_component::<Health>(id(2)));

        // And an add after a remove wins again.
        set.add_component(id(2), Health(2));
        assert_eq!(set.get_component::<Health>(id(2)), Some(&Health(2)));
    }

    #[test]
    fn temp_ids_are_dense_and_tagged() {
        let mut set = ChangeSet::new();
        let a = set.create_entity();
        let b = set.create_entity();
        assert!(a.is_temp() && b.is_temp());
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        set.add_component_temp(b, Health(5));
        assert!(set.has_component::<Health>(b));
        assert!(!set.has_component::<Health>(a));
    }

    #[test]
    fn latest_activity_state_wins() {
        let mut set = ChangeSet::new();
        set.activate_entity(id(1));
        set.deactivate_entity(id(1));
        assert_eq!(set.metadata.changes.len(), 1);
        assert!(!set.metadata.changes.get(0).unwrap().activity);
    }

    #[test]
    fn empty_and_clear() {
        let mut set = ChangeSet::new();
        assert!(set.is_empty());
        set.destroy_entity(id(9));
        assert!(!set.is_empty());
        set.clear();
        assert!(set.is_empty());
    }
}
