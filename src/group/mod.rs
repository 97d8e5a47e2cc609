//! Filter-indexed entity group caches.
//!
//! A [`Filter`] is a pair of component masks; an [`EntityGroup`]
//! caches the sorted set of entity ids currently matching one filter,
//! so systems iterate a flat id list instead of testing every entity
//! each cycle. Membership is reconciled by the universe refresh: the
//! per-cycle `added`/`removed` deltas are merged into a back buffer
//! which is then swapped with the front.

use crate::bitset::{ComponentMask, GroupMask};
use crate::id::EntityId;
use crate::list::List;
use crate::universe::{Components, Entity, EntityTable, Universe};

/// A membership filter: entities match iff they carry every component
/// in `require` and none in `reject` (requirement wins on overlap).
#[derive(Clone, Copy, Debug)]
pub struct Filter {
    require: ComponentMask,
    reject: ComponentMask,
    mask: ComponentMask,
}

impl Filter {
    /// Builds a filter from require and reject masks.
    pub fn new(require: ComponentMask, reject: ComponentMask) -> Self {
        Filter {
            require,
            reject,
            mask: require | reject,
        }
    }

    /// Whether an entity with component mask `components` matches.
    #[inline]
    pub fn matches(&self, components: &ComponentMask) -> bool {
        (*components & self.mask) == self.require
    }

    /// The required-components mask.
    pub fn require(&self) -> &ComponentMask {
        &self.require
    }

    /// The rejected-components mask.
    pub fn reject(&self) -> &ComponentMask {
        &self.reject
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        // Two filters behave identically iff require and the combined
        // mask agree; the raw reject list may differ by overlap.
        self.require == other.require && self.mask == other.mask
    }
}

impl Eq for Filter {}

/// A list of component types usable as the require or reject side of
/// a filter, implemented for tuples up to 12 components (`()` for an
/// empty list).
///
/// Unregistered component types contribute nothing to the mask.
pub trait ComponentList {
    /// ORs the masks of every listed component type.
    fn mask(components: &Components) -> ComponentMask;
}

macro_rules! component_list {
    ($($ty:ident),*) => {
        impl<$($ty),*> ComponentList for ($($ty,)*)
        where
            $($ty: crate::universe::Component,)*
        {
            fn mask(components: &Components) -> ComponentMask {
                #[allow(unused_mut)]
                let mut mask = ComponentMask::new();
                $(mask |= components.mask::<$ty>();)*
                mask
            }
        }
    };
}

component_list!();
component_list!(A);
component_list!(A, B);
component_list!(A, B, C);
component_list!(A, B, C, D);
component_list!(A, B, C, D, E);
component_list!(A, B, C, D, E, F);
component_list!(A, B, C, D, E, F, G);
component_list!(A, B, C, D, E, F, G, H);
component_list!(A, B, C, D, E, F, G, H, I);
component_list!(A, B, C, D, E, F, G, H, I, J);
component_list!(A, B, C, D, E, F, G, H, I, J, K);
component_list!(A, B, C, D, E, F, G, H, I, J, K, L);

/// Stable token naming a group within its universe. Obtained from
/// [`Universe::add_get_group`], redeemed with [`Universe::group`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) usize);

/// The cached member list of one filter.
///
/// Holds two sorted id buffers; reads go through the front one while
/// refresh merges the accumulated deltas into the back one and swaps.
/// The `added`/`removed` delta lists describe the changes applied by
/// the most recent refresh and stay readable until the next one.
pub struct EntityGroup {
    filter: Filter,
    id: usize,
    usage: usize,
    buffers: [List<EntityId>; 2],
    /// Index of the front buffer within `buffers`.
    front: usize,
    added: List<EntityId>,
    removed: List<EntityId>,
}

impl EntityGroup {
    pub(crate) fn new(filter: Filter, id: usize) -> Self {
        EntityGroup {
            filter,
            id,
            usage: 1,
            buffers: [List::new(), List::new()],
            front: 0,
            added: List::new(),
            removed: List::new(),
        }
    }

    /// The filter deciding membership.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// This group's id, its bit position in the group masks minus
    /// one.
    pub fn id(&self) -> usize {
        self.id
    }

    /// How many callers currently hold this group.
    pub fn usage(&self) -> usize {
        self.usage
    }

    /// Current members, ascending by entity index.
    #[inline]
    pub fn members(&self) -> &[EntityId] {
        self.buffers[self.front].as_slice()
    }

    /// Ids that entered the group during the last refresh.
    pub fn added(&self) -> &[EntityId] {
        self.added.as_slice()
    }

    /// Ids that left the group during the last refresh.
    pub fn removed(&self) -> &[EntityId] {
        self.removed.as_slice()
    }

    pub(crate) fn bump_usage(&mut self) {
        self.usage += 1;
    }

    /// Decrements the usage counter; true when it just reached zero.
    pub(crate) fn drop_usage(&mut self) -> bool {
        if self.usage == 0 {
            return false;
        }
        self.usage -= 1;
        self.usage == 0
    }

    pub(crate) fn add(&mut self, id: EntityId) {
        self.added.push(id);
    }

    pub(crate) fn remove(&mut self, id: EntityId) {
        self.removed.push(id);
    }

    /// Clears the delta lists at the start of a refresh cycle.
    pub(crate) fn refresh(&mut self) {
        self.added.clear();
        self.added.shrink_to_fit();
        self.removed.clear();
        self.removed.shrink_to_fit();
    }

    /// Merges the accumulated deltas into the back buffer and swaps.
    ///
    /// `added` and `removed` are disjoint and each id appears at most
    /// once; `removed` is a subset of the front buffer, `added` is
    /// disjoint from it. The merge emits the union of front and added
    /// minus removed, ascending.
    pub(crate) fn finalize(&mut self) {
        if self.added.is_empty() && self.removed.is_empty() {
            return;
        }

        self.added.sort();
        self.removed.sort();

        let (left, right) = self.buffers.split_at_mut(1);
        let (front, back) = if self.front == 0 {
            (&mut left[0], &mut right[0])
        } else {
            (&mut right[0], &mut left[0])
        };

        back.clear();
        back.reserve(front.len() + self.added.len());

        let mut add_it = self.added.iter().peekable();
        let mut rem_it = self.removed.iter().peekable();

        for &id in front.iter() {
            if rem_it.peek() == Some(&&id) {
                rem_it.next();
                continue;
            }
            while let Some(&&pending) = add_it.peek() {
                if pending < id {
                    back.push(pending);
                    add_it.next();
                } else {
                    break;
                }
            }
            back.push(id);
        }
        for &pending in add_it {
            back.push(pending);
        }
        debug_assert!(rem_it.peek().is_none(), "removed must be a subset of front");

        self.front = 1 - self.front;
    }
}

/// Keeps the catalogue of entity groups and reconciles membership
/// with entity metadata.
pub(crate) struct GroupManager {
    groups: Vec<Option<EntityGroup>>,
}

impl GroupManager {
    pub fn new() -> Self {
        GroupManager { groups: Vec::new() }
    }

    /// Returns the group for `filter` and whether it had to be
    /// created. Existing groups get their usage counter bumped
    /// instead.
    pub fn add_get(
        &mut self,
        filter: Filter,
        entities: &mut EntityTable,
    ) -> Result<(GroupId, bool), crate::error::Error> {
        if let Some(group) = self
            .groups
            .iter_mut()
            .flatten()
            .find(|g| *g.filter() == filter)
        {
            log::debug!(
                "reusing entity group {} for an equal filter",
                group.id()
            );
            group.bump_usage();
            return Ok((GroupId(group.id()), false));
        }

        let id = entities.add_group()?;
        if self.groups.len() <= id {
            self.groups.resize_with(id + 1, || None);
        }
        debug_assert!(self.groups[id].is_none());
        self.groups[id] = Some(EntityGroup::new(filter, id));
        Ok((GroupId(id), true))
    }

    /// Mutable lookup for `filter`.
    pub fn find_mut(&mut self, filter: &Filter) -> Option<&mut EntityGroup> {
        self.groups
            .iter_mut()
            .flatten()
            .find(|g| *g.filter() == *filter)
    }

    /// Shared access by group id.
    pub fn get(&self, id: GroupId) -> Option<&EntityGroup> {
        self.groups.get(id.0).and_then(|slot| slot.as_ref())
    }

    /// Records a destroyed entity's exit from every group its mask
    /// names, so the next finalize drops it from the front buffers.
    pub fn note_destroyed(&mut self, id: EntityId, mask: &GroupMask) {
        for group in self.groups.iter_mut().flatten() {
            if mask.test(group.id() + 1) {
                group.remove(id);
            }
        }
    }

    /// Decrements a group's usage counter by token; true when it just
    /// reached zero.
    pub fn abandon_by_id(&mut self, id: GroupId) -> bool {
        match self.groups.get_mut(id.0).and_then(|slot| slot.as_mut()) {
            Some(group) => group.drop_usage(),
            None => false,
        }
    }

    /// Re-evaluates one entity against every live group, updating the
    /// entity's group bits and the group deltas.
    pub fn check_entity(&mut self, id: EntityId, entities: &mut EntityTable) {
        let index = id.index() as usize;
        debug_assert!(index < entities.len());
        for group in self.groups.iter_mut().flatten() {
            let matches = entities.active(id) && entities.compress_info(group.filter(), id.index());
            let member = entities.in_group(id, group.id());
            if !member && matches {
                entities.set_group(id, group.id());
                group.add(id);
            } else if member && !matches {
                entities.reset_group(id, group.id());
                group.remove(id);
            }
        }
    }

    /// Clears every group's delta lists.
    pub fn refresh_groups(&mut self) {
        for group in self.groups.iter_mut().flatten() {
            group.refresh();
        }
    }

    /// Merges every group's deltas into its front buffer.
    pub fn finalize_groups(&mut self) {
        for group in self.groups.iter_mut().flatten() {
            group.finalize();
        }
    }

    /// Frees groups whose usage counter reached zero, recycling their
    /// bit columns.
    pub fn collect_abandoned(&mut self, entities: &mut EntityTable) {
        for slot in self.groups.iter_mut() {
            if let Some(group) = slot {
                if group.usage() == 0 {
                    entities.remove_group(group.id());
                    *slot = None;
                }
            }
        }
    }

    /// Drops every group.
    pub fn reset(&mut self) {
        self.groups.clear();
    }
}

/// Borrowed view of a group, yielding full [`Entity`] handles.
///
/// Lives as long as the universe borrow; obtain one per cycle via
/// [`Universe::group`].
#[derive(Clone, Copy)]
pub struct Group<'a> {
    universe: &'a Universe,
    group: &'a EntityGroup,
}

impl<'a> Group<'a> {
    pub(crate) fn new(universe: &'a Universe, group: &'a EntityGroup) -> Self {
        Group { universe, group }
    }

    /// The filter deciding membership.
    pub fn filter(&self) -> &Filter {
        self.group.filter()
    }

    /// This group's id.
    pub fn id(&self) -> usize {
        self.group.id()
    }

    /// How many callers currently hold this group.
    pub fn usage(&self) -> usize {
        self.group.usage()
    }

    /// Number of current members.
    pub fn len(&self) -> usize {
        self.group.members().len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.group.members().is_empty()
    }

    /// Member ids, ascending by entity index.
    pub fn ids(&self) -> &'a [EntityId] {
        self.group.members()
    }

    /// Iterates the members as entity handles, ascending by index.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Entity<'a>> + '_ {
        let universe = self.universe;
        self.group
            .members()
            .iter()
            .map(move |&id| Entity::new(universe, id))
    }

    /// Iterates the entities that entered during the last refresh.
    pub fn iter_added(&self) -> impl ExactSizeIterator<Item = Entity<'a>> + '_ {
        let universe = self.universe;
        self.group
            .added()
            .iter()
            .map(move |&id| Entity::new(universe, id))
    }

    /// Iterates the entities that left during the last refresh.
    pub fn iter_removed(&self) -> impl ExactSizeIterator<Item = Entity<'a>> + '_ {
        let universe = self.universe;
        self.group
            .removed()
            .iter()
            .map(move |&id| Entity::new(universe, id))
    }

    /// Parallel iterator over the members.
    #[cfg(feature = "parallel")]
    pub fn par_iter(&self) -> impl rayon::iter::ParallelIterator<Item = Entity<'a>> + '_ {
        use rayon::iter::IntoParallelRefIterator;
        use rayon::iter::ParallelIterator;

        let universe = self.universe;
        self.group
            .members()
            .par_iter()
            .map(move |&id| Entity::new(universe, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(bits: &[usize]) -> ComponentMask {
        let mut m = ComponentMask::new();
        for &b in bits {
            m.set(b);
        }
        m
    }

    fn id(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    #[test]
    fn filter_matching() {
        let f = Filter::new(mask(&[0, 2]), mask(&[5]));
        assert!(f.matches(&mask(&[0, 2])));
        assert!(f.matches(&mask(&[0, 2, 3])));
        assert!(!f.matches(&mask(&[0])));
        assert!(!f.matches(&mask(&[0, 2, 5])));
    }

    #[test]
    fn filters_equal_by_behaviour() {
        // Overlapping require/reject resolves in favour of require,
        // so these two filters accept the same entities.
        let a = Filter::new(mask(&[0]), mask(&[0, 1]));
        let b = Filter::new(mask(&[0]), mask(&[1]));
        assert_eq!(a, b);
    }

    #[test]
    fn finalize_merges_and_swaps() {
        let f = Filter::new(ComponentMask::new(), ComponentMask::new());
        let mut group = EntityGroup::new(f, 0);

        group.add(id(3));
        group.add(id(1));
        group.finalize();
        assert_eq!(group.members(), &[id(1), id(3)]);

        group.refresh();
        group.add(id(2));
        group.add(id(0));
        group.remove(id(3));
        group.finalize();
        assert_eq!(group.members(), &[id(0), id(1), id(2)]);
        assert_eq!(group.removed(), &[id(3)]);

        // No deltas: finalize is a no-op and keeps the front buffer.
        group.refresh();
        group.finalize();
        assert_eq!(group.members(), &[id(0), id(1), id(2)]);
    }

    #[test]
    fn added_and_removed_stay_disjoint() {
        let f = Filter::new(ComponentMask::new(), ComponentMask::new());
        let mut group = EntityGroup::new(f, 0);
        group.add(id(1));
        group.finalize();
        group.refresh();
        group.add(id(2));
        group.remove(id(1));
        group.finalize();
        let added = group.added();
        let removed = group.removed();
        assert!(added.iter().all(|a| !removed.contains(a)));
    }
}
