//! Copyable entity handles delegating to the universe API.

use crate::id::EntityId;
use crate::universe::{Component, Universe};

/// A value handle pairing a universe borrow with an [`EntityId`].
///
/// Handles are trivially copyable and only expose the read side and
/// the deferred mutators; immediate mutation goes through the
/// universe itself, which requires exclusive access.
#[derive(Clone, Copy)]
pub struct Entity<'a> {
    universe: &'a Universe,
    id: EntityId,
}

impl<'a> Entity<'a> {
    pub(crate) fn new(universe: &'a Universe, id: EntityId) -> Self {
        Entity { universe, id }
    }

    /// The wrapped id.
    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Whether the id still names a live entity.
    #[inline]
    pub fn valid(&self) -> bool {
        self.universe.entity_valid(self.id)
    }

    /// Whether the entity is live and active.
    #[inline]
    pub fn active(&self) -> bool {
        self.universe.entity_active(self.id)
    }

    /// Whether the entity carries component `C`.
    pub fn has<C: Component>(&self) -> bool {
        self.universe.has_component::<C>(self.id)
    }

    /// The entity's `C` component, if present.
    pub fn get<C: Component>(&self) -> Option<&'a C> {
        self.universe.get_component::<C>(self.id)
    }

    /// Stages adding `value` as component `C` through the calling
    /// thread's change set.
    pub fn add_d<C: Component>(&self, value: C) {
        self.universe.add_component_d(self.id, value);
    }

    /// Stages removal of component `C`.
    pub fn remove_d<C: Component>(&self) {
        self.universe.remove_component_d::<C>(self.id);
    }

    /// Stages activation.
    pub fn activate_d(&self) {
        self.universe.activate_entity_d(self.id);
    }

    /// Stages deactivation.
    pub fn deactivate_d(&self) {
        self.universe.deactivate_entity_d(self.id);
    }

    /// Stages destruction.
    pub fn destroy_d(&self) -> bool {
        self.universe.destroy_entity_d(self.id)
    }
}

impl std::fmt::Debug for Entity<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Entity").field(&self.id).finish()
    }
}

impl PartialEq for Entity<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && std::ptr::eq(self.universe, other.universe)
    }
}

impl Eq for Entity<'_> {}

/// Handle for a temporary entity created by
/// [`Universe::create_entity_d`].
///
/// Backed by a temp id that only this thread's change set knows;
/// accepted exclusively by the deferred APIs, and only meaningful on
/// the thread that created it.
#[derive(Clone, Copy)]
pub struct TempEntity<'a> {
    universe: &'a Universe,
    id: EntityId,
}

impl<'a> TempEntity<'a> {
    pub(crate) fn new(universe: &'a Universe, id: EntityId) -> Self {
        debug_assert!(id.is_temp());
        TempEntity { universe, id }
    }

    /// The temporary id, tagged with the reserved generation.
    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Stages adding `value` as component `C`.
    pub fn add_d<C: Component>(&self, value: C) {
        self.universe.add_component_temp_d(self.id, value);
    }

    /// Stages removal of component `C`.
    pub fn remove_d<C: Component>(&self) {
        self.universe.remove_component_temp_d::<C>(self.id);
    }

    /// Stages activation of the materialised entity.
    pub fn activate_d(&self) {
        self.universe.activate_temp_entity_d(self.id);
    }

    /// Stages deactivation of the materialised entity.
    pub fn deactivate_d(&self) {
        self.universe.deactivate_temp_entity_d(self.id);
    }

    /// Cancels the temporary entity; it will never materialise.
    pub fn destroy_d(&self) {
        self.universe.destroy_temp_entity_d(self.id);
    }
}

impl std::fmt::Debug for TempEntity<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TempEntity").field(&self.id).finish()
    }
}
