//! Component storage types and the per-type storage contract.

pub use self::{
    flagged::{ComponentEvent, FlaggedStorage},
    storages::{BPTreeStorage, DenseListStorage, HashMapStorage},
};

use std::any::Any;

use crate::id::EntityId;
use crate::universe::Component;

mod flagged;
mod storages;
#[cfg(test)]
mod tests;

/// Contract every component storage implements.
///
/// One storage instance holds all values of a single component type,
/// keyed by entity id. The universe calls [`Storage::refresh`] once
/// per cycle; a storage may compact, defragment or rebuild indexes
/// there, as long as the contract holds afterwards.
///
/// References returned by `add`, `get` and `get_mut` stay valid only
/// until the next mutating call on the same storage. Consumers store
/// ids, not references.
pub trait Storage<T>: Send + Sync + 'static {
    /// Inserts `value` for `id`, replacing any previous value, and
    /// returns a reference to the stored component.
    fn add(&mut self, id: EntityId, value: T) -> &mut T;

    /// Non-failing lookup.
    fn get(&self, id: EntityId) -> Option<&T>;

    /// Mutable lookup.
    fn get_mut(&mut self, id: EntityId) -> Option<&mut T>;

    /// Whether a value is stored for `id`.
    fn has(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Removes the value for `id`. Returns whether a value was
    /// present; removing a missing component is a no-op.
    fn remove(&mut self, id: EntityId) -> bool;

    /// Per-cycle maintenance hook, called by the universe refresh.
    fn refresh(&mut self) {}

    /// Drops every stored value.
    fn clear(&mut self);

    /// Number of stored values.
    fn len(&self) -> usize;

    /// Whether the storage holds no values.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-erased view of a registered storage, what the component
/// registry actually owns. Downcasting back to the concrete
/// [`Component::Storage`] goes through `as_any` / `as_any_mut`.
pub(crate) trait AnyStorage: Send + Sync {
    /// Removes the component for `id` without knowing its type.
    fn remove_any(&mut self, id: EntityId) -> bool;

    /// Per-cycle maintenance, forwarded from the universe refresh.
    fn refresh_any(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Concrete carrier pairing a component type with its storage
/// instance behind the [`AnyStorage`] interface.
pub(crate) struct StorageBox<C: Component> {
    pub storage: C::Storage,
}

impl<C: Component> AnyStorage for StorageBox<C> {
    fn remove_any(&mut self, id: EntityId) -> bool {
        self.storage.remove(id)
    }

    fn refresh_any(&mut self) {
        self.storage.refresh();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
