//! Component trait and the per-universe component registry.

use std::any::TypeId;

use ahash::AHashMap as HashMap;

use crate::bitset::ComponentMask;
use crate::error::Error;
use crate::storage::{AnyStorage, Storage, StorageBox};
use crate::MAX_COMPONENTS;

/// Unique id of a component type within one universe, in
/// `[0, MAX_COMPONENTS)`. Stable for the lifetime of the universe.
pub type CompId = usize;

/// Abstract component type: a plain data record attached to entities
/// by type.
///
/// The `Storage` associated type selects which collection holds the
/// values of this component. Which one you want depends on how many
/// entities carry the component and how it is accessed:
/// [`DenseListStorage`] for common components, [`HashMapStorage`] for
/// rare ones, [`BPTreeStorage`] when sweeps should follow id order.
///
/// ## Examples
///
/// ```
/// use orrery::{Component, DenseListStorage};
///
/// pub struct Position {
///     pub x: f32,
///     pub y: f32,
/// }
///
/// impl Component for Position {
///     type Storage = DenseListStorage<Self>;
/// }
/// ```
///
/// [`DenseListStorage`]: crate::storage::DenseListStorage
/// [`HashMapStorage`]: crate::storage::HashMapStorage
/// [`BPTreeStorage`]: crate::storage::BPTreeStorage
pub trait Component: Send + Sync + Sized + 'static {
    /// Associated storage type for this component.
    type Storage: Storage<Self>;
}

/// The component registry: assigns each registered type its
/// [`CompId`], owns the storage instance bound to it, and hands out
/// single-bit masks for filter building.
pub(crate) struct Components {
    ids: HashMap<TypeId, CompId>,
    holders: Vec<Box<dyn AnyStorage>>,
    masks: Vec<ComponentMask>,
    names: Vec<&'static str>,
}

impl Components {
    pub fn new() -> Self {
        Components {
            ids: HashMap::default(),
            holders: Vec::new(),
            masks: Vec::new(),
            names: Vec::new(),
        }
    }

    /// Registers `C` with a default-constructed storage.
    pub fn register<C>(&mut self) -> Result<CompId, Error>
    where
        C: Component,
        C::Storage: Default,
    {
        self.register_with::<C>(C::Storage::default())
    }

    /// Registers `C` with a caller-constructed storage instance.
    pub fn register_with<C: Component>(&mut self, storage: C::Storage) -> Result<CompId, Error> {
        let type_id = TypeId::of::<C>();
        if self.ids.contains_key(&type_id) {
            return Err(Error::AlreadyRegistered(std::any::type_name::<C>()));
        }
        if self.holders.len() >= MAX_COMPONENTS {
            return Err(Error::RegistryFull);
        }
        let comp_id = self.holders.len();
        self.ids.insert(type_id, comp_id);
        self.holders.push(Box::new(StorageBox::<C> { storage }));
        self.masks.push(ComponentMask::from_bit(comp_id));
        self.names.push(std::any::type_name::<C>());
        Ok(comp_id)
    }

    /// Id assigned to `C`, if registered.
    #[inline]
    pub fn id<C: Component>(&self) -> Option<CompId> {
        self.ids.get(&TypeId::of::<C>()).copied()
    }

    /// Whether `C` has been registered.
    #[inline]
    pub fn registered<C: Component>(&self) -> bool {
        self.ids.contains_key(&TypeId::of::<C>())
    }

    /// Single-bit mask of `C`; all zeroes if `C` is unregistered.
    #[inline]
    pub fn mask<C: Component>(&self) -> ComponentMask {
        match self.id::<C>() {
            Some(comp_id) => self.masks[comp_id],
            None => ComponentMask::new(),
        }
    }

    /// Number of registered component types.
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Diagnostic name of a component id.
    pub fn name(&self, comp_id: CompId) -> &'static str {
        self.names[comp_id]
    }

    /// Typed view of the storage bound to `C`.
    pub fn storage<C: Component>(&self) -> Option<&C::Storage> {
        let comp_id = self.id::<C>()?;
        let holder = self.holders[comp_id]
            .as_any()
            .downcast_ref::<StorageBox<C>>()
            .expect("holder type is fixed at registration");
        Some(&holder.storage)
    }

    /// Typed mutable view of the storage bound to `C`.
    pub fn storage_mut<C: Component>(&mut self) -> Option<&mut C::Storage> {
        let comp_id = self.id::<C>()?;
        let holder = self.holders[comp_id]
            .as_any_mut()
            .downcast_mut::<StorageBox<C>>()
            .expect("holder type is fixed at registration");
        Some(&mut holder.storage)
    }

    /// Typed mutable view when the comp id is already known; used by
    /// the change-set commit path.
    pub fn storage_mut_by_id<C: Component>(&mut self, comp_id: CompId) -> &mut C::Storage {
        let holder = self.holders[comp_id]
            .as_any_mut()
            .downcast_mut::<StorageBox<C>>()
            .expect("comp id belongs to a different component type");
        &mut holder.storage
    }

    /// Type-erased storage access by id, for whole-entity teardown.
    #[inline]
    pub fn holder_mut(&mut self, comp_id: CompId) -> &mut dyn AnyStorage {
        &mut *self.holders[comp_id]
    }

    /// Runs the per-cycle maintenance hook of every storage.
    pub fn refresh_all(&mut self) {
        for holder in &mut self.holders {
            holder.refresh_any();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EntityId;
    use crate::storage::HashMapStorage;

    struct Pos(#[allow(dead_code)] f32);

    impl Component for Pos {
        type Storage = HashMapStorage<Self>;
    }

    struct Vel;

    impl Component for Vel {
        type Storage = HashMapStorage<Self>;
    }

    #[test]
    fn registration_assigns_dense_ids() {
        let mut comps = Components::new();
        assert_eq!(comps.register::<Pos>().unwrap(), 0);
        assert_eq!(comps.register::<Vel>().unwrap(), 1);
        assert_eq!(comps.id::<Pos>(), Some(0));
        assert!(comps.registered::<Vel>());
        assert!(matches!(
            comps.register::<Pos>(),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn masks_are_single_bits() {
        let mut comps = Components::new();
        comps.register::<Pos>().unwrap();
        comps.register::<Vel>().unwrap();
        assert_eq!(comps.mask::<Pos>().count(), 1);
        assert!(comps.mask::<Pos>().test(0));
        assert!(comps.mask::<Vel>().test(1));
        struct Unseen;
        impl Component for Unseen {
            type Storage = HashMapStorage<Self>;
        }
        assert!(comps.mask::<Unseen>().none());
    }

    #[test]
    fn typed_storage_round_trip() {
        let mut comps = Components::new();
        comps.register::<Pos>().unwrap();
        let id = EntityId::new(0, 0);
        comps.storage_mut::<Pos>().unwrap().add(id, Pos(1.5));
        assert!(comps.storage::<Pos>().unwrap().has(id));
        assert!(comps.holder_mut(0).remove_any(id));
        assert!(!comps.storage::<Pos>().unwrap().has(id));
    }
}
