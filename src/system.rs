//! Systems: processors bound to one entity group.
//!
//! A system names the component types its entities must and must not
//! carry; registering it builds (or reuses) the matching group. The
//! runtime does not schedule anything; user code drives execution
//! through [`Universe::run_system`], typically once per cycle after
//! `refresh`.
//!
//! [`Universe::run_system`]: crate::universe::Universe::run_system

use std::any::{Any, TypeId};

use ahash::AHashMap as HashMap;

use crate::group::{ComponentList, Group, GroupId};
use crate::universe::Universe;

/// A processor iterating the entities of one group.
///
/// ```
/// use orrery::{Component, DenseListStorage, Group, System, Universe};
///
/// struct Position { x: f32 }
/// impl Component for Position {
///     type Storage = DenseListStorage<Self>;
/// }
///
/// struct Frozen;
/// impl Component for Frozen {
///     type Storage = DenseListStorage<Self>;
/// }
///
/// struct Drift;
///
/// impl System for Drift {
///     type Require = (Position,);
///     type Reject = (Frozen,);
///
///     fn run(&mut self, universe: &Universe, group: Group<'_>) {
///         for entity in group.iter() {
///             let x = entity.get::<Position>().unwrap().x;
///             let _ = x;
///         }
///     }
/// }
/// ```
pub trait System: Any + Send + Sync {
    /// Component types an entity must carry to be iterated.
    type Require: ComponentList;
    /// Component types that exclude an entity.
    type Reject: ComponentList;

    /// Processes the bound group. Called with a shared universe
    /// borrow, so mutation from inside a system goes through the
    /// deferred `*_d` API.
    fn run(&mut self, universe: &Universe, group: Group<'_>);
}

/// A registered system and the group it is bound to.
pub(crate) struct SystemEntry {
    pub system: Box<dyn Any + Send + Sync>,
    pub group: GroupId,
}

/// TypeId-keyed registry of systems.
pub(crate) struct SystemManager {
    systems: HashMap<TypeId, SystemEntry>,
}

impl SystemManager {
    pub fn new() -> Self {
        SystemManager {
            systems: HashMap::default(),
        }
    }

    /// Stores `entry` under `S`, returning a replaced entry.
    pub fn insert<S: System>(&mut self, entry: SystemEntry) -> Option<SystemEntry> {
        self.systems.insert(TypeId::of::<S>(), entry)
    }

    pub fn get<S: System>(&self) -> Option<&S> {
        self.systems
            .get(&TypeId::of::<S>())
            .and_then(|entry| entry.system.downcast_ref::<S>())
    }

    pub fn get_mut<S: System>(&mut self) -> Option<&mut S> {
        self.systems
            .get_mut(&TypeId::of::<S>())
            .and_then(|entry| entry.system.downcast_mut::<S>())
    }

    /// Takes the entry out; also used to detach a system for the
    /// duration of a run, so the caller can borrow the universe
    /// while holding the system mutably.
    pub fn remove<S: System>(&mut self) -> Option<SystemEntry> {
        self.systems.remove(&TypeId::of::<S>())
    }

    /// Puts a detached entry back.
    pub fn attach<S: System>(&mut self, entry: SystemEntry) {
        self.systems.insert(TypeId::of::<S>(), entry);
    }

    /// Drops every registered system.
    pub fn reset(&mut self) {
        self.systems.clear();
    }
}
