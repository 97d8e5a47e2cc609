//! Prelude module
//!
//! Contains all of the most common traits and structures.

pub use crate::changeset::ChangeSet;
pub use crate::group::{ComponentList, Filter, Group, GroupId};
pub use crate::id::EntityId;
pub use crate::storage::{
    BPTreeStorage, ComponentEvent, DenseListStorage, FlaggedStorage, HashMapStorage, Storage,
};
pub use crate::system::System;
pub use crate::universe::{Component, Entity, TempEntity, Universe};
pub use crate::BPTree;

#[cfg(feature = "parallel")]
pub use rayon::iter::ParallelIterator;
