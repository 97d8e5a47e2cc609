#![warn(missing_docs)]

//! # Orrery ECS
//!
//! This library provides an Entity-Component-System runtime built
//! around three ideas:
//!
//! * **Bitset metadata.** Every entity carries a fixed-width
//!   component mask and group mask, so membership filters are a
//!   couple of word operations per entity.
//! * **Deferred change sets.** Any number of threads stage mutations
//!   into their own [`ChangeSet`]s; a single-writer
//!   [`Universe::refresh`] replays the committed sets in a total
//!   order and reconciles the group caches.
//! * **Pluggable storages.** Each component type picks its own
//!   storage through [`Component::Storage`], including a
//!   cache-line-sized [`BPTree`] that doubles as a reusable ordered
//!   map.
//!
//! ```
//! use orrery::{Component, DenseListStorage, Universe};
//!
//! struct Position {
//!     x: f32,
//!     y: f32,
//! }
//!
//! impl Component for Position {
//!     type Storage = DenseListStorage<Self>;
//! }
//!
//! let mut universe = Universe::new();
//! universe.register::<Position>().unwrap();
//!
//! let group = universe.add_get_group::<(Position,), ()>().unwrap();
//! let id = universe.create_entity().unwrap();
//! universe.add_component(id, Position { x: 0.0, y: 0.0 });
//! universe.refresh();
//!
//! assert_eq!(universe.group(group).ids(), &[id]);
//! ```

pub mod bitset;
pub mod btree;
pub mod changeset;
pub mod error;
pub mod group;
pub mod id;
pub mod list;
pub mod prelude;
pub mod storage;
pub mod system;
pub mod universe;

pub use crate::bitset::{ComponentMask, GroupMask, InfoBitset};
pub use crate::btree::BPTree;
pub use crate::changeset::ChangeSet;
pub use crate::error::Error;
pub use crate::group::{ComponentList, Filter, Group, GroupId};
pub use crate::id::{EntityId, TEMP_ENTITY_GEN};
pub use crate::list::{List, SortedList};
pub use crate::storage::{
    BPTreeStorage, ComponentEvent, DenseListStorage, FlaggedStorage, HashMapStorage, Storage,
};
pub use crate::system::System;
pub use crate::universe::{CompId, Component, Entity, TempEntity, Universe, UniverseStats};

/// Number of bits of an [`EntityId`] holding the entity index.
pub const EID_INDEX_BITS: u32 = 24;

/// Number of bits of an [`EntityId`] holding the generation.
pub const EID_GEN_BITS: u32 = 32 - EID_INDEX_BITS;

/// Minimal number of freed entity indexes pending before any gets
/// reused, giving stale ids a window to fail their generation check.
pub const ENT_MIN_FREE: usize = 8;

/// Maximum number of component types per universe; the width of the
/// component bitmask.
pub const MAX_COMPONENTS: usize = 64;

/// Maximum number of entity groups per universe. One bit of the
/// group bitmask is reserved for the activity flag, which is what
/// caps this at 63 rather than 64; a larger bound needs a wider
/// bitset and entity record.
pub const MAX_GROUPS: usize = 63;

/// How many entities share a bitset word; granularity of the mask
/// sweeps.
pub const ENT_BITSET_GROUP_SIZE: usize = 64;
