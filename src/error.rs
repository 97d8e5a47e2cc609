//! Orrery error module.
//!
//! There are specific types for errors (e.g. `WrongGeneration`) and
//! additionally one `Error` type that can represent them all. In
//! steady state nothing here crosses the universe boundary as a
//! panic: fallible operations report through `Result`, `Option` or
//! `bool`, and contract breaches trip debug assertions instead.

use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::id::{EIdType, EntityId};

/// The Orrery error type, able to represent every error of this
/// library.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An entity id part did not fit its bit field.
    IdOverflow {
        /// The requested index.
        index: EIdType,
        /// The requested generation.
        generation: EIdType,
    },
    /// The entity table is at `MAX_ENTITIES` and the free list is
    /// empty.
    NoFreeEntities,
    /// Component registration would exceed `MAX_COMPONENTS`.
    RegistryFull,
    /// The component type is already registered in this universe.
    AlreadyRegistered(&'static str),
    /// The component type has not been registered in this universe.
    NotRegistered(&'static str),
    /// Group creation would exceed `MAX_GROUPS`.
    TooManyGroups,
    /// Wrong generation error.
    WrongGeneration(WrongGeneration),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            Error::IdOverflow { index, generation } => write!(
                f,
                "entity id part out of range: index {}, generation {}",
                index, generation
            ),
            Error::NoFreeEntities => write!(f, "no free entity indexes left"),
            Error::RegistryFull => write!(f, "component registry is full"),
            Error::AlreadyRegistered(name) => {
                write!(f, "component type {} is already registered", name)
            }
            Error::NotRegistered(name) => {
                write!(f, "component type {} is not registered", name)
            }
            Error::TooManyGroups => write!(f, "entity group limit reached"),
            Error::WrongGeneration(ref e) => write!(f, "wrong generation: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::WrongGeneration(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<WrongGeneration> for Error {
    fn from(e: WrongGeneration) -> Self {
        Error::WrongGeneration(e)
    }
}

/// Wrong generation error: an operation addressed an `EntityId` whose
/// generation no longer matches the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongGeneration {
    /// The action that failed because of the wrong generation.
    pub action: &'static str,
    /// The generation the table currently holds for this index.
    pub actual_gen: EIdType,
    /// The id that has been passed, containing the index and the
    /// stale generation.
    pub id: EntityId,
}

impl Display for WrongGeneration {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(
            f,
            "tried to {} entity {:?}, but the generation is wrong; it should be {}",
            self.action, self.id, self.actual_gen
        )
    }
}

impl StdError for WrongGeneration {}
