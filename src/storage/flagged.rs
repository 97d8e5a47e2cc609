//! Wrapper storage that tracks modifications, insertions and removals
//! of components through an event channel.

use shrev::{EventChannel, EventIterator, ReaderId};

use crate::id::EntityId;
use crate::storage::Storage;

/// An event produced by a [`FlaggedStorage`] mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEvent {
    /// A component was inserted for the entity.
    Inserted(EntityId),
    /// A component was accessed mutably.
    Modified(EntityId),
    /// A component was removed from the entity.
    Removed(EntityId),
}

/// Wrapper storage that publishes a [`ComponentEvent`] for every
/// mutation of the inner storage.
///
/// Group deltas report membership changes per filter; this reports
/// value changes per storage. Note that `get_mut` flags the component
/// as modified whether or not it is actually written through.
pub struct FlaggedStorage<T, S = super::DenseListStorage<T>> {
    channel: EventChannel<ComponentEvent>,
    storage: S,
    marker: std::marker::PhantomData<T>,
}

impl<T, S: Default> Default for FlaggedStorage<T, S> {
    fn default() -> Self {
        FlaggedStorage {
            channel: EventChannel::new(),
            storage: S::default(),
            marker: std::marker::PhantomData,
        }
    }
}

impl<T, S> FlaggedStorage<T, S> {
    /// Registers a new reader of the event stream. Events are kept
    /// until every registered reader has seen them.
    pub fn register_reader(&mut self) -> ReaderId<ComponentEvent> {
        self.channel.register_reader()
    }

    /// Reads the events recorded since `reader` last looked.
    pub fn read(&self, reader: &mut ReaderId<ComponentEvent>) -> EventIterator<'_, ComponentEvent> {
        self.channel.read(reader)
    }

    /// The raw event channel.
    pub fn channel(&self) -> &EventChannel<ComponentEvent> {
        &self.channel
    }

    /// Mutable access to the raw event channel.
    pub fn channel_mut(&mut self) -> &mut EventChannel<ComponentEvent> {
        &mut self.channel
    }
}

impl<T, S> Storage<T> for FlaggedStorage<T, S>
where
    T: Send + Sync + 'static,
    S: Storage<T>,
{
    fn add(&mut self, id: EntityId, value: T) -> &mut T {
        let event = if self.storage.has(id) {
            ComponentEvent::Modified(id)
        } else {
            ComponentEvent::Inserted(id)
        };
        self.channel.single_write(event);
        self.storage.add(id, value)
    }

    fn get(&self, id: EntityId) -> Option<&T> {
        self.storage.get(id)
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        let value = self.storage.get_mut(id)?;
        self.channel.single_write(ComponentEvent::Modified(id));
        Some(value)
    }

    fn has(&self, id: EntityId) -> bool {
        self.storage.has(id)
    }

    fn remove(&mut self, id: EntityId) -> bool {
        let removed = self.storage.remove(id);
        if removed {
            self.channel.single_write(ComponentEvent::Removed(id));
        }
        removed
    }

    fn refresh(&mut self) {
        self.storage.refresh();
    }

    fn clear(&mut self) {
        self.storage.clear();
    }

    fn len(&self) -> usize {
        self.storage.len()
    }
}
