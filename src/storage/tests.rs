use super::*;
use crate::id::EntityId;

#[derive(Debug, Clone, PartialEq)]
struct Mass(f32);

fn id(index: u32) -> EntityId {
    EntityId::new(index, 0)
}

fn contract_round_trip<S: Storage<Mass> + Default>() {
    let mut storage = S::default();
    assert!(storage.is_empty());
    assert!(storage.get(id(3)).is_none());

    storage.add(id(3), Mass(1.0));
    storage.add(id(1), Mass(2.0));
    assert_eq!(storage.len(), 2);
    assert!(storage.has(id(3)));
    assert_eq!(storage.get(id(1)), Some(&Mass(2.0)));

    // `add` replaces an existing value.
    storage.add(id(3), Mass(9.0));
    assert_eq!(storage.len(), 2);
    assert_eq!(storage.get(id(3)), Some(&Mass(9.0)));

    storage.get_mut(id(1)).unwrap().0 = 4.0;
    assert_eq!(storage.get(id(1)), Some(&Mass(4.0)));

    assert!(storage.remove(id(3)));
    assert!(!storage.remove(id(3)));
    assert!(!storage.has(id(3)));

    // Refresh must preserve the contract.
    storage.refresh();
    assert_eq!(storage.get(id(1)), Some(&Mass(4.0)));

    storage.clear();
    assert!(storage.is_empty());
}

#[test]
fn hash_map_storage_contract() {
    contract_round_trip::<HashMapStorage<Mass>>();
}

#[test]
fn dense_list_storage_contract() {
    contract_round_trip::<DenseListStorage<Mass>>();
}

#[test]
fn btree_storage_contract() {
    contract_round_trip::<BPTreeStorage<Mass>>();
}

#[test]
fn flagged_storage_contract() {
    contract_round_trip::<FlaggedStorage<Mass>>();
}

#[test]
fn dense_list_reuses_freed_slots() {
    let mut storage = DenseListStorage::<Mass>::default();
    for i in 0..4 {
        storage.add(id(i), Mass(i as f32));
    }
    storage.remove(id(1));
    storage.remove(id(2));
    // New adds must fill the two freed slots before growing.
    storage.add(id(7), Mass(7.0));
    storage.add(id(8), Mass(8.0));
    assert_eq!(storage.len(), 4);
    assert_eq!(storage.get(id(7)), Some(&Mass(7.0)));
    assert_eq!(storage.get(id(0)), Some(&Mass(0.0)));
}

#[test]
fn dense_list_compacts_on_refresh() {
    let mut storage = DenseListStorage::<Mass>::default();
    for i in 0..16 {
        storage.add(id(i), Mass(i as f32));
    }
    for i in 0..12 {
        storage.remove(id(i));
    }
    storage.refresh();
    for i in 12..16 {
        assert_eq!(storage.get(id(i)), Some(&Mass(i as f32)));
    }
    assert_eq!(storage.len(), 4);
}

#[test]
fn flagged_storage_emits_events_in_order() {
    let mut storage = FlaggedStorage::<Mass>::default();
    let mut reader = storage.register_reader();

    storage.add(id(0), Mass(1.0));
    storage.add(id(0), Mass(2.0));
    let _ = storage.get_mut(id(0));
    storage.remove(id(0));
    storage.remove(id(0));

    let events: Vec<_> = storage.read(&mut reader).cloned().collect();
    assert_eq!(
        events,
        vec![
            ComponentEvent::Inserted(id(0)),
            ComponentEvent::Modified(id(0)),
            ComponentEvent::Modified(id(0)),
            ComponentEvent::Removed(id(0)),
        ]
    );
}
