use super::*;
use crate::id::TEMP_ENTITY_GEN;
use crate::storage::{DenseListStorage, HashMapStorage};
use crate::ENT_MIN_FREE;

#[derive(Debug, PartialEq)]
struct Pos {
    x: f32,
    y: f32,
}

impl Component for Pos {
    type Storage = HashMapStorage<Self>;
}

#[derive(Debug, PartialEq)]
struct Vel {
    dx: f32,
}

impl Component for Vel {
    type Storage = DenseListStorage<Self>;
}

fn universe() -> Universe {
    let mut u = Universe::new();
    u.register::<Pos>().unwrap();
    u.register::<Vel>().unwrap();
    u
}

#[test]
fn empty_universe() {
    let mut u = Universe::new();
    u.register::<Pos>().unwrap();

    let id = u.create_entity().unwrap();
    assert_eq!(id.index(), 0);
    assert_eq!(id.generation(), 0);
    assert!(!u.has_component::<Pos>(id));

    u.refresh();
    assert!(u.entity_valid(id));
    assert!(!u.has_component::<Pos>(id));
    assert_eq!(u.stats().refreshes, 1);
}

#[test]
fn immediate_add_then_match() {
    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.add_component(id, Pos { x: 1.0, y: 2.0 });
    let group = u.add_get_group::<(Pos,), ()>().unwrap();
    u.refresh();

    assert_eq!(u.group(group).ids(), &[id]);
    let entity = u.group(group).iter().next().unwrap();
    assert_eq!(entity.get::<Pos>(), Some(&Pos { x: 1.0, y: 2.0 }));
}

#[test]
fn late_groups_see_settled_entities() {
    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.add_component(id, Pos { x: 0.0, y: 0.0 });
    u.refresh();

    // The entity is long settled; a group created now must still
    // pick it up on the next refresh.
    let group = u.add_get_group::<(Pos,), ()>().unwrap();
    assert!(u.group(group).is_empty());
    u.refresh();
    assert_eq!(u.group(group).ids(), &[id]);
}

#[test]
fn groups_respect_reject_lists() {
    let mut u = universe();
    let both = u.create_entity().unwrap();
    u.add_component(both, Pos { x: 0.0, y: 0.0 });
    u.add_component(both, Vel { dx: 1.0 });
    let only_pos = u.create_entity().unwrap();
    u.add_component(only_pos, Pos { x: 0.0, y: 0.0 });

    let group = u.add_get_group::<(Pos,), (Vel,)>().unwrap();
    u.refresh();

    assert_eq!(u.group(group).ids(), &[only_pos]);
}

#[test]
fn deferred_add_from_two_threads() {
    let u = universe();

    let a_id = std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let temp = u.create_entity_d();
                temp.add_d(Pos { x: 1.0, y: 1.0 });
                u.commit_change_set();
                temp.id()
            })
            .join()
            .unwrap()
    });
    let b_id = std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let temp = u.create_entity_d();
                temp.add_d(Vel { dx: 2.0 });
                u.commit_change_set();
                temp.id()
            })
            .join()
            .unwrap()
    });
    assert!(a_id.is_temp() && b_id.is_temp());

    let mut u = u;
    let pos_group = u.add_get_group::<(Pos,), ()>().unwrap();
    let vel_group = u.add_get_group::<(Vel,), ()>().unwrap();
    u.refresh();

    // Commit order was A then B, so A's entity got the lower index.
    let pos_ids = u.group(pos_group).ids();
    let vel_ids = u.group(vel_group).ids();
    assert_eq!(pos_ids.len(), 1);
    assert_eq!(vel_ids.len(), 1);
    assert!(pos_ids[0].index() < vel_ids[0].index());
    assert_eq!(
        u.get_component::<Pos>(pos_ids[0]),
        Some(&Pos { x: 1.0, y: 1.0 })
    );
    assert_eq!(u.get_component::<Vel>(vel_ids[0]), Some(&Vel { dx: 2.0 }));
    assert_eq!(u.stats().change_sets_committed, 2);
}

#[test]
fn deferred_destroy_leaves_groups() {
    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.add_component(id, Pos { x: 0.0, y: 0.0 });
    u.add_component(id, Vel { dx: 0.0 });
    let g1 = u.add_get_group::<(Pos,), ()>().unwrap();
    let g2 = u.add_get_group::<(Vel,), ()>().unwrap();
    u.refresh();
    assert_eq!(u.group(g1).len(), 1);
    assert_eq!(u.group(g2).len(), 1);

    assert!(u.destroy_entity_d(id));
    u.commit_change_set();
    u.refresh();

    assert!(!u.entity_valid(id));
    assert!(u.group(g1).is_empty());
    assert!(u.group(g2).is_empty());
    assert_eq!(u.group(g1).removed(), &[id]);
    assert_eq!(u.group(g2).removed(), &[id]);

    // The freed index only comes back once enough other indexes are
    // pending on the free list.
    for _ in 0..ENT_MIN_FREE {
        let filler = u.create_entity().unwrap();
        assert_ne!(filler.index(), id.index());
        u.destroy_entity(filler);
    }
    let reused = u.create_entity().unwrap();
    assert_eq!(reused.index(), id.index());
    assert_ne!(reused.generation(), id.generation());
}

#[test]
fn deactivation_removes_from_groups() {
    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.add_component(id, Pos { x: 0.0, y: 0.0 });
    let group = u.add_get_group::<(Pos,), ()>().unwrap();
    u.refresh();
    assert_eq!(u.group(group).len(), 1);

    assert!(u.set_entity_activity(id, false));
    u.refresh();
    assert!(u.group(group).is_empty());
    assert_eq!(u.group(group).removed(), &[id]);
    assert!(u.entity_valid(id));

    u.activate_entity(id);
    u.refresh();
    assert_eq!(u.group(group).ids(), &[id]);
    assert_eq!(u.group(group).added(), &[id]);
}

#[test]
fn change_set_matches_immediate_operations() {
    // Replaying a change set must observably equal performing the
    // same operations immediately on a single thread.
    let mut immediate = universe();
    let a = immediate.create_entity().unwrap();
    immediate.add_component(a, Pos { x: 1.0, y: 0.0 });
    immediate.add_component(a, Vel { dx: 3.0 });
    immediate.remove_component::<Vel>(a);
    immediate.deactivate_entity(a);
    let group_i = immediate.add_get_group::<(Pos,), ()>().unwrap();
    immediate.refresh();

    let mut deferred = universe();
    let group_d = deferred.add_get_group::<(Pos,), ()>().unwrap();
    let mut set = ChangeSet::new();
    let temp = set.create_entity();
    set.add_component_temp(temp, Pos { x: 1.0, y: 0.0 });
    set.add_component_temp(temp, Vel { dx: 3.0 });
    set.remove_component_temp::<Vel>(temp);
    set.deactivate_temp_entity(temp);
    deferred.commit(set);
    deferred.refresh();

    let b = EntityId::new(0, 0);
    assert_eq!(immediate.entity_valid(a), deferred.entity_valid(b));
    assert_eq!(immediate.entity_active(a), deferred.entity_active(b));
    assert_eq!(
        immediate.get_component::<Pos>(a),
        deferred.get_component::<Pos>(b)
    );
    assert_eq!(
        immediate.has_component::<Vel>(a),
        deferred.has_component::<Vel>(b)
    );
    assert_eq!(
        immediate.group(group_i).ids(),
        deferred.group(group_d).ids()
    );
}

#[test]
fn destroy_cancels_later_adds_in_same_cycle() {
    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.refresh();

    u.destroy_entity_d(id);
    u.commit_change_set();
    // A second change set, committed later, tries to mutate the same
    // entity; the earlier destroy wins.
    u.add_component_d(id, Pos { x: 5.0, y: 5.0 });
    u.commit_change_set();
    u.refresh();

    assert!(!u.entity_valid(id));
    assert!(u.get_component::<Pos>(id).is_none());
    assert_eq!(u.stats().actions_skipped, 1);
}

#[test]
fn staged_components_are_visible_before_commit() {
    let u = universe();
    let id = EntityId::new(0, 0);
    u.add_component_d(id, Pos { x: 9.0, y: 0.0 });
    assert!(u.has_component_d::<Pos>(id));
    let x = u.with_staged_component::<Pos, _>(id, |p| p.x);
    assert_eq!(x, Some(9.0));
    u.reset_change_set();
    assert!(!u.has_component_d::<Pos>(id));
}

#[test]
fn abandoned_groups_are_collected() {
    let mut u = universe();
    let group = u.add_get_group::<(Pos,), ()>().unwrap();
    // Same filter: the group is shared and its usage bumped.
    let again = u.add_get_group::<(Pos,), ()>().unwrap();
    assert_eq!(group, again);
    assert_eq!(u.group(group).usage(), 2);

    assert!(!u.abandon_group::<(Pos,), ()>());
    assert!(u.abandon_group::<(Pos,), ()>());
    u.refresh();
    assert!(u.try_group(group).is_none());

    // The freed bit column is recycled by the next group.
    let next = u.add_get_group::<(Vel,), ()>().unwrap();
    assert_eq!(next, group);
}

#[test]
fn generation_exhaustion_retires_indexes() {
    let mut table = entities::EntityTable::new();
    let mut pool: Vec<_> = (0..ENT_MIN_FREE + 1)
        .map(|_| table.create().unwrap())
        .collect();

    // Cycle the same pool of indexes until their generations cap
    // out; each cycle bumps every index's generation by one.
    for _ in 0..TEMP_ENTITY_GEN {
        for id in pool.drain(..).collect::<Vec<_>>() {
            assert!(table.destroy(id));
        }
        for _ in 0..ENT_MIN_FREE + 1 {
            pool.push(table.create().unwrap());
        }
    }

    // Every id handed out keeps a real generation, and the original
    // indexes have been retired in favour of fresh ones.
    for id in &pool {
        assert_ne!(id.generation(), TEMP_ENTITY_GEN);
    }
    assert!(pool.iter().any(|id| id.index() > ENT_MIN_FREE as u32));
}

#[test]
fn run_system_iterates_bound_group() {
    struct Tally {
        seen: usize,
    }

    impl System for Tally {
        type Require = (Pos,);
        type Reject = (Vel,);

        fn run(&mut self, _universe: &Universe, group: Group<'_>) {
            self.seen = group.iter().filter(|e| e.active()).count();
        }
    }

    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.add_component(id, Pos { x: 0.0, y: 0.0 });
    let skip = u.create_entity().unwrap();
    u.add_component(skip, Pos { x: 0.0, y: 0.0 });
    u.add_component(skip, Vel { dx: 1.0 });

    u.add_system(Tally { seen: 0 }).unwrap();
    u.refresh();
    assert!(u.run_system::<Tally>());
    assert_eq!(u.get_system::<Tally>().unwrap().seen, 1);

    assert!(u.remove_system::<Tally>().is_some());
    assert!(!u.run_system::<Tally>());
}

#[test]
fn reset_returns_universe_to_initial_state() {
    let mut u = universe();
    let id = u.create_entity().unwrap();
    u.add_component(id, Pos { x: 0.0, y: 0.0 });
    u.refresh();

    u.reset();
    assert!(!u.entity_valid(id));
    assert!(!u.component_registered::<Pos>());
    assert_eq!(u.stats().refreshes, 0);

    u.register::<Pos>().unwrap();
    let fresh = u.create_entity().unwrap();
    assert_eq!(fresh.index(), 0);
}
