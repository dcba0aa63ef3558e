//! Family membership, batched removal, optional components, and weak rows.

use std::sync::{Arc, Mutex};

use kinship::binding::SingleRowError;
use kinship::family;
use kinship::prelude::*;
use serde::{Deserialize, Serialize};

#[test]
fn membership_follows_masks() {
  let mut world = world();
  let movers = world.family::<MoverRow>();

  let e1 = spawn(&mut world, "e1", true, true);
  let e2 = spawn(&mut world, "e2", true, false);
  world.refresh().unwrap();

  assert_eq!(movers.len(), 1);
  assert_eq!(movers.rows()[0].entity_id(), e1);

  world
    .entity(e2)
    .unwrap()
    .add_component(Velocity { dx: 1.0, dy: 0.0 });
  world.refresh().unwrap();

  assert_eq!(movers.len(), 2);
  let rows = movers.rows();
  assert_eq!(rows[0].entity_id(), e1);
  assert_eq!(rows[1].entity_id(), e2);
}

#[test]
fn batched_removal_keeps_survivors_and_notifies_once() {
  let mut world = world();
  let movers = world.family::<MoverRow>();

  let e1 = spawn(&mut world, "e1", true, true);
  let e2 = spawn(&mut world, "e2", true, true);
  let e3 = spawn(&mut world, "e3", true, true);
  world.refresh().unwrap();
  assert_eq!(movers.len(), 3);

  let removed_batches: Arc<Mutex<Vec<Vec<EntityId>>>> = Default::default();
  let sink = removed_batches.clone();
  movers.on_rows_removed(move |rows| {
    sink
      .lock()
      .unwrap()
      .push(rows.iter().map(|row| row.entity_id()).collect());
  });

  world.entity(e1).unwrap().remove_component::<Velocity>();
  world.entity(e3).unwrap().remove_component::<Velocity>();
  world.refresh().unwrap();

  assert_eq!(movers.len(), 1);
  assert_eq!(movers.rows()[0].entity_id(), e2);

  let batches = removed_batches.lock().unwrap();
  assert_eq!(batches.len(), 1, "both removals arrive in one batch");
  assert_eq!(batches[0].len(), 2);
  assert!(batches[0].contains(&e1));
  assert!(batches[0].contains(&e3));
}

#[test]
fn remove_then_readd_keeps_the_fresh_row() {
  let mut world = world();
  let movers = world.family::<MoverRow>();

  let e1 = spawn(&mut world, "e1", true, true);
  let e2 = spawn(&mut world, "e2", true, true);
  let e3 = spawn(&mut world, "e3", true, true);
  world.refresh().unwrap();

  let mut entity = world.entity(e1).unwrap();
  entity.remove_component::<Velocity>();
  entity.add_component(Velocity { dx: 2.0, dy: 0.0 });
  world.refresh().unwrap();

  // The fresh row is appended at the tail and then swapped into the slot
  // the dead row freed; the removal scan must take the older row, not the
  // fresh one.
  let rows = movers.rows();
  let order: Vec<EntityId> = rows.iter().map(|row| row.entity_id()).collect();
  assert_eq!(order, vec![e1, e2, e3]);
  assert_eq!(rows[0].velocity.borrow().dx, 2.0, "the surviving row is the fresh one");
}

#[test]
fn readding_within_one_step_retires_old_weak_handles() {
  let mut world = world();
  let movers = world.family::<MoverRow>();

  let e1 = spawn(&mut world, "e1", true, true);
  world.refresh().unwrap();

  let stale = movers.rows()[0].weak_handle();
  assert!(movers.try_resolve(stale).is_some());

  let mut entity = world.entity(e1).unwrap();
  entity.remove_component::<Velocity>();
  entity.add_component(Velocity { dx: 0.5, dy: 0.5 });
  world.refresh().unwrap();

  assert_eq!(movers.len(), 1, "one row per matching entity");
  assert!(
    movers.try_resolve(stale).is_none(),
    "the old row's handles go absent"
  );
  assert!(movers.resolve(stale).is_err());

  let fresh = movers.rows()[0].weak_handle();
  assert_eq!(movers.try_resolve(fresh).unwrap().entity_id(), e1);
}

#[test]
fn single_requires_exactly_one_row() {
  let mut world = world();
  let movers = world.family::<MoverRow>();

  assert!(matches!(movers.single(), Err(SingleRowError::FamilyEmpty)));

  spawn(&mut world, "e1", true, true);
  world.refresh().unwrap();
  let e1_pos = movers.single().unwrap().position.borrow().x;
  assert_eq!(e1_pos, 0.0);

  spawn(&mut world, "e2", true, true);
  world.refresh().unwrap();
  assert!(matches!(
    movers.single(),
    Err(SingleRowError::FamilyAmbiguous(2))
  ));
}

#[test]
fn optional_component_changes_reload_instead_of_removing() {
  let mut world = world();
  let sighted = world.family::<SightedRow>();

  let e = spawn(&mut world, "e", true, false);
  world.refresh().unwrap();
  assert_eq!(sighted.len(), 1);
  assert!(sighted.rows()[0].velocity.is_none());

  let reloads = Arc::new(Mutex::new(0usize));
  let removals = Arc::new(Mutex::new(0usize));
  {
    let reloads = reloads.clone();
    sighted.on_rows_reloaded(move |rows| {
      *reloads.lock().unwrap() += rows.len();
    });
    let removals = removals.clone();
    sighted.on_rows_removed(move |rows| {
      *removals.lock().unwrap() += rows.len();
    });
  }

  world
    .entity(e)
    .unwrap()
    .add_component(Velocity { dx: 3.0, dy: 0.0 });
  world.refresh().unwrap();
  assert_eq!(sighted.len(), 1);
  assert!(sighted.rows()[0].velocity.is_some());
  assert_eq!(*reloads.lock().unwrap(), 1);
  assert_eq!(*removals.lock().unwrap(), 0);

  world.entity(e).unwrap().remove_component::<Velocity>();
  world.refresh().unwrap();
  assert_eq!(sighted.len(), 1, "optional bits never evict the row");
  assert!(sighted.rows()[0].velocity.is_none());
  assert_eq!(*reloads.lock().unwrap(), 2);
  assert_eq!(*removals.lock().unwrap(), 0);
}

#[test]
fn untouched_rows_stay_put_across_steps() {
  let mut world = world();
  let movers = world.family::<MoverRow>();

  let e1 = spawn(&mut world, "e1", true, true);
  let e2 = spawn(&mut world, "e2", true, true);
  world.refresh().unwrap();

  let before: Vec<(EntityId, RowAnchor)> = movers
    .rows()
    .iter()
    .map(|row| (row.entity_id(), row.anchor()))
    .collect();

  world.step(Timeline::Variable, 0.016).unwrap();
  world.step(Timeline::Variable, 0.016).unwrap();

  let after: Vec<(EntityId, RowAnchor)> = movers
    .rows()
    .iter()
    .map(|row| (row.entity_id(), row.anchor()))
    .collect();
  assert_eq!(before, after);
  assert_eq!(after[0].0, e1);
  assert_eq!(after[1].0, e2);
}

#[test]
fn destroying_an_entity_removes_all_its_rows() {
  let mut world = world();
  let movers = world.family::<MoverRow>();
  let sighted = world.family::<SightedRow>();

  let e = spawn(&mut world, "e", true, true);
  world.refresh().unwrap();
  assert_eq!(movers.len(), 1);
  assert_eq!(sighted.len(), 1);

  world.destroy_entity(e);
  world.refresh().unwrap();
  assert_eq!(movers.len(), 0);
  assert_eq!(sighted.len(), 0);
  assert_eq!(world.num_entities(), 0);
}

#[test]
fn families_backfill_from_live_entities() {
  let mut world = world();
  spawn(&mut world, "early", true, true);
  world.refresh().unwrap();

  // Bound after the entity already spawned.
  let movers = world.family::<MoverRow>();
  assert_eq!(movers.len(), 1);
}

// === fixtures ===

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 0, name = "position")]
struct Position {
  x: f32,
  y: f32,
}

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 1, name = "velocity")]
struct Velocity {
  dx: f32,
  dy: f32,
}

family! {
  struct MoverRow {
    required {
      position: write Position,
      velocity: read Velocity,
    }
  }
}

family! {
  struct SightedRow {
    required {
      position: read Position,
    }
    optional {
      velocity: Velocity,
    }
  }
}

fn world() -> World {
  let ctx = EcsContext::new();
  ctx.register_component::<Position>();
  ctx.register_component::<Velocity>();
  World::new(ctx)
}

fn spawn(
  world: &mut World,
  name: &str,
  with_position: bool,
  with_velocity: bool,
) -> EntityId {
  let mut entity = world.create_entity(name);
  if with_position {
    entity.add_component(Position { x: 0.0, y: 0.0 });
  }
  if with_velocity {
    entity.add_component(Velocity { dx: 1.0, dy: 1.0 });
  }
  entity.id()
}
