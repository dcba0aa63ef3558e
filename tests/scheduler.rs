//! Scheduler ordering, one-time init, update strategies, and error
//! propagation.

use std::sync::{Arc, Mutex};

use kinship::family;
use kinship::prelude::*;
use kinship::system::{invoke_individual, invoke_parallel};
use kinship::world::StepError;
use serde::{Deserialize, Serialize};

#[test]
fn systems_run_in_declared_order_on_their_own_timeline() {
  let mut world = world();
  let trace: Trace = Default::default();

  world.add_system(
    "First",
    Timeline::Variable,
    Box::new(Tracer::new("First", trace.clone())),
  );
  world.add_system(
    "Second",
    Timeline::Variable,
    Box::new(Tracer::new("Second", trace.clone())),
  );
  world.add_system(
    "Painter",
    Timeline::Render,
    Box::new(Tracer::new("Painter", trace.clone())),
  );

  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(trace.lock().unwrap().as_slice(), &["First", "Second"]);

  world.step(Timeline::Render, 0.016).unwrap();
  assert_eq!(
    trace.lock().unwrap().as_slice(),
    &["First", "Second", "Painter"]
  );
}

#[test]
fn init_runs_once_before_the_first_update() {
  let mut world = world();
  let inits: Arc<Mutex<u32>> = Default::default();
  world.add_system(
    "Counter",
    Timeline::Variable,
    Box::new(InitCounter {
      inits: inits.clone(),
    }),
  );

  world.step(Timeline::Variable, 0.016).unwrap();
  world.step(Timeline::Variable, 0.016).unwrap();
  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(*inits.lock().unwrap(), 1);
}

#[test]
fn individual_strategy_visits_every_row() {
  let mut world = world();
  for n in 0..4 {
    spawn_mover(&mut world, n as f32);
  }
  world.add_system("Movement", Timeline::Variable, Box::new(Movement::new()));

  world.step(Timeline::Variable, 2.0).unwrap();

  let movers = world.family::<MoverRow>();
  let rows = movers.rows();
  assert_eq!(rows.len(), 4);
  for (n, row) in rows.iter().enumerate() {
    assert_eq!(row.position.borrow().x, n as f32 * 2.0);
  }
}

#[test]
fn parallel_strategy_visits_every_row() {
  let mut world = world();
  for n in 0..8 {
    spawn_mover(&mut world, n as f32);
  }
  world.add_system("Heat", Timeline::Variable, Box::new(HeatDeath::new()));

  world.step(Timeline::Variable, 1.0).unwrap();

  let movers = world.family::<MoverRow>();
  for row in movers.rows().iter() {
    assert_eq!(row.position.borrow().y, 1.0);
  }
}

#[test]
fn pure_system_with_zero_dt_is_idempotent() {
  let mut world = world();
  spawn_mover(&mut world, 3.0);
  world.add_system("Movement", Timeline::Variable, Box::new(Movement::new()));

  world.step(Timeline::Variable, 1.0).unwrap();
  let movers = world.family::<MoverRow>();
  let after_real_step = movers.rows()[0].position.borrow().x;

  world.step(Timeline::Variable, 0.0).unwrap();
  world.step(Timeline::Variable, 0.0).unwrap();
  assert_eq!(movers.rows()[0].position.borrow().x, after_real_step);
}

#[test]
fn a_failing_system_stops_the_step_but_not_the_refresh() {
  let mut world = world();
  let trace: Trace = Default::default();

  world.add_system("Bomb", Timeline::Variable, Box::new(Bomb));
  world.add_system(
    "Never",
    Timeline::Variable,
    Box::new(Tracer::new("Never", trace.clone())),
  );

  // Created before the step; the refresh at the end of the failing step
  // must still spawn it into its families.
  spawn_mover(&mut world, 0.0);

  let err = world.step(Timeline::Variable, 0.016).unwrap_err();
  assert!(matches!(err, StepError::System { ref system, .. } if system == "Bomb"));
  assert!(
    trace.lock().unwrap().is_empty(),
    "systems after the failure are skipped"
  );
  assert_eq!(world.family::<MoverRow>().len(), 1, "the refresh still ran");
}

#[test]
fn strategy_and_access_metadata_survive() {
  let movement = Movement::new();
  assert_eq!(movement.strategy(), Strategy::Individual);
  assert!(movement.access_flags().contains(AccessFlags::PURE));

  let heat = HeatDeath::new();
  assert_eq!(heat.strategy(), Strategy::Parallel);
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

type Trace = Arc<Mutex<Vec<&'static str>>>;

struct Tracer {
  tag: &'static str,
  trace: Trace,
}

impl Tracer {
  fn new(tag: &'static str, trace: Trace) -> Self {
    Self { tag, trace }
  }
}

impl System for Tracer {
  fn update(&mut self, _ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    self.trace.lock().unwrap().push(self.tag);
    Ok(())
  }
}

struct InitCounter {
  inits: Arc<Mutex<u32>>,
}

impl System for InitCounter {
  fn init(&mut self, _binder: &mut SystemBinder<'_>) {
    *self.inits.lock().unwrap() += 1;
  }

  fn update(&mut self, _ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    Ok(())
  }
}

struct Movement {
  movers: Option<FamilyBinding<MoverRow>>,
}

impl Movement {
  fn new() -> Self {
    Self { movers: None }
  }
}

impl System for Movement {
  fn init(&mut self, binder: &mut SystemBinder<'_>) {
    self.movers = Some(binder.bind::<MoverRow>());
  }

  fn update(&mut self, _ctx: &SystemContext<'_>, dt: Time) -> eyre::Result<()> {
    invoke_individual(self.movers.as_ref().unwrap(), |row| {
      let velocity = row.velocity.borrow();
      let mut position = row.position.borrow_mut();
      position.x += velocity.dx * dt as f32;
      position.y += velocity.dy * dt as f32;
    });
    Ok(())
  }

  fn strategy(&self) -> Strategy {
    Strategy::Individual
  }
}

struct HeatDeath {
  movers: Option<FamilyBinding<MoverRow>>,
}

impl HeatDeath {
  fn new() -> Self {
    Self { movers: None }
  }
}

impl System for HeatDeath {
  fn init(&mut self, binder: &mut SystemBinder<'_>) {
    self.movers = Some(binder.bind::<MoverRow>());
  }

  fn update(&mut self, ctx: &SystemContext<'_>, dt: Time) -> eyre::Result<()> {
    invoke_parallel(ctx.worker_pool(), self.movers.as_ref().unwrap(), |row| {
      row.position.borrow_mut().y += dt as f32;
    });
    Ok(())
  }

  fn strategy(&self) -> Strategy {
    Strategy::Parallel
  }
}

struct Bomb;

impl System for Bomb {
  fn update(&mut self, _ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    eyre::bail!("the bomb went off")
  }
}

fn world() -> World {
  let ctx = EcsContext::new();
  ctx.register_component::<Position>();
  ctx.register_component::<Velocity>();
  World::new(ctx)
}

fn spawn_mover(world: &mut World, dx: f32) -> EntityId {
  let mut entity = world.create_entity("mover");
  entity.add_component(Position { x: 0.0, y: 0.0 });
  entity.add_component(Velocity { dx, dy: 0.0 });
  entity.id()
}
