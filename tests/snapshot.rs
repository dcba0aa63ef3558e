//! Snapshotting a world and replaying it into a fresh one.

use std::sync::{Arc, Mutex};

use kinship::prelude::*;
use kinship::system_message::CallbackPayload;
use serde::{Deserialize, Serialize};

#[test]
fn snapshot_restores_entities_inboxes_and_pending_callbacks() {
  let fanfares: Arc<Mutex<Vec<u32>>> = Default::default();
  let ctx = context(fanfares.clone());

  let mut world = World::new(ctx.clone());
  world.add_system("Celebrant", Timeline::Variable, Box::new(Celebrant));

  let mut ids = Vec::new();
  for n in 0..100u32 {
    let mut entity = world.create_entity(format!("citizen-{n}").as_str());
    entity.add_component(Score { points: n });
    ids.push(entity.id());
  }
  world.refresh().unwrap();

  // A bit of hierarchy and a partition tag.
  world.entity(ids[1]).unwrap().set_parent(Some(ids[0]));
  world.entity(ids[0]).unwrap().set_world_partition(5);

  // Three live entity messages …
  for n in 0..3 {
    world.send_message_to_entity(ids[n], Nudge { delta: n as i32 });
  }
  world.refresh().unwrap();

  // … and two system messages with snapshot-safe callbacks, still queued.
  for _ in 0..2 {
    world
      .send_system_message_continuing(
        Some("Celebrant"),
        Fanfare,
        "record-fanfare",
      )
      .unwrap();
  }

  let snapshot = world.snapshot().unwrap();
  let uuid_0 = world.entity(ids[0]).unwrap().uuid();
  let uuid_1 = world.entity(ids[1]).unwrap().uuid();
  drop(world);

  let mut reloaded = World::new(ctx);
  reloaded.add_system("Celebrant", Timeline::Variable, Box::new(Celebrant));
  reloaded.load_snapshot(&snapshot).unwrap();

  assert_eq!(reloaded.num_entities(), 100);

  // Identity, content, hierarchy, partition.
  let id_0 = reloaded.entity_by_uuid(&uuid_0).unwrap().id();
  let e1 = reloaded.entity_by_uuid(&uuid_1).unwrap();
  assert_eq!(e1.parent(), Some(id_0));
  assert_eq!(e1.world_partition(), 5, "propagated from the parent");
  assert_eq!(
    e1.get_component::<Score>().unwrap().borrow().points,
    1
  );
  let e1_id = e1.id();
  assert_eq!(
    reloaded
      .entity(e1_id)
      .unwrap()
      .message_inbox()
      .first()
      .map(|(index, _)| *index),
    Some(Nudge::index())
  );

  // The queued callbacks fire on the next step.
  assert!(fanfares.lock().unwrap().is_empty());
  reloaded.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(fanfares.lock().unwrap().as_slice(), &[7, 7]);
}

#[test]
fn snapshot_reload_snapshot_is_identity() {
  let fanfares: Arc<Mutex<Vec<u32>>> = Default::default();
  let ctx = context(fanfares);

  let mut world = World::new(ctx.clone());
  world.add_system("Celebrant", Timeline::Variable, Box::new(Celebrant));
  for n in 0..5u32 {
    let mut entity = world.create_entity(format!("citizen-{n}").as_str());
    entity.add_component(Score { points: n * 10 });
  }
  world.refresh().unwrap();
  let someone = world.snapshot().unwrap().entities[2].uuid;
  let someone_id = world.entity_by_uuid(&someone).unwrap().id();
  world.send_message_to_entity(someone_id, Nudge { delta: -4 });
  world.refresh().unwrap();
  world
    .send_system_message_continuing(Some("Celebrant"), Fanfare, "record-fanfare")
    .unwrap();

  let first = world.snapshot().unwrap();
  drop(world);

  let mut reloaded = World::new(ctx);
  reloaded.add_system("Celebrant", Timeline::Variable, Box::new(Celebrant));
  reloaded.load_snapshot(&first).unwrap();
  let second = reloaded.snapshot().unwrap();

  assert_eq!(first, second);
}

#[test]
fn non_serializable_entities_stay_out_of_snapshots() {
  let fanfares: Arc<Mutex<Vec<u32>>> = Default::default();
  let ctx = context(fanfares);

  let mut world = World::new(ctx);
  world
    .create_entity("kept")
    .add_component(Score { points: 1 });
  world
    .create_entity("transient")
    .add_component(Score { points: 2 })
    .set_serializable(false);
  world.refresh().unwrap();

  let snapshot = world.snapshot().unwrap();
  assert_eq!(snapshot.entities.len(), 1);
  assert_eq!(snapshot.entities[0].name, "kept");
}

// === fixtures ===

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 0, name = "score")]
struct Score {
  points: u32,
}

#[derive(Message, Serialize, Deserialize, Clone, Debug)]
#[message(index = 0)]
struct Nudge {
  delta: i32,
}

#[derive(SystemMessage, Serialize, Deserialize, Debug)]
#[system_message(index = 0, returns = u32)]
struct Fanfare;

struct Celebrant;

impl System for Celebrant {
  fn update(&mut self, _ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    Ok(())
  }

  fn system_messages_received(&self) -> Vec<MessageIndex> {
    vec![<Fanfare as SystemMessage>::index()]
  }

  fn on_system_message(
    &mut self,
    _msg: &dyn SystemMessage,
    _ctx: &SystemContext<'_>,
  ) -> SystemMessageReply {
    SystemMessageReply::value(7u32)
  }
}

fn context(fanfares: Arc<Mutex<Vec<u32>>>) -> Arc<EcsContext> {
  let ctx = EcsContext::new();
  ctx.register_component::<Score>();
  ctx.register_message::<Nudge>();
  ctx.register_system_message::<Fanfare>();
  ctx.register_continuation("record-fanfare", move |_world, payload| {
    if let CallbackPayload::Local(any) = payload {
      if let Ok(value) = any.downcast::<u32>() {
        fanfares.lock().unwrap().push(*value);
      }
    }
  });
  ctx
}
