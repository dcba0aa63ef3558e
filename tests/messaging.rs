//! Both messaging planes: next-step entity delivery, TTL aging, multicast
//! system messages with replies, and unicast recipient checks.

use std::sync::{Arc, Mutex};

use kinship::family;
use kinship::prelude::*;
use kinship::system_message::SystemMessageError;
use serde::{Deserialize, Serialize};

#[test]
fn entity_messages_arrive_exactly_once_next_step() {
  let mut world = world();
  let e = spawn_hull(&mut world);
  world.refresh().unwrap();

  let log: DamageLog = Default::default();
  world.add_system(
    "DamageTaker",
    Timeline::Variable,
    Box::new(DamageTaker {
      hulls: None,
      log: log.clone(),
    }),
  );
  world.add_system(
    "DamageDealer",
    Timeline::Variable,
    Box::new(DamageDealer {
      target: e,
      sent: false,
    }),
  );

  world.step(Timeline::Variable, 0.016).unwrap();
  assert!(log.lock().unwrap().is_empty(), "delivery is never same-step");

  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(log.lock().unwrap().as_slice(), &[(e, 7)]);

  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(
    log.lock().unwrap().len(),
    1,
    "a consumed message is delivered exactly once"
  );
}

#[test]
fn messages_to_destroyed_entities_drop_silently() {
  let mut world = world();
  let e = spawn_hull(&mut world);
  world.refresh().unwrap();

  let log: DamageLog = Default::default();
  world.add_system(
    "DamageTaker",
    Timeline::Variable,
    Box::new(DamageTaker {
      hulls: None,
      log: log.clone(),
    }),
  );
  world.add_system(
    "DamageDealer",
    Timeline::Variable,
    Box::new(DamageDealer {
      target: e,
      sent: false,
    }),
  );

  // The send lands in e's inbox at this step's refresh …
  world.step(Timeline::Variable, 0.016).unwrap();
  // … but e dies before the next step delivers it.
  world.destroy_entity(e);
  world.step(Timeline::Variable, 0.016).unwrap();
  world.step(Timeline::Variable, 0.016).unwrap();

  assert!(log.lock().unwrap().is_empty());
}

#[test]
fn unconsumed_messages_age_by_one_per_step_then_drop() {
  let mut world = world();
  world.set_message_ttl(2);
  let e = spawn_hull(&mut world);
  world.refresh().unwrap();

  world.send_message_to_entity(e, Damage { amount: 1 });
  world.refresh().unwrap();
  assert_eq!(
    world.entity(e).unwrap().message_inbox(),
    vec![(Damage::index(), 0)]
  );

  world.refresh().unwrap();
  assert_eq!(
    world.entity(e).unwrap().message_inbox(),
    vec![(Damage::index(), 1)]
  );

  world.refresh().unwrap();
  assert!(
    world.entity(e).unwrap().message_inbox().is_empty(),
    "nothing consumed it within the TTL"
  );
}

#[test]
fn multicast_reaches_sender_and_later_systems_in_one_step() {
  let mut world = world();

  let observed: Arc<Mutex<Vec<u32>>> = Default::default();
  let replies: Arc<Mutex<Vec<u32>>> = Default::default();

  world.add_system(
    "CensusA",
    Timeline::Variable,
    Box::new(CensusSystem {
      tag: 1,
      send: true,
      sent: false,
      observed: observed.clone(),
      replies: replies.clone(),
    }),
  );
  world.add_system(
    "CensusB",
    Timeline::Variable,
    Box::new(CensusSystem {
      tag: 2,
      send: false,
      sent: false,
      observed: observed.clone(),
      replies: replies.clone(),
    }),
  );

  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(
    observed.lock().unwrap().as_slice(),
    &[1, 2],
    "self-delivery lands the same step, then the later system"
  );
  assert_eq!(replies.lock().unwrap().as_slice(), &[1, 2]);

  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(observed.lock().unwrap().len(), 2, "delivered exactly once");
}

#[test]
fn unicast_requires_exactly_one_recipient() {
  let ctx = context();
  let mut world = World::new(ctx.clone());

  // Nobody handles it yet.
  assert!(matches!(
    world.send_system_message(None, Audit { probe: 1 }),
    Err(SystemMessageError::NoRecipient { .. })
  ));

  let observed: Arc<Mutex<Vec<u32>>> = Default::default();
  world.add_system(
    "AuditorA",
    Timeline::Variable,
    Box::new(Auditor {
      observed: observed.clone(),
    }),
  );
  assert_eq!(world.send_system_message(None, Audit { probe: 2 }).unwrap(), 1);
  world.step(Timeline::Variable, 0.016).unwrap();
  assert_eq!(observed.lock().unwrap().as_slice(), &[2]);

  world.add_system(
    "AuditorB",
    Timeline::Variable,
    Box::new(Auditor {
      observed: observed.clone(),
    }),
  );
  assert!(matches!(
    world.send_system_message(None, Audit { probe: 3 }),
    Err(SystemMessageError::AmbiguousRecipient { count: 2, .. })
  ));

  // Naming one of the two makes it unambiguous again.
  assert_eq!(
    world
      .send_system_message(Some("AuditorB"), Audit { probe: 4 })
      .unwrap(),
    1
  );
}

// === fixtures ===

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 0, name = "hull")]
struct Hull {
  hits: u32,
}

family! {
  struct HullRow {
    required {
      hull: write Hull,
    }
  }
}

#[derive(Message, Serialize, Deserialize, Clone, Debug)]
#[message(index = 0)]
struct Damage {
  amount: u32,
}

#[derive(SystemMessage, Serialize, Deserialize, Debug)]
#[system_message(index = 0, multicast, returns = u32)]
struct Census;

#[derive(SystemMessage, Serialize, Deserialize, Debug, PartialEq)]
#[system_message(index = 1, returns = u32)]
struct Audit {
  probe: u32,
}

type DamageLog = Arc<Mutex<Vec<(EntityId, u32)>>>;

struct DamageDealer {
  target: EntityId,
  sent: bool,
}

impl System for DamageDealer {
  fn update(&mut self, ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    if !self.sent {
      ctx.send_message(self.target, Damage { amount: 7 });
      self.sent = true;
    }
    Ok(())
  }
}

struct DamageTaker {
  hulls: Option<FamilyBinding<HullRow>>,
  log: DamageLog,
}

impl System for DamageTaker {
  fn init(&mut self, binder: &mut SystemBinder<'_>) {
    self.hulls = Some(binder.bind::<HullRow>());
  }

  fn update(&mut self, _ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    Ok(())
  }

  fn entity_messages_received(&self) -> Vec<MessageIndex> {
    vec![Damage::index()]
  }

  fn on_entity_message(
    &mut self,
    msg: &dyn Message,
    entity: EntityId,
    _ctx: &SystemContext<'_>,
  ) {
    let damage = msg.downcast_ref::<Damage>().unwrap();
    self.log.lock().unwrap().push((entity, damage.amount));
  }
}

struct CensusSystem {
  tag: u32,
  send: bool,
  sent: bool,
  observed: Arc<Mutex<Vec<u32>>>,
  replies: Arc<Mutex<Vec<u32>>>,
}

impl System for CensusSystem {
  fn update(&mut self, ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    if self.send && !self.sent {
      let replies = self.replies.clone();
      ctx.send_system_message_with(None, Census, move |tag: u32| {
        replies.lock().unwrap().push(tag);
      })?;
      self.sent = true;
    }
    Ok(())
  }

  fn system_messages_received(&self) -> Vec<MessageIndex> {
    vec![<Census as SystemMessage>::index()]
  }

  fn on_system_message(
    &mut self,
    _msg: &dyn SystemMessage,
    _ctx: &SystemContext<'_>,
  ) -> SystemMessageReply {
    self.observed.lock().unwrap().push(self.tag);
    SystemMessageReply::value(self.tag)
  }
}

struct Auditor {
  observed: Arc<Mutex<Vec<u32>>>,
}

impl System for Auditor {
  fn update(&mut self, _ctx: &SystemContext<'_>, _dt: Time) -> eyre::Result<()> {
    Ok(())
  }

  fn system_messages_received(&self) -> Vec<MessageIndex> {
    vec![<Audit as SystemMessage>::index()]
  }

  fn on_system_message(
    &mut self,
    msg: &dyn SystemMessage,
    _ctx: &SystemContext<'_>,
  ) -> SystemMessageReply {
    let audit = msg.downcast_ref::<Audit>().unwrap();
    self.observed.lock().unwrap().push(audit.probe);
    SystemMessageReply::value(audit.probe)
  }
}

fn context() -> Arc<EcsContext> {
  let ctx = EcsContext::new();
  ctx.register_component::<Hull>();
  ctx.register_message::<Damage>();
  ctx.register_system_message::<Census>();
  ctx.register_system_message::<Audit>();
  ctx
}

fn world() -> World {
  World::new(context())
}

fn spawn_hull(world: &mut World) -> EntityId {
  let mut entity = world.create_entity("hulk");
  entity.add_component(Hull { hits: 0 });
  entity.id()
}
