//! The world: entities, families, systems per timeline, and the refresh
//! that makes structural changes visible.
//!
//! One thread drives `step` at a time. Inside a step, systems only see the
//! world through shared borrows; everything structural funnels through the
//! lazy-update channel and lands at the refresh that closes the step.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ahash::AHashSet;
use crossbeam::channel;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::binding::FamilyBinding;
use crate::component::{Component, ComponentIndex};
use crate::context::EcsContext;
use crate::entity::{EntityId, EntityRef};
use crate::family::{
  AnyFamily, FamilyImpl, FamilyRow, RefreshDuringIteration,
};
use crate::mask::{MaskBits, MaskHandle};
use crate::messages::{MessageEntry, MessageIndex, OutgoingMessage};
use crate::schema::{EcsSchema, SystemMethod};
use crate::service::{Service, ServiceMap};
use crate::system::{
  SerialPool, System, SystemBinder, SystemContext, Time, Timeline,
  UnknownSystem, WorkerPool,
};
use crate::system_message::{
  CallbackPayload, OutboundSystemMessage, SystemMessage, SystemMessageCallback,
  SystemMessageContext, SystemMessageError, SystemMessageTransport,
};
use crate::table::EntityTable;

/// How many steps an undelivered entity message survives by default.
const DEFAULT_MESSAGE_TTL: u32 = 3;

/// A step failed. The refresh has still run, so family invariants hold.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
  #[error("system {system:?} failed")]
  System {
    system: SmolStr,
    #[source]
    source: eyre::Report,
  },
  #[error(transparent)]
  Refresh(#[from] RefreshDuringIteration),
}

pub(crate) enum LazyUpdate {
  Create {
    name: SmolStr,
    components: Vec<Box<dyn Component>>,
  },
  Destroy(EntityId),
  AddComponent(EntityId, Box<dyn Component>),
  RemoveComponent(EntityId, ComponentIndex),
  SetParent(EntityId, Option<EntityId>),
  Reload(EntityId),
}

struct FamilyRecord {
  /// `TypeId` of the row type; the family cache key.
  tid: std::any::TypeId,
  typed: Arc<dyn std::any::Any + Send + Sync>,
  erased: Arc<dyn AnyFamily>,
}

/// World-side per-system record: what the "generated base class" owns in
/// codegen-heavy engines lives here.
pub(crate) struct SystemHost {
  pub id: u32,
  pub name: SmolStr,
  pub system: Box<dyn System>,
  pub initialised: bool,
  /// Bound at init, in binding order; index 0 is the main family.
  pub families: Vec<Arc<dyn AnyFamily>>,
  pub entity_interests: Vec<MessageIndex>,
  pub inbox: SharedSystemInbox,
}

pub(crate) type SharedSystemInbox =
  Arc<Mutex<VecDeque<Arc<SystemMessageContext>>>>;

/// Routing info the world keeps outside the host list, so sends can resolve
/// recipients while the hosts themselves are being stepped.
pub(crate) struct SystemSlot {
  pub name: SmolStr,
  pub system_interests: Vec<MessageIndex>,
  pub inbox: SharedSystemInbox,
}

struct StepTimer {
  total: Duration,
  samples: u32,
}

impl StepTimer {
  const fn new() -> Self {
    Self {
      total: Duration::ZERO,
      samples: 0,
    }
  }

  fn record(&mut self, elapsed: Duration) {
    self.total += elapsed;
    self.samples += 1;
  }

  fn average(&self) -> Option<Duration> {
    (self.samples > 0).then(|| self.total / self.samples)
  }
}

pub struct World {
  context: Arc<EcsContext>,
  table: EntityTable,
  families: RwLock<Vec<FamilyRecord>>,
  systems: [Vec<SystemHost>; Timeline::COUNT],
  pub(crate) directory: RwLock<Vec<SystemSlot>>,
  next_system_id: u32,

  lazy_tx: channel::Sender<LazyUpdate>,
  lazy_rx: channel::Receiver<LazyUpdate>,
  entity_msg_tx: channel::Sender<OutgoingMessage>,
  entity_msg_rx: channel::Receiver<OutgoingMessage>,

  services: ServiceMap,
  worker_pool: Box<dyn WorkerPool>,
  transport: Option<Arc<dyn SystemMessageTransport>>,
  message_ttl: u32,
  timers: [StepTimer; Timeline::COUNT],
}

impl World {
  pub fn new(context: Arc<EcsContext>) -> World {
    let (lazy_tx, lazy_rx) = channel::unbounded();
    let (entity_msg_tx, entity_msg_rx) = channel::unbounded();
    Self {
      context,
      table: EntityTable::new(),
      families: RwLock::new(Vec::new()),
      systems: [Vec::new(), Vec::new(), Vec::new()],
      directory: RwLock::new(Vec::new()),
      next_system_id: 0,
      lazy_tx,
      lazy_rx,
      entity_msg_tx,
      entity_msg_rx,
      services: ServiceMap::default(),
      worker_pool: Box::new(SerialPool),
      transport: None,
      message_ttl: DEFAULT_MESSAGE_TTL,
      timers: [StepTimer::new(), StepTimer::new(), StepTimer::new()],
    }
  }

  pub fn context(&self) -> &EcsContext {
    &self.context
  }

  pub(crate) fn table(&self) -> &EntityTable {
    &self.table
  }

  pub(crate) fn table_mut(&mut self) -> &mut EntityTable {
    &mut self.table
  }

  // === entities ===

  /// Create a pending entity; it spawns (and joins families) at the next
  /// refresh.
  pub fn create_entity(&mut self, name: impl Into<SmolStr>) -> EntityRef<'_> {
    let id = self.table.create(None, name);
    EntityRef { world: self, id }
  }

  /// Like [`create_entity`](Self::create_entity) with an
  /// externally-assigned UUID, for prefab and snapshot paths.
  pub fn create_entity_with_uuid(
    &mut self,
    uuid: Uuid,
    name: impl Into<SmolStr>,
  ) -> EntityRef<'_> {
    let id = self.table.create(Some(uuid), name);
    EntityRef { world: self, id }
  }

  /// Mark an entity and its subtree for destruction at the next refresh.
  pub fn destroy_entity(&mut self, id: EntityId) {
    self.table.destroy(id);
  }

  pub fn entity(&mut self, id: EntityId) -> Option<EntityRef<'_>> {
    self.table.contains(id).then(|| EntityRef { world: self, id })
  }

  pub fn entity_by_uuid(&mut self, uuid: &Uuid) -> Option<EntityRef<'_>> {
    let id = self.table.entity_by_uuid(uuid)?;
    Some(EntityRef { world: self, id })
  }

  pub fn num_entities(&self) -> usize {
    self.table.num_entities()
  }

  /// Attach an already-boxed component, for prefab and snapshot loading.
  pub(crate) fn attach_boxed(
    &mut self,
    id: EntityId,
    component: Box<dyn Component>,
  ) {
    let index = component.component_index();
    if !self.context.components().is_registered(index) {
      panic!(
        "tried to attach an unregistered component (index {:?}) to {:?}",
        index, id
      );
    }
    let mut became_dirty = false;
    if let Some(mut entity) = self.table.write(id) {
      entity.attach(index, crate::component::new_entry(component));
      entity.dirty = true;
      became_dirty = true;
    }
    if became_dirty {
      self.table.note_dirty(id);
    }
  }

  /// Every live entity instantiated from the given prefab.
  pub(crate) fn instances_of_prefab(&self, prefab: Uuid) -> Vec<EntityId> {
    self
      .table
      .iter_live()
      .filter(|(_, entity)| entity.prefab_uuid() == Some(prefab))
      .map(|(id, _)| id)
      .collect()
  }

  /// Promote pending entities without running a full refresh. Use with
  /// care; families stay stale until the next refresh.
  pub fn spawn_pending(&mut self) {
    self.table.spawn_pending();
  }

  // === families ===

  /// The family for a row type, created (and back-filled from live
  /// entities) on first request. One instance exists per row type.
  pub fn family<T: FamilyRow>(&self) -> FamilyBinding<T> {
    let tid = std::any::TypeId::of::<T>();
    {
      let families = self.families.read().unwrap();
      if let Some(record) = families.iter().find(|record| record.tid == tid) {
        let typed = record
          .typed
          .clone()
          .downcast::<FamilyImpl<T>>()
          .ok()
          .expect("family record holds the wrong row type");
        return FamilyBinding::new(typed, self.context.masks());
      }
    }

    let family = Arc::new(FamilyImpl::<T>::new(self.context.masks()));
    let erased: Arc<dyn AnyFamily> = family.clone();

    // Back-fill from entities that already match.
    let inclusion_bits = self.context.masks().bits(erased.inclusion_mask());
    for (_, entity) in self.table.iter_live() {
      if entity.current_bits().contains(&inclusion_bits) {
        erased
          .add_entity(&entity)
          .expect("fresh family cannot be iterated yet");
      }
    }
    erased
      .update_entities(&self.table)
      .expect("fresh family cannot be iterated yet");

    let mut families = self.families.write().unwrap();
    // Double-checked: someone may have created it while we back-filled.
    if let Some(record) = families.iter().find(|record| record.tid == tid) {
      let typed = record
        .typed
        .clone()
        .downcast::<FamilyImpl<T>>()
        .ok()
        .expect("family record holds the wrong row type");
      return FamilyBinding::new(typed, self.context.masks());
    }
    families.push(FamilyRecord {
      tid,
      typed: family.clone(),
      erased,
    });
    FamilyBinding::new(family, self.context.masks())
  }

  // === systems ===

  /// Append a system to a timeline. Order of addition is execution order.
  pub fn add_system(
    &mut self,
    name: impl Into<SmolStr>,
    timeline: Timeline,
    system: Box<dyn System>,
  ) -> u32 {
    let name = name.into();
    let id = self.next_system_id;
    self.next_system_id += 1;

    let inbox: SharedSystemInbox = Arc::new(Mutex::new(VecDeque::new()));
    self.directory.write().unwrap().push(SystemSlot {
      name: name.clone(),
      system_interests: system.system_messages_received(),
      inbox: inbox.clone(),
    });
    let entity_interests = system.entity_messages_received();
    tracing::debug!(system = %name, ?timeline, "system added");
    self.systems[timeline.index()].push(SystemHost {
      id,
      name,
      system,
      initialised: false,
      families: Vec::new(),
      entity_interests,
      inbox,
    });
    id
  }

  /// Instantiate every generated system the schema lists, through the
  /// context's system factories. Update-method systems go on the variable
  /// timeline, render-method ones on the render timeline.
  pub fn add_systems_from_schema(
    &mut self,
    schema: &EcsSchema,
  ) -> Result<(), UnknownSystem> {
    for sys in &schema.systems {
      let system = self.context.systems().create(&sys.name)?;
      let timeline = match sys.method {
        SystemMethod::Update => Timeline::Variable,
        SystemMethod::Render => Timeline::Render,
      };
      self.add_system(sys.name.clone(), timeline, system);
    }
    Ok(())
  }

  pub fn has_systems_on_timeline(&self, timeline: Timeline) -> bool {
    !self.systems[timeline.index()].is_empty()
  }

  pub fn average_step_time(&self, timeline: Timeline) -> Option<Duration> {
    self.timers[timeline.index()].average()
  }

  // === services, pools, transports ===

  pub fn add_service<S: Service>(
    &mut self,
    name: impl Into<SmolStr>,
    service: Arc<S>,
  ) {
    self.services.add(name, service);
  }

  pub fn service<S: Service>(&self) -> Option<Arc<S>> {
    self.services.get::<S>()
  }

  pub fn has_service_named(&self, name: &str) -> bool {
    self.services.contains_name(name)
  }

  pub fn set_worker_pool(&mut self, pool: Box<dyn WorkerPool>) {
    self.worker_pool = pool;
  }

  pub fn worker_pool(&self) -> &dyn WorkerPool {
    &*self.worker_pool
  }

  pub fn set_transport(&mut self, transport: Arc<dyn SystemMessageTransport>) {
    self.transport = Some(transport);
  }

  /// How many steps an undelivered entity message survives.
  pub fn set_message_ttl(&mut self, ttl: u32) {
    self.message_ttl = ttl.max(1);
  }

  // === stepping ===

  /// Run one step of a timeline: init systems once, then for each system in
  /// order deliver its pending entity messages, update it, and drain its
  /// system-message inbox. The refresh runs afterwards no matter what.
  pub fn step(&mut self, timeline: Timeline, dt: Time) -> Result<(), StepError> {
    let started = Instant::now();
    let span = tracing::debug_span!("step", ?timeline, dt);
    let _enter = span.enter();

    let mut hosts = std::mem::take(&mut self.systems[timeline.index()]);
    let mut failure = None;

    for host in hosts.iter_mut() {
      if !host.initialised {
        let mut binder = SystemBinder::new(self);
        host.system.init(&mut binder);
        host.families = binder.bound;
        host.initialised = true;
      }

      self.deliver_entity_messages(host);

      let ctx = SystemContext {
        world: self,
        system_id: host.id,
      };
      if let Err(source) = host.system.update(&ctx, dt) {
        tracing::error!(system = %host.name, error = %source, "system failed");
        failure = Some(StepError::System {
          system: host.name.clone(),
          source,
        });
        break;
      }

      self.drain_system_messages(host);
    }

    self.systems[timeline.index()] = hosts;

    // The refresh runs even after a failure so family invariants hold.
    let refreshed = self.refresh();
    self.timers[timeline.index()].record(started.elapsed());

    match failure {
      Some(err) => Err(err),
      None => refreshed.map_err(StepError::from),
    }
  }

  /// Hand the system every message in the inboxes of entities that belong
  /// to its families, in (family row order, enqueue order).
  fn deliver_entity_messages(&self, host: &mut SystemHost) {
    if host.entity_interests.is_empty() {
      return;
    }
    let mut seen: AHashSet<EntityId> = AHashSet::new();
    for family in &host.families {
      for id in family.entity_ids() {
        if !seen.insert(id) {
          continue;
        }
        let mut inbox = {
          let Some(mut entity) = self.table.write(id) else {
            continue;
          };
          // An entity destroyed earlier this step keeps its row until the
          // refresh, but its messages die with it.
          if !entity.is_alive() {
            continue;
          }
          let wanted = entity
            .inbox
            .iter()
            .any(|entry| host.entity_interests.contains(&entry.index));
          if !wanted {
            continue;
          }
          std::mem::take(&mut entity.inbox)
        };
        let ctx = SystemContext {
          world: self,
          system_id: host.id,
        };
        for entry in inbox.iter_mut() {
          if host.entity_interests.contains(&entry.index) {
            host.system.on_entity_message(&*entry.msg, id, &ctx);
            entry.consumed = true;
          }
        }

        if let Some(mut entity) = self.table.write(id) {
          entity.inbox = inbox;
        }
      }
    }
  }

  fn drain_system_messages(&self, host: &mut SystemHost) {
    loop {
      let next = host.inbox.lock().unwrap().pop_front();
      let Some(context) = next else { break };
      let ctx = SystemContext {
        world: self,
        system_id: host.id,
      };
      tracing::trace!(system = %host.name, index = ?context.index, "system message delivered");
      let reply = host.system.on_system_message(&*context.msg, &ctx);
      if let Some(callback) = &context.callback {
        callback(self, CallbackPayload::Local(reply.0));
      }
    }
  }

  // === message routing ===

  pub(crate) fn enqueue_entity_message(&self, outgoing: OutgoingMessage) {
    self.entity_msg_tx.send(outgoing).unwrap();
  }

  /// Send an entity message from outside any system (host-side).
  pub fn send_message_to_entity<M: crate::messages::Message>(
    &self,
    target: EntityId,
    msg: M,
  ) {
    self.enqueue_entity_message(OutgoingMessage {
      target,
      entry: MessageEntry::new(Box::new(msg), M::index(), None),
    });
  }

  /// Entity message arriving from a remote peer: deserialized through the
  /// message registry, then queued like any local send.
  pub fn receive_remote_entity_message(
    &self,
    target: EntityId,
    index: MessageIndex,
    payload: &[u8],
  ) -> eyre::Result<()> {
    let msg = self.context.messages().deserialize(index, payload)?;
    self.enqueue_entity_message(OutgoingMessage {
      target,
      entry: MessageEntry::new(msg, index, None),
    });
    Ok(())
  }

  pub(crate) fn route_system_message(
    &self,
    msg: Box<dyn SystemMessage>,
    target: Option<&str>,
    callback: Option<SystemMessageCallback>,
    continuation: Option<SmolStr>,
  ) -> Result<usize, SystemMessageError> {
    let index = msg.message_index();
    let destination = msg.destination();

    if !destination.is_local() {
      let transport = self
        .transport
        .as_ref()
        .ok_or(SystemMessageError::NoTransport { index })?;
      let payload = self
        .context
        .system_messages()
        .serialize(&*msg)
        .map_err(|err| SystemMessageError::Serialize {
          index,
          reason: err.to_string(),
        })?;
      transport.deliver(OutboundSystemMessage {
        destination,
        target_system: target.map(SmolStr::new),
        index,
        payload,
        callback,
      });
      return Ok(0);
    }

    let context = Arc::new(SystemMessageContext {
      index,
      msg,
      callback,
      continuation,
      remote: false,
    });
    self.route_shared_system_message(context, target)
  }

  pub(crate) fn route_system_message_continuing(
    &self,
    msg: Box<dyn SystemMessage>,
    target: Option<&str>,
    continuation: &str,
  ) -> Result<usize, SystemMessageError> {
    let callback =
      self.context.continuations().get(continuation).ok_or_else(|| {
        SystemMessageError::UnknownContinuation(SmolStr::new(continuation))
      })?;
    self.route_system_message(
      msg,
      target,
      Some(callback),
      Some(SmolStr::new(continuation)),
    )
  }

  /// Send a system message from outside any system (host-side or test
  /// harness). Same routing rules as sends from systems.
  pub fn send_system_message<M>(
    &self,
    target: Option<&str>,
    msg: M,
  ) -> Result<usize, SystemMessageError>
  where
    M: crate::system_message::SystemMessageSpec + serde::Serialize,
  {
    self.route_system_message(Box::new(msg), target, None, None)
  }

  /// Host-side send whose reply handler is a registered continuation, so it
  /// survives snapshots taken while the message is still queued.
  pub fn send_system_message_continuing<M>(
    &self,
    target: Option<&str>,
    msg: M,
    continuation: &str,
  ) -> Result<usize, SystemMessageError>
  where
    M: crate::system_message::SystemMessageSpec + serde::Serialize,
  {
    self.route_system_message_continuing(Box::new(msg), target, continuation)
  }

  /// System message arriving from a remote peer. `reply` is invoked with
  /// each recipient's serialized return value.
  pub fn receive_remote_system_message(
    &self,
    target: Option<&str>,
    index: MessageIndex,
    payload: &[u8],
    reply: impl Fn(Vec<u8>) + Send + Sync + 'static,
  ) -> Result<usize, SystemMessageError> {
    let msg = self
      .context
      .system_messages()
      .deserialize(index, payload)
      .map_err(|err| SystemMessageError::Serialize {
        index,
        reason: err.to_string(),
      })?;

    let callback: SystemMessageCallback =
      Arc::new(move |world: &World, payload: CallbackPayload| match payload {
        CallbackPayload::Local(any) => {
          match world
            .context
            .system_messages()
            .serialize_reply(index, &*any)
          {
            Ok(bytes) => reply(bytes),
            Err(err) => tracing::error!(
              ?index,
              error = %err,
              "could not serialize system message reply for transport"
            ),
          }
        }
        CallbackPayload::Remote(bytes) => reply(bytes),
      });

    let context = Arc::new(SystemMessageContext {
      index,
      msg,
      callback: Some(callback),
      continuation: None,
      remote: true,
    });
    self.route_shared_system_message(context, target)
  }

  /// Route an already-built shared context; used by remote receipt and
  /// snapshot reload.
  pub(crate) fn route_shared_system_message(
    &self,
    context: Arc<SystemMessageContext>,
    target: Option<&str>,
  ) -> Result<usize, SystemMessageError> {
    let index = context.index;
    let directory = self.directory.read().unwrap();
    let recipients: Vec<&SystemSlot> = directory
      .iter()
      .filter(|slot| {
        slot.system_interests.contains(&index)
          && target.map_or(true, |t| slot.name == t)
      })
      .collect();

    if !context.msg.is_multicast() {
      match recipients.len() {
        1 => {}
        0 => {
          return Err(SystemMessageError::NoRecipient {
            index,
            target: target.map(SmolStr::new),
          })
        }
        count => {
          return Err(SystemMessageError::AmbiguousRecipient { index, count })
        }
      }
    }

    for slot in &recipients {
      slot.inbox.lock().unwrap().push_back(context.clone());
    }
    Ok(recipients.len())
  }

  pub(crate) fn enqueue_lazy(&self, update: LazyUpdate) {
    self.lazy_tx.send(update).unwrap();
  }

  // === refresh ===

  /// The single point where structural mutation becomes visible to
  /// families.
  pub fn refresh(&mut self) -> Result<(), RefreshDuringIteration> {
    // Apply the step's queued structural changes.
    let updates: Vec<LazyUpdate> = self.lazy_rx.try_iter().collect();
    for update in updates {
      self.apply_lazy(update);
    }

    // Families only need attention when something spawned or changed.
    if self.table.has_work() {
      self.refresh_families()?;
    }

    // Age surviving inbox messages, then land the step's sends at age 0.
    self.table.sweep_inboxes(self.message_ttl);
    let outgoing: Vec<OutgoingMessage> = self.entity_msg_rx.try_iter().collect();
    for OutgoingMessage { target, entry } in outgoing {
      match self.table.write(target) {
        Some(mut entity) if entity.is_alive() => entity.inbox.push(entry),
        // Dead or unknown target: dropped silently.
        _ => {}
      }
    }

    Ok(())
  }

  fn refresh_families(&mut self) -> Result<(), RefreshDuringIteration> {
    let just_spawned: AHashSet<EntityId> =
      self.table.spawn_pending().into_iter().collect();

    let dirty = self.table.take_dirty();
    if !dirty.is_empty() {
      tracing::debug!(count = dirty.len(), "refreshing dirty entities");
    }

    // Re-derive masks and diff them against each family.
    let masks = self.context.masks();
    for &id in &dirty {
      let Some(entity) = self.table.read(id) else { continue };
      let spawned_now = just_spawned.contains(&id);
      let old_mask = if spawned_now {
        MaskHandle::EMPTY
      } else {
        entity.mask
      };
      let in_world = entity.is_alive() && !entity.pending;
      let new_mask = if in_world {
        masks.intern(entity.current_bits())
      } else {
        MaskHandle::EMPTY
      };
      let removed_bits = entity.removed_bits;
      let was_reloaded = entity.reloaded;

      let families = self.families.read().unwrap();
      for record in families.iter() {
        let family = &record.erased;
        let inclusion = family.inclusion_mask();
        // Pending entities were never family members, even when the old
        // (empty) mask would satisfy an all-optional family.
        let was =
          !spawned_now && !entity.pending && masks.contains(old_mask, inclusion);
        let is = in_world && masks.contains(new_mask, inclusion);
        match (was, is) {
          (false, true) => family.add_entity(&entity)?,
          (true, false) => family.mark_removed(id)?,
          (true, true) => {
            let inclusion_bits = masks.bits(inclusion);
            if !removed_bits.intersection(&inclusion_bits).is_empty() {
              // A required component was detached and put back within one
              // step: the row dies and a fresh one (fresh anchor) appends.
              family.mark_removed(id)?;
              family.add_entity(&entity)?;
            } else if was_reloaded
              || masks.changed_between(old_mask, new_mask, family.combined_mask())
            {
              family.mark_reload(id)?;
            }
          }
          (false, false) => {}
        }
      }
      drop(families);
      drop(entity);

      if let Some(mut entity) = self.table.write(id) {
        entity.mask = new_mask;
      }
    }

    // Let every family apply adds, reloads, and the batched removals.
    {
      let families = self.families.read().unwrap();
      for record in families.iter() {
        record.erased.update_entities(&self.table)?;
      }
    }

    // Tear down destroyed entities now that the notifications are out.
    for &id in &dirty {
      let alive = match self.table.read(id) {
        Some(entity) => entity.is_alive(),
        None => continue,
      };
      if !alive {
        self.table.free_slot(id);
      }
    }

    // Dirty bookkeeping clears only after the family notifications.
    for &id in &dirty {
      if let Some(mut entity) = self.table.write(id) {
        entity.dirty = false;
        entity.reloaded = false;
        entity.removed_bits = MaskBits::EMPTY;
      }
    }

    Ok(())
  }

  fn apply_lazy(&mut self, update: LazyUpdate) {
    match update {
      LazyUpdate::Create { name, components } => {
        let id = self.table.create(None, name);
        let mut entity = self.table.write(id).expect("entity just created");
        for component in components {
          let index = component.component_index();
          if !self.context.components().is_registered(index) {
            panic!(
              "tried to spawn an entity with an unregistered component (index {:?})",
              index
            );
          }
          entity.attach(index, crate::component::new_entry(component));
        }
      }
      LazyUpdate::Destroy(id) => self.table.destroy(id),
      LazyUpdate::AddComponent(id, component) => {
        let index = component.component_index();
        if !self.context.components().is_registered(index) {
          panic!(
            "tried to add an unregistered component (index {:?}) to {:?}",
            index, id
          );
        }
        let mut became_dirty = false;
        if let Some(mut entity) = self.table.write(id) {
          entity.attach(index, crate::component::new_entry(component));
          entity.dirty = true;
          became_dirty = true;
        }
        if became_dirty {
          self.table.note_dirty(id);
        }
      }
      LazyUpdate::RemoveComponent(id, index) => {
        let mut became_dirty = false;
        if let Some(mut entity) = self.table.write(id) {
          if entity.detach(index) {
            entity.dirty = true;
            became_dirty = true;
          }
        }
        if became_dirty {
          self.table.note_dirty(id);
        }
      }
      LazyUpdate::SetParent(id, parent) => self.table.set_parent(id, parent),
      LazyUpdate::Reload(id) => {
        let mut became_dirty = false;
        if let Some(mut entity) = self.table.write(id) {
          entity.reloaded = true;
          entity.dirty = true;
          became_dirty = true;
        }
        if became_dirty {
          self.table.note_dirty(id);
        }
      }
    }
  }
}
