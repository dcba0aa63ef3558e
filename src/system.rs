//! Systems: units of behavior scheduled per timeline per step.
//!
//! A system binds families during `init`, then gets `update` called once per
//! step of its timeline. Everything it does to the world mid-step goes
//! through the [`SystemContext`]: structural changes are queued for the next
//! refresh, entity messages land next step, system messages route
//! immediately.

use std::sync::RwLock;

use ahash::AHashMap;
use serde::{de::DeserializeOwned, Serialize};
use smol_str::SmolStr;

use crate::binding::FamilyBinding;
use crate::component::{Component, ComponentRef};
use crate::entity::{ComponentMissing, EntityId};
use crate::family::{AnyFamily, FamilyRow};
use crate::messages::{Message, MessageEntry, MessageIndex, OutgoingMessage};
use crate::service::Service;
use crate::system_message::{
  SystemMessageError, SystemMessageReply, SystemMessageSpec,
};
use crate::world::{LazyUpdate, World};

/// Seconds of simulated time handed to each update.
pub type Time = f64;

/// The fixed set of execution phases a host can step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeline {
  Fixed,
  Variable,
  Render,
}

impl Timeline {
  pub const COUNT: usize = 3;
  pub const ALL: [Timeline; Timeline::COUNT] =
    [Timeline::Fixed, Timeline::Variable, Timeline::Render];

  pub fn index(self) -> usize {
    match self {
      Timeline::Fixed => 0,
      Timeline::Variable => 1,
      Timeline::Render => 2,
    }
  }
}

/// How a system's update maps over its main family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
  /// Once per step, no row argument.
  #[default]
  Global,
  /// Once per row of the main family, sequentially; see
  /// [`invoke_individual`].
  Individual,
  /// Once per row, possibly concurrently; see [`invoke_parallel`].
  Parallel,
}

/// Which accessors a system wants. Purely additive; the scheduler only
/// records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(u8);

impl AccessFlags {
  pub const PURE: AccessFlags = AccessFlags(0);
  pub const API: AccessFlags = AccessFlags(1);
  pub const WORLD: AccessFlags = AccessFlags(2);
  pub const RESOURCES: AccessFlags = AccessFlags(4);
  pub const MESSAGE_BRIDGE: AccessFlags = AccessFlags(8);

  pub fn contains(self, other: AccessFlags) -> bool {
    self.0 & other.0 == other.0
  }
}

impl std::ops::BitOr for AccessFlags {
  type Output = AccessFlags;

  fn bitor(self, rhs: AccessFlags) -> AccessFlags {
    AccessFlags(self.0 | rhs.0)
  }
}

/// A unit of behavior run by the scheduler.
///
/// The world drives the base protocol: `init` once (bind families there),
/// then per step of the owning timeline: pending entity messages are
/// delivered, `update` runs, and the system-message inbox drains.
pub trait System: Send + Sync + 'static {
  /// Bind families and register row listeners. Called once, before the
  /// first update; idempotence is handled by the scheduler.
  fn init(&mut self, binder: &mut SystemBinder<'_>) {
    let _ = binder;
  }

  /// One step of behavior. Errors bubble to the host between systems; the
  /// refresh still runs.
  fn update(&mut self, ctx: &SystemContext<'_>, dt: Time) -> eyre::Result<()>;

  /// Declared mapping over the main family. Metadata only: `update` calls
  /// [`invoke_individual`]/[`invoke_parallel`] itself.
  fn strategy(&self) -> Strategy {
    Strategy::Global
  }

  fn access_flags(&self) -> AccessFlags {
    AccessFlags::PURE
  }

  /// Entity-message indices this system wants delivered.
  fn entity_messages_received(&self) -> Vec<MessageIndex> {
    Vec::new()
  }

  /// System-message indices this system can handle.
  fn system_messages_received(&self) -> Vec<MessageIndex> {
    Vec::new()
  }

  /// One entity message, delivered at the start of this system's update
  /// turn, the step after it was sent. `entity` is live and belongs to one
  /// of this system's families.
  fn on_entity_message(
    &mut self,
    msg: &dyn Message,
    entity: EntityId,
    ctx: &SystemContext<'_>,
  ) {
    let _ = (msg, entity, ctx);
  }

  /// One system message. The returned reply feeds the sender's callback;
  /// [`SystemMessageReply::unit`] for messages whose return type is `()`.
  fn on_system_message(
    &mut self,
    msg: &dyn crate::system_message::SystemMessage,
    ctx: &SystemContext<'_>,
  ) -> SystemMessageReply {
    let _ = (msg, ctx);
    SystemMessageReply::unit()
  }
}

/// Handed to [`System::init`] so the system can bind its families. The first
/// family bound is the *main* family: entity messages are delivered against
/// it first.
pub struct SystemBinder<'w> {
  world: &'w World,
  pub(crate) bound: Vec<std::sync::Arc<dyn AnyFamily>>,
}

impl<'w> SystemBinder<'w> {
  pub(crate) fn new(world: &'w World) -> Self {
    Self {
      world,
      bound: Vec::new(),
    }
  }

  pub fn bind<T: FamilyRow>(&mut self) -> FamilyBinding<T> {
    let binding = self.world.family::<T>();
    self.bound.push(binding.erased());
    binding
  }

  pub fn world(&self) -> &World {
    self.world
  }
}

/// A system's access to the world during its update turn.
pub struct SystemContext<'w> {
  pub(crate) world: &'w World,
  pub(crate) system_id: u32,
}

impl<'w> SystemContext<'w> {
  /// Send a message to one entity. It lands in the entity's inbox at the
  /// coming refresh and is observed by interested systems next step.
  pub fn send_message<M: Message>(&self, target: EntityId, msg: M) {
    self.world.enqueue_entity_message(OutgoingMessage {
      target,
      entry: MessageEntry::new(Box::new(msg), M::index(), Some(self.system_id)),
    });
  }

  /// Send a system message without caring about the reply.
  ///
  /// `target` picks one system by name; `None` sends to every capable
  /// system (legal only for multicast messages, where zero recipients is
  /// fine too). Returns how many systems will observe the message.
  pub fn send_system_message<M>(
    &self,
    target: Option<&str>,
    msg: M,
  ) -> Result<usize, SystemMessageError>
  where
    M: SystemMessageSpec + Serialize,
  {
    self.world.route_system_message(Box::new(msg), target, None, None)
  }

  /// Send a system message and run `callback` with each recipient's reply.
  /// For local recipients the callback gets the return value directly; for
  /// remote ones it is invoked with the deserialized bytes the transport
  /// carried back.
  pub fn send_system_message_with<M, F>(
    &self,
    target: Option<&str>,
    msg: M,
    callback: F,
  ) -> Result<usize, SystemMessageError>
  where
    M: SystemMessageSpec + Serialize,
    M::Return: DeserializeOwned,
    F: Fn(M::Return) + Send + Sync + 'static,
  {
    let callback = crate::system_message::typed_callback::<M, F>(callback);
    self
      .world
      .route_system_message(Box::new(msg), target, Some(callback), None)
  }

  /// Send a system message whose reply handler must survive snapshots: the
  /// continuation is referenced by registered name instead of by closure.
  pub fn send_system_message_continuing<M>(
    &self,
    target: Option<&str>,
    msg: M,
    continuation: &str,
  ) -> Result<usize, SystemMessageError>
  where
    M: SystemMessageSpec + Serialize,
  {
    self
      .world
      .route_system_message_continuing(Box::new(msg), target, continuation)
  }

  /// Queue an entity to spawn at the coming refresh.
  pub fn lazy_create(&self) -> LazyEntityBuilder<'_, 'w> {
    LazyEntityBuilder {
      ctx: self,
      name: SmolStr::default(),
      components: Vec::new(),
    }
  }

  /// Queue an entity (and its subtree) to be destroyed at the coming
  /// refresh.
  pub fn lazy_destroy(&self, id: EntityId) {
    self.world.enqueue_lazy(LazyUpdate::Destroy(id));
  }

  /// Queue attaching a component at the coming refresh.
  pub fn lazy_add_component<C: Component>(&self, id: EntityId, component: C) {
    self
      .world
      .enqueue_lazy(LazyUpdate::AddComponent(id, Box::new(component)));
  }

  /// Queue detaching a component at the coming refresh.
  pub fn lazy_remove_component<C: Component>(&self, id: EntityId) {
    self
      .world
      .enqueue_lazy(LazyUpdate::RemoveComponent(id, C::index()));
  }

  pub fn lazy_set_parent(&self, id: EntityId, parent: Option<EntityId>) {
    self.world.enqueue_lazy(LazyUpdate::SetParent(id, parent));
  }

  /// Typed handle to a component of any live entity.
  pub fn component<C: Component>(
    &self,
    entity: EntityId,
  ) -> Result<ComponentRef<C>, ComponentMissing> {
    self.try_component(entity).ok_or(ComponentMissing {
      entity,
      index: C::index(),
      type_name: std::any::type_name::<C>(),
    })
  }

  pub fn try_component<C: Component>(
    &self,
    entity: EntityId,
  ) -> Option<ComponentRef<C>> {
    let guard = self.world.table().read(entity)?;
    guard.component_ref::<C>()
  }

  pub fn is_alive(&self, entity: EntityId) -> bool {
    self
      .world
      .table()
      .read(entity)
      .map(|e| e.is_alive())
      .unwrap_or(false)
  }

  pub fn num_entities(&self) -> usize {
    self.world.num_entities()
  }

  pub fn entity_by_uuid(&self, uuid: &uuid::Uuid) -> Option<EntityId> {
    self.world.table().entity_by_uuid(uuid)
  }

  pub fn service<S: Service>(&self) -> Option<std::sync::Arc<S>> {
    self.world.service::<S>()
  }

  pub fn worker_pool(&self) -> &dyn WorkerPool {
    self.world.worker_pool()
  }
}

/// Builder for entities created from inside a system; the entity spawns at
/// the coming refresh.
#[must_use = "does nothing until .build() is called"]
pub struct LazyEntityBuilder<'a, 'w> {
  ctx: &'a SystemContext<'w>,
  name: SmolStr,
  components: Vec<Box<dyn Component>>,
}

impl LazyEntityBuilder<'_, '_> {
  pub fn named(mut self, name: impl Into<SmolStr>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with<C: Component>(mut self, component: C) -> Self {
    self.components.push(Box::new(component));
    self
  }

  pub fn build(self) {
    self.ctx.world.enqueue_lazy(LazyUpdate::Create {
      name: self.name,
      components: self.components,
    });
  }
}

/// Run `f` for each row of the binding, sequentially. The body of an
/// individual-strategy system's update.
pub fn invoke_individual<T: FamilyRow>(
  binding: &FamilyBinding<T>,
  mut f: impl FnMut(&T),
) {
  for row in binding.rows().iter() {
    f(row);
  }
}

/// Run `f` for each row of the binding, fanned out over the pool. `f` must
/// not touch shared state except through component locks and the messaging
/// API; the pool joins before this returns, per the cooperative tick
/// contract.
pub fn invoke_parallel<T: FamilyRow>(
  pool: &dyn WorkerPool,
  binding: &FamilyBinding<T>,
  f: impl Fn(&T) + Send + Sync,
) {
  let rows = binding.rows();
  pool.parallel_for(rows.len(), &|index| f(&rows[index]));
}

/// The fan-out primitive the parallel strategy needs. The pool must have
/// completed every body invocation before `parallel_for` returns.
pub trait WorkerPool: Send + Sync {
  fn parallel_for(&self, len: usize, body: &(dyn Fn(usize) + Send + Sync));
}

/// Runs everything inline; the default pool.
pub struct SerialPool;

impl WorkerPool for SerialPool {
  fn parallel_for(&self, len: usize, body: &(dyn Fn(usize) + Send + Sync)) {
    for index in 0..len {
      body(index);
    }
  }
}

/// Fans out over rayon's global pool.
#[cfg(feature = "parallel")]
pub struct RayonPool;

#[cfg(feature = "parallel")]
impl WorkerPool for RayonPool {
  fn parallel_for(&self, len: usize, body: &(dyn Fn(usize) + Send + Sync)) {
    use rayon::prelude::*;
    (0..len).into_par_iter().for_each(|index| body(index));
  }
}

type SystemFactory = Box<dyn Fn() -> Box<dyn System> + Send + Sync>;

/// Maps system names to factories, for schema-driven world setup.
pub struct SystemRegistry {
  inner: RwLock<AHashMap<SmolStr, SystemFactory>>,
}

impl SystemRegistry {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(AHashMap::new()),
    }
  }

  pub fn register(
    &self,
    name: impl Into<SmolStr>,
    factory: impl Fn() -> Box<dyn System> + Send + Sync + 'static,
  ) {
    let name = name.into();
    let mut inner = self.inner.write().unwrap();
    if inner.insert(name.clone(), Box::new(factory)).is_some() {
      panic!("a system factory named {:?} was already registered", name);
    }
  }

  /// The `create_system` factory.
  pub fn create(&self, name: &str) -> Result<Box<dyn System>, UnknownSystem> {
    let inner = self.inner.read().unwrap();
    inner
      .get(name)
      .map(|factory| factory())
      .ok_or_else(|| UnknownSystem(SmolStr::new(name)))
  }
}

impl Default for SystemRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Lookup miss in the system registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no system factory registered under the name {0:?}")]
pub struct UnknownSystem(pub SmolStr);
