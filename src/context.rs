//! The shared registries a world is built against.
//!
//! One [`EcsContext`] holds the mask storage and every factory table. Hosts
//! that run multiple isolated worlds hand them the same context (cheap, and
//! it keeps mask handles comparable across worlds) or build separate ones.
//! All tables are append-only after warmup; reads take no exclusive locks.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::component::{Component, ComponentRegistry};
use crate::mask::MaskRegistry;
use crate::messages::{Message, MessageRegistry};
use crate::system::{System, SystemRegistry};
use crate::system_message::{
  CallbackPayload, ContinuationRegistry, SystemMessageRegistry,
  SystemMessageSpec,
};
use crate::world::World;

pub struct EcsContext {
  masks: MaskRegistry,
  components: ComponentRegistry,
  messages: MessageRegistry,
  system_messages: SystemMessageRegistry,
  systems: SystemRegistry,
  continuations: ContinuationRegistry,
}

impl EcsContext {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      masks: MaskRegistry::new(),
      components: ComponentRegistry::new(),
      messages: MessageRegistry::new(),
      system_messages: SystemMessageRegistry::new(),
      systems: SystemRegistry::new(),
      continuations: ContinuationRegistry::new(),
    })
  }

  pub fn masks(&self) -> &MaskRegistry {
    &self.masks
  }

  pub fn components(&self) -> &ComponentRegistry {
    &self.components
  }

  pub fn messages(&self) -> &MessageRegistry {
    &self.messages
  }

  pub fn system_messages(&self) -> &SystemMessageRegistry {
    &self.system_messages
  }

  pub fn systems(&self) -> &SystemRegistry {
    &self.systems
  }

  pub fn continuations(&self) -> &ContinuationRegistry {
    &self.continuations
  }

  /// Register a component type with snapshot serde.
  pub fn register_component<C>(&self)
  where
    C: Component + Serialize + DeserializeOwned,
  {
    self.components.register::<C>();
  }

  /// Register a component type that never leaves memory.
  pub fn register_transient_component<C: Component>(&self) {
    self.components.register_transient::<C>();
  }

  pub fn register_message<M>(&self)
  where
    M: Message + Serialize + DeserializeOwned,
  {
    self.messages.register::<M>();
  }

  pub fn register_system_message<M>(&self)
  where
    M: SystemMessageSpec + Serialize + DeserializeOwned,
    M::Return: Serialize,
  {
    self.system_messages.register::<M>();
  }

  pub fn register_system(
    &self,
    name: impl Into<smol_str::SmolStr>,
    factory: impl Fn() -> Box<dyn System> + Send + Sync + 'static,
  ) {
    self.systems.register(name, factory);
  }

  pub fn register_continuation(
    &self,
    name: impl Into<smol_str::SmolStr>,
    f: impl Fn(&World, CallbackPayload) + Send + Sync + 'static,
  ) {
    self.continuations.register(name, f);
  }
}
