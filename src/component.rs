//! Data attachable to [entities](crate::entity) that families index by and
//! systems read and write through typed rows.

use std::any::TypeId;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;
use downcast::{downcast, Any};
use serde::{de::DeserializeOwned, Serialize};
use smol_str::SmolStr;

use crate::{entity::EntityId, lock_panic};

/// Dense index assigned to each component type by the schema compiler.
///
/// Must be below [`MASK_BITS`](crate::MASK_BITS).
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  serde::Serialize,
  serde::Deserialize,
)]
pub struct ComponentIndex(pub u16);

/// Plain data attached to an [`Entity`](crate::entity::Entity).
///
/// The runtime only ever sees components through `dyn Component`; typed
/// access goes through the row loaders emitted by
/// [`family!`](crate::family!). Use `#[derive(Component)]` with
/// `#[component(index = N)]` rather than implementing this by hand.
pub trait Component: Any + Send + Sync {
  /// The dense index for this component type.
  fn index() -> ComponentIndex
  where
    Self: Sized;

  /// The name used by prefabs and snapshots.
  fn name() -> &'static str
  where
    Self: Sized;

  /// The index, through a type-erased handle.
  fn component_index(&self) -> ComponentIndex;
}
downcast!(dyn Component);

/// How a component is stored once attached: behind a shared lock so that
/// family rows can hold onto it across refreshes. The `Box` is the
/// type-erased owner; dropping the last clone runs the destructor.
pub type ComponentEntry = Arc<RwLock<Box<dyn Component>>>;

pub(crate) fn new_entry(component: Box<dyn Component>) -> ComponentEntry {
  Arc::new(RwLock::new(component))
}

/// A typed handle to one component of one entity, as held by a family row.
///
/// The handle stays valid across refreshes for as long as the component is
/// attached; mutating the component goes through [`ComponentRef::borrow_mut`]
/// so that the single-threaded tick and the parallel row strategy share one
/// code path.
pub struct ComponentRef<C: Component> {
  entry: ComponentEntry,
  owner: EntityId,
  _phantom: PhantomData<fn() -> C>,
}

impl<C: Component> ComponentRef<C> {
  /// The caller must have checked that `entry` holds a `C`; the entity's
  /// component list is keyed by `C::index()`, which the schema compiler keeps
  /// unique per type.
  #[doc(hidden)]
  pub fn new(entry: ComponentEntry, owner: EntityId) -> Self {
    debug_assert_eq!(
      entry.try_read().map(|c| c.component_index()).ok(),
      Some(C::index()),
    );
    Self {
      entry,
      owner,
      _phantom: PhantomData,
    }
  }

  pub fn borrow(&self) -> ComponentReadGuard<'_, C> {
    let lock = self
      .entry
      .try_read()
      .unwrap_or_else(|_| lock_panic(self.owner, std::any::type_name::<C>()));
    ComponentReadGuard(lock, PhantomData)
  }

  pub fn borrow_mut(&self) -> ComponentWriteGuard<'_, C> {
    let lock = self
      .entry
      .try_write()
      .unwrap_or_else(|_| lock_panic(self.owner, std::any::type_name::<C>()));
    ComponentWriteGuard(lock, PhantomData)
  }

  pub fn owner(&self) -> EntityId {
    self.owner
  }
}

impl<C: Component> Clone for ComponentRef<C> {
  fn clone(&self) -> Self {
    Self {
      entry: self.entry.clone(),
      owner: self.owner,
      _phantom: PhantomData,
    }
  }
}

/// Read guard returned by [`ComponentRef::borrow`].
pub struct ComponentReadGuard<'a, C>(
  RwLockReadGuard<'a, Box<dyn Component>>,
  PhantomData<&'a C>,
);

impl<C: Component> std::ops::Deref for ComponentReadGuard<'_, C> {
  type Target = C;

  fn deref(&self) -> &Self::Target {
    // SAFETY: the type was checked when the ComponentRef was built.
    unsafe { self.0.downcast_ref().unwrap_unchecked() }
  }
}

/// Write guard returned by [`ComponentRef::borrow_mut`].
pub struct ComponentWriteGuard<'a, C>(
  RwLockWriteGuard<'a, Box<dyn Component>>,
  PhantomData<&'a mut C>,
);

impl<C: Component> std::ops::Deref for ComponentWriteGuard<'_, C> {
  type Target = C;

  fn deref(&self) -> &Self::Target {
    // SAFETY: the type was checked when the ComponentRef was built.
    unsafe { self.0.downcast_ref().unwrap_unchecked() }
  }
}

impl<C: Component> std::ops::DerefMut for ComponentWriteGuard<'_, C> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    // SAFETY: the type was checked when the ComponentRef was built.
    unsafe { self.0.downcast_mut().unwrap_unchecked() }
  }
}

type SerializeFn = fn(&dyn Component) -> eyre::Result<Vec<u8>>;
type DeserializeFn = fn(&[u8]) -> eyre::Result<Box<dyn Component>>;

/// Everything the runtime knows about one component index: the name used by
/// prefabs and snapshots, the in-memory size, and byte-level serde.
///
/// This table stands in for a destructor table: dropping the boxed
/// component runs the real destructor, and everything else that used to need
/// per-type erased calls lives here.
#[derive(Clone)]
pub struct ComponentReflector {
  pub index: ComponentIndex,
  pub name: SmolStr,
  pub size: usize,
  serialize: Option<SerializeFn>,
  deserialize: Option<DeserializeFn>,
}

impl ComponentReflector {
  pub fn is_serializable(&self) -> bool {
    self.serialize.is_some()
  }

  pub fn serialize(&self, component: &dyn Component) -> eyre::Result<Vec<u8>> {
    match self.serialize {
      Some(ser) => ser(component),
      None => Err(eyre::eyre!(
        "component type {:?} is not serializable",
        self.name
      )),
    }
  }

  pub fn deserialize(&self, data: &[u8]) -> eyre::Result<Box<dyn Component>> {
    match self.deserialize {
      Some(deser) => deser(data),
      None => Err(eyre::eyre!(
        "component type {:?} is not serializable",
        self.name
      )),
    }
  }
}

fn serialize_erased<C: Component + Serialize>(
  component: &dyn Component,
) -> eyre::Result<Vec<u8>> {
  let concrete = component
    .downcast_ref::<C>()
    .map_err(|_| eyre::eyre!("component index points at the wrong type"))?;
  Ok(bincode::serialize(concrete)?)
}

fn deserialize_erased<C: Component + DeserializeOwned>(
  data: &[u8],
) -> eyre::Result<Box<dyn Component>> {
  let concrete: C = bincode::deserialize(data)?;
  Ok(Box::new(concrete) as _)
}

/// Maps dense component indices (and friendly names) to their
/// [`ComponentReflector`]s.
///
/// Must be populated before the first refresh that attaches a component of
/// that index. Registering the same type twice is a no-op; registering two
/// different types under one index panics, since nothing downstream could
/// ever work.
pub struct ComponentRegistry {
  inner: RwLock<ComponentRegistryInner>,
}

#[derive(Default)]
struct ComponentRegistryInner {
  by_index: AHashMap<ComponentIndex, RegisteredComponent>,
  by_name: AHashMap<SmolStr, ComponentIndex>,
}

struct RegisteredComponent {
  tid: TypeId,
  type_name: &'static str,
  reflector: ComponentReflector,
}

impl ComponentRegistry {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(ComponentRegistryInner::default()),
    }
  }

  /// Register a component type that never leaves memory (no serde).
  pub fn register_transient<C: Component>(&self) {
    self.insert::<C>(None, None);
  }

  /// Register a component type with byte-level serde for snapshots and
  /// remote messages.
  pub fn register<C: Component + Serialize + DeserializeOwned>(&self) {
    self.insert::<C>(
      Some(serialize_erased::<C> as SerializeFn),
      Some(deserialize_erased::<C> as DeserializeFn),
    );
  }

  fn insert<C: Component>(
    &self,
    serialize: Option<SerializeFn>,
    deserialize: Option<DeserializeFn>,
  ) {
    let mut inner = self.inner.write().unwrap();
    let index = C::index();
    if let Some(extant) = inner.by_index.get(&index) {
      if extant.tid == TypeId::of::<C>() {
        return;
      }
      panic!(
        "component index {:?} is registered to both {} and {}",
        index,
        extant.type_name,
        std::any::type_name::<C>()
      );
    }
    if let Some(&clash) = inner.by_name.get(C::name()) {
      panic!(
        "component name {:?} is registered to both index {:?} and {:?}",
        C::name(),
        clash,
        index
      );
    }
    inner.by_name.insert(SmolStr::new(C::name()), index);
    inner.by_index.insert(
      index,
      RegisteredComponent {
        tid: TypeId::of::<C>(),
        type_name: std::any::type_name::<C>(),
        reflector: ComponentReflector {
          index,
          name: SmolStr::new(C::name()),
          size: mem::size_of::<C>(),
          serialize,
          deserialize,
        },
      },
    );
  }

  pub fn is_registered(&self, index: ComponentIndex) -> bool {
    self.inner.read().unwrap().by_index.contains_key(&index)
  }

  pub fn reflector_for(
    &self,
    index: ComponentIndex,
  ) -> Result<ComponentReflector, UnknownComponent> {
    let inner = self.inner.read().unwrap();
    inner
      .by_index
      .get(&index)
      .map(|reg| reg.reflector.clone())
      .ok_or(UnknownComponent::Index(index))
  }

  pub fn index_of(&self, name: &str) -> Result<ComponentIndex, UnknownComponent> {
    let inner = self.inner.read().unwrap();
    inner
      .by_name
      .get(name)
      .copied()
      .ok_or_else(|| UnknownComponent::Name(SmolStr::new(name)))
  }

  pub fn reflector_by_name(
    &self,
    name: &str,
  ) -> Result<ComponentReflector, UnknownComponent> {
    let index = self.index_of(name)?;
    self.reflector_for(index)
  }
}

impl Default for ComponentRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Lookup miss in the component registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnknownComponent {
  #[error("no component type registered under index {0:?}")]
  Index(ComponentIndex),
  #[error("no component type registered under the name {0:?}")]
  Name(SmolStr),
}
