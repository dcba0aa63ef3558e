//! Entity identity and the per-entity record: flags, the sorted component
//! list, hierarchy links, and the message inbox.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::component::{
  Component, ComponentEntry, ComponentIndex, ComponentRef,
};
use crate::mask::{MaskBits, MaskHandle};
use crate::messages::MessageEntry;

/// Opaque 64-bit entity identity.
///
/// `-1` is reserved as the invalid id. The low 32 bits index the table's
/// slot pool; the bits above carry the slot generation, so a stale id of a
/// recycled slot never resolves.
#[derive(
  Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityId {
  value: i64,
}

impl EntityId {
  pub const INVALID: EntityId = EntityId { value: -1 };

  pub(crate) fn new(index: u32, generation: u32) -> Self {
    debug_assert!(generation < 1 << 31);
    Self {
      value: ((generation as i64) << 32) | index as i64,
    }
  }

  pub fn is_valid(&self) -> bool {
    self.value != -1
  }

  pub(crate) fn index(&self) -> usize {
    (self.value & 0xffff_ffff) as usize
  }

  pub(crate) fn generation(&self) -> u32 {
    (self.value >> 32) as u32
  }

  pub fn to_raw(&self) -> i64 {
    self.value
  }

  pub fn from_raw(value: i64) -> Self {
    Self { value }
  }
}

impl Default for EntityId {
  fn default() -> Self {
    Self::INVALID
  }
}

impl std::fmt::Debug for EntityId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.is_valid() {
      write!(f, "EntityId({}v{})", self.index(), self.generation())
    } else {
      write!(f, "EntityId(invalid)")
    }
  }
}

/// The record stored for each live entity.
///
/// The component list is kept sorted by [`ComponentIndex`] over its live
/// prefix; removals swap the victim to the tail and shrink the prefix, so
/// handles into the prefix stay good until the next refresh re-sorts and
/// truncates.
pub struct Entity {
  pub(crate) id: EntityId,
  pub(crate) instance_uuid: Uuid,
  pub(crate) prefab_uuid: Option<Uuid>,
  pub(crate) name: SmolStr,

  pub(crate) alive: bool,
  pub(crate) pending: bool,
  pub(crate) dirty: bool,
  pub(crate) from_prefab: bool,
  pub(crate) stub: bool,
  pub(crate) serializable: bool,
  pub(crate) reloaded: bool,

  pub(crate) components: Vec<(ComponentIndex, ComponentEntry)>,
  pub(crate) live_components: usize,
  pub(crate) mask: MaskHandle,
  /// Indices detached since the last refresh. A family whose inclusion mask
  /// overlaps these sees a remove+add (fresh row, fresh anchor) even if the
  /// component was put back within the same step.
  pub(crate) removed_bits: MaskBits,

  pub(crate) parent: Option<EntityId>,
  pub(crate) children: Vec<EntityId>,
  pub(crate) hierarchy_revision: u8,
  pub(crate) children_revision: u8,
  pub(crate) world_partition: u8,

  pub(crate) inbox: Vec<MessageEntry>,
}

impl Entity {
  pub(crate) fn new(id: EntityId, instance_uuid: Uuid, name: SmolStr) -> Self {
    Self {
      id,
      instance_uuid,
      prefab_uuid: None,
      name,
      alive: true,
      pending: true,
      dirty: true,
      from_prefab: false,
      stub: false,
      serializable: true,
      reloaded: false,
      components: Vec::new(),
      live_components: 0,
      mask: MaskHandle::EMPTY,
      removed_bits: MaskBits::EMPTY,
      parent: None,
      children: Vec::new(),
      hierarchy_revision: 0,
      children_revision: 0,
      world_partition: 0,
      inbox: Vec::new(),
    }
  }

  pub fn id(&self) -> EntityId {
    self.id
  }

  pub fn instance_uuid(&self) -> Uuid {
    self.instance_uuid
  }

  pub fn prefab_uuid(&self) -> Option<Uuid> {
    self.prefab_uuid
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_alive(&self) -> bool {
    self.alive
  }

  pub fn needs_refresh(&self) -> bool {
    self.dirty
  }

  pub fn is_from_prefab(&self) -> bool {
    self.from_prefab
  }

  pub fn is_stub(&self) -> bool {
    self.stub
  }

  pub fn is_serializable(&self) -> bool {
    self.serializable
  }

  pub fn mask(&self) -> MaskHandle {
    self.mask
  }

  pub fn parent(&self) -> Option<EntityId> {
    self.parent
  }

  pub fn children(&self) -> &[EntityId] {
    &self.children
  }

  pub fn hierarchy_revision(&self) -> u8 {
    self.hierarchy_revision
  }

  pub fn children_revision(&self) -> u8 {
    self.children_revision
  }

  pub fn world_partition(&self) -> u8 {
    self.world_partition
  }

  pub fn num_components(&self) -> usize {
    self.live_components
  }

  /// Iterate the live `(index, entry)` pairs.
  pub(crate) fn live_entries(
    &self,
  ) -> impl Iterator<Item = &(ComponentIndex, ComponentEntry)> {
    self.components[..self.live_components].iter()
  }

  pub(crate) fn raw_entry(
    &self,
    index: ComponentIndex,
  ) -> Option<&ComponentEntry> {
    self
      .live_entries()
      .find(|(idx, _)| *idx == index)
      .map(|(_, entry)| entry)
  }

  pub fn has_component_index(&self, index: ComponentIndex) -> bool {
    self.raw_entry(index).is_some()
  }

  /// Typed handle to one of this entity's components, or `None` if absent.
  ///
  /// This is what the row loaders emitted by [`family!`](crate::family!)
  /// call to fill required and optional fields.
  pub fn component_ref<C: Component>(&self) -> Option<ComponentRef<C>> {
    self
      .raw_entry(C::index())
      .map(|entry| ComponentRef::new(entry.clone(), self.id))
  }

  /// The mask bits derived from the current live component set.
  pub(crate) fn current_bits(&self) -> MaskBits {
    let mut bits = MaskBits::EMPTY;
    for (idx, _) in self.live_entries() {
      bits.set(*idx);
    }
    bits
  }

  /// Attach a component, keeping the live prefix sorted. Replaces in place
  /// if the index is already attached, returning the old entry.
  pub(crate) fn attach(
    &mut self,
    index: ComponentIndex,
    entry: ComponentEntry,
  ) -> Option<ComponentEntry> {
    let prefix = &self.components[..self.live_components];
    match prefix.binary_search_by_key(&index, |(idx, _)| *idx) {
      Ok(at) => {
        // Replaced in place: membership is unchanged but the handle is new,
        // so matching families must re-resolve.
        self.reloaded = true;
        let old = std::mem::replace(&mut self.components[at].1, entry);
        Some(old)
      }
      Err(at) => {
        self.components.insert(at, (index, entry));
        self.live_components += 1;
        None
      }
    }
  }

  /// Detach a component by swapping it past the live prefix. The entry
  /// itself is dropped at the next refresh sweep.
  pub(crate) fn detach(&mut self, index: ComponentIndex) -> bool {
    let prefix = &self.components[..self.live_components];
    match prefix.binary_search_by_key(&index, |(idx, _)| *idx) {
      Ok(at) => {
        self.removed_bits.set(index);
        self.components.swap(at, self.live_components - 1);
        self.live_components -= 1;
        // Keep the shrunken prefix sorted so later detaches can still
        // binary-search it.
        self.components[..self.live_components]
          .sort_unstable_by_key(|(idx, _)| *idx);
        true
      }
      Err(_) => false,
    }
  }

  /// Drop the dead tail and restore the sorted-prefix invariant.
  pub(crate) fn sweep(&mut self) {
    self.components.truncate(self.live_components);
    self
      .components
      .sort_unstable_by_key(|(idx, _)| *idx);
  }

  pub(crate) fn detach_all(&mut self) {
    self.live_components = 0;
  }

  pub(crate) fn mark_hierarchy_changed(&mut self) {
    self.hierarchy_revision = self.hierarchy_revision.wrapping_add(1);
  }

  pub(crate) fn mark_children_changed(&mut self) {
    self.children_revision = self.children_revision.wrapping_add(1);
  }
}

/// `get_component` was called for a component the entity doesn't have.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{entity:?} has no component {type_name} ({index:?})")]
pub struct ComponentMissing {
  pub entity: EntityId,
  pub index: ComponentIndex,
  pub type_name: &'static str,
}

/// A handle to one entity with mutable access to the world, for host-side
/// setup and editing. Structural changes made through this become visible to
/// families at the next refresh.
pub struct EntityRef<'w> {
  pub(crate) world: &'w mut crate::world::World,
  pub(crate) id: EntityId,
}

impl<'w> EntityRef<'w> {
  pub fn id(&self) -> EntityId {
    self.id
  }

  pub fn uuid(&self) -> Uuid {
    self.read(|e| e.instance_uuid)
  }

  fn read<R>(&self, f: impl FnOnce(&Entity) -> R) -> R {
    let guard = self
      .world
      .table()
      .read(self.id)
      .expect("EntityRef outlived its entity");
    f(&guard)
  }

  fn write<R>(&mut self, f: impl FnOnce(&mut Entity) -> R) -> R {
    let mut guard = self
      .world
      .table_mut()
      .write(self.id)
      .expect("EntityRef outlived its entity");
    f(&mut guard)
  }

  /// Attach a component. The component type must be registered with the
  /// world's context before the next refresh.
  pub fn add_component<C: Component>(&mut self, component: C) -> &mut Self {
    if !self.world.context().components().is_registered(C::index()) {
      panic!(
        "tried to add a component of type {} to an entity, but that type was not registered",
        std::any::type_name::<C>()
      );
    }
    let entry = crate::component::new_entry(Box::new(component));
    self.write(|e| {
      e.attach(C::index(), entry);
      e.dirty = true;
    });
    self.world.table_mut().note_dirty(self.id);
    self
  }

  /// Detach a component, if present. The destructor runs at the next
  /// refresh, once no family row holds the component anymore.
  pub fn remove_component<C: Component>(&mut self) -> &mut Self {
    let changed = self.write(|e| {
      let changed = e.detach(C::index());
      if changed {
        e.dirty = true;
      }
      changed
    });
    if changed {
      self.world.table_mut().note_dirty(self.id);
    }
    self
  }

  pub fn get_component<C: Component>(
    &self,
  ) -> Result<ComponentRef<C>, ComponentMissing> {
    self.try_get_component().ok_or(ComponentMissing {
      entity: self.id,
      index: C::index(),
      type_name: std::any::type_name::<C>(),
    })
  }

  pub fn try_get_component<C: Component>(&self) -> Option<ComponentRef<C>> {
    self.read(|e| e.component_ref::<C>())
  }

  pub fn has_component<C: Component>(&self) -> bool {
    self.read(|e| e.has_component_index(C::index()))
  }

  pub fn name(&self) -> SmolStr {
    self.read(|e| e.name.clone())
  }

  pub fn set_name(&mut self, name: impl Into<SmolStr>) -> &mut Self {
    let name = name.into();
    self.write(|e| e.name = name);
    self
  }

  pub fn set_serializable(&mut self, serializable: bool) -> &mut Self {
    self.write(|e| e.serializable = serializable);
    self
  }

  pub fn set_stub(&mut self, stub: bool) -> &mut Self {
    self.write(|e| e.stub = stub);
    self
  }

  pub fn set_prefab(&mut self, prefab_uuid: Uuid) -> &mut Self {
    self.write(|e| {
      e.from_prefab = true;
      e.prefab_uuid = Some(prefab_uuid);
    });
    self
  }

  pub fn is_from_prefab(&self) -> bool {
    self.read(|e| e.from_prefab)
  }

  pub fn prefab_uuid(&self) -> Option<Uuid> {
    self.read(|e| e.prefab_uuid)
  }

  /// Flag this entity for family *reload*: its rows keep their slots and
  /// anchors, but re-resolve their component handles at the next refresh.
  pub fn mark_reloaded(&mut self) -> &mut Self {
    self.write(|e| {
      e.reloaded = true;
      e.dirty = true;
    });
    self.world.table_mut().note_dirty(self.id);
    self
  }

  pub fn parent(&self) -> Option<EntityId> {
    self.read(|e| e.parent)
  }

  pub fn children(&self) -> Vec<EntityId> {
    self.read(|e| e.children.clone())
  }

  /// The `(index, age)` pairs of messages currently in this entity's inbox,
  /// in enqueue order.
  pub fn message_inbox(&self) -> Vec<(crate::messages::MessageIndex, u32)> {
    self.read(|e| {
      e.inbox
        .iter()
        .map(|entry| (entry.index(), entry.age()))
        .collect()
    })
  }

  pub fn set_parent(&mut self, parent: Option<EntityId>) -> &mut Self {
    self.world.table_mut().set_parent(self.id, parent);
    self
  }

  pub fn world_partition(&self) -> u8 {
    self.read(|e| e.world_partition)
  }

  /// Set the partition tag, propagating it down the child tree.
  pub fn set_world_partition(&mut self, partition: u8) -> &mut Self {
    self.world.table_mut().set_world_partition(self.id, partition);
    self
  }
}
