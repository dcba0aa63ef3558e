//! The slot-allocated entity table.
//!
//! Slots are recycled through a free list; each slot carries a generation
//! that is baked into the [`EntityId`], so stale ids of recycled slots never
//! resolve. Structural changes noted here become visible to families only at
//! the refresh, which the [`World`](crate::world::World) orchestrates.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::entity::{Entity, EntityId};

pub struct EntityTable {
  slots: Vec<Slot>,
  free_head: Option<usize>,
  spawned_count: usize,
  pending: Vec<EntityId>,
  dirty: Vec<EntityId>,
  uuid_map: AHashMap<Uuid, EntityId>,
}

struct Slot {
  generation: u32,
  state: SlotState,
}

enum SlotState {
  Free { next_free: Option<usize> },
  Occupied(RwLock<Entity>),
}

impl EntityTable {
  pub fn new() -> Self {
    Self {
      slots: Vec::new(),
      free_head: None,
      spawned_count: 0,
      pending: Vec::new(),
      dirty: Vec::new(),
      uuid_map: AHashMap::new(),
    }
  }

  /// Allocate a slot for a new, pending entity. It joins families at the
  /// next refresh.
  pub fn create(
    &mut self,
    uuid: Option<Uuid>,
    name: impl Into<SmolStr>,
  ) -> EntityId {
    let uuid = uuid.unwrap_or_else(Uuid::new_v4);
    if self.uuid_map.contains_key(&uuid) {
      panic!("an entity with uuid {} already exists", uuid);
    }

    let index = match self.free_head {
      Some(index) => {
        let slot = &mut self.slots[index];
        match slot.state {
          SlotState::Free { next_free } => {
            self.free_head = next_free;
            index
          }
          SlotState::Occupied(..) => panic!("corrupt free list"),
        }
      }
      None => {
        self.slots.push(Slot {
          generation: 0,
          state: SlotState::Free { next_free: None },
        });
        self.slots.len() - 1
      }
    };

    let id = EntityId::new(index as u32, self.slots[index].generation);
    self.slots[index].state =
      SlotState::Occupied(RwLock::new(Entity::new(id, uuid, name.into())));
    self.uuid_map.insert(uuid, id);
    self.pending.push(id);
    id
  }

  /// Mark an entity (and its subtree) for destruction at the next refresh.
  pub fn destroy(&mut self, id: EntityId) {
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
      let Some(lock) = self.slot(id) else { continue };
      let mut entity = write_lock(lock, id);
      if !entity.alive {
        continue;
      }
      entity.alive = false;
      entity.dirty = true;
      stack.extend_from_slice(&entity.children);
      drop(entity);
      self.dirty.push(id);
    }
  }

  fn slot(&self, id: EntityId) -> Option<&RwLock<Entity>> {
    if !id.is_valid() {
      return None;
    }
    match self.slots.get(id.index()) {
      Some(Slot {
        generation,
        state: SlotState::Occupied(lock),
      }) if *generation == id.generation() => Some(lock),
      _ => None,
    }
  }

  pub fn contains(&self, id: EntityId) -> bool {
    self.slot(id).is_some()
  }

  pub fn read(&self, id: EntityId) -> Option<RwLockReadGuard<'_, Entity>> {
    self.slot(id).map(|lock| {
      lock
        .try_read()
        .unwrap_or_else(|_| panic!("{:?} is mutably locked", id))
    })
  }

  pub fn write(&self, id: EntityId) -> Option<RwLockWriteGuard<'_, Entity>> {
    self.slot(id).map(|lock| write_lock(lock, id))
  }

  pub fn entity_by_uuid(&self, uuid: &Uuid) -> Option<EntityId> {
    self.uuid_map.get(uuid).copied()
  }

  /// The number of spawned entities (pending ones don't count yet).
  pub fn num_entities(&self) -> usize {
    self.spawned_count
  }

  pub fn note_dirty(&mut self, id: EntityId) {
    self.dirty.push(id);
  }

  pub(crate) fn has_work(&self) -> bool {
    !self.pending.is_empty() || !self.dirty.is_empty()
  }

  /// Iterate every occupied slot, spawned or not.
  pub(crate) fn iter_slots(
    &self,
  ) -> impl Iterator<Item = (EntityId, &RwLock<Entity>)> {
    self.slots.iter().enumerate().filter_map(|(index, slot)| {
      match &slot.state {
        SlotState::Occupied(lock) => {
          Some((EntityId::new(index as u32, slot.generation), lock))
        }
        SlotState::Free { .. } => None,
      }
    })
  }

  /// Iterate live, spawned entities.
  pub fn iter_live(
    &self,
  ) -> impl Iterator<Item = (EntityId, RwLockReadGuard<'_, Entity>)> {
    self.iter_slots().filter_map(|(id, lock)| {
      let guard = lock
        .try_read()
        .unwrap_or_else(|_| panic!("{:?} is mutably locked", id));
      (guard.alive && !guard.pending).then_some((id, guard))
    })
  }

  /// Promote pending entities to spawned; they get picked up by the dirty
  /// scan of the same refresh.
  pub fn spawn_pending(&mut self) -> Vec<EntityId> {
    let pending = std::mem::take(&mut self.pending);
    let mut spawned = Vec::with_capacity(pending.len());
    for id in pending {
      let Some(lock) = self.slot(id) else { continue };
      let mut entity = write_lock(lock, id);
      if !entity.alive {
        // Created and destroyed before ever spawning.
        drop(entity);
        spawned.push(id);
        continue;
      }
      entity.pending = false;
      entity.dirty = true;
      drop(entity);
      self.spawned_count += 1;
      self.dirty.push(id);
      spawned.push(id);
    }
    spawned
  }

  /// Drain the dirty list, deduplicated, dropping stale ids.
  pub(crate) fn take_dirty(&mut self) -> Vec<EntityId> {
    let mut dirty = std::mem::take(&mut self.dirty);
    dirty.sort_unstable();
    dirty.dedup();
    dirty.retain(|id| self.contains(*id));
    dirty
  }

  /// Tear the slot down and put it on the free list. Only the refresh calls
  /// this, after family notifications are done, so ids are recycled only
  /// once the refresh completes.
  pub(crate) fn free_slot(&mut self, id: EntityId) {
    let (uuid, parent, was_spawned) = {
      let Some(lock) = self.slot(id) else { return };
      let mut entity = write_lock(lock, id);
      debug_assert!(!entity.alive);
      entity.detach_all();
      entity.sweep();
      entity.inbox.clear();
      (entity.instance_uuid, entity.parent.take(), !entity.pending)
    };

    if was_spawned {
      self.spawned_count -= 1;
    }
    self.uuid_map.remove(&uuid);

    // Unhook from the hierarchy.
    if let Some(parent) = parent {
      if let Some(mut parent) = self.write(parent) {
        parent.children.retain(|child| *child != id);
        parent.mark_children_changed();
      }
    }

    let index = id.index();
    let slot = &mut self.slots[index];
    slot.generation += 1;
    slot.state = SlotState::Free {
      next_free: self.free_head,
    };
    self.free_head = Some(index);
  }

  /// Re-parent an entity, keeping child lists and revision counters in sync
  /// and propagating the parent's partition tag.
  pub fn set_parent(&mut self, id: EntityId, parent: Option<EntityId>) {
    let old_parent = match self.write(id) {
      Some(mut entity) => {
        let old = entity.parent;
        entity.parent = parent;
        entity.mark_hierarchy_changed();
        old
      }
      None => return,
    };

    if let Some(old_parent) = old_parent {
      if let Some(mut old) = self.write(old_parent) {
        old.children.retain(|child| *child != id);
        old.mark_children_changed();
      }
    }
    if let Some(parent) = parent {
      let partition = match self.write(parent) {
        Some(mut new) => {
          if !new.children.contains(&id) {
            new.children.push(id);
          }
          new.mark_children_changed();
          Some(new.world_partition)
        }
        None => None,
      };
      if let Some(partition) = partition {
        self.set_world_partition(id, partition);
      }
    }
  }

  /// Set the 8-bit partition tag of an entity and its whole subtree.
  pub fn set_world_partition(&mut self, id: EntityId, partition: u8) {
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
      if let Some(mut entity) = self.write(id) {
        entity.world_partition = partition;
        stack.extend_from_slice(&entity.children);
      }
    }
  }

  /// Age the inboxes: delivered messages go away, unconsumed ones age by one
  /// step, and anything that hit the TTL without a taker is dropped.
  pub(crate) fn sweep_inboxes(&mut self, ttl: u32) {
    for (_, lock) in self.iter_slots() {
      let mut entity = lock.try_write().expect("entity locked during refresh");
      if entity.inbox.is_empty() {
        continue;
      }
      entity
        .inbox
        .retain(|entry| !entry.consumed && entry.age + 1 < ttl);
      for entry in &mut entity.inbox {
        entry.age += 1;
      }
    }
  }
}

impl Default for EntityTable {
  fn default() -> Self {
    Self::new()
  }
}

fn write_lock(
  lock: &RwLock<Entity>,
  id: EntityId,
) -> RwLockWriteGuard<'_, Entity> {
  lock
    .try_write()
    .unwrap_or_else(|_| panic!("{:?} is locked", id))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recycled_slots_bump_the_generation() {
    let mut table = EntityTable::new();
    let a = table.create(None, "a");
    table.spawn_pending();
    table.destroy(a);
    table.free_slot(a);

    let b = table.create(None, "b");
    assert_eq!(a.index(), b.index());
    assert_ne!(a, b);
    assert!(!table.contains(a));
    assert!(table.contains(b));
  }

  #[test]
  fn uuids_map_back_to_ids() {
    let mut table = EntityTable::new();
    let uuid = Uuid::new_v4();
    let id = table.create(Some(uuid), "named");
    assert_eq!(table.entity_by_uuid(&uuid), Some(id));
    assert_eq!(table.read(id).unwrap().instance_uuid(), uuid);

    table.destroy(id);
    table.free_slot(id);
    assert_eq!(table.entity_by_uuid(&uuid), None);
  }

  #[test]
  fn pending_entities_spawn_once() {
    let mut table = EntityTable::new();
    let id = table.create(None, "kid");
    assert_eq!(table.num_entities(), 0);
    table.spawn_pending();
    assert_eq!(table.num_entities(), 1);
    table.spawn_pending();
    assert_eq!(table.num_entities(), 1);
    assert!(!table.read(id).unwrap().pending);
  }
}
