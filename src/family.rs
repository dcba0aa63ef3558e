//! Families: live, contiguous buffers of typed rows, one row per entity
//! whose mask satisfies the family's inclusion mask.
//!
//! Row types are emitted by the [`family!`] macro. Each row carries a
//! [`RowAnchor`] into the family's anchor arena so other code can hold
//! [`WeakRow`] handles that go *absent* (never dangling) when the row dies.
//!
//! Membership changes queue up during a step and are applied in one batch by
//! `update_entities` at the refresh, so a system iterating a family never
//! observes a row move mid-iteration.

use std::marker::PhantomData;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entity::{Entity, EntityId};
use crate::mask::{MaskBits, MaskHandle, MaskRegistry};
use crate::table::EntityTable;

/// Structural mutation was attempted while a rows guard was still alive.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("structural change attempted while a family was being iterated")]
pub struct RefreshDuringIteration;

/// The anchor embedded in every family row. Cheap to copy; the arena slot it
/// names follows the row through swaps and is retired when the row dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowAnchor {
  pub(crate) slot: u32,
  pub(crate) generation: u32,
}

/// A non-owning handle to one family row. Resolves through the
/// [`FamilyBinding`](crate::binding::FamilyBinding); once the row is removed
/// the handle resolves to absent, never to another row's data.
pub struct WeakRow<T> {
  pub(crate) slot: u32,
  pub(crate) generation: u32,
  _phantom: PhantomData<fn() -> T>,
}

impl<T> WeakRow<T> {
  pub(crate) fn from_anchor(anchor: RowAnchor) -> Self {
    Self {
      slot: anchor.slot,
      generation: anchor.generation,
      _phantom: PhantomData,
    }
  }
}

impl<T> Clone for WeakRow<T> {
  fn clone(&self) -> Self {
    Self {
      slot: self.slot,
      generation: self.generation,
      _phantom: PhantomData,
    }
  }
}

impl<T> Copy for WeakRow<T> {}

/// Arena of anchor slots with stable indices. Each slot tracks the current
/// row index of its row and a generation that is bumped when the row dies,
/// which is what invalidates outstanding [`WeakRow`]s.
pub(crate) struct AnchorArena {
  slots: Vec<AnchorSlot>,
  free: Vec<u32>,
}

struct AnchorSlot {
  generation: u32,
  row: u32,
}

impl AnchorArena {
  fn new() -> Self {
    Self {
      slots: Vec::new(),
      free: Vec::new(),
    }
  }

  fn alloc(&mut self, row: usize) -> RowAnchor {
    match self.free.pop() {
      Some(slot) => {
        self.slots[slot as usize].row = row as u32;
        RowAnchor {
          slot,
          generation: self.slots[slot as usize].generation,
        }
      }
      None => {
        let slot = self.slots.len() as u32;
        self.slots.push(AnchorSlot {
          generation: 0,
          row: row as u32,
        });
        RowAnchor {
          slot,
          generation: 0,
        }
      }
    }
  }

  fn set_row(&mut self, anchor: RowAnchor, row: usize) {
    self.slots[anchor.slot as usize].row = row as u32;
  }

  fn release(&mut self, anchor: RowAnchor) {
    let slot = &mut self.slots[anchor.slot as usize];
    debug_assert_eq!(slot.generation, anchor.generation);
    slot.generation += 1;
    self.free.push(anchor.slot);
  }

  pub(crate) fn resolve(&self, slot: u32, generation: u32) -> Option<usize> {
    let entry = self.slots.get(slot as usize)?;
    (entry.generation == generation).then_some(entry.row as usize)
  }
}

/// A typed family row. Implemented by the [`family!`] macro; the layout is
/// always `{entity_id, anchor, component handles…}` with optional handles as
/// `Option`.
pub trait FamilyRow: Send + Sync + 'static {
  /// Bits of the required components.
  fn inclusion_bits() -> MaskBits;
  /// Bits of the optional components.
  fn optional_bits() -> MaskBits;
  /// Every component this row can read (required and optional).
  fn read_bits() -> MaskBits;
  /// Components declared writable, for the scheduler's parallel planning.
  fn write_bits() -> MaskBits;

  /// Fill a row from an entity known to satisfy the inclusion mask.
  fn load(entity: &Entity, anchor: RowAnchor) -> Self;
  /// Re-resolve the component handles in place, keeping slot and anchor.
  fn reload(&mut self, entity: &Entity);

  fn entity_id(&self) -> EntityId;
  fn anchor(&self) -> RowAnchor;

  /// A non-owning handle to this row; resolves to absent once the row dies.
  fn weak_handle(&self) -> WeakRow<Self>
  where
    Self: Sized,
  {
    WeakRow::from_anchor(self.anchor())
  }
}

pub(crate) struct FamilyCore<T> {
  pub rows: Vec<T>,
  pub anchors: AnchorArena,
  pub to_remove: Vec<EntityId>,
  pub to_reload: Vec<EntityId>,
  /// Rows at indices >= this were added since the last update and have not
  /// been announced yet.
  committed: usize,
}

type SpanListener<T> = Box<dyn Fn(&[T]) + Send + Sync>;
type ReloadListener<T> = Box<dyn Fn(&[&T]) + Send + Sync>;

struct FamilyListeners<T> {
  added: Vec<SpanListener<T>>,
  removed: Vec<SpanListener<T>>,
  reloaded: Vec<ReloadListener<T>>,
}

impl<T> Default for FamilyListeners<T> {
  fn default() -> Self {
    Self {
      added: Vec::new(),
      removed: Vec::new(),
      reloaded: Vec::new(),
    }
  }
}

/// One family: the rows plus the queued membership changes. There is one
/// instance per unique (row type, inclusion mask, optional mask) triple.
pub struct FamilyImpl<T: FamilyRow> {
  inclusion: MaskHandle,
  optional: MaskHandle,
  combined: MaskHandle,
  core: RwLock<FamilyCore<T>>,
  listeners: Mutex<FamilyListeners<T>>,
}

impl<T: FamilyRow> FamilyImpl<T> {
  pub(crate) fn new(masks: &MaskRegistry) -> Self {
    let inclusion = masks.intern(T::inclusion_bits());
    let optional = masks.intern(T::optional_bits());
    Self {
      inclusion,
      optional,
      combined: masks.union(inclusion, optional),
      core: RwLock::new(FamilyCore {
        rows: Vec::new(),
        anchors: AnchorArena::new(),
        to_remove: Vec::new(),
        to_reload: Vec::new(),
        committed: 0,
      }),
      listeners: Mutex::new(FamilyListeners::default()),
    }
  }

  pub fn inclusion_mask(&self) -> MaskHandle {
    self.inclusion
  }

  pub fn optional_mask(&self) -> MaskHandle {
    self.optional
  }

  pub(crate) fn read_core(
    &self,
  ) -> Result<RwLockReadGuard<'_, FamilyCore<T>>, RefreshDuringIteration> {
    self.core.try_read().map_err(|_| RefreshDuringIteration)
  }

  fn write_core(
    &self,
  ) -> Result<RwLockWriteGuard<'_, FamilyCore<T>>, RefreshDuringIteration> {
    self.core.try_write().map_err(|_| RefreshDuringIteration)
  }

  pub(crate) fn push_listener_added(&self, f: SpanListener<T>) {
    self.listeners.lock().unwrap().added.push(f);
  }

  pub(crate) fn push_listener_removed(&self, f: SpanListener<T>) {
    self.listeners.lock().unwrap().removed.push(f);
  }

  pub(crate) fn push_listener_reloaded(&self, f: ReloadListener<T>) {
    self.listeners.lock().unwrap().reloaded.push(f);
  }

  fn notify_added(&self, rows: &[T]) {
    for listener in self.listeners.lock().unwrap().added.iter() {
      listener(rows);
    }
  }

  fn notify_removed(&self, rows: &[T]) {
    for listener in self.listeners.lock().unwrap().removed.iter() {
      listener(rows);
    }
  }

  fn notify_reloaded(&self, rows: &[&T]) {
    for listener in self.listeners.lock().unwrap().reloaded.iter() {
      listener(rows);
    }
  }

  /// Move the queued removals to the back of the row vector, announce them
  /// as one trailing span, then shrink.
  ///
  /// The scan runs *forward*: a backward scan would be faster for
  /// short-lived entities, but makes a same-step remove+add of one entity
  /// collide on the same slot. Forward preserves "added after removed"
  /// within one refresh.
  fn remove_dead_rows(&self, core: &mut FamilyCore<T>) {
    if core.to_remove.is_empty() {
      return;
    }
    let remove_count = core.to_remove.len();
    assert!(remove_count <= core.rows.len());
    core.to_remove.sort_unstable();
    for window in core.to_remove.windows(2) {
      assert_ne!(window[0], window[1], "entity queued for removal twice");
    }

    let mut n = core.rows.len();
    let mut i = 0;
    while i < n {
      let id = core.rows[i].entity_id();
      if let Ok(found) = core.to_remove.binary_search(&id) {
        core.to_remove.remove(found);
        if i != n - 1 {
          core.rows.swap(i, n - 1);
          let moved = core.rows[i].anchor();
          core.anchors.set_row(moved, i);
          let dying = core.rows[n - 1].anchor();
          core.anchors.set_row(dying, n - 1);
          i = i.wrapping_sub(1);
        }
        n -= 1;
        if core.to_remove.is_empty() {
          break;
        }
      }
      i = i.wrapping_add(1);
    }
    assert!(core.to_remove.is_empty(), "queued removal was not a row");
    debug_assert_eq!(n + remove_count, core.rows.len());

    let new_len = core.rows.len() - remove_count;
    self.notify_removed(&core.rows[new_len..]);

    for row in &core.rows[new_len..] {
      core.anchors.release(row.anchor());
    }
    core.rows.truncate(new_len);
    core.committed = new_len;
  }
}

/// The erased face a family shows the world's refresh.
pub(crate) trait AnyFamily: Send + Sync {
  fn inclusion_mask(&self) -> MaskHandle;
  /// inclusion ∪ optional; a membership-preserving change to any of these
  /// bits triggers a reload.
  fn combined_mask(&self) -> MaskHandle;

  fn add_entity(&self, entity: &Entity) -> Result<(), RefreshDuringIteration>;
  fn mark_removed(&self, id: EntityId) -> Result<(), RefreshDuringIteration>;
  fn mark_reload(&self, id: EntityId) -> Result<(), RefreshDuringIteration>;
  fn update_entities(
    &self,
    table: &EntityTable,
  ) -> Result<(), RefreshDuringIteration>;
  fn len(&self) -> usize;
  /// Entity ids in row-buffer order, for message delivery.
  fn entity_ids(&self) -> Vec<EntityId>;
}

impl<T: FamilyRow> AnyFamily for FamilyImpl<T> {
  fn inclusion_mask(&self) -> MaskHandle {
    self.inclusion
  }

  fn combined_mask(&self) -> MaskHandle {
    self.combined
  }

  fn add_entity(&self, entity: &Entity) -> Result<(), RefreshDuringIteration> {
    let mut core = self.write_core()?;
    let at = core.rows.len();
    let anchor = core.anchors.alloc(at);
    let row = T::load(entity, anchor);
    core.rows.push(row);
    Ok(())
  }

  fn mark_removed(&self, id: EntityId) -> Result<(), RefreshDuringIteration> {
    let mut core = self.write_core()?;
    if !core.to_remove.contains(&id) {
      core.to_remove.push(id);
    }
    Ok(())
  }

  fn mark_reload(&self, id: EntityId) -> Result<(), RefreshDuringIteration> {
    let mut core = self.write_core()?;
    if !core.to_reload.contains(&id) {
      core.to_reload.push(id);
    }
    Ok(())
  }

  fn update_entities(
    &self,
    table: &EntityTable,
  ) -> Result<(), RefreshDuringIteration> {
    let mut core = self.write_core()?;
    let core = &mut *core;

    // Announce the freshly appended rows.
    if core.rows.len() > core.committed {
      tracing::trace!(
        added = core.rows.len() - core.committed,
        "family rows added"
      );
      let committed = core.committed;
      core.committed = core.rows.len();
      self.notify_added(&core.rows[committed..]);
    }

    // Re-resolve reloaded rows in place, then announce the batch.
    if !core.to_reload.is_empty() {
      let to_reload = std::mem::take(&mut core.to_reload);
      let mut touched = Vec::with_capacity(to_reload.len());
      for (at, row) in core.rows.iter_mut().enumerate() {
        if to_reload.contains(&row.entity_id()) {
          if let Some(entity) = table.read(row.entity_id()) {
            row.reload(&entity);
            touched.push(at);
          }
        }
      }
      let rows: Vec<&T> = touched.iter().map(|&at| &core.rows[at]).collect();
      self.notify_reloaded(&rows);
    }

    self.remove_dead_rows(core);
    Ok(())
  }

  fn len(&self) -> usize {
    self.core.read().unwrap().rows.len()
  }

  fn entity_ids(&self) -> Vec<EntityId> {
    let core = self.core.read().unwrap();
    core.rows.iter().map(|row| row.entity_id()).collect()
  }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __family_write_bit {
  (write, $comp:ty, $bits:ident) => {
    $bits.set(<$comp as $crate::component::Component>::index());
  };
  (read, $comp:ty, $bits:ident) => {};
}

/// Emit a family row type: the struct layout plus its
/// [`FamilyRow`](crate::family::FamilyRow) impl.
///
/// Required components are marked `read` or `write` (the access bits feed
/// the scheduler's parallel planning); optional components always load as
/// `Option` and re-resolve on reload.
///
/// ```ignore
/// family! {
///   /// Entities that can move.
///   pub struct MoverRow {
///     required {
///       position: write Position,
///       velocity: read Velocity,
///     }
///     optional {
///       friction: Friction,
///     }
///   }
/// }
/// ```
#[macro_export]
macro_rules! family {
  (
    $(#[$meta:meta])*
    $v:vis struct $name:ident {
      required {
        $($rfield:ident : $raccess:ident $rcomp:ty),* $(,)?
      }
      $(optional {
        $($ofield:ident : $ocomp:ty),* $(,)?
      })?
    }
  ) => {
    $(#[$meta])*
    $v struct $name {
      entity_id: $crate::entity::EntityId,
      anchor: $crate::family::RowAnchor,
      $(pub $rfield: $crate::component::ComponentRef<$rcomp>,)*
      $($(pub $ofield: ::core::option::Option<$crate::component::ComponentRef<$ocomp>>,)*)?
    }

    impl $crate::family::FamilyRow for $name {
      fn inclusion_bits() -> $crate::MaskBits {
        $crate::MaskBits::from_indices(&[
          $(<$rcomp as $crate::component::Component>::index(),)*
        ])
      }

      fn optional_bits() -> $crate::MaskBits {
        $crate::MaskBits::from_indices(&[
          $($(<$ocomp as $crate::component::Component>::index(),)*)?
        ])
      }

      fn read_bits() -> $crate::MaskBits {
        Self::inclusion_bits().union(&Self::optional_bits())
      }

      fn write_bits() -> $crate::MaskBits {
        #[allow(unused_mut)]
        let mut bits = $crate::MaskBits::EMPTY;
        $($crate::__family_write_bit!($raccess, $rcomp, bits);)*
        bits
      }

      fn load(
        entity: &$crate::entity::Entity,
        anchor: $crate::family::RowAnchor,
      ) -> Self {
        Self {
          entity_id: entity.id(),
          anchor,
          $($rfield: entity.component_ref::<$rcomp>().unwrap_or_else(|| {
            panic!(
              "family row {} loaded from an entity without its required {}",
              stringify!($name),
              stringify!($rcomp),
            )
          }),)*
          $($($ofield: entity.component_ref::<$ocomp>(),)*)?
        }
      }

      fn reload(&mut self, entity: &$crate::entity::Entity) {
        $(self.$rfield = entity.component_ref::<$rcomp>().unwrap_or_else(|| {
          panic!(
            "family row {} reloaded from an entity without its required {}",
            stringify!($name),
            stringify!($rcomp),
          )
        });)*
        $($(self.$ofield = entity.component_ref::<$ocomp>();)*)?
      }

      fn entity_id(&self) -> $crate::entity::EntityId {
        self.entity_id
      }

      fn anchor(&self) -> $crate::family::RowAnchor {
        self.anchor
      }
    }
  };
}
