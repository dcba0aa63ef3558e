//! The typed view a system keeps into one family.
//!
//! A binding is cheap to clone and stays valid for the life of the world.
//! Row access goes through a short-lived [`FamilyRows`] guard; holding one
//! across a refresh is what [`RefreshDuringIteration`] detects.

use std::sync::Arc;

use crate::family::{
  AnyFamily, FamilyCore, FamilyImpl, FamilyRow, RefreshDuringIteration,
  WeakRow,
};
use crate::mask::{MaskHandle, MaskRegistry};

/// `single` was called on a family whose size is not exactly one.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum SingleRowError {
  #[error("the family has no rows")]
  FamilyEmpty,
  #[error("the family has {0} rows, not one")]
  FamilyAmbiguous(usize),
}

/// A weak row handle whose anchor has been retired.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("weak family row handle no longer points at a live row")]
pub struct DanglingFamilyRef;

/// A system's typed handle into one family.
pub struct FamilyBinding<T: FamilyRow> {
  family: Arc<FamilyImpl<T>>,
  read_mask: MaskHandle,
  write_mask: MaskHandle,
}

impl<T: FamilyRow> Clone for FamilyBinding<T> {
  fn clone(&self) -> Self {
    Self {
      family: self.family.clone(),
      read_mask: self.read_mask,
      write_mask: self.write_mask,
    }
  }
}

impl<T: FamilyRow> FamilyBinding<T> {
  pub(crate) fn new(family: Arc<FamilyImpl<T>>, masks: &MaskRegistry) -> Self {
    let read_mask = masks.intern(T::read_bits());
    let write_mask = masks.intern(T::write_bits());
    Self {
      family,
      read_mask,
      write_mask,
    }
  }

  pub(crate) fn erased(&self) -> Arc<dyn AnyFamily> {
    self.family.clone()
  }

  pub fn len(&self) -> usize {
    self.family.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// What this binding reads, for the scheduler's parallel planning.
  pub fn read_mask(&self) -> MaskHandle {
    self.read_mask
  }

  /// What this binding writes, for the scheduler's parallel planning.
  pub fn write_mask(&self) -> MaskHandle {
    self.write_mask
  }

  pub fn inclusion_mask(&self) -> MaskHandle {
    self.family.inclusion_mask()
  }

  pub fn optional_mask(&self) -> MaskHandle {
    self.family.optional_mask()
  }

  /// Borrow the rows for iteration. Row order is stable for the lifetime of
  /// the guard; structural changes land at the next refresh.
  ///
  /// Panics if the family is mid-refresh, which cannot happen from inside a
  /// system update.
  pub fn rows(&self) -> FamilyRows<'_, T> {
    self
      .try_rows()
      .expect("family rows borrowed while the family was being refreshed")
  }

  pub fn try_rows(
    &self,
  ) -> Result<FamilyRows<'_, T>, RefreshDuringIteration> {
    Ok(FamilyRows {
      core: self.family.read_core()?,
    })
  }

  /// The row of the family's single entity. Fails unless the family has
  /// exactly one row.
  pub fn single(&self) -> Result<RowRef<'_, T>, SingleRowError> {
    let rows = self.rows();
    match rows.len() {
      1 => Ok(RowRef { rows, index: 0 }),
      0 => Err(SingleRowError::FamilyEmpty),
      n => Err(SingleRowError::FamilyAmbiguous(n)),
    }
  }

  /// Resolve a weak handle, or `None` once the row has died.
  pub fn try_resolve(&self, weak: WeakRow<T>) -> Option<RowRef<'_, T>> {
    let rows = self.rows();
    let index = rows.core.anchors.resolve(weak.slot, weak.generation)?;
    Some(RowRef { rows, index })
  }

  /// Resolve a weak handle, with an error for code that considers absence a
  /// failure. Callers that expect rows to come and go should branch on
  /// [`try_resolve`](Self::try_resolve) instead.
  pub fn resolve(
    &self,
    weak: WeakRow<T>,
  ) -> Result<RowRef<'_, T>, DanglingFamilyRef> {
    self.try_resolve(weak).ok_or(DanglingFamilyRef)
  }

  /// Run `f` with the span of freshly added rows at each refresh.
  ///
  /// The callback runs inside the refresh with the family locked; it must
  /// not touch this binding (or any other handle to the same family).
  pub fn on_rows_added(&self, f: impl Fn(&[T]) + Send + Sync + 'static) {
    self.family.push_listener_added(Box::new(f));
  }

  /// Run `f` with the span of removed rows, after they are compacted to the
  /// tail and before the buffer shrinks. Same locking caveat as
  /// [`on_rows_added`](Self::on_rows_added).
  pub fn on_rows_removed(&self, f: impl Fn(&[T]) + Send + Sync + 'static) {
    self.family.push_listener_removed(Box::new(f));
  }

  /// Run `f` with the batch of reloaded rows. Same locking caveat as
  /// [`on_rows_added`](Self::on_rows_added).
  pub fn on_rows_reloaded(&self, f: impl Fn(&[&T]) + Send + Sync + 'static) {
    self.family.push_listener_reloaded(Box::new(f));
  }
}

/// Read guard over a family's rows, in buffer order.
pub struct FamilyRows<'a, T: FamilyRow> {
  core: std::sync::RwLockReadGuard<'a, FamilyCore<T>>,
}

impl<'a, T: FamilyRow> FamilyRows<'a, T> {
  pub fn iter(&self) -> std::slice::Iter<'_, T> {
    self.core.rows.iter()
  }

  pub fn single(&self) -> Result<&T, SingleRowError> {
    match self.core.rows.as_slice() {
      [row] => Ok(row),
      [] => Err(SingleRowError::FamilyEmpty),
      rows => Err(SingleRowError::FamilyAmbiguous(rows.len())),
    }
  }

  /// Linear search for the first row matching the predicate.
  pub fn try_match(&self, pred: impl FnMut(&&T) -> bool) -> Option<&T> {
    self.core.rows.iter().find(pred)
  }

  /// Like [`try_match`](Self::try_match) but absence is an error.
  pub fn match_row(
    &self,
    pred: impl FnMut(&&T) -> bool,
  ) -> Result<&T, NoRowMatches> {
    self.try_match(pred).ok_or(NoRowMatches)
  }
}

impl<'a, T: FamilyRow> std::ops::Deref for FamilyRows<'a, T> {
  type Target = [T];

  fn deref(&self) -> &Self::Target {
    &self.core.rows
  }
}

impl<'a, 'b, T: FamilyRow> IntoIterator for &'b FamilyRows<'a, T> {
  type Item = &'b T;
  type IntoIter = std::slice::Iter<'b, T>;

  fn into_iter(self) -> Self::IntoIter {
    self.iter()
  }
}

/// No row in the family matched the predicate.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("no row in the family matches the predicate")]
pub struct NoRowMatches;

/// A guard dereferencing to one row.
pub struct RowRef<'a, T: FamilyRow> {
  rows: FamilyRows<'a, T>,
  index: usize,
}

impl<'a, T: FamilyRow> std::ops::Deref for RowRef<'a, T> {
  type Target = T;

  fn deref(&self) -> &Self::Target {
    &self.rows[self.index]
  }
}
