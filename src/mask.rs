//! Interned component-set bitmasks.
//!
//! Every live entity and every family carries a [`MaskHandle`], a small copy
//! of an index into the [`MaskRegistry`]. Because handles are interned, two
//! handles are equal iff their bitmaps are equal, and membership tests reduce
//! to a couple of word-wide ANDs.

use std::fmt::Debug;
use std::sync::RwLock;

use ahash::AHashMap;

use crate::component::ComponentIndex;

/// Fixed mask width. Component indices must be below this.
pub const MASK_BITS: usize = 256;

const WORDS: usize = MASK_BITS / 64;

/// A raw bitset over component indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MaskBits([u64; WORDS]);

impl MaskBits {
  pub const EMPTY: MaskBits = MaskBits([0; WORDS]);

  pub fn from_indices(indices: &[ComponentIndex]) -> Self {
    let mut bits = MaskBits::EMPTY;
    for &idx in indices {
      bits.set(idx);
    }
    bits
  }

  pub fn set(&mut self, idx: ComponentIndex) {
    let bit = idx.0 as usize;
    assert!(bit < MASK_BITS, "component index {} out of mask range", bit);
    self.0[bit / 64] |= 1 << (bit % 64);
  }

  pub fn test(&self, idx: ComponentIndex) -> bool {
    let bit = idx.0 as usize;
    bit < MASK_BITS && self.0[bit / 64] & (1 << (bit % 64)) != 0
  }

  /// Does `self` contain every bit of `other`?
  pub fn contains(&self, other: &MaskBits) -> bool {
    self
      .0
      .iter()
      .zip(other.0.iter())
      .all(|(a, b)| a & b == *b)
  }

  pub fn union(&self, other: &MaskBits) -> MaskBits {
    let mut out = *self;
    for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
      *a |= b;
    }
    out
  }

  pub fn intersection(&self, other: &MaskBits) -> MaskBits {
    let mut out = *self;
    for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
      *a &= b;
    }
    out
  }

  pub fn symmetric_difference(&self, other: &MaskBits) -> MaskBits {
    let mut out = *self;
    for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
      *a ^= b;
    }
    out
  }

  pub fn is_empty(&self) -> bool {
    self.0.iter().all(|w| *w == 0)
  }
}

impl Debug for MaskBits {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut set = f.debug_set();
    for bit in 0..MASK_BITS {
      if self.test(ComponentIndex(bit as u16)) {
        set.entry(&bit);
      }
    }
    set.finish()
  }
}

/// An interned mask. Cheap to copy; equality is bitmap equality.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct MaskHandle(u32);

impl MaskHandle {
  /// The handle of the all-zeroes mask, interned at registry construction.
  pub const EMPTY: MaskHandle = MaskHandle(0);
}

/// Owns the backing bitmaps for every [`MaskHandle`] in circulation.
///
/// Append-only once worlds are running; lives on the
/// [`EcsContext`](crate::context::EcsContext) so multiple worlds share the
/// same handle space.
pub struct MaskRegistry {
  inner: RwLock<MaskRegistryInner>,
}

struct MaskRegistryInner {
  masks: Vec<MaskBits>,
  lookup: AHashMap<MaskBits, MaskHandle>,
}

impl MaskRegistry {
  pub fn new() -> Self {
    let mut lookup = AHashMap::new();
    lookup.insert(MaskBits::EMPTY, MaskHandle::EMPTY);
    Self {
      inner: RwLock::new(MaskRegistryInner {
        masks: vec![MaskBits::EMPTY],
        lookup,
      }),
    }
  }

  pub fn intern(&self, bits: MaskBits) -> MaskHandle {
    {
      let inner = self.inner.read().unwrap();
      if let Some(&handle) = inner.lookup.get(&bits) {
        return handle;
      }
    }
    let mut inner = self.inner.write().unwrap();
    // Someone may have beaten us between the locks.
    if let Some(&handle) = inner.lookup.get(&bits) {
      return handle;
    }
    let handle = MaskHandle(inner.masks.len() as u32);
    inner.masks.push(bits);
    inner.lookup.insert(bits, handle);
    handle
  }

  pub fn bits(&self, handle: MaskHandle) -> MaskBits {
    let inner = self.inner.read().unwrap();
    inner.masks[handle.0 as usize]
  }

  /// Is `a` a superset of `b`?
  pub fn contains(&self, a: MaskHandle, b: MaskHandle) -> bool {
    if a == b {
      return true;
    }
    let inner = self.inner.read().unwrap();
    inner.masks[a.0 as usize].contains(&inner.masks[b.0 as usize])
  }

  pub fn intersect(&self, a: MaskHandle, b: MaskHandle) -> MaskHandle {
    let bits = {
      let inner = self.inner.read().unwrap();
      inner.masks[a.0 as usize].intersection(&inner.masks[b.0 as usize])
    };
    self.intern(bits)
  }

  pub fn union(&self, a: MaskHandle, b: MaskHandle) -> MaskHandle {
    let bits = {
      let inner = self.inner.read().unwrap();
      inner.masks[a.0 as usize].union(&inner.masks[b.0 as usize])
    };
    self.intern(bits)
  }

  /// Did any bit in `watched` differ between `old` and `new`?
  pub fn changed_between(
    &self,
    old: MaskHandle,
    new: MaskHandle,
    watched: MaskHandle,
  ) -> bool {
    if old == new {
      return false;
    }
    let inner = self.inner.read().unwrap();
    let diff = inner.masks[old.0 as usize]
      .symmetric_difference(&inner.masks[new.0 as usize]);
    !diff
      .intersection(&inner.masks[watched.0 as usize])
      .is_empty()
  }
}

impl Default for MaskRegistry {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ix(n: u16) -> ComponentIndex {
    ComponentIndex(n)
  }

  #[test]
  fn interning_dedups() {
    let reg = MaskRegistry::new();
    let a = reg.intern(MaskBits::from_indices(&[ix(1), ix(200)]));
    let b = reg.intern(MaskBits::from_indices(&[ix(200), ix(1)]));
    let c = reg.intern(MaskBits::from_indices(&[ix(1)]));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(reg.intern(MaskBits::EMPTY), MaskHandle::EMPTY);
  }

  #[test]
  fn subset_and_intersection() {
    let reg = MaskRegistry::new();
    let ab = reg.intern(MaskBits::from_indices(&[ix(3), ix(64)]));
    let a = reg.intern(MaskBits::from_indices(&[ix(3)]));
    let b = reg.intern(MaskBits::from_indices(&[ix(64)]));
    assert!(reg.contains(ab, a));
    assert!(reg.contains(ab, b));
    assert!(!reg.contains(a, ab));
    assert_eq!(reg.intersect(ab, a), a);
    assert_eq!(reg.intersect(a, b), MaskHandle::EMPTY);
    assert_eq!(reg.union(a, b), ab);
  }

  #[test]
  fn changed_between_watches_only_requested_bits() {
    let reg = MaskRegistry::new();
    let old = reg.intern(MaskBits::from_indices(&[ix(1), ix(2)]));
    let new = reg.intern(MaskBits::from_indices(&[ix(1), ix(5)]));
    let watch_2 = reg.intern(MaskBits::from_indices(&[ix(2)]));
    let watch_1 = reg.intern(MaskBits::from_indices(&[ix(1)]));
    assert!(reg.changed_between(old, new, watch_2));
    assert!(!reg.changed_between(old, new, watch_1));
    assert!(!reg.changed_between(old, old, watch_2));
  }
}
