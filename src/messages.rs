//! The per-entity messaging plane.
//!
//! Systems address messages to an [`EntityId`]; the message sits in that
//! entity's inbox from the refresh that routes it until the next step, when
//! every system that declared interest in its index and whose receiving
//! families contain the entity observes it exactly once. Unconsumed messages
//! age by one per step and are dropped at the TTL.

use downcast::{downcast, Any};
use serde::{de::DeserializeOwned, Serialize};
use smol_str::SmolStr;
use std::sync::RwLock;

use ahash::AHashMap;

use crate::entity::EntityId;

/// Dense index assigned to each message type by the schema compiler.
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
pub struct MessageIndex(pub u16);

/// Data sent to a single entity and observed by interested systems next
/// step.
///
/// Use `#[derive(Message)]` with `#[message(index = N)]` rather than
/// implementing this by hand.
pub trait Message: Any + Send + Sync {
  /// The dense index for this message type.
  fn index() -> MessageIndex
  where
    Self: Sized;

  /// The index, through a type-erased handle.
  fn message_index(&self) -> MessageIndex;
}
downcast!(dyn Message);

/// One message sitting in an entity's inbox.
pub struct MessageEntry {
  pub(crate) msg: Box<dyn Message>,
  pub(crate) index: MessageIndex,
  pub(crate) age: u32,
  pub(crate) consumed: bool,
  pub(crate) sender: Option<u32>,
}

impl MessageEntry {
  pub(crate) fn new(
    msg: Box<dyn Message>,
    index: MessageIndex,
    sender: Option<u32>,
  ) -> Self {
    Self {
      msg,
      index,
      age: 0,
      consumed: false,
      sender,
    }
  }

  pub fn index(&self) -> MessageIndex {
    self.index
  }

  pub fn age(&self) -> u32 {
    self.age
  }
}

/// A message on its way to an entity inbox; buffered until the refresh so
/// that delivery is strictly next-step.
pub(crate) struct OutgoingMessage {
  pub target: EntityId,
  pub entry: MessageEntry,
}

type MessageSerializeFn = fn(&dyn Message) -> eyre::Result<Vec<u8>>;
type MessageDeserializeFn = fn(&[u8]) -> eyre::Result<Box<dyn Message>>;

/// Maps dense message indices to names and byte-level serde, for snapshots
/// and remote delivery.
pub struct MessageRegistry {
  inner: RwLock<AHashMap<MessageIndex, MessageVtable>>,
}

#[derive(Clone)]
struct MessageVtable {
  name: SmolStr,
  serialize: MessageSerializeFn,
  deserialize: MessageDeserializeFn,
}

fn serialize_erased<M: Message + Serialize>(
  msg: &dyn Message,
) -> eyre::Result<Vec<u8>> {
  let concrete = msg
    .downcast_ref::<M>()
    .map_err(|_| eyre::eyre!("message index points at the wrong type"))?;
  Ok(bincode::serialize(concrete)?)
}

fn deserialize_erased<M: Message + DeserializeOwned>(
  data: &[u8],
) -> eyre::Result<Box<dyn Message>> {
  let concrete: M = bincode::deserialize(data)?;
  Ok(Box::new(concrete) as _)
}

impl MessageRegistry {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(AHashMap::new()),
    }
  }

  /// Idempotent for a given type; registering two types under one index
  /// panics.
  pub fn register<M: Message + Serialize + DeserializeOwned>(&self) {
    let mut inner = self.inner.write().unwrap();
    let name = SmolStr::new(std::any::type_name::<M>());
    let index = M::index();
    if let Some(extant) = inner.get(&index) {
      if extant.name == name {
        return;
      }
      panic!(
        "message index {:?} is registered to both {} and {}",
        index,
        extant.name,
        name
      );
    }
    inner.insert(
      index,
      MessageVtable {
        name,
        serialize: serialize_erased::<M>,
        deserialize: deserialize_erased::<M>,
      },
    );
  }

  pub fn serialize(&self, msg: &dyn Message) -> eyre::Result<Vec<u8>> {
    let vtable = self.vtable(msg.message_index())?;
    (vtable.serialize)(msg)
  }

  /// The `create_message` factory: rebuild a message from its serialized
  /// form.
  pub fn deserialize(
    &self,
    index: MessageIndex,
    data: &[u8],
  ) -> eyre::Result<Box<dyn Message>> {
    let vtable = self.vtable(index)?;
    (vtable.deserialize)(data)
  }

  fn vtable(&self, index: MessageIndex) -> Result<MessageVtable, UnknownMessage> {
    self
      .inner
      .read()
      .unwrap()
      .get(&index)
      .cloned()
      .ok_or(UnknownMessage(index))
  }
}

impl Default for MessageRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Lookup miss in the message registry.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("no message type registered under index {0:?}")]
pub struct UnknownMessage(pub MessageIndex);
