//! The inter-system messaging plane.
//!
//! Systems address each other by name (or multicast to every capable
//! system). Local delivery is same-step for recipients later in the system
//! order and next-step for earlier ones; remote destinations hand the
//! serialized message to a pluggable transport. Replies flow back through a
//! callback, either with the value itself (local) or with the bytes the
//! transport carried (remote).

use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use downcast::{downcast, Any};
use serde::{de::DeserializeOwned, Serialize};
use smol_str::SmolStr;

use crate::messages::MessageIndex;
use crate::world::World;

/// Where a system message goes. Anything but `Local` is carried by the
/// world's [`SystemMessageTransport`].
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  serde::Serialize,
  serde::Deserialize,
)]
pub enum SystemMessageDestination {
  Local,
  Host,
  AllClients,
  RemoteClients,
}

impl SystemMessageDestination {
  pub fn as_str(self) -> &'static str {
    match self {
      SystemMessageDestination::Local => "local",
      SystemMessageDestination::Host => "host",
      SystemMessageDestination::AllClients => "all_clients",
      SystemMessageDestination::RemoteClients => "remote_clients",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    Some(match s {
      "local" => SystemMessageDestination::Local,
      "host" => SystemMessageDestination::Host,
      "all_clients" | "allClients" => SystemMessageDestination::AllClients,
      "remote_clients" | "remoteClients" => {
        SystemMessageDestination::RemoteClients
      }
      _ => return None,
    })
  }

  pub fn is_local(self) -> bool {
    matches!(self, SystemMessageDestination::Local)
  }
}

/// A message addressed to systems rather than entities.
///
/// Use `#[derive(SystemMessage)]` with
/// `#[system_message(index = N, destination = …, returns = …)]` rather than
/// implementing this (and [`SystemMessageSpec`]) by hand.
pub trait SystemMessage: Any + Send + Sync {
  /// The dense index for this system message type.
  fn index() -> MessageIndex
  where
    Self: Sized;

  /// The index, through a type-erased handle.
  fn message_index(&self) -> MessageIndex;
  fn destination(&self) -> SystemMessageDestination;
  fn is_multicast(&self) -> bool;
}
downcast!(dyn SystemMessage);

/// The compile-time face of a system message type: its reply type and
/// routing constants, used by the typed send methods.
pub trait SystemMessageSpec: SystemMessage {
  type Return: Send + 'static;

  const DESTINATION: SystemMessageDestination;
  const MULTICAST: bool;
}

/// What a handler's reply reaches the sender's callback as.
pub enum CallbackPayload {
  /// The return value itself, from a handler in the same world.
  Local(Box<dyn std::any::Any + Send>),
  /// The serialized return value, carried back by a transport.
  Remote(Vec<u8>),
}

/// Reply callbacks get the world so continuations can act on it after a
/// snapshot reload.
pub type SystemMessageCallback =
  Arc<dyn Fn(&World, CallbackPayload) + Send + Sync>;

/// One system message in flight, shared between every recipient's inbox.
pub struct SystemMessageContext {
  pub(crate) index: MessageIndex,
  pub(crate) msg: Box<dyn SystemMessage>,
  pub(crate) callback: Option<SystemMessageCallback>,
  /// Registered continuation name, if the callback must survive snapshots.
  pub(crate) continuation: Option<SmolStr>,
  /// True when the reply must be serialized for a transport.
  pub(crate) remote: bool,
}

/// What [`System::on_system_message`](crate::system::System::on_system_message)
/// returns; wraps the value fed to the sender's callback.
pub struct SystemMessageReply(pub(crate) Box<dyn std::any::Any + Send>);

impl SystemMessageReply {
  /// The reply for handlers of messages whose return type is `()`.
  pub fn unit() -> Self {
    Self(Box::new(()))
  }

  pub fn value<V: Send + 'static>(value: V) -> Self {
    Self(Box::new(value))
  }
}

pub(crate) fn typed_callback<M, F>(f: F) -> SystemMessageCallback
where
  M: SystemMessageSpec,
  M::Return: DeserializeOwned,
  F: Fn(M::Return) + Send + Sync + 'static,
{
  Arc::new(move |_world: &World, payload: CallbackPayload| match payload {
    CallbackPayload::Local(any) => match any.downcast::<M::Return>() {
      Ok(value) => f(*value),
      Err(_) => tracing::error!(
        message = std::any::type_name::<M>(),
        "system message reply had the wrong type"
      ),
    },
    CallbackPayload::Remote(bytes) => {
      match bincode::deserialize::<M::Return>(&bytes) {
        Ok(value) => f(value),
        Err(err) => tracing::error!(
          message = std::any::type_name::<M>(),
          error = %err,
          "could not deserialize remote system message reply"
        ),
      }
    }
  })
}

/// Failures of the system-message send path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SystemMessageError {
  #[error("no system can handle message {index:?} (target {target:?})")]
  NoRecipient {
    index: MessageIndex,
    target: Option<SmolStr>,
  },
  #[error("{count} systems can handle unicast message {index:?}")]
  AmbiguousRecipient { index: MessageIndex, count: usize },
  #[error("message {index:?} has a remote destination but the world has no transport")]
  NoTransport { index: MessageIndex },
  #[error("message {index:?} could not be serialized for transport: {reason}")]
  Serialize {
    index: MessageIndex,
    reason: String,
  },
  #[error("no continuation registered under the name {0:?}")]
  UnknownContinuation(SmolStr),
}

/// A serialized system message on its way out of the world. The core treats
/// the transport as an opaque sink.
pub struct OutboundSystemMessage {
  pub destination: SystemMessageDestination,
  pub target_system: Option<SmolStr>,
  pub index: MessageIndex,
  pub payload: Vec<u8>,
  /// The sender's reply handler, if any. The transport invokes it with
  /// [`CallbackPayload::Remote`] when the serialized reply comes back.
  pub callback: Option<SystemMessageCallback>,
}

/// Pluggable carrier for non-local destinations.
pub trait SystemMessageTransport: Send + Sync {
  fn deliver(&self, outbound: OutboundSystemMessage);
}

type SerializeFn = fn(&dyn SystemMessage) -> eyre::Result<Vec<u8>>;
type DeserializeFn = fn(&[u8]) -> eyre::Result<Box<dyn SystemMessage>>;
type SerializeReplyFn =
  fn(&dyn std::any::Any) -> eyre::Result<Vec<u8>>;

/// Maps dense system-message indices to byte-level serde, for snapshots and
/// remote delivery.
pub struct SystemMessageRegistry {
  inner: RwLock<AHashMap<MessageIndex, SystemMessageVtable>>,
}

#[derive(Clone)]
struct SystemMessageVtable {
  name: SmolStr,
  serialize: SerializeFn,
  deserialize: DeserializeFn,
  serialize_reply: SerializeReplyFn,
}

fn serialize_erased<M: SystemMessage + Serialize>(
  msg: &dyn SystemMessage,
) -> eyre::Result<Vec<u8>> {
  let concrete = msg
    .downcast_ref::<M>()
    .map_err(|_| eyre::eyre!("system message index points at the wrong type"))?;
  Ok(bincode::serialize(concrete)?)
}

fn deserialize_erased<M: SystemMessage + DeserializeOwned>(
  data: &[u8],
) -> eyre::Result<Box<dyn SystemMessage>> {
  let concrete: M = bincode::deserialize(data)?;
  Ok(Box::new(concrete) as _)
}

fn serialize_reply_erased<M: SystemMessageSpec>(
  reply: &dyn std::any::Any,
) -> eyre::Result<Vec<u8>>
where
  M::Return: Serialize,
{
  let concrete = reply
    .downcast_ref::<M::Return>()
    .ok_or_else(|| eyre::eyre!("system message reply has the wrong type"))?;
  Ok(bincode::serialize(concrete)?)
}

impl SystemMessageRegistry {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(AHashMap::new()),
    }
  }

  pub fn register<M>(&self)
  where
    M: SystemMessageSpec + Serialize + DeserializeOwned,
    M::Return: Serialize,
  {
    let mut inner = self.inner.write().unwrap();
    let name = SmolStr::new(std::any::type_name::<M>());
    let index = M::index();
    if let Some(extant) = inner.get(&index) {
      if extant.name == name {
        return;
      }
      panic!(
        "system message index {:?} is registered to both {} and {}",
        index,
        extant.name,
        name
      );
    }
    inner.insert(
      index,
      SystemMessageVtable {
        name,
        serialize: serialize_erased::<M>,
        deserialize: deserialize_erased::<M>,
        serialize_reply: serialize_reply_erased::<M>,
      },
    );
  }

  /// Serialize a handler's reply for the transport to carry back.
  pub fn serialize_reply(
    &self,
    index: MessageIndex,
    reply: &dyn std::any::Any,
  ) -> eyre::Result<Vec<u8>> {
    let vtable = self.vtable(index)?;
    (vtable.serialize_reply)(reply)
  }

  pub fn serialize(&self, msg: &dyn SystemMessage) -> eyre::Result<Vec<u8>> {
    let vtable = self.vtable(msg.message_index())?;
    (vtable.serialize)(msg)
  }

  /// The `create_system_message` factory: rebuild a system message from its
  /// serialized form.
  pub fn deserialize(
    &self,
    index: MessageIndex,
    data: &[u8],
  ) -> eyre::Result<Box<dyn SystemMessage>> {
    let vtable = self.vtable(index)?;
    (vtable.deserialize)(data)
  }

  fn vtable(
    &self,
    index: MessageIndex,
  ) -> eyre::Result<SystemMessageVtable> {
    self
      .inner
      .read()
      .unwrap()
      .get(&index)
      .cloned()
      .ok_or_else(|| {
        eyre::eyre!("no system message type registered under index {:?}", index)
      })
  }
}

impl Default for SystemMessageRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Named reply handlers that survive snapshots. A system message sent with a
/// continuation token stores the token, not the closure; reload looks the
/// callback back up here.
pub struct ContinuationRegistry {
  inner: RwLock<AHashMap<SmolStr, SystemMessageCallback>>,
}

impl ContinuationRegistry {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(AHashMap::new()),
    }
  }

  pub fn register(
    &self,
    name: impl Into<SmolStr>,
    f: impl Fn(&World, CallbackPayload) + Send + Sync + 'static,
  ) {
    let name = name.into();
    let mut inner = self.inner.write().unwrap();
    if inner.insert(name.clone(), Arc::new(f)).is_some() {
      panic!("a continuation named {:?} was already registered", name);
    }
  }

  pub fn get(&self, name: &str) -> Option<SystemMessageCallback> {
    self.inner.read().unwrap().get(name).cloned()
  }
}

impl Default for ContinuationRegistry {
  fn default() -> Self {
    Self::new()
  }
}
