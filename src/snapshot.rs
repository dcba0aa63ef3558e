//! Snapshotting a world and replaying it.
//!
//! A snapshot holds every live serializable entity (uuid, parent uuid,
//! partition tag, named component payloads), the in-flight entity-message
//! inboxes, and the queued system messages with their callback-continuation
//! tokens. Payloads are each type's own serialized bytes, produced through
//! the registries, so the snapshot container itself can be written in any
//! serde format.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

use crate::messages::{MessageEntry, MessageIndex};
use crate::system_message::SystemMessageContext;
use crate::world::World;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
  pub entities: Vec<EntitySnapshot>,
  pub inboxes: Vec<InboxSnapshot>,
  pub system_inboxes: Vec<SystemInboxSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
  pub uuid: Uuid,
  pub parent_uuid: Option<Uuid>,
  pub partition: u8,
  pub name: String,
  pub components: Vec<ComponentSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentSnapshot {
  pub name: String,
  pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxSnapshot {
  pub entity_uuid: Uuid,
  pub messages: Vec<MessageSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSnapshot {
  pub index: MessageIndex,
  pub payload: Vec<u8>,
  pub age: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemInboxSnapshot {
  pub system: String,
  pub messages: Vec<SystemMessageSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMessageSnapshot {
  pub index: MessageIndex,
  pub payload: Vec<u8>,
  /// Name of the registered continuation that stands in for the callback.
  pub continuation: Option<String>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("component {name:?} failed to serialize or deserialize: {source}")]
  Component {
    name: SmolStr,
    source: eyre::Report,
  },
  #[error("message {index:?} failed to serialize or deserialize: {source}")]
  Message {
    index: MessageIndex,
    source: eyre::Report,
  },
  #[error("snapshot names a system {0:?} this world does not have")]
  UnknownSystem(SmolStr),
  #[error("snapshot references an unregistered continuation {0:?}")]
  UnknownContinuation(SmolStr),
  #[error("an entity with uuid {0} already exists in this world")]
  UuidTaken(Uuid),
}

impl World {
  /// Capture every live, serializable entity plus the in-flight message
  /// state.
  pub fn snapshot(&self) -> Result<WorldSnapshot, SnapshotError> {
    let components_registry = self.context().components();
    let messages_registry = self.context().messages();

    let mut entities = Vec::new();
    let mut inboxes = Vec::new();
    for (id, entity) in self.table().iter_live() {
      if !entity.is_serializable() || entity.is_stub() {
        continue;
      }

      let mut components = Vec::new();
      for (index, entry) in entity.live_entries() {
        let reflector = match components_registry.reflector_for(*index) {
          Ok(reflector) => reflector,
          Err(_) => continue,
        };
        if !reflector.is_serializable() {
          tracing::trace!(
            component = %reflector.name,
            "skipping non-serializable component in snapshot"
          );
          continue;
        }
        let lock = entry
          .try_read()
          .unwrap_or_else(|_| panic!("{:?} is locked during snapshot", id));
        let data = reflector.serialize(&**lock).map_err(|source| {
          SnapshotError::Component {
            name: reflector.name.clone(),
            source,
          }
        })?;
        components.push(ComponentSnapshot {
          name: reflector.name.to_string(),
          data,
        });
      }

      let parent_uuid = entity
        .parent()
        .and_then(|parent| self.table().read(parent))
        .map(|parent| parent.instance_uuid());

      entities.push(EntitySnapshot {
        uuid: entity.instance_uuid(),
        parent_uuid,
        partition: entity.world_partition(),
        name: entity.name().to_string(),
        components,
      });

      if !entity.inbox.is_empty() {
        let mut messages = Vec::new();
        for entry in &entity.inbox {
          if entry.consumed {
            continue;
          }
          let payload =
            messages_registry.serialize(&*entry.msg).map_err(|source| {
              SnapshotError::Message {
                index: entry.index(),
                source,
              }
            })?;
          messages.push(MessageSnapshot {
            index: entry.index(),
            payload,
            age: entry.age(),
          });
        }
        if !messages.is_empty() {
          inboxes.push(InboxSnapshot {
            entity_uuid: entity.instance_uuid(),
            messages,
          });
        }
      }
    }

    let mut system_inboxes = Vec::new();
    {
      let directory = self.directory.read().unwrap();
      for slot in directory.iter() {
        let inbox = slot.inbox.lock().unwrap();
        if inbox.is_empty() {
          continue;
        }
        let mut messages = Vec::new();
        for context in inbox.iter() {
          let payload = self
            .context()
            .system_messages()
            .serialize(&*context.msg)
            .map_err(|source| SnapshotError::Message {
              index: context.index,
              source,
            })?;
          if context.callback.is_some() && context.continuation.is_none() {
            tracing::warn!(
              system = %slot.name,
              index = ?context.index,
              "queued system message has a closure callback; it will not survive the snapshot"
            );
          }
          messages.push(SystemMessageSnapshot {
            index: context.index,
            payload,
            continuation: context
              .continuation
              .as_ref()
              .map(|token| token.to_string()),
          });
        }
        system_inboxes.push(SystemInboxSnapshot {
          system: slot.name.to_string(),
          messages,
        });
      }
    }

    tracing::debug!(
      entities = entities.len(),
      inboxes = inboxes.len(),
      system_inboxes = system_inboxes.len(),
      "world snapshot taken"
    );
    Ok(WorldSnapshot {
      entities,
      inboxes,
      system_inboxes,
    })
  }

  /// Replay a snapshot into this world: entities first (two passes, so
  /// parent links resolve), then a refresh so families are coherent, then
  /// the message state. Callbacks are rebound through the continuation
  /// registry.
  pub fn load_snapshot(
    &mut self,
    snapshot: &WorldSnapshot,
  ) -> Result<(), SnapshotError> {
    for entity in &snapshot.entities {
      if self.table().entity_by_uuid(&entity.uuid).is_some() {
        return Err(SnapshotError::UuidTaken(entity.uuid));
      }
    }

    // Entities and their components.
    for snap in &snapshot.entities {
      let id = {
        let entity =
          self.create_entity_with_uuid(snap.uuid, snap.name.as_str());
        entity.id
      };
      for component in &snap.components {
        let reflector = self
          .context()
          .components()
          .reflector_by_name(&component.name)
          .map_err(|err| SnapshotError::Component {
            name: SmolStr::new(&component.name),
            source: eyre::Report::new(err),
          })?;
        let boxed = reflector.deserialize(&component.data).map_err(|source| {
          SnapshotError::Component {
            name: SmolStr::new(&component.name),
            source,
          }
        })?;
        self.attach_boxed(id, boxed);
      }
    }

    // Parent links, then partition tags (directly, so a child's own tag is
    // not clobbered by propagation).
    for snap in &snapshot.entities {
      let id = self
        .table()
        .entity_by_uuid(&snap.uuid)
        .expect("entity was just created");
      if let Some(parent_uuid) = snap.parent_uuid {
        if let Some(parent) = self.table().entity_by_uuid(&parent_uuid) {
          self.table_mut().set_parent(id, Some(parent));
        }
      }
    }
    for snap in &snapshot.entities {
      let id = self
        .table()
        .entity_by_uuid(&snap.uuid)
        .expect("entity was just created");
      if let Some(mut entity) = self.table().write(id) {
        entity.world_partition = snap.partition;
      }
    }

    self
      .refresh()
      .expect("nothing can iterate families during a snapshot load");

    // Entity inboxes.
    for inbox in &snapshot.inboxes {
      let Some(id) = self.table().entity_by_uuid(&inbox.entity_uuid) else {
        continue;
      };
      let Some(mut entity) = self.table().write(id) else {
        continue;
      };
      for snap in &inbox.messages {
        let msg = self
          .context()
          .messages()
          .deserialize(snap.index, &snap.payload)
          .map_err(|source| SnapshotError::Message {
            index: snap.index,
            source,
          })?;
        let mut entry = MessageEntry::new(msg, snap.index, None);
        entry.age = snap.age;
        entity.inbox.push(entry);
      }
    }

    // Queued system messages, callbacks rebound by continuation token.
    for inbox in &snapshot.system_inboxes {
      let slot_inbox = {
        let directory = self.directory.read().unwrap();
        directory
          .iter()
          .find(|slot| slot.name == inbox.system.as_str())
          .map(|slot| slot.inbox.clone())
          .ok_or_else(|| {
            SnapshotError::UnknownSystem(SmolStr::new(&inbox.system))
          })?
      };
      for snap in &inbox.messages {
        let msg = self
          .context()
          .system_messages()
          .deserialize(snap.index, &snap.payload)
          .map_err(|source| SnapshotError::Message {
            index: snap.index,
            source,
          })?;
        let continuation =
          snap.continuation.as_ref().map(SmolStr::new);
        let callback = match &continuation {
          Some(token) => Some(
            self.context().continuations().get(token).ok_or_else(|| {
              SnapshotError::UnknownContinuation(token.clone())
            })?,
          ),
          None => None,
        };
        slot_inbox.lock().unwrap().push_back(Arc::new(
          SystemMessageContext {
            index: snap.index,
            msg,
            callback,
            continuation,
            remote: false,
          },
        ));
      }
    }

    tracing::debug!(
      entities = snapshot.entities.len(),
      "world snapshot loaded"
    );
    Ok(())
  }
}
