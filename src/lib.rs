#![doc = include_str!("../README.md")]

pub mod binding;
pub mod component;
pub mod context;
pub mod entity;
pub mod family;
pub mod messages;
pub mod prefab;
pub mod schema;
pub mod service;
pub mod snapshot;
pub mod system;
pub mod system_message;
pub mod table;
pub mod world;

mod mask;
pub use mask::{MaskBits, MaskHandle, MaskRegistry, MASK_BITS};

use entity::EntityId;

#[cfg(feature = "derive")]
pub use kinship_macros::{Component, Message, SystemMessage};

fn lock_panic(entity: EntityId, type_name: &str) -> ! {
  panic!(
    "{:?} had its component {} borrowed while it was already mutably borrowed, probably from inside its own update. check the stacktrace.",
    entity, type_name
  )
}

pub mod prelude {
  pub use crate::binding::FamilyBinding;
  pub use crate::component::{Component, ComponentIndex, ComponentRef};
  pub use crate::context::EcsContext;
  pub use crate::entity::{EntityId, EntityRef};
  pub use crate::family::{FamilyRow, RowAnchor, WeakRow};
  pub use crate::messages::{Message, MessageIndex};
  pub use crate::system::{
    AccessFlags, Strategy, System, SystemBinder, SystemContext, Time, Timeline,
  };
  pub use crate::system_message::{
    SystemMessage, SystemMessageDestination, SystemMessageReply,
    SystemMessageSpec,
  };
  pub use crate::world::World;

  #[cfg(feature = "derive")]
  pub use kinship_macros::{Component, Message, SystemMessage};
}
