//! Host-provided singletons that systems look up by type.
//!
//! Services sit outside the ECS tick; the world only stores and hands them
//! out. The declarative schema names them so validation can check that a
//! system's service list points at something real.

use std::any::TypeId;
use std::sync::Arc;

use ahash::AHashMap;
use downcast::{downcast_sync, AnySync};
use smol_str::SmolStr;

/// Marker for objects usable as services.
pub trait Service: AnySync {}
downcast_sync!(dyn Service);

#[derive(Default)]
pub(crate) struct ServiceMap {
  by_type: AHashMap<TypeId, Arc<dyn Service>>,
  by_name: AHashMap<SmolStr, TypeId>,
}

impl ServiceMap {
  pub fn add<S: Service>(&mut self, name: impl Into<SmolStr>, service: Arc<S>) {
    let name = name.into();
    let tid = TypeId::of::<S>();
    if self.by_name.insert(name.clone(), tid).is_some() {
      panic!("a service named {:?} was already added", name);
    }
    self.by_type.insert(tid, service);
  }

  pub fn get<S: Service>(&self) -> Option<Arc<S>> {
    let service = self.by_type.get(&TypeId::of::<S>())?.clone();
    service.downcast_arc::<S>().ok()
  }

  pub fn contains_name(&self, name: &str) -> bool {
    self.by_name.contains_key(name)
  }
}
