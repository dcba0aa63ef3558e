//! Prefab instantiation, splicing/merging, and in-place reload.

use std::sync::{Arc, Mutex};

use kinship::family;
use kinship::prefab::{InstantiationError, PrefabFabricator, PrefabLookupError};
use kinship::prelude::*;
use serde::{Deserialize, Serialize};

const PREFABS: &str = r#"
mob {
  physic-body mass=10
}

cat {
  (splice)mob
  physic-body mass=50
  whiskers count=24
}

housecat {
  (splice)cat
  name "Macy"
}
"#;

#[test]
fn instantiation_assembles_spliced_components() {
  let (mut world, fab) = setup();

  let id = fab.instantiate("housecat", &mut world, &()).unwrap();
  world.refresh().unwrap();

  let entity = world.entity(id).unwrap();
  assert!(entity.is_from_prefab());
  assert_eq!(
    entity.get_component::<PhysicBody>().unwrap().borrow().mass,
    50,
    "the later node clobbers the spliced one"
  );
  assert_eq!(
    entity.get_component::<Whiskers>().unwrap().borrow().count,
    24
  );
  assert_eq!(
    entity.get_component::<Name>().unwrap().borrow().0,
    "Macy"
  );
}

#[test]
fn merge_updates_an_already_loaded_prefab() {
  let (mut world, mut fab) = setup();
  fab
    .load_str(
      r#"
      cat {
        whiskers count=30
      }
      "#,
      "patch.kdl",
    )
    .unwrap();

  let id = fab.instantiate("cat", &mut world, &()).unwrap();
  world.refresh().unwrap();

  let entity = world.entity(id).unwrap();
  assert_eq!(
    entity.get_component::<Whiskers>().unwrap().borrow().count,
    30
  );
  assert_eq!(
    entity.get_component::<PhysicBody>().unwrap().borrow().mass,
    50,
    "unpatched components are kept"
  );
}

#[test]
fn reload_replaces_components_in_place() {
  let (mut world, mut fab) = setup();
  let cats = world.family::<CatRow>();

  let id = fab.instantiate("cat", &mut world, &()).unwrap();
  world.refresh().unwrap();
  assert_eq!(cats.len(), 1);
  let weak = cats.rows()[0].weak_handle();

  let reloads: Arc<Mutex<usize>> = Default::default();
  let removals: Arc<Mutex<usize>> = Default::default();
  {
    let reloads = reloads.clone();
    cats.on_rows_reloaded(move |rows| *reloads.lock().unwrap() += rows.len());
    let removals = removals.clone();
    cats.on_rows_removed(move |rows| *removals.lock().unwrap() += rows.len());
  }

  // An edited prefab arrives and every instance reloads.
  fab
    .load_str(
      r#"
      cat {
        physic-body mass=9000
      }
      "#,
      "patch.kdl",
    )
    .unwrap();
  let touched = fab.reload("cat", &mut world, &()).unwrap();
  assert_eq!(touched, 1);
  world.refresh().unwrap();

  assert_eq!(cats.len(), 1);
  assert_eq!(*reloads.lock().unwrap(), 1);
  assert_eq!(*removals.lock().unwrap(), 0, "a reload is not a re-add");
  assert!(
    cats.try_resolve(weak).is_some(),
    "rows keep their anchors across a prefab reload"
  );
  assert_eq!(cats.rows()[0].body.borrow().mass, 9000);
  assert_eq!(
    world
      .entity(id)
      .unwrap()
      .get_component::<Whiskers>()
      .unwrap()
      .borrow()
      .count,
    24,
    "components the patch left alone survive"
  );
}

#[test]
fn unknown_prefabs_and_factories_error_out() {
  let (mut world, fab) = setup();

  assert!(matches!(
    fab.instantiate("dog", &mut world, &()),
    Err(InstantiationError::Lookup(PrefabLookupError::PrefabNotFound(_)))
  ));

  let mut fab = PrefabFabricator::<()>::new();
  fab
    .load_str(
      r#"
      mystery {
        unknowable
      }
      "#,
      "mystery.kdl",
    )
    .unwrap();
  assert!(matches!(
    fab.instantiate("mystery", &mut world, &()),
    Err(InstantiationError::NoFactory(name)) if name == "unknowable"
  ));
}

#[test]
fn splice_loops_are_reported() {
  let mut fab = PrefabFabricator::<()>::new();
  fab
    .load_str(
      r#"
      ouroboros {
        (splice)tail
      }
      tail {
        (splice)ouroboros
      }
      "#,
      "loop.kdl",
    )
    .unwrap();
  assert!(matches!(
    fab.lookup("ouroboros"),
    Err(PrefabLookupError::SpliceLoop(_))
  ));
}

// === fixtures ===

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 0, name = "physic-body")]
struct PhysicBody {
  mass: u32,
}

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 1, name = "whiskers")]
struct Whiskers {
  count: u32,
}

#[derive(Component, Serialize, Deserialize, Debug)]
#[component(index = 2, name = "name")]
struct Name(String);

family! {
  struct CatRow {
    required {
      body: read PhysicBody,
      whiskers: read Whiskers,
    }
  }
}

fn setup() -> (World, PrefabFabricator<()>) {
  let ctx = EcsContext::new();
  ctx.register_component::<PhysicBody>();
  ctx.register_component::<Whiskers>();
  ctx.register_component::<Name>();
  let world = World::new(ctx);

  let mut fab = PrefabFabricator::new();
  fab.register_serde::<PhysicBody>("physic-body");
  fab.register_serde::<Whiskers>("whiskers");
  fab.register_serde::<Name>("name");
  fab
    .load_str(PREFABS, "prefabs.kdl")
    .unwrap_or_else(|e| panic!("{:?}", miette::Report::new(e)));

  (world, fab)
}
