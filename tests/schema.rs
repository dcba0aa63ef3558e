//! Loading and validating the declarative ECS schema.

use kinship::schema::{EcsSchema, SchemaConflict, SystemMethod};
use kinship::system::{AccessFlags, Strategy};
use kinship::system_message::SystemMessageDestination;

const SCHEMA: &str = r#"
component "Velocity" {
  member "dx" type="f32" default="0"
  member "dy" type="f32" default="0"
}

component "Position" {
  member "x" type="f32"
  member "y" type="f32" serializable=false
}

component "Sprite" id=40 {
  member "image" type="String"
}

system "Movement" strategy="individual" method="update" world=true smearing=2 {
  family "mover" {
    component "Position" write=true
    component "Velocity"
    component "Sprite" optional=true
  }
  message "Teleport" receive=true
  system-message "PauseAll" receive=true
  service "ClockService"
}

system "SpriteRenderer" strategy="global" method="render" {
  family "sprites" {
    component "Position"
    component "Sprite"
  }
}

message "Teleport" {
  member "x" type="f32"
  member "y" type="f32"
}

system-message "PauseAll" destination="local" multicast=true

service "ClockService"

custom-type "Vec2" include="geom/vec2"
"#;

fn load() -> EcsSchema {
  let mut schema = EcsSchema::default();
  schema
    .load_str(SCHEMA, "game.kdl")
    .unwrap_or_else(|e| panic!("{:?}", miette::Report::new(e)));
  schema
}

#[test]
fn records_parse_with_their_attributes() {
  let schema = load();

  assert_eq!(schema.components.len(), 3);
  let position = &schema.components[1];
  assert_eq!(position.name, "Position");
  assert_eq!(position.members.len(), 2);
  assert!(position.members[0].serializable);
  assert!(!position.members[1].serializable);

  let movement = &schema.systems[0];
  assert_eq!(movement.strategy, Strategy::Individual);
  assert_eq!(movement.method, SystemMethod::Update);
  assert!(movement.access.contains(AccessFlags::WORLD));
  assert_eq!(movement.smearing, 2);
  assert_eq!(movement.families.len(), 1);
  let mover = &movement.families[0];
  assert!(mover.components[0].write);
  assert!(mover.components[2].optional);
  assert_eq!(movement.messages[0].name, "Teleport");
  assert!(movement.messages[0].receive);
  assert_eq!(movement.services[0].name, "ClockService");

  let renderer = &schema.systems[1];
  assert_eq!(renderer.method, SystemMethod::Render);
  assert_eq!(renderer.strategy, Strategy::Global);

  let pause = &schema.system_messages[0];
  assert_eq!(pause.destination, SystemMessageDestination::Local);
  assert!(pause.multicast);
  assert_eq!(pause.return_type, "()");
}

#[test]
fn validation_assigns_dense_ids_in_sorted_name_order() {
  let mut schema = load();
  schema.validate().unwrap();

  let id_of = |name: &str| {
    schema
      .components
      .iter()
      .find(|c| c.name == name)
      .unwrap()
      .id
      .unwrap()
  };
  // Sprite keeps its persisted id; the rest fill in by sorted name.
  assert_eq!(id_of("Sprite"), 40);
  assert_eq!(id_of("Position"), 0);
  assert_eq!(id_of("Velocity"), 1);

  assert_eq!(schema.messages[0].id, Some(0));
  assert_eq!(schema.system_messages[0].id, Some(0));
}

#[test]
fn validation_is_stable_for_persisted_ids() {
  let mut schema = load();
  schema.validate().unwrap();
  let once = schema.clone();
  schema.validate().unwrap();
  assert_eq!(schema, once);
}

#[test]
fn identical_duplicate_records_collapse() {
  let mut schema = load();
  schema
    .load_str(
      r#"service "ClockService""#,
      "dup.kdl",
    )
    .unwrap();
  schema.validate().unwrap();
  assert_eq!(schema.services.len(), 1);
}

#[test]
fn conflicting_shapes_for_one_name_are_rejected() {
  let mut schema = load();
  schema
    .load_str(
      r#"
      component "Position" {
        member "altitude" type="f64"
      }
      "#,
      "conflict.kdl",
    )
    .unwrap();
  assert!(matches!(
    schema.validate(),
    Err(SchemaConflict::DuplicateName { kind: "component", .. })
  ));
}

#[test]
fn families_may_only_reference_declared_components() {
  let mut schema = load();
  schema
    .load_str(
      r#"
      system "Haunting" {
        family "ghosts" {
          component "Ectoplasm"
        }
      }
      "#,
      "broken.kdl",
    )
    .unwrap();
  let err = schema.validate().unwrap_err();
  assert_eq!(
    err,
    SchemaConflict::UnknownComponent {
      system: "Haunting".into(),
      family: "ghosts".into(),
      component: "Ectoplasm".into(),
    }
  );
}

#[test]
fn systems_may_only_reference_declared_services_and_messages() {
  let mut schema = load();
  schema
    .load_str(
      r#"
      system "Chrono" {
        service "TimeService"
      }
      "#,
      "broken.kdl",
    )
    .unwrap();
  assert!(matches!(
    schema.validate(),
    Err(SchemaConflict::UnknownService { .. })
  ));

  let mut schema = load();
  schema
    .load_str(
      r#"
      system "Gossip" {
        message "Rumor" send=true
      }
      "#,
      "broken.kdl",
    )
    .unwrap();
  assert!(matches!(
    schema.validate(),
    Err(SchemaConflict::UnknownMessage { .. })
  ));
}

#[test]
fn duplicate_explicit_ids_are_rejected() {
  let mut schema = EcsSchema::default();
  schema
    .load_str(
      r#"
      component "A" id=3
      component "B" id=3
      "#,
      "dup-ids.kdl",
    )
    .unwrap();
  assert!(matches!(
    schema.validate(),
    Err(SchemaConflict::DuplicateId { id: 3, .. })
  ));
}
