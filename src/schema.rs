//! The declarative ECS schema: the input half of the codegen contract.
//!
//! Components, systems, messages, system messages, services and custom types
//! are described in KDL, loaded into the record types here, and validated.
//! Validation assigns dense ids to records that lack one (in sorted-name
//! order, so assignment is deterministic) and rejects dangling references
//! with [`SchemaConflict`]. A code generator consumes the validated schema
//! to emit `#[derive(Component)]`/`family!`-style source; the runtime never
//! reads the schema after that.

use kdl::{KdlDocument, KdlNode, KdlValue};
use miette::{Diagnostic, NamedSource, SourceSpan};
use smol_str::SmolStr;
use thiserror::Error;

use crate::mask::MASK_BITS;
use crate::system_message::SystemMessageDestination;

/// Everything one schema document set declares.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EcsSchema {
  pub components: Vec<ComponentSchema>,
  pub systems: Vec<SystemSchema>,
  pub messages: Vec<MessageSchema>,
  pub system_messages: Vec<SystemMessageSchema>,
  pub services: Vec<ServiceSchema>,
  pub custom_types: Vec<CustomTypeSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberSchema {
  pub name: SmolStr,
  pub type_name: SmolStr,
  pub default: Option<SmolStr>,
  pub access: MemberAccess,
  pub serializable: bool,
  pub can_edit: bool,
  pub can_save: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberAccess {
  #[default]
  Public,
  Protected,
  Private,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSchema {
  pub name: SmolStr,
  /// Dense component index; filled in by validation when omitted.
  pub id: Option<u16>,
  pub members: Vec<MemberSchema>,
  pub includes: Vec<SmolStr>,
  pub custom_impl: Option<SmolStr>,
  pub depends_on: Vec<SmolStr>,
  pub generate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemMethod {
  #[default]
  Update,
  Render,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentReferenceSchema {
  pub name: SmolStr,
  pub write: bool,
  pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FamilySchema {
  pub name: SmolStr,
  pub components: Vec<ComponentReferenceSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageReferenceSchema {
  pub name: SmolStr,
  pub send: bool,
  pub receive: bool,
  /// Which family receipt is delivered against; defaults to the main one.
  pub family: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReferenceSchema {
  pub name: SmolStr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemSchema {
  pub name: SmolStr,
  pub strategy: crate::system::Strategy,
  pub method: SystemMethod,
  pub access: crate::system::AccessFlags,
  pub smearing: i64,
  pub families: Vec<FamilySchema>,
  pub messages: Vec<MessageReferenceSchema>,
  pub system_messages: Vec<MessageReferenceSchema>,
  pub services: Vec<ServiceReferenceSchema>,
  pub includes: Vec<SmolStr>,
  pub generate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
  pub name: SmolStr,
  /// Dense message index; filled in by validation when omitted.
  pub id: Option<u16>,
  pub members: Vec<MemberSchema>,
  pub serializable: bool,
  pub includes: Vec<SmolStr>,
  pub generate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessageSchema {
  pub name: SmolStr,
  pub id: Option<u16>,
  pub members: Vec<MemberSchema>,
  pub return_type: SmolStr,
  pub destination: SystemMessageDestination,
  pub multicast: bool,
  pub includes: Vec<SmolStr>,
  pub generate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSchema {
  pub name: SmolStr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomTypeSchema {
  pub name: SmolStr,
  pub namespace: Option<SmolStr>,
  pub include: Option<SmolStr>,
}

// ===============
// === PARSING ===
// ===============

#[derive(Debug, Error, Diagnostic)]
pub enum SchemaParseError {
  #[error("error when parsing kdl: {0}")]
  #[diagnostic(transparent)]
  Parse(#[from] kdl::KdlError),
  #[error(transparent)]
  #[diagnostic(transparent)]
  Deser(#[from] SchemaDeserError),
}

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct SchemaDeserError {
  #[label]
  pub span: SourceSpan,
  #[source_code]
  pub src: NamedSource,
  pub kind: SchemaDeserErrorKind,
}

#[derive(Debug, Error)]
pub enum SchemaDeserErrorKind {
  #[error("unknown record kind {0:?}; expected component, system, message, system-message, service or custom-type")]
  UnknownRecord(SmolStr),
  #[error("record is missing its name argument")]
  MissingName,
  #[error("property {0:?} is not valid here")]
  InvalidKey(SmolStr),
  #[error("property {0:?} has the wrong type")]
  BadValue(SmolStr),
  #[error("{0:?} is not a strategy; expected global, individual or parallel")]
  BadStrategy(SmolStr),
  #[error("{0:?} is not a method; expected update or render")]
  BadMethod(SmolStr),
  #[error("{0:?} is not a destination; expected local, host, all_clients or remote_clients")]
  BadDestination(SmolStr),
  #[error("unknown child node {0:?}")]
  UnknownChild(SmolStr),
}

impl EcsSchema {
  /// Parse one KDL document into the schema, appending to whatever is
  /// already loaded. `filepath` is for error reporting only.
  pub fn load_str(
    &mut self,
    src: &str,
    filepath: &str,
  ) -> Result<(), SchemaParseError> {
    let doc: KdlDocument = src.parse()?;
    let named_src = || NamedSource::new(filepath, src.to_owned());

    for node in doc.nodes() {
      match node.name().value() {
        "component" => self.components.push(parse_component(node, &named_src)?),
        "system" => self.systems.push(parse_system(node, &named_src)?),
        "message" => self.messages.push(parse_message(node, &named_src)?),
        "system-message" => {
          self.system_messages.push(parse_system_message(node, &named_src)?)
        }
        "service" => self.services.push(ServiceSchema {
          name: name_of(node, &named_src)?,
        }),
        "custom-type" => self.custom_types.push(CustomTypeSchema {
          name: name_of(node, &named_src)?,
          namespace: string_prop(node, "namespace", &named_src)?,
          include: string_prop(node, "include", &named_src)?,
        }),
        other => {
          return Err(
            SchemaDeserError {
              span: *node.span(),
              src: named_src(),
              kind: SchemaDeserErrorKind::UnknownRecord(other.into()),
            }
            .into(),
          )
        }
      }
    }
    Ok(())
  }
}

fn name_of(
  node: &KdlNode,
  src: &impl Fn() -> NamedSource,
) -> Result<SmolStr, SchemaDeserError> {
  match node.get(0).map(|entry| entry.value()) {
    Some(KdlValue::String(s)) => Ok(SmolStr::new(s)),
    _ => Err(SchemaDeserError {
      span: *node.span(),
      src: src(),
      kind: SchemaDeserErrorKind::MissingName,
    }),
  }
}

fn string_prop(
  node: &KdlNode,
  key: &str,
  src: &impl Fn() -> NamedSource,
) -> Result<Option<SmolStr>, SchemaDeserError> {
  match node.get(key).map(|entry| entry.value()) {
    None => Ok(None),
    Some(KdlValue::String(s)) => Ok(Some(SmolStr::new(s))),
    Some(_) => Err(SchemaDeserError {
      span: *node.span(),
      src: src(),
      kind: SchemaDeserErrorKind::BadValue(key.into()),
    }),
  }
}

fn bool_prop(
  node: &KdlNode,
  key: &str,
  fallback: bool,
  src: &impl Fn() -> NamedSource,
) -> Result<bool, SchemaDeserError> {
  match node.get(key).map(|entry| entry.value()) {
    None => Ok(fallback),
    Some(KdlValue::Bool(b)) => Ok(*b),
    Some(_) => Err(SchemaDeserError {
      span: *node.span(),
      src: src(),
      kind: SchemaDeserErrorKind::BadValue(key.into()),
    }),
  }
}

fn int_prop(
  node: &KdlNode,
  key: &str,
  src: &impl Fn() -> NamedSource,
) -> Result<Option<i64>, SchemaDeserError> {
  match node.get(key).map(|entry| entry.value()) {
    None => Ok(None),
    Some(KdlValue::Base10(n)) => Ok(Some(*n)),
    Some(_) => Err(SchemaDeserError {
      span: *node.span(),
      src: src(),
      kind: SchemaDeserErrorKind::BadValue(key.into()),
    }),
  }
}

fn parse_members(
  node: &KdlNode,
  src: &impl Fn() -> NamedSource,
) -> Result<Vec<MemberSchema>, SchemaDeserError> {
  let mut members = Vec::new();
  let Some(children) = node.children() else {
    return Ok(members);
  };
  for kid in children.nodes() {
    if kid.name().value() != "member" {
      continue;
    }
    let access = match string_prop(kid, "access", src)?.as_deref() {
      None | Some("public") => MemberAccess::Public,
      Some("protected") => MemberAccess::Protected,
      Some("private") => MemberAccess::Private,
      Some(_) => {
        return Err(SchemaDeserError {
          span: *kid.span(),
          src: src(),
          kind: SchemaDeserErrorKind::BadValue("access".into()),
        })
      }
    };
    members.push(MemberSchema {
      name: name_of(kid, src)?,
      type_name: string_prop(kid, "type", src)?.unwrap_or_default(),
      default: string_prop(kid, "default", src)?,
      access,
      serializable: bool_prop(kid, "serializable", true, src)?,
      can_edit: bool_prop(kid, "can-edit", true, src)?,
      can_save: bool_prop(kid, "can-save", true, src)?,
    });
  }
  Ok(members)
}

fn parse_includes(node: &KdlNode) -> Vec<SmolStr> {
  let Some(children) = node.children() else {
    return Vec::new();
  };
  children
    .nodes()
    .iter()
    .filter(|kid| kid.name().value() == "include")
    .filter_map(|kid| match kid.get(0).map(|entry| entry.value()) {
      Some(KdlValue::String(s)) => Some(SmolStr::new(s)),
      _ => None,
    })
    .collect()
}

fn parse_component(
  node: &KdlNode,
  src: &impl Fn() -> NamedSource,
) -> Result<ComponentSchema, SchemaDeserError> {
  let depends_on = match node.children() {
    Some(children) => children
      .nodes()
      .iter()
      .filter(|kid| kid.name().value() == "depends-on")
      .map(|kid| name_of(kid, src))
      .collect::<Result<Vec<_>, _>>()?,
    None => Vec::new(),
  };
  Ok(ComponentSchema {
    name: name_of(node, src)?,
    id: int_prop(node, "id", src)?.map(|id| id as u16),
    members: parse_members(node, src)?,
    includes: parse_includes(node),
    custom_impl: string_prop(node, "custom-impl", src)?,
    depends_on,
    generate: bool_prop(node, "generate", true, src)?,
  })
}

fn parse_message(
  node: &KdlNode,
  src: &impl Fn() -> NamedSource,
) -> Result<MessageSchema, SchemaDeserError> {
  Ok(MessageSchema {
    name: name_of(node, src)?,
    id: int_prop(node, "id", src)?.map(|id| id as u16),
    members: parse_members(node, src)?,
    serializable: bool_prop(node, "serializable", true, src)?,
    includes: parse_includes(node),
    generate: bool_prop(node, "generate", true, src)?,
  })
}

fn parse_system_message(
  node: &KdlNode,
  src: &impl Fn() -> NamedSource,
) -> Result<SystemMessageSchema, SchemaDeserError> {
  let destination = match string_prop(node, "destination", src)? {
    None => SystemMessageDestination::Local,
    Some(s) => SystemMessageDestination::parse(&s).ok_or_else(|| {
      SchemaDeserError {
        span: *node.span(),
        src: src(),
        kind: SchemaDeserErrorKind::BadDestination(s),
      }
    })?,
  };
  Ok(SystemMessageSchema {
    name: name_of(node, src)?,
    id: int_prop(node, "id", src)?.map(|id| id as u16),
    members: parse_members(node, src)?,
    return_type: string_prop(node, "return-type", src)?
      .unwrap_or_else(|| SmolStr::new("()")),
    destination,
    multicast: bool_prop(node, "multicast", false, src)?,
    includes: parse_includes(node),
    generate: bool_prop(node, "generate", true, src)?,
  })
}

fn parse_system(
  node: &KdlNode,
  src: &impl Fn() -> NamedSource,
) -> Result<SystemSchema, SchemaDeserError> {
  use crate::system::{AccessFlags, Strategy};

  let strategy = match string_prop(node, "strategy", src)? {
    None => Strategy::Individual,
    Some(s) => match s.as_str() {
      "global" => Strategy::Global,
      "individual" => Strategy::Individual,
      "parallel" => Strategy::Parallel,
      _ => {
        return Err(SchemaDeserError {
          span: *node.span(),
          src: src(),
          kind: SchemaDeserErrorKind::BadStrategy(s),
        })
      }
    },
  };
  let method = match string_prop(node, "method", src)? {
    None => SystemMethod::default(),
    Some(s) => match s.as_str() {
      "update" => SystemMethod::Update,
      "render" => SystemMethod::Render,
      _ => {
        return Err(SchemaDeserError {
          span: *node.span(),
          src: src(),
          kind: SchemaDeserErrorKind::BadMethod(s),
        })
      }
    },
  };

  let mut access = AccessFlags::PURE;
  for (key, flag) in [
    ("api", AccessFlags::API),
    ("world", AccessFlags::WORLD),
    ("resources", AccessFlags::RESOURCES),
    ("message-bridge", AccessFlags::MESSAGE_BRIDGE),
  ] {
    if bool_prop(node, key, false, src)? {
      access = access | flag;
    }
  }

  let mut families = Vec::new();
  let mut messages = Vec::new();
  let mut system_messages = Vec::new();
  let mut services = Vec::new();
  if let Some(children) = node.children() {
    for kid in children.nodes() {
      match kid.name().value() {
        "family" => {
          let mut components = Vec::new();
          if let Some(grandkids) = kid.children() {
            for comp in grandkids.nodes() {
              if comp.name().value() != "component" {
                return Err(SchemaDeserError {
                  span: *comp.span(),
                  src: src(),
                  kind: SchemaDeserErrorKind::UnknownChild(
                    comp.name().value().into(),
                  ),
                });
              }
              components.push(ComponentReferenceSchema {
                name: name_of(comp, src)?,
                write: bool_prop(comp, "write", false, src)?,
                optional: bool_prop(comp, "optional", false, src)?,
              });
            }
          }
          families.push(FamilySchema {
            name: name_of(kid, src)?,
            components,
          });
        }
        "message" => messages.push(MessageReferenceSchema {
          name: name_of(kid, src)?,
          send: bool_prop(kid, "send", false, src)?,
          receive: bool_prop(kid, "receive", false, src)?,
          family: string_prop(kid, "family", src)?,
        }),
        "system-message" => system_messages.push(MessageReferenceSchema {
          name: name_of(kid, src)?,
          send: bool_prop(kid, "send", false, src)?,
          receive: bool_prop(kid, "receive", false, src)?,
          family: None,
        }),
        "service" => services.push(ServiceReferenceSchema {
          name: name_of(kid, src)?,
        }),
        "include" => {}
        other => {
          return Err(SchemaDeserError {
            span: *kid.span(),
            src: src(),
            kind: SchemaDeserErrorKind::UnknownChild(other.into()),
          })
        }
      }
    }
  }

  Ok(SystemSchema {
    name: name_of(node, src)?,
    strategy,
    method,
    access,
    smearing: int_prop(node, "smearing", src)?.unwrap_or(0),
    families,
    messages,
    system_messages,
    services,
    includes: parse_includes(node),
    generate: bool_prop(node, "generate", true, src)?,
  })
}

// ==================
// === VALIDATION ===
// ==================

/// Two declarations that cannot both be true, or a reference into nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaConflict {
  #[error("two {kind} records named {name:?} declare different shapes")]
  DuplicateName { kind: &'static str, name: SmolStr },
  #[error("{kind} id {id} is claimed by both {first:?} and {second:?}")]
  DuplicateId {
    kind: &'static str,
    id: u16,
    first: SmolStr,
    second: SmolStr,
  },
  #[error("component id {id} of {name:?} does not fit the {MASK_BITS}-bit mask")]
  IdOutOfRange { name: SmolStr, id: u16 },
  #[error("system {system:?} family {family:?} references unknown component {component:?}")]
  UnknownComponent {
    system: SmolStr,
    family: SmolStr,
    component: SmolStr,
  },
  #[error("system {system:?} references unknown message {message:?}")]
  UnknownMessage { system: SmolStr, message: SmolStr },
  #[error("system {system:?} references unknown system message {message:?}")]
  UnknownSystemMessage { system: SmolStr, message: SmolStr },
  #[error("system {system:?} references unknown service {service:?}")]
  UnknownService { system: SmolStr, service: SmolStr },
}

impl EcsSchema {
  /// Check cross-references and assign missing dense ids (in sorted-name
  /// order; ids already present in a persisted schema are left alone).
  pub fn validate(&mut self) -> Result<(), SchemaConflict> {
    dedupe_records("component", &mut self.components, |c| c.name.clone())?;
    dedupe_records("system", &mut self.systems, |s| s.name.clone())?;
    dedupe_records("message", &mut self.messages, |m| m.name.clone())?;
    dedupe_records("system message", &mut self.system_messages, |m| {
      m.name.clone()
    })?;
    dedupe_records("service", &mut self.services, |s| s.name.clone())?;
    dedupe_records("custom type", &mut self.custom_types, |t| t.name.clone())?;

    assign_ids(
      "component",
      &mut self.components,
      |c| (c.name.clone(), c.id),
      |c, id| c.id = Some(id),
    )?;
    for component in &self.components {
      let id = component.id.expect("ids were just assigned");
      if id as usize >= MASK_BITS {
        return Err(SchemaConflict::IdOutOfRange {
          name: component.name.clone(),
          id,
        });
      }
    }
    assign_ids(
      "message",
      &mut self.messages,
      |m| (m.name.clone(), m.id),
      |m, id| m.id = Some(id),
    )?;
    assign_ids(
      "system message",
      &mut self.system_messages,
      |m| (m.name.clone(), m.id),
      |m, id| m.id = Some(id),
    )?;

    // Cross references.
    let component_names: Vec<&SmolStr> =
      self.components.iter().map(|c| &c.name).collect();
    let message_names: Vec<&SmolStr> =
      self.messages.iter().map(|m| &m.name).collect();
    let system_message_names: Vec<&SmolStr> =
      self.system_messages.iter().map(|m| &m.name).collect();
    let service_names: Vec<&SmolStr> =
      self.services.iter().map(|s| &s.name).collect();

    for system in &self.systems {
      for family in &system.families {
        for component in &family.components {
          if !component_names.contains(&&component.name) {
            return Err(SchemaConflict::UnknownComponent {
              system: system.name.clone(),
              family: family.name.clone(),
              component: component.name.clone(),
            });
          }
        }
      }
      for message in &system.messages {
        if !message_names.contains(&&message.name) {
          return Err(SchemaConflict::UnknownMessage {
            system: system.name.clone(),
            message: message.name.clone(),
          });
        }
      }
      for message in &system.system_messages {
        if !system_message_names.contains(&&message.name) {
          return Err(SchemaConflict::UnknownSystemMessage {
            system: system.name.clone(),
            message: message.name.clone(),
          });
        }
      }
      for service in &system.services {
        if !service_names.contains(&&service.name) {
          return Err(SchemaConflict::UnknownService {
            system: system.name.clone(),
            service: service.name.clone(),
          });
        }
      }
    }

    Ok(())
  }
}

/// Identical duplicate records collapse to one; divergent ones conflict.
fn dedupe_records<T: PartialEq + Clone>(
  kind: &'static str,
  records: &mut Vec<T>,
  name: impl Fn(&T) -> SmolStr,
) -> Result<(), SchemaConflict> {
  let mut kept: Vec<T> = Vec::with_capacity(records.len());
  for record in records.drain(..) {
    let extant = kept
      .iter()
      .find(|extant| name(extant) == name(&record))
      .map(|extant| *extant == record);
    match extant {
      None => kept.push(record),
      Some(true) => {}
      Some(false) => {
        return Err(SchemaConflict::DuplicateName {
          kind,
          name: name(&record),
        })
      }
    }
  }
  *records = kept;
  Ok(())
}

/// Records keep any persisted id; the rest get the smallest unused ids in
/// sorted-name order.
fn assign_ids<T>(
  kind: &'static str,
  records: &mut [T],
  get: impl Fn(&T) -> (SmolStr, Option<u16>),
  set: impl Fn(&mut T, u16),
) -> Result<(), SchemaConflict> {
  let mut used: Vec<(u16, SmolStr)> = Vec::new();
  for record in records.iter() {
    let (name, id) = get(record);
    if let Some(id) = id {
      if let Some((_, extant)) = used.iter().find(|(used, _)| *used == id) {
        return Err(SchemaConflict::DuplicateId {
          kind,
          id,
          first: extant.clone(),
          second: name,
        });
      }
      used.push((id, name));
    }
  }

  let mut unassigned: Vec<usize> = records
    .iter()
    .enumerate()
    .filter(|(_, record)| get(record).1.is_none())
    .map(|(at, _)| at)
    .collect();
  unassigned.sort_by_key(|&at| get(&records[at]).0);

  let mut next = 0u16;
  for at in unassigned {
    while used.iter().any(|(used, _)| *used == next) {
      next += 1;
    }
    set(&mut records[at], next);
    used.push((next, get(&records[at]).0));
    next += 1;
  }
  Ok(())
}
