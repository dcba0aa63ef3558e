//! Prefab-based entity instantiation loaded from KDL.
//!
//! Load prefab files into a [`PrefabFabricator`], register factories that
//! teach it how to turn KDL nodes into components, then instantiate.
//! Instantiated entities carry their prefab's UUID; a *reload* re-assembles
//! the components of every instance in place, so families see a reload
//! rather than a remove+add.

use ahash::AHashMap;
use kdl::{KdlDocument, KdlNode};
use miette::{Diagnostic, NamedSource, SourceSpan};
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use std::marker::PhantomData;
use thiserror::Error;
use uuid::Uuid;

use crate::component::Component;
use crate::entity::EntityId;
use crate::world::World;

/// One prefab as loaded from disc: a UUID, a merge mode, and the component
/// nodes (some of which may splice in other prefabs).
pub struct RawPrefab {
  pub name: SmolStr,
  pub uuid: Uuid,
  pub merge: MergeMode,
  pub elements: Vec<PrefabElement>,
}

pub enum PrefabElement {
  /// A component node, handed to the matching factory.
  Component(KdlNode),
  /// Splice in the components of another prefab.
  Splice(SmolStr),
}

/// How a prefab combines with an already-loaded prefab of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub enum MergeMode {
  /// Components both declare: the new one wins. New components append.
  /// Components only the old one has are kept.
  #[default]
  Merge,
  /// Completely replace the old prefab.
  Clobber,
}

/// A prefab with every splice folded in.
pub struct RenderedPrefab {
  pub name: SmolStr,
  pub uuid: Uuid,
  pub components: Vec<KdlNode>,
}

/// Builds one component from its prefab node.
pub trait ComponentFactory<Ctx>: Send + Sync + 'static
where
  Ctx: 'static,
{
  fn assemble(
    &self,
    node: &KdlNode,
    ctx: &Ctx,
  ) -> eyre::Result<Box<dyn Component>>;
}

/// Factory for the common case: deserialize the component from the node
/// with serde.
pub struct SerdeComponentFactory<C, Ctx>(PhantomData<fn(&Ctx) -> C>);

impl<C, Ctx> SerdeComponentFactory<C, Ctx> {
  pub fn new() -> Self {
    Self(PhantomData)
  }
}

impl<C, Ctx> Default for SerdeComponentFactory<C, Ctx> {
  fn default() -> Self {
    Self::new()
  }
}

impl<C, Ctx> ComponentFactory<Ctx> for SerdeComponentFactory<C, Ctx>
where
  Self: 'static,
  C: DeserializeOwned + Component,
{
  fn assemble(
    &self,
    node: &KdlNode,
    _ctx: &Ctx,
  ) -> eyre::Result<Box<dyn Component>> {
    let component: C = knurdy::deserialize_node(node)?;
    Ok(Box::new(component) as _)
  }
}

/// A library of prefabs and the factories to instantiate them.
pub struct PrefabFabricator<Ctx> {
  prefabs: AHashMap<SmolStr, RawPrefab>,
  factories: AHashMap<SmolStr, Box<dyn ComponentFactory<Ctx>>>,
}

impl<Ctx> PrefabFabricator<Ctx>
where
  Ctx: 'static,
{
  pub fn new() -> Self {
    Self {
      prefabs: AHashMap::new(),
      factories: AHashMap::new(),
    }
  }

  /// Register a component factory under the component's prefab-file name.
  pub fn register<F: ComponentFactory<Ctx>>(&mut self, name: &str, factory: F) {
    if self
      .factories
      .insert(SmolStr::new(name), Box::new(factory))
      .is_some()
    {
      panic!("already registered a factory under the name {:?}", name);
    }
  }

  /// Register a factory that just deserializes the component with serde.
  pub fn register_serde<C: DeserializeOwned + Component>(&mut self, name: &str) {
    self.register(name, SerdeComponentFactory::<C, Ctx>::new())
  }

  /// Load the KDL string as a list of prefabs. `filepath` is only for error
  /// reporting; nothing is read from disc.
  pub fn load_str(
    &mut self,
    src: &str,
    filepath: &str,
  ) -> Result<(), PrefabParseError> {
    let doc: KdlDocument = src.parse()?;
    let named_src = NamedSource::new(filepath, src.to_owned());
    for raw in RawPrefab::load_from_kdl(&doc, named_src)? {
      self.insert_raw(raw);
    }
    Ok(())
  }

  pub fn insert_raw(&mut self, prefab: RawPrefab) {
    match self.prefabs.get_mut(&prefab.name) {
      None => {
        self.prefabs.insert(prefab.name.clone(), prefab);
      }
      Some(old) => match prefab.merge {
        MergeMode::Clobber => *old = prefab,
        MergeMode::Merge => {
          old.uuid = prefab.uuid;
          for element in prefab.elements {
            let clobberee = match &element {
              PrefabElement::Splice(_) => None,
              PrefabElement::Component(node) => {
                old.elements.iter_mut().find(|extant| {
                  matches!(extant, PrefabElement::Component(it) if it.name() == node.name())
                })
              }
            };
            match clobberee {
              Some(clobberee) => *clobberee = element,
              None => old.elements.push(element),
            }
          }
        }
      },
    }
  }

  /// Fold splices and return the flat component list of a prefab.
  pub fn lookup(&self, name: &str) -> Result<RenderedPrefab, PrefabLookupError> {
    fn recurse<Ctx: 'static>(
      lib: &PrefabFabricator<Ctx>,
      name: &SmolStr,
      path: Vec<SmolStr>,
    ) -> Result<Vec<KdlNode>, PrefabLookupError> {
      let raw = lib.prefabs.get(name).ok_or_else(|| match path.as_slice() {
        [] => PrefabLookupError::PrefabNotFound(name.clone()),
        [.., last] => {
          PrefabLookupError::SpliceNotFound(last.clone(), name.clone())
        }
      })?;
      let mut out = Vec::new();
      for element in &raw.elements {
        match element {
          PrefabElement::Component(node) => out.push(node.clone()),
          PrefabElement::Splice(parent) => {
            if let Some(start) =
              path.iter().position(|waypoint| waypoint == parent)
            {
              let mut problem = path[start..].to_vec();
              problem.push(name.clone());
              problem.push(path[start].clone());
              return Err(PrefabLookupError::SpliceLoop(problem));
            }
            let mut path = path.clone();
            path.push(name.clone());
            out.extend(recurse(lib, parent, path)?);
          }
        }
      }
      Ok(out)
    }

    let smol_name = SmolStr::new(name);
    let components = recurse(self, &smol_name, Vec::new())?;
    let uuid = self.prefabs[&smol_name].uuid;
    Ok(RenderedPrefab {
      name: smol_name,
      uuid,
      components,
    })
  }

  /// Instantiate a prefab as a new pending entity. It spawns, and joins
  /// families, at the next refresh.
  pub fn instantiate(
    &self,
    name: &str,
    world: &mut World,
    ctx: &Ctx,
  ) -> Result<EntityId, InstantiationError> {
    let print = self.lookup(name)?;
    let components = self.assemble_all(&print, ctx)?;

    let mut entity = world.create_entity(print.name.clone());
    entity.set_prefab(print.uuid);
    let id = entity.id();
    for component in components {
      world.attach_boxed(id, component);
    }
    Ok(id)
  }

  /// Re-assemble the prefab's components onto every live instance, in
  /// place. Instances keep their family rows; the families run a *reload*
  /// at the next refresh.
  pub fn reload(
    &self,
    name: &str,
    world: &mut World,
    ctx: &Ctx,
  ) -> Result<usize, InstantiationError> {
    let print = self.lookup(name)?;
    let instances = world.instances_of_prefab(print.uuid);
    tracing::debug!(prefab = %print.name, count = instances.len(), "prefab reload");
    for &id in &instances {
      let components = self.assemble_all(&print, ctx)?;
      for component in components {
        world.attach_boxed(id, component);
      }
      if let Some(mut entity) = world.entity(id) {
        entity.mark_reloaded();
      }
    }
    Ok(instances.len())
  }

  fn assemble_all(
    &self,
    print: &RenderedPrefab,
    ctx: &Ctx,
  ) -> Result<Vec<Box<dyn Component>>, InstantiationError> {
    print
      .components
      .iter()
      .map(|node| {
        let name = node.name().value();
        let factory = self
          .factories
          .get(name)
          .ok_or_else(|| InstantiationError::NoFactory(name.into()))?;
        factory
          .assemble(node, ctx)
          .map_err(|err| InstantiationError::FactoryError(name.into(), err))
      })
      .collect()
  }
}

impl<Ctx: 'static> Default for PrefabFabricator<Ctx> {
  fn default() -> Self {
    Self::new()
  }
}

impl RawPrefab {
  pub fn load_from_kdl(
    doc: &KdlDocument,
    src: NamedSource,
  ) -> Result<Vec<RawPrefab>, PrefabDeserError> {
    let mut out = Vec::new();
    for node in doc.nodes() {
      let Some(children) = node.children() else {
        return Err(PrefabDeserError {
          span: *node.span(),
          kind: PrefabDeserErrorKind::NoChildren,
          src,
        });
      };

      let mut merge = None;
      let mut uuid = None;
      for entry in node.entries() {
        let Some(key) = entry.name() else {
          return Err(PrefabDeserError {
            span: *entry.span(),
            kind: PrefabDeserErrorKind::TopLevelArgument,
            src,
          });
        };
        match (key.value(), entry.value().as_string()) {
          ("merge", Some("merge")) => merge = Some(MergeMode::Merge),
          ("merge", Some("clobber")) => merge = Some(MergeMode::Clobber),
          ("merge", _) => {
            return Err(PrefabDeserError {
              span: *entry.span(),
              kind: PrefabDeserErrorKind::BadMerge,
              src,
            })
          }
          ("uuid", Some(s)) => match Uuid::parse_str(s) {
            Ok(parsed) => uuid = Some(parsed),
            Err(_) => {
              return Err(PrefabDeserError {
                span: *entry.span(),
                kind: PrefabDeserErrorKind::BadUuid,
                src,
              })
            }
          },
          _ => {
            return Err(PrefabDeserError {
              span: *entry.span(),
              kind: PrefabDeserErrorKind::InvalidKey,
              src,
            })
          }
        }
      }

      let mut elements = Vec::new();
      for kid in children.nodes() {
        let element = match kid.ty() {
          None => PrefabElement::Component(kid.clone()),
          Some(ann) if ann.value() == "splice" => {
            if !kid.entries().is_empty() || kid.children().is_some() {
              return Err(PrefabDeserError {
                span: *kid.span(),
                kind: PrefabDeserErrorKind::BadAnnotation,
                src,
              });
            }
            PrefabElement::Splice(kid.name().value().into())
          }
          Some(_) => {
            return Err(PrefabDeserError {
              span: *kid.span(),
              kind: PrefabDeserErrorKind::BadAnnotation,
              src,
            })
          }
        };
        elements.push(element);
      }

      out.push(RawPrefab {
        name: node.name().value().into(),
        // A prefab without an explicit uuid gets a name-derived stable one.
        uuid: uuid.unwrap_or_else(|| {
          Uuid::new_v5(&Uuid::NAMESPACE_OID, node.name().value().as_bytes())
        }),
        merge: merge.unwrap_or_default(),
        elements,
      });
    }
    Ok(out)
  }
}

/// Problems looking a prefab up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefabLookupError {
  #[error("the prefab {0} was not found")]
  PrefabNotFound(SmolStr),
  #[error("splicing produced the loop {0:?}")]
  SpliceLoop(Vec<SmolStr>),
  #[error("the prefab {0} splices the prefab {1} but the second was not found")]
  SpliceNotFound(SmolStr, SmolStr),
}

#[derive(Debug, Error, Diagnostic)]
pub enum PrefabParseError {
  #[error("error when parsing kdl: {0}")]
  #[diagnostic(transparent)]
  Parse(#[from] kdl::KdlError),
  #[error(transparent)]
  #[diagnostic(transparent)]
  Deser(#[from] PrefabDeserError),
}

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct PrefabDeserError {
  #[label]
  pub span: SourceSpan,
  #[source_code]
  pub src: NamedSource,
  pub kind: PrefabDeserErrorKind,
}

const TOP_LEVEL_REQS: &str =
  r#"only `merge="merge"`, `merge="clobber"` or `uuid="…"` are allowed"#;

#[derive(Debug, Error)]
pub enum PrefabDeserErrorKind {
  #[error("prefab node had no children")]
  NoChildren,
  #[error("prefab node had an argument; {}", TOP_LEVEL_REQS)]
  TopLevelArgument,
  #[error("prefab node had an invalid key; {}", TOP_LEVEL_REQS)]
  InvalidKey,
  #[error(r#"the `merge` key didn't equal "clobber" or "merge""#)]
  BadMerge,
  #[error("the `uuid` key was not a valid uuid")]
  BadUuid,
  #[error(
    "bad annotation; only `(splice)a-prefab` with no args/props/children is allowed"
  )]
  BadAnnotation,
}

/// Things that can go wrong when instantiating a prefab.
#[derive(Debug, Error)]
pub enum InstantiationError {
  #[error("while looking up the prefab: {0}")]
  Lookup(#[from] PrefabLookupError),
  #[error("there was no factory registered for a component named {0:?}")]
  NoFactory(SmolStr),
  #[error("the factory for {0:?} gave an error: {1}")]
  FactoryError(SmolStr, eyre::Error),
}
