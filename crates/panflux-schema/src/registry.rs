//! Entity type registry.
//!
//! The registry is built once per platform load and is immutable afterwards.
//! Building it resolves `extends` chains (ancestors are deep-merged underneath
//! each type), checks that no member name is declared in two groups, compiles
//! every type, and finally nests child types under the single parent that
//! owns them.
//!
//! Lookups accept bare type names (`light`) and qualified names
//! (`hue.light`).  Child types are not part of the top-level namespace but
//! are still found by a recursive scan.
//!
//! # Example
//!
//! ```rust
//! # use panflux_schema::{EntityTypeRegistry, PlatformDefinition};
//! # use serde_json::json;
//! let platform = PlatformDefinition::from_value(json!({
//!     "name": "hue",
//!     "types": {
//!         "device": {"config": {"host": "string"}},
//!         "light": {"extends": "device", "properties": {"on": "bool"}},
//!     },
//! }))
//! .unwrap();
//!
//! let registry = EntityTypeRegistry::build(&platform).unwrap();
//! let light = registry.get_entity_type("hue.light").unwrap();
//! assert!(light.group(panflux_schema::FieldGroup::Config).is_declared());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::entity_type::EntityType;
use crate::error::{Result, SchemaError};
use crate::merge::merge_maps;
use crate::patterns;
use crate::platform::{PlatformDefinition, TypeDefinition};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable set of compiled entity types for one platform.
#[derive(Debug, Clone)]
pub struct EntityTypeRegistry {
    platform: String,
    types: BTreeMap<String, Arc<EntityType>>,
}

impl EntityTypeRegistry {
    /// Build the registry for a parsed platform definition.
    pub fn build(platform: &PlatformDefinition) -> Result<Self> {
        Self::from_types(&platform.name, &platform.types)
    }

    /// Build a registry from raw type definitions.
    pub fn from_types(platform: &str, types: &BTreeMap<String, TypeDefinition>) -> Result<Self> {
        let declared = canonicalize(types)?;
        let mut builder = Builder {
            platform,
            declared: &declared,
            resolved: BTreeMap::new(),
        };

        let mut compiled = BTreeMap::new();
        for name in declared.keys() {
            let merged = builder.resolve(name, &mut Vec::new())?;
            check_namespace(name, &merged)?;
            compiled.insert(name.clone(), EntityType::compile(platform, name, &merged)?);
        }

        let owners = resolve_ownership(&declared)?;

        let mut assembled = BTreeMap::new();
        let mut top_level = BTreeMap::new();
        for name in declared.keys() {
            let ty = assemble(name, &compiled, &builder.resolved, &mut assembled);
            if !owners.contains_key(name) {
                top_level.insert(name.clone(), ty);
            }
        }

        tracing::info!(
            platform = %platform,
            types = top_level.len(),
            children = owners.len(),
            "entity type registry built"
        );

        Ok(Self {
            platform: platform.to_owned(),
            types: top_level,
        })
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Look up a type by bare or qualified name, searching child types when
    /// no top-level type matches.
    pub fn get_entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        let canonical = name.trim().to_lowercase();
        let key = canonical
            .strip_prefix(self.platform.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(&canonical);

        if let Some(ty) = self.types.get(key) {
            return Ok(Arc::clone(ty));
        }

        self.types
            .values()
            .find_map(|ty| ty.find_descendant(key))
            .map(Arc::clone)
            .ok_or_else(|| SchemaError::UnknownEntityType(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_entity_type(name).is_ok()
    }

    /// Number of top-level types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Top-level type names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.values()
    }
}

// ---------------------------------------------------------------------------
// Build steps
// ---------------------------------------------------------------------------

fn canonical_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_lowercase();
    if !patterns::is_type_name(&name) {
        return Err(SchemaError::InvalidTypeName { name: raw.to_owned() });
    }
    Ok(name)
}

/// Normalize declared names and every reference to them.
fn canonicalize(types: &BTreeMap<String, TypeDefinition>) -> Result<BTreeMap<String, TypeDefinition>> {
    let mut out = BTreeMap::new();
    let mut spellings: BTreeMap<String, &str> = BTreeMap::new();
    for (raw, def) in types {
        let name = canonical_name(raw)?;
        if let Some(first) = spellings.insert(name.clone(), raw.as_str()) {
            return Err(SchemaError::DuplicateTypeName {
                name,
                first: first.to_owned(),
                second: raw.clone(),
            });
        }
        let mut def = def.clone();
        def.extends = def
            .extends
            .iter()
            .map(|parent| parent.trim().to_lowercase())
            .collect();
        def.children = def
            .children
            .iter()
            .map(|child| child.trim().to_lowercase())
            .collect();
        out.insert(name, def);
    }
    Ok(out)
}

struct Builder<'a> {
    platform: &'a str,
    declared: &'a BTreeMap<String, TypeDefinition>,
    resolved: BTreeMap<String, TypeDefinition>,
}

impl Builder<'_> {
    /// Fold the ancestors of `name` underneath its own declaration.
    ///
    /// `trail` holds the types currently being resolved; meeting one of them
    /// again as an ancestor is a cycle.
    fn resolve(&mut self, name: &str, trail: &mut Vec<String>) -> Result<TypeDefinition> {
        if let Some(done) = self.resolved.get(name) {
            return Ok(done.clone());
        }
        let Some(own) = self.declared.get(name) else {
            return Err(SchemaError::UnknownEntityType(name.to_owned()));
        };

        trail.push(name.to_owned());
        let mut base: Option<TypeDefinition> = None;
        for parent in &own.extends {
            if !self.declared.contains_key(parent) {
                return Err(SchemaError::UnknownParentType {
                    type_name: name.to_owned(),
                    parent: parent.clone(),
                });
            }
            if trail.iter().any(|t| t == parent) {
                return Err(SchemaError::CircularExtension {
                    type_name: name.to_owned(),
                    ancestor: parent.clone(),
                });
            }
            let ancestor = self.resolve(parent, trail)?;
            base = Some(match base {
                Some(acc) => merge_definitions(acc, ancestor),
                None => ancestor,
            });
        }
        trail.pop();

        let merged = match base {
            Some(base) => merge_definitions(base, own.clone()),
            None => own.clone(),
        };
        tracing::trace!(platform = %self.platform, type_name = %name, "type resolved");
        self.resolved.insert(name.to_owned(), merged.clone());
        Ok(merged)
    }
}

/// Merge `overlay` on top of `base`.  Field groups deep-merge; children are
/// unioned; everything else comes from `overlay`.
fn merge_definitions(base: TypeDefinition, overlay: TypeDefinition) -> TypeDefinition {
    let mut children = base.children;
    for child in overlay.children {
        if !children.contains(&child) {
            children.push(child);
        }
    }

    TypeDefinition {
        description: overlay.description.or(base.description),
        extends: overlay.extends,
        children,
        public: overlay.public,
        config: merge_group(base.config, overlay.config),
        attributes: merge_group(base.attributes, overlay.attributes),
        properties: merge_group(base.properties, overlay.properties),
        services: merge_capabilities(base.services, overlay.services),
        events: merge_capabilities(base.events, overlay.events),
    }
}

fn merge_group(
    base: Option<Map<String, Value>>,
    overlay: Option<Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (base, overlay) {
        (Some(mut base), Some(overlay)) => {
            merge_maps(&mut base, overlay);
            Some(base)
        }
        (base, None) => base,
        (None, overlay) => overlay,
    }
}

fn merge_capabilities(
    mut base: BTreeMap<String, Option<Map<String, Value>>>,
    overlay: BTreeMap<String, Option<Map<String, Value>>>,
) -> BTreeMap<String, Option<Map<String, Value>>> {
    for (name, params) in overlay {
        let merged = match (base.remove(&name).flatten(), params) {
            (Some(mut base), Some(overlay)) => {
                merge_maps(&mut base, overlay);
                Some(base)
            }
            (_, params) => params,
        };
        base.insert(name, merged);
    }
    base
}

/// Every member name may appear in at most one of the five groups.
fn check_namespace(name: &str, def: &TypeDefinition) -> Result<()> {
    let groups: [(&str, Vec<&String>); 5] = [
        ("config", def.config.iter().flat_map(|m| m.keys()).collect()),
        ("attributes", def.attributes.iter().flat_map(|m| m.keys()).collect()),
        ("properties", def.properties.iter().flat_map(|m| m.keys()).collect()),
        ("services", def.services.keys().collect()),
        ("events", def.events.keys().collect()),
    ];

    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for (group, fields) in &groups {
        for field in fields {
            if let Some(first) = seen.insert(field.as_str(), *group) {
                return Err(SchemaError::NamespaceCollision {
                    type_name: name.to_owned(),
                    field: (*field).clone(),
                    first: first.to_owned(),
                    second: (*group).to_owned(),
                });
            }
        }
    }
    Ok(())
}

/// Map every child type to its single owner, rejecting shared ownership,
/// children taking part in `extends`, and ownership cycles.
fn resolve_ownership(declared: &BTreeMap<String, TypeDefinition>) -> Result<BTreeMap<String, String>> {
    let extended: BTreeSet<&str> = declared
        .values()
        .flat_map(|def| def.extends.iter().map(String::as_str))
        .collect();

    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for (name, def) in declared {
        for child in &def.children {
            let Some(child_def) = declared.get(child) else {
                return Err(SchemaError::UnknownChildType {
                    type_name: name.clone(),
                    child: child.clone(),
                });
            };
            let hierarchy = |reason: String| SchemaError::InvalidHierarchy {
                type_name: child.clone(),
                reason,
            };
            if child == name {
                return Err(hierarchy("a type cannot own itself".into()));
            }
            if !child_def.extends.is_empty() || extended.contains(child.as_str()) {
                return Err(hierarchy(format!(
                    "child of `{name}` cannot take part in an extends relation"
                )));
            }
            if let Some(first) = owners.insert(child.clone(), name.clone()) {
                return Err(hierarchy(format!("owned by both `{first}` and `{name}`")));
            }
        }
    }

    for start in owners.keys() {
        let mut seen = BTreeSet::from([start.as_str()]);
        let mut current = start.as_str();
        while let Some(owner) = owners.get(current) {
            if !seen.insert(owner.as_str()) {
                return Err(SchemaError::InvalidHierarchy {
                    type_name: start.clone(),
                    reason: format!("ownership cycle through `{owner}`"),
                });
            }
            current = owner;
        }
    }

    Ok(owners)
}

/// Attach compiled children to `name`, depth first.  Requires an acyclic
/// ownership graph.
fn assemble(
    name: &str,
    compiled: &BTreeMap<String, EntityType>,
    resolved: &BTreeMap<String, TypeDefinition>,
    done: &mut BTreeMap<String, Arc<EntityType>>,
) -> Arc<EntityType> {
    if let Some(ty) = done.get(name) {
        return Arc::clone(ty);
    }

    let mut children = BTreeMap::new();
    if let Some(def) = resolved.get(name) {
        for child in &def.children {
            children.insert(child.clone(), assemble(child, compiled, resolved, done));
        }
    }

    let ty = Arc::new(compiled[name].clone().with_children(children));
    done.insert(name.to_owned(), Arc::clone(&ty));
    ty
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
