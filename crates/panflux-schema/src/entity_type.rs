//! Compiled entity types and the payloads they validate.
//!
//! An [`EntityType`] is the immutable, inheritance-resolved form of a
//! [`TypeDefinition`](crate::TypeDefinition).  It validates full entity
//! records ([`EntityDefinition`]) and partial state deltas ([`StateDelta`]),
//! and knows which services, events and child types it declares.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SchemaError, ValidationError};
use crate::object::GroupSchema;
use crate::platform::TypeDefinition;

// ---------------------------------------------------------------------------
// Field groups
// ---------------------------------------------------------------------------

/// The value-carrying field groups of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    Config,
    Attributes,
    Properties,
}

impl FieldGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Attributes => "attributes",
            Self::Properties => "properties",
        }
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// An entity as described on the wire by `adopt` and `discovery` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntityDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Owning entity, if any.  Ownership only, never lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Forward reference: "refines the first entity discovered of this type".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl EntityDefinition {
    /// A bare definition with only identity fields set.
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            entity_type: entity_type.into(),
            parent_id: None,
            extends: None,
            config: None,
            attributes: None,
            properties: None,
        }
    }

    /// Decode a wire payload.  Unknown keys are rejected.
    pub fn from_value(value: Value) -> std::result::Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::new(e.to_string()))
    }

    /// The entity name, falling back to `<type>-<id>`.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.entity_type, self.id))
    }

    pub fn group(&self, group: FieldGroup) -> Option<&Value> {
        match group {
            FieldGroup::Config => self.config.as_ref(),
            FieldGroup::Attributes => self.attributes.as_ref(),
            FieldGroup::Properties => self.properties.as_ref(),
        }
    }
}

/// A validated batch of attribute/property changes for one entity.
///
/// This is exactly the payload of an outbound `data` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub entity_id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// EntityType
// ---------------------------------------------------------------------------

/// A compiled, inheritance-resolved entity type.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: String,
    qualified_name: String,
    description: Option<String>,
    public: bool,
    config: GroupSchema,
    attributes: GroupSchema,
    properties: GroupSchema,
    services: BTreeMap<String, Option<GroupSchema>>,
    events: BTreeMap<String, Option<GroupSchema>>,
    children: BTreeMap<String, Arc<EntityType>>,
}

impl EntityType {
    /// Compile a fully merged type definition.  Children are attached later
    /// by the registry.
    pub(crate) fn compile(platform: &str, name: &str, def: &TypeDefinition) -> Result<Self> {
        Ok(Self {
            name: name.to_owned(),
            qualified_name: format!("{platform}.{name}"),
            description: def.description.clone(),
            public: def.public,
            config: GroupSchema::compile("config", def.config.as_ref())?,
            attributes: GroupSchema::compile("attributes", def.attributes.as_ref())?,
            properties: GroupSchema::compile("properties", def.properties.as_ref())?,
            services: compile_capabilities("services", &def.services)?,
            events: compile_capabilities("events", &def.events)?,
            children: BTreeMap::new(),
        })
    }

    pub(crate) fn with_children(mut self, children: BTreeMap<String, Arc<EntityType>>) -> Self {
        self.children = children;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<platform>.<type>`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn group(&self, group: FieldGroup) -> &GroupSchema {
        match group {
            FieldGroup::Config => &self.config,
            FieldGroup::Attributes => &self.attributes,
            FieldGroup::Properties => &self.properties,
        }
    }

    pub fn declares_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn declares_event(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    /// Parameter schema of a declared service, if it declares one.
    pub fn service_schema(&self, name: &str) -> Option<&GroupSchema> {
        self.services.get(name).and_then(Option::as_ref)
    }

    pub fn event_schema(&self, name: &str) -> Option<&GroupSchema> {
        self.events.get(name).and_then(Option::as_ref)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn has_child_type(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn child_type(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.children.values()
    }

    /// Depth-first search through nested child types.
    pub fn find_descendant(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.children.get(name).or_else(|| {
            self.children
                .values()
                .find_map(|child| child.find_descendant(name))
        })
    }

    /// Validate a full entity record and return its normalized form.
    ///
    /// The name defaults to `<type>-<id>`; declared groups receive their
    /// field defaults.  `parentId` is carried through untouched.
    pub fn validate_entity(
        &self,
        def: &EntityDefinition,
    ) -> std::result::Result<EntityDefinition, ValidationError> {
        non_empty(&def.id, "id")?;
        non_empty(&def.entity_type, "type")?;
        if let Some(name) = &def.name {
            non_empty(name, "name")?;
        }
        if let Some(parent) = &def.parent_id {
            non_empty(parent, "parentId")?;
        }
        if let Some(extends) = &def.extends {
            non_empty(extends, "extends")?;
        }

        let validate_group = |group: FieldGroup| -> std::result::Result<Option<Value>, ValidationError> {
            Ok(self
                .group(group)
                .validate(def.group(group))
                .map_err(|e| e.at(group.as_str()))?
                .map(Value::Object))
        };

        Ok(EntityDefinition {
            id: def.id.clone(),
            name: Some(def.display_name()),
            entity_type: def.entity_type.clone(),
            parent_id: def.parent_id.clone(),
            extends: def.extends.clone(),
            config: validate_group(FieldGroup::Config)?,
            attributes: validate_group(FieldGroup::Attributes)?,
            properties: validate_group(FieldGroup::Properties)?,
        })
    }

    /// Validate an accumulated delta `{entityId, attributes?, properties?}`.
    ///
    /// Deltas are partial: only the fields present are checked, no defaults
    /// are injected and required-ness is not enforced.  `config` is never
    /// accepted.
    pub fn validate_delta(&self, delta: &Value) -> std::result::Result<StateDelta, ValidationError> {
        let map = delta
            .as_object()
            .ok_or_else(|| ValidationError::new("must be of type object"))?;

        if let Some(key) = map
            .keys()
            .find(|k| !matches!(k.as_str(), "entityId" | "attributes" | "properties"))
        {
            return Err(ValidationError::new("is not allowed").at(key));
        }

        let entity_id = match map.get("entityId") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::String(_)) => {
                return Err(ValidationError::new("is not allowed to be empty").at("entityId"));
            }
            Some(_) => return Err(ValidationError::new("must be a string").at("entityId")),
            None => return Err(ValidationError::new("is required").at("entityId")),
        };

        Ok(StateDelta {
            entity_id,
            attributes: validate_partial(&self.attributes, map.get("attributes"))
                .map_err(|e| e.at("attributes"))?,
            properties: validate_partial(&self.properties, map.get("properties"))
                .map_err(|e| e.at("properties"))?,
        })
    }

    /// Validate service call parameters against the declared parameter
    /// group, if the service declares one.
    pub fn validate_service_parameters(
        &self,
        service: &str,
        parameters: &Value,
    ) -> std::result::Result<Value, ValidationError> {
        match self.services.get(service) {
            None => Err(ValidationError::new("is not a declared service").at(service)),
            Some(None) => Ok(parameters.clone()),
            Some(Some(schema)) => Ok(Value::Object(
                schema.validate(Some(parameters))?.unwrap_or_default(),
            )),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name)
    }
}

fn compile_capabilities(
    kind: &str,
    declared: &BTreeMap<String, Option<Map<String, Value>>>,
) -> Result<BTreeMap<String, Option<GroupSchema>>> {
    let mut out = BTreeMap::new();
    for (name, params) in declared {
        if !crate::patterns::is_member_name(name) {
            return Err(SchemaError::InvalidFieldName { name: name.clone() }.in_field(kind, name));
        }
        let schema = params
            .as_ref()
            .map(|p| GroupSchema::compile(&format!("{kind}.{name}"), Some(p)))
            .transpose()?;
        out.insert(name.clone(), schema);
    }
    Ok(out)
}

fn non_empty(value: &str, path: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::new("is not allowed to be empty").at(path))
    } else {
        Ok(())
    }
}

fn validate_partial(
    schema: &GroupSchema,
    value: Option<&Value>,
) -> std::result::Result<Map<String, Value>, ValidationError> {
    let Some(value) = value else {
        return Ok(Map::new());
    };
    if !schema.is_declared() {
        return Err(ValidationError::new("is not allowed"));
    }
    let input = value
        .as_object()
        .ok_or_else(|| ValidationError::new("must be of type object"))?;

    let mut out = Map::new();
    for (name, v) in input {
        let field = schema
            .field(name)
            .ok_or_else(|| ValidationError::new("is not allowed").at(name))?;
        let normalized = field.validate(Some(v)).map_err(|e| e.at(name))?;
        out.insert(name.clone(), normalized.unwrap_or(Value::Null));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
