//! Entities and the plugin-facing entity handle.
//!
//! An [`Entity`] is owned by its [`Sandbox`] and never escapes it.  Plugin
//! code works through an [`EntityHandle`], a short-lived mutable borrow of
//! the sandbox scoped to one entity id.  Every mutation goes through the
//! sandbox so deltas, events and discoveries share one outbound path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use panflux_schema::{EntityDefinition, EntityType, FieldGroup};

use crate::error::Result;
use crate::protocol::EntityId;
use crate::sandbox::Sandbox;

/// A service callback registered by plugin code.
///
/// The callback receives a handle to its own entity and the validated call
/// parameters.
pub type ServiceFn = Box<dyn FnMut(EntityHandle<'_>, Value) -> anyhow::Result<()> + Send>;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A validated, identity-bearing instance of an [`EntityType`].
pub struct Entity {
    id: EntityId,
    definition: EntityDefinition,
    entity_type: Arc<EntityType>,
    parent_id: Option<EntityId>,
    pub(crate) services: HashMap<String, ServiceFn>,
}

impl Entity {
    /// Wrap a definition that has already passed `entity_type` validation.
    pub(crate) fn new(definition: EntityDefinition, entity_type: Arc<EntityType>) -> Self {
        Self {
            id: EntityId::from(definition.id.as_str()),
            parent_id: None,
            definition,
            entity_type,
            services: HashMap::new(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.definition.name.as_deref().unwrap_or_default()
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn definition(&self) -> &EntityDefinition {
        &self.definition
    }

    pub fn config(&self) -> Option<&Value> {
        self.definition.config.as_ref()
    }

    /// Attributes as adopted.  Later changes flow upstream as deltas and are
    /// not reflected here.
    pub fn attributes(&self) -> Option<&Value> {
        self.definition.attributes.as_ref()
    }

    pub fn properties(&self) -> Option<&Value> {
        self.definition.properties.as_ref()
    }

    pub fn parent_id(&self) -> Option<&EntityId> {
        self.parent_id.as_ref()
    }

    pub(crate) fn set_parent_id(&mut self, parent: Option<EntityId>) {
        self.parent_id = parent;
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<&str> = self.services.keys().map(String::as_str).collect();
        services.sort_unstable();
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type", &self.entity_type.qualified_name())
            .field("parent_id", &self.parent_id)
            .field("services", &services)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// EntityHandle
// ---------------------------------------------------------------------------

/// Mutable access to one adopted entity.
///
/// Obtained from [`Sandbox::entity`] or passed to service callbacks.
pub struct EntityHandle<'a> {
    sandbox: &'a mut Sandbox,
    id: EntityId,
}

impl<'a> EntityHandle<'a> {
    /// Callers guarantee `id` is adopted.
    pub(crate) fn new(sandbox: &'a mut Sandbox, id: EntityId) -> Self {
        Self { sandbox, id }
    }

    /// Shorten the borrow so the handle can be passed on and used again.
    pub fn reborrow(&mut self) -> EntityHandle<'_> {
        EntityHandle {
            sandbox: self.sandbox,
            id: self.id.clone(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The underlying entity.
    pub fn entity(&self) -> &Entity {
        // Handles only exist for adopted ids and entities are never removed.
        &self.sandbox.entities[&self.id]
    }

    pub fn name(&self) -> &str {
        self.entity().name()
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        self.entity().entity_type()
    }

    pub fn config(&self) -> Option<&Value> {
        self.entity().config()
    }

    pub fn parent_id(&self) -> Option<&EntityId> {
        self.entity().parent_id()
    }

    /// The owning sandbox.
    pub fn sandbox(&mut self) -> &mut Sandbox {
        self.sandbox
    }

    // -- State --------------------------------------------------------------

    pub fn set_attribute(&mut self, name: &str, value: Value) -> Result<()> {
        tracing::debug!(entity_id = %self.id, attribute = name, value = %value, "setting attribute");
        self.sandbox
            .queue_change(&self.id, FieldGroup::Attributes, name, value)
    }

    pub fn set_attributes(&mut self, values: Map<String, Value>) -> Result<()> {
        for (name, value) in values {
            self.set_attribute(&name, value)?;
        }
        Ok(())
    }

    pub fn set_property(&mut self, name: &str, value: Value) -> Result<()> {
        tracing::debug!(entity_id = %self.id, property = name, value = %value, "setting property");
        self.sandbox
            .queue_change(&self.id, FieldGroup::Properties, name, value)
    }

    pub fn set_properties(&mut self, values: Map<String, Value>) -> Result<()> {
        for (name, value) in values {
            self.set_property(&name, value)?;
        }
        Ok(())
    }

    // -- Events and services ------------------------------------------------

    /// Send an event upstream immediately.
    pub fn emit(&mut self, event: &str, parameters: Option<Value>) -> Result<()> {
        tracing::debug!(entity_id = %self.id, event, "emitting event");
        self.sandbox.emit_event(&self.id, event, parameters)
    }

    /// Register the callback for a service declared by the entity type.
    pub fn register_service<F>(&mut self, name: &str, callback: F) -> Result<()>
    where
        F: FnMut(EntityHandle<'_>, Value) -> anyhow::Result<()> + Send + 'static,
    {
        self.sandbox
            .register_service(&self.id, name, Box::new(callback))
    }

    pub fn register_services<I>(&mut self, services: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, ServiceFn)>,
    {
        for (name, callback) in services {
            self.sandbox.register_service(&self.id, &name, callback)?;
        }
        Ok(())
    }

    /// Invoke a registered service on this entity.
    pub fn call(&mut self, service: &str, parameters: Option<Value>) -> Result<()> {
        self.sandbox.call_service(&self.id, service, parameters)
    }

    // -- Children -----------------------------------------------------------

    /// Report a child of this entity as discovered.
    ///
    /// Returns `Ok(false)` without reporting when this entity's type does not
    /// declare the child's type.  A missing `parentId` is filled with this
    /// entity's id.  Returns whether the discovery was new.
    pub fn register_child_entity(&mut self, definition: EntityDefinition) -> Result<bool> {
        self.sandbox.register_child_entity(&self.id, definition)
    }
}

impl fmt::Debug for EntityHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle").field("id", &self.id).finish()
    }
}
