//! The sandbox protocol engine.
//!
//! A [`Sandbox`] owns every adopted [`Entity`], deduplicates discoveries,
//! accumulates state deltas until the supervisor asks for them, and turns
//! everything that crosses the trust boundary into [`OutboundMessage`]s.
//!
//! Inbound messages are processed strictly one at a time.  Any error raised
//! while handling a message is logged together with its payload; the engine
//! keeps running.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use panflux_schema::{EntityDefinition, EntityTypeRegistry, FieldGroup, deep_merge};

use crate::config::SandboxConfig;
use crate::entity::{Entity, EntityHandle, ServiceFn};
use crate::error::{Result, SandboxError};
use crate::logging::{LogLevel, LogLevelControl};
use crate::protocol::{
    EntityId, Envelope, EventPayload, InboundMessage, OutboundMessage, PendingChanges,
};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Plugin contract
// ---------------------------------------------------------------------------

/// Lifecycle notifications delivered to plugin code.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    Start(Value),
    Stop(Value),
    Discover(Value),
    /// A new entity was adopted; fetch it with [`Sandbox::entity`].
    Adopt(EntityId),
}

impl LocalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Discover(_) => "discover",
            Self::Adopt(_) => "adopt",
        }
    }
}

/// Plugin code hosted by a sandbox.
pub trait Platform {
    fn on_event(&mut self, sandbox: &mut Sandbox, event: LocalEvent) -> anyhow::Result<()>;
}

/// A [`Platform`] backed by a closure.  See [`platform_fn`].
pub struct PlatformFn<F>(F);

/// Wrap a closure as a [`Platform`].
pub fn platform_fn<F>(f: F) -> PlatformFn<F>
where
    F: FnMut(&mut Sandbox, LocalEvent) -> anyhow::Result<()>,
{
    PlatformFn(f)
}

impl<F> Platform for PlatformFn<F>
where
    F: FnMut(&mut Sandbox, LocalEvent) -> anyhow::Result<()>,
{
    fn on_event(&mut self, sandbox: &mut Sandbox, event: LocalEvent) -> anyhow::Result<()> {
        (self.0)(sandbox, event)
    }
}

/// Result of reporting a discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Recorded and sent upstream.
    New,
    /// The id was already discovered, adopted or deferred.
    Known,
    /// Held back until an entity of the type named by `extends` is
    /// discovered.
    Deferred,
}

impl DiscoveryOutcome {
    pub fn is_new(self) -> bool {
        self == Self::New
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// A discovery parked on an unresolved `extends` reference.
struct DeferredDiscovery {
    definition: EntityDefinition,
    type_key: String,
}

/// The stateful protocol engine for one hosted platform.
pub struct Sandbox {
    types: Arc<EntityTypeRegistry>,
    transport: Arc<dyn Transport>,
    config: SandboxConfig,
    log_control: Option<Box<dyn LogLevelControl>>,
    pub(crate) entities: HashMap<EntityId, Entity>,
    discoveries: HashMap<EntityId, EntityDefinition>,
    /// Qualified type name → discovered ids in arrival order.
    discoveries_by_type: HashMap<String, Vec<EntityId>>,
    /// Qualified name of the awaited type → parked discoveries.
    deferred: HashMap<String, Vec<DeferredDiscovery>>,
    deferred_ids: HashSet<EntityId>,
    pending: BTreeMap<EntityId, Value>,
}

impl Sandbox {
    pub fn new(types: Arc<EntityTypeRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            types,
            transport,
            config: SandboxConfig::default(),
            log_control: None,
            entities: HashMap::new(),
            discoveries: HashMap::new(),
            discoveries_by_type: HashMap::new(),
            deferred: HashMap::new(),
            deferred_ids: HashSet::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the control used to apply `setLogLevel`.
    pub fn with_log_control(mut self, control: impl LogLevelControl + 'static) -> Self {
        self.log_control = Some(Box::new(control));
        self
    }

    pub fn types(&self) -> &Arc<EntityTypeRegistry> {
        &self.types
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Mutable access to an adopted entity.
    pub fn entity(&mut self, id: &str) -> Option<EntityHandle<'_>> {
        let id = self.entities.get_key_value(id)?.0.clone();
        Some(EntityHandle::new(self, id))
    }

    pub fn get_entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn discovery(&self, id: &str) -> Option<&EntityDefinition> {
        self.discoveries.get(id)
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred_ids.len()
    }

    /// Ids with queued, unflushed changes, sorted.
    pub fn pending_entity_ids(&self) -> Vec<EntityId> {
        self.pending.keys().cloned().collect()
    }

    // -- Inbound ------------------------------------------------------------

    /// Process inbound envelopes until the channel closes.
    pub async fn run<P: Platform + ?Sized>(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        platform: &mut P,
    ) {
        tracing::info!(platform = %self.types.platform(), "sandbox started");
        while let Some(envelope) = inbound.recv().await {
            self.process_envelope(envelope, platform);
        }
        tracing::info!(platform = %self.types.platform(), "inbound channel closed, sandbox stopped");
    }

    /// Decode and process one raw envelope.
    pub fn process_envelope<P: Platform + ?Sized>(&mut self, envelope: Envelope, platform: &mut P) {
        let name = envelope.name.clone();
        let payload = envelope.args.clone();
        match InboundMessage::from_envelope(envelope) {
            Ok(message) => self.process_message(message, platform),
            Err(err) => {
                tracing::error!(name = %name, payload = %payload, error = %err, "rejected inbound message");
            }
        }
    }

    /// Process one decoded message to completion.  Never fails; errors are
    /// logged with the offending payload.
    pub fn process_message<P: Platform + ?Sized>(&mut self, message: InboundMessage, platform: &mut P) {
        tracing::trace!(name = message.name(), "processing message");
        if let Err(err) = self.dispatch(&message, platform) {
            tracing::error!(
                name = message.name(),
                payload = %message.args(),
                error = %err,
                "failed to process message"
            );
        }
    }

    fn dispatch<P: Platform + ?Sized>(&mut self, message: &InboundMessage, platform: &mut P) -> Result<()> {
        match message {
            InboundMessage::Start(args) => self.notify(platform, LocalEvent::Start(args.clone())),
            InboundMessage::Stop(args) => self.notify(platform, LocalEvent::Stop(args.clone())),
            InboundMessage::Discover(args) => {
                self.notify(platform, LocalEvent::Discover(args.clone()))
            }
            InboundMessage::Adopt(args) => self.adopt(args.clone(), platform).map(drop),
            InboundMessage::Call(request) => {
                self.call_service(&request.id, &request.service, request.parameters.clone())
            }
            InboundMessage::ProcessChangeQueue => {
                self.process_change_queue();
                Ok(())
            }
            InboundMessage::SetLogLevel(level) => self.set_log_level(level),
            InboundMessage::Unknown { name, .. } => Err(SandboxError::UnknownMessage(name.clone())),
        }
    }

    fn notify<P: Platform + ?Sized>(&mut self, platform: &mut P, event: LocalEvent) -> Result<()> {
        let name = event.name();
        platform
            .on_event(self, event)
            .map_err(|source| SandboxError::Platform {
                event: name.to_owned(),
                source,
            })
    }

    // -- Adoption -----------------------------------------------------------

    /// Validate and register an entity assigned to this sandbox, then notify
    /// plugin code.  Returns `false` when the id was already adopted.
    pub fn adopt<P: Platform + ?Sized>(&mut self, definition: Value, platform: &mut P) -> Result<bool> {
        let definition = EntityDefinition::from_value(definition)?;
        let entity_type = self.types.get_entity_type(&definition.entity_type)?;
        let definition = entity_type.validate_entity(&definition)?;
        let id = EntityId::from(definition.id.as_str());

        if self.entities.contains_key(&id) {
            tracing::debug!(entity_id = %id, "entity already adopted, ignoring");
            return Ok(false);
        }

        let parent = definition.parent_id.as_deref().map(EntityId::from);
        if let Some(parent) = &parent {
            if !self.entities.contains_key(parent) {
                tracing::debug!(entity_id = %id, parent_id = %parent, "parent entity is not adopted");
            }
        }

        let mut entity = Entity::new(definition, entity_type);
        entity.set_parent_id(parent);
        tracing::debug!(
            entity_id = %id,
            name = entity.name(),
            entity_type = entity.entity_type().qualified_name(),
            "adopting entity"
        );
        self.entities.insert(id.clone(), entity);
        self.drop_deferred(&id);

        self.notify(platform, LocalEvent::Adopt(id))?;
        Ok(true)
    }

    // -- Discovery ----------------------------------------------------------

    fn is_known(&self, id: &str) -> bool {
        self.discoveries.contains_key(id)
            || self.entities.contains_key(id)
            || self.deferred_ids.contains(id)
    }

    /// Report an entity discovered by plugin code.
    pub fn report_discovery(&mut self, definition: EntityDefinition) -> Result<DiscoveryOutcome> {
        let entity_type = self.types.get_entity_type(&definition.entity_type)?;
        let mut definition = entity_type.validate_entity(&definition)?;

        if self.is_known(&definition.id) {
            tracing::trace!(entity_id = %definition.id, "ignoring repeated discovery");
            return Ok(DiscoveryOutcome::Known);
        }

        let type_key = entity_type.qualified_name().to_owned();
        if let Some(target) = definition.extends.clone() {
            let target_type = self.types.get_entity_type(&target)?;
            let target_key = target_type.qualified_name();
            let first = self
                .discoveries_by_type
                .get(target_key)
                .and_then(|ids| ids.first())
                .cloned();

            match first {
                Some(first) => definition.extends = Some(first.into_inner()),
                None => {
                    tracing::debug!(
                        entity_id = %definition.id,
                        extends = target_key,
                        "deferring discovery until the extended type is discovered"
                    );
                    self.deferred_ids.insert(EntityId::from(definition.id.as_str()));
                    self.deferred
                        .entry(target_key.to_owned())
                        .or_default()
                        .push(DeferredDiscovery {
                            definition,
                            type_key,
                        });
                    return Ok(DiscoveryOutcome::Deferred);
                }
            }
        }

        self.record_discovery(definition, type_key);
        Ok(DiscoveryOutcome::New)
    }

    /// Record a resolved discovery and send it upstream, releasing any
    /// discoveries that were waiting on its type.
    fn record_discovery(&mut self, definition: EntityDefinition, type_key: String) {
        let mut queue = VecDeque::from([(definition, type_key)]);

        while let Some((definition, type_key)) = queue.pop_front() {
            let id = EntityId::from(definition.id.as_str());
            if self.discoveries.contains_key(&id) || self.entities.contains_key(&id) {
                continue;
            }

            tracing::debug!(entity_id = %id, entity_type = %type_key, "processing new discovery");
            self.discoveries.insert(id.clone(), definition.clone());
            self.discoveries_by_type
                .entry(type_key.clone())
                .or_default()
                .push(id.clone());
            self.transport.send(OutboundMessage::Discovery(definition));

            if !self.config.retry_deferred_discoveries {
                continue;
            }
            for waiting in self.deferred.remove(&type_key).unwrap_or_default() {
                let DeferredDiscovery {
                    mut definition,
                    type_key,
                } = waiting;
                self.deferred_ids.remove(definition.id.as_str());
                tracing::debug!(entity_id = %definition.id, extends = %id, "releasing deferred discovery");
                definition.extends = Some(id.to_string());
                queue.push_back((definition, type_key));
            }
        }
    }

    /// Forget a parked discovery whose id has since been adopted.
    fn drop_deferred(&mut self, id: &EntityId) {
        if !self.deferred_ids.remove(id) {
            return;
        }
        tracing::debug!(entity_id = %id, "adopted entity was waiting on extends, dropping deferred discovery");
        for waiting in self.deferred.values_mut() {
            waiting.retain(|d| d.definition.id != id.as_str());
        }
        self.deferred.retain(|_, waiting| !waiting.is_empty());
    }

    /// Report a child of `parent`.  Logs and returns `Ok(false)` when the
    /// parent's type does not declare the child's type.
    pub fn register_child_entity(&mut self, parent: &str, mut definition: EntityDefinition) -> Result<bool> {
        let parent_type = self
            .entities
            .get(parent)
            .map(|entity| Arc::clone(entity.entity_type()))
            .ok_or_else(|| SandboxError::UnknownEntityId(parent.into()))?;

        let declared = self
            .types
            .get_entity_type(&definition.entity_type)
            .is_ok_and(|child| parent_type.has_child_type(child.name()));
        if !declared {
            tracing::error!(
                entity_id = parent,
                entity_type = parent_type.qualified_name(),
                child_type = %definition.entity_type,
                "entity type has no child entity type of this name"
            );
            return Ok(false);
        }

        if definition.parent_id.is_none() {
            definition.parent_id = Some(parent.to_owned());
        }
        Ok(self.report_discovery(definition)?.is_new())
    }

    // -- State deltas -------------------------------------------------------

    pub fn set_attribute(&mut self, id: &str, name: &str, value: Value) -> Result<()> {
        self.queue_change(id, FieldGroup::Attributes, name, value)
    }

    pub fn set_property(&mut self, id: &str, name: &str, value: Value) -> Result<()> {
        self.queue_change(id, FieldGroup::Properties, name, value)
    }

    /// Merge a single-field change into the entity's queued delta.
    /// Validation happens at flush time.
    pub(crate) fn queue_change(&mut self, id: &str, group: FieldGroup, name: &str, value: Value) -> Result<()> {
        let id = self
            .entities
            .get_key_value(id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| SandboxError::UnknownEntityId(id.into()))?;

        let mut fields = Map::new();
        fields.insert(name.to_owned(), value);
        let mut change = Map::new();
        change.insert(group.as_str().to_owned(), Value::Object(fields));

        let slot = self
            .pending
            .entry(id.clone())
            .or_insert_with(|| json!({ "entityId": id.as_str() }));
        deep_merge(slot, Value::Object(change));

        if self.config.announce_pending_changes {
            self.transport
                .send(OutboundMessage::PendingChanges(PendingChanges {
                    entity_ids: self.pending_entity_ids(),
                }));
        }
        Ok(())
    }

    /// Validate and send every queued delta.  An invalid delta is logged and
    /// dropped without affecting the others.  Returns the number of `data`
    /// messages sent.
    pub fn process_change_queue(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let queue = mem::take(&mut self.pending);
        let mut sent = 0;
        for (id, delta) in queue {
            let Some(entity) = self.entities.get(&id) else {
                continue;
            };
            match entity.entity_type().validate_delta(&delta) {
                Ok(state) => {
                    self.transport.send(OutboundMessage::Data(state));
                    sent += 1;
                }
                Err(err) => {
                    tracing::error!(
                        entity_id = %id,
                        payload = %delta,
                        error = %err,
                        "dropping invalid state changes"
                    );
                }
            }
        }
        tracing::debug!(sent, "change queue flushed");
        sent
    }

    // -- Events and services ------------------------------------------------

    /// Send an event upstream immediately.  Parameters default to `{}` and
    /// are validated when the event declares a parameter group.
    pub fn emit_event(&mut self, id: &str, event: &str, parameters: Option<Value>) -> Result<()> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| SandboxError::UnknownEntityId(id.into()))?;

        let mut parameters = parameters.unwrap_or_else(|| Value::Object(Map::new()));
        if let Some(schema) = entity.entity_type().event_schema(event) {
            let validated = schema.validate(Some(&parameters)).map_err(|e| e.at(event))?;
            parameters = Value::Object(validated.unwrap_or_default());
        }

        self.transport.send(OutboundMessage::Event(EventPayload {
            name: event.to_owned(),
            entity_id: entity.id().clone(),
            parameters,
        }));
        Ok(())
    }

    pub fn register_service(&mut self, id: &str, name: &str, callback: ServiceFn) -> Result<()> {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| SandboxError::UnknownEntityId(id.into()))?;

        if !entity.entity_type().declares_service(name) {
            return Err(SandboxError::UndeclaredService {
                type_name: entity.entity_type().qualified_name().to_owned(),
                service: name.to_owned(),
            });
        }

        tracing::debug!(entity_id = %id, service = name, "service registered");
        entity.services.insert(name.to_owned(), callback);
        Ok(())
    }

    /// Invoke a registered service.  Parameters default to `{}` and are
    /// validated when the service declares a parameter group.
    pub fn call_service(&mut self, id: &str, service: &str, parameters: Option<Value>) -> Result<()> {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| SandboxError::UnknownEntityId(id.into()))?;

        if !entity.has_service(service) {
            return Err(SandboxError::UnknownService {
                entity: entity.name().to_owned(),
                service: service.to_owned(),
            });
        }

        let parameters = parameters.unwrap_or_else(|| Value::Object(Map::new()));
        let parameters = entity
            .entity_type()
            .validate_service_parameters(service, &parameters)?;

        let entity_id = entity.id().clone();
        let Some(mut callback) = entity.services.remove(service) else {
            return Ok(());
        };

        tracing::debug!(entity_id = %entity_id, service, "calling service");
        let outcome = callback(EntityHandle::new(self, entity_id.clone()), parameters);

        // The callback may have registered a replacement for itself.
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.services.entry(service.to_owned()).or_insert(callback);
        }

        outcome.map_err(|source| SandboxError::ServiceFailed {
            service: service.to_owned(),
            source,
        })
    }

    // -- Logging ------------------------------------------------------------

    /// Apply a protocol log level to every attached log output.
    pub fn set_log_level(&mut self, level: &str) -> Result<()> {
        let level: LogLevel = level.parse()?;
        match &self.log_control {
            Some(control) => control.set_level(level)?,
            None => tracing::debug!("no log level control attached"),
        }
        tracing::info!(level = %level, "log level changed");
        Ok(())
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("platform", &self.types.platform())
            .field("config", &self.config)
            .field("entities", &self.entities.len())
            .field("discoveries", &self.discoveries.len())
            .field("deferred", &self.deferred_ids.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
