//! Integration tests for the panflux-sandbox crate.
//!
//! These tests drive a sandbox the way a supervisor does: envelopes in,
//! outbound messages captured from a channel transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use panflux_sandbox::schema::{EntityDefinition, EntityTypeRegistry, PlatformDefinition};
use panflux_sandbox::{
    ChannelTransport, DiscoveryOutcome, EntityHandle, Envelope, LocalEvent, LogForwardLayer,
    LogLevel, LogLevelControl, OutboundMessage, Platform, Sandbox, SandboxConfig, SandboxError,
    Transport, platform_fn,
};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::layer::SubscriberExt;

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

fn registry() -> Arc<EntityTypeRegistry> {
    let platform = PlatformDefinition::from_value(json!({
        "name": "test-platform",
        "types": {
            "device": {
                "attributes": {"x": "string", "model": "string"},
                "properties": {"a": "int", "b": "int", "temp": "number"},
                "services": {"turn_on": null, "dim": {"level": "int!"}},
                "events": {
                    "ping": null,
                    "alarm": {"severity": {"type": "int", "min": 1, "max": 5}},
                },
                "children": ["sensor"],
            },
            "sensor": {"properties": {"value": "number"}},
            "bridge": {},
            "light": {"properties": {"on": "bool"}},
        },
    }))
    .expect("platform should parse");
    Arc::new(EntityTypeRegistry::build(&platform).expect("registry should build"))
}

fn sandbox() -> (Sandbox, UnboundedReceiver<OutboundMessage>) {
    let (transport, rx) = ChannelTransport::new();
    (Sandbox::new(registry(), Arc::new(transport)), rx)
}

fn drain(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn named(messages: &[OutboundMessage], name: &str) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.name() == name)
        .map(|m| serde_json::to_value(m).unwrap()["args"].clone())
        .collect()
}

/// Records every local event and does nothing else.
#[derive(Default)]
struct Recorder {
    events: Vec<LocalEvent>,
}

impl Platform for Recorder {
    fn on_event(&mut self, _sandbox: &mut Sandbox, event: LocalEvent) -> anyhow::Result<()> {
        self.events.push(event);
        Ok(())
    }
}

fn adopt(sandbox: &mut Sandbox, id: &str, entity_type: &str) {
    sandbox
        .adopt(json!({"id": id, "type": entity_type}), &mut Recorder::default())
        .expect("adopt should succeed");
}

// ═══════════════════════════════════════════════════════════════════════
//  Inbound dispatch
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn lifecycle_messages_reach_plugin_verbatim() {
    let (mut sandbox, _rx) = sandbox();
    let mut recorder = Recorder::default();

    sandbox.process_envelope(Envelope::new("start", json!({"foo": "bar"})), &mut recorder);
    sandbox.process_envelope(Envelope::new("discover", json!(null)), &mut recorder);
    sandbox.process_envelope(Envelope::new("stop", json!(42)), &mut recorder);

    assert_eq!(
        recorder.events,
        vec![
            LocalEvent::Start(json!({"foo": "bar"})),
            LocalEvent::Discover(Value::Null),
            LocalEvent::Stop(json!(42)),
        ]
    );
}

#[test]
fn adopting_twice_registers_once() {
    let (mut sandbox, _rx) = sandbox();
    let mut recorder = Recorder::default();
    let payload = json!({"id": "1", "type": "device"});

    sandbox.process_envelope(Envelope::new("adopt", payload.clone()), &mut recorder);
    sandbox.process_envelope(Envelope::new("adopt", payload), &mut recorder);

    assert_eq!(sandbox.entity_count(), 1);
    assert_eq!(recorder.events, vec![LocalEvent::Adopt("1".into())]);
}

#[test]
fn invalid_adoption_leaves_registry_unchanged() {
    let (mut sandbox, _rx) = sandbox();
    let mut recorder = Recorder::default();

    sandbox.process_envelope(
        Envelope::new("adopt", json!({"id": "1", "type": "device", "properties": {"a": "x"}})),
        &mut recorder,
    );
    sandbox.process_envelope(
        Envelope::new("adopt", json!({"id": "2", "type": "device", "color": "red"})),
        &mut recorder,
    );

    assert_eq!(sandbox.entity_count(), 0);
    assert!(recorder.events.is_empty());
}

#[test]
fn unknown_message_does_not_stop_engine() {
    let (mut sandbox, _rx) = sandbox();
    let mut recorder = Recorder::default();

    sandbox.process_envelope(Envelope::new("reticulate", json!({})), &mut recorder);
    sandbox.process_envelope(Envelope::new("call", json!("garbage")), &mut recorder);
    sandbox.process_envelope(
        Envelope::new("adopt", json!({"id": "1", "type": "device"})),
        &mut recorder,
    );

    assert_eq!(sandbox.entity_count(), 1);
}

#[test]
fn set_log_level_reaches_control() {
    struct RecordingControl(Arc<Mutex<Vec<LogLevel>>>);

    impl LogLevelControl for RecordingControl {
        fn set_level(&self, level: LogLevel) -> panflux_sandbox::Result<()> {
            self.0.lock().unwrap().push(level);
            Ok(())
        }
    }

    let levels = Arc::new(Mutex::new(Vec::new()));
    let (transport, _rx) = ChannelTransport::new();
    let mut sandbox = Sandbox::new(registry(), Arc::new(transport))
        .with_log_control(RecordingControl(Arc::clone(&levels)));
    let mut recorder = Recorder::default();

    sandbox.process_envelope(Envelope::new("setLogLevel", json!("silly")), &mut recorder);
    sandbox.process_envelope(Envelope::new("setLogLevel", json!("http")), &mut recorder);
    sandbox.process_envelope(Envelope::new("setLogLevel", json!("loud")), &mut recorder);

    assert_eq!(*levels.lock().unwrap(), vec![LogLevel::Trace, LogLevel::Info]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Discovery
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn repeated_discovery_is_not_new() {
    let (mut sandbox, mut rx) = sandbox();

    let first = sandbox
        .report_discovery(EntityDefinition::new("684", "bridge"))
        .unwrap();
    let second = sandbox
        .report_discovery(EntityDefinition::new("684", "bridge"))
        .unwrap();

    assert_eq!(first, DiscoveryOutcome::New);
    assert_eq!(second, DiscoveryOutcome::Known);
    let messages = drain(&mut rx);
    assert_eq!(
        named(&messages, "discovery"),
        vec![json!({"id": "684", "name": "bridge-684", "type": "bridge"})]
    );
}

#[test]
fn adopted_ids_count_as_known() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    let outcome = sandbox
        .report_discovery(EntityDefinition::new("1", "device"))
        .unwrap();
    assert_eq!(outcome, DiscoveryOutcome::Known);
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn discover_unknown_type_logs_one_error() {
    let (transport, mut rx) = ChannelTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let mut sandbox = Sandbox::new(registry(), Arc::clone(&transport));
    let mut platform = platform_fn(|sandbox: &mut Sandbox, event: LocalEvent| {
        if let LocalEvent::Discover(_) = event {
            sandbox.report_discovery(EntityDefinition::new("9", "unknown-type"))?;
        }
        Ok(())
    });

    let subscriber = tracing_subscriber::registry().with(LogForwardLayer::new(Arc::clone(&transport)));
    tracing::subscriber::with_default(subscriber, || {
        sandbox.process_envelope(Envelope::new("discover", json!({})), &mut platform);
    });

    let messages = drain(&mut rx);
    assert!(named(&messages, "discovery").is_empty());
    let errors: Vec<Value> = named(&messages, "log")
        .into_iter()
        .filter(|record| record["level"] == "error")
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(sandbox.discovery_count(), 0);
}

#[test]
fn deferred_discovery_is_released_by_first_of_type() {
    let (mut sandbox, mut rx) = sandbox();

    let mut light = EntityDefinition::new("L1", "light");
    light.extends = Some("bridge".into());

    assert_eq!(
        sandbox.report_discovery(light.clone()).unwrap(),
        DiscoveryOutcome::Deferred
    );
    assert_eq!(sandbox.deferred_count(), 1);
    assert_eq!(
        sandbox.report_discovery(light).unwrap(),
        DiscoveryOutcome::Known
    );
    assert!(drain(&mut rx).is_empty());

    assert_eq!(
        sandbox
            .report_discovery(EntityDefinition::new("B1", "bridge"))
            .unwrap(),
        DiscoveryOutcome::New
    );
    assert_eq!(sandbox.deferred_count(), 0);

    let discoveries = named(&drain(&mut rx), "discovery");
    assert_eq!(discoveries.len(), 2);
    assert_eq!(discoveries[0]["id"], "B1");
    assert_eq!(discoveries[1]["id"], "L1");
    assert_eq!(discoveries[1]["extends"], "B1");
}

#[test]
fn later_extends_resolve_immediately() {
    let (mut sandbox, mut rx) = sandbox();
    sandbox
        .report_discovery(EntityDefinition::new("B1", "bridge"))
        .unwrap();
    sandbox
        .report_discovery(EntityDefinition::new("B2", "bridge"))
        .unwrap();

    let mut light = EntityDefinition::new("L1", "light");
    light.extends = Some("test-platform.bridge".into());
    assert!(sandbox.report_discovery(light).unwrap().is_new());

    let discoveries = named(&drain(&mut rx), "discovery");
    assert_eq!(discoveries[2]["extends"], "B1");
}

#[test]
fn deferred_discoveries_stay_parked_without_retry() {
    let (transport, mut rx) = ChannelTransport::new();
    let mut sandbox = Sandbox::new(registry(), Arc::new(transport))
        .with_config(SandboxConfig::new().with_retry_deferred_discoveries(false));

    let mut light = EntityDefinition::new("L1", "light");
    light.extends = Some("bridge".into());
    sandbox.report_discovery(light).unwrap();
    sandbox
        .report_discovery(EntityDefinition::new("B1", "bridge"))
        .unwrap();

    assert_eq!(named(&drain(&mut rx), "discovery").len(), 1);
    assert_eq!(sandbox.deferred_count(), 1);
}

#[test]
fn adopted_ids_are_not_released_from_deferral() {
    let (mut sandbox, mut rx) = sandbox();

    let mut light = EntityDefinition::new("L1", "light");
    light.extends = Some("bridge".into());
    assert_eq!(
        sandbox.report_discovery(light).unwrap(),
        DiscoveryOutcome::Deferred
    );

    adopt(&mut sandbox, "L1", "light");
    assert_eq!(sandbox.deferred_count(), 0);

    sandbox
        .report_discovery(EntityDefinition::new("B1", "bridge"))
        .unwrap();

    let ids: Vec<Value> = named(&drain(&mut rx), "discovery")
        .into_iter()
        .map(|d| d["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("B1")]);
    assert!(sandbox.discovery("L1").is_none());
    assert!(sandbox.get_entity("L1").is_some());
}

#[test]
fn child_entities_are_discovered_with_parent() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    let mut device = sandbox.entity("1").unwrap();
    assert!(device
        .register_child_entity(EntityDefinition::new("42", "sensor"))
        .unwrap());
    assert!(!device
        .register_child_entity(EntityDefinition::new("42", "sensor"))
        .unwrap());
    assert!(!device
        .register_child_entity(EntityDefinition::new("43", "bridge"))
        .unwrap());

    let discoveries = named(&drain(&mut rx), "discovery");
    assert_eq!(
        discoveries,
        vec![json!({"id": "42", "name": "sensor-42", "type": "sensor", "parentId": "1"})]
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  State deltas
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn changes_merge_into_one_data_message() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    let mut device = sandbox.entity("1").unwrap();
    device.set_property("a", json!(1)).unwrap();
    device.set_attribute("x", json!("y")).unwrap();
    device.set_property("b", json!(2)).unwrap();

    let pending = named(&drain(&mut rx), "pendingChanges");
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[2], json!({"entityIds": ["1"]}));

    assert_eq!(sandbox.process_change_queue(), 1);
    let data = named(&drain(&mut rx), "data");
    assert_eq!(
        data,
        vec![json!({
            "entityId": "1",
            "properties": {"a": 1, "b": 2},
            "attributes": {"x": "y"},
        })]
    );
}

#[test]
fn later_values_win_within_a_batch() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    sandbox.set_property("1", "a", json!(1)).unwrap();
    sandbox.set_property("1", "a", json!(3)).unwrap();
    sandbox.process_change_queue();

    let data = named(&drain(&mut rx), "data");
    assert_eq!(data[0]["properties"], json!({"a": 3}));
}

#[test]
fn flushing_empty_queue_sends_nothing() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    assert_eq!(sandbox.process_change_queue(), 0);
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn invalid_delta_is_isolated() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");
    adopt(&mut sandbox, "2", "device");

    sandbox.set_property("1", "a", json!("not a number")).unwrap();
    sandbox.set_property("2", "a", json!(5)).unwrap();
    assert_eq!(sandbox.process_change_queue(), 1);

    let data = named(&drain(&mut rx), "data");
    assert_eq!(data, vec![json!({"entityId": "2", "properties": {"a": 5}, "attributes": {}})]);
    assert!(sandbox.pending_entity_ids().is_empty());
}

#[test]
fn undeclared_property_is_dropped_at_flush() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    sandbox.set_property("1", "humidity", json!(40)).unwrap();
    assert_eq!(sandbox.process_change_queue(), 0);
    assert!(named(&drain(&mut rx), "data").is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Events and services
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn events_are_sent_immediately() {
    let (mut sandbox, mut rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    let mut device = sandbox.entity("1").unwrap();
    device.emit("ping", None).unwrap();
    device.emit("alarm", Some(json!({"severity": 3}))).unwrap();
    let err = device.emit("alarm", Some(json!({"severity": 9}))).unwrap_err();
    assert!(matches!(err, SandboxError::Validation(_)));

    let events = named(&drain(&mut rx), "event");
    assert_eq!(
        events,
        vec![
            json!({"name": "ping", "entityId": "1", "parameters": {}}),
            json!({"name": "alarm", "entityId": "1", "parameters": {"severity": 3}}),
        ]
    );
}

#[test]
fn registering_undeclared_service_fails() {
    let (mut sandbox, _rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    let err = sandbox
        .entity("1")
        .unwrap()
        .register_service("explode", |_: EntityHandle<'_>, _| Ok(()))
        .unwrap_err();
    assert!(matches!(err, SandboxError::UndeclaredService { .. }));
}

#[test]
fn calling_unregistered_service_fails() {
    let (mut sandbox, _rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    let err = sandbox.call_service("1", "turn_on", None).unwrap_err();
    assert!(matches!(err, SandboxError::UnknownService { .. }));
    let err = sandbox.call_service("7", "turn_on", None).unwrap_err();
    assert!(matches!(err, SandboxError::UnknownEntityId(_)));
}

#[test]
fn inbound_call_invokes_registered_service() {
    let (mut sandbox, mut rx) = sandbox();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let mut platform = platform_fn(move |sandbox: &mut Sandbox, event: LocalEvent| {
        if let LocalEvent::Adopt(id) = event {
            let mut entity = sandbox
                .entity(&id)
                .ok_or_else(|| anyhow::anyhow!("adopted entity missing"))?;
            entity.register_service("turn_on", |mut handle: EntityHandle<'_>, _| {
                handle.set_property("a", json!(1))?;
                Ok(())
            })?;
            let counter = Arc::clone(&counter);
            entity.register_service("dim", move |_: EntityHandle<'_>, params| {
                assert_eq!(params, json!({"level": 40}));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
        }
        Ok(())
    });

    sandbox.process_envelope(
        Envelope::new("adopt", json!({"id": "1", "type": "device"})),
        &mut platform,
    );
    sandbox.process_envelope(
        Envelope::new("call", json!({"id": "1", "service": "turn_on"})),
        &mut platform,
    );
    sandbox.process_envelope(
        Envelope::new("call", json!({"id": "1", "service": "dim", "parameters": {"level": 40}})),
        &mut platform,
    );
    sandbox.process_envelope(
        Envelope::new("call", json!({"id": "1", "service": "dim", "parameters": {"level": "high"}})),
        &mut platform,
    );
    sandbox.process_envelope(Envelope::new("processChangeQueue", Value::Null), &mut platform);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let data = named(&drain(&mut rx), "data");
    assert_eq!(data, vec![json!({"entityId": "1", "properties": {"a": 1}, "attributes": {}})]);

    let entity = sandbox.get_entity("1").unwrap();
    assert!(entity.has_service("turn_on"));
    assert!(entity.has_service("dim"));
}

#[test]
fn failing_service_reports_source() {
    let (mut sandbox, _rx) = sandbox();
    adopt(&mut sandbox, "1", "device");

    sandbox
        .entity("1")
        .unwrap()
        .register_service("turn_on", |_: EntityHandle<'_>, _| {
            Err(anyhow::anyhow!("relay stuck"))
        })
        .unwrap();

    let err = sandbox.call_service("1", "turn_on", None).unwrap_err();
    assert_eq!(err.to_string(), "service \"turn_on\" failed: relay stuck");
    assert!(sandbox.get_entity("1").unwrap().has_service("turn_on"));
}

// ═══════════════════════════════════════════════════════════════════════
//  End to end
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn e2e_adopt_set_property_flush() {
    let (transport, mut out) = ChannelTransport::new();
    let mut sandbox = Sandbox::new(registry(), Arc::new(transport));
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(Envelope::new("adopt", json!({"id": "1", "type": "device"})))
        .unwrap();
    tx.send(Envelope::new("processChangeQueue", Value::Null))
        .unwrap();
    drop(tx);

    let mut platform = platform_fn(|sandbox: &mut Sandbox, event: LocalEvent| {
        if let LocalEvent::Adopt(id) = event {
            if let Some(mut entity) = sandbox.entity(&id) {
                entity.set_property("temp", json!(21.5))?;
            }
        }
        Ok(())
    });
    sandbox.run(rx, &mut platform).await;

    let messages = drain(&mut out);
    assert_eq!(
        named(&messages, "data"),
        vec![json!({"entityId": "1", "properties": {"temp": 21.5}, "attributes": {}})]
    );
    assert_eq!(
        named(&messages, "pendingChanges"),
        vec![json!({"entityIds": ["1"]})]
    );
}

#[tokio::test]
async fn e2e_sandbox_runs_in_spawned_task() {
    let (transport, mut out) = ChannelTransport::new();
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut sandbox = Sandbox::new(registry(), Arc::new(transport));
        let mut recorder = Recorder::default();
        sandbox.run(rx, &mut recorder).await;
        (sandbox.entity_count(), recorder.events.len())
    });

    tx.send(Envelope::new("start", json!({}))).unwrap();
    tx.send(Envelope::new("adopt", json!({"id": "1", "type": "device"})))
        .unwrap();
    tx.send(Envelope::new("adopt", json!({"id": "2", "type": "light"})))
        .unwrap();
    drop(tx);

    let (entities, events) = handle.await.unwrap();
    assert_eq!(entities, 2);
    assert_eq!(events, 3);
    assert!(drain(&mut out).is_empty());
}
