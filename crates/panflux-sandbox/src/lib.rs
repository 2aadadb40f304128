//! Panflux platform sandbox.
//!
//! This crate hosts a platform plugin behind an ordered message channel to
//! its supervisor.  Plugin code never talks to the outside world directly;
//! every entity, discovery, state change and log line flows through the
//! engine:
//!
//! - **[`sandbox`]** -- [`Sandbox`] dispatches inbound control messages,
//!   owns adopted entities, deduplicates discoveries and batches deltas.
//! - **[`entity`]** -- [`Entity`] and the plugin-facing [`EntityHandle`].
//! - **[`protocol`]** -- [`Envelope`], [`InboundMessage`] and
//!   [`OutboundMessage`] wire types.
//! - **[`transport`]** -- the [`Transport`] seam and [`ChannelTransport`].
//! - **[`logging`]** -- tracing setup, log forwarding and runtime level
//!   control.
//! - **[`config`]** -- [`SandboxConfig`].
//! - **[`error`]** -- [`SandboxError`].
//!
//! Entity types come from [`panflux_schema`], re-exported as [`schema`].

pub mod config;
pub mod entity;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod sandbox;
pub mod transport;

pub use panflux_schema as schema;

pub use config::SandboxConfig;
pub use entity::{Entity, EntityHandle, ServiceFn};
pub use error::{Result, SandboxError};
pub use logging::{LogForwardLayer, LogLevel, LogLevelControl, LogLevelHandle, init_tracing};
pub use protocol::{
    CallRequest, EntityId, Envelope, EventPayload, InboundMessage, LogRecord, OutboundMessage,
    PendingChanges,
};
pub use sandbox::{DiscoveryOutcome, LocalEvent, Platform, PlatformFn, Sandbox, platform_fn};
pub use transport::{ChannelTransport, Transport};
