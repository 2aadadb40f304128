//! Sandbox error types.
//!
//! Every runtime failure inside the sandbox surfaces as a [`SandboxError`].
//! Errors raised while handling one inbound message are logged at the
//! dispatch boundary and never stop the engine; the same errors are returned
//! to plugin code calling the entity API directly.

use panflux_schema::{SchemaError, ValidationError};

use crate::protocol::EntityId;

/// Unified error type for the sandbox protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    // -- Protocol -----------------------------------------------------------
    /// The supervisor sent a message name the engine does not handle.
    #[error("received unknown message of type \"{0}\"")]
    UnknownMessage(String),

    /// A known message carried arguments of the wrong shape.
    #[error("invalid arguments for message \"{message}\": {reason}")]
    InvalidPayload { message: String, reason: String },

    // -- Entities -----------------------------------------------------------
    /// The id does not name an adopted entity.
    #[error("unknown entity id \"{0}\"")]
    UnknownEntityId(EntityId),

    /// No callback was registered for a service on this entity.
    #[error("tried to call unknown service \"{service}\" on \"{entity}\"")]
    UnknownService { entity: String, service: String },

    /// The entity type does not declare the service being registered.
    #[error("entity type \"{type_name}\" does not define a service named \"{service}\"")]
    UndeclaredService { type_name: String, service: String },

    /// A registered service callback returned an error.
    #[error("service \"{service}\" failed: {source}")]
    ServiceFailed {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    /// Plugin code failed while handling a local event.
    #[error("platform handler for \"{event}\" failed: {source}")]
    Platform {
        event: String,
        #[source]
        source: anyhow::Error,
    },

    // -- Validation ---------------------------------------------------------
    /// An entity type lookup or schema operation failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A payload did not match its compiled schema.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    // -- Logging and configuration ------------------------------------------
    /// `setLogLevel` named a level the sandbox does not know.
    #[error("invalid log level \"{0}\"")]
    InvalidLogLevel(String),

    /// Installing or reloading the tracing subscriber failed.
    #[error("logging error: {0}")]
    Logging(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
