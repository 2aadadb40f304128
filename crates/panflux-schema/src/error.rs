//! Schema error types.
//!
//! [`SchemaError`] covers everything that can go wrong while loading a
//! platform definition and building its type registry.  All of these are
//! fatal at load time.  [`ValidationError`] is the recoverable counterpart
//! produced when a payload does not match a compiled schema.

/// A payload failed validation against a compiled schema.
///
/// The `path` points at the offending value using dotted notation
/// (`properties.temp`); it is empty when the root value itself is wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("\"{}\" {message}", display_path(.path))]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            message: message.into(),
        }
    }

    /// Prefix the error path with `segment`.
    #[must_use]
    pub fn at(mut self, segment: &str) -> Self {
        self.path = if self.path.is_empty() {
            segment.to_owned()
        } else {
            format!("{segment}.{}", self.path)
        };
        self
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "value" } else { path }
}

/// Unified error type for schema compilation and type registry builds.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    // -- Primitive descriptors ----------------------------------------------
    #[error("unknown primitive type `{token}`")]
    UnknownPrimitiveType { token: String },

    #[error("unsupported field descriptor: {reason}")]
    UnsupportedDescriptor { reason: String },

    #[error("invalid field descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("invalid bounds: max {max} is less than min {min}")]
    InvalidBounds { min: f64, max: f64 },

    #[error("invalid field name `{name}`")]
    InvalidFieldName { name: String },

    /// Wraps a descriptor error with the group and field it occurred in.
    #[error("field `{group}.{field}`: {source}")]
    Field {
        group: String,
        field: String,
        #[source]
        source: Box<SchemaError>,
    },

    // -- Platform metadata --------------------------------------------------
    #[error("invalid platform definition: `{field}` {reason}")]
    InvalidPlatform { field: String, reason: String },

    #[error("invalid type name `{name}`")]
    InvalidTypeName { name: String },

    /// Two declared names canonicalize to the same type name.
    #[error("type names `{first}` and `{second}` both resolve to `{name}`")]
    DuplicateTypeName {
        name: String,
        first: String,
        second: String,
    },

    // -- Type registry ------------------------------------------------------
    #[error("type `{type_name}` extends unknown type `{parent}`")]
    UnknownParentType { type_name: String, parent: String },

    #[error("type `{type_name}` declares unknown child type `{child}`")]
    UnknownChildType { type_name: String, child: String },

    #[error("circular extension: `{type_name}` extends `{ancestor}` which already extends it")]
    CircularExtension { type_name: String, ancestor: String },

    #[error("type `{type_name}` declares `{field}` in both `{first}` and `{second}`")]
    NamespaceCollision {
        type_name: String,
        field: String,
        first: String,
        second: String,
    },

    #[error("invalid hierarchy for type `{type_name}`: {reason}")]
    InvalidHierarchy { type_name: String, reason: String },

    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),

    // -- Payloads -----------------------------------------------------------
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SchemaError {
    pub(crate) fn in_field(self, group: &str, field: &str) -> Self {
        Self::Field {
            group: group.to_owned(),
            field: field.to_owned(),
            source: Box::new(self),
        }
    }
}

/// Convenience alias used throughout the schema crate.
pub type Result<T> = std::result::Result<T, SchemaError>;
