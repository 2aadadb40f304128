//! Primitive field schemas.
//!
//! A field is declared either with a shorthand token (`"string"`, `"int!"`)
//! or with a descriptor object:
//!
//! ```text
//! { type: "int", min: 42, max: 684, default: 100, required: false }
//! ```
//!
//! [`FieldSchema::compile`] turns either form into a reusable validator.
//! Aliases collapse onto the four canonical [`PrimitiveKind`]s so the rest of
//! the crate never sees `text`, `int`, `float`, `double` or `bool`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SchemaError, ValidationError};

const MAX_DESCRIPTION_LEN: usize = 128;
const DESCRIPTOR_KEYS: &[&str] = &["type", "description", "default", "required", "min", "max"];

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// The canonical primitive value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl PrimitiveKind {
    /// Resolve a type token, including aliases.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "string" | "text" => Some(Self::String),
            "integer" | "int" => Some(Self::Integer),
            "number" | "float" | "double" => Some(Self::Number),
            "boolean" | "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    fn type_error(self) -> ValidationError {
        ValidationError::new(match self {
            Self::String => "must be a string",
            Self::Integer | Self::Number => "must be a number",
            Self::Boolean => "must be a boolean",
        })
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
        }
    }
}

// ---------------------------------------------------------------------------
// Field schema
// ---------------------------------------------------------------------------

/// A compiled validator for a single primitive field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub kind: PrimitiveKind,
    pub description: Option<String>,
    pub default: Option<Value>,
    pub required: bool,
    /// Whether an explicit `null` is accepted.
    pub nullable: bool,
    /// Lower bound: the value for numbers, the character count for strings.
    pub min: Option<f64>,
    /// Upper bound: the value for numbers, the character count for strings.
    pub max: Option<f64>,
}

impl FieldSchema {
    /// A nullable, optional field of the given kind without constraints.
    pub fn new(kind: PrimitiveKind) -> Self {
        Self {
            kind,
            description: None,
            default: None,
            required: false,
            nullable: true,
            min: None,
            max: None,
        }
    }

    /// Compile a field from its declaration, which is either a shorthand
    /// string or a descriptor object.
    pub fn compile(declaration: &Value) -> Result<Self> {
        match declaration {
            Value::String(token) => Self::parse_shorthand(token),
            Value::Object(map) => Self::from_descriptor(map),
            other => Err(SchemaError::UnsupportedDescriptor {
                reason: format!("expected a type string or descriptor object, got `{other}`"),
            }),
        }
    }

    /// Parse a shorthand token.  A trailing `!` marks the field required and
    /// non-nullable.
    pub fn parse_shorthand(token: &str) -> Result<Self> {
        let (name, required) = match token.strip_suffix('!') {
            Some(name) => (name, true),
            None => (token, false),
        };
        let kind = PrimitiveKind::from_token(name).ok_or_else(|| {
            SchemaError::UnknownPrimitiveType {
                token: token.to_owned(),
            }
        })?;
        Ok(Self {
            required,
            nullable: !required,
            ..Self::new(kind)
        })
    }

    fn from_descriptor(map: &Map<String, Value>) -> Result<Self> {
        if let Some(key) = map.keys().find(|k| !DESCRIPTOR_KEYS.contains(&k.as_str())) {
            return Err(invalid(format!("`{key}` is not allowed")));
        }

        let token = match map.get("type") {
            Some(Value::String(token)) => token,
            Some(_) => return Err(invalid("`type` must be a string")),
            None => return Err(invalid("`type` is required")),
        };
        let kind = PrimitiveKind::from_token(token).ok_or_else(|| {
            SchemaError::UnknownPrimitiveType {
                token: token.clone(),
            }
        })?;

        let description = match map.get("description") {
            None | Some(Value::Null) => None,
            Some(Value::String(d)) if d.chars().count() <= MAX_DESCRIPTION_LEN => Some(d.clone()),
            Some(Value::String(_)) => {
                return Err(invalid(format!(
                    "`description` must be at most {MAX_DESCRIPTION_LEN} characters"
                )));
            }
            Some(_) => return Err(invalid("`description` must be a string")),
        };

        let required = match map.get("required") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(invalid("`required` must be a boolean")),
        };

        let min = bound(map, "min", kind)?;
        let max = bound(map, "max", kind)?;
        if let (Some(min), Some(max)) = (min, max) {
            if max < min {
                return Err(SchemaError::InvalidBounds { min, max });
            }
        }

        let mut schema = Self {
            kind,
            description,
            default: None,
            required,
            nullable: !required,
            min,
            max,
        };

        if let Some(default) = map.get("default") {
            let normalized = schema
                .check_value(default)
                .map_err(|e| invalid(format!("`default` {}", e.message)))?;
            schema.default = Some(normalized);
        }

        Ok(schema)
    }

    /// Validate and normalize a field value.
    ///
    /// `None` means the field was absent.  Returns `Ok(None)` when the field
    /// is optional, absent and has no default.
    pub fn validate(&self, value: Option<&Value>) -> std::result::Result<Option<Value>, ValidationError> {
        match value {
            None => match &self.default {
                Some(default) => Ok(Some(default.clone())),
                None if self.required => Err(ValidationError::new("is required")),
                None => Ok(None),
            },
            Some(Value::Null) if self.nullable => Ok(Some(Value::Null)),
            Some(v) => self.check_value(v).map(Some),
        }
    }

    /// Check a concrete (non-absent) value against kind and bounds.
    fn check_value(&self, value: &Value) -> std::result::Result<Value, ValidationError> {
        match self.kind {
            PrimitiveKind::String => {
                let s = value.as_str().ok_or_else(|| self.kind.type_error())?;
                let len = s.chars().count() as f64;
                if let Some(min) = self.min.filter(|min| len < *min) {
                    return Err(ValidationError::new(format!(
                        "length must be at least {min} characters long"
                    )));
                }
                if let Some(max) = self.max.filter(|max| len > *max) {
                    return Err(ValidationError::new(format!(
                        "length must be less than or equal to {max} characters long"
                    )));
                }
                Ok(value.clone())
            }
            PrimitiveKind::Integer => {
                let n = value.as_f64().ok_or_else(|| self.kind.type_error())?;
                if n.fract() != 0.0 {
                    return Err(ValidationError::new("must be an integer"));
                }
                self.check_range(n)?;
                // Normalize 42.0 to 42 so integers always serialize as such.
                Ok(value
                    .as_i64()
                    .or_else(|| value.as_u64().and_then(|u| i64::try_from(u).ok()))
                    .map_or_else(|| value.clone(), Value::from))
            }
            PrimitiveKind::Number => {
                let n = value.as_f64().ok_or_else(|| self.kind.type_error())?;
                self.check_range(n)?;
                Ok(value.clone())
            }
            PrimitiveKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => Err(self.kind.type_error()),
            },
        }
    }

    fn check_range(&self, n: f64) -> std::result::Result<(), ValidationError> {
        if let Some(min) = self.min.filter(|min| n < *min) {
            return Err(ValidationError::new(format!(
                "must be greater than or equal to {min}"
            )));
        }
        if let Some(max) = self.max.filter(|max| n > *max) {
            return Err(ValidationError::new(format!(
                "must be less than or equal to {max}"
            )));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidDescriptor {
        reason: reason.into(),
    }
}

/// Read a `min`/`max` bound, enforcing what the kind allows.
fn bound(map: &Map<String, Value>, key: &str, kind: PrimitiveKind) -> Result<Option<f64>> {
    let Some(raw) = map.get(key) else {
        return Ok(None);
    };
    let n = raw
        .as_f64()
        .ok_or_else(|| invalid(format!("`{key}` must be a number")))?;
    match kind {
        PrimitiveKind::Boolean => Err(invalid(format!("`{key}` is not allowed for boolean fields"))),
        PrimitiveKind::String if n < 0.0 || n.fract() != 0.0 => Err(invalid(format!(
            "`{key}` must be a non-negative integer for string fields"
        ))),
        PrimitiveKind::Integer if n.fract() != 0.0 => Err(invalid(format!(
            "`{key}` must be an integer for integer fields"
        ))),
        _ => Ok(Some(n)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
