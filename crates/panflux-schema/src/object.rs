//! Field-group schemas.
//!
//! A [`GroupSchema`] validates one of an entity's field groups (`config`,
//! `attributes`, `properties`) or the parameters of a service or event.  It
//! accepts exactly the declared keys.  A group the type never declared
//! compiles to [`GroupSchema::Forbidden`] so callers can probe any group
//! without special-casing the missing ones.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Result, SchemaError, ValidationError};
use crate::patterns;
use crate::primitive::FieldSchema;

/// Compiled validator for an object-shaped field group.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupSchema {
    /// The group does not exist for this type; any value is rejected.
    Forbidden,
    /// The group exists and accepts exactly these fields.
    Fields(BTreeMap<String, FieldSchema>),
}

impl GroupSchema {
    /// Compile a group declaration.  `group` is only used for error context.
    pub fn compile(group: &str, declaration: Option<&Map<String, Value>>) -> Result<Self> {
        let Some(declaration) = declaration else {
            return Ok(Self::Forbidden);
        };

        let mut fields = BTreeMap::new();
        for (name, decl) in declaration {
            if !patterns::is_member_name(name) {
                return Err(SchemaError::InvalidFieldName { name: name.clone() }.in_field(group, name));
            }
            let field = FieldSchema::compile(decl).map_err(|e| e.in_field(group, name))?;
            fields.insert(name.clone(), field);
        }
        Ok(Self::Fields(fields))
    }

    pub fn is_declared(&self) -> bool {
        matches!(self, Self::Fields(_))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        match self {
            Self::Forbidden => None,
            Self::Fields(fields) => fields.get(name),
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Self::Forbidden => Vec::new(),
            Self::Fields(fields) => fields.keys().map(String::as_str).collect(),
        }
    }

    /// Validate and normalize a group value.
    ///
    /// An absent group of a declared type is validated as an empty object so
    /// defaults and required fields still apply; it stays absent when that
    /// produces nothing.
    pub fn validate(
        &self,
        value: Option<&Value>,
    ) -> std::result::Result<Option<Map<String, Value>>, ValidationError> {
        let fields = match (self, value) {
            (Self::Forbidden, None) => return Ok(None),
            (Self::Forbidden, Some(_)) => return Err(ValidationError::new("is not allowed")),
            (Self::Fields(fields), _) => fields,
        };

        let empty = Map::new();
        let input = match value {
            None => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => return Err(ValidationError::new("must be of type object")),
        };

        if let Some(unknown) = input.keys().find(|k| !fields.contains_key(k.as_str())) {
            return Err(ValidationError::new("is not allowed").at(unknown));
        }

        let mut out = Map::new();
        for (name, field) in fields {
            if let Some(v) = field.validate(input.get(name)).map_err(|e| e.at(name))? {
                out.insert(name.clone(), v);
            }
        }

        if value.is_none() && out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn group(decl: Value) -> GroupSchema {
        GroupSchema::compile("config", decl.as_object()).expect("group should compile")
    }

    #[test]
    fn absent_declaration_is_forbidden() {
        let schema = GroupSchema::compile("config", None).unwrap();
        assert!(!schema.is_declared());
        assert_eq!(schema.validate(None).unwrap(), None);
        let err = schema.validate(Some(&json!("foo"))).unwrap_err();
        assert_eq!(err.message, "is not allowed");
    }

    #[test]
    fn declared_fields_validate() {
        let schema = group(json!({"host": "string!", "port": "integer"}));
        let out = schema
            .validate(Some(&json!({"host": "example.org", "port": 9898})))
            .unwrap()
            .unwrap();
        assert_eq!(out.get("host"), Some(&json!("example.org")));
        assert_eq!(out.get("port"), Some(&json!(9898)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let schema = group(json!({"host": "string"}));
        let err = schema.validate(Some(&json!({"other": 1}))).unwrap_err();
        assert_eq!(err.path, "other");
        assert_eq!(err.message, "is not allowed");
    }

    #[test]
    fn field_errors_carry_path() {
        let schema = group(json!({"port": "integer"}));
        let err = schema.validate(Some(&json!({"port": "x"}))).unwrap_err();
        assert_eq!(err.to_string(), "\"port\" must be a number");
    }

    #[test]
    fn absent_group_applies_defaults() {
        let schema = group(json!({"port": {"type": "int", "default": 80}}));
        let out = schema.validate(None).unwrap();
        assert_eq!(out, json!({"port": 80}).as_object().cloned());
    }

    #[test]
    fn absent_group_enforces_required_fields() {
        let schema = group(json!({"host": "string!"}));
        let err = schema.validate(None).unwrap_err();
        assert_eq!(err.path, "host");
    }

    #[test]
    fn absent_group_without_defaults_stays_absent() {
        let schema = group(json!({"host": "string"}));
        assert_eq!(schema.validate(None).unwrap(), None);
    }

    #[test]
    fn non_object_value_is_rejected() {
        let schema = group(json!({"host": "string"}));
        let err = schema.validate(Some(&json!([1]))).unwrap_err();
        assert_eq!(err.message, "must be of type object");
    }

    #[test]
    fn invalid_field_name_fails_compile() {
        let err = GroupSchema::compile("config", json!({"9lives": "int"}).as_object()).unwrap_err();
        assert!(matches!(err, SchemaError::Field { .. }));
    }
}
