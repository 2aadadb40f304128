//! Platform definitions.
//!
//! A platform document describes one plugin: its metadata, how it is run and
//! the entity types it exposes.
//!
//! ```text
//! name = "test-platform"
//! version = "1.2.3-beta.1"
//! keywords = ["lights", "hue"]
//!
//! [types.bulb]
//! config = { host = "string!", port = "integer" }
//! properties = { brightness = { type = "int", min = 0, max = 254 } }
//! ```
//!
//! The document is parsed into a private raw form first, then normalized into
//! a [`PlatformDefinition`] with every default applied.  Type-level rules
//! (inheritance, field groups) are checked later by the
//! [`EntityTypeRegistry`](crate::EntityTypeRegistry).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SchemaError};
use crate::patterns;

const DEFAULT_VERSION: &str = "0.0.1";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A validated platform document with all defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformDefinition {
    /// Machine name (lowercase, e.g. `test-platform`).
    pub name: String,
    /// Human-friendly name, derived from `name` when not given.
    pub friendly_name: String,
    /// SemVer version string.
    pub version: String,
    pub license: Option<String>,
    pub authors: Vec<Author>,
    pub keywords: Vec<String>,
    /// Entry point of the plugin, relative to the platform root.
    pub main_file: String,
    pub dependencies: Dependencies,
    /// Declared entity types keyed by type name.
    pub types: BTreeMap<String, TypeDefinition>,
}

/// A platform author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
}

/// Native and external modules the plugin may require.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependencies {
    #[serde(default)]
    pub native: Vec<String>,
    #[serde(default)]
    pub external: Vec<String>,
}

/// Declaration of a single entity type, as written in the platform document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Ancestors, merged left to right underneath this type.
    #[serde(default, deserialize_with = "one_or_many")]
    pub extends: Vec<String>,

    /// Nested types owned by this type.
    #[serde(default, deserialize_with = "child_names")]
    pub children: Vec<String>,

    #[serde(default = "default_public")]
    pub public: bool,

    #[serde(default)]
    pub config: Option<Map<String, Value>>,
    #[serde(default)]
    pub attributes: Option<Map<String, Value>>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,

    /// Service name → optional parameter field group.
    #[serde(default)]
    pub services: BTreeMap<String, Option<Map<String, Value>>>,
    /// Event name → optional parameter field group.
    #[serde(default)]
    pub events: BTreeMap<String, Option<Map<String, Value>>>,
}

impl Default for TypeDefinition {
    fn default() -> Self {
        Self {
            description: None,
            extends: Vec::new(),
            children: Vec::new(),
            public: true,
            config: None,
            attributes: None,
            properties: None,
            services: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }
}

fn default_public() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlatform {
    name: String,
    friendly_name: Option<String>,
    version: Option<String>,
    license: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    authors: Vec<Author>,
    #[serde(default, deserialize_with = "one_or_many")]
    keywords: Vec<String>,
    main_file: Option<String>,
    #[serde(default)]
    dependencies: Option<Dependencies>,
    #[serde(default)]
    types: Option<BTreeMap<String, TypeDefinition>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(item)) => vec![item],
        Some(OneOrMany::Many(items)) => items,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawChildren {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

fn child_names<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawChildren>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(RawChildren::List(names)) => Ok(names),
        Some(RawChildren::Map(map)) => {
            if let Some((name, _)) = map.iter().find(|(_, v)| !v.is_null()) {
                return Err(serde::de::Error::custom(format!(
                    "child `{name}` must be declared as null; define it as a type instead"
                )));
            }
            Ok(map.into_keys().collect())
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl PlatformDefinition {
    /// Parse and validate a platform document that has already been decoded.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawPlatform = serde_json::from_value(value)?;
        Self::from_raw(raw)
    }

    /// Parse and validate a platform document written as TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let value: Value = toml::from_str(content)?;
        Self::from_value(value)
    }

    fn from_raw(raw: RawPlatform) -> Result<Self> {
        let name = raw.name.trim().to_lowercase();
        check_len("name", &name, 3, 32)?;
        if !patterns::is_platform_name(&name) {
            return Err(invalid("name", "must match the platform name pattern"));
        }

        let friendly_name = match raw.friendly_name {
            Some(friendly) => {
                check_len("friendly_name", &friendly, 3, 64)?;
                friendly
            }
            None => humanize(&name),
        };

        let version = raw.version.unwrap_or_else(|| DEFAULT_VERSION.to_owned());
        if !patterns::is_semver(&version) {
            return Err(invalid("version", "must be a SemVer compliant version string"));
        }

        if let Some(license) = &raw.license {
            check_len("license", license, 1, 32)?;
        }

        for author in &raw.authors {
            check_author(author)?;
        }

        for keyword in &raw.keywords {
            check_len("keywords", keyword, 1, 32)?;
        }

        let dependencies = raw.dependencies.unwrap_or_default();
        for dep in dependencies.native.iter().chain(&dependencies.external) {
            if dep.is_empty() {
                return Err(invalid("dependencies", "entries must not be empty"));
            }
        }

        let main_file = raw.main_file.unwrap_or_else(|| format!("{name}.wasm"));

        tracing::debug!(platform = %name, version = %version, "platform definition parsed");

        Ok(Self {
            name,
            friendly_name,
            version,
            license: raw.license,
            authors: raw.authors,
            keywords: raw.keywords,
            main_file,
            dependencies,
            types: raw.types.unwrap_or_default(),
        })
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidPlatform {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(invalid(
            field,
            format!("length must be between {min} and {max} characters"),
        ));
    }
    Ok(())
}

fn check_author(author: &Author) -> Result<()> {
    check_len("authors.name", &author.name, 1, 64)?;

    if let Some(email) = &author.email {
        let valid = email
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
            });
        if !valid {
            return Err(invalid("authors.email", "must be a valid email"));
        }
    }

    if let Some(web) = &author.web {
        let valid = url::Url::parse(web).is_ok_and(|u| matches!(u.scheme(), "http" | "https"));
        if !valid {
            return Err(invalid("authors.web", "must be a valid uri"));
        }
    }

    Ok(())
}

/// Turn a machine name into a friendly one: `test-platform` → `Test platform`.
fn humanize(name: &str) -> String {
    let spaced: String = name
        .chars()
        .map(|c| if c == '-' || c == '_' { ' ' } else { c })
        .collect();
    let words: Vec<&str> = spaced.split_whitespace().collect();
    let sentence = words.join(" ").to_lowercase();

    let mut chars = sentence.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => sentence,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
