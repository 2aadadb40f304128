//! Panflux platform schemas.
//!
//! This crate turns a platform definition document into an immutable set of
//! validators for the entities a platform plugin manages:
//!
//! - **[`primitive`]** -- [`FieldSchema`] compiles shorthand tokens
//!   (`"int!"`) and descriptor objects into single-field validators.
//! - **[`object`]** -- [`GroupSchema`] validates one field group (`config`,
//!   `attributes`, `properties`, or service/event parameters).
//! - **[`platform`]** -- [`PlatformDefinition`] parses and checks platform
//!   metadata and the raw [`TypeDefinition`]s.
//! - **[`entity_type`]** -- [`EntityType`] validates entity records and
//!   state deltas.
//! - **[`registry`]** -- [`EntityTypeRegistry`] resolves inheritance and
//!   ownership and answers type lookups.
//! - **[`merge`]** -- deep merge over JSON values.
//! - **[`error`]** -- [`SchemaError`] and [`ValidationError`].
//!
//! Every compiled type is `Send + Sync` and can be shared across sandboxes
//! behind an `Arc`.

pub mod entity_type;
pub mod error;
pub mod merge;
pub mod object;
pub mod patterns;
pub mod platform;
pub mod primitive;
pub mod registry;

pub use entity_type::{EntityDefinition, EntityType, FieldGroup, StateDelta};
pub use error::{Result, SchemaError, ValidationError};
pub use merge::{deep_merge, merge_maps, merged};
pub use object::GroupSchema;
pub use platform::{Author, Dependencies, PlatformDefinition, TypeDefinition};
pub use primitive::{FieldSchema, PrimitiveKind};
pub use registry::EntityTypeRegistry;
