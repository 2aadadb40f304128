//! Name and version patterns shared by the platform and type schemas.

use std::sync::LazyLock;

use regex::Regex;

/// Platform names: lowercase, at least three characters.
static PLATFORM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9\-_]+[a-z0-9]$").expect("static regex"));

/// Entity type names: lowercase, at least two characters.
static TYPE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9\-_]*[a-z0-9]$").expect("static regex"));

/// Field, service and event names.
static MEMBER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_\-]*$").expect("static regex"));

// Ref https://github.com/semver/semver/issues/232
static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)",
        r"(-(0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*)(\.(0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*))*)?",
        r"(\+[0-9a-zA-Z-]+(\.[0-9a-zA-Z-]+)*)?$",
    ))
    .expect("static regex")
});

pub fn is_platform_name(s: &str) -> bool {
    PLATFORM_NAME.is_match(s)
}

pub fn is_type_name(s: &str) -> bool {
    TYPE_NAME.is_match(s)
}

pub fn is_member_name(s: &str) -> bool {
    MEMBER_NAME.is_match(s)
}

pub fn is_semver(s: &str) -> bool {
    SEMVER.is_match(s)
}
