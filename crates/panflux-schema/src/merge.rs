//! Structural deep merge over JSON values.
//!
//! Used for inheritance resolution (ancestor definitions merged underneath a
//! type) and for accumulating state deltas.  Objects merge key by key; every
//! other variant, arrays included, is replaced by the overlay.

use serde_json::{Map, Value};

/// Merge `overlay` into `base` in place.  Values from `overlay` win.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => merge_maps(base, overlay),
        (base, overlay) => *base = overlay,
    }
}

/// Merge two object maps in place.  Values from `overlay` win.
pub fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                base.insert(key, value);
            }
        }
    }
}

/// Return `overlay` merged on top of a copy of `base`.
#[must_use]
pub fn merged(base: &Value, overlay: Value) -> Value {
    let mut out = base.clone();
    deep_merge(&mut out, overlay);
    out
}
