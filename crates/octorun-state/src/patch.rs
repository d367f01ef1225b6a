//! JSON merge patch (RFC 7386) with a `$patch: replace` directive.
//!
//! Plain merge patch merges objects key by key, replaces everything else
//! and deletes keys whose patch value is `null`. An object in the patch
//! carrying `"$patch": "replace"` instead replaces its target wholesale
//! (minus the directive itself), which is what revision snapshots use to
//! restore a template without leaking fields from the current one. The
//! children of a replaced object are copied verbatim, nulls and nested
//! directives included.

use serde_json::{Map, Value};

/// Key of the patch directive inside a patch object.
pub const PATCH_DIRECTIVE: &str = "$patch";

/// Apply `patch` onto `target` in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if is_replace(patch_map) {
        let mut replacement = patch_map.clone();
        replacement.remove(PATCH_DIRECTIVE);
        *target = Value::Object(replacement);
        return;
    }

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if key == PATCH_DIRECTIVE {
            continue;
        }
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn is_replace(map: &Map<String, Value>) -> bool {
    map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("replace")
}
