//! Revision payloads.
//!
//! A revision stores a merge patch holding only the runner set's template,
//! marked `"$patch": "replace"` so that applying it onto any runner set
//! swaps the whole template back in without merging leftover fields.

use octorun_state::patch::PATCH_DIRECTIVE;
use octorun_state::{RunnerSet, merge_patch};
use serde_json::{Map, Value, json};

use crate::error::{HistoryError, HistoryResult};

/// The restorable patch for `set`'s template, as JSON.
pub fn revision_data(set: &RunnerSet) -> HistoryResult<Value> {
    let template =
        serde_json::to_value(&set.spec.template).map_err(|e| HistoryError::Encode(e.to_string()))?;
    let Value::Object(mut template) = template else {
        return Err(HistoryError::Encode(format!(
            "template of {} is not an object",
            set.metadata.key()
        )));
    };
    template.insert(PATCH_DIRECTIVE.to_string(), Value::String("replace".to_string()));
    Ok(json!({ "spec": { "template": Value::Object(template) } }))
}

/// Serialized form of [`revision_data`].
pub fn serialize(set: &RunnerSet) -> HistoryResult<Vec<u8>> {
    let data = revision_data(set)?;
    serde_json::to_vec(&data).map_err(|e| HistoryError::Encode(e.to_string()))
}

/// Apply serialized revision data over a copy of `target`.
pub fn restore(target: &RunnerSet, patch: &[u8]) -> HistoryResult<RunnerSet> {
    let patch: Value =
        serde_json::from_slice(patch).map_err(|e| HistoryError::Decode(e.to_string()))?;
    restore_value(target, &patch)
}

/// Apply revision data over a copy of `target`.
pub fn restore_value(target: &RunnerSet, patch: &Value) -> HistoryResult<RunnerSet> {
    if !matches!(patch, Value::Object(map) if is_template_patch(map)) {
        return Err(HistoryError::Decode(
            "revision data does not carry spec.template".to_string(),
        ));
    }
    let mut doc = serde_json::to_value(target).map_err(|e| HistoryError::Encode(e.to_string()))?;
    merge_patch(&mut doc, patch);
    serde_json::from_value(doc).map_err(|e| HistoryError::Decode(e.to_string()))
}

fn is_template_patch(map: &Map<String, Value>) -> bool {
    map.get("spec")
        .and_then(|spec| spec.get("template"))
        .is_some_and(Value::is_object)
}
