//! Deterministic deep-merge of YAML documents.
//!
//! Merge semantics: mappings merge recursively, everything else the overlay
//! replaces wholesale. Sequences are replaced, never concatenated; silent
//! extension would change fingerprints unpredictably.
//!
//! The merged output is canonicalized (mapping keys sorted recursively)
//! before serialization, so the fingerprint of a merge result is a function
//! of content only, independent of key order in the inputs.

use serde_yaml::{Mapping, Value};

/// Errors produced while merging documents.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// A document failed to parse or the result failed to serialize.
    #[error("yaml merge failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Merges `overlay` on top of `base` and returns the canonical serialized
/// result. Empty inputs short-circuit to the other side unchanged.
///
/// # Errors
///
/// Returns [`MergeError`] if either document is invalid YAML.
pub fn merge(base: &[u8], overlay: &[u8]) -> Result<Vec<u8>, MergeError> {
    if overlay.is_empty() {
        return Ok(base.to_vec());
    }
    if base.is_empty() {
        return Ok(overlay.to_vec());
    }

    let base_value: Value = serde_yaml::from_slice(base)?;
    let overlay_value: Value = serde_yaml::from_slice(overlay)?;
    let merged = canonicalize(deep_merge(base_value, overlay_value));
    Ok(serde_yaml::to_string(&merged)?.into_bytes())
}

/// Folds the documents left to right; later documents win.
///
/// # Errors
///
/// Returns [`MergeError`] if any document is invalid YAML.
pub fn merge_all(docs: &[&[u8]]) -> Result<Vec<u8>, MergeError> {
    let mut result: Vec<u8> = match docs.first() {
        Some(first) => first.to_vec(),
        None => return Ok(Vec::new()),
    };
    for doc in &docs[1..] {
        result = merge(&result, doc)?;
    }
    Ok(result)
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut result = base_map;
            for (key, overlay_value) in overlay_map {
                let merged = match result.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                result.insert(key, merged);
            }
            Value::Mapping(result)
        }
        // Scalars, sequences, and mismatched kinds: overlay replaces base.
        (_, overlay) => overlay,
    }
}

/// Sorts mapping keys recursively so serialization is deterministic.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut entries: Vec<(Value, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| key_ordinal(a).cmp(&key_ordinal(b)));
            Value::Mapping(entries.into_iter().collect::<Mapping>())
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn key_ordinal(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}
