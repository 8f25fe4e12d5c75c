//! Deterministic cache keys derived from query parameters.

use serde::Serialize;

/// Build `"<prefix>:<canonical json>"` from `params`.
///
/// Object keys are emitted in sorted order, so two parameter sets that differ
/// only in field order map to the same key.
pub fn cache_key<P: Serialize + ?Sized>(prefix: &str, params: &P) -> serde_json::Result<String> {
    let canonical = serde_json::to_value(params)?;
    Ok(format!("{prefix}:{canonical}"))
}
