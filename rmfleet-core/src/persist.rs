use crate::StoreResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::warn;

/// Write a state file as pretty-printed JSON via a temp-file rename, so a
/// crashed write never leaves a truncated file behind.
pub(crate) fn write_json_atomic(path: &Path, value: &impl Serialize) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a state file, tolerating absence and corruption: a missing file is
/// an empty value, a malformed one is logged and treated as empty.
pub(crate) fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Malformed state file {}: {e}; treating as empty", path.display());
            T::default()
        }),
        Err(_) => T::default(),
    }
}
