//! JSON cache files.
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous file intact.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PersistError;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    log::trace!("[CACHE] wrote {}", path.display());
    Ok(())
}

/// Reads `path`, falling back to `fallback()` when the file is missing or
/// unreadable. Corruption is logged, never returned.
pub fn read_json_or<T, F>(path: &Path, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match read_json(path) {
        Ok(value) => value,
        Err(PersistError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("[CACHE] {} not found, using defaults", path.display());
            fallback()
        }
        Err(e) => {
            log::warn!("[CACHE] {} unusable ({}), using defaults", path.display(), e);
            fallback()
        }
    }
}
