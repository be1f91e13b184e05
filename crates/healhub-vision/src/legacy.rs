//! Legacy filename conventions.
//!
//! Artifacts produced before the manifest existed encode their role in the
//! file name: `<prefix>_binary_<Class_Name>.<ext>` is a one-vs-rest model
//! for "Class Name". Only consulted for files the manifest does not cover.

use std::path::Path;

const BINARY_MARKER: &str = "_binary_";

/// Class label encoded in a legacy binary model file name
pub fn binary_label_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let start = stem.find(BINARY_MARKER)? + BINARY_MARKER.len();
    let raw = &stem[start..];

    if raw.is_empty() {
        return None;
    }

    Some(raw.replace('_', " "))
}

/// Whether the file name follows the legacy binary convention
pub fn is_binary_filename(path: &Path) -> bool {
    binary_label_from_filename(path).is_some()
}
