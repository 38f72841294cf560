use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::domain::{DatasetKey, DatasetManifest, MANIFEST_SUFFIX, RemoteFileRef};
use crate::error::MirrorError;

/// Reads a manifest file: one remote path per line, blank lines ignored.
pub fn read_manifest(path: &Utf8Path) -> Result<DatasetManifest, MirrorError> {
    let name = path
        .file_name()
        .ok_or_else(|| MirrorError::MalformedManifestName(path.to_string()))?;
    let key = DatasetKey::from_manifest_name(name)?;
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| MirrorError::Filesystem(format!("read manifest {path}: {err}")))?;
    Ok(DatasetManifest {
        key,
        entries: parse_entries(name, &content),
    })
}

pub fn parse_entries(manifest_name: &str, content: &str) -> Vec<RemoteFileRef> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(entry) = RemoteFileRef::new(line) else {
            warn!(manifest = manifest_name, line, "skipping entry without a file name");
            continue;
        };
        if !seen.insert(entry.remote_path().to_string()) {
            warn!(manifest = manifest_name, line, "skipping duplicate entry");
            continue;
        }
        entries.push(entry);
    }
    entries
}

/// Lists manifest files under `root`, sorted by name.
///
/// Only names ending in `_file_index.txt` and starting with `prefix` are kept; `keyword`
/// narrows the selection with a case-insensitive substring match. Name validity is
/// checked later by [`read_manifest`] so one bad name never hides the others.
pub fn discover_manifests(
    root: &Utf8Path,
    prefix: &str,
    keyword: Option<&str>,
) -> Result<Vec<Utf8PathBuf>, MirrorError> {
    let entries = fs::read_dir(root.as_std_path())
        .map_err(|_| MirrorError::StorageRoot(root.as_std_path().to_path_buf()))?;
    let keyword = keyword
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty());

    let mut manifests = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        if !entry.path().is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            warn!(path = %entry.path().display(), "skipping non-utf8 manifest name");
            continue;
        };
        if !name.ends_with(MANIFEST_SUFFIX) || !name.starts_with(prefix) {
            continue;
        }
        if let Some(keyword) = &keyword {
            if !name.to_lowercase().contains(keyword.as_str()) {
                continue;
            }
        }
        manifests.push(root.join(name));
    }
    manifests.sort();
    Ok(manifests)
}
