use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

pub const MANIFEST_SUFFIX: &str = "_file_index.txt";

/// Identity of one dataset version, decoded from its manifest file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    family: String,
    sub_version: String,
}

impl DatasetKey {
    pub fn new(family: impl Into<String>, sub_version: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            sub_version: sub_version.into(),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn sub_version(&self) -> &str {
        &self.sub_version
    }

    /// Ledger and manifest files share this name.
    pub fn manifest_file_name(&self) -> String {
        format!("{}_{}{MANIFEST_SUFFIX}", self.family, self.sub_version)
    }

    pub fn from_manifest_name(name: &str) -> Result<Self, MirrorError> {
        let stem = name
            .trim()
            .strip_suffix(MANIFEST_SUFFIX)
            .ok_or_else(|| MirrorError::MalformedManifestName(name.to_string()))?;
        let (family, sub_version) = stem
            .rsplit_once('_')
            .ok_or_else(|| MirrorError::MalformedManifestName(name.to_string()))?;
        if family.is_empty() || sub_version.is_empty() {
            return Err(MirrorError::MalformedManifestName(name.to_string()));
        }
        Ok(Self::new(family, sub_version))
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.sub_version)
    }
}

impl FromStr for DatasetKey {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_manifest_name(value)
    }
}

/// One remote file named by a manifest line. Identity is the remote path itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFileRef {
    remote_path: String,
}

impl RemoteFileRef {
    /// Returns `None` when the location has no final path segment to mirror under.
    pub fn new(remote_path: impl Into<String>) -> Option<Self> {
        let remote_path = remote_path.into();
        let file_name = remote_path.rsplit('/').next().unwrap_or_default();
        if file_name.is_empty() {
            return None;
        }
        Some(Self { remote_path })
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn file_name(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path)
    }
}

impl fmt::Display for RemoteFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetManifest {
    pub key: DatasetKey,
    pub entries: Vec<RemoteFileRef>,
}

impl DatasetManifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Download,
    Audit,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Download => write!(f, "download"),
            SyncMode::Audit => write!(f, "audit"),
        }
    }
}

/// How report lines are bucketed into files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportGrouping {
    /// One report per display family; all sub-versions append into it.
    #[default]
    Family,
    /// One report per dataset version, named `<display>_<subVersion>`.
    Dataset,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_manifest_name() {
        let key = DatasetKey::from_manifest_name("CMS_Run2016H_SingleMuon_NANOAOD_v1_file_index.txt")
            .unwrap();
        assert_eq!(key.family(), "CMS_Run2016H_SingleMuon_NANOAOD");
        assert_eq!(key.sub_version(), "v1");
        assert_eq!(
            key.manifest_file_name(),
            "CMS_Run2016H_SingleMuon_NANOAOD_v1_file_index.txt"
        );
    }

    #[test]
    fn reject_missing_suffix() {
        let err = DatasetKey::from_manifest_name("CMS_Run2016H_v1.txt").unwrap_err();
        assert_matches!(err, MirrorError::MalformedManifestName(_));
    }

    #[test]
    fn reject_missing_underscore() {
        let err = DatasetKey::from_manifest_name("single_file_index.txt").unwrap_err();
        assert_matches!(err, MirrorError::MalformedManifestName(_));
    }

    #[test]
    fn file_name_is_last_segment() {
        let file = RemoteFileRef::new("root://eospublic.cern.ch//eos/opendata/cms/A/B/abc.root")
            .unwrap();
        assert_eq!(file.file_name(), "abc.root");
        assert!(RemoteFileRef::new("root://host//eos/dir/").is_none());
    }
}
