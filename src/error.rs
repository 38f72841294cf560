use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MirrorError {
    #[error("malformed manifest name: {0}")]
    #[diagnostic(help("manifest files are named <family>_<subVersion>_file_index.txt"))]
    MalformedManifestName(String),

    #[error("remote unreachable for {path}: {message}")]
    RemoteUnreachable { path: String, message: String },

    #[error("remote file not found: {0}")]
    RemoteNotFound(String),

    #[error("remote status for {0} carries no parseable Size field")]
    RemoteSizeUnparseable(String),

    #[error("transfer of {path} failed: {message}")]
    TransferFailed { path: String, message: String },

    #[error("cannot derive a display name for dataset family: {0}")]
    UnclassifiedDatasetName(String),

    #[error("unsupported remote location: {0}")]
    UnsupportedRemote(String),

    #[error("storage root not accessible: {0}")]
    StorageRoot(PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to lock ledger {path}: {message}")]
    LedgerLock { path: String, message: String },

    #[error("missing config: pass --config, --root, or create odm.json")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("file description failed: {0}")]
    DescribeFailed(String),
}

impl MirrorError {
    /// Failures that may clear up on a later run without anyone touching the manifest.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MirrorError::RemoteUnreachable { .. }
                | MirrorError::TransferFailed { .. }
                | MirrorError::LedgerLock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let unreachable = MirrorError::RemoteUnreachable {
            path: "root://host//a.root".to_string(),
            message: "timeout".to_string(),
        };
        assert!(unreachable.is_transient());
        assert!(!MirrorError::RemoteNotFound("root://host//a.root".to_string()).is_transient());
        assert!(!MirrorError::MalformedManifestName("x.txt".to_string()).is_transient());
    }
}
