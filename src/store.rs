use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::Serialize;

use crate::config::StorageRoots;
use crate::domain::{DatasetKey, RemoteFileRef};
use crate::error::MirrorError;

/// Local state of one mirrored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalState {
    pub exists: bool,
    pub size_bytes: Option<u64>,
}

impl LocalState {
    pub fn absent() -> Self {
        Self {
            exists: false,
            size_bytes: None,
        }
    }

    pub fn present(size_bytes: u64) -> Self {
        Self {
            exists: true,
            size_bytes: Some(size_bytes),
        }
    }
}

/// Path layout over the storage roots: the mirror tree, ledger files and reports.
#[derive(Debug, Clone)]
pub struct Store {
    roots: StorageRoots,
}

impl Store {
    pub fn new(roots: StorageRoots) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    pub fn manifest_path(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.roots.manifests.join(key.manifest_file_name())
    }

    pub fn dataset_dir(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.roots
            .mirror
            .join(key.family())
            .join(key.sub_version())
    }

    pub fn local_path(&self, key: &DatasetKey, file: &RemoteFileRef) -> Utf8PathBuf {
        self.dataset_dir(key).join(file.file_name())
    }

    /// Hidden sibling a transfer writes into before it is renamed over `local_path`.
    pub fn staging_path(&self, key: &DatasetKey, file: &RemoteFileRef) -> Utf8PathBuf {
        self.dataset_dir(key)
            .join(format!(".{}.part", file.file_name()))
    }

    pub fn ledger_path(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.roots.ledger.join(key.manifest_file_name())
    }

    pub fn ledger_lock_path(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.roots
            .ledger
            .join(".locks")
            .join(format!("{}.lock", key.manifest_file_name()))
    }

    /// Sidecar lock serialising transfers of one local file across processes.
    pub fn transfer_lock_path(&self, key: &DatasetKey, file: &RemoteFileRef) -> Utf8PathBuf {
        self.roots
            .mirror
            .join(".locks")
            .join(key.family())
            .join(key.sub_version())
            .join(format!("{}.lock", file.file_name()))
    }

    pub fn report_path(&self, stem: &str) -> Utf8PathBuf {
        self.roots.reports.join(format!("{stem}.txt"))
    }

    /// Probes the expected local copy. Missing parents count as absent.
    pub fn inspect(
        &self,
        key: &DatasetKey,
        file: &RemoteFileRef,
    ) -> Result<LocalState, MirrorError> {
        inspect_path(&self.local_path(key, file))
    }

    pub fn ensure_manifests_root(&self) -> Result<(), MirrorError> {
        if self.roots.manifests.as_std_path().is_dir() {
            Ok(())
        } else {
            Err(MirrorError::StorageRoot(
                self.roots.manifests.as_std_path().to_path_buf(),
            ))
        }
    }

    pub fn ensure_ledger_root(&self) -> Result<(), MirrorError> {
        fs::create_dir_all(self.roots.ledger.as_std_path())
            .map_err(|_| MirrorError::StorageRoot(self.roots.ledger.as_std_path().to_path_buf()))
    }

    pub fn ensure_mirror_root(&self) -> Result<(), MirrorError> {
        fs::create_dir_all(self.roots.mirror.as_std_path())
            .map_err(|_| MirrorError::StorageRoot(self.roots.mirror.as_std_path().to_path_buf()))
    }

    pub fn ensure_dataset_dir(&self, key: &DatasetKey) -> Result<Utf8PathBuf, MirrorError> {
        let dir = self.dataset_dir(key);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    /// Empties the report root, creating it if needed.
    pub fn reset_reports(&self) -> Result<(), MirrorError> {
        let root = self.roots.reports.as_std_path();
        if root.exists() {
            fs::remove_dir_all(root).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        fs::create_dir_all(root)
            .map_err(|_| MirrorError::StorageRoot(root.to_path_buf()))
    }

    pub fn ensure_reports_root(&self) -> Result<(), MirrorError> {
        let root = self.roots.reports.as_std_path();
        fs::create_dir_all(root).map_err(|_| MirrorError::StorageRoot(root.to_path_buf()))
    }

    pub fn append_lines(path: &Utf8Path, lines: &[String]) -> Result<(), MirrorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("open {path}: {err}")))?;
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(line);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())
            .map_err(|err| MirrorError::Filesystem(format!("append {path}: {err}")))
    }

    /// Replaces `path` through a temporary sibling. The replacement keeps the permissions
    /// of the file it replaces; new files get the usual 0644.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), MirrorError> {
        let parent = path
            .parent()
            .ok_or_else(|| MirrorError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let permissions = match fs::metadata(path.as_std_path()) {
            Ok(meta) => Some(meta.permissions()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => new_file_permissions(),
            Err(err) => return Err(MirrorError::Filesystem(format!("stat {path}: {err}"))),
        };
        let mut temp = tempfile::Builder::new()
            .prefix(".odm-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        if let Some(permissions) = permissions {
            temp.as_file()
                .set_permissions(permissions)
                .map_err(|err| MirrorError::Filesystem(format!("chmod {path}: {err}")))?;
        }
        temp.write_all(content)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn remove_if_exists(path: &Utf8Path) -> Result<(), MirrorError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MirrorError::Filesystem(format!("remove {path}: {err}"))),
        }
    }
}

#[cfg(unix)]
fn new_file_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<fs::Permissions> {
    None
}

/// Exclusive advisory lock on a sidecar file; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Blocks until the lock at `path` is held, creating the file and its parents.
    pub fn acquire(path: &Utf8Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path.as_std_path())?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn inspect_path(path: &Utf8Path) -> Result<LocalState, MirrorError> {
    match fs::metadata(path.as_std_path()) {
        Ok(meta) if meta.is_file() => Ok(LocalState::present(meta.len())),
        Ok(_) => Ok(LocalState::absent()),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            Ok(LocalState::absent())
        }
        Err(err) => Err(MirrorError::Filesystem(format!("stat {path}: {err}"))),
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 10.0).round() / 10.0
}
