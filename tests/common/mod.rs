#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use opendata_mirror::app::{App, EngineSettings};
use opendata_mirror::config::StorageRoots;
use opendata_mirror::domain::{DatasetKey, RemoteFileRef};
use opendata_mirror::error::MirrorError;
use opendata_mirror::remote::{SizeOracle, Transfer};
use opendata_mirror::store::Store;

pub const MUON_FAMILY: &str = "CMS_Run2016H_SingleMuon_NANOAOD";
pub const TTBAR_FAMILY: &str = "CMS_mc_RunIISummer20UL16NanoAODv9_TTbar_NANOAODSIM";

/// In-memory remote: known sizes, plus paths that fail to transfer or to answer a size query.
#[derive(Default)]
pub struct MockRemote {
    sizes: HashMap<String, u64>,
    broken_transfers: HashSet<String>,
    unreachable: HashSet<String>,
    pub transfers: Mutex<usize>,
    pub size_queries: Mutex<usize>,
}

impl MockRemote {
    pub fn with_size(mut self, remote_path: &str, size: u64) -> Self {
        self.sizes.insert(remote_path.to_string(), size);
        self
    }

    pub fn failing_transfer(mut self, remote_path: &str) -> Self {
        self.broken_transfers.insert(remote_path.to_string());
        self
    }

    pub fn unreachable(mut self, remote_path: &str) -> Self {
        self.unreachable.insert(remote_path.to_string());
        self
    }

    pub fn transfer_count(&self) -> usize {
        *self.transfers.lock().unwrap()
    }

    pub fn size_query_count(&self) -> usize {
        *self.size_queries.lock().unwrap()
    }
}

impl Transfer for MockRemote {
    fn transfer(&self, remote_path: &str, destination: &Path) -> Result<(), MirrorError> {
        *self.transfers.lock().unwrap() += 1;
        if self.broken_transfers.contains(remote_path) {
            std::fs::write(destination, b"partial").unwrap();
            return Err(MirrorError::TransferFailed {
                path: remote_path.to_string(),
                message: "connection reset".to_string(),
            });
        }
        let size = self.sizes.get(remote_path).copied().unwrap_or(4);
        std::fs::write(destination, vec![0u8; size as usize]).unwrap();
        Ok(())
    }
}

impl SizeOracle for MockRemote {
    fn remote_size(&self, remote_path: &str) -> Result<u64, MirrorError> {
        *self.size_queries.lock().unwrap() += 1;
        if self.unreachable.contains(remote_path) {
            return Err(MirrorError::RemoteUnreachable {
                path: remote_path.to_string(),
                message: "timeout".to_string(),
            });
        }
        self.sizes
            .get(remote_path)
            .copied()
            .ok_or_else(|| MirrorError::RemoteNotFound(remote_path.to_string()))
    }
}

pub struct Fixture {
    _temp: TempDir,
    pub base: Utf8PathBuf,
    pub store: Store,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(StorageRoots::under(&base));
        std::fs::create_dir_all(store.roots().manifests.as_std_path()).unwrap();
        Self {
            _temp: temp,
            base,
            store,
        }
    }

    pub fn app<'a>(&self, remote: &'a MockRemote) -> App<&'a MockRemote, &'a MockRemote> {
        App::new(self.store.clone(), remote, remote, EngineSettings::default())
    }

    pub fn write_manifest(&self, key: &DatasetKey, entries: &[&str]) -> Utf8PathBuf {
        let path = self.store.manifest_path(key);
        let mut content = entries.join("\n");
        content.push('\n');
        std::fs::write(path.as_std_path(), content).unwrap();
        path
    }

    /// Places a local copy of `remote_path` with `size` bytes.
    pub fn put_local(&self, key: &DatasetKey, remote_path: &str, size: u64) -> Utf8PathBuf {
        let file = RemoteFileRef::new(remote_path).unwrap();
        self.store.ensure_dataset_dir(key).unwrap();
        let path = self.store.local_path(key, &file);
        std::fs::write(path.as_std_path(), vec![0u8; size as usize]).unwrap();
        path
    }

    pub fn local_path(&self, key: &DatasetKey, remote_path: &str) -> Utf8PathBuf {
        let file = RemoteFileRef::new(remote_path).unwrap();
        self.store.local_path(key, &file)
    }

    pub fn ledger_content(&self, key: &DatasetKey) -> Option<String> {
        std::fs::read_to_string(self.store.ledger_path(key).as_std_path()).ok()
    }
}

pub fn remote(name: &str) -> String {
    format!("root://eospublic.cern.ch//eos/opendata/cms/{name}")
}

pub fn exists(path: &Utf8Path) -> bool {
    path.as_std_path().exists()
}
