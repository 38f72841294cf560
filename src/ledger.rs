//! Per-dataset record of remote paths confirmed present and size-verified.
//!
//! One plain-text file per dataset, one remote path per line, named after its manifest.
//! A missing file means nothing has been verified yet. Appends hold an exclusive lock on
//! a sidecar lock file; rewrites go through a temporary file and a rename, so readers
//! never observe a truncated ledger.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::domain::DatasetKey;
use crate::error::MirrorError;
use crate::store::{FileLock, Store};

#[derive(Debug, Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn path(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.store.ledger_path(key)
    }

    /// Membership test against the persisted set. Unreadable or absent ledgers answer false.
    pub fn is_verified(&self, key: &DatasetKey, remote_path: &str) -> bool {
        match read_entries(&self.path(key)) {
            Ok(entries) => entries.iter().any(|entry| entry == remote_path),
            Err(err) => {
                debug!(dataset = %key, error = %err, "ledger unreadable, treating as empty");
                false
            }
        }
    }

    /// All verified paths in file order, duplicates collapsed.
    pub fn verified_set(&self, key: &DatasetKey) -> Result<Vec<String>, MirrorError> {
        read_entries(&self.path(key))
    }

    pub fn exists(&self, key: &DatasetKey) -> bool {
        self.path(key).as_std_path().is_file()
    }

    /// Appends `remote_path` unless it is already present.
    pub fn mark_verified(&self, key: &DatasetKey, remote_path: &str) -> Result<(), MirrorError> {
        let path = self.path(key);
        let _guard = self.lock(key)?;

        let content = read_raw(&path)?;
        if parse_entries(&content).iter().any(|entry| entry == remote_path) {
            debug!(dataset = %key, remote_path, "already ledgered");
            return Ok(());
        }

        // An unterminated last line would otherwise swallow the new path.
        let separator = if content.is_empty() || content.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("open ledger {path}: {err}")))?;
        file.write_all(format!("{separator}{remote_path}\n").as_bytes())
            .map_err(|err| MirrorError::Filesystem(format!("append ledger {path}: {err}")))?;
        file.sync_data()
            .map_err(|err| MirrorError::Filesystem(format!("sync ledger {path}: {err}")))?;
        Ok(())
    }

    /// Replaces the ledger with exactly `remote_paths`. An empty set removes the file.
    pub fn rewrite(&self, key: &DatasetKey, remote_paths: &[String]) -> Result<(), MirrorError> {
        let path = self.path(key);
        let _guard = self.lock(key)?;

        let mut seen = HashSet::new();
        let mut content = String::new();
        for remote_path in remote_paths {
            if seen.insert(remote_path.as_str()) {
                content.push_str(remote_path);
                content.push('\n');
            }
        }

        if self.clear_if_empty(key, &seen)? {
            return Ok(());
        }
        Store::write_bytes_atomic(&path, content.as_bytes())
    }

    /// Deletes the ledger when `resulting_set` is empty. Returns whether it was empty.
    pub fn clear_if_empty<T>(
        &self,
        key: &DatasetKey,
        resulting_set: &HashSet<T>,
    ) -> Result<bool, MirrorError> {
        if !resulting_set.is_empty() {
            return Ok(false);
        }
        Store::remove_if_exists(&self.path(key))?;
        debug!(dataset = %key, "ledger cleared");
        Ok(true)
    }

    fn lock(&self, key: &DatasetKey) -> Result<FileLock, MirrorError> {
        let lock_path = self.store.ledger_lock_path(key);
        FileLock::acquire(&lock_path).map_err(|err| MirrorError::LedgerLock {
            path: lock_path.to_string(),
            message: err.to_string(),
        })
    }
}

fn read_raw(path: &Utf8Path) -> Result<String, MirrorError> {
    match fs::read_to_string(path.as_std_path()) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(MirrorError::Filesystem(format!("read ledger {path}: {err}"))),
    }
}

fn read_entries(path: &Utf8Path) -> Result<Vec<String>, MirrorError> {
    Ok(parse_entries(&read_raw(path)?))
}

fn parse_entries(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::StorageRoots;

    fn ledger_in(temp: &tempfile::TempDir) -> Ledger {
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(StorageRoots::under(&base));
        store.ensure_ledger_root().unwrap();
        Ledger::new(store)
    }

    fn key() -> DatasetKey {
        DatasetKey::new("CMS_Run2016H_SingleMuon_NANOAOD", "v1")
    }

    #[test]
    fn absent_ledger_is_not_verified() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&temp);
        assert!(!ledger.is_verified(&key(), "root://h//a.root"));
        assert!(ledger.verified_set(&key()).unwrap().is_empty());
    }

    #[test]
    fn mark_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&temp);
        ledger.mark_verified(&key(), "root://h//a.root").unwrap();
        ledger.mark_verified(&key(), "root://h//a.root").unwrap();
        ledger.mark_verified(&key(), "root://h//b.root").unwrap();

        let content = fs::read_to_string(ledger.path(&key()).as_std_path()).unwrap();
        assert_eq!(content, "root://h//a.root\nroot://h//b.root\n");
        assert!(ledger.is_verified(&key(), "root://h//b.root"));
    }

    #[test]
    fn append_after_unterminated_line_starts_a_new_line() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&temp);
        fs::write(ledger.path(&key()).as_std_path(), "root://h//a.root").unwrap();

        ledger.mark_verified(&key(), "root://h//b.root").unwrap();

        let content = fs::read_to_string(ledger.path(&key()).as_std_path()).unwrap();
        assert_eq!(content, "root://h//a.root\nroot://h//b.root\n");
        assert_eq!(
            ledger.verified_set(&key()).unwrap(),
            vec!["root://h//a.root", "root://h//b.root"]
        );
    }

    #[test]
    fn rewrite_replaces_and_compacts() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&temp);
        ledger.mark_verified(&key(), "root://h//stale.root").unwrap();

        let paths = vec![
            "root://h//a.root".to_string(),
            "root://h//b.root".to_string(),
            "root://h//a.root".to_string(),
        ];
        ledger.rewrite(&key(), &paths).unwrap();

        assert_eq!(
            ledger.verified_set(&key()).unwrap(),
            vec!["root://h//a.root", "root://h//b.root"]
        );
        assert!(!ledger.is_verified(&key(), "root://h//stale.root"));
    }

    #[test]
    fn empty_rewrite_removes_file() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&temp);
        ledger.mark_verified(&key(), "root://h//a.root").unwrap();
        assert!(ledger.exists(&key()));

        ledger.rewrite(&key(), &[]).unwrap();
        assert!(!ledger.exists(&key()));

        ledger.rewrite(&key(), &[]).unwrap();
        assert!(!ledger.exists(&key()));
    }

    #[test]
    fn concurrent_marks_keep_every_entry_once() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ledger_in(&temp));

        let handles = (0..8)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for index in 0..10 {
                        let path = format!("root://h//{}.root", (worker + index) % 12);
                        ledger.mark_verified(&key(), &path).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = fs::read_to_string(ledger.path(&key()).as_std_path()).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        let unique = lines.iter().collect::<HashSet<_>>();
        assert_eq!(lines.len(), unique.len());
        assert_eq!(lines.len(), 12);
    }
}
