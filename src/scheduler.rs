use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{DatasetKey, DatasetManifest, RemoteFileRef, SyncMode};
use crate::error::MirrorError;
use crate::ledger::Ledger;
use crate::remote::{SizeOracle, Transfer};
use crate::store::{FileLock, LocalState, Store};
use crate::verify::{self, Verdict};

/// What happened to one manifest entry during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    /// Already ledgered; nothing else was looked at.
    LedgerHit,
    /// On disk but not ledgered; left for the audit pass.
    LocalPresent { size_bytes: u64 },
    Fetched,
    WouldFetch,
    FetchFailed { reason: String, transient: bool },
    /// Transferred, but the ledger append failed.
    LedgerFailed { reason: String },
    LocalAbsent,
    SizeMatch { size_bytes: u64 },
    SizeMismatch { local_bytes: u64, remote_bytes: u64 },
    /// The remote (or the local probe) could not answer; never counted as verified.
    Unverifiable { reason: String, not_found: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub remote_path: String,
    pub local_path: String,
    #[serde(flatten)]
    pub action: FileAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub ledger_hits: usize,
    pub local_present: usize,
    pub fetched: usize,
    pub would_fetch: usize,
    pub fetch_failed: usize,
    pub ledger_failed: usize,
    pub local_absent: usize,
    pub size_match: usize,
    pub size_mismatch: usize,
    pub unverifiable: usize,
}

impl OutcomeCounts {
    fn record(&mut self, action: &FileAction) {
        match action {
            FileAction::LedgerHit => self.ledger_hits += 1,
            FileAction::LocalPresent { .. } => self.local_present += 1,
            FileAction::Fetched => self.fetched += 1,
            FileAction::WouldFetch => self.would_fetch += 1,
            FileAction::FetchFailed { .. } => self.fetch_failed += 1,
            FileAction::LedgerFailed { .. } => self.ledger_failed += 1,
            FileAction::LocalAbsent => self.local_absent += 1,
            FileAction::SizeMatch { .. } => self.size_match += 1,
            FileAction::SizeMismatch { .. } => self.size_mismatch += 1,
            FileAction::Unverifiable { .. } => self.unverifiable += 1,
        }
    }

    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.ledger_hits += other.ledger_hits;
        self.local_present += other.local_present;
        self.fetched += other.fetched;
        self.would_fetch += other.would_fetch;
        self.fetch_failed += other.fetch_failed;
        self.ledger_failed += other.ledger_failed;
        self.local_absent += other.local_absent;
        self.size_match += other.size_match;
        self.size_mismatch += other.size_mismatch;
        self.unverifiable += other.unverifiable;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetOutcome {
    pub dataset: String,
    pub manifest: String,
    pub mode: SyncMode,
    pub files: Vec<FileOutcome>,
    pub counts: OutcomeCounts,
    /// Ledger size after an audit rewrite; `None` for download passes and dry runs.
    pub ledger_entries: Option<usize>,
}

impl DatasetOutcome {
    fn new(manifest: &DatasetManifest, mode: SyncMode) -> Self {
        Self {
            dataset: manifest.key.to_string(),
            manifest: manifest.key.manifest_file_name(),
            mode,
            files: Vec::with_capacity(manifest.len()),
            counts: OutcomeCounts::default(),
            ledger_entries: None,
        }
    }

    fn push(&mut self, outcome: FileOutcome) {
        self.counts.record(&outcome.action);
        self.files.push(outcome);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    pub dry_run: bool,
    pub oracle_concurrency: usize,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            oracle_concurrency: 1,
        }
    }
}

/// Per-file decisions for one manifest in either operating mode.
pub struct Scheduler<'a, T: Transfer, O: SizeOracle> {
    store: &'a Store,
    ledger: &'a Ledger,
    transfer: &'a T,
    oracle: &'a O,
    options: ScheduleOptions,
}

impl<'a, T: Transfer, O: SizeOracle> Scheduler<'a, T, O> {
    pub fn new(
        store: &'a Store,
        ledger: &'a Ledger,
        transfer: &'a T,
        oracle: &'a O,
        options: ScheduleOptions,
    ) -> Self {
        Self {
            store,
            ledger,
            transfer,
            oracle,
            options,
        }
    }

    pub fn run(
        &self,
        mode: SyncMode,
        manifest: &DatasetManifest,
        sink: &dyn ProgressSink,
    ) -> Result<DatasetOutcome, MirrorError> {
        match mode {
            SyncMode::Download => Ok(self.download(manifest, sink)),
            SyncMode::Audit => self.audit(manifest, sink),
        }
    }

    /// Fetches entries that are neither ledgered nor on disk.
    ///
    /// Each entry is isolated: a failed transfer is recorded and the loop moves on. A
    /// per-file lock is held from the transfer through the ledger append, so concurrent
    /// invocations never write the same staging file. The ledger lock is only taken for
    /// the append itself.
    pub fn download(&self, manifest: &DatasetManifest, sink: &dyn ProgressSink) -> DatasetOutcome {
        let key = &manifest.key;
        let mut outcome = DatasetOutcome::new(manifest, SyncMode::Download);
        sink.event(ProgressEvent::phase(
            "Resolve",
            format!("download {key} ({} entries)", manifest.len()),
        ));

        for file in &manifest.entries {
            let action = self.download_entry(key, file, sink);
            outcome.push(FileOutcome {
                remote_path: file.remote_path().to_string(),
                local_path: self.store.local_path(key, file).to_string(),
                action,
            });
        }

        info!(
            dataset = %key,
            fetched = outcome.counts.fetched,
            skipped = outcome.counts.ledger_hits + outcome.counts.local_present,
            failed = outcome.counts.fetch_failed,
            "download pass finished"
        );
        outcome
    }

    /// Outcome that rules out a transfer for this entry, if any.
    fn settled(&self, key: &DatasetKey, file: &RemoteFileRef) -> Option<FileAction> {
        if self.ledger.is_verified(key, file.remote_path()) {
            debug!(remote_path = file.remote_path(), "ledger hit, skipping");
            return Some(FileAction::LedgerHit);
        }

        match self.store.inspect(key, file) {
            Ok(LocalState {
                exists: true,
                size_bytes,
            }) => {
                debug!(remote_path = file.remote_path(), "already on disk, not ledgered");
                Some(FileAction::LocalPresent {
                    size_bytes: size_bytes.unwrap_or_default(),
                })
            }
            Ok(_) => None,
            Err(err) => {
                warn!(remote_path = file.remote_path(), error = %err, "local probe failed");
                Some(FileAction::FetchFailed {
                    reason: err.to_string(),
                    transient: false,
                })
            }
        }
    }

    fn download_entry(
        &self,
        key: &DatasetKey,
        file: &RemoteFileRef,
        sink: &dyn ProgressSink,
    ) -> FileAction {
        if let Some(action) = self.settled(key, file) {
            return action;
        }

        if self.options.dry_run {
            return FileAction::WouldFetch;
        }

        let lock_path = self.store.transfer_lock_path(key, file);
        let _transfer_lock = match FileLock::acquire(&lock_path) {
            Ok(lock) => lock,
            Err(err) => {
                warn!(remote_path = file.remote_path(), error = %err, "transfer lock failed");
                return FileAction::FetchFailed {
                    reason: format!("lock {lock_path}: {err}"),
                    transient: true,
                };
            }
        };
        // Another invocation may have finished this file while we waited for the lock.
        if let Some(action) = self.settled(key, file) {
            return action;
        }

        sink.event(ProgressEvent::phase(
            "Fetch",
            format!("fetching {}", file.file_name()),
        ));
        let start = std::time::Instant::now();
        if let Err(err) = self.fetch(key, file) {
            warn!(remote_path = file.remote_path(), error = %err, "transfer failed");
            sink.event(ProgressEvent::message(format!(
                "transfer.failed {}",
                file.file_name()
            )));
            return FileAction::FetchFailed {
                transient: err.is_transient(),
                reason: err.to_string(),
            };
        }
        sink.event(ProgressEvent {
            message: format!(
                "transfer.done {} latency_ms={}",
                file.file_name(),
                start.elapsed().as_millis()
            ),
            elapsed: Some(start.elapsed()),
        });

        match self.ledger.mark_verified(key, file.remote_path()) {
            Ok(()) => FileAction::Fetched,
            Err(err) => {
                warn!(remote_path = file.remote_path(), error = %err, "ledger append failed");
                FileAction::LedgerFailed {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Transfers into the staging path, then renames over the final location.
    fn fetch(&self, key: &DatasetKey, file: &RemoteFileRef) -> Result<(), MirrorError> {
        self.store.ensure_dataset_dir(key)?;
        let staging = self.store.staging_path(key, file);
        let local = self.store.local_path(key, file);
        // Leftover of an interrupted run; live writers are excluded by the transfer lock.
        Store::remove_if_exists(&staging)?;

        if let Err(err) = self
            .transfer
            .transfer(file.remote_path(), staging.as_std_path())
        {
            let _ = Store::remove_if_exists(&staging);
            return Err(err);
        }

        fs::rename(staging.as_std_path(), local.as_std_path()).map_err(|err| {
            let _ = Store::remove_if_exists(&staging);
            MirrorError::TransferFailed {
                path: file.remote_path().to_string(),
                message: format!("could not move staged file into {local}: {err}"),
            }
        })
    }

    /// Recomputes the verified set from local and remote sizes and rewrites the ledger.
    ///
    /// The remote is only asked about files that exist locally. Entries whose size
    /// cannot be confirmed stay out of the ledger.
    pub fn audit(
        &self,
        manifest: &DatasetManifest,
        sink: &dyn ProgressSink,
    ) -> Result<DatasetOutcome, MirrorError> {
        let key = &manifest.key;
        let mut outcome = DatasetOutcome::new(manifest, SyncMode::Audit);
        sink.event(ProgressEvent::phase(
            "Scan",
            format!("audit {key} ({} entries)", manifest.len()),
        ));

        let local_states = manifest
            .entries
            .iter()
            .map(|file| self.store.inspect(key, file))
            .collect::<Vec<_>>();

        let present = local_states
            .iter()
            .enumerate()
            .filter_map(|(index, state)| match state {
                Ok(LocalState {
                    exists: true,
                    size_bytes: Some(size),
                }) => Some((index, *size)),
                _ => None,
            })
            .collect::<Vec<_>>();

        sink.event(ProgressEvent::phase(
            "Verify",
            format!("querying remote sizes for {} files", present.len()),
        ));
        let query_paths = present
            .iter()
            .map(|(index, _)| manifest.entries[*index].remote_path())
            .collect::<Vec<_>>();
        let mut remote_sizes = self.query_sizes(&query_paths).into_iter();

        let mut verified = Vec::new();
        let mut present_iter = present.iter().peekable();
        for (index, (file, state)) in manifest.entries.iter().zip(local_states).enumerate() {
            let action = match state {
                Err(err) => FileAction::Unverifiable {
                    reason: err.to_string(),
                    not_found: false,
                },
                Ok(_) if present_iter.peek().map(|(i, _)| *i) != Some(index) => {
                    FileAction::LocalAbsent
                }
                Ok(_) => {
                    let (_, local_bytes) = present_iter.next().copied().unwrap_or_default();
                    let remote = remote_sizes.next().unwrap_or_else(|| {
                        Err(MirrorError::RemoteUnreachable {
                            path: file.remote_path().to_string(),
                            message: "size query missing".to_string(),
                        })
                    });
                    self.classify(file, local_bytes, remote)
                }
            };

            if let FileAction::SizeMatch { .. } = action {
                verified.push(file.remote_path().to_string());
            }
            if let FileAction::SizeMismatch {
                local_bytes,
                remote_bytes,
            } = &action
            {
                sink.event(ProgressEvent::message(format!(
                    "verify.mismatch {} local={local_bytes} remote={remote_bytes}",
                    file.file_name()
                )));
            }
            outcome.push(FileOutcome {
                remote_path: file.remote_path().to_string(),
                local_path: self.store.local_path(key, file).to_string(),
                action,
            });
        }

        if !self.options.dry_run {
            sink.event(ProgressEvent::phase(
                "Ledger",
                format!("rewriting ledger for {key} ({} verified)", verified.len()),
            ));
            self.ledger.rewrite(key, &verified)?;
            outcome.ledger_entries = Some(verified.len());
        }

        info!(
            dataset = %key,
            verified = outcome.counts.size_match,
            mismatched = outcome.counts.size_mismatch,
            unverifiable = outcome.counts.unverifiable,
            absent = outcome.counts.local_absent,
            "audit pass finished"
        );
        Ok(outcome)
    }

    fn classify(
        &self,
        file: &RemoteFileRef,
        local_bytes: u64,
        remote: Result<u64, MirrorError>,
    ) -> FileAction {
        match remote {
            Ok(remote_bytes) => match verify::compare(local_bytes, remote_bytes) {
                Verdict::Match => FileAction::SizeMatch {
                    size_bytes: local_bytes,
                },
                Verdict::Mismatch => {
                    warn!(
                        remote_path = file.remote_path(),
                        local_bytes, remote_bytes, "size mismatch"
                    );
                    FileAction::SizeMismatch {
                        local_bytes,
                        remote_bytes,
                    }
                }
            },
            Err(err) => {
                warn!(remote_path = file.remote_path(), error = %err, "remote size unavailable");
                FileAction::Unverifiable {
                    not_found: matches!(err, MirrorError::RemoteNotFound(_)),
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Size queries fan out over a bounded set of scoped workers; results keep input order.
    fn query_sizes(&self, remote_paths: &[&str]) -> Vec<Result<u64, MirrorError>> {
        let workers = self
            .options
            .oracle_concurrency
            .clamp(1, remote_paths.len().max(1));
        if workers == 1 {
            return remote_paths
                .iter()
                .map(|path| self.oracle.remote_size(path))
                .collect();
        }

        let next = AtomicUsize::new(0);
        let slots = Mutex::new(
            (0..remote_paths.len())
                .map(|_| None)
                .collect::<Vec<Option<Result<u64, MirrorError>>>>(),
        );
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(path) = remote_paths.get(index) else {
                            break;
                        };
                        let result = self.oracle.remote_size(path);
                        if let Ok(mut guard) = slots.lock() {
                            guard[index] = Some(result);
                        }
                    }
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .zip(remote_paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| {
                    Err(MirrorError::RemoteUnreachable {
                        path: path.to_string(),
                        message: "size query did not complete".to_string(),
                    })
                })
            })
            .collect()
    }
}
