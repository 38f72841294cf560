use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::warn;

use crate::aggregate::{AggregateResult, Aggregator, StatusResult};
use crate::config::ResolvedConfig;
use crate::domain::{ReportGrouping, SyncMode};
use crate::error::MirrorError;
use crate::ledger::Ledger;
use crate::manifest::{discover_manifests, read_manifest};
use crate::remote::{SizeOracle, Transfer};
use crate::scheduler::{DatasetOutcome, OutcomeCounts, ScheduleOptions, Scheduler};
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub keyword: Option<String>,
}

impl Selection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: Some(keyword.into()),
        }
    }

    /// A pass over every manifest, as opposed to a keyword-filtered subset.
    pub fn is_full(&self) -> bool {
        self.keyword
            .as_deref()
            .map(|value| value.trim().is_empty())
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub manifest_prefix: String,
    pub oracle_concurrency: usize,
    pub grouping: ReportGrouping,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            manifest_prefix: crate::config::DEFAULT_MANIFEST_PREFIX.to_string(),
            oracle_concurrency: crate::config::DEFAULT_ORACLE_CONCURRENCY,
            grouping: ReportGrouping::Family,
        }
    }
}

impl From<&ResolvedConfig> for EngineSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            manifest_prefix: config.manifest_prefix.clone(),
            oracle_concurrency: config.oracle_concurrency,
            grouping: config.grouping,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFailure {
    pub manifest: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub mode: SyncMode,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: String,
    pub datasets: Vec<DatasetOutcome>,
    pub failures: Vec<ManifestFailure>,
    pub totals: OutcomeCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullSyncResult {
    pub download: SyncResult,
    pub audit: SyncResult,
    pub report: AggregateResult,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Download,
    Audit,
    Report,
    Sync,
    Status,
    Ddf,
}

impl fmt::Display for ProgressSinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProgressSinkKind::Download => "download",
            ProgressSinkKind::Audit => "audit",
            ProgressSinkKind::Report => "report",
            ProgressSinkKind::Sync => "sync",
            ProgressSinkKind::Status => "status",
            ProgressSinkKind::Ddf => "ddf",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn phase(phase: &str, text: impl AsRef<str>) -> Self {
        Self {
            message: format!("phase={phase}; {}", text.as_ref()),
            elapsed: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Drives whole passes over the selected manifests.
///
/// A failure inside one manifest is recorded in the result and the pass continues with
/// the next one. Only an unreachable storage root aborts a pass.
#[derive(Clone)]
pub struct App<T: Transfer, O: SizeOracle> {
    store: Store,
    ledger: Ledger,
    transfer: T,
    oracle: O,
    settings: EngineSettings,
}

impl<T: Transfer, O: SizeOracle> App<T, O> {
    pub fn new(store: Store, transfer: T, oracle: O, settings: EngineSettings) -> Self {
        let ledger = Ledger::new(store.clone());
        Self {
            store,
            ledger,
            transfer,
            oracle,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn download(
        &self,
        selection: &Selection,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncResult, MirrorError> {
        self.run_mode(SyncMode::Download, selection, options, sink)
    }

    pub fn audit(
        &self,
        selection: &Selection,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncResult, MirrorError> {
        self.run_mode(SyncMode::Audit, selection, options, sink)
    }

    pub fn report(
        &self,
        selection: &Selection,
        grouping: Option<ReportGrouping>,
        sink: &dyn ProgressSink,
    ) -> Result<AggregateResult, MirrorError> {
        self.store.ensure_manifests_root()?;
        let manifests = self.select(selection)?;
        let aggregator = Aggregator::new(
            &self.store,
            &self.ledger,
            grouping.unwrap_or(self.settings.grouping),
        );
        aggregator.run(&manifests, selection.is_full(), sink)
    }

    /// Download, then audit, then report over the same selection.
    pub fn sync(
        &self,
        selection: &Selection,
        options: RunOptions,
        grouping: Option<ReportGrouping>,
        sink: &dyn ProgressSink,
    ) -> Result<FullSyncResult, MirrorError> {
        let download = self.download(selection, options, sink)?;
        let audit = self.audit(selection, options, sink)?;
        let report = if options.dry_run {
            AggregateResult::skipped()
        } else {
            self.report(selection, grouping, sink)?
        };
        Ok(FullSyncResult {
            download,
            audit,
            report,
        })
    }

    pub fn status(
        &self,
        selection: &Selection,
        sink: &dyn ProgressSink,
    ) -> Result<StatusResult, MirrorError> {
        self.store.ensure_manifests_root()?;
        let manifests = self.select(selection)?;
        let aggregator = Aggregator::new(&self.store, &self.ledger, self.settings.grouping);
        Ok(aggregator.status(&manifests, sink))
    }

    fn select(&self, selection: &Selection) -> Result<Vec<Utf8PathBuf>, MirrorError> {
        discover_manifests(
            &self.store.roots().manifests,
            &self.settings.manifest_prefix,
            selection.keyword.as_deref(),
        )
    }

    fn run_mode(
        &self,
        mode: SyncMode,
        selection: &Selection,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncResult, MirrorError> {
        let started_at = iso_timestamp();
        self.store.ensure_manifests_root()?;
        if !options.dry_run {
            self.store.ensure_ledger_root()?;
            if mode == SyncMode::Download {
                self.store.ensure_mirror_root()?;
            }
        }

        sink.event(ProgressEvent::phase("Resolve", "scanning manifests"));
        let manifests = self.select(selection)?;
        let scheduler = Scheduler::new(
            &self.store,
            &self.ledger,
            &self.transfer,
            &self.oracle,
            ScheduleOptions {
                dry_run: options.dry_run,
                oracle_concurrency: self.settings.oracle_concurrency,
            },
        );

        let mut datasets = Vec::new();
        let mut failures = Vec::new();
        let mut totals = OutcomeCounts::default();
        for path in manifests {
            let name = path.file_name().unwrap_or(path.as_str()).to_string();
            let outcome = read_manifest(&path)
                .and_then(|manifest| scheduler.run(mode, &manifest, sink));
            match outcome {
                Ok(outcome) => {
                    totals.merge(&outcome.counts);
                    datasets.push(outcome);
                }
                Err(err) => {
                    warn!(manifest = %name, error = %err, "manifest skipped");
                    sink.event(ProgressEvent::message(format!("manifest.failed {name}")));
                    failures.push(ManifestFailure {
                        manifest: name,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(SyncResult {
            mode,
            dry_run: options.dry_run,
            started_at,
            finished_at: iso_timestamp(),
            datasets,
            failures,
            totals,
        })
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_selection_is_partial() {
        assert!(Selection::all().is_full());
        assert!(Selection::keyword("  ").is_full());
        assert!(!Selection::keyword("SingleMuon").is_full());
    }

    #[test]
    fn phase_events_follow_convention() {
        let event = ProgressEvent::phase("Verify", "querying remote sizes");
        assert_eq!(event.message, "phase=Verify; querying remote sizes");
    }
}
