use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ManifestFailure, ProgressEvent, ProgressSink};
use crate::domain::{DatasetManifest, ReportGrouping};
use crate::error::MirrorError;
use crate::ledger::Ledger;
use crate::manifest::read_manifest;
use crate::naming::report_stem;
use crate::store::{Store, bytes_to_mb};

/// Result of the completeness gate for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatasetAggregate {
    Complete {
        dataset: String,
        report: String,
        lines: usize,
    },
    Discrepancy {
        dataset: String,
        manifest_entries: usize,
        ledger_entries: usize,
        notice: String,
    },
    /// The manifest lists no files; no report is written.
    Empty {
        dataset: String,
    },
    Failed {
        manifest: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateResult {
    /// Whether the report root was emptied before this pass.
    pub cleared: bool,
    pub skipped: bool,
    pub datasets: Vec<DatasetAggregate>,
    pub reports: Vec<String>,
}

impl AggregateResult {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStatus {
    pub dataset: String,
    pub manifest: String,
    pub manifest_entries: usize,
    pub ledger_entries: usize,
    pub local_present: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusResult {
    pub datasets: Vec<DatasetStatus>,
    pub failures: Vec<ManifestFailure>,
}

/// `<dataset>: <missing>/<manifest> missing`. Negative when the ledger holds more lines
/// than the manifest.
pub fn discrepancy_notice(dataset: &str, manifest_entries: usize, ledger_entries: usize) -> String {
    let missing = manifest_entries as i64 - ledger_entries as i64;
    format!("{dataset}: {missing}/{manifest_entries} missing")
}

pub struct Aggregator<'a> {
    store: &'a Store,
    ledger: &'a Ledger,
    grouping: ReportGrouping,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a Store, ledger: &'a Ledger, grouping: ReportGrouping) -> Self {
        Self {
            store,
            ledger,
            grouping,
        }
    }

    /// Writes report lines for every dataset whose ledger count equals its manifest count.
    ///
    /// A full pass empties the report root first; a filtered pass appends to what is there.
    pub fn run(
        &self,
        manifests: &[Utf8PathBuf],
        full_pass: bool,
        sink: &dyn ProgressSink,
    ) -> Result<AggregateResult, MirrorError> {
        if full_pass {
            self.store.reset_reports()?;
        } else {
            self.store.ensure_reports_root()?;
        }
        sink.event(ProgressEvent::phase(
            "Report",
            format!("aggregating {} datasets", manifests.len()),
        ));

        let mut result = AggregateResult {
            cleared: full_pass,
            ..AggregateResult::default()
        };
        let mut reports = BTreeSet::new();
        for path in manifests {
            let entry = read_manifest(path)
                .and_then(|manifest| self.aggregate_one(&manifest))
                .unwrap_or_else(|err| {
                    warn!(manifest = %path, error = %err, "aggregation skipped");
                    DatasetAggregate::Failed {
                        manifest: path.file_name().unwrap_or(path.as_str()).to_string(),
                        reason: err.to_string(),
                    }
                });
            match &entry {
                DatasetAggregate::Complete { report, .. } => {
                    reports.insert(report.clone());
                }
                DatasetAggregate::Discrepancy { notice, .. } => {
                    sink.event(ProgressEvent::message(format!("report.discrepancy {notice}")));
                }
                DatasetAggregate::Empty { .. } | DatasetAggregate::Failed { .. } => {}
            }
            result.datasets.push(entry);
        }
        result.reports = reports.into_iter().collect();

        info!(
            datasets = result.datasets.len(),
            reports = result.reports.len(),
            "aggregation finished"
        );
        Ok(result)
    }

    fn aggregate_one(&self, manifest: &DatasetManifest) -> Result<DatasetAggregate, MirrorError> {
        let key = &manifest.key;
        if manifest.is_empty() {
            info!(dataset = %key, "empty manifest, no report");
            return Ok(DatasetAggregate::Empty {
                dataset: key.to_string(),
            });
        }
        let ledger_entries = self.ledger.verified_set(key)?.len();
        if ledger_entries != manifest.len() {
            let notice = discrepancy_notice(&key.to_string(), manifest.len(), ledger_entries);
            warn!(dataset = %key, "{notice}");
            return Ok(DatasetAggregate::Discrepancy {
                dataset: key.to_string(),
                manifest_entries: manifest.len(),
                ledger_entries,
                notice,
            });
        }

        let stem = report_stem(key, self.grouping)?;
        let mut lines = Vec::with_capacity(manifest.len());
        for file in &manifest.entries {
            let state = self.store.inspect(key, file)?;
            let Some(size_bytes) = state.size_bytes.filter(|_| state.exists) else {
                continue;
            };
            let local = self.store.local_path(key, file);
            let absolute = std::path::absolute(local.as_std_path())
                .map_err(|err| MirrorError::Filesystem(format!("absolute path {local}: {err}")))?;
            lines.push(format!("{},{:.1}MB", absolute.display(), bytes_to_mb(size_bytes)));
        }

        let report = self.store.report_path(&stem);
        Store::append_lines(&report, &lines)?;
        Ok(DatasetAggregate::Complete {
            dataset: key.to_string(),
            report: report.to_string(),
            lines: lines.len(),
        })
    }

    /// Read-only view of the completeness gate and local presence per manifest.
    pub fn status(&self, manifests: &[Utf8PathBuf], sink: &dyn ProgressSink) -> StatusResult {
        sink.event(ProgressEvent::phase(
            "Scan",
            format!("status of {} datasets", manifests.len()),
        ));
        let mut result = StatusResult::default();
        for path in manifests {
            match read_manifest(path).and_then(|manifest| self.status_one(&manifest)) {
                Ok(status) => result.datasets.push(status),
                Err(err) => result.failures.push(ManifestFailure {
                    manifest: path.file_name().unwrap_or(path.as_str()).to_string(),
                    error: err.to_string(),
                }),
            }
        }
        result
    }

    fn status_one(&self, manifest: &DatasetManifest) -> Result<DatasetStatus, MirrorError> {
        let key = &manifest.key;
        let ledger_entries = self.ledger.verified_set(key)?.len();
        let mut local_present = 0;
        for file in &manifest.entries {
            if self.store.inspect(key, file)?.exists {
                local_present += 1;
            }
        }
        Ok(DatasetStatus {
            dataset: key.to_string(),
            manifest: key.manifest_file_name(),
            manifest_entries: manifest.len(),
            ledger_entries,
            local_present,
            complete: !manifest.is_empty() && ledger_entries == manifest.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_carries_delta() {
        assert_eq!(
            discrepancy_notice("CMS_Run2016H_SingleMuon_NANOAOD/v1", 3, 2),
            "CMS_Run2016H_SingleMuon_NANOAOD/v1: 1/3 missing"
        );
        assert_eq!(discrepancy_notice("d/v1", 2, 3), "d/v1: -1/2 missing");
    }
}
