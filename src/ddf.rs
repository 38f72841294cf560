//! Dataset definition files built from aggregation reports.
//!
//! A report lists `absolutePath,sizeMB` lines. The definition keeps the paths and adds
//! event statistics from a [`FileDescriber`]; simulation reports also carry the mean
//! generator weight and which systematic weight arrays the files provide. Definitions
//! are written as YAML.

use std::path::PathBuf;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::MirrorError;
use crate::store::Store;

/// Event statistics for one data file.
///
/// The weight counts are the array lengths of the scale and parton-shower weights in
/// the first event, when the describer reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct FileDescription {
    pub events: u64,
    #[serde(default)]
    pub weight_sum: f64,
    #[serde(default)]
    pub lhe_scale_weights: Option<u64>,
    #[serde(default)]
    pub ps_weights: Option<u64>,
}

/// Which systematic weight arrays are usable across a whole dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeightInfo {
    pub lhe_scale: bool,
    pub ps_scale: bool,
}

/// A weight counts as present only if every file with events carries more than one
/// entry for it. Single entries are placeholders. Datasets without events have none.
pub fn check_weights(descriptions: &[FileDescription]) -> WeightInfo {
    let with_events = descriptions
        .iter()
        .filter(|description| description.events > 0)
        .collect::<Vec<_>>();
    if with_events.is_empty() {
        return WeightInfo {
            lhe_scale: false,
            ps_scale: false,
        };
    }
    let present = |count: Option<u64>| count.is_some_and(|count| count > 1);
    WeightInfo {
        lhe_scale: with_events
            .iter()
            .all(|description| present(description.lhe_scale_weights)),
        ps_scale: with_events
            .iter()
            .all(|description| present(description.ps_weights)),
    }
}

pub trait FileDescriber: Send + Sync {
    fn describe(&self, path: &str) -> Result<FileDescription, MirrorError>;
}

/// Runs an external program with the file path as its only argument and reads
/// `{"events": N, "weight_sum": W, "lhe_scale_weights": L, "ps_weights": P}` from its
/// stdout. Only `events` is required.
#[derive(Debug, Clone)]
pub struct CommandDescriber {
    program: PathBuf,
}

impl CommandDescriber {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl FileDescriber for CommandDescriber {
    fn describe(&self, path: &str) -> Result<FileDescription, MirrorError> {
        debug!(path, program = %self.program.display(), "describing file");
        let output = Command::new(&self.program)
            .arg(path)
            .output()
            .map_err(|err| {
                MirrorError::DescribeFailed(format!("{}: {err}", self.program.display()))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MirrorError::DescribeFailed(format!(
                "{path}: {} ({})",
                output.status,
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|err| MirrorError::DescribeFailed(format!("{path}: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDefinition {
    pub stem: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_events: Option<u64>,
    pub num_selected_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<WeightInfo>,
}

/// File paths from report content: the first comma-separated column of each non-blank line.
pub fn report_files(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split(',').next())
        .map(str::to_string)
        .collect()
}

/// Definition name and whether the report describes simulation.
pub fn definition_stem(report_path: &Utf8Path) -> (String, bool) {
    let name = report_path.file_name().unwrap_or(report_path.as_str());
    let base = name.split('.').next().unwrap_or(name);
    let simulated = base.contains("SIM");
    let stem = base.rsplit("SIM_").next().unwrap_or(base).to_string();
    (stem, simulated)
}

pub fn build_definition(
    report_path: &Utf8Path,
    describer: &dyn FileDescriber,
    sink: &dyn ProgressSink,
) -> Result<DatasetDefinition, MirrorError> {
    let content = std::fs::read_to_string(report_path.as_std_path())
        .map_err(|err| MirrorError::Filesystem(format!("read report {report_path}: {err}")))?;
    let files = report_files(&content);
    let (stem, simulated) = definition_stem(report_path);

    sink.event(ProgressEvent::phase(
        "Scan",
        format!("describing {} files for {stem}", files.len()),
    ));
    let descriptions = files
        .iter()
        .map(|file| describer.describe(file))
        .collect::<Result<Vec<_>, _>>()?;
    let events = descriptions
        .iter()
        .map(|description| description.events)
        .sum::<u64>();
    let weight_sum = descriptions
        .iter()
        .map(|description| description.weight_sum)
        .sum::<f64>();

    let definition = if simulated {
        let mean_weight = if events > 0 {
            weight_sum / events as f64
        } else {
            0.0
        };
        DatasetDefinition {
            stem,
            files,
            num_events: Some(events),
            num_selected_events: events,
            mean_weight: Some(mean_weight),
            weights: Some(check_weights(&descriptions)),
        }
    } else {
        DatasetDefinition {
            stem,
            files,
            num_events: None,
            num_selected_events: events,
            mean_weight: None,
            weights: None,
        }
    };
    Ok(definition)
}

/// Writes `<out_dir>/<stem>.yaml` and returns its path.
pub fn write_definition(
    out_dir: &Utf8Path,
    definition: &DatasetDefinition,
) -> Result<Utf8PathBuf, MirrorError> {
    let path = out_dir.join(format!("{}.yaml", definition.stem));
    let content = serde_yaml::to_string(definition)
        .map_err(|err| MirrorError::Filesystem(format!("encode {path}: {err}")))?;
    Store::write_bytes_atomic(&path, content.as_bytes())?;
    info!(path = %path, files = definition.files.len(), "dataset definition written");
    Ok(path)
}
