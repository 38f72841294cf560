use std::sync::LazyLock;

use regex::Regex;

use crate::domain::{DatasetKey, ReportGrouping};
use crate::error::MirrorError;

const SIM_MARKER: &str = "CMS_mc";
const SIM_VERSION_TAG: &str = "NanoAODv9_";
const SIM_PROCESSING_TAG: &str = "_NANOAODSIM";

static RUN_PERIOD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Run201\d[A-Za-z]").expect("static regex"));

/// Short display name for a dataset family.
///
/// Collision data (`CMS_Run2016H_SingleMuon_...`) becomes `Data_Run2016H_SingleMuon`;
/// simulation (`CMS_mc_...NanoAODv9_TTbar_NANOAODSIM`) becomes `SIM_TTbar`.
pub fn display_name(family: &str) -> Result<String, MirrorError> {
    if RUN_PERIOD.is_match(family) {
        let parts = family.split('_').collect::<Vec<_>>();
        return match (parts.get(1), parts.get(2)) {
            (Some(period), Some(stream)) if !period.is_empty() && !stream.is_empty() => {
                Ok(format!("Data_{period}_{stream}"))
            }
            _ => Err(MirrorError::UnclassifiedDatasetName(family.to_string())),
        };
    }

    if family.contains(SIM_MARKER) {
        let Some((_, rest)) = family.split_once(SIM_VERSION_TAG) else {
            return Err(MirrorError::UnclassifiedDatasetName(family.to_string()));
        };
        let process = rest.split(SIM_PROCESSING_TAG).next().unwrap_or_default();
        if process.is_empty() {
            return Err(MirrorError::UnclassifiedDatasetName(family.to_string()));
        }
        return Ok(format!("SIM_{process}"));
    }

    Err(MirrorError::UnclassifiedDatasetName(family.to_string()))
}

/// Report file stem for a dataset under the given grouping.
pub fn report_stem(key: &DatasetKey, grouping: ReportGrouping) -> Result<String, MirrorError> {
    let display = display_name(key.family())?;
    Ok(match grouping {
        ReportGrouping::Family => display,
        ReportGrouping::Dataset => format!("{display}_{}", key.sub_version()),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn collision_data_name() {
        assert_eq!(
            display_name("CMS_Run2016H_SingleMuon_NANOAOD_v1").unwrap(),
            "Data_Run2016H_SingleMuon"
        );
    }

    #[test]
    fn simulation_name() {
        assert_eq!(
            display_name("CMS_mc_RunIISummer20UL16NanoAODv9_TTbar_NANOAODSIM").unwrap(),
            "SIM_TTbar"
        );
    }

    #[test]
    fn simulation_without_processing_tag_keeps_remainder() {
        assert_eq!(
            display_name("CMS_mc_RunIISummer20UL16NanoAODv9_WJets").unwrap(),
            "SIM_WJets"
        );
    }

    #[test]
    fn unclassified_names_are_rejected() {
        assert_matches!(
            display_name("CMS_Derived_Something"),
            Err(MirrorError::UnclassifiedDatasetName(_))
        );
        assert_matches!(
            display_name("CMS_mc_NoVersionTag_TTbar"),
            Err(MirrorError::UnclassifiedDatasetName(_))
        );
        assert_matches!(
            display_name("Run2016H"),
            Err(MirrorError::UnclassifiedDatasetName(_))
        );
    }

    #[test]
    fn dataset_grouping_appends_sub_version() {
        let key = DatasetKey::new("CMS_Run2015D_DoubleEG_NANOAOD", "v2");
        assert_eq!(
            report_stem(&key, ReportGrouping::Dataset).unwrap(),
            "Data_Run2015D_DoubleEG_v2"
        );
        assert_eq!(
            report_stem(&key, ReportGrouping::Family).unwrap(),
            "Data_Run2015D_DoubleEG"
        );
    }
}
