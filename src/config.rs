use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::ReportGrouping;
use crate::error::MirrorError;

pub const CONFIG_FILE_NAME: &str = "odm.json";
pub const DEFAULT_MANIFEST_PREFIX: &str = "CMS";
pub const DEFAULT_ORACLE_CONCURRENCY: usize = 4;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub roots: Option<RootsEntry>,
    #[serde(default)]
    pub manifest_prefix: Option<String>,
    #[serde(default)]
    pub audit: Option<AuditEntry>,
    #[serde(default)]
    pub report: Option<ReportEntry>,
    #[serde(default)]
    pub tools: Option<ToolsEntry>,
    #[serde(default)]
    pub http: Option<HttpEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RootsEntry {
    pub manifests: Utf8PathBuf,
    pub mirror: Utf8PathBuf,
    pub ledger: Utf8PathBuf,
    #[serde(default)]
    pub reports: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub oracle_concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ReportEntry {
    #[serde(default)]
    pub grouping: Option<ReportGrouping>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ToolsEntry {
    #[serde(default)]
    pub xrdcp: Option<PathBuf>,
    #[serde(default)]
    pub xrdfs: Option<PathBuf>,
    #[serde(default)]
    pub describe: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpEntry {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// The storage locations the engine works against. Mount selection happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoots {
    pub manifests: Utf8PathBuf,
    pub mirror: Utf8PathBuf,
    pub ledger: Utf8PathBuf,
    pub reports: Utf8PathBuf,
}

impl StorageRoots {
    /// Conventional layout below a single base directory.
    pub fn under(base: &Utf8Path) -> Self {
        Self {
            manifests: base.join("datasets"),
            mirror: base.join("samples"),
            ledger: base.join("processed"),
            reports: base.join("reports"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub roots: StorageRoots,
    pub manifest_prefix: String,
    pub oracle_concurrency: usize,
    pub grouping: ReportGrouping,
    pub tools: ToolsEntry,
    pub http_timeout_secs: u64,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolves configuration from an explicit path, `./odm.json`, or the user config dir.
    /// A `root_override` supplies storage roots and makes the file optional.
    pub fn resolve(
        path: Option<&str>,
        root_override: Option<&Utf8Path>,
    ) -> Result<ResolvedConfig, MirrorError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let config = match config_path {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| MirrorError::ConfigRead(config_path.clone()))?;
                serde_json::from_str::<Config>(&content)
                    .map_err(|err| MirrorError::ConfigParse(err.to_string()))?
            }
            None if root_override.is_some() => Config::default(),
            None => return Err(MirrorError::MissingConfig),
        };

        Self::resolve_config(config, root_override)
    }

    pub fn resolve_config(
        config: Config,
        root_override: Option<&Utf8Path>,
    ) -> Result<ResolvedConfig, MirrorError> {
        let roots = match (root_override, config.roots) {
            (Some(base), _) => StorageRoots::under(base),
            (None, Some(entry)) => {
                let reports = entry
                    .reports
                    .unwrap_or_else(|| Utf8PathBuf::from("path_outputs"));
                StorageRoots {
                    manifests: entry.manifests,
                    mirror: entry.mirror,
                    ledger: entry.ledger,
                    reports,
                }
            }
            (None, None) => {
                return Err(MirrorError::ConfigParse(
                    "config must define roots {manifests, mirror, ledger}".to_string(),
                ));
            }
        };

        let oracle_concurrency = config
            .audit
            .and_then(|audit| audit.oracle_concurrency)
            .unwrap_or(DEFAULT_ORACLE_CONCURRENCY)
            .max(1);

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            roots,
            manifest_prefix: config
                .manifest_prefix
                .unwrap_or_else(|| DEFAULT_MANIFEST_PREFIX.to_string()),
            oracle_concurrency,
            grouping: config
                .report
                .and_then(|report| report.grouping)
                .unwrap_or_default(),
            tools: config.tools.unwrap_or_default(),
            http_timeout_secs: config
                .http
                .and_then(|http| http.timeout_secs)
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        })
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "opendata-mirror")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn root_override_uses_conventional_layout() {
        let base = Utf8PathBuf::from("/data/opendata");
        let resolved = ConfigLoader::resolve_config(Config::default(), Some(&base)).unwrap();
        assert_eq!(resolved.roots.manifests, base.join("datasets"));
        assert_eq!(resolved.roots.mirror, base.join("samples"));
        assert_eq!(resolved.roots.ledger, base.join("processed"));
        assert_eq!(resolved.manifest_prefix, "CMS");
        assert_eq!(resolved.oracle_concurrency, DEFAULT_ORACLE_CONCURRENCY);
        assert_eq!(resolved.grouping, ReportGrouping::Family);
    }

    #[test]
    fn roots_are_required_without_override() {
        let err = ConfigLoader::resolve_config(Config::default(), None).unwrap_err();
        assert_matches!(err, MirrorError::ConfigParse(_));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let config: Config = serde_json::from_str(
            r#"{
                "roots": {"manifests": "/m", "mirror": "/s", "ledger": "/p"},
                "audit": {"oracle_concurrency": 0},
                "report": {"grouping": "dataset"}
            }"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config, None).unwrap();
        assert_eq!(resolved.oracle_concurrency, 1);
        assert_eq!(resolved.grouping, ReportGrouping::Dataset);
        assert_eq!(resolved.roots.reports, Utf8PathBuf::from("path_outputs"));
    }
}
