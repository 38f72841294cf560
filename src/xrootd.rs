use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, info};

use crate::error::MirrorError;
use crate::remote::{SizeOracle, Transfer};

/// XRootD access through the `xrdfs` and `xrdcp` command-line tools.
#[derive(Debug, Clone)]
pub struct XrootdClient {
    xrdfs: Option<PathBuf>,
    xrdcp: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum XrootdToolStatus {
    Ready,
    Missing { message: String },
}

impl XrootdClient {
    pub fn new() -> Self {
        Self {
            xrdfs: find_in_path("xrdfs"),
            xrdcp: find_in_path("xrdcp"),
        }
    }

    pub fn with_tools(xrdfs: Option<PathBuf>, xrdcp: Option<PathBuf>) -> Self {
        Self {
            xrdfs: xrdfs.or_else(|| find_in_path("xrdfs")),
            xrdcp: xrdcp.or_else(|| find_in_path("xrdcp")),
        }
    }

    pub fn tool_status(&self) -> XrootdToolStatus {
        match (&self.xrdfs, &self.xrdcp) {
            (Some(_), Some(_)) => XrootdToolStatus::Ready,
            (None, _) => XrootdToolStatus::Missing {
                message: "missing xrdfs (XRootD client)".to_string(),
            },
            (_, None) => XrootdToolStatus::Missing {
                message: "missing xrdcp (XRootD client)".to_string(),
            },
        }
    }
}

impl Default for XrootdClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SizeOracle for XrootdClient {
    fn remote_size(&self, remote_path: &str) -> Result<u64, MirrorError> {
        let xrdfs = self
            .xrdfs
            .as_ref()
            .ok_or_else(|| MirrorError::MissingTool("xrdfs".to_string()))?;
        let (server, path) = split_xrootd_url(remote_path)
            .ok_or_else(|| MirrorError::UnsupportedRemote(remote_path.to_string()))?;

        debug!(remote_path, "xrdfs stat");
        let output = Command::new(xrdfs)
            .args([server.as_str(), "stat", path.as_str()])
            .output()
            .map_err(|err| MirrorError::RemoteUnreachable {
                path: remote_path.to_string(),
                message: err.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{} {}", stderr.trim(), stdout.trim());
            return Err(classify_stat_failure(remote_path, message.trim()));
        }
        parse_stat_size(&stdout)
            .ok_or_else(|| MirrorError::RemoteSizeUnparseable(remote_path.to_string()))
    }
}

impl Transfer for XrootdClient {
    fn transfer(&self, remote_path: &str, destination: &Path) -> Result<(), MirrorError> {
        let xrdcp = self
            .xrdcp
            .as_ref()
            .ok_or_else(|| MirrorError::MissingTool("xrdcp".to_string()))?;

        info!(remote_path, destination = %destination.display(), "starting download");
        let mut child = Command::new(xrdcp)
            .arg(remote_path)
            .arg(destination)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| MirrorError::TransferFailed {
                path: remote_path.to_string(),
                message: err.to_string(),
            })?;

        let stderr_drain = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buffer);
                buffer
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(remote_path, "xrdcp: {line}");
                }
            }
        }

        let status = child.wait().map_err(|err| MirrorError::TransferFailed {
            path: remote_path.to_string(),
            message: err.to_string(),
        })?;
        let stderr = stderr_drain
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        let stderr = stderr.trim().to_string();
        let message = if stderr.is_empty() {
            format!("xrdcp exited with {status}")
        } else {
            stderr
        };
        Err(MirrorError::TransferFailed {
            path: remote_path.to_string(),
            message,
        })
    }
}

/// Splits `root://host[:port]//abs/path` into (`root://host[:port]`, `/abs/path`).
pub fn split_xrootd_url(remote_path: &str) -> Option<(String, String)> {
    let (scheme, rest) = remote_path.split_once("://")?;
    let (host, path) = rest.split_once('/')?;
    if host.is_empty() || path.is_empty() {
        return None;
    }
    Some((format!("{scheme}://{host}"), path.to_string()))
}

/// Extracts the byte count from `xrdfs stat` output (`Size:   123456`).
pub fn parse_stat_size(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("Size:")?;
        rest.split_whitespace().next()?.parse::<u64>().ok()
    })
}

fn classify_stat_failure(remote_path: &str, message: &str) -> MirrorError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("[3011]") || lower.contains("no such file") || lower.contains("not found") {
        MirrorError::RemoteNotFound(remote_path.to_string())
    } else {
        MirrorError::RemoteUnreachable {
            path: remote_path.to_string(),
            message: message.to_string(),
        }
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn split_eos_url() {
        let (server, path) =
            split_xrootd_url("root://eospublic.cern.ch//eos/opendata/cms/a.root").unwrap();
        assert_eq!(server, "root://eospublic.cern.ch");
        assert_eq!(path, "/eos/opendata/cms/a.root");
        assert!(split_xrootd_url("eospublic.cern.ch/eos").is_none());
    }

    #[test]
    fn parse_size_from_stat() {
        let stat = "Path:   /eos/opendata/cms/a.root\nId:     0\nSize:   2147483648\nMTime:  2021-01-01 00:00:00\nFlags:  16 (IsReadable)\n";
        assert_eq!(parse_stat_size(stat), Some(2_147_483_648));
        assert_eq!(parse_stat_size("Path: /x\nFlags: 0\n"), None);
        assert_eq!(parse_stat_size("Size: unknown\n"), None);
    }

    #[test]
    fn classify_not_found() {
        let err = classify_stat_failure(
            "root://h//a.root",
            "[ERROR] Server responded with an error: [3011] No such file or directory",
        );
        assert_matches!(err, MirrorError::RemoteNotFound(_));

        let err = classify_stat_failure("root://h//a.root", "[FATAL] Connection refused");
        assert_matches!(err, MirrorError::RemoteUnreachable { .. });
    }

    #[test]
    fn missing_tool_is_reported() {
        let client = XrootdClient {
            xrdfs: None,
            xrdcp: None,
        };
        assert_matches!(
            client.remote_size("root://h//a.root"),
            Err(MirrorError::MissingTool(_))
        );
        assert_matches!(client.tool_status(), XrootdToolStatus::Missing { .. });
    }
}
