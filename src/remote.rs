use std::path::Path;

use crate::error::MirrorError;
use crate::http::HttpRemote;
use crate::xrootd::XrootdClient;

/// Authoritative size of a remote object, without transferring it.
pub trait SizeOracle: Send + Sync {
    fn remote_size(&self, remote_path: &str) -> Result<u64, MirrorError>;
}

/// Copies one remote object to a local path. All-or-nothing from the caller's view:
/// `Ok` means the destination holds the complete object.
pub trait Transfer: Send + Sync {
    fn transfer(&self, remote_path: &str, destination: &Path) -> Result<(), MirrorError>;
}

impl<T: SizeOracle + ?Sized> SizeOracle for &T {
    fn remote_size(&self, remote_path: &str) -> Result<u64, MirrorError> {
        (**self).remote_size(remote_path)
    }
}

impl<T: Transfer + ?Sized> Transfer for &T {
    fn transfer(&self, remote_path: &str, destination: &Path) -> Result<(), MirrorError> {
        (**self).transfer(remote_path, destination)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Xrootd,
    Http,
}

pub fn scheme_of(remote_path: &str) -> Option<Scheme> {
    let lower = remote_path.to_ascii_lowercase();
    if lower.starts_with("root://") || lower.starts_with("xroot://") {
        Some(Scheme::Xrootd)
    } else if lower.starts_with("http://") || lower.starts_with("https://") {
        Some(Scheme::Http)
    } else {
        None
    }
}

/// Dispatches each remote path to the backend for its URL scheme.
#[derive(Clone)]
pub struct RemoteRouter {
    xrootd: XrootdClient,
    http: HttpRemote,
}

impl RemoteRouter {
    pub fn new(xrootd: XrootdClient, http: HttpRemote) -> Self {
        Self { xrootd, http }
    }

    fn route(&self, remote_path: &str) -> Result<Scheme, MirrorError> {
        scheme_of(remote_path).ok_or_else(|| MirrorError::UnsupportedRemote(remote_path.to_string()))
    }
}

impl SizeOracle for RemoteRouter {
    fn remote_size(&self, remote_path: &str) -> Result<u64, MirrorError> {
        match self.route(remote_path)? {
            Scheme::Xrootd => self.xrootd.remote_size(remote_path),
            Scheme::Http => self.http.remote_size(remote_path),
        }
    }
}

impl Transfer for RemoteRouter {
    fn transfer(&self, remote_path: &str, destination: &Path) -> Result<(), MirrorError> {
        match self.route(remote_path)? {
            Scheme::Xrootd => self.xrootd.transfer(remote_path, destination),
            Scheme::Http => self.http.transfer(remote_path, destination),
        }
    }
}
