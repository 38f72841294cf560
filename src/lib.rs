//! Mirror open-data dataset manifests onto local storage, keep a per-dataset ledger of
//! size-verified files, and publish availability reports for complete datasets.

pub mod aggregate;
pub mod app;
pub mod config;
pub mod ddf;
pub mod domain;
pub mod error;
pub mod http;
pub mod ledger;
pub mod manifest;
pub mod naming;
pub mod output;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod tui;
pub mod verify;
pub mod xrootd;
