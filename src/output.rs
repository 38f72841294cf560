use std::io::{self, Write};

use serde::Serialize;

use crate::aggregate::{AggregateResult, StatusResult};
use crate::app::{FullSyncResult, SyncResult};
use crate::ddf::DatasetDefinition;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

#[derive(Serialize)]
struct DdfOutput<'a> {
    path: &'a str,
    definition: &'a DatasetDefinition,
}

impl JsonOutput {
    pub fn print_sync(result: &SyncResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_full_sync(result: &FullSyncResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(result: &AggregateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_ddf(path: &str, definition: &DatasetDefinition) -> io::Result<()> {
        Self::print_json(&DdfOutput { path, definition })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}
