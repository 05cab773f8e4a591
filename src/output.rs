use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use tempfile::Builder;

use crate::compact::CompactionReport;
use crate::error::EtlError;
use crate::pipeline::RunSummary;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_compaction(report: &CompactionReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }

    /// Writes a pretty-printed document next to `destination` and renames it
    /// into place.
    pub fn write_document<T: Serialize>(destination: &Path, value: &T) -> Result<(), EtlError> {
        let json =
            serde_json::to_vec_pretty(value).map_err(|err| EtlError::Filesystem(err.to_string()))?;
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|err| EtlError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".era5-etl-doc")
            .tempfile_in(parent)
            .map_err(|err| EtlError::Filesystem(err.to_string()))?;
        temp.write_all(&json)
            .and_then(|_| temp.write_all(b"\n"))
            .map_err(|err| EtlError::Filesystem(err.to_string()))?;
        temp.persist(destination)
            .map_err(|err| EtlError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
