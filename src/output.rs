//! Persistence of inferred vehicle states as CSV rows.

use anyhow::Result;
use tracing::debug;

use crate::inference::instance::BestEstimate;
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Appends one estimate to a CSV file, creating it with a header row on
/// first write. Headers are suppressed on append so a replay can stream
/// rows into the same file across calls.
pub fn append_record(path: &str, estimate: &BestEstimate) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "appending estimate row");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    writer.serialize(estimate)?;
    writer.flush()?;

    Ok(())
}
