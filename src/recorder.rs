// src/recorder.rs
//! CSV export of the pipeline tables.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use log::info;
use crate::error::ForceError;
use crate::signal::{SignalPipeline, TableKind, TableWindow};

impl TableKind {
    /// File name suffix of the exported table.
    pub fn file_suffix(self) -> &'static str {
        match self {
            TableKind::Raw => "_RAW",
            TableKind::Calibrated => "_CALIBRATED",
            TableKind::Filtered => "_FILTERED",
        }
    }
}

/// Scientific notation with six decimals and a signed two-digit exponent (`1.250000e+02`).
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

/// Writes a window as CSV: `timestamp` first, then one column per channel.
pub fn write_window(mut out: impl Write, window: &TableWindow) -> Result<(), ForceError> {
    let mut header = String::from("timestamp");
    for column in window.table.columns() {
        header.push(',');
        header.push_str(column);
    }
    writeln!(out, "{header}")?;
    for (row, timestamp) in window.table.data().rows().into_iter().zip(&window.timestamps) {
        write!(out, "{timestamp}")?;
        for value in row {
            write!(out, ",{}", format_value(*value))?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Writes `<test name>_RAW.csv`, `_CALIBRATED.csv` and `_FILTERED.csv` into `dir`.
pub fn export_tables(
    pipeline: &SignalPipeline,
    dir: &Path,
    test_name: &str,
    idx1: usize,
    idx2: usize,
) -> Result<Vec<PathBuf>, ForceError> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(3);
    for kind in [TableKind::Raw, TableKind::Calibrated, TableKind::Filtered] {
        let path = dir.join(format!("{test_name}{}.csv", kind.file_suffix()));
        let window = pipeline.dataframe(kind, idx1, idx2);
        write_window(BufWriter::new(File::create(&path)?), &window)?;
        info!("Saved {} rows to {}", window.rows(), path.display());
        written.push(path);
    }
    Ok(written)
}
