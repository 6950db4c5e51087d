//! Per-pixel failure records and the engine's `fail_log.txt` line format.

use crate::mask::PixelCoord;
use crate::TileError;
use regex_lite::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

pub const FAIL_LOG_FILE: &str = "fail_log.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardErrorKind {
    Unreadable,
    WrongFormat,
    PartialWrite,
    EngineReported,
}

impl fmt::Display for ShardErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardErrorKind::Unreadable => "unreadable",
            ShardErrorKind::WrongFormat => "wrong-format",
            ShardErrorKind::PartialWrite => "partial-write",
            ShardErrorKind::EngineReported => "engine-reported",
        };
        f.write_str(name)
    }
}

/// Why one pixel could not be taken from a shard. Never fatal for a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardError {
    pub kind: ShardErrorKind,
    pub message: String,
}

impl ShardError {
    pub fn new(kind: ShardErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEntry {
    pub batch: usize,
    pub error: ShardError,
    pub variables: BTreeSet<String>,
}

/// Failed pixels keyed by tile coordinate. The first cause wins; later
/// variables failing for the same pixel are only added to its list.
/// Synthesis failures are per shard key and do not count as failed pixels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureLog {
    entries: BTreeMap<PixelCoord, FailureEntry>,
    synthesis: BTreeMap<String, String>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, pixel: PixelCoord, batch: usize, variable: &str, error: ShardError) {
        let entry = self.entries.entry(pixel).or_insert_with(|| FailureEntry {
            batch,
            error,
            variables: BTreeSet::new(),
        });
        entry.variables.insert(variable.to_string());
    }

    pub fn record_synthesis(&mut self, key: &str, error: &TileError) {
        self.synthesis.entry(key.to_string()).or_insert_with(|| error.to_string());
    }

    pub fn synthesis_failures(&self) -> &BTreeMap<String, String> {
        &self.synthesis
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, pixel: PixelCoord) -> bool {
        self.entries.contains_key(&pixel)
    }

    pub fn get(&self, pixel: PixelCoord) -> Option<&FailureEntry> {
        self.entries.get(&pixel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PixelCoord, &FailureEntry)> {
        self.entries.iter()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (pixel, entry) in &self.entries {
            let message = format!(
                "batch_{} {} [{}]",
                entry.batch,
                entry.error,
                entry.variables.iter().cloned().collect::<Vec<_>>().join(",")
            );
            out.push_str(&format_line(*pixel, &message));
            out.push('\n');
        }
        for (key, message) in &self.synthesis {
            out.push_str(&format!("SYNTHESIS FAILED for {}: {}\n", key, message));
        }
        out
    }
}

pub fn format_line(pixel: PixelCoord, message: &str) -> String {
    format!(
        "EXCEPTION!! At pixel at (row, col): ({}, {}) Exception from netcdf: {}",
        pixel.row, pixel.col, message
    )
}

static ENGINE_LINE: LazyLock<Result<Regex, String>> = LazyLock::new(|| {
    Regex::new(r"At pixel at \(row, col\): \(\s*(\d+)\s*,\s*(\d+)\s*\)\s*(?:Exception from netcdf:)?\s*(.*)$")
        .map_err(|e| e.to_string())
});

fn engine_line() -> Result<&'static Regex, TileError> {
    ENGINE_LINE
        .as_ref()
        .map_err(|e| TileError::Other(format!("fail log pattern: {}", e)))
}

fn parse_line(re: &Regex, line: &str) -> Option<(PixelCoord, String)> {
    let caps = re.captures(line)?;
    let row = caps.get(1)?.as_str().parse().ok()?;
    let col = caps.get(2)?.as_str().parse().ok()?;
    let message = caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some((PixelCoord::new(row, col), message))
}

/// Parses every recognizable line; other lines are ignored.
pub fn parse_fail_log(text: &str) -> Result<BTreeMap<PixelCoord, String>, TileError> {
    let re = engine_line()?;
    let mut out = BTreeMap::new();
    for (pixel, message) in text.lines().filter_map(|line| parse_line(re, line)) {
        out.entry(pixel).or_insert(message);
    }
    Ok(out)
}

/// A missing log means the engine reported nothing.
pub fn read_fail_log(path: &Path) -> Result<BTreeMap<PixelCoord, String>, TileError> {
    match fs::read_to_string(path) {
        Ok(text) => parse_fail_log(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(TileError::Io(e)),
    }
}

pub fn write_fail_log(path: &Path, entries: &BTreeMap<PixelCoord, String>) -> Result<(), TileError> {
    let mut out = String::new();
    for (pixel, message) in entries {
        out.push_str(&format_line(*pixel, message));
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_lines_and_skips_noise() {
        let text = "\
EXCEPTION!! At pixel at (row, col): (3, 7) Exception from netcdf: NetCDF: HDF error
some unrelated output
EXCEPTION!! At pixel at (row, col): (0, 12) Exception from netcdf: NetCDF: Start+count exceeds dimension bound
";
        let parsed = parse_fail_log(text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&PixelCoord::new(3, 7)], "NetCDF: HDF error");
        assert!(parsed.contains_key(&PixelCoord::new(0, 12)));
    }

    #[test]
    fn formatted_lines_parse_back() {
        let line = format_line(PixelCoord::new(5, 9), "NetCDF: Not a valid ID");
        let parsed = parse_fail_log(&line).unwrap();
        assert_eq!(parsed[&PixelCoord::new(5, 9)], "NetCDF: Not a valid ID");
    }

    #[test]
    fn first_report_for_a_pixel_wins() {
        let text = "\
EXCEPTION!! At pixel at (row, col): ( 2 , 4 ) Exception from netcdf: first
EXCEPTION!! At pixel at (row, col): (2, 4) Exception from netcdf: second
EXCEPTION!! At pixel at (row, col): (x, 4) Exception from netcdf: not a pixel
";
        let parsed = parse_fail_log(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[&PixelCoord::new(2, 4)], "first");
    }

    #[test]
    fn failure_log_counts_distinct_pixels() {
        let mut log = FailureLog::new();
        let p = PixelCoord::new(1, 1);
        log.record(p, 2, "GPP", ShardError::new(ShardErrorKind::Unreadable, "bad header"));
        log.record(p, 2, "RH", ShardError::new(ShardErrorKind::PartialWrite, "short"));
        assert_eq!(log.len(), 1);
        let entry = log.get(p).unwrap();
        assert_eq!(entry.error.kind, ShardErrorKind::Unreadable);
        assert_eq!(entry.variables.len(), 2);
    }

    #[test]
    fn synthesis_failures_stay_out_of_the_pixel_count() {
        let mut log = FailureLog::new();
        log.record_synthesis("VEGC_yearly_tr", &TileError::Config("weighted reduction needs PFT weights".to_string()));
        assert!(log.is_empty());
        let text = log.to_text();
        assert!(text.contains("SYNTHESIS FAILED for VEGC_yearly_tr"));
        assert!(parse_fail_log(&text).unwrap().is_empty());
    }
}
