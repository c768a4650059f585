//! Testing utilities for silo jobs.
//!
//! Helpers for writing tests against the harness and the two engines:
//!
//! - **Scratch bases**: disposable base directories for provisioning
//! - **Fixtures**: census rows and word-count lines shaped like real input
//! - **Output readers**: parse batch part files and rolling stream parts
//! - **Assertions**: compare aggregated counts with expected results
//!
//! # Quick Start
//!
//! ```no_run
//! use ironsilo::config::ClusterConfig;
//! use ironsilo::harness::Silo;
//! use ironsilo::testing::*;
//!
//! # fn demo() -> anyhow::Result<()> {
//! let base = scratch_base()?;
//! let silo = Silo::provision(ClusterConfig::new(base.path()))?;
//! // ... stage, run, assert ...
//! silo.release()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::batch::{YEAR_FIRST, YEAR_LAST};

/// A disposable base directory for one provisioned silo.
///
/// The directory is deleted when the returned guard drops, so a test that
/// provisions against it must release (or drop) its silo first.
pub fn scratch_base() -> io::Result<TempDir> {
    tempfile::Builder::new().prefix("silo-test").tempdir()
}

/// The census header row (`JMÉNO,` followed by every year column).
#[must_use]
pub fn census_header() -> String {
    let mut header = String::from("JMÉNO");
    for year in YEAR_FIRST..=YEAR_LAST {
        let _ = write!(header, ",{year}");
    }
    header
}

/// One census data row: zero in every year column except the given
/// `(year, count)` overrides.
///
/// # Example
///
/// ```
/// use ironsilo::testing::census_row;
///
/// let row = census_row("ANNA", &[(1950, 1)]);
/// assert_eq!(row.split(',').count(), 118);
/// assert!(row.starts_with("ANNA,"));
/// ```
#[must_use]
pub fn census_row(name: &str, counts: &[(u16, i64)]) -> String {
    let mut row = String::from(name);
    for year in YEAR_FIRST..=YEAR_LAST {
        let count = counts
            .iter()
            .find(|(y, _)| *y == year)
            .map(|(_, c)| *c)
            .unwrap_or(0);
        let _ = write!(row, ",{count}");
    }
    row
}

/// A small census file: header plus three people spread over three years.
#[must_use]
pub fn sample_census_lines() -> Vec<String> {
    vec![
        census_header(),
        census_row("ANNA", &[(1950, 1)]),
        census_row("PETR", &[(1950, 1), (1951, 1)]),
        census_row("JANA", &[(2000, 1)]),
    ]
}

/// Lines for word counting, with repeated words across sentences.
#[must_use]
pub fn word_count_lines() -> Vec<String> {
    vec![
        "silo stores grain".to_string(),
        "grain goes in".to_string(),
        "grain comes out".to_string(),
        "store and pour".to_string(),
    ]
}

/// Write lines to a file, newline-terminated.
pub fn write_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(path, body)
}

/// Read a batch part file into `(key, value)` pairs, in file order.
pub fn read_part(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for line in fs::read_to_string(path)?.lines() {
        let (key, value) = line
            .split_once('\t')
            .ok_or_else(|| anyhow::anyhow!("part line without a tab: {line:?}"))?;
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Fold stream part files into final per-key totals.
///
/// Parts are read in the given order and each `(key,total)` record
/// overwrites the key's previous value, so for a continuous run the result
/// is the last update per key, and for a bounded run it is the single
/// final per key.
pub fn stream_totals(parts: &[PathBuf]) -> anyhow::Result<HashMap<String, u64>> {
    let mut totals = HashMap::new();
    for part in parts {
        for line in fs::read_to_string(part)?.lines() {
            let inner = line
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .and_then(|l| l.rsplit_once(','))
                .ok_or_else(|| anyhow::anyhow!("bad stream record {line:?} in {}", part.display()))?;
            totals.insert(inner.0.to_string(), inner.1.parse()?);
        }
    }
    Ok(totals)
}

/// Assert that aggregated totals match the expected `(key, total)` set
/// exactly, with a readable diff on mismatch.
pub fn assert_totals_equal(actual: &HashMap<String, u64>, expected: &[(&str, u64)]) {
    let mut actual_sorted: Vec<(&str, u64)> =
        actual.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    actual_sorted.sort();
    let mut expected_sorted = expected.to_vec();
    expected_sorted.sort();
    assert_eq!(
        actual_sorted, expected_sorted,
        "Totals mismatch:\n  Expected: {expected_sorted:?}\n  Actual: {actual_sorted:?}"
    );
}
