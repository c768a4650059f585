//! Batch aggregation engine.
//!
//! A [`BatchJob`] runs map, combine, and reduce over a fixed set of input
//! files and writes one sorted `part-r-NNNNN` file per reduce partition,
//! plus a `_SUCCESS` marker. Each input file is mapped and locally combined
//! on its own worker; the local accumulators are then routed by key to the
//! reduce partitions and merged there. Ordering across partitions is not
//! defined; within a part file keys are sorted.
//!
//! Mappers are fallible. Any malformed row fails the whole run, so a
//! `_SUCCESS`-marked output directory never mixes results from good and bad
//! input.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::fs::{self, File};
use std::hash::Hash;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::combine::{CombineFn, key_partition};
use crate::error::EngineError;

/// Marker file written after all part files are complete.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// One input line, as handed to a mapper.
#[derive(Debug, Clone)]
pub struct RawRow {
    /// Path of the originating file, as handed to the engine.
    pub file: Arc<str>,
    /// 0-based line index within that file.
    pub index: u64,
    /// Line content without the trailing newline.
    pub line: String,
}

impl RawRow {
    /// A [`EngineError::MalformedRecord`] pointing at this row.
    pub fn malformed(&self, reason: impl Into<String>) -> EngineError {
        EngineError::MalformedRecord {
            file: self.file.to_string(),
            line: self.index + 1,
            reason: reason.into(),
        }
    }
}

/// Counters from a finished batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Input rows read across all files.
    pub rows: u64,
    /// Key-value pairs the mapper emitted.
    pub pairs: u64,
    /// Distinct keys written across all part files.
    pub keys: u64,
    /// Part files written (one per reduce partition, empty ones included).
    pub parts: usize,
}

/// A map-combine-reduce job over line-oriented files.
pub struct BatchJob<M, C> {
    mapper: M,
    combiner: C,
    workers: Option<usize>,
    reduce_partitions: usize,
}

impl<M, C> BatchJob<M, C> {
    /// Job with default parallelism (rayon's pool) and a single reduce
    /// partition.
    pub fn new(mapper: M, combiner: C) -> Self {
        Self { mapper, combiner, workers: None, reduce_partitions: 1 }
    }

    /// Size the worker pool explicitly instead of using rayon's default.
    pub fn workers(mut self, threads: usize) -> Self {
        self.workers = Some(threads);
        self
    }

    /// Number of reduce partitions, and therefore of part files.
    pub fn reduce_partitions(mut self, partitions: usize) -> Self {
        self.reduce_partitions = partitions.max(1);
        self
    }

    /// Run the job and write part files plus `_SUCCESS` into `output_dir`.
    pub fn run<K, V, A, O>(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
    ) -> Result<BatchSummary, EngineError>
    where
        M: Fn(&RawRow) -> Result<Vec<(K, V)>, EngineError> + Send + Sync,
        C: CombineFn<V, A, O>,
        K: Eq + Hash + Ord + fmt::Display + Send,
        A: Send,
        O: fmt::Display,
    {
        if let Some(threads) = self.workers {
            // ok() to ignore "already built" on repeated calls in tests
            rayon::ThreadPoolBuilder::new().num_threads(threads).build_global().ok();
        }
        fs::create_dir_all(output_dir)?;

        // Map + local combine, one worker per input file.
        let locals: Vec<FileLocal<K, A>> = inputs
            .par_iter()
            .map(|path| map_file(path, &self.mapper, &self.combiner))
            .collect::<Result<_, EngineError>>()?;

        // Route local accumulators to their reduce partition and merge.
        let parts = self.reduce_partitions;
        let mut buckets: Vec<HashMap<K, A>> = (0..parts).map(|_| HashMap::new()).collect();
        let mut rows = 0u64;
        let mut pairs = 0u64;
        for local in locals {
            rows += local.rows;
            pairs += local.pairs;
            for (key, acc) in local.acc {
                let bucket = &mut buckets[key_partition(&key.to_string(), parts)];
                match bucket.entry(key) {
                    Entry::Occupied(mut slot) => self.combiner.merge(slot.get_mut(), acc),
                    Entry::Vacant(slot) => {
                        slot.insert(acc);
                    }
                }
            }
        }

        // Reduce partitions finish and write independently.
        let keys: u64 = buckets
            .into_par_iter()
            .enumerate()
            .map(|(index, bucket)| write_part(output_dir, index, bucket, &self.combiner))
            .collect::<Result<Vec<u64>, EngineError>>()?
            .into_iter()
            .sum();

        File::create(output_dir.join(SUCCESS_MARKER))?;
        info!(rows, pairs, keys, parts, "batch job complete");
        Ok(BatchSummary { rows, pairs, keys, parts })
    }
}

struct FileLocal<K, A> {
    acc: HashMap<K, A>,
    rows: u64,
    pairs: u64,
}

fn map_file<K, V, A, O, M, C>(
    path: &Path,
    mapper: &M,
    combiner: &C,
) -> Result<FileLocal<K, A>, EngineError>
where
    M: Fn(&RawRow) -> Result<Vec<(K, V)>, EngineError>,
    C: CombineFn<V, A, O>,
    K: Eq + Hash,
{
    let file: Arc<str> = path.display().to_string().into();
    let reader = BufReader::new(File::open(path)?);
    let mut local = FileLocal { acc: HashMap::new(), rows: 0, pairs: 0 };
    for (index, line) in reader.lines().enumerate() {
        let row = RawRow { file: Arc::clone(&file), index: index as u64, line: line? };
        local.rows += 1;
        for (key, value) in mapper(&row)? {
            local.pairs += 1;
            let slot = local.acc.entry(key).or_insert_with(|| combiner.create());
            combiner.add_input(slot, value);
        }
    }
    Ok(local)
}

fn write_part<K, V, A, O, C>(
    output_dir: &Path,
    index: usize,
    bucket: HashMap<K, A>,
    combiner: &C,
) -> Result<u64, EngineError>
where
    C: CombineFn<V, A, O>,
    K: Ord + fmt::Display,
    O: fmt::Display,
{
    let mut entries: Vec<(K, A)> = bucket.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let path = output_dir.join(format!("part-r-{index:05}"));
    let mut writer = BufWriter::new(File::create(path)?);
    let keys = entries.len() as u64;
    for (key, acc) in entries {
        writeln!(writer, "{}\t{}", key, combiner.finish(acc))?;
    }
    writer.flush()?;
    Ok(keys)
}

/// Year-column mapper for census-style rows.
///
/// Rows are `name,<count per year 1900..=2016>`: one name field plus 117
/// yearly counts, comma-separated with no quoting. Emits `(year, count)`
/// for every year column, zeros included, so every year reaches the reducer
/// even when nobody was counted. The first line of a file is skipped when
/// it carries the `JMÉNO,` header.
pub fn year_counts(row: &RawRow) -> Result<Vec<(u16, i64)>, EngineError> {
    const HEADER_PREFIX: &str = "JMÉNO,";
    if row.index == 0 && row.line.starts_with(HEADER_PREFIX) {
        return Ok(Vec::new());
    }
    let fields: Vec<&str> = row.line.split(',').collect();
    if fields.len() != YEAR_FIELDS {
        return Err(row.malformed(format!(
            "expected {YEAR_FIELDS} fields, found {}",
            fields.len()
        )));
    }
    let mut pairs = Vec::with_capacity(YEAR_FIELDS - 1);
    for (offset, raw) in fields[1..].iter().enumerate() {
        let year = YEAR_FIRST + offset as u16;
        let count: i64 = raw
            .parse()
            .map_err(|_| row.malformed(format!("invalid count {raw:?} for year {year}")))?;
        pairs.push((year, count));
    }
    Ok(pairs)
}

/// First year column in census rows.
pub const YEAR_FIRST: u16 = 1900;
/// Last year column in census rows.
pub const YEAR_LAST: u16 = 2016;
/// Name field plus one count field per year.
pub const YEAR_FIELDS: usize = (YEAR_LAST - YEAR_FIRST + 1) as usize + 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combine::Sum;

    fn row(index: u64, line: &str) -> RawRow {
        RawRow { file: "input/t.csv".into(), index, line: line.into() }
    }

    fn census_line(name: &str, fill: i64) -> String {
        let mut fields = vec![name.to_string()];
        fields.extend((YEAR_FIRST..=YEAR_LAST).map(|_| fill.to_string()));
        fields.join(",")
    }

    fn header_line() -> String {
        let mut fields = vec!["JMÉNO".to_string()];
        fields.extend((YEAR_FIRST..=YEAR_LAST).map(|y| y.to_string()));
        fields.join(",")
    }

    #[test]
    fn year_counts_skips_the_header_row_only_at_the_top() -> anyhow::Result<()> {
        assert!(year_counts(&row(0, &header_line()))?.is_empty());
        // The same text further down is data. Year-number columns parse as
        // plain integers, so it is consumed, not rejected.
        let pairs = year_counts(&row(5, &header_line()))?;
        assert_eq!(pairs.first(), Some(&(1900, 1900)));
        Ok(())
    }

    #[test]
    fn year_counts_emits_every_year_column() -> anyhow::Result<()> {
        let pairs = year_counts(&row(1, &census_line("ANNA", 2)))?;
        assert_eq!(pairs.len(), 117);
        assert_eq!(pairs.first(), Some(&(1900, 2)));
        assert_eq!(pairs.last(), Some(&(2016, 2)));
        Ok(())
    }

    #[test]
    fn year_counts_rejects_short_rows() {
        let err = year_counts(&row(3, "ANNA,1,2")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed record at input/t.csv:4: expected 118 fields, found 3"
        );
    }

    #[test]
    fn year_counts_rejects_unparseable_counts_without_trimming() {
        // A space is not part of an integer; parsing must not trim it away.
        let padded = census_line("ANNA", 1).replace("ANNA,1", "ANNA, 1");
        assert!(year_counts(&row(2, &padded)).is_err());
    }

    #[test]
    fn run_writes_sorted_parts_and_the_marker() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("words.txt");
        fs::write(&input, "b\na\nb\n")?;
        let job = BatchJob::new(
            |row: &RawRow| Ok(vec![(row.line.clone(), 1u64)]),
            Sum::<u64>::new(),
        );
        let out = tmp.path().join("out");
        let summary = job.run(&[input], &out)?;
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.keys, 2);
        assert_eq!(fs::read_to_string(out.join("part-r-00000"))?, "a\t1\nb\t2\n");
        assert!(out.join(SUCCESS_MARKER).is_file());
        Ok(())
    }

    #[test]
    fn empty_input_still_produces_parts_and_marker() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("empty.csv");
        fs::write(&input, "")?;
        let out = tmp.path().join("out");
        let summary = BatchJob::new(year_counts, Sum::<i64>::new())
            .reduce_partitions(2)
            .run(&[input], &out)?;
        assert_eq!(summary.rows, 0);
        assert_eq!(summary.parts, 2);
        assert_eq!(fs::read_to_string(out.join("part-r-00001"))?, "");
        assert!(out.join(SUCCESS_MARKER).is_file());
        Ok(())
    }

    #[test]
    fn malformed_rows_fail_the_run_and_leave_no_marker() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("bad.csv");
        fs::write(&input, format!("{}\nnot,a,census,row\n", census_line("ANNA", 1)))?;
        let out = tmp.path().join("out");
        let err = BatchJob::new(year_counts, Sum::<i64>::new())
            .run(&[input], &out)
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedRecord { line: 2, .. }));
        assert!(!out.join(SUCCESS_MARKER).exists());
        Ok(())
    }
}
